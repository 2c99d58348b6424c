//! Shared protocol definitions for the roost daemons.
//!
//! Everything that crosses a process boundary lives here: the unified
//! error code space, the attribute and proxy message taxonomies, the
//! canonical operation identity key, alert configuration records, and
//! the value formats (durations, booleans, scores, versions) that the
//! daemons agree on.

pub mod alert;
pub mod constants;
pub mod error;
pub mod message;
pub mod opkey;
pub mod values;

pub use error::{RoostError, RoostResult};
