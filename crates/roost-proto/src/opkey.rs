//! Canonical operation identity.
//!
//! An operation on a resource is identified by the triple
//! `(rsc_id, operation, interval_ms)` with the canonical string form
//! `<rsc_id>_<operation>_<interval_ms>`. The recurring-action table and
//! cancellation both key on this.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one operation on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpKey {
    pub rsc_id: String,
    pub operation: String,
    pub interval_ms: u64,
}

impl OpKey {
    pub fn new(rsc_id: &str, operation: &str, interval_ms: u64) -> Self {
        Self {
            rsc_id: rsc_id.to_string(),
            operation: operation.to_string(),
            interval_ms,
        }
    }

    /// Parse the canonical `<rsc>_<op>_<interval>` form.
    ///
    /// The resource id may itself contain underscores, so the key is
    /// split from the right: the last component is the interval, the one
    /// before it the operation, the rest the resource id.
    pub fn parse(key: &str) -> Option<Self> {
        let mut fields = key.rsplitn(3, '_');
        let interval_ms: u64 = fields.next()?.parse().ok()?;
        let operation = fields.next()?;
        let rsc_id = fields.next()?;
        if rsc_id.is_empty() || operation.is_empty() {
            return None;
        }
        Some(Self::new(rsc_id, operation, interval_ms))
    }
}

impl fmt::Display for OpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.rsc_id, self.operation, self.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format() {
        let key = OpKey::new("db", "monitor", 5000);
        assert_eq!(key.to_string(), "db_monitor_5000");
    }

    #[test]
    fn test_round_trip() {
        for key in [
            OpKey::new("db", "start", 0),
            OpKey::new("my_db_clone", "monitor", 10_000),
            OpKey::new("r", "stop", 0),
        ] {
            assert_eq!(OpKey::parse(&key.to_string()), Some(key.clone()));
        }
    }

    #[test]
    fn test_parse_underscored_resource() {
        let key = OpKey::parse("vip_addr_2_monitor_30000").unwrap();
        assert_eq!(key.rsc_id, "vip_addr_2");
        assert_eq!(key.operation, "monitor");
        assert_eq!(key.interval_ms, 30_000);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(OpKey::parse("no-separators"), None);
        assert_eq!(OpKey::parse("rsc_monitor_notanumber"), None);
        assert_eq!(OpKey::parse("_monitor_0"), None);
    }
}
