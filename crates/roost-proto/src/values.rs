//! Value formats shared across the daemons: human-readable durations,
//! booleans, bounded scores with infinity sentinels, and dotted-decimal
//! version comparison.

use std::cmp::Ordering;

/// Magnitude that the INFINITY sentinels map to.
pub const INFINITY_MAGNITUDE: i64 = 1_000_000;

/// Parse a human-readable duration into milliseconds.
///
/// A bare integer is taken as milliseconds. A trailing unit of `ms`, `s`,
/// `m`, or `h` scales accordingly. `0` means "no dampening". Returns None
/// for anything unparsable.
pub fn parse_duration_ms(input: &str) -> Option<u64> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, ""),
    };

    let value: u64 = digits.parse().ok()?;
    match unit.trim() {
        "" | "ms" | "msec" => Some(value),
        "s" | "sec" => Some(value * 1_000),
        "m" | "min" => Some(value * 60_000),
        "h" | "hr" => Some(value * 3_600_000),
        _ => None,
    }
}

/// Parse a boolean: `true|yes|on|1` / `false|no|off|0`, case-insensitive.
pub fn parse_boolean(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Parse a score string into a bounded signed integer.
///
/// `INFINITY` and `+INFINITY` map to the positive magnitude, `-INFINITY`
/// to the negative one. Numeric values are clamped to that range.
/// Unparsable input scores zero.
pub fn parse_score(input: &str) -> i64 {
    let s = input.trim();
    match s {
        "INFINITY" | "+INFINITY" => INFINITY_MAGNITUDE,
        "-INFINITY" => -INFINITY_MAGNITUDE,
        _ => s
            .parse::<i64>()
            .unwrap_or(0)
            .clamp(-INFINITY_MAGNITUDE, INFINITY_MAGNITUDE),
    }
}

/// Format a score, emitting the sentinels at the bounds so that
/// `parse_score(format_score(s)) == s` for all in-range scores.
pub fn format_score(score: i64) -> String {
    if score >= INFINITY_MAGNITUDE {
        "INFINITY".to_string()
    } else if score <= -INFINITY_MAGNITUDE {
        "-INFINITY".to_string()
    } else {
        score.to_string()
    }
}

/// Compare two dotted-decimal version strings component-wise.
///
/// Missing components count as zero, so `1.1 == 1.1.0`. Non-numeric
/// components count as zero as well.
pub fn compare_version(a: &str, b: &str) -> Ordering {
    let mut left = a.trim().split('.');
    let mut right = b.trim().split('.');

    loop {
        let l = left.next();
        let r = right.next();
        if l.is_none() && r.is_none() {
            return Ordering::Equal;
        }
        let ln: u64 = l.and_then(|v| v.parse().ok()).unwrap_or(0);
        let rn: u64 = r.and_then(|v| v.parse().ok()).unwrap_or(0);
        match ln.cmp(&rn) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
}
