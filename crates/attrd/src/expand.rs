//! Expansion of `<prefix>++` and `<prefix>+=N` attribute values into
//! arithmetic on the previous value.

/// Expand an increment expression against the old value.
///
/// Returns `Some(new_value)` when the value used the increment grammar,
/// `None` when it should pass through unchanged. A non-numeric old value
/// counts as zero; arithmetic saturates.
pub fn expand_value(value: &str, old: Option<&str>) -> Option<String> {
    let old_num: i64 = old
        .and_then(|s| s.trim().parse::<i64>().ok())
        .unwrap_or(0);

    if value.ends_with("++") {
        return Some(old_num.saturating_add(1).to_string());
    }
    if let Some(idx) = value.find("+=") {
        let rhs: i64 = value[idx + 2..].trim().parse().ok()?;
        return Some(old_num.saturating_add(rhs).to_string());
    }
    None
}
