//! Misc small helpers shared across modules.

/// Helper used for `#[serde(default = "...")]` boolean fields that default
/// to `true`.
#[must_use]
#[inline]
pub(crate) fn default_true() -> bool {
    true
}

/// Milliseconds since [`std::time::UNIX_EPOCH`], saturating rather than
/// panicking if the clock is somehow before the epoch.
#[must_use]
pub fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
