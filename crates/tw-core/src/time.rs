//! Wall-clock timestamps

use chrono::{SecondsFormat, Utc};

/// Current time as an RFC 3339 UTC string with second precision
///
/// # Examples
/// ```
/// use tw_core::time::now_rfc3339;
///
/// let now = now_rfc3339();
/// assert!(now.ends_with('Z'));
/// ```
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
