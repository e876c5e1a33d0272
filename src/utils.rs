use std::path::PathBuf;
use std::time::Duration;

/// Expand a leading `~` to the home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(path.trim_start_matches('~').trim_start_matches('/'));
        }
    }
    PathBuf::from(path)
}

/// Parse an interval such as "30s", "5m", "1h" or a bare number of seconds
pub fn parse_interval(s: &str) -> Option<Duration> {
    let s = s.trim().to_ascii_lowercase();
    if s.is_empty() {
        return None;
    }

    let (number, multiplier) = match s.char_indices().last()? {
        (idx, 's') => (&s[..idx], 1),
        (idx, 'm') => (&s[..idx], 60),
        (idx, 'h') => (&s[..idx], 3600),
        _ => (s.as_str(), 1),
    };

    let value: u64 = number.trim().parse().ok()?;
    if value == 0 {
        return None;
    }
    Some(Duration::from_secs(value.checked_mul(multiplier)?))
}
