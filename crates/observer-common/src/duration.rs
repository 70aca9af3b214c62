use std::time::Duration;

/// Parses an interval given on the command line or in the environment.
///
/// Accepts humantime strings (`10s`, `1m30s`) and bare integers, which are
/// read as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(raw).map_err(|e| format!("invalid duration '{raw}': {e}"))
}
