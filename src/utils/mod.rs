/// Utility functions and helpers
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Generate a unique ID based on timestamp and random component
pub fn generate_id(prefix: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();

    let random: u32 = rand::random();
    format!("{}-{}-{:x}", prefix, timestamp, random)
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

/// Parse a `name:type=value` query parameter given on the command line
pub fn parse_param(raw: &str) -> Result<crate::core::QueryParam, String> {
    let (head, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name:type=value, got {}", raw))?;
    let (name, kind) = head.split_once(':').unwrap_or((head, "varchar"));
    if name.trim().is_empty() {
        return Err(format!("parameter name missing in {}", raw));
    }
    let kind: crate::core::ParamType = kind.parse().map_err(|e| format!("{}", e))?;

    let value = if value.eq_ignore_ascii_case("null") {
        serde_json::Value::Null
    } else {
        serde_json::Value::String(value.to_string())
    };
    Ok(crate::core::QueryParam::new(name.trim(), kind, value))
}
