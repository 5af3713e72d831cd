use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// Raw YAML form shared by the duration deserializers: either a bare
/// integer or a humantime string such as `"100ms"` or `"20s"`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Number(u64),
    Text(String),
}

/// Deserializes a `Duration` from an integer number of seconds or a
/// humantime string.
pub fn deserialize_duration<'de, D>(
    deserializer: D
) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Number(secs) => Ok(Duration::from_secs(secs)),
        RawDuration::Text(value) => parse_text(&value).map_err(D::Error::custom),
    }
}

/// Deserializes a `Duration` where a bare integer means milliseconds.
///
/// Used for sub-second knobs (admission timeout) so `100` and `"100ms"`
/// read the same.
pub fn deserialize_duration_millis<'de, D>(
    deserializer: D
) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Number(millis) => Ok(Duration::from_millis(millis)),
        RawDuration::Text(value) => parse_text(&value).map_err(D::Error::custom),
    }
}

fn parse_text(value: &str) -> Result<Duration, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("empty duration".to_string());
    }
    humantime::parse_duration(trimmed).map_err(|err| err.to_string())
}
