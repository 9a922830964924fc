//! On-disk representation of the keepalive config.
//!
//! Every section and field is optional; missing values fall back to the
//! defaults of the validated types in the crate root.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, de};

/// top-level config type
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub coordinator: Coordinator,
    #[serde(default)]
    pub lease: Lease,
    #[serde(default)]
    pub session: Session,
}

/// which coordinator implementation to talk to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Etcd,
    /// in-process coordinator, renews on its own
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Coordinator {
    #[serde(default)]
    pub backend: Backend,
    pub endpoints: Option<Vec<String>>,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub dial_timeout: Option<Duration>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Lease {
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub ttl: Option<Duration>,
    pub key: Option<String>,
    pub value: Option<String>,
    /// how long to keep the lease alive, `0` runs until interrupted
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub run_for: Option<Duration>,
    #[serde(default)]
    pub revoke_on_exit: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Session {
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub request_timeout: Option<Duration>,
    pub channel_capacity: Option<usize>,
}

/// Parse a duration string with optional time units
/// Accepts: "10", "10s", "500ms", "5m", "1h"
/// If no unit is specified, assumes seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration string");
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u64>().context("invalid number")?;

    let num_seconds = match unit.trim() {
        "ms" => return Ok(Duration::from_millis(num)),
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        other => anyhow::bail!("invalid duration unit: {other} (expected ms, s, m or h)"),
    };

    num.checked_mul(num_seconds)
        .map(Duration::from_secs)
        .context("duration value overflow")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireDuration {
    Seconds(u64),
    String(String),
}

impl WireDuration {
    fn into_duration<E: de::Error>(self) -> Result<Duration, E> {
        match self {
            WireDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            WireDuration::String(s) => parse_duration(&s).map_err(E::custom),
        }
    }
}

fn deserialize_optional_duration<'de, D>(de: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<WireDuration>::deserialize(de)?
        .map(WireDuration::into_duration)
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    pub static EXAMPLE: &str = include_str!("../../../example.yaml");

    // test we can decode the example file
    #[test]
    fn test_example() {
        let cfg: Config = serde_yaml::from_str(EXAMPLE).unwrap();
        assert_eq!(cfg.coordinator.backend, Backend::Etcd);
        assert_eq!(cfg.lease.ttl, Some(Duration::from_secs(10)));
        assert_eq!(cfg.lease.key.as_deref(), Some("foo"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("60d").is_err());
        assert!(parse_duration("60mins").is_err());
    }

    #[test]
    fn test_parse_duration_overflow() {
        let err = parse_duration("999999999999999999h").unwrap_err();
        assert!(format!("{err}").contains("duration value overflow"));
        let err = parse_duration("999999999999999999m").unwrap_err();
        assert!(format!("{err}").contains("duration value overflow"));
        assert_eq!(
            parse_duration("18446744073709551615s").unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn test_durations_numbers_or_strings() {
        let json = r#"{"ttl": 30, "run_for": "2m"}"#;
        let lease: Lease = serde_json::from_str(json).unwrap();
        assert_eq!(lease.ttl, Some(Duration::from_secs(30)));
        assert_eq!(lease.run_for, Some(Duration::from_secs(120)));
        assert!(!lease.revoke_on_exit);
    }

    #[test]
    fn test_empty_sections_default() {
        let cfg: Config = serde_yaml::from_str("coordinator:\n  backend: memory\n").unwrap();
        assert_eq!(cfg.coordinator.backend, Backend::Memory);
        assert_eq!(cfg.lease, Lease::default());
        assert_eq!(cfg.session, Session::default());
    }
}
