//! Shared configuration
//!
//! Durations are written as humantime strings ("5s", "250ms") in config
//! files; [`duration_str`] is the serde adapter for them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default heartbeat interval
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Heartbeat settings. Each peer times out on its own clock, so the two
/// sides of a connection may use different values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// How often a live peer sends a heartbeat
    #[serde(with = "duration_str")]
    pub interval: Duration,
    /// Intervals a peer may stay silent before it is declared dead
    pub missed_heartbeats_allowed: u32,
}

impl HeartbeatConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_missed_heartbeats_allowed(mut self, missed: u32) -> Self {
        self.missed_heartbeats_allowed = missed;
        self
    }

    /// Silence after which a peer is considered dead
    pub fn timeout(&self) -> Duration {
        self.interval * self.missed_heartbeats_allowed.max(1)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            missed_heartbeats_allowed: 4,
        }
    }
}

/// Serde adapter for humantime durations
pub mod duration_str {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(D::Error::custom)
    }
}

/// Serde adapter for optional humantime durations
pub mod opt_duration_str {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        raw.map(|r| humantime::parse_duration(&r).map_err(D::Error::custom))
            .transpose()
    }
}
