use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};

use crate::{DriverResult, Error};

/// Driver configuration.
///
/// Every knob has a default so `DriverConfig::default()` yields a working
/// setup; the timeouts are deliberately configuration rather than constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub connect: ConnectOptions,

    /// How long a request waits for its correlated response before it is
    /// declared lost.
    #[serde(default = "default_request_timeout", with = "duration_ms")]
    pub request_timeout: Duration,

    /// Delay between open-state re-checks while the connection is down.
    #[serde(default = "default_retry_delay", with = "duration_ms")]
    pub retry_delay: Duration,

    /// Total time a request may wait for the connection to come back
    /// before failing.
    #[serde(default = "default_retry_grace", with = "duration_ms")]
    pub retry_grace: Duration,

    /// Bound on the graceful-shutdown drain of outstanding requests.
    #[serde(default = "default_shutdown_timeout", with = "duration_ms")]
    pub shutdown_timeout: Duration,
}

/// Connection establishment options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Handshake deadline.
    #[serde(default = "default_connect_timeout", with = "duration_ms")]
    pub timeout: Duration,

    /// When true, construction resolves only once the session is open.
    /// When false, construction returns immediately and readiness is
    /// observed through `Driver::ready`.
    #[serde(default = "default_blocking")]
    pub blocking: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            connect: ConnectOptions::default(),
            request_timeout: default_request_timeout(),
            retry_delay: default_retry_delay(),
            retry_grace: default_retry_grace(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: default_connect_timeout(),
            blocking: default_blocking(),
        }
    }
}

impl DriverConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> DriverResult<Self> {
        let file = File::open(path)
            .map_err(|e| Error::FailedConnection(format!("failed to open config file: {}", e)))?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn from_str(s: &str) -> DriverResult<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_blocking() -> bool {
    true
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_retry_delay() -> Duration {
    Duration::from_millis(250)
}
fn default_retry_grace() -> Duration {
    Duration::from_secs(30)
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

// Duration (de)serialization helper, milliseconds on the wire.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.connect.timeout, Duration::from_secs(5));
        assert!(config.connect.blocking);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.retry_delay, Duration::from_millis(250));
        assert_eq!(config.retry_grace, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_partial_config_falls_back_to_defaults() {
        let config =
            DriverConfig::from_str(r#"{"connect": {"timeout": 2500, "blocking": false}}"#).unwrap();
        assert_eq!(config.connect.timeout, Duration::from_millis(2500));
        assert!(!config.connect.blocking);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_roundtrip() {
        let config = DriverConfig::default();
        let encoded = serde_json::to_string(&config).unwrap();
        let decoded = DriverConfig::from_str(&encoded).unwrap();
        assert_eq!(decoded.request_timeout, config.request_timeout);
        assert_eq!(decoded.connect.timeout, config.connect.timeout);
    }
}
