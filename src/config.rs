//! Engine configuration.
//!
//! All durations serialize as integer milliseconds so the structs can be
//! embedded in a caller's own configuration file.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

/// Well-known multicast group and port for discovery.
pub const MULTICAST_ADDR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1982);

/// Control port used when an advertisement omits one.
pub const DEFAULT_CONTROL_PORT: u16 = 55443;

/// Settings for the discovery service.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub multicast_addr: SocketAddrV4,
    /// Interface used to join the group; unspecified lets the OS choose.
    pub interface: Ipv4Addr,
    pub search_target: String,
    /// Keep listening for unsolicited advertisements after the search replies.
    pub listen_for_advertisements: bool,
    /// Devices silent for longer than this are evicted from the registry.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub silence_window: Duration,
    /// How often the listener wakes up to check whether it should stop.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            multicast_addr: MULTICAST_ADDR,
            interface: Ipv4Addr::UNSPECIFIED,
            search_target: "wifi_bulb".to_string(),
            listen_for_advertisements: true,
            silence_window: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl DiscoveryConfig {
    pub fn with_multicast_addr(mut self, addr: SocketAddrV4) -> Self {
        self.multicast_addr = addr;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_interface(mut self, interface: Ipv4Addr) -> Self {
        self.interface = interface;
        self
    }

    pub fn with_silence_window(mut self, window: Duration) -> Self {
        self.silence_window = window;
        self
    }

    pub fn with_advertisements(mut self, listen: bool) -> Self {
        self.listen_for_advertisements = listen;
        self
    }
}

/// What happens to a command issued while its device is disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflinePolicy {
    /// Hold up to `depth` commands and replay them in order on reconnect.
    Queue { depth: usize },
    /// Fail immediately with `NotConnected`.
    FailFast,
}

impl Default for OfflinePolicy {
    fn default() -> Self {
        OfflinePolicy::Queue { depth: 16 }
    }
}

/// Exponential reconnect backoff with jitter.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial: Duration,
    pub multiplier: f64,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max: Duration,
    /// Fraction of the delay added or removed at random, in `0.0..=1.0`.
    pub jitter: f64,
    /// Consecutive failed attempts before the device is marked offline.
    /// 0 retries forever.
    pub retry_ceiling: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(60),
            jitter: 0.2,
            retry_ceiling: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt number `failures` (1-based), without jitter.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use yeelight_lan_rs::BackoffPolicy;
    ///
    /// let policy = BackoffPolicy::default();
    /// assert_eq!(policy.base_delay(1), Duration::from_secs(1));
    /// assert_eq!(policy.base_delay(3), Duration::from_secs(4));
    /// assert_eq!(policy.base_delay(30), Duration::from_secs(60));
    /// ```
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }

    /// Delay before attempt number `failures`, with jitter applied.
    pub fn delay(&self, failures: u32) -> Duration {
        let base = self.base_delay(failures);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        base.mul_f64(factor)
    }
}

/// Settings for each device connection.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,
    /// Deadline for a single command, counted from its dispatch.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub command_timeout: Duration,
    pub offline_policy: OfflinePolicy,
    pub backoff: BackoffPolicy,
    /// Idle time after which a probe checks the session is alive.
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub keepalive: Option<Duration>,
    /// Messages kept in each connection's diagnostic history.
    pub history_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
            offline_policy: OfflinePolicy::default(),
            backoff: BackoffPolicy::default(),
            keepalive: Some(Duration::from_secs(60)),
            history_size: 100,
        }
    }
}

impl ConnectionConfig {
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_offline_policy(mut self, policy: OfflinePolicy) -> Self {
        self.offline_policy = policy;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }
}

/// Everything the controller needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub discovery: DiscoveryConfig,
    pub connection: ConnectionConfig,
}

impl EngineConfig {
    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = BackoffPolicy::default();
        for failures in 1..10 {
            let base = policy.base_delay(failures).as_secs_f64();
            let delay = policy.delay(failures).as_secs_f64();
            assert!(delay >= base * 0.8 - 1e-9 && delay <= base * 1.2 + 1e-9);
        }
    }

    #[test]
    fn test_no_jitter() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay(2), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"connection": {"command_timeout": 1500, "offline_policy": "fail_fast"}}"#,
        )
        .unwrap();
        assert_eq!(config.connection.command_timeout, Duration::from_millis(1500));
        assert_eq!(config.connection.offline_policy, OfflinePolicy::FailFast);
        assert_eq!(config.connection.backoff, BackoffPolicy::default());
        assert_eq!(config.discovery, DiscoveryConfig::default());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = EngineConfig::default().with_connection(
            ConnectionConfig::default()
                .with_offline_policy(OfflinePolicy::Queue { depth: 4 })
                .with_keepalive(None),
        );
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<EngineConfig>(&json).unwrap(), config);
    }
}
