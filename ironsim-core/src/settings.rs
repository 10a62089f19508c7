/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! Service endpoint settings.
//!
//! Settings are read-only to the lifecycle core. Each service variant expects
//! one concrete settings type; `init()` downcasts the supplied
//! `Arc<dyn ServiceSettings>` with [`downcast_settings`] and fails fast on a
//! mismatch.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Default bound on teardown waits, in milliseconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Settings shared by every service variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonSettings {
    /// Name of the dictionary the protocol uses, if any.
    pub dictionary: Option<String>,
    /// Heartbeat interval in milliseconds. Zero disables heartbeats.
    pub heartbeat_interval_ms: u64,
    /// Read-idle timeout in milliseconds. Zero disables idle detection.
    pub idle_timeout_ms: u64,
    /// Number of event-loop worker threads.
    pub worker_threads: usize,
    /// Bound on teardown waits in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Timeout applied to each heartbeat send, in milliseconds.
    pub heartbeat_send_timeout_ms: u64,
}

impl Default for CommonSettings {
    fn default() -> Self {
        Self {
            dictionary: None,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            idle_timeout_ms: 0,
            worker_threads: 2,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            heartbeat_send_timeout_ms: 1_000,
        }
    }
}

impl CommonSettings {
    /// Sets the dictionary reference.
    #[must_use]
    pub fn with_dictionary(mut self, dictionary: impl Into<String>) -> Self {
        self.dictionary = Some(dictionary.into());
        self
    }

    /// Sets the heartbeat interval in milliseconds.
    #[must_use]
    pub const fn with_heartbeat_interval_ms(mut self, millis: u64) -> Self {
        self.heartbeat_interval_ms = millis;
        self
    }

    /// Sets the read-idle timeout in milliseconds.
    #[must_use]
    pub const fn with_idle_timeout_ms(mut self, millis: u64) -> Self {
        self.idle_timeout_ms = millis;
        self
    }

    /// Sets the number of event-loop workers.
    #[must_use]
    pub const fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Sets the teardown bound in milliseconds.
    #[must_use]
    pub const fn with_shutdown_timeout_ms(mut self, millis: u64) -> Self {
        self.shutdown_timeout_ms = millis;
        self
    }

    /// Returns the heartbeat interval; zero means disabled.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Returns the idle timeout, if enabled.
    #[must_use]
    pub const fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.idle_timeout_ms))
        }
    }

    /// Returns the teardown bound.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "worker_threads".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.heartbeat_interval_ms > 0 && self.heartbeat_send_timeout_ms == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "heartbeat_send_timeout_ms".to_string(),
                reason: "must be at least 1 when heartbeats are enabled".to_string(),
            });
        }
        Ok(())
    }
}

/// Object-safe view of any settings struct.
pub trait ServiceSettings: Any + Send + Sync + fmt::Debug {
    /// Returns the settings shared by all variants.
    fn common(&self) -> &CommonSettings;

    /// Returns `self` as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Returns the concrete type name, used in mismatch reports.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Checks the settings for unusable values.
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// Downcasts `settings` to the concrete type `T` and validates it.
///
/// # Errors
/// Returns [`ConfigError::SettingsMismatch`] if `settings` is not a `T`, or
/// the validation error of the concrete settings.
pub fn downcast_settings<T>(settings: &dyn ServiceSettings) -> Result<T, ConfigError>
where
    T: ServiceSettings + Clone,
{
    let concrete = settings
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ConfigError::SettingsMismatch {
            expected: std::any::type_name::<T>(),
            actual: settings.type_name(),
        })?;
    concrete.common().validate()?;
    concrete.validate()?;
    Ok(concrete.clone())
}

/// Settings for an outbound unicast client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Shared settings.
    pub common: CommonSettings,
    /// Remote host name or address.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            common: CommonSettings::default(),
            host: "127.0.0.1".to_string(),
            port: 9876,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ClientSettings {
    /// Creates client settings for `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Replaces the shared settings.
    #[must_use]
    pub fn with_common(mut self, common: CommonSettings) -> Self {
        self.common = common;
        self
    }

    /// Sets the connect timeout in milliseconds.
    #[must_use]
    pub const fn with_connect_timeout_ms(mut self, millis: u64) -> Self {
        self.connect_timeout_ms = millis;
        self
    }

    /// Returns the connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Returns `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl ServiceSettings for ClientSettings {
    fn common(&self) -> &CommonSettings {
        &self.common
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingSetting("host".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "port".to_string(),
                reason: "remote port cannot be 0".to_string(),
            });
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "connect_timeout_ms".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Settings for an inbound multi-client server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Shared settings.
    pub common: CommonSettings,
    /// Local address to bind.
    pub host: String,
    /// Local port to bind; zero picks an ephemeral port.
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            common: CommonSettings::default(),
            host: "0.0.0.0".to_string(),
            port: 9876,
        }
    }
}

impl ServerSettings {
    /// Creates server settings for `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Replaces the shared settings.
    #[must_use]
    pub fn with_common(mut self, common: CommonSettings) -> Self {
        self.common = common;
        self
    }
}

impl ServiceSettings for ServerSettings {
    fn common(&self) -> &CommonSettings {
        &self.common
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingSetting("host".to_string()));
        }
        Ok(())
    }
}

/// Settings for a UDP multicast client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastSettings {
    /// Shared settings.
    pub common: CommonSettings,
    /// Multicast group address.
    pub group: Ipv4Addr,
    /// Multicast group port.
    pub port: u16,
    /// Address of the local interface to use; `0.0.0.0` means any.
    pub local_ip: Ipv4Addr,
    /// Source address for source-specific multicast.
    pub source_ip: Option<Ipv4Addr>,
    /// Multicast TTL.
    pub ttl: u32,
}

impl Default for MulticastSettings {
    fn default() -> Self {
        Self {
            common: CommonSettings::default(),
            group: Ipv4Addr::new(239, 255, 0, 1),
            port: 9877,
            local_ip: Ipv4Addr::UNSPECIFIED,
            source_ip: None,
            ttl: 1,
        }
    }
}

impl MulticastSettings {
    /// Creates multicast settings for `group:port`.
    #[must_use]
    pub fn new(group: Ipv4Addr, port: u16) -> Self {
        Self {
            group,
            port,
            ..Self::default()
        }
    }

    /// Replaces the shared settings.
    #[must_use]
    pub fn with_common(mut self, common: CommonSettings) -> Self {
        self.common = common;
        self
    }

    /// Sets the local interface address.
    #[must_use]
    pub const fn with_local_ip(mut self, local_ip: Ipv4Addr) -> Self {
        self.local_ip = local_ip;
        self
    }

    /// Enables source-specific multicast from `source`.
    #[must_use]
    pub const fn with_source_ip(mut self, source: Ipv4Addr) -> Self {
        self.source_ip = Some(source);
        self
    }

    /// Sets the multicast TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }
}

impl ServiceSettings for MulticastSettings {
    fn common(&self) -> &CommonSettings {
        &self.common
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.group.is_multicast() {
            return Err(ConfigError::InvalidSetting {
                name: "group".to_string(),
                reason: format!("{} is not a multicast address", self.group),
            });
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "port".to_string(),
                reason: "multicast port cannot be 0".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_matching_type() {
        let settings: Box<dyn ServiceSettings> = Box::new(ClientSettings::new("localhost", 9000));
        let client = downcast_settings::<ClientSettings>(settings.as_ref()).unwrap();
        assert_eq!(client.address(), "localhost:9000");
    }

    #[test]
    fn test_downcast_mismatch() {
        let settings: Box<dyn ServiceSettings> = Box::new(ServerSettings::default());
        let err = downcast_settings::<ClientSettings>(settings.as_ref()).unwrap_err();
        match err {
            ConfigError::SettingsMismatch { expected, actual } => {
                assert!(expected.ends_with("ClientSettings"));
                assert!(actual.ends_with("ServerSettings"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_client_validation() {
        let settings = ClientSettings::new("", 9000);
        assert_eq!(
            downcast_settings::<ClientSettings>(&settings),
            Err(ConfigError::MissingSetting("host".to_string()))
        );

        let settings = ClientSettings::new("localhost", 0);
        assert!(downcast_settings::<ClientSettings>(&settings).is_err());
    }

    #[test]
    fn test_multicast_validation() {
        let settings = MulticastSettings::new(Ipv4Addr::new(10, 0, 0, 1), 9000);
        assert!(matches!(
            downcast_settings::<MulticastSettings>(&settings),
            Err(ConfigError::InvalidSetting { .. })
        ));

        let settings = MulticastSettings::new(Ipv4Addr::new(239, 1, 1, 1), 9000)
            .with_source_ip(Ipv4Addr::new(10, 0, 0, 7))
            .with_ttl(4);
        let parsed = downcast_settings::<MulticastSettings>(&settings).unwrap();
        assert_eq!(parsed.source_ip, Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(parsed.ttl, 4);
    }

    #[test]
    fn test_common_settings() {
        let common = CommonSettings::default()
            .with_heartbeat_interval_ms(0)
            .with_idle_timeout_ms(250)
            .with_shutdown_timeout_ms(100);
        assert!(common.heartbeat_interval().is_zero());
        assert_eq!(common.idle_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(common.shutdown_timeout(), Duration::from_millis(100));

        let invalid = ServerSettings::default()
            .with_common(CommonSettings::default().with_worker_threads(0));
        assert!(downcast_settings::<ServerSettings>(&invalid).is_err());
    }
}
