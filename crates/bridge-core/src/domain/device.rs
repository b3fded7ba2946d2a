//! Serial device entities: configuration, session identity, and endpoints.
//!
//! A `SerialDevice` as seen by clients is *derived* state: the union of
//! every path that has a persisted configuration and every path currently
//! present in the OS device registry. It is recomputed on each push, never
//! stored.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default baud rate applied to a device that has never been configured.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Persisted per-device settings, keyed by device path.
///
/// Mutated only through the daemon's configure operation. A configuration
/// outlives the physical device: unplugging a device never deletes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfiguration {
    /// Whether the daemon should run a bridge for this device while it is
    /// present.
    #[serde(default)]
    pub enabled: bool,
    /// Baud rate passed to the bridge process. Must be positive.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

impl Default for DeviceConfiguration {
    fn default() -> Self {
        Self {
            enabled: false,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl DeviceConfiguration {
    /// Returns `false` for configurations the daemon must refuse to apply.
    pub fn is_valid(&self) -> bool {
        self.baud_rate > 0
    }
}

/// One serial device as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialDevice {
    /// Device node name, e.g. `ttyUSB0`.
    pub path: String,
    /// Whether the device is currently physically present.
    pub available: bool,
    /// The persisted configuration (defaults if never configured).
    pub config: DeviceConfiguration,
}

/// Identity of one bridge session.
///
/// Two sessions are the same only if both the path and the baud rate
/// match; changing the baud rate of an enabled device tears the old
/// session down and starts a new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub path: String,
    pub baud_rate: u32,
}

impl SessionKey {
    pub fn new(path: impl Into<String>, config: &DeviceConfiguration) -> Self {
        Self {
            path: path.into(),
            baud_rate: config.baud_rate,
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.path, self.baud_rate)
    }
}

/// One live bridge connection, as broadcast to clients.
///
/// Clients identify a bridge by `port`; the `id` is freshly generated for
/// every connect, so a disconnect followed by a reconnect of the same
/// session carries a new `id`. Clients must not assume identifier
/// stability across a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeEndpoint {
    pub id: Uuid,
    pub port: u16,
}

impl BridgeEndpoint {
    /// Creates an endpoint with a fresh connection identifier.
    pub fn new(port: u16) -> Self {
        Self {
            id: Uuid::new_v4(),
            port,
        }
    }
}

/// Daemon identity returned to a client on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub version: String,
    pub build: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration_is_disabled_at_default_baud() {
        let cfg = DeviceConfiguration::default();
        assert!(!cfg.enabled);
        assert_eq!(cfg.baud_rate, DEFAULT_BAUD_RATE);
    }

    #[test]
    fn test_zero_baud_rate_is_invalid() {
        let cfg = DeviceConfiguration {
            enabled: true,
            baud_rate: 0,
        };
        assert!(!cfg.is_valid());
    }

    #[test]
    fn test_session_keys_differ_when_baud_differs() {
        let a = SessionKey {
            path: "ttyUSB0".into(),
            baud_rate: 9600,
        };
        let b = SessionKey {
            path: "ttyUSB0".into(),
            baud_rate: 115200,
        };
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_keys_order_by_path_first() {
        let a = SessionKey {
            path: "ttyUSB0".into(),
            baud_rate: 115200,
        };
        let b = SessionKey {
            path: "ttyUSB1".into(),
            baud_rate: 9600,
        };
        assert!(a < b, "path must dominate the ordering");
    }

    #[test]
    fn test_endpoint_ids_are_fresh_per_connect() {
        let a = BridgeEndpoint::new(7501);
        let b = BridgeEndpoint::new(7501);
        assert_eq!(a.port, b.port);
        assert_ne!(a.id, b.id);
    }
}
