//! IPC message set spoken between the daemon and UI clients.
//!
//! One enum covers both directions. The daemon never replies to
//! `ConfigureDevice` with a status: the client observes the effect (or
//! non-effect) through the next `SerialDevices` push. This keeps every
//! session-lifecycle operation fire-and-forget and the protocol
//! self-healing: any missed message is repaired by the next full-state
//! push.

use serde::{Deserialize, Serialize};

use crate::domain::device::{BridgeEndpoint, DaemonInfo, DeviceConfiguration, SerialDevice};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Current protocol version byte, first byte of every frame.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Frame header size in bytes: version (1) + payload length (4, big-endian).
pub const HEADER_SIZE: usize = 5;

/// Upper bound on a frame payload. Nothing the daemon sends approaches
/// this; it guards the decoder against a corrupt length field.
pub const MAX_PAYLOAD: usize = 1 << 20;

// ── Messages ──────────────────────────────────────────────────────────────────

/// Every message that crosses the IPC socket, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IpcMessage {
    // ── client → daemon ──
    /// First message on a fresh connection; the daemon answers with
    /// `Hello` followed by a full state sync.
    Connect,
    /// Persist and apply a device configuration. Fire-and-forget.
    ConfigureDevice {
        path: String,
        config: DeviceConfiguration,
    },

    // ── daemon → client ──
    /// Daemon identity, sent once in response to `Connect`.
    Hello(DaemonInfo),
    /// One-way heartbeat with an incrementing counter, so a client can
    /// detect a silently stalled daemon. No acknowledgement is expected.
    Keepalive(u64),
    /// Full device list: everything ever configured plus everything
    /// currently present. Always a full-state push, never a diff.
    SerialDevices(Vec<SerialDevice>),
    /// A bridge came up on its TCP port.
    DeviceConnected(BridgeEndpoint),
    /// A bridge went down. The same session may reconnect immediately
    /// with a fresh endpoint id.
    DeviceDisconnected(BridgeEndpoint),
}
