//! # bridge-core
//!
//! Shared library for the serial-bridge daemon containing the domain
//! entities and the IPC protocol spoken between the daemon and its UI
//! clients.
//!
//! This crate is used by the daemon and by any client binary. It has zero
//! dependencies on OS APIs, sockets, or async runtimes.
//!
//! # Architecture overview
//!
//! serial-bridge exposes physically attached serial devices as local TCP
//! endpoints. A background daemon (`bridged`) watches the OS device
//! registry, runs one bridge process per enabled-and-present device, and
//! pushes consistent state to every connected UI client.
//!
//! This crate defines:
//!
//! - **`domain`** – The entities the daemon and clients agree on: a serial
//!   device, its persisted configuration, the identity of a bridge session,
//!   and a live bridge endpoint.
//!
//! - **`protocol`** – How bytes travel over the IPC socket. Messages are
//!   bincode payloads behind a small versioned length-prefixed frame.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `bridge_core::SerialDevice` instead of the full module path.
pub use domain::device::{
    BridgeEndpoint, DaemonInfo, DeviceConfiguration, SerialDevice, SessionKey, DEFAULT_BAUD_RATE,
};
pub use protocol::codec::{decode_frame, encode_frame, ProtocolError};
pub use protocol::messages::IpcMessage;
