//! IPC server: accept loop, per-client tasks, and the client registry.
//!
//! UI clients connect over a Unix socket. Each connection gets two
//! halves:
//!
//! - a **read loop** in the connection task, decoding frames and
//!   forwarding `Connect` / `ConfigureDevice` into the supervisor
//!   channel, and
//! - a **writer task** draining a per-client outbound channel, so one
//!   slow client never blocks the supervisor or its peers.
//!
//! The registry of connected clients lives inside the supervisor's state
//! (this module only defines the type); registration and removal travel
//! through the supervisor channel like every other state mutation. A
//! client's lifecycle has no effect on bridge sessions — a disconnecting
//! client is simply removed from the fan-out set.
//!
//! The accept loop itself never blocks on a connection: it hands each
//! stream to a dedicated Tokio task and immediately accepts the next one.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use bridge_core::{decode_frame, IpcMessage, ProtocolError};

use crate::supervisor::SupervisorEvent;

/// Fixed heartbeat interval. The keepalive is one-way: clients use it to
/// detect a silently stalled daemon, the daemon never evicts on missed
/// beats.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

// ── Client registry ───────────────────────────────────────────────────────────

/// The set of currently connected clients, owned by the supervisor.
///
/// Each entry is the sending half of that client's outbound frame
/// channel. Broadcasting clones one encoded frame into every channel; a
/// failed send means the writer task is gone, so the client is pruned on
/// the spot.
#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<Uuid, mpsc::UnboundedSender<Vec<u8>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn insert(&mut self, id: Uuid, tx: mpsc::UnboundedSender<Vec<u8>>) {
        self.clients.insert(id, tx);
    }

    pub fn remove(&mut self, id: Uuid) {
        self.clients.remove(&id);
    }

    /// Sends one frame to one client, pruning it if unreachable.
    pub fn send_to(&mut self, id: Uuid, frame: Vec<u8>) {
        if let Some(tx) = self.clients.get(&id) {
            if tx.send(frame).is_err() {
                warn!("dropping unreachable client {id}");
                self.clients.remove(&id);
            }
        }
    }

    /// Sends one frame to every client, pruning the unreachable ones.
    pub fn broadcast(&mut self, frame: &[u8]) {
        let dead: Vec<Uuid> = self
            .clients
            .iter()
            .filter(|(_, tx)| tx.send(frame.to_vec()).is_err())
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            warn!("dropping unreachable client {id}");
            self.clients.remove(&id);
        }
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

/// Runs the Unix-socket accept loop until `running` is cleared.
///
/// # Errors
///
/// Returns an error only if the listener cannot be bound (e.g. the
/// socket directory does not exist or the process lacks permission).
pub async fn run_ipc_listener(
    socket_path: &Path,
    supervisor: mpsc::UnboundedSender<SupervisorEvent>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    // A previous run may have left its socket file behind; bind would
    // fail with AddrInUse otherwise.
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("failed to remove stale socket {}", socket_path.display()))?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind IPC socket {}", socket_path.display()))?;

    info!("IPC listening on {}", socket_path.display());

    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        // Short timeout so the loop can re-check the running flag even
        // when no clients are connecting.
        match timeout(Duration::from_millis(200), listener.accept()).await {
            Ok(Ok((stream, _addr))) => {
                let tx = supervisor.clone();
                tokio::spawn(async move {
                    handle_client(stream, tx).await;
                });
            }
            Ok(Err(e)) => {
                // Transient accept error; keep serving other clients.
                error!("accept error: {e}");
            }
            Err(_) => continue, // timeout
        }
    }

    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

/// One connected client, from accept to hangup.
async fn handle_client(stream: UnixStream, supervisor: mpsc::UnboundedSender<SupervisorEvent>) {
    let id = Uuid::new_v4();
    debug!("IPC connection opened, assigned client id {id}");

    let (mut reader, mut writer) = stream.into_split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    // Writer task: drains the outbound channel. Exits when the registry
    // drops the sender (client removed) and this task's local clone goes.
    tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut registered = false;
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];

    'conn: loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("client {id} read error: {e}");
                break;
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        // Drain every complete frame in the buffer.
        loop {
            match decode_frame(&buf) {
                Ok((msg, consumed)) => {
                    buf.drain(..consumed);
                    if !dispatch(&supervisor, id, msg, &frame_tx, &mut registered) {
                        break 'conn;
                    }
                }
                Err(ProtocolError::InsufficientData { .. }) => break,
                Err(e) => {
                    warn!("client {id} sent a malformed frame, disconnecting: {e}");
                    break 'conn;
                }
            }
        }
    }

    if registered {
        let _ = supervisor.send(SupervisorEvent::ClientDisconnected { id });
    }
    debug!("IPC connection for client {id} closed");
}

/// Routes one inbound message. Returns `false` when the connection
/// should be dropped (supervisor gone).
fn dispatch(
    supervisor: &mpsc::UnboundedSender<SupervisorEvent>,
    id: Uuid,
    msg: IpcMessage,
    frame_tx: &mpsc::UnboundedSender<Vec<u8>>,
    registered: &mut bool,
) -> bool {
    let event = match msg {
        IpcMessage::Connect => {
            if *registered {
                warn!("client {id} sent Connect twice, ignoring");
                return true;
            }
            *registered = true;
            SupervisorEvent::ClientConnected {
                id,
                tx: frame_tx.clone(),
            }
        }
        IpcMessage::ConfigureDevice { path, config } => SupervisorEvent::Configure { path, config },
        other => {
            // Daemon-to-client messages coming *from* a client are a
            // protocol violation worth logging, not a reason to hang up.
            warn!("client {id} sent unexpected message {other:?}");
            return true;
        }
    };
    supervisor.send(event).is_ok()
}

// ── Heartbeat ─────────────────────────────────────────────────────────────────

/// Feeds a `Tick` into the supervisor every [`KEEPALIVE_INTERVAL`]; the
/// supervisor broadcasts the incrementing counter from its own loop.
pub async fn run_heartbeat(
    supervisor: mpsc::UnboundedSender<SupervisorEvent>,
    running: Arc<AtomicBool>,
) {
    let mut ticker = interval(KEEPALIVE_INTERVAL);
    // The first tick of a Tokio interval fires immediately; skip it so
    // counts line up with elapsed seconds.
    ticker.tick().await;

    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        if supervisor.send(SupervisorEvent::Tick).is_err() {
            break;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
