//! Bridge session lifecycle: one worker thread per bridged device.
//!
//! A session owns the bridge process for one `(device, baud)` pair bound
//! to one TCP port. The worker runs an unbounded attempt loop: spawn the
//! bridge, report `Connected`, watch it until the link drops, report
//! `Disconnected`, back off, and try again. Reconnect-on-drop is intrinsic
//! to the session — the supervisor never re-drives it.
//!
//! The daemon does not interpret the bridge protocol (that lives in the
//! external bridge executable); a running bridge process *is* a connected
//! link, and process exit is the link dropping.
//!
//! # Cancellation
//!
//! `stop()` is cooperative and synchronous: it sets the cancel flag,
//! which the worker observes at loop boundaries and by killing a live
//! bridge process, and then joins the worker thread. When `stop()`
//! returns, the thread has exited and the port is free for reuse — the
//! reconciliation algorithm depends on exactly that guarantee.
//!
//! State machine: `Starting → Connected ⇄ Disconnected`, terminal on
//! stop. Only `Connected`/`Disconnected` are reported; `Starting` is
//! internal. A cancelled teardown emits nothing from the worker — the
//! supervisor reports it, so clients see exactly one disconnect per drop.

use std::process::{Child, Command, Stdio};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use bridge_core::{BridgeEndpoint, SessionKey};

use crate::supervisor::SupervisorEvent;

/// Host the bridge process binds its TCP listener on.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Interval at which the worker polls the bridge process for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Backoff between bridge attempts after a drop or spawn failure.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Parameters handed to the bridge process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeParams {
    pub device_path: String,
    pub baud_rate: u32,
    pub host: String,
    pub port: u16,
}

/// A live bridge process (or a test double standing in for one).
pub trait BridgeHandle: Send {
    /// Whether the bridge is still up. A `false` return means the link
    /// dropped and the process has been reaped.
    fn is_running(&mut self) -> bool;

    /// Tears the bridge down and reaps it. Must be safe to call after
    /// the process already exited.
    fn shutdown(&mut self);
}

/// Spawns bridge processes. Injectable so tests can script link behavior
/// without real child processes.
#[cfg_attr(test, mockall::automock)]
pub trait BridgeRunner: Send + Sync {
    fn spawn(&self, params: &BridgeParams) -> std::io::Result<Box<dyn BridgeHandle>>;
}

// ── Real runner: external bridge executable ───────────────────────────────────

/// Spawns the external bridge executable with the four bridge parameters.
pub struct CommandRunner {
    command: String,
}

impl CommandRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl BridgeRunner for CommandRunner {
    fn spawn(&self, params: &BridgeParams) -> std::io::Result<Box<dyn BridgeHandle>> {
        let child = Command::new(&self.command)
            .args([
                "--device",
                &params.device_path,
                "--baud",
                &params.baud_rate.to_string(),
                "--host",
                &params.host,
                "--port",
                &params.port.to_string(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Box::new(ChildHandle { child }))
    }
}

struct ChildHandle {
    child: Child,
}

impl BridgeHandle for ChildHandle {
    fn is_running(&mut self) -> bool {
        // try_wait reaps the process on exit, so no zombie is left behind.
        matches!(self.child.try_wait(), Ok(None))
    }

    fn shutdown(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// ── Session events ────────────────────────────────────────────────────────────

/// Link state reported to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// One link transition of one session, marshaled to the supervisor loop
/// before any observable side effect.
///
/// `generation` identifies the exact session incarnation that produced
/// the event. A stopped session can leave events queued behind the stop;
/// the generation lets the supervisor discard them even when a restarted
/// session holds the same key and port.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub key: SessionKey,
    pub endpoint: BridgeEndpoint,
    pub generation: u64,
    pub state: LinkState,
}

// ── Session handle ────────────────────────────────────────────────────────────

/// Owner handle for one running bridge session.
///
/// Created and destroyed exclusively by the supervisor.
pub struct BridgeSession {
    key: SessionKey,
    port: u16,
    generation: u64,
    cancel: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl BridgeSession {
    /// Spawns the worker thread for `key` on `port`.
    ///
    /// `generation` must be unique per start; the supervisor uses it to
    /// tell this incarnation's events apart from a predecessor's.
    pub fn start(
        key: SessionKey,
        port: u16,
        generation: u64,
        runner: Arc<dyn BridgeRunner>,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Self {
        info!("starting bridge session {key} on port {port}");

        let cancel = Arc::new(AtomicBool::new(false));
        let worker_key = key.clone();
        let worker_cancel = Arc::clone(&cancel);

        let handle = std::thread::Builder::new()
            .name(format!("bridge-{}", key.path))
            .spawn(move || {
                worker_loop(worker_key, port, generation, runner, events, worker_cancel);
            })
            .expect("failed to spawn bridge session thread");

        Self {
            key,
            port,
            generation,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stops the session and joins the worker thread.
    ///
    /// Synchronous: when this returns, the bridge process has been torn
    /// down and the port is free for reuse.
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        info!("bridge session {} stopped, port {} freed", self.key, self.port);
    }
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

fn worker_loop(
    key: SessionKey,
    port: u16,
    generation: u64,
    runner: Arc<dyn BridgeRunner>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    cancel: Arc<AtomicBool>,
) {
    let params = BridgeParams {
        device_path: key.path.clone(),
        baud_rate: key.baud_rate,
        host: LOOPBACK_HOST.to_string(),
        port,
    };

    while !cancel.load(Ordering::Relaxed) {
        let mut link = match runner.spawn(&params) {
            Ok(link) => link,
            Err(e) => {
                warn!("bridge spawn failed for {key}: {e}");
                sleep_cancellable(RETRY_BACKOFF, &cancel);
                continue;
            }
        };

        // A fresh endpoint id per connect: clients must never correlate
        // a reconnect with the previous link.
        let endpoint = BridgeEndpoint::new(port);
        debug!("bridge {key} up on port {port} (endpoint {})", endpoint.id);
        if send_event(&events, &key, endpoint, generation, LinkState::Connected).is_err() {
            link.shutdown();
            return;
        }

        while !cancel.load(Ordering::Relaxed) && link.is_running() {
            std::thread::sleep(POLL_INTERVAL);
        }

        if cancel.load(Ordering::Relaxed) {
            // Cooperative stop: kill the bridge and exit without emitting;
            // the supervisor broadcasts the teardown.
            link.shutdown();
            return;
        }

        debug!("bridge {key} dropped (endpoint {})", endpoint.id);
        let _ = send_event(&events, &key, endpoint, generation, LinkState::Disconnected);
        sleep_cancellable(RETRY_BACKOFF, &cancel);
    }
}

fn send_event(
    events: &mpsc::UnboundedSender<SupervisorEvent>,
    key: &SessionKey,
    endpoint: BridgeEndpoint,
    generation: u64,
    state: LinkState,
) -> Result<(), ()> {
    events
        .send(SupervisorEvent::Bridge(SessionEvent {
            key: key.clone(),
            endpoint,
            generation,
            state,
        }))
        .map_err(|_| ())
}

/// Sleeps up to `total`, waking early when `cancel` is set.
fn sleep_cancellable(total: Duration, cancel: &AtomicBool) {
    let mut slept = Duration::ZERO;
    while slept < total && !cancel.load(Ordering::Relaxed) {
        let slice = Duration::from_millis(20).min(total - slept);
        std::thread::sleep(slice);
        slept += slice;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
