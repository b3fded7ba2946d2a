//! The session supervisor: reconciles "should be running" against "is
//! running" for bridge sessions, and fans consistent state out to every
//! connected client.
//!
//! # Ownership model
//!
//! One event-loop task owns *all* supervisor state — the configuration
//! map, the available-device set, the active session map, the
//! connected-endpoint map, and the client registry. Every external
//! trigger (device scans, client connections, configure requests, bridge
//! link transitions, heartbeat ticks) arrives as a [`SupervisorEvent`] on
//! one mpsc channel, so no two of them are ever processed concurrently
//! and no locks are needed. Invariants like "no two sessions share a
//! port" are prevented by construction, not detected at runtime.
//!
//! # Reconciliation
//!
//! After any eligibility-affecting event the supervisor converges the
//! active session set to exactly
//! `{ (path, baud) : configured enabled ∧ currently present }`:
//!
//! 1. Sessions whose key left the set are stopped **synchronously** —
//!    [`BridgeSession::stop`] joins the worker, so the port is provably
//!    free afterwards.
//! 2. New keys are started in path order, each port allocated against the
//!    live in-use set, which lets a port freed in step 1 be reused in the
//!    same pass. Stop-before-start also bounds open ports to the desired
//!    set's size.
//! 3. A session whose key did not change is left running untouched.
//! 4. The full device list is pushed to every client.

pub mod port_allocator;
pub mod session;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use bridge_core::{
    DaemonInfo, DeviceConfiguration, IpcMessage, SerialDevice, SessionKey,
};

use crate::ipc::ClientRegistry;
use crate::storage::ConfigStore;
use session::{BridgeRunner, BridgeSession, LinkState, SessionEvent};

/// Everything that can happen to the supervisor, serialized onto its loop.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// Devices that appeared in the latest scan (or the initial snapshot).
    DevicesAdded(Vec<String>),
    /// Devices that vanished from the latest scan.
    DevicesRemoved(Vec<String>),
    /// A client asked to persist and apply a device configuration.
    Configure {
        path: String,
        config: DeviceConfiguration,
    },
    /// A bridge link transition reported by a session worker.
    Bridge(SessionEvent),
    /// A new IPC client completed its `Connect` handshake.
    ClientConnected {
        id: Uuid,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    },
    /// An IPC client's channel closed.
    ClientDisconnected { id: Uuid },
    /// Heartbeat tick.
    Tick,
    /// Stop all sessions and exit the loop.
    Shutdown,
}

/// The supervisor. See the module docs for the ownership model.
pub struct SessionSupervisor {
    info: DaemonInfo,
    store: ConfigStore,
    runner: Arc<dyn BridgeRunner>,
    base_port: u16,
    /// Sender handed to session workers so their link events land on the
    /// same loop as everything else.
    events: mpsc::UnboundedSender<SupervisorEvent>,

    configs: BTreeMap<String, DeviceConfiguration>,
    available: BTreeSet<String>,
    sessions: BTreeMap<SessionKey, BridgeSession>,
    /// Live bridge endpoints keyed by port — clients identify a bridge by
    /// its port.
    connected: BTreeMap<u16, bridge_core::BridgeEndpoint>,
    clients: ClientRegistry,
    keepalive: u64,
    /// Monotonic counter stamped onto each session start, so events from
    /// a stopped incarnation can never be attributed to its successor.
    generation: u64,
}

impl SessionSupervisor {
    pub fn new(
        info: DaemonInfo,
        store: ConfigStore,
        configs: BTreeMap<String, DeviceConfiguration>,
        runner: Arc<dyn BridgeRunner>,
        base_port: u16,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Self {
        Self {
            info,
            store,
            runner,
            base_port,
            events,
            configs,
            available: BTreeSet::new(),
            sessions: BTreeMap::new(),
            connected: BTreeMap::new(),
            clients: ClientRegistry::new(),
            keepalive: 0,
            generation: 0,
        }
    }

    /// Drives the event loop to completion.
    ///
    /// Consumes the supervisor; on return every session has been stopped.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SupervisorEvent>) {
        // Startup counts as an eligibility-affecting event: devices may
        // already be configured before the first scan arrives.
        self.reconcile();

        while let Some(event) = rx.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }

        self.shutdown_all();
        info!("supervisor stopped");
    }

    /// Processes one event. Returns `false` when the loop should exit.
    ///
    /// Public so tests can drive the supervisor deterministically without
    /// a runtime.
    pub fn handle_event(&mut self, event: SupervisorEvent) -> bool {
        match event {
            SupervisorEvent::DevicesAdded(paths) => {
                self.available.extend(paths);
                self.reconcile();
            }
            SupervisorEvent::DevicesRemoved(paths) => {
                for path in &paths {
                    self.available.remove(path);
                }
                self.reconcile();
            }
            SupervisorEvent::Configure { path, config } => self.configure(path, config),
            SupervisorEvent::Bridge(event) => self.on_bridge_event(event),
            SupervisorEvent::ClientConnected { id, tx } => self.on_client_connected(id, tx),
            SupervisorEvent::ClientDisconnected { id } => {
                // A client going away never affects sessions: those are
                // driven solely by device eligibility.
                info!("client {id} disconnected");
                self.clients.remove(id);
            }
            SupervisorEvent::Tick => {
                self.keepalive += 1;
                self.broadcast(&IpcMessage::Keepalive(self.keepalive));
            }
            SupervisorEvent::Shutdown => return false,
        }
        true
    }

    // ── Reconciliation ────────────────────────────────────────────────────────

    fn reconcile(&mut self) {
        let desired = self.desired_keys();
        let current: BTreeSet<SessionKey> = self.sessions.keys().cloned().collect();

        // Stop first: each stop joins the worker, so every port freed here
        // is genuinely reusable in the start phase below.
        for key in current.difference(&desired) {
            if let Some(mut stale) = self.sessions.remove(key) {
                stale.stop();
                if let Some(endpoint) = self.connected.remove(&stale.port()) {
                    self.broadcast(&IpcMessage::DeviceDisconnected(endpoint));
                }
            }
        }

        // Start in key order (path-major) so port assignment is
        // reproducible for a given desired set.
        let mut in_use: BTreeSet<u16> = self.sessions.values().map(|s| s.port()).collect();
        for key in desired.difference(&current) {
            match port_allocator::next_free_port(self.base_port, &in_use) {
                Some(port) => {
                    in_use.insert(port);
                    self.generation += 1;
                    let session = BridgeSession::start(
                        key.clone(),
                        port,
                        self.generation,
                        Arc::clone(&self.runner),
                        self.events.clone(),
                    );
                    self.sessions.insert(key.clone(), session);
                }
                None => warn!("no free port above {} for session {key}", self.base_port),
            }
        }

        self.broadcast(&IpcMessage::SerialDevices(self.device_list()));
    }

    /// `{ (path, baud) : configured enabled ∧ currently present }`.
    fn desired_keys(&self) -> BTreeSet<SessionKey> {
        self.configs
            .iter()
            .filter(|(path, config)| config.enabled && self.available.contains(*path))
            .map(|(path, config)| SessionKey::new(path.clone(), config))
            .collect()
    }

    // ── Operations ────────────────────────────────────────────────────────────

    fn configure(&mut self, path: String, config: DeviceConfiguration) {
        if !config.is_valid() {
            warn!("ignoring invalid configuration for {path}: baud {}", config.baud_rate);
            return;
        }

        debug!(
            "configure {path}: enabled={} baud={}",
            config.enabled, config.baud_rate
        );
        self.configs.insert(path, config);

        // Persistence is best-effort; the in-memory map stays
        // authoritative for this process either way.
        if let Err(e) = self.store.save(&self.configs) {
            warn!("failed to persist device configuration: {e}");
        }

        self.reconcile();
    }

    fn on_bridge_event(&mut self, event: SessionEvent) {
        // Workers are joined on stop, but events they queued beforehand
        // can still arrive, and a restarted session may reuse the same
        // key and port. Only the exact incarnation that produced the
        // event may mutate the connected set.
        let active = self
            .sessions
            .get(&event.key)
            .is_some_and(|s| s.generation() == event.generation);
        if !active {
            debug!("dropping stale link event for {}", event.key);
            return;
        }

        match event.state {
            LinkState::Connected => {
                self.connected.insert(event.endpoint.port, event.endpoint);
                self.broadcast(&IpcMessage::DeviceConnected(event.endpoint));
            }
            LinkState::Disconnected => {
                if self.connected.remove(&event.endpoint.port).is_some() {
                    self.broadcast(&IpcMessage::DeviceDisconnected(event.endpoint));
                }
            }
        }
    }

    fn on_client_connected(&mut self, id: Uuid, tx: mpsc::UnboundedSender<Vec<u8>>) {
        info!("client {id} connected ({} total)", self.clients.len() + 1);
        self.clients.insert(id, tx);

        // Full-state sync to exactly this client; nobody else is touched.
        self.send_to(id, &IpcMessage::Hello(self.info.clone()));
        self.send_to(id, &IpcMessage::SerialDevices(self.device_list()));
        let endpoints: Vec<_> = self.connected.values().copied().collect();
        for endpoint in endpoints {
            self.send_to(id, &IpcMessage::DeviceConnected(endpoint));
        }
    }

    fn shutdown_all(&mut self) {
        let keys: Vec<SessionKey> = self.sessions.keys().cloned().collect();
        for key in keys {
            if let Some(mut session) = self.sessions.remove(&key) {
                session.stop();
            }
        }
        self.connected.clear();
    }

    // ── State derivation and fan-out ──────────────────────────────────────────

    /// The device list pushed to clients: configured ∪ present, in path
    /// order. Configurations are never pruned — a permanently removed
    /// device keeps its entry with `available: false` until the user
    /// reconfigures it.
    pub fn device_list(&self) -> Vec<SerialDevice> {
        let mut paths: BTreeSet<String> = self.configs.keys().cloned().collect();
        paths.extend(self.available.iter().cloned());

        paths
            .into_iter()
            .map(|path| SerialDevice {
                available: self.available.contains(&path),
                config: self.configs.get(&path).copied().unwrap_or_default(),
                path,
            })
            .collect()
    }

    fn broadcast(&mut self, msg: &IpcMessage) {
        match bridge_core::encode_frame(msg) {
            Ok(frame) => self.clients.broadcast(&frame),
            Err(e) => error!("failed to encode broadcast: {e}"),
        }
    }

    fn send_to(&mut self, id: Uuid, msg: &IpcMessage) {
        match bridge_core::encode_frame(msg) {
            Ok(frame) => {
                self.clients.send_to(id, frame);
            }
            Err(e) => error!("failed to encode message for client {id}: {e}"),
        }
    }

    // ── Test observability ────────────────────────────────────────────────────

    /// Keys of the currently active sessions.
    pub fn active_keys(&self) -> BTreeSet<SessionKey> {
        self.sessions.keys().cloned().collect()
    }

    /// Port held by the active session for `key`, if any.
    pub fn session_port(&self, key: &SessionKey) -> Option<u16> {
        self.sessions.get(key).map(|s| s.port())
    }

    /// Ports of all live bridge endpoints.
    pub fn connected_ports(&self) -> BTreeSet<u16> {
        self.connected.keys().copied().collect()
    }

    /// Number of registered IPC clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Runner whose links stay up until cancelled; records nothing. The
    /// heavier scripted-runner scenarios live in the integration tests.
    struct IdleRunner;

    struct IdleLink;

    impl session::BridgeHandle for IdleLink {
        fn is_running(&mut self) -> bool {
            true
        }
        fn shutdown(&mut self) {}
    }

    impl BridgeRunner for IdleRunner {
        fn spawn(
            &self,
            _params: &session::BridgeParams,
        ) -> std::io::Result<Box<dyn session::BridgeHandle>> {
            Ok(Box::new(IdleLink))
        }
    }

    fn temp_store() -> ConfigStore {
        let path = std::env::temp_dir()
            .join(format!("supervisor_test_{}", Uuid::new_v4()))
            .join("devices.toml");
        ConfigStore::open(path).0
    }

    fn make_supervisor() -> (
        SessionSupervisor,
        mpsc::UnboundedReceiver<SupervisorEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = SessionSupervisor::new(
            DaemonInfo {
                version: "0.1.0".into(),
                build: 1,
            },
            temp_store(),
            BTreeMap::new(),
            Arc::new(IdleRunner),
            7501,
            tx,
        );
        (supervisor, rx)
    }

    fn enabled(baud: u32) -> DeviceConfiguration {
        DeviceConfiguration {
            enabled: true,
            baud_rate: baud,
        }
    }

    #[test]
    fn test_unconfigured_device_gets_no_session() {
        let (mut sup, _rx) = make_supervisor();
        sup.handle_event(SupervisorEvent::DevicesAdded(vec!["ttyUSB0".into()]));

        assert!(sup.active_keys().is_empty());
        let list = sup.device_list();
        assert_eq!(list.len(), 1);
        assert!(list[0].available);
        assert!(!list[0].config.enabled);
    }

    #[test]
    fn test_invalid_baud_configure_is_ignored() {
        let (mut sup, _rx) = make_supervisor();
        sup.handle_event(SupervisorEvent::DevicesAdded(vec!["ttyUSB0".into()]));
        sup.handle_event(SupervisorEvent::Configure {
            path: "ttyUSB0".into(),
            config: DeviceConfiguration {
                enabled: true,
                baud_rate: 0,
            },
        });

        assert!(sup.active_keys().is_empty());
        assert!(sup.device_list()[0].config == DeviceConfiguration::default());
    }

    #[test]
    fn test_device_list_keeps_configured_but_absent_devices() {
        let (mut sup, _rx) = make_supervisor();
        sup.handle_event(SupervisorEvent::Configure {
            path: "ttyUSB0".into(),
            config: enabled(9600),
        });

        let list = sup.device_list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].path, "ttyUSB0");
        assert!(!list[0].available, "never-present device is listed but unavailable");
        assert!(sup.active_keys().is_empty(), "unavailable device must not bridge");
    }

    #[test]
    fn test_keepalive_counter_increments_per_tick() {
        let (mut sup, _rx) = make_supervisor();
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        sup.handle_event(SupervisorEvent::ClientConnected {
            id: Uuid::new_v4(),
            tx: client_tx,
        });
        drain_frames(&mut client_rx); // Hello + device list

        sup.handle_event(SupervisorEvent::Tick);
        sup.handle_event(SupervisorEvent::Tick);

        let frames = drain_frames(&mut client_rx);
        let counts: Vec<u64> = frames
            .iter()
            .filter_map(|f| match bridge_core::decode_frame(f).unwrap().0 {
                IpcMessage::Keepalive(n) => Some(n),
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![1, 2]);
    }

    #[test]
    fn test_shutdown_event_exits_the_loop() {
        let (mut sup, _rx) = make_supervisor();
        assert!(sup.handle_event(SupervisorEvent::Tick));
        assert!(!sup.handle_event(SupervisorEvent::Shutdown));
    }

    #[test]
    fn test_new_client_receives_hello_then_full_device_list() {
        let (mut sup, _rx) = make_supervisor();
        sup.handle_event(SupervisorEvent::DevicesAdded(vec!["ttyUSB0".into()]));

        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        sup.handle_event(SupervisorEvent::ClientConnected {
            id: Uuid::new_v4(),
            tx: client_tx,
        });

        let frames = drain_frames(&mut client_rx);
        assert!(frames.len() >= 2);
        match bridge_core::decode_frame(&frames[0]).unwrap().0 {
            IpcMessage::Hello(info) => assert_eq!(info.build, 1),
            other => panic!("first message must be Hello, got {other:?}"),
        }
        match bridge_core::decode_frame(&frames[1]).unwrap().0 {
            IpcMessage::SerialDevices(devices) => assert_eq!(devices[0].path, "ttyUSB0"),
            other => panic!("second message must be the device list, got {other:?}"),
        }
    }

    fn drain_frames(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }
}
