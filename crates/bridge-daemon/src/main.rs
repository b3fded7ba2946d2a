//! serial-bridge daemon entry point.
//!
//! Wires together the infrastructure and starts the Tokio runtime.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ ConfigStore::open()     -- fail-soft load of settings + devices
//!  └─ SessionSupervisor::run  -- single event loop owning all state
//!  └─ background services
//!       ├─ DeviceMonitor      (scanner thread → supervisor channel)
//!       ├─ IPC accept loop    (Tokio task per client)
//!       └─ heartbeat ticker   (Tokio task)
//! ```

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bridge_core::DaemonInfo;
use bridge_daemon::ipc;
use bridge_daemon::monitor::DeviceMonitor;
use bridge_daemon::storage::{self, ConfigStore};
use bridge_daemon::supervisor::{session::CommandRunner, SessionSupervisor, SupervisorEvent};

/// Monotonically bumped build number reported in `Hello`.
const BUILD_NUMBER: u32 = 1;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config first: the persisted log level seeds the filter, and a
    // corrupt store degrades to defaults rather than aborting startup.
    let config_path = match storage::default_config_path() {
        Ok(path) => path,
        Err(e) => {
            eprintln!("cannot resolve config dir ({e}); using ./devices.toml");
            std::path::PathBuf::from("devices.toml")
        }
    };
    let (store, devices) = ConfigStore::open(&config_path);
    let settings = store.settings().clone();

    // Structured logging. Level comes from config, overridden by RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    info!(
        "serial-bridge daemon starting (config {}, {} configured device(s))",
        config_path.display(),
        devices.len()
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let running = Arc::new(AtomicBool::new(true));

    let supervisor = SessionSupervisor::new(
        DaemonInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            build: BUILD_NUMBER,
        },
        store,
        devices,
        Arc::new(CommandRunner::new(settings.bridge_command.clone())),
        settings.base_port,
        events_tx.clone(),
    );

    // ── Device monitor (scanner thread) ───────────────────────────────────────
    let mut device_monitor = DeviceMonitor::start(settings.watch_dir.clone(), events_tx.clone());

    // ── IPC accept loop ───────────────────────────────────────────────────────
    let ipc_tx = events_tx.clone();
    let ipc_running = Arc::clone(&running);
    let socket_path = settings.socket_path.clone();
    tokio::spawn(async move {
        if let Err(e) = ipc::run_ipc_listener(&socket_path, ipc_tx, ipc_running).await {
            // Clients simply cannot connect; bridging itself still works.
            error!("IPC listener failed: {e:#}");
        }
    });

    // ── Heartbeat ─────────────────────────────────────────────────────────────
    tokio::spawn(ipc::run_heartbeat(
        events_tx.clone(),
        Arc::clone(&running),
    ));

    // ── Ctrl-C / SIGTERM handler ──────────────────────────────────────────────
    let shutdown_tx = events_tx.clone();
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            running_clone.store(false, Ordering::Relaxed);
            if shutdown_tx.send(SupervisorEvent::Shutdown).is_err() {
                warn!("supervisor already stopped");
            }
        }
    });

    info!("serial-bridge daemon ready");

    // The supervisor loop is the daemon's lifetime: it exits only on
    // Shutdown, after stopping every session synchronously.
    supervisor.run(events_rx).await;

    running.store(false, Ordering::Relaxed);
    device_monitor.stop();

    info!("serial-bridge daemon stopped");
    Ok(())
}
