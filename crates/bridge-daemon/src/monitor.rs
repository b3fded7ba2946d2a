//! Serial device discovery: watches the OS device registry for attach and
//! detach events.
//!
//! There is no portable push notification for device nodes, so the monitor
//! runs a scanner on a dedicated thread (synchronous directory I/O stays
//! off the Tokio runtime, same shape as a blocking socket responder). Each
//! pass lists the watch directory, keeps the names that look like serial
//! ports, and diffs against the previous pass. Differences are forwarded
//! into the supervisor channel as **batched** add/remove events, so they
//! are always observed on the supervisor's serialized loop — the monitor
//! itself never touches supervisor state.
//!
//! The very first scan is delivered as one add batch: devices already
//! present at startup look exactly like devices plugged in later.
//!
//! # Failure semantics
//!
//! An unreadable watch directory is logged on the transition and the pass
//! is skipped: the last good snapshot stays in place, so a transient scan
//! failure is observably "no change" rather than a mass detach. Once the
//! directory is readable again the next diff runs against that snapshot
//! and reports only what actually changed in the meantime.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::supervisor::SupervisorEvent;

/// Interval between directory scans.
pub const SCAN_INTERVAL: Duration = Duration::from_millis(500);

/// Device-node name prefixes treated as serial ports.
const SERIAL_PREFIXES: &[&str] = &["ttyUSB", "ttyACM", "ttyAMA", "cu.", "tty.usb"];

/// Handle to the running monitor thread.
pub struct DeviceMonitor {
    running: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl DeviceMonitor {
    /// Starts the scanner thread watching `watch_dir`.
    ///
    /// Events are sent into `events`; if the receiver is dropped the
    /// thread exits on its own.
    pub fn start(watch_dir: PathBuf, events: mpsc::UnboundedSender<SupervisorEvent>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = std::thread::Builder::new()
            .name("device-monitor".to_string())
            .spawn(move || {
                scan_loop(watch_dir, events, flag);
            })
            .expect("failed to spawn device monitor thread");

        Self {
            running,
            handle: Some(handle),
        }
    }

    /// Stops the scanner and waits for the thread to exit.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The scan loop executed on the monitor thread.
fn scan_loop(
    watch_dir: PathBuf,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    running: Arc<AtomicBool>,
) {
    info!("device monitor watching {}", watch_dir.display());

    let mut known = BTreeSet::new();
    let mut dir_was_readable = true;

    while running.load(Ordering::Relaxed) {
        match scan_serial_nodes(&watch_dir) {
            Ok(current) => {
                if !dir_was_readable {
                    info!("watch dir {} readable again", watch_dir.display());
                    dir_was_readable = true;
                }

                let (added, removed) = diff_scans(&known, &current);
                known = current;

                if !added.is_empty() {
                    debug!("devices attached: {added:?}");
                    if events.send(SupervisorEvent::DevicesAdded(added)).is_err() {
                        break; // supervisor gone, daemon is shutting down
                    }
                }
                if !removed.is_empty() {
                    debug!("devices detached: {removed:?}");
                    if events.send(SupervisorEvent::DevicesRemoved(removed)).is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                // Skip the pass and keep the last good snapshot: a
                // transient scan failure must not read as a mass detach.
                if dir_was_readable {
                    warn!("cannot read watch dir {}: {e}", watch_dir.display());
                    dir_was_readable = false;
                }
            }
        }

        // Sleep in short slices so stop() returns promptly.
        let mut slept = Duration::ZERO;
        while slept < SCAN_INTERVAL && running.load(Ordering::Relaxed) {
            let slice = Duration::from_millis(50).min(SCAN_INTERVAL - slept);
            std::thread::sleep(slice);
            slept += slice;
        }
    }

    info!("device monitor stopped");
}

/// Lists `dir` and returns the set of serial device-node names.
fn scan_serial_nodes(dir: &std::path::Path) -> std::io::Result<BTreeSet<String>> {
    let mut nodes = BTreeSet::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if is_serial_node(name) {
                nodes.insert(name.to_string());
            }
        }
    }
    Ok(nodes)
}

/// Whether a device-node name looks like a serial port.
pub fn is_serial_node(name: &str) -> bool {
    SERIAL_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Computes the add/remove batches between two consecutive scans.
pub fn diff_scans(prev: &BTreeSet<String>, next: &BTreeSet<String>) -> (Vec<String>, Vec<String>) {
    let added = next.difference(prev).cloned().collect();
    let removed = prev.difference(next).cloned().collect();
    (added, removed)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_is_serial_node_accepts_usb_serial_names() {
        assert!(is_serial_node("ttyUSB0"));
        assert!(is_serial_node("ttyACM3"));
        assert!(is_serial_node("cu.usbserial-1420"));
    }

    #[test]
    fn test_is_serial_node_rejects_consoles_and_disks() {
        assert!(!is_serial_node("tty1"));
        assert!(!is_serial_node("sda"));
        assert!(!is_serial_node("null"));
    }

    #[test]
    fn test_diff_scans_first_scan_is_one_add_batch() {
        let (added, removed) = diff_scans(&BTreeSet::new(), &set(&["ttyUSB0", "ttyUSB1"]));
        assert_eq!(added, vec!["ttyUSB0", "ttyUSB1"]);
        assert!(removed.is_empty());
    }

    #[test]
    fn test_diff_scans_reports_both_directions() {
        let (added, removed) = diff_scans(&set(&["ttyUSB0", "ttyACM0"]), &set(&["ttyUSB0", "ttyUSB2"]));
        assert_eq!(added, vec!["ttyUSB2"]);
        assert_eq!(removed, vec!["ttyACM0"]);
    }

    #[test]
    fn test_diff_scans_identical_scan_is_empty() {
        let s = set(&["ttyUSB0"]);
        let (added, removed) = diff_scans(&s, &s);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn test_monitor_reports_nodes_from_temp_dir() {
        let dir = std::env::temp_dir().join(format!("monitor_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("ttyUSB0"), b"").unwrap();
        std::fs::write(dir.join("sda"), b"").unwrap();

        let nodes = scan_serial_nodes(&dir).unwrap();
        assert_eq!(nodes, set(&["ttyUSB0"]));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_monitor_thread_sends_initial_snapshot_then_stops() {
        let dir = std::env::temp_dir().join(format!("monitor_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("ttyACM0"), b"").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = DeviceMonitor::start(dir.clone(), tx);

        // The initial scan must arrive as one add batch.
        let event = tokio_test::block_on(rx.recv()).expect("initial batch");
        match event {
            SupervisorEvent::DevicesAdded(paths) => assert_eq!(paths, vec!["ttyACM0"]),
            other => panic!("expected add batch, got {other:?}"),
        }

        monitor.stop();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unreadable_watch_dir_does_not_detach_known_devices() {
        let dir = std::env::temp_dir().join(format!("monitor_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("ttyUSB0"), b"").unwrap();
        std::fs::write(dir.join("ttyUSB1"), b"").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = DeviceMonitor::start(dir.clone(), tx);

        let event = tokio_test::block_on(rx.recv()).expect("initial batch");
        match event {
            SupervisorEvent::DevicesAdded(paths) => {
                assert_eq!(paths, vec!["ttyUSB0", "ttyUSB1"])
            }
            other => panic!("expected add batch, got {other:?}"),
        }

        // The watch dir vanishes. Several scan intervals later no remove
        // batch may have been emitted: the snapshot must hold while the
        // dir is unreadable.
        std::fs::remove_dir_all(&dir).unwrap();
        std::thread::sleep(SCAN_INTERVAL * 3);
        assert!(
            rx.try_recv().is_err(),
            "a failed scan must not emit device changes"
        );

        // When the dir comes back with one device missing, the diff runs
        // against the held snapshot and reports only the real change.
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("ttyUSB0"), b"").unwrap();
        let event = tokio_test::block_on(rx.recv()).expect("recovery batch");
        match event {
            SupervisorEvent::DevicesRemoved(paths) => assert_eq!(paths, vec!["ttyUSB1"]),
            other => panic!("expected ttyUSB1 removal, got {other:?}"),
        }

        monitor.stop();
        std::fs::remove_dir_all(&dir).ok();
    }
}
