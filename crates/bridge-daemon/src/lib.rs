//! bridge-daemon library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.

pub mod ipc;
pub mod monitor;
pub mod storage;
pub mod supervisor;
