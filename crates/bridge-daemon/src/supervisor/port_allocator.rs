//! Port allocation for bridge sessions.
//!
//! Ports are arbitrated by one pure function plus an ordering rule: only
//! the supervisor allocates, only inside one in-flight reconciliation
//! pass, and it reserves each returned port (by creating the session and
//! inserting its port into the in-use set) before asking for the next one.
//! That makes any separate lock or allocator state redundant.

use std::collections::BTreeSet;

/// Returns the smallest port `>= base` not present in `in_use`.
///
/// Deterministic and side-effect-free. Returns `None` only if every port
/// from `base` to `u16::MAX` is taken, which would require tens of
/// thousands of simultaneously bridged devices.
pub fn next_free_port(base: u16, in_use: &BTreeSet<u16>) -> Option<u16> {
    (base..=u16::MAX).find(|p| !in_use.contains(p))
}
