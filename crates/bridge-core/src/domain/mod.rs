//! Domain entities for serial-bridge.
//!
//! Pure data types with no infrastructure dependencies. Everything the
//! daemon persists or pushes to clients is defined in terms of these.

pub mod device;
