//! Bluetooth communication layer for Switchmate devices.
//!
//! This module provides the radio transport seam, the BlueZ backend,
//! per-device GATT links, the process-wide scan controller, and the
//! device registry built on top of them.

pub mod bluez;
#[cfg(test)]
pub mod fake;
pub mod link;
pub mod manager;
pub mod radio;
pub mod scanner;
