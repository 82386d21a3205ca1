//! Switchmate device family support.
//!
//! This module contains the vendor protocol definitions, advertisement
//! recognition, payload parsing, the per-device command queue, and the
//! drivers for each hardware generation.

pub mod device;
pub mod outlet;
pub mod pairing;
pub mod parser;
pub mod protocol;
pub mod queue;
pub mod recognition;
pub mod switch1;
pub mod switch3;
