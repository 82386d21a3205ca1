//! Event handling system for Switchmate status updates.
//!
//! This module provides the event infrastructure for notifying the host
//! layer about discoveries, state changes, battery updates, and
//! reachability of Switchmate devices.

use std::sync::Arc;

use log::info;

use crate::switchmate::protocol::{Channel, DeviceId, DeviceKind, ProtocolVersion};

/// Events that can be emitted by the Switchmate service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchmateEvent {
   Discovered {
      kind: DeviceKind,
      version: ProtocolVersion,
   },
   /// A relay changed state; `channel` is `None` for single-relay switches.
   StateChanged {
      channel: Option<Channel>,
      on: bool,
   },
   LightChanged(bool),
   BatteryUpdated(u8),
   Unreachable,
   Connected,
   Disconnected,
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, device: &DeviceId, event: SwitchmateEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Bus used when no host surface is attached; events only reach the log.
pub struct LogBus;

impl EventBus for LogBus {
   fn emit(&self, device: &DeviceId, event: SwitchmateEvent) {
      info!("{device}: {event:?}");
   }
}
