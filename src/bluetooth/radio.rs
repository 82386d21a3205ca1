//! Transport seam between the device engine and the Bluetooth stack.
//!
//! The engine only needs a stream of advertisements, a scan-enable signal,
//! and GATT connect/read/write/notify primitives. [`Radio`] and
//! [`Peripheral`] capture exactly that, so the BlueZ backend and the
//! in-memory test radio are interchangeable.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use futures::stream::BoxStream;
use smallvec::SmallVec;
use uuid::Uuid;

use crate::{error::Result, switchmate::protocol::DeviceId};

/// A GATT payload as received from or sent to a peripheral.
pub type Packet = SmallVec<[u8; 20]>;

/// Address of a characteristic: the owning service and the characteristic itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattChar {
   pub service: Uuid,
   pub characteristic: Uuid,
}

impl GattChar {
   pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
      Self {
         service,
         characteristic,
      }
   }
}

impl fmt::Display for GattChar {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}/{}", self.service, self.characteristic)
   }
}

/// One received advertisement, reduced to the fields the engine inspects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
   pub id: Option<DeviceId>,
   pub service_uuids: Vec<Uuid>,
   /// Raw manufacturer data including the leading little-endian company id.
   pub manufacturer_data: Option<Vec<u8>>,
   pub service_data: HashMap<Uuid, Vec<u8>>,
   pub rssi: Option<i16>,
}

/// Events delivered by the radio while it is alive.
#[derive(Debug, Clone)]
pub enum RadioEvent {
   Advertisement(Advertisement),
   /// The controller's scan-enable state flipped, possibly on its own.
   ScanEnabled(bool),
}

pub type RadioEvents = BoxStream<'static, RadioEvent>;
pub type Notifications = BoxStream<'static, Packet>;

/// Process-wide radio owned by the scan controller.
#[async_trait]
pub trait Radio: Send + Sync + 'static {
   /// Starts scanning; an empty slice means no service filter.
   async fn start_scan(&self, services: &[Uuid]) -> Result<()>;

   async fn stop_scan(&self) -> Result<()>;

   /// Takes the event stream. Only the first call returns events.
   async fn events(&self) -> Result<RadioEvents>;

   /// Returns a handle to the peripheral with the given id.
   fn peripheral(&self, id: &DeviceId) -> Result<Arc<dyn Peripheral>>;
}

/// GATT access to one peripheral.
#[async_trait]
pub trait Peripheral: Send + Sync + 'static {
   fn id(&self) -> &DeviceId;

   /// Connects and resolves services and characteristics.
   async fn connect_and_setup(&self) -> Result<()>;

   async fn disconnect(&self) -> Result<()>;

   async fn is_connected(&self) -> bool;

   /// Whether setup discovered the characteristic.
   async fn has_characteristic(&self, ch: GattChar) -> bool;

   async fn subscribe(&self, ch: GattChar) -> Result<Notifications>;

   async fn write(&self, ch: GattChar, data: &[u8]) -> Result<()>;

   async fn read(&self, ch: GattChar) -> Result<Packet>;

   /// Resolves once the link drops.
   async fn wait_disconnected(&self);
}
