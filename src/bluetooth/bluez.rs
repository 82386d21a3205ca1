//! BlueZ backend for the radio seam.
//!
//! Discovery runs through `bluer`'s device discovery session, which keeps
//! the adapter scanning for as long as the stream is held. Advertisement
//! contents are read back from the device properties BlueZ caches.

use std::{
   collections::{HashMap, HashSet},
   sync::Arc,
   time::Duration,
};

use async_trait::async_trait;
use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, DeviceEvent, DeviceProperty, DiscoveryFilter,
   DiscoveryTransport, Session, gatt::remote::Characteristic,
};
use futures::{StreamExt, stream};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle, time};
use uuid::Uuid;

use crate::{
   bluetooth::radio::{
      Advertisement, GattChar, Notifications, Packet, Peripheral, Radio, RadioEvent, RadioEvents,
   },
   error::{Result, SwitchmateError},
   switchmate::protocol::DeviceId,
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;
/// Poll interval while waiting for service resolution
const SERVICES_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Radio backed by the system's default BlueZ adapter.
pub struct BluezRadio {
   adapter: Adapter,
   events_tx: mpsc::Sender<RadioEvent>,
   events_rx: Mutex<Option<mpsc::Receiver<RadioEvent>>>,
   discovery: Mutex<Option<JoinHandle<()>>>,
   monitor: JoinHandle<()>,
}

impl Drop for BluezRadio {
   fn drop(&mut self) {
      self.monitor.abort();
      if let Some(task) = self.discovery.get_mut().take() {
         task.abort();
      }
   }
}

impl BluezRadio {
   pub async fn new() -> Result<Arc<Self>> {
      let session = Session::new().await?;
      let adapter = session
         .default_adapter()
         .await
         .map_err(|_| SwitchmateError::AdapterNotFound)?;
      let name = adapter.name().to_string();
      info!("Using adapter {name}");

      if !adapter.is_powered().await? {
         adapter.set_powered(true).await?;
         info!("Powered on adapter: {name}");
      }

      let (events_tx, events_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let monitor = Self::start_adapter_monitor(adapter.clone(), events_tx.clone());
      Ok(Arc::new(Self {
         adapter,
         events_tx,
         events_rx: Mutex::new(Some(events_rx)),
         discovery: Mutex::new(None),
         monitor,
      }))
   }

   /// Forwards the adapter's discovering flag, which flips on its own when
   /// the controller ends a scan.
   fn start_adapter_monitor(adapter: Adapter, tx: mpsc::Sender<RadioEvent>) -> JoinHandle<()> {
      tokio::spawn(async move {
         let mut events = match adapter.events().await {
            Ok(events) => Box::pin(events),
            Err(e) => {
               warn!("Failed to get adapter events: {e}");
               return;
            },
         };
         while let Some(event) = events.next().await {
            if let AdapterEvent::PropertyChanged(AdapterProperty::Discovering(on)) = event {
               debug!("Adapter discovering: {on}");
               if let Err(e) = tx.send(RadioEvent::ScanEnabled(on)).await {
                  warn!("Channel overflow sending scan state: {e}");
               }
            }
         }
         warn!("Adapter {} went away", adapter.name());
      })
   }

   async fn advertisement(adapter: &Adapter, addr: Address) -> Result<Advertisement> {
      let device = adapter.device(addr)?;
      let manufacturer_data = device
         .manufacturer_data()
         .await?
         .and_then(|data| data.into_iter().min_by_key(|(company, _)| *company))
         .map(|(company, data)| {
            let mut raw = company.to_le_bytes().to_vec();
            raw.extend(data);
            raw
         });
      Ok(Advertisement {
         id: Some(DeviceId::from_address(addr)),
         service_uuids: device.uuids().await?.unwrap_or_default().into_iter().collect(),
         manufacturer_data,
         service_data: device.service_data().await?.unwrap_or_default(),
         rssi: device.rssi().await?,
      })
   }
}

#[async_trait]
impl Radio for BluezRadio {
   async fn start_scan(&self, services: &[Uuid]) -> Result<()> {
      let filter = DiscoveryFilter {
         uuids: services.iter().copied().collect::<HashSet<_>>(),
         transport: DiscoveryTransport::Le,
         duplicate_data: true,
         ..Default::default()
      };
      self.adapter.set_discovery_filter(filter).await?;

      let discovered = self.adapter.discover_devices_with_changes().await?;
      let adapter = self.adapter.clone();
      let tx = self.events_tx.clone();
      let task = tokio::spawn(async move {
         let mut discovered = Box::pin(discovered);
         while let Some(event) = discovered.next().await {
            let AdapterEvent::DeviceAdded(addr) = event else {
               continue;
            };
            match Self::advertisement(&adapter, addr).await {
               Ok(adv) => {
                  if let Err(e) = tx.send(RadioEvent::Advertisement(adv)).await {
                     warn!("Channel overflow sending advertisement: {e}");
                  }
               },
               Err(e) => debug!("Failed to read advertisement of {addr}: {e}"),
            }
         }
      });
      if let Some(previous) = self.discovery.lock().replace(task) {
         previous.abort();
      }
      Ok(())
   }

   async fn stop_scan(&self) -> Result<()> {
      // Dropping the discovery stream ends the session.
      if let Some(task) = self.discovery.lock().take() {
         task.abort();
      }
      Ok(())
   }

   async fn events(&self) -> Result<RadioEvents> {
      let rx = self
         .events_rx
         .lock()
         .take()
         .ok_or(SwitchmateError::AdapterNotFound)?;
      Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|e| (e, rx)) }).boxed())
   }

   fn peripheral(&self, id: &DeviceId) -> Result<Arc<dyn Peripheral>> {
      let device = self.adapter.device(id.address())?;
      Ok(Arc::new(BluezPeripheral {
         id: id.clone(),
         device,
         characteristics: Mutex::new(HashMap::new()),
      }))
   }
}

/// GATT client for one remote device.
pub struct BluezPeripheral {
   id: DeviceId,
   device: bluer::Device,
   characteristics: Mutex<HashMap<GattChar, Characteristic>>,
}

impl BluezPeripheral {
   async fn wait_services_resolved(&self) -> Result<()> {
      while !self.device.is_services_resolved().await? {
         time::sleep(SERVICES_POLL_INTERVAL).await;
      }
      Ok(())
   }

   async fn resolve_characteristics(&self) -> Result<()> {
      let mut found = HashMap::new();
      for service in self.device.services().await? {
         let service_uuid = service.uuid().await?;
         for ch in service.characteristics().await? {
            found.insert(GattChar::new(service_uuid, ch.uuid().await?), ch);
         }
      }
      debug!("{}: resolved {} characteristics", self.id, found.len());
      *self.characteristics.lock() = found;
      Ok(())
   }

   fn characteristic(&self, ch: GattChar) -> Result<Characteristic> {
      self
         .characteristics
         .lock()
         .get(&ch)
         .cloned()
         .ok_or_else(|| SwitchmateError::CharacteristicMissing(ch.characteristic.to_string().into()))
   }
}

#[async_trait]
impl Peripheral for BluezPeripheral {
   fn id(&self) -> &DeviceId {
      &self.id
   }

   async fn connect_and_setup(&self) -> Result<()> {
      if !self.device.is_connected().await? {
         self.device.connect().await?;
      }
      self.wait_services_resolved().await?;
      self.resolve_characteristics().await
   }

   async fn disconnect(&self) -> Result<()> {
      self.characteristics.lock().clear();
      if self.device.is_connected().await? {
         self.device.disconnect().await?;
      }
      Ok(())
   }

   async fn is_connected(&self) -> bool {
      self.device.is_connected().await.unwrap_or(false)
   }

   async fn has_characteristic(&self, ch: GattChar) -> bool {
      self.characteristics.lock().contains_key(&ch)
   }

   async fn subscribe(&self, ch: GattChar) -> Result<Notifications> {
      let notify = self.characteristic(ch)?.notify().await?;
      Ok(notify.map(Packet::from_vec).boxed())
   }

   async fn write(&self, ch: GattChar, data: &[u8]) -> Result<()> {
      self.characteristic(ch)?.write(data).await?;
      Ok(())
   }

   async fn read(&self, ch: GattChar) -> Result<Packet> {
      let data = self.characteristic(ch)?.read().await?;
      Ok(Packet::from_vec(data))
   }

   async fn wait_disconnected(&self) {
      let mut events = match self.device.events().await {
         Ok(events) => Box::pin(events),
         Err(e) => {
            warn!("Failed to watch {}, polling instead: {e}", self.id);
            while self.is_connected().await {
               time::sleep(Duration::from_secs(1)).await;
            }
            return;
         },
      };
      if !self.is_connected().await {
         return;
      }
      while let Some(event) = events.next().await {
         if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            debug!("{}: link dropped", self.id);
            return;
         }
      }
   }
}
