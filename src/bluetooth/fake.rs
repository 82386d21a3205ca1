//! Scripted in-memory radio for exercising the engine without hardware.

use std::{
   collections::{HashMap, HashSet},
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicUsize, Ordering},
   },
   time::Duration,
};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use tokio::{
   sync::{Notify, mpsc},
   time,
};
use uuid::Uuid;

use crate::{
   bluetooth::radio::{
      Advertisement, GattChar, Notifications, Packet, Peripheral, Radio, RadioEvent, RadioEvents,
   },
   error::{Result, SwitchmateError},
   switchmate::protocol::{DeviceId, SERVICE_V1, SERVICE_V3},
};

pub type Responder = Box<dyn FnMut(GattChar, &[u8]) -> Vec<(GattChar, Vec<u8>)> + Send>;

pub fn device_id(s: &str) -> DeviceId {
   s.parse().expect("valid test id")
}

/// v3 single-relay switch advertisement.
pub fn switch_advertisement(id: &DeviceId, on: bool) -> Advertisement {
   Advertisement {
      id: Some(id.clone()),
      service_uuids: vec![SERVICE_V3],
      manufacturer_data: Some(vec![u8::from(on), 0x00, 0x00, 0x00]),
      ..Default::default()
   }
}

pub fn outlet_advertisement(id: &DeviceId, first: bool, second: bool) -> Advertisement {
   Advertisement {
      id: Some(id.clone()),
      service_uuids: vec![SERVICE_V3],
      manufacturer_data: Some(vec![u8::from(first), 0, 0, 0, u8::from(second), 0, 0, 0]),
      ..Default::default()
   }
}

pub fn legacy_advertisement(id: &DeviceId, on: bool) -> Advertisement {
   let mut adv = Advertisement {
      id: Some(id.clone()),
      service_uuids: vec![SERVICE_V1],
      ..Default::default()
   };
   adv.service_data
      .insert(SERVICE_V1, vec![0x00, 0x00, 0x00, 0x00, u8::from(on)]);
   adv
}

#[derive(Default)]
pub struct FakeRadio {
   scans: Mutex<Vec<Vec<Uuid>>>,
   stops: AtomicUsize,
   events_tx: Mutex<Option<mpsc::UnboundedSender<RadioEvent>>>,
   events_rx: Mutex<Option<mpsc::UnboundedReceiver<RadioEvent>>>,
   peripherals: Mutex<HashMap<DeviceId, Arc<FakePeripheral>>>,
}

impl FakeRadio {
   pub fn new() -> Arc<Self> {
      let (tx, rx) = mpsc::unbounded_channel();
      Arc::new(Self {
         events_tx: Mutex::new(Some(tx)),
         events_rx: Mutex::new(Some(rx)),
         ..Default::default()
      })
   }

   pub fn push(&self, event: RadioEvent) {
      if let Some(tx) = self.events_tx.lock().as_ref() {
         let _ = tx.send(event);
      }
   }

   pub fn advertise(&self, adv: Advertisement) {
      self.push(RadioEvent::Advertisement(adv));
   }

   pub fn scan_starts(&self) -> usize {
      self.scans.lock().len()
   }

   pub fn last_scan_services(&self) -> Option<Vec<Uuid>> {
      self.scans.lock().last().cloned()
   }

   pub fn scan_stops(&self) -> usize {
      self.stops.load(Ordering::SeqCst)
   }

   pub fn add_peripheral(&self, peripheral: Arc<FakePeripheral>) {
      self
         .peripherals
         .lock()
         .insert(peripheral.id.clone(), peripheral);
   }
}

#[async_trait]
impl Radio for FakeRadio {
   async fn start_scan(&self, services: &[Uuid]) -> Result<()> {
      self.scans.lock().push(services.to_vec());
      Ok(())
   }

   async fn stop_scan(&self) -> Result<()> {
      self.stops.fetch_add(1, Ordering::SeqCst);
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
      let peripheral = self
         .peripherals
         .lock()
         .entry(id.clone())
         .or_insert_with(|| FakePeripheral::new(id.clone(), []))
         .clone();
      Ok(peripheral)
   }
}

pub struct FakePeripheral {
   id: DeviceId,
   connected: AtomicBool,
   hang_on_connect: AtomicBool,
   connects: AtomicUsize,
   disconnects: AtomicUsize,
   write_delay: Mutex<Duration>,
   in_flight: AtomicUsize,
   max_in_flight: AtomicUsize,
   characteristics: Mutex<HashSet<GattChar>>,
   reads: Mutex<HashMap<GattChar, Vec<u8>>>,
   writes: Mutex<Vec<(GattChar, Vec<u8>)>>,
   responder: Mutex<Option<Responder>>,
   subscribers: Mutex<HashMap<GattChar, Vec<mpsc::UnboundedSender<Packet>>>>,
   link_dropped: Notify,
}

impl FakePeripheral {
   pub fn new(id: DeviceId, characteristics: impl IntoIterator<Item = GattChar>) -> Arc<Self> {
      Arc::new(Self {
         id,
         connected: AtomicBool::new(false),
         hang_on_connect: AtomicBool::new(false),
         connects: AtomicUsize::new(0),
         disconnects: AtomicUsize::new(0),
         write_delay: Mutex::new(Duration::ZERO),
         in_flight: AtomicUsize::new(0),
         max_in_flight: AtomicUsize::new(0),
         characteristics: Mutex::new(characteristics.into_iter().collect()),
         reads: Mutex::new(HashMap::new()),
         writes: Mutex::new(Vec::new()),
         responder: Mutex::new(None),
         subscribers: Mutex::new(HashMap::new()),
         link_dropped: Notify::new(),
      })
   }

   pub fn hang_on_connect(&self, hang: bool) {
      self.hang_on_connect.store(hang, Ordering::SeqCst);
   }

   pub fn set_write_delay(&self, delay: Duration) {
      *self.write_delay.lock() = delay;
   }

   pub fn set_read(&self, ch: GattChar, data: &[u8]) {
      self.reads.lock().insert(ch, data.to_vec());
   }

   pub fn respond_with<F>(&self, f: F)
   where
      F: FnMut(GattChar, &[u8]) -> Vec<(GattChar, Vec<u8>)> + Send + 'static,
   {
      *self.responder.lock() = Some(Box::new(f));
   }

   /// Pushes an unsolicited notification, as a physical button press would.
   pub fn notify(&self, ch: GattChar, data: &[u8]) {
      if let Some(subs) = self.subscribers.lock().get_mut(&ch) {
         subs.retain(|tx| tx.send(Packet::from_slice(data)).is_ok());
      }
   }

   /// Simulates the link dropping without a local disconnect request.
   pub fn drop_link(&self) {
      self.connected.store(false, Ordering::SeqCst);
      self.subscribers.lock().clear();
      self.link_dropped.notify_waiters();
   }

   pub fn writes(&self) -> Vec<(GattChar, Vec<u8>)> {
      self.writes.lock().clone()
   }

   pub fn connects(&self) -> usize {
      self.connects.load(Ordering::SeqCst)
   }

   pub fn disconnects(&self) -> usize {
      self.disconnects.load(Ordering::SeqCst)
   }

   pub fn max_in_flight(&self) -> usize {
      self.max_in_flight.load(Ordering::SeqCst)
   }
}

#[async_trait]
impl Peripheral for FakePeripheral {
   fn id(&self) -> &DeviceId {
      &self.id
   }

   async fn connect_and_setup(&self) -> Result<()> {
      self.connects.fetch_add(1, Ordering::SeqCst);
      if self.hang_on_connect.load(Ordering::SeqCst) {
         std::future::pending::<()>().await;
      }
      self.connected.store(true, Ordering::SeqCst);
      Ok(())
   }

   async fn disconnect(&self) -> Result<()> {
      self.disconnects.fetch_add(1, Ordering::SeqCst);
      self.drop_link();
      Ok(())
   }

   async fn is_connected(&self) -> bool {
      self.connected.load(Ordering::SeqCst)
   }

   async fn has_characteristic(&self, ch: GattChar) -> bool {
      self.characteristics.lock().contains(&ch)
   }

   async fn subscribe(&self, ch: GattChar) -> Result<Notifications> {
      if !self.has_characteristic(ch).await {
         return Err(SwitchmateError::CharacteristicMissing(ch.to_string().into()));
      }
      let (tx, rx) = mpsc::unbounded_channel();
      self.subscribers.lock().entry(ch).or_default().push(tx);
      Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|p| (p, rx)) }).boxed())
   }

   async fn write(&self, ch: GattChar, data: &[u8]) -> Result<()> {
      if !self.connected.load(Ordering::SeqCst) {
         return Err(SwitchmateError::NotConnected);
      }
      let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
      self.max_in_flight.fetch_max(now, Ordering::SeqCst);

      let delay = *self.write_delay.lock();
      if !delay.is_zero() {
         time::sleep(delay).await;
      }
      self.writes.lock().push((ch, data.to_vec()));
      let replies = self
         .responder
         .lock()
         .as_mut()
         .map(|f| f(ch, data))
         .unwrap_or_default();

      self.in_flight.fetch_sub(1, Ordering::SeqCst);
      for (ch, reply) in replies {
         self.notify(ch, &reply);
      }
      Ok(())
   }

   async fn read(&self, ch: GattChar) -> Result<Packet> {
      self
         .reads
         .lock()
         .get(&ch)
         .map(|d| Packet::from_slice(d))
         .ok_or_else(|| SwitchmateError::CharacteristicMissing(ch.to_string().into()))
   }

   async fn wait_disconnected(&self) {
      loop {
         let notified = self.link_dropped.notified();
         if !self.connected.load(Ordering::SeqCst) {
            return;
         }
         notified.await;
      }
   }
}
