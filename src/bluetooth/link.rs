//! Per-device GATT link management.
//!
//! A [`Link`] owns the connection to one peripheral: connect-and-setup
//! bounded by a timeout, subscription of the notify characteristics the
//! driver needs, fan-out of incoming notifications, and cleanup when the
//! link drops. Connected devices are excluded from discovery until they
//! disconnect.

use std::{
   sync::{
      Arc, Weak,
      atomic::{AtomicU64, Ordering},
   },
   time::Duration,
};

use crossbeam::atomic::AtomicCell;
use futures::StreamExt;
use log::{debug, info, warn};
use smallvec::SmallVec;
use tokio::{
   sync::{Mutex, broadcast},
   task::{JoinHandle, JoinSet},
   time,
};

use crate::{
   bluetooth::{
      radio::{GattChar, Packet, Peripheral},
      scanner::Scanner,
   },
   error::{Result, SwitchmateError},
   event::{EventSender, SwitchmateEvent},
   switchmate::protocol::{DeviceId, hex_short},
};

/// Maximum time for connect-and-setup
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Notification fan-out depth
const NOTIFY_BUFFER_SIZE: usize = 64;

/// Connection lifecycle of a single device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
   NotConnected,
   Connecting,
   Setup,
   Ready,
}

/// A notification received on a subscribed characteristic.
pub type Notification = (GattChar, Packet);

/// Live resources of an established connection.
struct ConnectionState {
   generation: u64,
   jset: JoinSet<()>,
   watcher: Option<JoinHandle<()>>,
}

impl Drop for ConnectionState {
   fn drop(&mut self) {
      self.jset.abort_all();
      if let Some(watcher) = self.watcher.take() {
         watcher.abort();
      }
   }
}

struct LinkInner {
   peripheral: Arc<dyn Peripheral>,
   scanner: Scanner,
   event_tx: EventSender,
   subscriptions: SmallVec<[GattChar; 2]>,
   state: AtomicCell<LinkState>,
   connect_lock: Mutex<()>,
   conn: parking_lot::Mutex<Option<ConnectionState>>,
   generation: AtomicU64,
   notify_tx: broadcast::Sender<Notification>,
}

/// Connection manager for one device.
///
/// This type is cheaply cloneable.
#[derive(Clone)]
pub struct Link(Arc<LinkInner>);

impl Link {
   pub fn new(
      peripheral: Arc<dyn Peripheral>,
      scanner: Scanner,
      event_tx: EventSender,
      subscriptions: &[GattChar],
   ) -> Self {
      let (notify_tx, _) = broadcast::channel(NOTIFY_BUFFER_SIZE);
      Self(Arc::new(LinkInner {
         peripheral,
         scanner,
         event_tx,
         subscriptions: SmallVec::from_slice(subscriptions),
         state: AtomicCell::new(LinkState::NotConnected),
         connect_lock: Mutex::new(()),
         conn: parking_lot::Mutex::new(None),
         generation: AtomicU64::new(0),
         notify_tx,
      }))
   }

   pub fn id(&self) -> &DeviceId {
      self.0.peripheral.id()
   }

   pub fn state(&self) -> LinkState {
      self.0.state.load()
   }

   pub fn is_ready(&self) -> bool {
      self.state() == LinkState::Ready
   }

   /// Receives every notification of the subscribed characteristics,
   /// across reconnects.
   pub fn notifications(&self) -> broadcast::Receiver<Notification> {
      self.0.notify_tx.subscribe()
   }

   /// Connects and subscribes unless the link is already up.
   ///
   /// Returns `true` when this call established a new connection.
   pub async fn connect(&self) -> Result<bool> {
      if self.is_ready() {
         return Ok(false);
      }
      let _guard = self.0.connect_lock.lock().await;
      if self.is_ready() {
         return Ok(false);
      }

      let id = self.id().clone();
      info!("Connecting to {id}");
      self.0.state.store(LinkState::Connecting);

      let conn = match time::timeout(CONNECT_TIMEOUT, self.establish()).await {
         Ok(Ok(conn)) => conn,
         Ok(Err(e)) => {
            warn!("Failed to connect to {id}: {e}");
            self.abort_setup().await;
            return Err(e);
         },
         Err(_) => {
            warn!("Connection to {id} timed out");
            self.abort_setup().await;
            return Err(SwitchmateError::ConnectTimeout);
         },
      };

      *self.0.conn.lock() = Some(conn);
      self.0.state.store(LinkState::Ready);
      self.0.scanner.exclude(&id, "Connected").await;
      info!("Connected to {id}");
      self.0.event_tx.emit(&id, SwitchmateEvent::Connected);
      Ok(true)
   }

   async fn establish(&self) -> Result<ConnectionState> {
      let peripheral = &self.0.peripheral;
      peripheral.connect_and_setup().await?;
      self.0.state.store(LinkState::Setup);

      let mut jset = JoinSet::new();
      for &ch in &self.0.subscriptions {
         if !peripheral.has_characteristic(ch).await {
            return Err(SwitchmateError::CharacteristicMissing(
               ch.characteristic.to_string().into(),
            ));
         }
         let mut stream = peripheral.subscribe(ch).await?;
         let tx = self.0.notify_tx.clone();
         let id = self.id().clone();
         jset.spawn(async move {
            while let Some(data) = stream.next().await {
               debug!("← {id}: {}", hex_short(&data));
               let _ = tx.send((ch, data));
            }
         });
      }

      let generation = self.0.generation.fetch_add(1, Ordering::Relaxed) + 1;
      let weak = Arc::downgrade(&self.0);
      let watched = peripheral.clone();
      let watcher = tokio::spawn(async move {
         watched.wait_disconnected().await;
         if let Some(inner) = Weak::upgrade(&weak) {
            Link(inner).release(Some(generation)).await;
         }
      });

      Ok(ConnectionState {
         generation,
         jset,
         watcher: Some(watcher),
      })
   }

   async fn abort_setup(&self) {
      self.0.state.store(LinkState::NotConnected);
      if let Err(e) = self.0.peripheral.disconnect().await {
         debug!("Disconnect after failed setup of {}: {e}", self.id());
      }
   }

   /// Tears down the connection state. With a generation, only the matching
   /// connection is released.
   async fn release(&self, generation: Option<u64>) -> bool {
      let conn = {
         let mut lock = self.0.conn.lock();
         match (lock.as_ref(), generation) {
            (Some(c), Some(g)) if c.generation != g => None,
            _ => lock.take(),
         }
      };
      let Some(mut conn) = conn else {
         return false;
      };
      if generation.is_some() {
         // Released from the watcher itself.
         conn.watcher.take();
      }
      drop(conn);

      let id = self.id().clone();
      self.0.state.store(LinkState::NotConnected);
      info!("Disconnected from {id}");
      self.0.scanner.unexclude(&id).await;
      self.0.event_tx.emit(&id, SwitchmateEvent::Disconnected);
      true
   }

   /// Drops the connection, if any.
   pub async fn disconnect(&self) {
      // Release first so the watcher cannot report the drop a second time.
      self.release(None).await;
      if let Err(e) = self.0.peripheral.disconnect().await {
         warn!("Failed to disconnect {}: {e}", self.id());
      }
   }

   pub async fn write(&self, ch: GattChar, data: &[u8]) -> Result<()> {
      if !self.is_ready() {
         return Err(SwitchmateError::NotConnected);
      }
      debug!("→ {}: {}", self.id(), hex_short(data));
      self.0.peripheral.write(ch, data).await
   }

   pub async fn read(&self, ch: GattChar) -> Result<Packet> {
      if !self.is_ready() {
         return Err(SwitchmateError::NotConnected);
      }
      let data = self.0.peripheral.read(ch).await?;
      debug!("← {}: {}", self.id(), hex_short(&data));
      Ok(data)
   }

   /// Writes `payload` and waits for the next notification on `notify`.
   ///
   /// The write and the wait share one deadline; on expiry `timeout_err` is
   /// returned.
   pub async fn exchange(
      &self,
      write: GattChar,
      notify: GattChar,
      payload: &[u8],
      deadline: Duration,
      timeout_err: SwitchmateError,
   ) -> Result<Packet> {
      // Subscribe before writing so a fast reply is not missed.
      let rx = self.notifications();
      time::timeout(deadline, self.write_and_wait(rx, write, notify, payload))
         .await
         .map_err(|_| timeout_err)?
   }

   async fn write_and_wait(
      &self,
      mut rx: broadcast::Receiver<Notification>,
      write: GattChar,
      notify: GattChar,
      payload: &[u8],
   ) -> Result<Packet> {
      self.write(write, payload).await?;
      self.next_notification(&mut rx, notify).await
   }

   /// Waits for the next notification on `ch` from a receiver taken before
   /// the write that triggers it.
   pub async fn next_notification(
      &self,
      rx: &mut broadcast::Receiver<Notification>,
      ch: GattChar,
   ) -> Result<Packet> {
      loop {
         match rx.recv().await {
            Ok((from, data)) if from == ch => return Ok(data),
            Ok(_) => {},
            Err(broadcast::error::RecvError::Lagged(n)) => {
               warn!("{}: dropped {n} notifications", self.id());
            },
            Err(broadcast::error::RecvError::Closed) => {
               return Err(SwitchmateError::NotConnected);
            },
         }
      }
   }
}
