//! Device registry for Switchmate devices.
//!
//! The registry consumes discoveries from the scanner, builds a driver for
//! every configured device the first time it is seen, and keeps links of
//! connection-holding devices warm on later sightings.

use std::collections::{HashMap, HashSet};

use log::{debug, info, warn};
use tokio::{
   select,
   sync::{mpsc, oneshot},
};

use crate::{
   bluetooth::{radio::Advertisement, scanner::ScanEvent},
   config::KnownDevice,
   error::{Result, SwitchmateError},
   event::SwitchmateEvent,
   switchmate::{
      device::{Device, DeviceContext},
      protocol::{Channel, DeviceId},
      queue::Outcome,
      recognition::Recognized,
   },
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

enum RegistryCommand {
   // Internal events
   ConnectFinished(DeviceId),

   // User commands
   GetDevice(DeviceId, oneshot::Sender<Option<Device>>),
   AllDevices(oneshot::Sender<Vec<Device>>),
   CountDevices(oneshot::Sender<u32>),
}

/// Registry of discovered devices.
///
/// This type is cheaply cloneable.
#[derive(Clone)]
pub struct DeviceRegistry {
   inbox: mpsc::Sender<RegistryCommand>,
}

impl DeviceRegistry {
   pub fn new(
      ctx: DeviceContext,
      known: Vec<KnownDevice>,
      scan_rx: mpsc::Receiver<ScanEvent>,
   ) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(RegistryActor::new(ctx, known, command_rx, scan_rx).run());
      Self { inbox: command_tx }
   }

   pub async fn get_device(&self, id: &DeviceId) -> Result<Device> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(RegistryCommand::GetDevice(id.clone(), tx))
         .await
         .map_err(|_| SwitchmateError::ManagerShutdown)?;

      rx.await
         .ok()
         .flatten()
         .ok_or_else(|| SwitchmateError::DeviceNotFound(id.as_str().into()))
   }

   pub async fn all_devices(&self) -> Vec<Device> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(RegistryCommand::AllDevices(tx))
         .await
         .is_err()
      {
         return Vec::new();
      }
      rx.await.unwrap_or_default()
   }

   pub async fn count_devices(&self) -> u32 {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(RegistryCommand::CountDevices(tx))
         .await
         .is_err()
      {
         return 0;
      }
      rx.await.unwrap_or_default()
   }

   pub async fn set_state(&self, id: &DeviceId, channel: Option<Channel>, on: bool) -> Result<Outcome> {
      self.get_device(id).await?.set_state(channel, on).await
   }

   pub async fn connect(&self, id: &DeviceId) -> Result<()> {
      self.get_device(id).await?.connect().await
   }

   pub async fn disconnect(&self, id: &DeviceId) -> Result<()> {
      self.get_device(id).await?.disconnect().await;
      Ok(())
   }
}

// === Registry Actor ===

struct RegistryActor {
   ctx: DeviceContext,
   known: HashMap<DeviceId, KnownDevice>,
   command_rx: mpsc::Receiver<RegistryCommand>,
   scan_rx: mpsc::Receiver<ScanEvent>,
   loopback_rx: mpsc::Receiver<RegistryCommand>,
   loopback_tx: mpsc::Sender<RegistryCommand>,

   // State
   devices: HashMap<DeviceId, Device>,
   connecting: HashSet<DeviceId>, // Prevent duplicate background connects
}

impl RegistryActor {
   fn new(
      ctx: DeviceContext,
      known: Vec<KnownDevice>,
      command_rx: mpsc::Receiver<RegistryCommand>,
      scan_rx: mpsc::Receiver<ScanEvent>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         ctx,
         known: known.into_iter().map(|d| (d.id.clone(), d)).collect(),
         command_rx,
         scan_rx,
         loopback_rx,
         loopback_tx,
         devices: HashMap::new(),
         connecting: HashSet::new(),
      }
   }

   async fn run(mut self) {
      info!("Device registry starting up");
      loop {
         select! {
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("Device registry shutting down");
                  break;
               };
               self.handle_command(cmd);
            }
            Some(cmd) = self.loopback_rx.recv() => {
               self.handle_command(cmd);
            }
            Some(event) = self.scan_rx.recv() => {
               self.handle_scan_event(event);
            }
         }
      }

      for device in self.devices.values() {
         if device.is_connected() {
            device.disconnect().await;
         }
      }
   }

   fn handle_command(&mut self, cmd: RegistryCommand) {
      match cmd {
         RegistryCommand::ConnectFinished(id) => {
            self.connecting.remove(&id);
         },
         RegistryCommand::GetDevice(id, reply) => {
            let _ = reply.send(self.devices.get(&id).cloned());
         },
         RegistryCommand::AllDevices(reply) => {
            let mut devices: Vec<_> = self.devices.values().cloned().collect();
            devices.sort_by(|a, b| a.id().cmp(b.id()));
            let _ = reply.send(devices);
         },
         RegistryCommand::CountDevices(reply) => {
            let _ = reply.send(self.devices.len() as u32);
         },
      }
   }

   fn handle_scan_event(&mut self, event: ScanEvent) {
      match event {
         ScanEvent::Discovered {
            id,
            recognized,
            advertisement,
         } => self.handle_discovered(id, recognized, &advertisement),
         ScanEvent::Unreachable(id) => {
            warn!("{id} is unreachable");
            self.ctx.event_tx.emit(&id, SwitchmateEvent::Unreachable);
         },
      }
   }

   fn handle_discovered(&mut self, id: DeviceId, recognized: Recognized, adv: &Advertisement) {
      if let Some(device) = self.devices.get(&id) {
         debug!("Rediscovered {id} (rssi {:?})", adv.rssi);
         device.observe_advertisement(adv);
         let device = device.clone();
         self.keep_link(device);
         return;
      }

      let Some(config) = self.known.get(&id) else {
         warn!("Discovered a device that has not been configured yet ({id})");
         return;
      };
      let device = match Device::build(
         id.clone(),
         config.name.clone(),
         recognized,
         adv,
         config.auth_code.as_deref(),
         &self.ctx,
      ) {
         Ok(device) => device,
         Err(e) => {
            warn!("Failed to set up {id}: {e}");
            return;
         },
      };

      info!(
         "Found {} ({id}), a {} ({})",
         device.name(),
         recognized.kind,
         recognized.version
      );
      self.ctx.event_tx.emit(
         &id,
         SwitchmateEvent::Discovered {
            kind: recognized.kind,
            version: recognized.version,
         },
      );
      self.devices.insert(id, device.clone());
      self.keep_link(device);
   }

   /// Connects in the background, for devices that hold their link.
   fn keep_link(&mut self, device: Device) {
      if !device.keeps_link() || device.is_connected() {
         return;
      }
      let id = device.id().clone();
      if !self.connecting.insert(id.clone()) {
         return;
      }
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         if let Err(e) = device.connect().await {
            warn!("Background connect to {id} failed: {e}");
         }
         let _ = loopback.send(RegistryCommand::ConnectFinished(id)).await;
      });
   }
}
