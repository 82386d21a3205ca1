//! Switchmate D-Bus Service
//!
//! This service discovers Switchmate BLE light switches and outlets, keeps
//! their live state, and exposes control over a D-Bus interface.
//!
//! Usage: `switchmated [run]`, `switchmated find`, `switchmated pair <id>`.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{
   signal,
   sync::{Notify, mpsc},
   time,
};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::{
   bluez::BluezRadio,
   manager::DeviceRegistry,
   radio::Radio,
   scanner::{ScanEvent, ScanTiming, Scanner, Targets},
};
use dbus::{MANAGER_PATH, SwitchmateService};
use event::{EventBus, EventSender, LogBus, SwitchmateEvent};
use switchmate::{
   device::DeviceContext,
   pairing::{self, PairingResult},
   protocol::DeviceId,
};

mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod switchmate;

use crate::{dbus::SwitchmateServiceSignals, error::Result};

/// How long `find` listens before exiting
const FIND_DURATION: Duration = Duration::from_secs(30);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   let args: Vec<String> = std::env::args().skip(1).collect();
   match args.first().map(String::as_str) {
      None | Some("run") => run().await,
      Some("find") => find().await,
      Some("pair") => match args.get(1) {
         Some(id) => pair(id.parse()?).await,
         None => {
            eprintln!("usage: switchmated pair <id>");
            Ok(())
         },
      },
      Some(other) => {
         eprintln!("unknown command: {other}");
         eprintln!("usage: switchmated [run | find | pair <id>]");
         Ok(())
      },
   }
}

async fn run() -> Result<()> {
   info!("Starting Switchmate service...");

   // Load configuration
   let config = config::Config::load()?;
   let known = config.known_devices();
   info!("Loaded configuration with {} known devices", known.len());

   let radio: Arc<dyn Radio> = BluezRadio::new().await?;

   let mut timing = ScanTiming::default();
   timing.set_gap_secs(config.scan_gap_sec);
   timing.set_timeout_secs(config.scan_timeout_sec);
   let (scan_tx, scan_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
   let scanner = Scanner::new(radio.clone(), timing, scan_tx).await?;

   let event_bus = config.dbus.then(EventProcessor::new);
   let event_tx: EventSender = match &event_bus {
      Some(processor) => processor.clone() as EventSender,
      None => Arc::new(LogBus),
   };

   let ctx = DeviceContext {
      radio,
      scanner: scanner.clone(),
      event_tx,
      battery_refresh: config.battery_refresh(),
   };
   let ids: Vec<DeviceId> = known.iter().map(|d| d.id.clone()).collect();
   let registry = DeviceRegistry::new(ctx, known, scan_rx);

   // Held until shutdown so the service stays on the bus
   let _connection = match event_bus {
      Some(processor) => {
         let connection = connection::Builder::session()?
            .name("org.switchmate")?
            .serve_at(MANAGER_PATH, SwitchmateService::new(registry.clone()))?
            .build()
            .await?;
         info!("Switchmate D-Bus service started at org.switchmate");

         processor.spawn_dispatcher(connection.clone()).await?;
         Some(connection)
      },
      None => None,
   };

   if ids.is_empty() {
      warn!("No devices configured; run `switchmated find` and add ids to the config");
   } else {
      scanner.start(None, Targets::Only(ids)).await;
   }

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down Switchmate service...");
   scanner.stop(false).await;

   Ok(())
}

/// Lists every recognized device in range.
async fn find() -> Result<()> {
   let radio: Arc<dyn Radio> = BluezRadio::new().await?;
   let (tx, mut rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
   let scanner = Scanner::new(radio, ScanTiming::default(), tx).await?;
   scanner.start(None, Targets::Unrestricted).await;
   info!("Scanning for {}s...", FIND_DURATION.as_secs());

   let deadline = time::Instant::now() + FIND_DURATION;
   while let Ok(Some(event)) = time::timeout_at(deadline, rx.recv()).await {
      if let ScanEvent::Discovered {
         id,
         recognized,
         advertisement,
      } = event
      {
         let rssi = advertisement
            .rssi
            .map_or_else(|| "-".to_string(), |r| format!("{r} dBm"));
         println!("{id}  {}  {}  {rssi}", recognized.kind, recognized.version);
      }
   }

   scanner.stop(false).await;
   Ok(())
}

/// Obtains and stores the auth code of a legacy switch.
async fn pair(id: DeviceId) -> Result<()> {
   let radio: Arc<dyn Radio> = BluezRadio::new().await?;
   match pairing::pair(radio, id.clone(), Arc::new(LogBus)).await? {
      PairingResult::AuthCode(code) => {
         println!("{id}: auth code {code}");
         let mut config = config::Config::load()?;
         config.set_auth_code(&id, code);
         config.save()?;
         info!("Saved auth code for {id}");
      },
      PairingResult::NotRequired(recognized) => {
         println!(
            "{id}: {} {} needs no pairing",
            recognized.kind, recognized.version
         );
      },
   }
   Ok(())
}

struct EventProcessor {
   queue: SegQueue<(DeviceId, SwitchmateEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<(DeviceId, SwitchmateEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<SwitchmateService>,
      (device, event): (DeviceId, SwitchmateEvent),
   ) -> Result<()> {
      let id = device.as_str();
      let discovered = matches!(event, SwitchmateEvent::Discovered { .. });
      match event {
         SwitchmateEvent::Discovered { kind, version } => {
            let kind: &'static str = kind.into();
            iface.device_discovered(id, kind, version.number()).await?;
         },
         SwitchmateEvent::StateChanged { channel, on } => {
            iface
               .state_changed(id, dbus::channel_code(channel), on)
               .await?;
         },
         SwitchmateEvent::LightChanged(on) => {
            iface.light_changed(id, on).await?;
         },
         SwitchmateEvent::BatteryUpdated(level) => {
            iface.battery_updated(id, level).await?;
         },
         SwitchmateEvent::Unreachable => {
            iface.device_unreachable(id).await?;
         },
         SwitchmateEvent::Connected => {
            iface.device_connected(id).await?;
         },
         SwitchmateEvent::Disconnected => {
            iface.device_disconnected(id).await?;
         },
      }
      if discovered {
         iface
            .get()
            .await
            .device_count_changed(iface.signal_emitter())
            .await?;
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, SwitchmateService>(MANAGER_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, device: &DeviceId, event: SwitchmateEvent) {
      self.queue.push((device.clone(), event));
      self.notifier.notify_waiters();
   }
}
