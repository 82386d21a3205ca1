use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   bluetooth::manager::DeviceRegistry,
   error::SwitchmateError,
   switchmate::{
      protocol::{Channel, DeviceId},
      queue::Outcome,
   },
};

/// Object path the manager interface is served at.
pub const MANAGER_PATH: &str = "/org/switchmate/manager";

pub struct SwitchmateService {
   registry: DeviceRegistry,
}

impl SwitchmateService {
   pub const fn new(registry: DeviceRegistry) -> Self {
      Self { registry }
   }
}

fn parse_id(id: &str) -> zbus::fdo::Result<DeviceId> {
   id.parse()
      .map_err(|e: SwitchmateError| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

/// `-1` addresses a plain switch, `0..=2` an outlet sub-control.
fn parse_channel(channel: i32) -> zbus::fdo::Result<Option<Channel>> {
   if channel == -1 {
      return Ok(None);
   }
   u8::try_from(channel)
      .ok()
      .and_then(Channel::from_repr)
      .map(Some)
      .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("Invalid channel: {channel}")))
}

pub fn channel_code(channel: Option<Channel>) -> i32 {
   channel.map_or(-1, |c| i32::from(c.index()))
}

fn failed(e: SwitchmateError) -> zbus::fdo::Error {
   match e {
      SwitchmateError::DeviceNotFound(_)
      | SwitchmateError::InvalidDeviceId(_)
      | SwitchmateError::UnsupportedChannel(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
      _ => zbus::fdo::Error::Failed(e.to_string()),
   }
}

#[interface(name = "org.switchmate.Manager")]
impl SwitchmateService {
   async fn get_devices(&self) -> zbus::fdo::Result<String> {
      let states: Vec<serde_json::Value> = self
         .registry
         .all_devices()
         .await
         .iter()
         .map(|d| d.to_json())
         .collect();
      serde_json::to_string(&states).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   async fn get_device(&self, id: String) -> zbus::fdo::Result<String> {
      let id = parse_id(&id)?;
      let dev = self.registry.get_device(&id).await.map_err(failed)?;
      Ok(dev.to_json().to_string())
   }

   /// Returns false when a newer request replaced this one before it ran.
   async fn set_state(&self, id: String, channel: i32, on: bool) -> zbus::fdo::Result<bool> {
      let id = parse_id(&id)?;
      let channel = parse_channel(channel)?;
      let outcome = self
         .registry
         .set_state(&id, channel, on)
         .await
         .map_err(failed)?;

      info!("Set {id} channel {channel:?} to {on}: {outcome:?}");
      Ok(outcome == Outcome::Applied)
   }

   async fn connect(&self, id: String) -> zbus::fdo::Result<bool> {
      let id = parse_id(&id)?;
      self.registry.connect(&id).await.map_err(failed)?;
      Ok(true)
   }

   async fn disconnect(&self, id: String) -> zbus::fdo::Result<bool> {
      let id = parse_id(&id)?;
      self.registry.disconnect(&id).await.map_err(failed)?;
      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn device_discovered(
      emitter: &SignalEmitter<'_>,
      id: &str,
      kind: &str,
      version: u8,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn state_changed(
      emitter: &SignalEmitter<'_>,
      id: &str,
      channel: i32,
      on: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn light_changed(emitter: &SignalEmitter<'_>, id: &str, on: bool) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn battery_updated(
      emitter: &SignalEmitter<'_>,
      id: &str,
      level: u8,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_unreachable(emitter: &SignalEmitter<'_>, id: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_connected(emitter: &SignalEmitter<'_>, id: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(emitter: &SignalEmitter<'_>, id: &str) -> zbus::Result<()>;

   #[zbus(property)]
   async fn device_count(&self) -> u32 {
      self.registry.count_devices().await
   }
}
