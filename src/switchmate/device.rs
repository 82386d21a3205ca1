//! Switchmate device façade and shared live state.
//!
//! Every discovered device is one of three variants: a legacy switch, a
//! current-generation switch, or a dual-relay outlet. They share
//! [`DeviceState`], which only reports changes that actually happened.

use std::{
   sync::{Arc, Weak},
   time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use crossbeam::atomic::AtomicCell;
use log::debug;
use serde_json::json;
use smol_str::SmolStr;
use tokio::sync::broadcast;

use crate::{
   bluetooth::{
      link::{Link, Notification},
      radio::{Advertisement, GattChar, Radio},
      scanner::Scanner,
   },
   error::{Result, SwitchmateError},
   event::{EventSender, SwitchmateEvent},
   switchmate::{
      outlet::Outlet,
      protocol::{Channel, DeviceId, DeviceKind, ProtocolVersion},
      queue::Outcome,
      recognition::Recognized,
      switch1::Switch1,
      switch3::Switch3,
   },
};

/// Represents the result of an update operation on device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp<T> {
   /// No change occurred
   Noop,
   /// A first value was recorded (None -> Some)
   Inserted,
   /// An existing value was updated
   Updated(T),
}

impl<T: PartialEq> UpdateOp<T> {
   fn apply_atomic(dst: &AtomicCell<Option<T>>, new: T) -> Self
   where
      T: Copy,
   {
      Self::new(dst.swap(Some(new)), new)
   }

   fn new(prev: Option<T>, new: T) -> Self {
      match prev {
         Some(p) if p == new => Self::Noop,
         Some(_) => Self::Updated(new),
         None => Self::Inserted,
      }
   }

   pub const fn is_updated(&self) -> bool {
      !matches!(self, Self::Noop)
   }
}

/// Collaborators every driver needs.
#[derive(Clone)]
pub struct DeviceContext {
   pub radio: Arc<dyn Radio>,
   pub scanner: Scanner,
   pub event_tx: EventSender,
   /// Period of v3 battery reads; `None` reads only on connect.
   pub battery_refresh: Option<Duration>,
}

/// Live state of one device, shared between its driver and the registry.
pub struct DeviceState {
   id: DeviceId,
   name: SmolStr,
   recognized: Recognized,
   relays: [AtomicCell<Option<bool>>; 2],
   light: AtomicCell<Option<bool>>,
   battery: AtomicCell<Option<u8>>,
   event_tx: EventSender,
}

impl DeviceState {
   pub fn new(
      id: DeviceId,
      name: SmolStr,
      recognized: Recognized,
      event_tx: EventSender,
   ) -> Arc<Self> {
      Arc::new(Self {
         id,
         name,
         recognized,
         relays: Default::default(),
         light: AtomicCell::new(None),
         battery: AtomicCell::new(None),
         event_tx,
      })
   }

   pub fn id(&self) -> &DeviceId {
      &self.id
   }

   pub fn name(&self) -> &SmolStr {
      &self.name
   }

   pub const fn kind(&self) -> DeviceKind {
      self.recognized.kind
   }

   pub const fn version(&self) -> ProtocolVersion {
      self.recognized.version
   }

   fn relay(&self, channel: Option<Channel>) -> &AtomicCell<Option<bool>> {
      match channel {
         Some(Channel::Second) => &self.relays[1],
         _ => &self.relays[0],
      }
   }

   pub fn power(&self, channel: Option<Channel>) -> Option<bool> {
      match channel {
         Some(Channel::Light) => self.light(),
         _ => self.relay(channel).load(),
      }
   }

   pub fn light(&self) -> Option<bool> {
      self.light.load()
   }

   pub fn battery(&self) -> Option<u8> {
      self.battery.load()
   }

   /// Sets the initial state without reporting it.
   pub fn seed_power(&self, channel: Option<Channel>, on: bool) {
      self.relay(channel).store(Some(on));
   }

   /// Records a confirmed or observed relay state, emitting a change event
   /// when it differs from the last known one.
   pub fn update_power(&self, channel: Option<Channel>, on: bool) -> UpdateOp<bool> {
      if channel == Some(Channel::Light) {
         return self.update_light(on);
      }
      let op = UpdateOp::apply_atomic(self.relay(channel), on);
      if op.is_updated() {
         debug!("{}: channel {channel:?} is now {on}", self.id);
         self
            .event_tx
            .emit(&self.id, SwitchmateEvent::StateChanged { channel, on });
      }
      op
   }

   pub fn update_light(&self, on: bool) -> UpdateOp<bool> {
      let op = UpdateOp::apply_atomic(&self.light, on);
      if op.is_updated() {
         self.event_tx.emit(&self.id, SwitchmateEvent::LightChanged(on));
      }
      op
   }

   pub fn update_battery(&self, level: u8) -> UpdateOp<u8> {
      let op = UpdateOp::apply_atomic(&self.battery, level);
      if op.is_updated() {
         self
            .event_tx
            .emit(&self.id, SwitchmateEvent::BatteryUpdated(level));
      }
      op
   }
}

/// Forwards link notifications to `handler` for as long as `target` lives.
pub(crate) fn spawn_notify_listener<T>(link: &Link, target: &Arc<T>, handler: fn(&T, GattChar, &[u8]))
where
   T: Send + Sync + 'static,
{
   let mut rx = link.notifications();
   let weak: Weak<T> = Arc::downgrade(target);
   tokio::spawn(async move {
      loop {
         let (ch, data): Notification = match rx.recv().await {
            Ok(n) => n,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
         };
         let Some(target) = weak.upgrade() else {
            break;
         };
         handler(&target, ch, &data);
      }
   });
}

/// A discovered Switchmate device.
///
/// This type is cheaply cloneable.
#[derive(Clone)]
pub enum Device {
   SwitchV1(Switch1),
   SwitchV3(Switch3),
   Outlet(Outlet),
}

impl Device {
   /// Builds the driver matching a classified advertisement.
   pub fn build(
      id: DeviceId,
      name: SmolStr,
      recognized: Recognized,
      adv: &Advertisement,
      auth_code: Option<&str>,
      ctx: &DeviceContext,
   ) -> Result<Self> {
      let state = DeviceState::new(id, name, recognized, ctx.event_tx.clone());
      let device = match (recognized.version, recognized.kind) {
         (ProtocolVersion::V1, _) => {
            let auth_code = auth_code.map(|code| BASE64.decode(code)).transpose()?;
            Self::SwitchV1(Switch1::new(state, auth_code.as_deref(), ctx)?)
         },
         (ProtocolVersion::V3, DeviceKind::Switch) => Self::SwitchV3(Switch3::new(state, ctx)?),
         (ProtocolVersion::V3, DeviceKind::Outlet) => Self::Outlet(Outlet::new(state, ctx)?),
      };
      device.seed(adv);
      Ok(device)
   }

   fn state(&self) -> &DeviceState {
      match self {
         Self::SwitchV1(d) => d.state(),
         Self::SwitchV3(d) => d.state(),
         Self::Outlet(d) => d.state(),
      }
   }

   fn link(&self) -> &Link {
      match self {
         Self::SwitchV1(d) => d.link(),
         Self::SwitchV3(d) => d.link(),
         Self::Outlet(d) => d.link(),
      }
   }

   pub fn id(&self) -> &DeviceId {
      self.state().id()
   }

   pub fn name(&self) -> &SmolStr {
      self.state().name()
   }

   pub fn kind(&self) -> DeviceKind {
      self.state().kind()
   }

   pub fn version(&self) -> ProtocolVersion {
      self.state().version()
   }

   pub fn is_connected(&self) -> bool {
      self.link().is_ready()
   }

   pub fn current_state(&self, channel: Option<Channel>) -> Option<bool> {
      self.state().power(channel)
   }

   pub fn battery_level(&self) -> Option<u8> {
      self.state().battery()
   }

   /// Whether the device addresses `channel`: switches take none, outlets
   /// need one.
   pub fn supports_channel(&self, channel: Option<Channel>) -> bool {
      match self.kind() {
         DeviceKind::Switch => channel.is_none(),
         DeviceKind::Outlet => channel.is_some(),
      }
   }

   pub async fn connect(&self) -> Result<()> {
      match self {
         Self::SwitchV1(d) => d.connect().await,
         Self::SwitchV3(d) => d.connect().await,
         Self::Outlet(d) => d.connect().await,
      }
   }

   pub async fn disconnect(&self) {
      self.link().disconnect().await;
   }

   /// Queues a state change and waits for the device to confirm it.
   pub async fn set_state(&self, channel: Option<Channel>, on: bool) -> Result<Outcome> {
      if !self.supports_channel(channel) {
         return Err(SwitchmateError::UnsupportedChannel(
            channel.map(Channel::index),
         ));
      }
      match self {
         Self::SwitchV1(d) => d.set_state(on).await,
         Self::SwitchV3(d) => d.set_state(on).await,
         Self::Outlet(d) => d.set_state(channel, on).await,
      }
   }

   fn seed(&self, adv: &Advertisement) {
      match self {
         Self::SwitchV1(d) => d.seed(adv),
         Self::SwitchV3(d) => d.seed(adv),
         Self::Outlet(d) => d.seed(adv),
      }
   }

   /// Applies the state carried by a fresh advertisement.
   pub fn observe_advertisement(&self, adv: &Advertisement) {
      match self {
         Self::SwitchV1(d) => d.observe_advertisement(adv),
         Self::SwitchV3(d) => d.observe_advertisement(adv),
         Self::Outlet(d) => d.observe_advertisement(adv),
      }
   }

   /// Whether rediscovery should re-establish the link in the background.
   pub const fn keeps_link(&self) -> bool {
      !matches!(self, Self::SwitchV1(_))
   }

   /// Converts the device state to a JSON representation.
   pub fn to_json(&self) -> serde_json::Value {
      let state = self.state();
      let mut info = json!({
         "id": state.id().as_str(),
         "name": state.name().as_str(),
         "kind": state.kind(),
         "version": state.version().number(),
         "connected": self.is_connected(),
      });

      info["state"] = match state.kind() {
         DeviceKind::Switch => json!(state.power(None)),
         DeviceKind::Outlet => json!([
            state.power(Some(Channel::First)),
            state.power(Some(Channel::Second))
         ]),
      };
      if let Some(light) = state.light() {
         info["light"] = json!(light);
      }
      if let Some(battery) = state.battery() {
         info["battery"] = json!(battery);
      }
      info
   }
}
