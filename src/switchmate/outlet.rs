//! Driver for the dual-relay Switchmate outlet.
//!
//! Each relay has its own write and notify characteristic pair. The night
//! light has no notify characteristic, so a light change is confirmed by
//! reading the value back once the outlet has settled.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::time;

use crate::{
   bluetooth::{link::Link, radio::Advertisement, radio::GattChar},
   error::{Result, SwitchmateError},
   switchmate::{
      device::{DeviceContext, DeviceState, spawn_notify_listener},
      parser,
      protocol::{CHAR_OUTLET_LIGHT, CHAR_OUTLET2_NOTIFY, CHAR_POWER_NOTIFY, Channel},
      queue::{Backlog, CommandQueue, CommandTask, EXCHANGE_TIMEOUT, Outcome, StateWriter},
   },
};

/// Delay before the light value reads back the new state
const LIGHT_SETTLE: Duration = Duration::from_secs(3);

const RELAYS: [Channel; 2] = [Channel::First, Channel::Second];

struct OutletCore {
   state: Arc<DeviceState>,
   link: Link,
}

impl OutletCore {
   async fn connect(&self) -> Result<()> {
      if self.link.connect().await? {
         if let Err(e) = self.read_light().await {
            debug!("Could not read light of {}: {e}", self.state.id());
         }
      }
      Ok(())
   }

   async fn read_light(&self) -> Result<bool> {
      let data = self.link.read(CHAR_OUTLET_LIGHT).await?;
      let on = parser::parse_light(&data)?;
      self.state.update_light(on);
      Ok(on)
   }

   async fn set_relay(&self, channel: Channel, on: bool) -> Result<Outcome> {
      let notify = channel
         .notify_char()
         .ok_or(SwitchmateError::UnsupportedChannel(Some(channel.index())))?;
      let data = self
         .link
         .exchange(
            channel.write_char(),
            notify,
            &[u8::from(on)],
            EXCHANGE_TIMEOUT,
            SwitchmateError::PowerStateTimeout,
         )
         .await?;
      let on = parser::parse_power_notify(&data).inspect_err(|_| {
         warn!("Got bad state from {} channel {channel}", self.state.id());
      })?;
      self.state.update_power(Some(channel), on);
      Ok(Outcome::Applied)
   }

   async fn set_light(&self, on: bool) -> Result<Outcome> {
      let confirm = async {
         self.link.write(CHAR_OUTLET_LIGHT, &[u8::from(on)]).await?;
         time::sleep(LIGHT_SETTLE).await;
         self.read_light().await
      };
      let reported = time::timeout(EXCHANGE_TIMEOUT, confirm)
         .await
         .map_err(|_| SwitchmateError::WriteTimeout)??;
      if reported != on {
         debug!("{}: light reads back {reported}", self.state.id());
      }
      Ok(Outcome::Applied)
   }

   fn on_notify(&self, ch: GattChar, data: &[u8]) {
      let Some(channel) = RELAYS.into_iter().find(|c| c.notify_char() == Some(ch)) else {
         return;
      };
      match parser::parse_power_notify(data) {
         Ok(on) => {
            self.state.update_power(Some(channel), on);
         },
         Err(e) => debug!("{} channel {channel}: ignoring notification: {e}", self.state.id()),
      }
   }
}

#[async_trait]
impl StateWriter for OutletCore {
   async fn attempt(&self, task: CommandTask, backlog: &Backlog) -> Result<Outcome> {
      let channel = task
         .channel
         .ok_or(SwitchmateError::UnsupportedChannel(None))?;
      self.connect().await?;
      if backlog.is_superseded() {
         return Ok(Outcome::Superseded);
      }
      match channel {
         Channel::Light => self.set_light(task.on).await,
         relay => self.set_relay(relay, task.on).await,
      }
   }

   async fn abandon(&self) {
      self.link.disconnect().await;
   }
}

/// Outlet with two relays and a night light.
///
/// This type is cheaply cloneable.
#[derive(Clone)]
pub struct Outlet {
   core: Arc<OutletCore>,
   queue: CommandQueue,
}

impl Outlet {
   pub fn new(state: Arc<DeviceState>, ctx: &DeviceContext) -> Result<Self> {
      let peripheral = ctx.radio.peripheral(state.id())?;
      let link = Link::new(
         peripheral,
         ctx.scanner.clone(),
         ctx.event_tx.clone(),
         &[CHAR_POWER_NOTIFY, CHAR_OUTLET2_NOTIFY],
      );
      let core = Arc::new(OutletCore { state, link });
      spawn_notify_listener(&core.link, &core, OutletCore::on_notify);
      let queue = CommandQueue::new(core.state.id().clone(), core.clone());
      Ok(Self { core, queue })
   }

   pub fn state(&self) -> &DeviceState {
      &self.core.state
   }

   pub fn link(&self) -> &Link {
      &self.core.link
   }

   pub async fn connect(&self) -> Result<()> {
      self.core.connect().await
   }

   pub async fn set_state(&self, channel: Option<Channel>, on: bool) -> Result<Outcome> {
      self.queue.set_state(channel, on).await
   }

   pub(crate) fn seed(&self, adv: &Advertisement) {
      for channel in RELAYS {
         if let Ok(on) = parser::advertised_power(adv, channel) {
            self.core.state.seed_power(Some(channel), on);
         }
      }
   }

   pub fn observe_advertisement(&self, adv: &Advertisement) {
      for channel in RELAYS {
         match parser::advertised_power(adv, channel) {
            Ok(on) => {
               self.core.state.update_power(Some(channel), on);
            },
            Err(e) => debug!("{} channel {channel}: no state in advertisement: {e}", self.core.state.id()),
         }
      }
   }
}
