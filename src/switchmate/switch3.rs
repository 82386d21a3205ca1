//! Driver for current-generation (v3) Switchmate switches.
//!
//! State is pushed by the device on the power notify characteristic, both
//! in response to writes and when the physical button is pressed. The
//! battery level is read after every new connection and periodically while
//! connected.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::{
   task::JoinHandle,
   time::{self, Instant, MissedTickBehavior},
};

use crate::{
   bluetooth::{link::Link, radio::Advertisement, radio::GattChar},
   error::{Result, SwitchmateError},
   switchmate::{
      device::{DeviceContext, DeviceState, spawn_notify_listener},
      parser,
      protocol::{CHAR_BATTERY_LEVEL, CHAR_POWER_NOTIFY, CHAR_POWER_WRITE, Channel},
      queue::{Backlog, CommandQueue, CommandTask, EXCHANGE_TIMEOUT, Outcome, StateWriter},
   },
};

/// Maximum time for a battery read
const BATTERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads the battery level and records it.
pub(crate) async fn refresh_battery(link: &Link, state: &DeviceState) -> Result<u8> {
   let data = time::timeout(BATTERY_TIMEOUT, link.read(CHAR_BATTERY_LEVEL))
      .await
      .map_err(|_| SwitchmateError::BatteryTimeout)??;
   let level = parser::parse_battery_level(&data)?;
   debug!("Battery level of {}: {level}%", state.id());
   state.update_battery(level);
   Ok(level)
}

struct Switch3Core {
   state: Arc<DeviceState>,
   link: Link,
   battery_refresh: Option<Duration>,
   battery_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Switch3Core {
   fn drop(&mut self) {
      if let Some(task) = self.battery_task.get_mut().take() {
         task.abort();
      }
   }
}

impl Switch3Core {
   async fn connect(&self) -> Result<()> {
      if !self.link.connect().await? {
         return Ok(());
      }
      if let Err(e) = refresh_battery(&self.link, &self.state).await {
         warn!("Failed to read battery of {}: {e}", self.state.id());
      }
      self.arm_battery_refresh();
      Ok(())
   }

   fn arm_battery_refresh(&self) {
      let Some(period) = self.battery_refresh else {
         return;
      };
      let link = self.link.clone();
      let state = self.state.clone();
      let task = tokio::spawn(async move {
         let mut interval = time::interval_at(Instant::now() + period, period);
         interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
         loop {
            interval.tick().await;
            if !link.is_ready() {
               break;
            }
            if let Err(e) = refresh_battery(&link, &state).await {
               warn!("Failed to refresh battery of {}: {e}", state.id());
            }
         }
      });
      if let Some(previous) = self.battery_task.lock().replace(task) {
         previous.abort();
      }
   }

   fn on_notify(&self, ch: GattChar, data: &[u8]) {
      if ch != CHAR_POWER_NOTIFY {
         return;
      }
      match parser::parse_power_notify(data) {
         Ok(on) => {
            self.state.update_power(None, on);
         },
         Err(e) => debug!("{}: ignoring notification: {e}", self.state.id()),
      }
   }
}

#[async_trait]
impl StateWriter for Switch3Core {
   async fn attempt(&self, task: CommandTask, backlog: &Backlog) -> Result<Outcome> {
      if let Some(channel) = task.channel {
         return Err(SwitchmateError::UnsupportedChannel(Some(channel.index())));
      }
      self.connect().await?;
      if backlog.is_superseded() {
         return Ok(Outcome::Superseded);
      }

      let data = self
         .link
         .exchange(
            CHAR_POWER_WRITE,
            CHAR_POWER_NOTIFY,
            &[u8::from(task.on)],
            EXCHANGE_TIMEOUT,
            SwitchmateError::PowerStateTimeout,
         )
         .await?;
      let on = parser::parse_power_notify(&data).inspect_err(|_| {
         warn!("Got bad state from {}", self.state.id());
      })?;
      self.state.update_power(None, on);
      Ok(Outcome::Applied)
   }

   async fn abandon(&self) {
      self.link.disconnect().await;
   }
}

/// Single-relay switch speaking the current protocol.
///
/// This type is cheaply cloneable.
#[derive(Clone)]
pub struct Switch3 {
   core: Arc<Switch3Core>,
   queue: CommandQueue,
}

impl Switch3 {
   pub fn new(state: Arc<DeviceState>, ctx: &DeviceContext) -> Result<Self> {
      let peripheral = ctx.radio.peripheral(state.id())?;
      let link = Link::new(
         peripheral,
         ctx.scanner.clone(),
         ctx.event_tx.clone(),
         &[CHAR_POWER_NOTIFY],
      );
      let core = Arc::new(Switch3Core {
         state,
         link,
         battery_refresh: ctx.battery_refresh,
         battery_task: parking_lot::Mutex::new(None),
      });
      spawn_notify_listener(&core.link, &core, Switch3Core::on_notify);
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

   pub async fn set_state(&self, on: bool) -> Result<Outcome> {
      self.queue.set_state(None, on).await
   }

   pub async fn refresh_battery(&self) -> Result<u8> {
      refresh_battery(&self.core.link, &self.core.state).await
   }

   pub(crate) fn seed(&self, adv: &Advertisement) {
      if let Ok(on) = parser::advertised_power(adv, Channel::First) {
         self.core.state.seed_power(None, on);
      }
   }

   pub fn observe_advertisement(&self, adv: &Advertisement) {
      match parser::advertised_power(adv, Channel::First) {
         Ok(on) => {
            self.core.state.update_power(None, on);
         },
         Err(e) => debug!("{}: no state in advertisement: {e}", self.core.state.id()),
      }
   }
}
