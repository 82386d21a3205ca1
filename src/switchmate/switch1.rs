//! Driver for first-generation (v1) Switchmate switches.
//!
//! Legacy switches accept a signed payload derived from the auth code
//! obtained at pairing, and acknowledge it on the status characteristic.
//! They only hold a link for the duration of a command; discovery is paused
//! while the link is up and resumed once the command has finished.

use std::sync::{
   Arc,
   atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use log::{debug, error};

use crate::{
   bluetooth::{link::Link, radio::Advertisement, radio::Packet, scanner::Scanner, scanner::Targets},
   error::{Result, SwitchmateError},
   switchmate::{
      device::{DeviceContext, DeviceState},
      parser,
      protocol::{CHAR_V1_STATUS, legacy_codes},
      queue::{Backlog, CommandQueue, CommandTask, EXCHANGE_TIMEOUT, Outcome, StateWriter},
   },
};

/// Signed on and off payloads.
struct Codes {
   on: Packet,
   off: Packet,
}

struct Switch1Core {
   state: Arc<DeviceState>,
   link: Link,
   scanner: Scanner,
   codes: Option<Codes>,
   /// Set while discovery is paused on behalf of a command.
   scan_paused: AtomicBool,
}

impl Switch1Core {
   fn code(&self, on: bool) -> Result<&Packet> {
      let codes = self.codes.as_ref().ok_or(SwitchmateError::MissingAuthCode)?;
      Ok(if on { &codes.on } else { &codes.off })
   }

   async fn write_state(&self, on: bool) -> Result<()> {
      let code = self.code(on)?;
      let data = self
         .link
         .exchange(
            CHAR_V1_STATUS,
            CHAR_V1_STATUS,
            code,
            EXCHANGE_TIMEOUT,
            SwitchmateError::WriteTimeout,
         )
         .await?;
      parser::parse_legacy_status(&data)
   }

   async fn connect_and_write(&self, on: bool, backlog: &Backlog) -> Result<Outcome> {
      self.link.connect().await?;
      if backlog.is_superseded() {
         return Ok(Outcome::Superseded);
      }
      self.write_state(on).await?;
      Ok(Outcome::Applied)
   }
}

#[async_trait]
impl StateWriter for Switch1Core {
   async fn attempt(&self, task: CommandTask, backlog: &Backlog) -> Result<Outcome> {
      if let Some(channel) = task.channel {
         return Err(SwitchmateError::UnsupportedChannel(Some(channel.index())));
      }
      self.code(task.on)?;

      self.scan_paused.store(true, Ordering::SeqCst);
      self.scanner.pause().await;
      let result = self.connect_and_write(task.on, backlog).await;

      match &result {
         Ok(Outcome::Applied) => {
            self.state.update_power(None, task.on);
         },
         Ok(Outcome::Superseded) => {},
         Err(SwitchmateError::Reset) => {
            error!(
               "Switch {} has reset itself, a new auth code has to be obtained by re-pairing it",
               self.state.id()
            );
         },
         Err(_) => {
            if !backlog.is_superseded() {
               self.link.disconnect().await;
            }
         },
      }
      result
   }

   async fn abandon(&self) {
      self.link.disconnect().await;
   }

   async fn finish(&self, backlog: &Backlog) {
      if backlog.is_superseded() || !self.scan_paused.swap(false, Ordering::SeqCst) {
         return;
      }
      self.link.disconnect().await;
      self.scanner.start(None, Targets::Keep).await;
   }
}

/// Legacy single-relay switch.
///
/// This type is cheaply cloneable.
#[derive(Clone)]
pub struct Switch1 {
   core: Arc<Switch1Core>,
   queue: CommandQueue,
}

impl Switch1 {
   pub fn new(state: Arc<DeviceState>, auth_code: Option<&[u8]>, ctx: &DeviceContext) -> Result<Self> {
      let peripheral = ctx.radio.peripheral(state.id())?;
      let link = Link::new(
         peripheral,
         ctx.scanner.clone(),
         ctx.event_tx.clone(),
         &[CHAR_V1_STATUS],
      );
      let codes = auth_code.map(|auth| {
         let (on, off) = legacy_codes(auth);
         Codes { on, off }
      });
      if codes.is_none() {
         debug!("{}: no auth code, state changes are unavailable", state.id());
      }
      let core = Arc::new(Switch1Core {
         state,
         link,
         scanner: ctx.scanner.clone(),
         codes,
         scan_paused: AtomicBool::new(false),
      });
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
      self.core.link.connect().await.map(|_| ())
   }

   pub async fn set_state(&self, on: bool) -> Result<Outcome> {
      self.queue.set_state(None, on).await
   }

   pub(crate) fn seed(&self, adv: &Advertisement) {
      if let Ok(on) = parser::advertised_legacy_power(adv) {
         self.core.state.seed_power(None, on);
      }
   }

   pub fn observe_advertisement(&self, adv: &Advertisement) {
      match parser::advertised_legacy_power(adv) {
         Ok(on) => {
            self.core.state.update_power(None, on);
         },
         Err(e) => debug!("{}: no state in advertisement: {e}", self.core.state.id()),
      }
   }
}
