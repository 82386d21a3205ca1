//! Scan controller for Switchmate discovery.
//!
//! Owns the process-wide radio scan: cycles bounded by a timeout and
//! separated by a gap, narrowing to a set of target ids, an exclusion list
//! for devices held by an active connection, and per-target miss counters
//! that raise an unreachable event once a device has been absent for too
//! many cycles.

use std::{
   collections::{HashMap, HashSet},
   sync::Arc,
   time::Duration,
};

use futures::StreamExt;
use log::{debug, error, info, warn};
use rand::Rng;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};
use uuid::Uuid;

use crate::{
   bluetooth::radio::{Advertisement, Radio, RadioEvent, RadioEvents},
   error::{Result, SwitchmateError},
   switchmate::{
      protocol::{DEFAULT_SCAN_SERVICES, DeviceId},
      recognition::{self, Recognized},
   },
};

/// Minimum pause between two scan cycles
const MIN_GAP: Duration = Duration::from_secs(10);
/// Default upper bound of a single scan cycle
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Delay before re-checking when every target is already accounted for
const DEFERRED_START_DELAY: Duration = Duration::from_secs(60);
/// Bounds of the jittered restart after the radio stopped scanning on its own
const RESTART_JITTER_MS: std::ops::Range<u64> = 2_000..10_000;
/// Misses tolerated before a target is reported unreachable
const UNREACHABLE_THRESHOLD: u32 = 7;
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
   Stopped,
   Starting,
   Started,
   Paused,
}

impl ScanState {
   const fn is_idle(self) -> bool {
      matches!(self, Self::Stopped | Self::Paused)
   }
}

/// Which devices a scan cycle is looking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
   /// Reuse the targets of the previous cycle.
   Keep,
   /// Report every recognized device.
   Unrestricted,
   Only(Vec<DeviceId>),
}

/// Events raised by the scanner.
#[derive(Debug, Clone)]
pub enum ScanEvent {
   Discovered {
      id: DeviceId,
      recognized: Recognized,
      advertisement: Advertisement,
   },
   Unreachable(DeviceId),
}

/// Cycle timing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanTiming {
   gap: Duration,
   timeout: Duration,
}

impl Default for ScanTiming {
   fn default() -> Self {
      Self {
         gap: MIN_GAP,
         timeout: DEFAULT_TIMEOUT,
      }
   }
}

impl ScanTiming {
   pub const fn gap(&self) -> Duration {
      self.gap
   }

   pub const fn timeout(&self) -> Duration {
      self.timeout
   }

   /// Sets the pause between cycles, never below ten seconds.
   pub fn set_gap_secs(&mut self, secs: u64) {
      self.gap = Duration::from_secs(secs).max(MIN_GAP);
   }

   /// Sets the cycle timeout.
   ///
   /// The new value is floored at three times the current one, so the
   /// timeout never shrinks and grows on every call. Deployed configurations
   /// rely on that floor; apply it once per process.
   pub fn set_timeout_secs(&mut self, secs: u64) {
      self.timeout = (self.timeout * 3).max(Duration::from_secs(secs));
   }
}

/// Bookkeeping for the current scan cycle.
#[derive(Debug)]
struct ScanSession {
   state: ScanState,
   /// `None` scans for every recognized device.
   targets: Option<Vec<DeviceId>>,
   discovered: Vec<DeviceId>,
   excluded: HashMap<DeviceId, &'static str>,
   misses: HashMap<DeviceId, u32>,
   services: Vec<Uuid>,
}

impl Default for ScanSession {
   fn default() -> Self {
      Self {
         state: ScanState::Stopped,
         targets: Some(Vec::new()),
         discovered: Vec::new(),
         excluded: HashMap::new(),
         misses: HashMap::new(),
         services: DEFAULT_SCAN_SERVICES.to_vec(),
      }
   }
}

impl ScanSession {
   fn is_target(&self, id: &DeviceId) -> bool {
      self.targets.as_ref().is_some_and(|t| t.contains(id))
   }

   /// Whether a freshly seen id should be reported.
   fn accepts(&self, id: &DeviceId) -> bool {
      if self.discovered.contains(id) {
         return false;
      }
      match &self.targets {
         Some(targets) if !targets.is_empty() => targets.contains(id),
         _ => true,
      }
   }

   fn record_discovery(&mut self, id: DeviceId) {
      self.misses.insert(id.clone(), 0);
      self.discovered.push(id);
   }

   /// Restarts discovery bookkeeping; excluded ids count as already found.
   fn reset_discovered(&mut self) {
      self.discovered = self.excluded.keys().cloned().collect();
   }

   fn all_found(&self) -> bool {
      match &self.targets {
         Some(targets) if !targets.is_empty() => {
            targets.iter().all(|id| self.discovered.contains(id))
         },
         _ => false,
      }
   }

   /// Counts a miss for every target not seen this cycle and returns the
   /// ids that were already past the threshold.
   fn tally_misses(&mut self) -> Vec<DeviceId> {
      let Some(targets) = &self.targets else {
         return Vec::new();
      };
      let mut unreachable = Vec::new();
      for id in targets {
         if self.discovered.contains(id) {
            continue;
         }
         let count = self.misses.entry(id.clone()).or_insert(0);
         let previous = *count;
         *count += 1;
         if previous >= UNREACHABLE_THRESHOLD {
            unreachable.push(id.clone());
         }
      }
      unreachable
   }

   fn exclude(&mut self, id: DeviceId, reason: &'static str) -> bool {
      if !self.is_target(&id) {
         return false;
      }
      self.excluded.insert(id, reason);
      true
   }
}

#[derive(Debug)]
enum ScanCommand {
   Start {
      services: Option<Vec<Uuid>>,
      targets: Targets,
   },
   Stop {
      internal: bool,
   },
   Exclude(DeviceId, &'static str),
   Unexclude(DeviceId),
   SetGap(u64),
   SetTimeout(u64),
   GetTiming(oneshot::Sender<ScanTiming>),
   GetState(oneshot::Sender<ScanState>),
   Excluded(oneshot::Sender<HashSet<DeviceId>>),

   // Timer callbacks, tagged with the timer generation that armed them
   TimedStart(u64),
   TimedStop(u64),
}

/// Handle to the scan controller.
///
/// This type is cheaply cloneable.
#[derive(Debug, Clone)]
pub struct Scanner {
   inbox: mpsc::Sender<ScanCommand>,
}

impl Scanner {
   /// Spawns the controller. Discoveries and unreachable reports are sent to
   /// `listener`.
   pub async fn new(
      radio: Arc<dyn Radio>,
      timing: ScanTiming,
      listener: mpsc::Sender<ScanEvent>,
   ) -> Result<Self> {
      let radio_events = radio.events().await?;
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(ScanActor::new(radio, radio_events, timing, listener, command_rx).run());
      Ok(Self { inbox: command_tx })
   }

   async fn send(&self, cmd: ScanCommand) {
      if self.inbox.send(cmd).await.is_err() {
         warn!("Scanner is gone, dropping command");
      }
   }

   /// Starts a scan cycle. `services: None` keeps the current filter.
   pub async fn start(&self, services: Option<Vec<Uuid>>, targets: Targets) {
      self.send(ScanCommand::Start { services, targets }).await;
   }

   /// Stops scanning. An internal stop ends the cycle and schedules the
   /// next one; an external stop pauses until the next `start`.
   pub async fn stop(&self, internal: bool) {
      self.send(ScanCommand::Stop { internal }).await;
   }

   pub async fn pause(&self) {
      self.stop(false).await;
   }

   /// Marks a target as held by an active connection.
   pub async fn exclude(&self, id: &DeviceId, reason: &'static str) {
      self.send(ScanCommand::Exclude(id.clone(), reason)).await;
   }

   pub async fn unexclude(&self, id: &DeviceId) {
      self.send(ScanCommand::Unexclude(id.clone())).await;
   }

   pub async fn set_gap_secs(&self, secs: u64) {
      self.send(ScanCommand::SetGap(secs)).await;
   }

   pub async fn set_timeout_secs(&self, secs: u64) {
      self.send(ScanCommand::SetTimeout(secs)).await;
   }

   pub async fn timing(&self) -> Result<ScanTiming> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ScanCommand::GetTiming(tx))
         .await
         .map_err(|_| SwitchmateError::ManagerShutdown)?;
      rx.await.map_err(|_| SwitchmateError::ManagerShutdown)
   }

   pub async fn state(&self) -> Result<ScanState> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ScanCommand::GetState(tx))
         .await
         .map_err(|_| SwitchmateError::ManagerShutdown)?;
      rx.await.map_err(|_| SwitchmateError::ManagerShutdown)
   }

   pub async fn excluded(&self) -> Result<HashSet<DeviceId>> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ScanCommand::Excluded(tx))
         .await
         .map_err(|_| SwitchmateError::ManagerShutdown)?;
      rx.await.map_err(|_| SwitchmateError::ManagerShutdown)
   }
}

// === Scan Actor ===

struct ScanActor {
   radio: Arc<dyn Radio>,
   radio_events: RadioEvents,
   timing: ScanTiming,
   listener: mpsc::Sender<ScanEvent>,
   command_rx: mpsc::Receiver<ScanCommand>,
   loopback_rx: mpsc::Receiver<ScanCommand>,
   loopback_tx: mpsc::Sender<ScanCommand>,

   // State
   session: ScanSession,
   start_timer: Option<(u64, JoinHandle<()>)>,
   stop_timer: Option<(u64, JoinHandle<()>)>,
   timer_gen: u64,
}

impl ScanActor {
   fn new(
      radio: Arc<dyn Radio>,
      radio_events: RadioEvents,
      timing: ScanTiming,
      listener: mpsc::Sender<ScanEvent>,
      command_rx: mpsc::Receiver<ScanCommand>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         radio,
         radio_events,
         timing,
         listener,
         command_rx,
         loopback_rx,
         loopback_tx,
         session: ScanSession::default(),
         start_timer: None,
         stop_timer: None,
         timer_gen: 0,
      }
   }

   async fn run(mut self) {
      debug!("Scanner starting up");
      loop {
         select! {
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  debug!("Scanner shutting down");
                  break;
               };
               self.handle_command(cmd).await;
            }
            Some(cmd) = self.loopback_rx.recv() => {
               self.handle_command(cmd).await;
            }
            Some(event) = self.radio_events.next() => {
               self.handle_radio_event(event).await;
            }
         }
      }

      self.cancel_timers();
      if !self.session.state.is_idle()
         && let Err(e) = self.radio.stop_scan().await
      {
         warn!("Failed to stop scanning on shutdown: {e}");
      }
   }

   async fn handle_command(&mut self, cmd: ScanCommand) {
      match cmd {
         ScanCommand::Start { services, targets } => {
            self.start(services, targets).await;
         },
         ScanCommand::Stop { internal } => {
            self.stop(internal).await;
         },
         ScanCommand::Exclude(id, reason) => {
            if self.session.exclude(id.clone(), reason) {
               debug!("Excluding {id} from discovery: {reason}");
            }
         },
         ScanCommand::Unexclude(id) => {
            self.session.excluded.remove(&id);
         },
         ScanCommand::SetGap(secs) => {
            self.timing.set_gap_secs(secs);
            debug!("Scan gap set to {:?}", self.timing.gap());
         },
         ScanCommand::SetTimeout(secs) => {
            self.timing.set_timeout_secs(secs);
            debug!("Scan timeout set to {:?}", self.timing.timeout());
         },
         ScanCommand::GetTiming(reply) => {
            let _ = reply.send(self.timing);
         },
         ScanCommand::GetState(reply) => {
            let _ = reply.send(self.session.state);
         },
         ScanCommand::Excluded(reply) => {
            let _ = reply.send(self.session.excluded.keys().cloned().collect());
         },
         ScanCommand::TimedStart(generation) => {
            if self.start_timer.as_ref().is_some_and(|(g, _)| *g == generation) {
               self.start_timer = None;
               self.start(None, Targets::Keep).await;
            }
         },
         ScanCommand::TimedStop(generation) => {
            if self.stop_timer.as_ref().is_some_and(|(g, _)| *g == generation) {
               self.stop_timer = None;
               debug!("Stopping an incomplete scan");
               self.stop(true).await;
            }
         },
      }
   }

   async fn handle_radio_event(&mut self, event: RadioEvent) {
      match event {
         RadioEvent::ScanEnabled(enabled) => self.handle_scan_enabled(enabled),
         RadioEvent::Advertisement(adv) => self.handle_advertisement(adv).await,
      }
   }

   fn handle_scan_enabled(&mut self, enabled: bool) {
      if self.session.state.is_idle() {
         return;
      }
      if let Some((_, handle)) = self.start_timer.take() {
         handle.abort();
      }

      if enabled {
         debug!("Scanning started");
         self.session.state = ScanState::Started;
      } else {
         let delay = restart_jitter();
         info!("Scanning was terminated by the radio, restarting in {delay:?}");
         self.schedule_start(delay);
      }
   }

   async fn handle_advertisement(&mut self, adv: Advertisement) {
      let Some(id) = adv.id.clone() else {
         return;
      };
      if !self.session.accepts(&id) {
         return;
      }
      let Some(recognized) = recognition::classify(&adv) else {
         return;
      };

      self.session.record_discovery(id.clone());
      info!(
         "Discovered {} ({}): {id}",
         recognized.kind, recognized.version
      );
      if let Err(e) = self
         .listener
         .send(ScanEvent::Discovered {
            id,
            recognized,
            advertisement: adv,
         })
         .await
      {
         warn!("Channel overflow sending discovery: {e}");
      }

      if self.session.all_found() {
         self.stop(true).await;
      }
   }

   async fn start(&mut self, services: Option<Vec<Uuid>>, targets: Targets) {
      match targets {
         Targets::Keep => {},
         Targets::Unrestricted => self.session.targets = None,
         Targets::Only(ids) => self.session.targets = Some(ids),
      }
      if let Some(services) = services {
         self.session.services = services;
      }

      if self.session.targets.as_ref().is_some_and(Vec::is_empty) {
         error!("No device ids have been defined, not scanning");
         return;
      }
      self.session.reset_discovered();
      if self.session.all_found() {
         debug!("Delaying unnecessary scan");
         self.schedule_start(DEFERRED_START_DELAY);
         return;
      }

      self.session.state = ScanState::Starting;
      if let Err(e) = self.radio.start_scan(&self.session.services).await {
         error!("Failed to start scanning: {e}");
      } else {
         debug!("Discovery started");
      }

      let generation = self.next_generation();
      let loopback = self.loopback_tx.clone();
      let timeout = self.timing.timeout();
      let handle = tokio::spawn(async move {
         time::sleep(timeout).await;
         let _ = loopback.send(ScanCommand::TimedStop(generation)).await;
      });
      if let Some((_, previous)) = self.stop_timer.replace((generation, handle)) {
         previous.abort();
      }
   }

   async fn stop(&mut self, internal: bool) {
      if internal && self.session.state.is_idle() {
         return;
      }
      if !internal {
         debug!("Pausing scan");
      }

      self.session.state = if internal {
         ScanState::Stopped
      } else {
         ScanState::Paused
      };
      if let Err(e) = self.radio.stop_scan().await {
         warn!("Failed to stop scanning: {e}");
      }
      self.cancel_timers();

      if internal {
         self.schedule_start(self.timing.gap());
         self.post_discovery().await;
      }
   }

   /// End-of-cycle bookkeeping: tally misses and report unreachable targets.
   async fn post_discovery(&mut self) {
      for id in self.session.tally_misses() {
         warn!("{id} has not been seen for a while");
         if let Err(e) = self.listener.send(ScanEvent::Unreachable(id)).await {
            warn!("Channel overflow sending unreachable: {e}");
         }
      }
   }

   fn schedule_start(&mut self, delay: Duration) {
      let generation = self.next_generation();
      let loopback = self.loopback_tx.clone();
      let handle = tokio::spawn(async move {
         time::sleep(delay).await;
         let _ = loopback.send(ScanCommand::TimedStart(generation)).await;
      });
      if let Some((_, previous)) = self.start_timer.replace((generation, handle)) {
         previous.abort();
      }
   }

   fn cancel_timers(&mut self) {
      for (_, handle) in [self.start_timer.take(), self.stop_timer.take()]
         .into_iter()
         .flatten()
      {
         handle.abort();
      }
   }

   fn next_generation(&mut self) -> u64 {
      self.timer_gen += 1;
      self.timer_gen
   }
}

fn restart_jitter() -> Duration {
   Duration::from_millis(rand::thread_rng().gen_range(RESTART_JITTER_MS))
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::bluetooth::fake::{FakeRadio, device_id, outlet_advertisement, switch_advertisement};
   use crate::switchmate::protocol::{DeviceKind, SERVICE_V3};

   async fn settle() {
      time::sleep(Duration::from_millis(1)).await;
   }

   async fn spawn_scanner() -> (Arc<FakeRadio>, Scanner, mpsc::Receiver<ScanEvent>) {
      let radio = FakeRadio::new();
      let (tx, rx) = mpsc::channel(64);
      let scanner = Scanner::new(radio.clone(), ScanTiming::default(), tx)
         .await
         .unwrap();
      (radio, scanner, rx)
   }

   #[test]
   fn test_gap_is_floored() {
      let mut timing = ScanTiming::default();
      timing.set_gap_secs(3);
      assert_eq!(timing.gap(), Duration::from_secs(10));
      timing.set_gap_secs(0);
      assert_eq!(timing.gap(), Duration::from_secs(10));
      timing.set_gap_secs(25);
      assert_eq!(timing.gap(), Duration::from_secs(25));
   }

   #[test]
   fn test_timeout_never_decreases() {
      let mut timing = ScanTiming::default();
      timing.set_timeout_secs(5);
      assert_eq!(timing.timeout(), Duration::from_secs(90));
      timing.set_timeout_secs(5);
      assert_eq!(timing.timeout(), Duration::from_secs(270));
      timing.set_timeout_secs(1000);
      assert_eq!(timing.timeout(), Duration::from_secs(1000));

      let mut previous = timing.timeout();
      for secs in [0, 1, 10, 100] {
         timing.set_timeout_secs(secs);
         assert!(timing.timeout() >= previous);
         previous = timing.timeout();
      }
   }

   #[test]
   fn test_session_filters_discoveries() {
      let a = device_id("aaaaaaaaaaaa");
      let b = device_id("bbbbbbbbbbbb");
      let mut session = ScanSession {
         targets: Some(vec![a.clone()]),
         ..Default::default()
      };
      assert!(session.accepts(&a));
      assert!(!session.accepts(&b));
      session.record_discovery(a.clone());
      assert!(!session.accepts(&a));
      assert!(session.all_found());

      session.targets = None;
      assert!(session.accepts(&b));
      assert!(!session.all_found());
   }

   #[test]
   fn test_exclusion_limited_to_targets() {
      let a = device_id("aaaaaaaaaaaa");
      let b = device_id("bbbbbbbbbbbb");
      let mut session = ScanSession {
         targets: Some(vec![a.clone()]),
         ..Default::default()
      };
      assert!(session.exclude(a.clone(), "Connected"));
      assert!(!session.exclude(b, "Connected"));
      session.reset_discovered();
      assert_eq!(session.discovered, vec![a]);
   }

   #[test]
   fn test_misses_report_past_threshold() {
      let a = device_id("aaaaaaaaaaaa");
      let mut session = ScanSession {
         targets: Some(vec![a.clone()]),
         ..Default::default()
      };
      for _ in 0..UNREACHABLE_THRESHOLD {
         assert!(session.tally_misses().is_empty());
      }
      assert_eq!(session.tally_misses(), vec![a.clone()]);
      assert_eq!(session.tally_misses(), vec![a.clone()]);

      session.record_discovery(a);
      assert!(session.tally_misses().is_empty());
   }

   #[tokio::test(start_paused = true)]
   async fn test_start_scans_default_services() {
      let (radio, scanner, _rx) = spawn_scanner().await;
      scanner
         .start(None, Targets::Only(vec![device_id("aaaaaaaaaaaa")]))
         .await;
      assert_eq!(scanner.state().await.unwrap(), ScanState::Starting);
      assert_eq!(radio.scan_starts(), 1);
      assert_eq!(
         radio.last_scan_services(),
         Some(DEFAULT_SCAN_SERVICES.to_vec())
      );

      radio.push(RadioEvent::ScanEnabled(true));
      settle().await;
      assert_eq!(scanner.state().await.unwrap(), ScanState::Started);
   }

   #[tokio::test(start_paused = true)]
   async fn test_start_without_targets_is_refused() {
      let (radio, scanner, _rx) = spawn_scanner().await;
      scanner.start(None, Targets::Keep).await;
      assert_eq!(scanner.state().await.unwrap(), ScanState::Stopped);
      assert_eq!(radio.scan_starts(), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_covered_targets_defer_scan() {
      let (radio, scanner, _rx) = spawn_scanner().await;
      let a = device_id("aaaaaaaaaaaa");
      scanner.start(None, Targets::Only(vec![a.clone()])).await;
      scanner.exclude(&a, "Connected").await;
      scanner.stop(false).await;
      assert_eq!(scanner.state().await.unwrap(), ScanState::Paused);
      assert_eq!(radio.scan_starts(), 1);

      scanner.start(None, Targets::Keep).await;
      settle().await;
      assert_eq!(radio.scan_starts(), 1);

      // Still excluded when the deferred start fires
      time::sleep(Duration::from_secs(61)).await;
      assert_eq!(radio.scan_starts(), 1);

      scanner.unexclude(&a).await;
      time::sleep(Duration::from_secs(60)).await;
      assert_eq!(radio.scan_starts(), 2);
   }

   #[tokio::test(start_paused = true)]
   async fn test_discovery_filter_and_stop_when_done() {
      let (radio, scanner, mut rx) = spawn_scanner().await;
      let a = device_id("aaaaaaaaaaaa");
      let b = device_id("bbbbbbbbbbbb");
      let c = device_id("cccccccccccc");
      scanner
         .start(None, Targets::Only(vec![a.clone(), b.clone()]))
         .await;

      radio.advertise(switch_advertisement(&a, true));
      radio.advertise(switch_advertisement(&a, false));
      radio.advertise(switch_advertisement(&c, true));
      radio.advertise(Advertisement {
         service_uuids: vec![SERVICE_V3],
         ..Default::default()
      });
      settle().await;

      let Ok(ScanEvent::Discovered { id, recognized, .. }) = rx.try_recv() else {
         panic!("expected a discovery");
      };
      assert_eq!(id, a);
      assert_eq!(recognized.kind, DeviceKind::Switch);
      assert!(rx.try_recv().is_err());
      assert_eq!(radio.scan_stops(), 0);

      radio.advertise(outlet_advertisement(&b, false, true));
      settle().await;
      assert!(matches!(
         rx.try_recv(),
         Ok(ScanEvent::Discovered { recognized: Recognized { kind: DeviceKind::Outlet, .. }, .. })
      ));
      assert_eq!(radio.scan_stops(), 1);
      assert_eq!(scanner.state().await.unwrap(), ScanState::Stopped);

      // Next cycle after the gap
      time::sleep(Duration::from_secs(11)).await;
      assert_eq!(radio.scan_starts(), 2);
   }

   #[tokio::test(start_paused = true)]
   async fn test_timeout_cycles_and_unreachable() {
      let (radio, scanner, mut rx) = spawn_scanner().await;
      let a = device_id("aaaaaaaaaaaa");
      scanner.start(None, Targets::Only(vec![a.clone()])).await;

      // Each cycle is a 30s scan followed by a 10s gap
      time::sleep(Duration::from_secs(31)).await;
      assert_eq!(radio.scan_stops(), 1);
      assert_eq!(scanner.state().await.unwrap(), ScanState::Stopped);
      time::sleep(Duration::from_secs(10)).await;
      assert_eq!(radio.scan_starts(), 2);

      // Seven misses go unreported
      time::sleep(Duration::from_secs(300 - 41)).await;
      assert!(rx.try_recv().is_err());

      time::sleep(Duration::from_secs(15)).await;
      assert!(matches!(rx.try_recv(), Ok(ScanEvent::Unreachable(id)) if id == a));
   }

   #[tokio::test(start_paused = true)]
   async fn test_unexpected_scan_off_restarts_with_jitter() {
      let (radio, scanner, _rx) = spawn_scanner().await;
      scanner
         .start(None, Targets::Only(vec![device_id("aaaaaaaaaaaa")]))
         .await;
      radio.push(RadioEvent::ScanEnabled(true));
      radio.push(RadioEvent::ScanEnabled(false));
      settle().await;

      time::sleep(Duration::from_millis(1990)).await;
      assert_eq!(radio.scan_starts(), 1);
      time::sleep(Duration::from_secs(8)).await;
      assert_eq!(radio.scan_starts(), 2);
   }

   #[tokio::test(start_paused = true)]
   async fn test_scan_signals_ignored_when_paused() {
      let (radio, scanner, _rx) = spawn_scanner().await;
      scanner
         .start(None, Targets::Only(vec![device_id("aaaaaaaaaaaa")]))
         .await;
      scanner.pause().await;
      radio.push(RadioEvent::ScanEnabled(false));
      settle().await;

      time::sleep(Duration::from_secs(60)).await;
      assert_eq!(radio.scan_starts(), 1);
      assert_eq!(scanner.state().await.unwrap(), ScanState::Paused);
   }

   #[tokio::test(start_paused = true)]
   async fn test_unrestricted_reports_everything_once() {
      let (radio, scanner, mut rx) = spawn_scanner().await;
      scanner.start(None, Targets::Unrestricted).await;
      settle().await;
      let a = device_id("aaaaaaaaaaaa");
      let c = device_id("cccccccccccc");
      radio.advertise(switch_advertisement(&a, true));
      radio.advertise(switch_advertisement(&c, true));
      radio.advertise(switch_advertisement(&c, false));
      settle().await;

      let mut seen = Vec::new();
      while let Ok(ScanEvent::Discovered { id, .. }) = rx.try_recv() {
         seen.push(id);
      }
      assert_eq!(seen, vec![a, c]);
      assert_eq!(radio.scan_stops(), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_unrestricted_cycles_start_fresh() {
      let (radio, scanner, mut rx) = spawn_scanner().await;
      let a = device_id("aaaaaaaaaaaa");
      scanner.start(None, Targets::Unrestricted).await;
      settle().await;
      radio.advertise(switch_advertisement(&a, true));
      radio.advertise(switch_advertisement(&a, true));
      settle().await;
      assert!(matches!(rx.try_recv(), Ok(ScanEvent::Discovered { .. })));
      assert!(rx.try_recv().is_err());

      // A new cycle forgets what the previous one saw.
      scanner.start(None, Targets::Keep).await;
      settle().await;
      radio.advertise(switch_advertisement(&a, false));
      settle().await;
      match rx.try_recv() {
         Ok(ScanEvent::Discovered { id, .. }) => assert_eq!(id, a),
         other => panic!("expected a rediscovery, got {other:?}"),
      }
      assert_eq!(radio.scan_starts(), 2);
   }

   #[tokio::test(start_paused = true)]
   async fn test_setters_apply_to_actor() {
      let (_radio, scanner, _rx) = spawn_scanner().await;
      scanner.set_gap_secs(1).await;
      scanner.set_timeout_secs(60).await;
      let timing = scanner.timing().await.unwrap();
      assert_eq!(timing.gap(), Duration::from_secs(10));
      assert_eq!(timing.timeout(), Duration::from_secs(90));
   }
}
