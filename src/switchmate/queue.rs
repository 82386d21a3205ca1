//! Per-device command queue.
//!
//! State changes for one physical device run strictly one at a time, in
//! arrival order. Each command gets a bounded number of attempts at a fixed
//! interval; a command with newer commands queued behind it gives up early,
//! since only the latest intent is worth applying.

use std::{
   sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
   },
   time::Duration,
};

use async_trait::async_trait;
use log::{debug, error, warn};
use tokio::{
   sync::{mpsc, oneshot},
   time,
};

use crate::{
   error::{Result, SwitchmateError},
   switchmate::protocol::{Channel, DeviceId},
};

/// Attempts per command
pub const MAX_ATTEMPTS: u32 = 5;
/// Pause between attempts
pub const RETRY_INTERVAL: Duration = Duration::from_millis(500);
/// Deadline for one write-and-confirm exchange
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// How a command finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
   /// The device confirmed the change.
   Applied,
   /// A newer command made this one moot.
   Superseded,
}

/// One queued state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTask {
   pub channel: Option<Channel>,
   pub on: bool,
}

/// Reports whether commands are waiting behind the running one.
#[derive(Debug, Clone, Default)]
pub struct Backlog(Arc<AtomicUsize>);

impl Backlog {
   pub fn len(&self) -> usize {
      self.0.load(Ordering::SeqCst)
   }

   pub fn is_superseded(&self) -> bool {
      self.len() > 0
   }
}

/// Device-specific half of a command: one write-and-confirm attempt.
#[async_trait]
pub trait StateWriter: Send + Sync + 'static {
   /// Runs before the first attempt of every command.
   async fn begin(&self) {}

   /// One attempt: connect if needed, write, and await the device's
   /// confirmation. Implementations should check `backlog` between steps.
   async fn attempt(&self, task: CommandTask, backlog: &Backlog) -> Result<Outcome>;

   /// Called when attempts are exhausted and nothing is queued behind.
   async fn abandon(&self);

   /// Runs after every command that was started, whatever its result.
   async fn finish(&self, _backlog: &Backlog) {}
}

struct Job {
   task: CommandTask,
   reply: oneshot::Sender<Result<Outcome>>,
}

/// Handle to a device's command queue.
///
/// This type is cheaply cloneable; the worker stops once every handle is gone.
#[derive(Clone)]
pub struct CommandQueue {
   inbox: mpsc::UnboundedSender<Job>,
   backlog: Backlog,
}

impl CommandQueue {
   pub fn new(id: DeviceId, writer: Arc<dyn StateWriter>) -> Self {
      let (inbox, jobs) = mpsc::unbounded_channel();
      let backlog = Backlog::default();
      tokio::spawn(worker(id, writer, jobs, backlog.clone()));
      Self { inbox, backlog }
   }

   /// Enqueues a state change and waits for its result.
   pub async fn set_state(&self, channel: Option<Channel>, on: bool) -> Result<Outcome> {
      let (reply, rx) = oneshot::channel();
      self.backlog.0.fetch_add(1, Ordering::SeqCst);
      let job = Job {
         task: CommandTask { channel, on },
         reply,
      };
      if self.inbox.send(job).is_err() {
         self.backlog.0.fetch_sub(1, Ordering::SeqCst);
         return Err(SwitchmateError::ManagerShutdown);
      }
      rx.await.map_err(|_| SwitchmateError::ManagerShutdown)?
   }

   /// Commands waiting to run.
   pub fn len(&self) -> usize {
      self.backlog.len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }
}

async fn worker(
   id: DeviceId,
   writer: Arc<dyn StateWriter>,
   mut jobs: mpsc::UnboundedReceiver<Job>,
   backlog: Backlog,
) {
   while let Some(Job { task, reply }) = jobs.recv().await {
      backlog.0.fetch_sub(1, Ordering::SeqCst);
      if backlog.is_superseded() {
         debug!("{id}: command superseded before it started");
         let _ = reply.send(Ok(Outcome::Superseded));
         continue;
      }
      writer.begin().await;
      let result = run(&id, writer.as_ref(), task, &backlog).await;
      writer.finish(&backlog).await;
      let _ = reply.send(result);
   }
   debug!("{id}: command queue closed");
}

async fn run(
   id: &DeviceId,
   writer: &dyn StateWriter,
   task: CommandTask,
   backlog: &Backlog,
) -> Result<Outcome> {
   let mut last_err = None;
   for attempt in 1..=MAX_ATTEMPTS {
      if backlog.is_superseded() {
         debug!("{id}: command superseded");
         return Ok(Outcome::Superseded);
      }
      match writer.attempt(task, backlog).await {
         Ok(outcome) => return Ok(outcome),
         Err(e) if !e.is_retryable() => {
            error!("{id}: {e}");
            last_err = Some(e);
            break;
         },
         Err(e) => {
            warn!("{id}: attempt {attempt}/{MAX_ATTEMPTS} failed: {e}");
            last_err = Some(e);
         },
      }
      if attempt < MAX_ATTEMPTS {
         time::sleep(RETRY_INTERVAL).await;
      }
   }

   if backlog.is_superseded() {
      debug!("{id}: dropping failed command, newer ones are queued");
      return Ok(Outcome::Superseded);
   }
   writer.abandon().await;
   Err(last_err.unwrap_or(SwitchmateError::NotConnected))
}

#[cfg(test)]
mod tests {
   use std::collections::VecDeque;

   use parking_lot::Mutex;

   use super::*;
   use crate::bluetooth::fake::device_id;

   #[derive(Debug, Clone, Copy)]
   enum Step {
      Confirm,
      Timeout,
      Reset,
   }

   #[derive(Default)]
   struct ScriptedWriter {
      script: Mutex<VecDeque<Step>>,
      delay: Duration,
      attempts: Mutex<Vec<CommandTask>>,
      in_flight: AtomicUsize,
      max_in_flight: AtomicUsize,
      abandoned: AtomicUsize,
      begun: AtomicUsize,
      finished: AtomicUsize,
   }

   impl ScriptedWriter {
      fn new(delay: Duration, script: impl IntoIterator<Item = Step>) -> Arc<Self> {
         Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            delay,
            ..Default::default()
         })
      }

      fn attempts(&self) -> Vec<CommandTask> {
         self.attempts.lock().clone()
      }
   }

   #[async_trait]
   impl StateWriter for ScriptedWriter {
      async fn begin(&self) {
         self.begun.fetch_add(1, Ordering::SeqCst);
      }

      async fn attempt(&self, task: CommandTask, _backlog: &Backlog) -> Result<Outcome> {
         let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
         self.max_in_flight.fetch_max(now, Ordering::SeqCst);
         self.attempts.lock().push(task);
         time::sleep(self.delay).await;
         self.in_flight.fetch_sub(1, Ordering::SeqCst);

         let step = self.script.lock().pop_front().unwrap_or(Step::Confirm);
         match step {
            Step::Confirm => Ok(Outcome::Applied),
            Step::Timeout => Err(SwitchmateError::PowerStateTimeout),
            Step::Reset => Err(SwitchmateError::Reset),
         }
      }

      async fn abandon(&self) {
         self.abandoned.fetch_add(1, Ordering::SeqCst);
      }

      async fn finish(&self, _backlog: &Backlog) {
         self.finished.fetch_add(1, Ordering::SeqCst);
      }
   }

   fn queue(writer: &Arc<ScriptedWriter>) -> CommandQueue {
      CommandQueue::new(device_id("c0ffee000001"), writer.clone())
   }

   fn on(on: bool) -> CommandTask {
      CommandTask { channel: None, on }
   }

   #[tokio::test(start_paused = true)]
   async fn test_single_command_applies() {
      let writer = ScriptedWriter::new(Duration::from_millis(10), []);
      let queue = queue(&writer);
      assert_eq!(queue.set_state(None, true).await.unwrap(), Outcome::Applied);
      assert_eq!(writer.attempts(), vec![on(true)]);
      assert_eq!(writer.begun.load(Ordering::SeqCst), 1);
      assert_eq!(writer.finished.load(Ordering::SeqCst), 1);
      assert!(queue.is_empty());
   }

   #[tokio::test(start_paused = true)]
   async fn test_fifo_without_overlap_and_coalescing() {
      let writer = ScriptedWriter::new(Duration::from_millis(100), []);
      let queue = queue(&writer);

      let first = tokio::spawn({
         let queue = queue.clone();
         async move { queue.set_state(None, true).await }
      });
      time::sleep(Duration::from_millis(10)).await;

      // Queued while the first is in flight
      let second = tokio::spawn({
         let queue = queue.clone();
         async move { queue.set_state(None, false).await }
      });
      time::sleep(Duration::from_millis(1)).await;
      let third = tokio::spawn({
         let queue = queue.clone();
         async move { queue.set_state(None, true).await }
      });

      assert_eq!(first.await.unwrap().unwrap(), Outcome::Applied);
      assert_eq!(second.await.unwrap().unwrap(), Outcome::Superseded);
      assert_eq!(third.await.unwrap().unwrap(), Outcome::Applied);

      assert_eq!(writer.attempts(), vec![on(true), on(true)]);
      assert_eq!(writer.max_in_flight.load(Ordering::SeqCst), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_sequential_commands_run_in_order() {
      let writer = ScriptedWriter::new(Duration::from_millis(5), []);
      let queue = queue(&writer);
      for state in [true, false, true] {
         assert_eq!(queue.set_state(None, state).await.unwrap(), Outcome::Applied);
      }
      assert_eq!(writer.attempts(), vec![on(true), on(false), on(true)]);
   }

   #[tokio::test(start_paused = true)]
   async fn test_retries_at_fixed_interval() {
      let writer = ScriptedWriter::new(Duration::ZERO, [Step::Timeout, Step::Timeout]);
      let queue = queue(&writer);
      let start = time::Instant::now();
      assert_eq!(queue.set_state(None, true).await.unwrap(), Outcome::Applied);
      assert_eq!(writer.attempts().len(), 3);
      assert!(start.elapsed() >= RETRY_INTERVAL * 2);
      assert!(start.elapsed() < RETRY_INTERVAL * 2 + Duration::from_millis(10));
      assert_eq!(writer.abandoned.load(Ordering::SeqCst), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_exhaustion_abandons_and_surfaces_error() {
      let writer = ScriptedWriter::new(Duration::ZERO, [Step::Timeout; 5]);
      let queue = queue(&writer);
      let err = queue.set_state(None, false).await.unwrap_err();
      assert!(matches!(err, SwitchmateError::PowerStateTimeout));
      assert_eq!(writer.attempts().len(), MAX_ATTEMPTS as usize);
      assert_eq!(writer.abandoned.load(Ordering::SeqCst), 1);
      assert_eq!(writer.finished.load(Ordering::SeqCst), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_reset_is_not_retried() {
      let writer = ScriptedWriter::new(Duration::ZERO, [Step::Reset]);
      let queue = queue(&writer);
      let err = queue.set_state(None, true).await.unwrap_err();
      assert!(matches!(err, SwitchmateError::Reset));
      assert_eq!(writer.attempts().len(), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_failure_suppressed_when_superseded() {
      let writer = ScriptedWriter::new(Duration::from_millis(100), [Step::Timeout; 5]);
      let queue = queue(&writer);

      let first = tokio::spawn({
         let queue = queue.clone();
         async move { queue.set_state(None, true).await }
      });
      time::sleep(Duration::from_millis(10)).await;
      let second = tokio::spawn({
         let queue = queue.clone();
         async move { queue.set_state(None, false).await }
      });

      assert_eq!(first.await.unwrap().unwrap(), Outcome::Superseded);
      assert_eq!(writer.abandoned.load(Ordering::SeqCst), 0);
      // Second runs with the rest of the script: four timeouts then success.
      assert_eq!(second.await.unwrap().unwrap(), Outcome::Applied);
   }
}
