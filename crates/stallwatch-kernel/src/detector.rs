//! [`BlockingDetector`] – notices when the cooperative runtime stops yielding.
//!
//! The detector is itself a task on the runtime it watches.  Each cycle it
//! arms the alarm for `timeout` and then sleeps for 95% of `timeout`.  While
//! the runtime is cooperating the detector wakes up first and re-arms, so the
//! alarm never fires.  When some task holds the processor for longer than
//! `timeout` the detector cannot be resumed, the alarm fires on its own
//! thread, and [`BlockingDetector::handle_trigger`] runs:
//!
//! 1. snapshot the monitored tasks currently being polled;
//! 2. log one warning with the timeout and the snapshot;
//! 3. re-arm straight away when `aggressive`, otherwise wait for the detector
//!    task to be resumed;
//! 4. build an interrupt from the [`InterruptPolicy`] and post it to the task
//!    holding the processor.
//!
//! Only one detector should be running per [`AlarmSource`]: a second one
//! would overwrite the first one's deadline and handler.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use stallwatch_kernel::{BlockingDetector, InterruptPolicy, checkpoint};
//!
//! # async fn demo() -> Result<(), stallwatch_types::StallError> {
//! let detector = BlockingDetector::builder()
//!     .timeout(Duration::from_millis(250))
//!     .interrupt(InterruptPolicy::alarm())
//!     .build()?;
//! let tracker = detector.tracker().clone();
//! let watchdog = detector.spawn();
//! tokio::task::yield_now().await;
//!
//! let outcome = tracker
//!     .monitor("spin", async {
//!         loop {
//!             if let Err(interrupted) = checkpoint() {
//!                 return interrupted;
//!             }
//!         }
//!     })
//!     .await;
//! println!("{outcome:?}");
//! watchdog.abort();
//! # Ok(())
//! # }
//! ```

use crate::activity::{ActivityTracker, StackSnapshot};
use crate::alarm::{AlarmSource, ThreadAlarm};
use crate::policy::InterruptPolicy;
use stallwatch_types::{InterruptValue, StallError, WatchdogConfig, blocking_message};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Fraction of `timeout` the detector sleeps before re-arming.
///
/// The margin makes sure the detector re-arms well before its own previous
/// deadline while the runtime is cooperating.
pub const RESET_FRACTION: f64 = 0.95;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

struct Shared {
    timeout: Duration,
    aggressive: bool,
    policy: InterruptPolicy,
    alarm: Arc<dyn AlarmSource>,
    tracker: ActivityTracker,
    triggers: AtomicU64,
}

/// Watchdog for a single-threaded cooperative runtime.
///
/// Cloning yields another handle to the same detector.
#[derive(Clone)]
pub struct BlockingDetector {
    shared: Arc<Shared>,
}

impl BlockingDetector {
    pub fn builder() -> DetectorBuilder {
        DetectorBuilder::default()
    }

    /// Build a detector from file-level settings.
    pub fn from_config(
        config: &WatchdogConfig,
        alarm: Arc<dyn AlarmSource>,
        tracker: ActivityTracker,
    ) -> Result<Self, StallError> {
        Self::builder()
            .timeout(config.timeout()?)
            .interrupt(config.interrupt.into())
            .aggressive(config.aggressive)
            .alarm(alarm)
            .tracker(tracker)
            .build()
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    pub fn is_aggressive(&self) -> bool {
        self.shared.aggressive
    }

    pub fn policy(&self) -> &InterruptPolicy {
        &self.shared.policy
    }

    pub fn tracker(&self) -> &ActivityTracker {
        &self.shared.tracker
    }

    pub fn alarm(&self) -> &Arc<dyn AlarmSource> {
        &self.shared.alarm
    }

    /// Number of times the alarm has fired since construction.
    pub fn triggers(&self) -> u64 {
        self.shared.triggers.load(Ordering::SeqCst)
    }

    /// Install the trigger handler and arm the alarm for `timeout`.
    ///
    /// Whatever handler was installed on the alarm before is replaced and not
    /// restored later.
    pub fn reset(&self) {
        let weak = Arc::downgrade(&self.shared);
        self.shared.alarm.install(Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                let detector = BlockingDetector { shared };
                let stack = detector.shared.tracker.snapshot();
                detector.handle_trigger(stack);
            }
        }));
        self.shared.alarm.arm(self.shared.timeout);
    }

    /// Disarm the alarm.
    pub fn clear(&self) {
        self.shared.alarm.disarm();
    }

    /// React to the alarm firing while `stack` was on the processor.
    ///
    /// Runs on the alarm thread and never waits on the runtime.  Returns the
    /// interrupt value produced by the policy, whether or not a monitored
    /// task was there to receive it.
    pub fn handle_trigger(&self, stack: StackSnapshot) -> Option<InterruptValue> {
        let shared = &self.shared;
        let triggers = shared.triggers.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            timeout_secs = shared.timeout.as_secs_f64(),
            triggers,
            task = stack.current().map(|f| f.task.as_str()).unwrap_or("<none>"),
            "{}; stack:\n{}",
            blocking_message(shared.timeout),
            stack
        );

        if shared.aggressive {
            self.reset();
        }

        let value = shared.policy.interrupt_for(shared.timeout)?;
        match shared.tracker.interrupt_current(value.clone()) {
            Some(task) => debug!(task = %task, "interrupt posted to blocking task"),
            None => debug!("no monitored task on the processor; interrupt not delivered"),
        }
        Some(value)
    }

    /// Main loop: re-arm, sleep 95% of `timeout`, repeat.
    ///
    /// Never returns on its own.  Dropping the future (task abort, runtime
    /// shutdown) clears the alarm.
    pub async fn run(self) {
        let _disarm = ClearOnDrop(&self);
        let period = self.shared.timeout.mul_f64(RESET_FRACTION);
        info!(
            timeout_secs = self.shared.timeout.as_secs_f64(),
            aggressive = self.shared.aggressive,
            interrupt = ?self.shared.policy,
            "blocking detector started"
        );
        loop {
            self.reset();
            tokio::time::sleep(period).await;
        }
    }

    /// Spawn [`run`](Self::run) on the current tokio runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

struct ClearOnDrop<'a>(&'a BlockingDetector);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.0.clear();
        debug!("blocking detector stopped; alarm cleared");
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Builder
// ────────────────────────────────────────────────────────────────────────────

/// Builder for [`BlockingDetector`].
///
/// Defaults: one second timeout, [`InterruptPolicy::alarm`], aggressive,
/// a fresh [`ThreadAlarm`] and a fresh [`ActivityTracker`].
pub struct DetectorBuilder {
    timeout: Duration,
    policy: InterruptPolicy,
    aggressive: bool,
    alarm: Option<Arc<dyn AlarmSource>>,
    tracker: Option<ActivityTracker>,
}

impl Default for DetectorBuilder {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            policy: InterruptPolicy::default(),
            aggressive: true,
            alarm: None,
            tracker: None,
        }
    }
}

impl DetectorBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn interrupt(mut self, policy: InterruptPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn aggressive(mut self, aggressive: bool) -> Self {
        self.aggressive = aggressive;
        self
    }

    pub fn alarm(mut self, alarm: Arc<dyn AlarmSource>) -> Self {
        self.alarm = Some(alarm);
        self
    }

    pub fn tracker(mut self, tracker: ActivityTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn build(self) -> Result<BlockingDetector, StallError> {
        if self.timeout.is_zero() {
            return Err(StallError::InvalidConfig(
                "timeout must be greater than zero".to_string(),
            ));
        }
        let alarm = match self.alarm {
            Some(alarm) => alarm,
            None => Arc::new(ThreadAlarm::new()?),
        };
        Ok(BlockingDetector {
            shared: Arc::new(Shared {
                timeout: self.timeout,
                aggressive: self.aggressive,
                policy: self.policy,
                alarm,
                tracker: self.tracker.unwrap_or_default(),
                triggers: AtomicU64::new(0),
            }),
        })
    }
}
