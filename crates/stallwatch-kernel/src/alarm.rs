//! [`ThreadAlarm`] – one-shot countdown alarm delivered outside the scheduler.
//!
//! The alarm owns a dedicated control thread that sleeps until the armed
//! deadline and then invokes the installed handler.  Because the handler runs
//! on its own OS thread it fires even when the cooperative runtime being
//! watched never yields again.
//!
//! Only one deadline and one handler exist per alarm.  Arming replaces the
//! previous deadline, installing replaces the previous handler, and arming for
//! [`Duration::ZERO`] cancels.  A handler only runs for the arming that
//! expired: re-arming or cancelling after the deadline passed but before the
//! handler was invoked suppresses it.  Two detectors sharing one alarm will silently
//! overwrite each other; run one detector per alarm.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::time::Duration;
//! use stallwatch_kernel::alarm::{AlarmSource, ThreadAlarm};
//!
//! let alarm = ThreadAlarm::new().unwrap();
//! let fired = Arc::new(AtomicUsize::new(0));
//! let counter = fired.clone();
//! alarm.install(Arc::new(move || {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! }));
//! alarm.arm(Duration::from_millis(10));
//! std::thread::sleep(Duration::from_millis(100));
//! assert_eq!(fired.load(Ordering::SeqCst), 1);
//! ```

use parking_lot::{Condvar, Mutex, ReentrantMutex};
use stallwatch_types::StallError;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Callback invoked when an armed alarm expires.
pub type AlarmHandler = Arc<dyn Fn() + Send + Sync + 'static>;

// ────────────────────────────────────────────────────────────────────────────
// AlarmSource
// ────────────────────────────────────────────────────────────────────────────

/// A facility that fires a callback after a delay, regardless of what the
/// monitored scheduler is doing.
pub trait AlarmSource: Send + Sync {
    /// Replace the handler invoked on expiry.  The previous handler is dropped
    /// and not restored later.
    fn install(&self, handler: AlarmHandler);

    /// Schedule the handler to run once after `after`.  Replaces any pending
    /// deadline; `Duration::ZERO` cancels.
    fn arm(&self, after: Duration);

    /// Cancel any pending deadline.
    fn disarm(&self) {
        self.arm(Duration::ZERO);
    }

    fn is_armed(&self) -> bool;

    fn precision(&self) -> Precision;
}

/// Timer resolution offered by an alarm source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    /// Deadlines are honoured at sub-second resolution.
    #[default]
    SubSecond,
    /// Deadlines are rounded up to whole seconds.
    WholeSeconds,
}

impl Precision {
    /// The delay that will actually be used when `requested` is armed.
    ///
    /// Whole-second precision always rounds **up** so the alarm can never fire
    /// early.  Zero stays zero.
    pub fn effective_delay(self, requested: Duration) -> Duration {
        match self {
            Precision::SubSecond => requested,
            Precision::WholeSeconds => {
                let whole = requested.as_secs();
                if requested.subsec_nanos() > 0 {
                    Duration::from_secs(whole.saturating_add(1))
                } else {
                    Duration::from_secs(whole)
                }
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ThreadAlarm
// ────────────────────────────────────────────────────────────────────────────

/// Longest delay honoured by [`ThreadAlarm`]; longer ones are clamped.
///
/// About 136 years, far enough that the alarm never fires in practice and
/// close enough that `Instant::now() + delay` cannot overflow.
pub const MAX_DELAY: Duration = Duration::from_secs(u32::MAX as u64);

#[derive(Default)]
struct Slot {
    deadline: Option<Instant>,
    /// Bumped by every `arm`, so an expiry can tell whether it is stale.
    generation: u64,
    handler: Option<AlarmHandler>,
    shutdown: bool,
}

struct Shared {
    slot: Mutex<Slot>,
    wake: Condvar,
    /// Held while a handler runs and while arming.  Reentrant so the handler
    /// itself may re-arm.
    firing: ReentrantMutex<()>,
}

/// Alarm backed by a dedicated control thread.
pub struct ThreadAlarm {
    shared: Arc<Shared>,
    precision: Precision,
    worker: Option<JoinHandle<()>>,
}

impl ThreadAlarm {
    /// Start an alarm with sub-second precision.
    pub fn new() -> Result<Self, StallError> {
        Self::with_precision(Precision::SubSecond)
    }

    /// Start an alarm with the given precision.
    pub fn with_precision(precision: Precision) -> Result<Self, StallError> {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::default()),
            wake: Condvar::new(),
            firing: ReentrantMutex::new(()),
        });
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("stallwatch-alarm".to_string())
            .spawn(move || alarm_thread(&worker_shared))?;
        debug!(?precision, "alarm control thread started");
        Ok(Self {
            shared,
            precision,
            worker: Some(worker),
        })
    }

    /// The instant at which the pending alarm will fire, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.shared.slot.lock().deadline
    }
}

impl AlarmSource for ThreadAlarm {
    fn install(&self, handler: AlarmHandler) {
        self.shared.slot.lock().handler = Some(handler);
    }

    fn arm(&self, after: Duration) {
        let delay = self.precision.effective_delay(after).min(MAX_DELAY);
        let _firing = self.shared.firing.lock();
        let mut slot = self.shared.slot.lock();
        slot.generation = slot.generation.wrapping_add(1);
        slot.deadline = if delay.is_zero() {
            None
        } else {
            Instant::now().checked_add(delay)
        };
        trace!(?delay, armed = slot.deadline.is_some(), "alarm armed");
        drop(slot);
        self.shared.wake.notify_one();
    }

    fn is_armed(&self) -> bool {
        self.shared.slot.lock().deadline.is_some()
    }

    fn precision(&self) -> Precision {
        self.precision
    }
}

impl Drop for ThreadAlarm {
    fn drop(&mut self) {
        {
            let mut slot = self.shared.slot.lock();
            slot.shutdown = true;
            slot.deadline = None;
        }
        self.shared.wake.notify_one();
        // The last handle may be released by the handler itself, on the
        // control thread, which must not join itself.
        if let Some(worker) = self.worker.take()
            && worker.thread().id() != std::thread::current().id()
            && worker.join().is_err()
        {
            debug!("alarm control thread panicked");
        }
    }
}

fn alarm_thread(shared: &Shared) {
    let mut slot = shared.slot.lock();
    loop {
        if slot.shutdown {
            return;
        }
        match slot.deadline {
            None => shared.wake.wait(&mut slot),
            Some(deadline) if Instant::now() >= deadline => {
                // One-shot: disarm before running so the handler can re-arm.
                slot.deadline = None;
                let expired = slot.generation;
                drop(slot);
                fire(shared, expired);
                slot = shared.slot.lock();
            }
            Some(deadline) => {
                let _ = shared.wake.wait_until(&mut slot, deadline);
            }
        }
    }
}

/// Run the handler unless the alarm was re-armed, cancelled or shut down
/// since the arming numbered `expired`.
fn fire(shared: &Shared, expired: u64) {
    let _firing = shared.firing.lock();
    let handler = {
        let slot = shared.slot.lock();
        if slot.shutdown || slot.generation != expired {
            trace!("stale alarm expiry suppressed");
            return;
        }
        slot.handler.clone()
    };
    if let Some(handler) = handler {
        handler();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn counting_handler() -> (AlarmHandler, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handler: AlarmHandler = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (handler, fired)
    }

    #[test]
    fn fires_once_after_deadline() {
        let alarm = ThreadAlarm::new().unwrap();
        let (handler, fired) = counting_handler();
        alarm.install(handler);
        alarm.arm(Duration::from_millis(20));
        assert!(alarm.is_armed());
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!alarm.is_armed());
    }

    #[test]
    fn arming_zero_cancels() {
        let alarm = ThreadAlarm::new().unwrap();
        let (handler, fired) = counting_handler();
        alarm.install(handler);
        alarm.arm(Duration::from_millis(30));
        alarm.arm(Duration::ZERO);
        assert!(!alarm.is_armed());
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rearming_pushes_deadline_back() {
        let alarm = ThreadAlarm::new().unwrap();
        let (handler, fired) = counting_handler();
        alarm.install(handler);
        for _ in 0..5 {
            alarm.arm(Duration::from_millis(60));
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        alarm.disarm();
    }

    #[test]
    fn install_replaces_previous_handler() {
        let alarm = ThreadAlarm::new().unwrap();
        let (first, first_fired) = counting_handler();
        let (second, second_fired) = counting_handler();
        alarm.install(first);
        alarm.install(second);
        alarm.arm(Duration::from_millis(10));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(first_fired.load(Ordering::SeqCst), 0);
        assert_eq!(second_fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_rearm_from_callback() {
        let alarm = Arc::new(ThreadAlarm::new().unwrap());
        let fired = Arc::new(AtomicUsize::new(0));
        let weak = Arc::downgrade(&alarm);
        let counter = fired.clone();
        alarm.install(Arc::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2
                && let Some(alarm) = weak.upgrade()
            {
                alarm.arm(Duration::from_millis(10));
            }
        }));
        alarm.arm(Duration::from_millis(10));
        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn huge_delay_is_clamped_instead_of_overflowing() {
        let alarm = ThreadAlarm::new().unwrap();
        let (handler, fired) = counting_handler();
        alarm.install(handler);
        alarm.arm(Duration::MAX);
        assert!(alarm.is_armed());
        let deadline = alarm.deadline().unwrap();
        assert!(deadline > Instant::now() + Duration::from_secs(365 * 24 * 3600));
        alarm.disarm();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let alarm = ThreadAlarm::with_precision(Precision::WholeSeconds).unwrap();
        alarm.arm(Duration::MAX);
        assert!(alarm.is_armed());
    }

    #[test]
    fn rearm_after_expiry_suppresses_stale_handler() {
        let alarm = ThreadAlarm::new().unwrap();
        let (handler, fired) = counting_handler();
        alarm.install(handler);

        // Hold the firing gate so an expiry has to wait for it.
        let gate = alarm.shared.firing.lock();
        alarm.arm(Duration::from_millis(10));
        thread::sleep(Duration::from_millis(60));
        alarm.arm(Duration::from_secs(60));
        drop(gate);

        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(alarm.is_armed());
        alarm.disarm();
    }

    #[test]
    fn arming_waits_for_running_handler() {
        let alarm = Arc::new(ThreadAlarm::new().unwrap());
        let (started_tx, started_rx) = std::sync::mpsc::channel::<()>();
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();
        alarm.install(Arc::new(move || {
            let _ = started_tx.send(());
            thread::sleep(Duration::from_millis(50));
            done.store(1, Ordering::SeqCst);
        }));
        alarm.arm(Duration::from_millis(5));
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        alarm.disarm();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn whole_seconds_round_up() {
        let p = Precision::WholeSeconds;
        assert_eq!(p.effective_delay(Duration::from_millis(250)), Duration::from_secs(1));
        assert_eq!(p.effective_delay(Duration::from_millis(1001)), Duration::from_secs(2));
        assert_eq!(p.effective_delay(Duration::from_secs(3)), Duration::from_secs(3));
        assert_eq!(p.effective_delay(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn sub_second_is_exact() {
        let d = Duration::from_millis(250);
        assert_eq!(Precision::SubSecond.effective_delay(d), d);
    }

    #[test]
    fn whole_second_alarm_reports_rounded_deadline() {
        let alarm = ThreadAlarm::with_precision(Precision::WholeSeconds).unwrap();
        let before = Instant::now();
        alarm.arm(Duration::from_millis(100));
        let deadline = alarm.deadline().unwrap();
        assert!(deadline >= before + Duration::from_secs(1));
        alarm.disarm();
        assert_eq!(alarm.precision(), Precision::WholeSeconds);
    }
}
