//! [`ActivityTracker`] – which monitored task is on the processor right now.
//!
//! A cooperative runtime cannot tell an outside observer what it is doing, so
//! tasks that should be observable are wrapped in [`Monitored`].  While a
//! monitored task is being polled its frame sits on the tracker's stack; the
//! alarm thread reads that stack to produce a [`StackSnapshot`] and posts
//! interrupts to the innermost frame.
//!
//! # Interrupt delivery
//!
//! Tasks cannot be preempted, so an interrupt is observed cooperatively:
//!
//! - at every [`checkpoint`] call made from inside the task after delivery,
//!   each of which returns `Err(Interrupted)`;
//! - at the end of the current poll or the start of the next one, where the
//!   [`Monitored`] wrapper resolves to `Err(Interrupted)` and drops the task.
//!
//! The second step happens whether or not the task saw the first one: a task
//! that catches the checkpoint error and carries on is still torn down when
//! it returns to the scheduler.  When the interrupted task was awaited from
//! inside another monitored task, the interrupt is posted to that one too, so
//! it keeps travelling outwards to the outermost [`Monitored`].
//!
//! A task that spins without calling [`checkpoint`] is still logged, but only
//! sees the interrupt once it finally returns to the scheduler.

use parking_lot::Mutex;
use stallwatch_types::{InterruptValue, Interrupted};
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Frame>>> = const { RefCell::new(None) };
}

// ────────────────────────────────────────────────────────────────────────────
// Frames
// ────────────────────────────────────────────────────────────────────────────

struct Frame {
    id: u64,
    task: String,
    state: Mutex<FrameState>,
}

#[derive(Default)]
struct FrameState {
    polled_since: Option<Instant>,
    last_checkpoint: Option<&'static Location<'static>>,
    pending: Option<InterruptValue>,
}

impl Frame {
    fn take_pending(&self) -> Option<InterruptValue> {
        self.state.lock().pending.take()
    }

    /// Post `value` unless an interrupt is already pending.
    fn post_if_idle(&self, value: &InterruptValue) {
        self.state.lock().pending.get_or_insert_with(|| value.clone());
    }

    /// The pending interrupt stays in place until the poll boundary.
    fn checkpoint(&self, location: &'static Location<'static>) -> Result<(), Interrupted> {
        let mut state = self.state.lock();
        state.last_checkpoint = Some(location);
        match &state.pending {
            Some(value) => Err(Interrupted::new(value.clone())),
            None => Ok(()),
        }
    }

    fn snapshot(&self, now: Instant) -> FrameSnapshot {
        let state = self.state.lock();
        FrameSnapshot {
            id: self.id,
            task: self.task.clone(),
            busy_for: state
                .polled_since
                .map(|since| now.saturating_duration_since(since))
                .unwrap_or_default(),
            last_checkpoint: state.last_checkpoint.map(|l| l.to_string()),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Snapshot
// ────────────────────────────────────────────────────────────────────────────

/// One monitored task that was being polled when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSnapshot {
    pub id: u64,
    pub task: String,
    /// How long the current poll had been running.
    pub busy_for: Duration,
    /// `file:line:column` of the most recent [`checkpoint`] call, if any.
    pub last_checkpoint: Option<String>,
}

/// The chain of monitored tasks being polled at one instant, outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackSnapshot {
    pub frames: Vec<FrameSnapshot>,
}

impl StackSnapshot {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The innermost task, i.e. the one actually holding the processor.
    pub fn current(&self) -> Option<&FrameSnapshot> {
        self.frames.last()
    }
}

impl fmt::Display for StackSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.frames.is_empty() {
            return writeln!(f, "  <no monitored task is being polled>");
        }
        for frame in &self.frames {
            writeln!(
                f,
                "  task #{} {:?}, polled for {:.3}s",
                frame.id,
                frame.task,
                frame.busy_for.as_secs_f64()
            )?;
            match &frame.last_checkpoint {
                Some(location) => writeln!(f, "    last checkpoint at {location}")?,
                None => writeln!(f, "    no checkpoint reached in this task")?,
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ActivityTracker
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct TrackerInner {
    active: Mutex<Vec<Arc<Frame>>>,
    next_id: AtomicU64,
}

/// Shared registry of the monitored tasks currently being polled.
///
/// Cloning is cheap; all clones observe the same stack.
#[derive(Clone, Default)]
pub struct ActivityTracker {
    inner: Arc<TrackerInner>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `future` so that its polls are visible to the watchdog and it can
    /// receive interrupts.
    pub fn monitor<F: Future>(&self, task: impl Into<String>, future: F) -> Monitored<F> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Monitored {
            future: Box::pin(future),
            frame: Arc::new(Frame {
                id,
                task: task.into(),
                state: Mutex::new(FrameState::default()),
            }),
            tracker: self.clone(),
        }
    }

    /// Spawn a monitored task on the current tokio runtime.
    pub fn spawn<F>(
        &self,
        task: impl Into<String>,
        future: F,
    ) -> JoinHandle<Result<F::Output, Interrupted>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(self.monitor(task, future))
    }

    /// Capture the tasks being polled right now.
    pub fn snapshot(&self) -> StackSnapshot {
        let now = Instant::now();
        let active = self.inner.active.lock();
        StackSnapshot {
            frames: active.iter().map(|frame| frame.snapshot(now)).collect(),
        }
    }

    /// Post `value` to the innermost task being polled.
    ///
    /// Returns the name of the task that will observe it, or `None` when no
    /// monitored task is on the processor.  A value posted to a task that
    /// already has one pending replaces it.  The value stays pending until
    /// the task's next poll boundary.
    pub fn interrupt_current(&self, value: InterruptValue) -> Option<String> {
        let active = self.inner.active.lock();
        let frame = active.last()?;
        frame.state.lock().pending = Some(value);
        Some(frame.task.clone())
    }

    /// Number of monitored tasks currently being polled.
    pub fn depth(&self) -> usize {
        self.inner.active.lock().len()
    }

    fn enter(&self, frame: &Arc<Frame>) -> PollGuard {
        frame.state.lock().polled_since = Some(Instant::now());
        self.inner.active.lock().push(frame.clone());
        let previous = CURRENT.with(|current| current.replace(Some(frame.clone())));
        PollGuard {
            tracker: self.clone(),
            frame: frame.clone(),
            previous,
        }
    }
}

/// Keeps a frame on the stack for the duration of one poll, panics included.
struct PollGuard {
    tracker: ActivityTracker,
    frame: Arc<Frame>,
    previous: Option<Arc<Frame>>,
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| *current.borrow_mut() = self.previous.take());
        let mut active = self.tracker.inner.active.lock();
        if let Some(pos) = active.iter().rposition(|f| Arc::ptr_eq(f, &self.frame)) {
            active.remove(pos);
        }
        drop(active);
        self.frame.state.lock().polled_since = None;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Monitored future
// ────────────────────────────────────────────────────────────────────────────

/// A future whose polls are tracked by an [`ActivityTracker`].
///
/// Resolves to `Ok(output)` when the inner future completes, or
/// `Err(Interrupted)` when the watchdog interrupted it.  A pending interrupt
/// wins over a result produced in the same poll, including a result the task
/// built after handling the interrupt from [`checkpoint`] itself.
pub struct Monitored<F: Future> {
    future: Pin<Box<F>>,
    frame: Arc<Frame>,
    tracker: ActivityTracker,
}

impl<F: Future> Monitored<F> {
    pub fn task(&self) -> &str {
        &self.frame.task
    }
}

impl<F: Future> Future for Monitored<F> {
    type Output = Result<F::Output, Interrupted>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        // The enclosing monitored task, when this one is awaited inside it.
        let parent = CURRENT.with(|current| current.borrow().clone());
        if let Some(value) = this.frame.take_pending() {
            return Poll::Ready(Err(propagate(value, parent.as_deref())));
        }

        let guard = this.tracker.enter(&this.frame);
        let polled = this.future.as_mut().poll(cx);
        drop(guard);

        if let Some(value) = this.frame.take_pending() {
            return Poll::Ready(Err(propagate(value, parent.as_deref())));
        }
        polled.map(Ok)
    }
}

fn propagate(value: InterruptValue, parent: Option<&Frame>) -> Interrupted {
    if let Some(parent) = parent {
        parent.post_if_idle(&value);
    }
    Interrupted::new(value)
}

/// Cooperative interruption point for long-running synchronous code.
///
/// Returns `Err(Interrupted)` when the watchdog has posted an interrupt to the
/// monitored task that is calling it, and records the caller's location for
/// the next stack snapshot.  Once an interrupt is posted every later call
/// fails too, until the task returns to the scheduler.  Outside a monitored
/// task this is a no-op.
#[track_caller]
pub fn checkpoint() -> Result<(), Interrupted> {
    let location = Location::caller();
    CURRENT.with(|current| match current.borrow().as_ref() {
        Some(frame) => frame.checkpoint(location),
        None => Ok(()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stallwatch_types::AlarmInterrupt;

    fn alarm(msg: &str) -> InterruptValue {
        Arc::new(AlarmInterrupt::new(msg))
    }

    #[test]
    fn checkpoint_outside_monitored_task_is_noop() {
        assert!(checkpoint().is_ok());
    }

    #[tokio::test]
    async fn snapshot_lists_task_while_polled() {
        let tracker = ActivityTracker::new();
        let observer = tracker.clone();
        let result = tracker
            .monitor("worker", async move {
                checkpoint().unwrap();
                observer.snapshot()
            })
            .await
            .unwrap();
        assert_eq!(result.frames.len(), 1);
        let frame = result.current().unwrap();
        assert_eq!(frame.task, "worker");
        assert!(frame.last_checkpoint.as_deref().unwrap().contains("activity.rs"));
        assert_eq!(tracker.depth(), 0);
    }

    #[tokio::test]
    async fn nested_tasks_are_listed_outermost_first() {
        let tracker = ActivityTracker::new();
        let inner_tracker = tracker.clone();
        let observer = tracker.clone();
        let snapshot = tracker
            .monitor("outer", async move {
                inner_tracker
                    .monitor("inner", async move { observer.snapshot() })
                    .await
                    .unwrap()
            })
            .await
            .unwrap();
        let names: Vec<_> = snapshot.frames.iter().map(|f| f.task.as_str()).collect();
        assert_eq!(names, ["outer", "inner"]);
    }

    #[tokio::test]
    async fn checkpoint_observes_posted_interrupt() {
        let tracker = ActivityTracker::new();
        let poster = tracker.clone();
        let outcome = tracker
            .monitor("busy", async move {
                let delivered_to = poster.interrupt_current(alarm("stop"));
                assert_eq!(delivered_to.as_deref(), Some("busy"));
                let first = checkpoint().unwrap_err();
                let second = checkpoint().unwrap_err();
                assert!(Arc::ptr_eq(first.value(), second.value()));
                first.downcast_ref::<AlarmInterrupt>().unwrap().message().to_string()
            })
            .await;
        // Handling the checkpoint error inside the task does not end it.
        let interrupted = outcome.unwrap_err();
        assert_eq!(
            interrupted.downcast_ref::<AlarmInterrupt>().unwrap().message(),
            "stop"
        );
    }

    #[tokio::test]
    async fn task_that_swallows_checkpoint_error_is_still_interrupted() {
        let tracker = ActivityTracker::new();
        let poster = tracker.clone();
        let outcome = tracker
            .monitor("stubborn", async move {
                poster.interrupt_current(alarm("stop"));
                match checkpoint() {
                    Ok(()) => "not interrupted",
                    Err(_) => "handled locally",
                }
            })
            .await;
        assert!(outcome.is_err());
        assert_eq!(tracker.depth(), 0);
    }

    #[tokio::test]
    async fn interrupt_travels_to_enclosing_monitored_task() {
        let tracker = ActivityTracker::new();
        let inner_tracker = tracker.clone();
        let poster = tracker.clone();
        let outcome = tracker
            .monitor("outer", async move {
                let inner = inner_tracker
                    .monitor("inner", async move {
                        poster.interrupt_current(alarm("deep"));
                    })
                    .await;
                // The outer task ignores the inner failure and finishes.
                inner.is_err()
            })
            .await;
        let interrupted = outcome.unwrap_err();
        assert_eq!(interrupted.to_string(), "interrupted: deep");
    }

    #[tokio::test]
    async fn unobserved_interrupt_surfaces_at_poll_boundary() {
        let tracker = ActivityTracker::new();
        let poster = tracker.clone();
        let result = tracker
            .monitor("spinner", async move {
                poster.interrupt_current(alarm("late"));
                42
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "interrupted: late");
    }

    #[test]
    fn interrupt_without_running_task_is_dropped() {
        let tracker = ActivityTracker::new();
        assert!(tracker.interrupt_current(alarm("nobody")).is_none());
    }

    #[test]
    fn empty_snapshot_renders_placeholder() {
        let rendered = StackSnapshot::default().to_string();
        assert!(rendered.contains("no monitored task"));
    }

    #[tokio::test]
    async fn spawned_task_reports_output() {
        let tracker = ActivityTracker::new();
        let value = tracker.spawn("adder", async { 1 + 2 }).await.unwrap().unwrap();
        assert_eq!(value, 3);
    }
}
