//! [`Supervisor`] – hosts a cooperative runtime under a blocking detector.
//!
//! The supervisor is the one place that is expected to see
//! [`Interrupted`]: it builds a current-thread tokio runtime, starts a
//! [`BlockingDetector`] on it, runs the caller's root task inside a
//! [`Monitored`](stallwatch_kernel::Monitored) wrapper and reports whether the
//! task completed or was interrupted.  Tearing the runtime down stops the
//! detector, which clears its alarm.
//!
//! # Example
//!
//! ```rust,no_run
//! use stallwatch_runtime::{Supervisor, SupervisorExit};
//! use stallwatch_types::WatchdogConfig;
//!
//! let report = Supervisor::new(WatchdogConfig::default())
//!     .run("main", |_tracker| async {
//!         tokio::time::sleep(std::time::Duration::from_millis(10)).await;
//!         "done"
//!     })
//!     .unwrap();
//! assert!(matches!(report.exit, SupervisorExit::Completed("done")));
//! ```

use stallwatch_kernel::{ActivityTracker, BlockingDetector, InterruptPolicy, Precision, ThreadAlarm};
use stallwatch_types::{Interrupted, StallError, WatchdogConfig};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// How the supervised root task ended.
#[derive(Debug)]
pub enum SupervisorExit<T> {
    Completed(T),
    /// The detector interrupted the task.
    Interrupted(Interrupted),
}

/// Outcome of one [`Supervisor::run`].
#[derive(Debug)]
pub struct SupervisorReport<T> {
    pub exit: SupervisorExit<T>,
    /// Blocking reports emitted while the task ran.
    pub triggers: u64,
}

/// Runs root tasks on a fresh cooperative runtime with a blocking detector.
#[derive(Debug, Clone)]
pub struct Supervisor {
    config: WatchdogConfig,
    policy: Option<InterruptPolicy>,
    precision: Precision,
}

impl Supervisor {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            policy: None,
            precision: Precision::SubSecond,
        }
    }

    /// Use `policy` instead of the one implied by the config's interrupt mode.
    pub fn with_policy(mut self, policy: InterruptPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Run the task produced by `root` until it completes or is interrupted.
    ///
    /// `root` receives the runtime's [`ActivityTracker`] so it can spawn
    /// further monitored tasks.
    pub fn run<F, Fut>(&self, task: &str, root: F) -> Result<SupervisorReport<Fut::Output>, StallError>
    where
        F: FnOnce(ActivityTracker) -> Fut,
        Fut: Future,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name("stallwatch-runtime")
            .build()?;

        let alarm = Arc::new(ThreadAlarm::with_precision(self.precision)?);
        let tracker = ActivityTracker::new();
        let policy = self
            .policy
            .clone()
            .unwrap_or_else(|| self.config.interrupt.into());
        let detector = BlockingDetector::builder()
            .timeout(self.config.timeout()?)
            .interrupt(policy)
            .aggressive(self.config.aggressive)
            .alarm(alarm)
            .tracker(tracker.clone())
            .build()?;

        info!(task, "supervisor starting root task");
        let exit = runtime.block_on(async {
            let watchdog = detector.clone().spawn();
            // Let the detector arm before the root task gets the processor.
            tokio::task::yield_now().await;

            let outcome = tracker.monitor(task, root(tracker.clone())).await;

            watchdog.abort();
            if let Err(e) = watchdog.await
                && !e.is_cancelled()
            {
                warn!(error = %e, "blocking detector task failed");
            }
            outcome
        });

        let exit = match exit {
            Ok(output) => {
                info!(task, triggers = detector.triggers(), "root task completed");
                SupervisorExit::Completed(output)
            }
            Err(interrupted) => {
                warn!(task, error = %interrupted, "root task interrupted by blocking detector");
                SupervisorExit::Interrupted(interrupted)
            }
        };
        Ok(SupervisorReport {
            exit,
            triggers: detector.triggers(),
        })
    }
}
