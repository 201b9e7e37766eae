//! Self-test: one task that blocks and one that cooperates.
//!
//! Each check runs on its own supervised runtime so a failure in the first
//! cannot leave the alarm armed for the second.

use stallwatch_kernel::{InterruptPolicy, checkpoint};
use stallwatch_runtime::{Supervisor, SupervisorExit};
use stallwatch_types::{AlarmInterrupt, Interrupted, StallError, WatchdogConfig};
use std::time::{Duration, Instant};

/// Result of a single self-test check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

/// Longest timeout the self-test accepts; the blocking check spins for up to
/// eight times this long.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(60);

/// Run both checks with `config`'s timeout and aggressiveness.
///
/// The interrupt policy is forced to [`InterruptPolicy::alarm`] for the
/// blocking check, since that check is about the interrupt arriving.
pub fn run(config: &WatchdogConfig) -> Result<Vec<Check>, StallError> {
    let timeout = config.timeout()?;
    if timeout > MAX_TIMEOUT {
        return Err(StallError::InvalidConfig(format!(
            "selftest timeout must be at most {}s, got {}s",
            MAX_TIMEOUT.as_secs(),
            config.timeout_secs
        )));
    }
    Ok(vec![
        blocking_task_is_interrupted(config, timeout)?,
        sleeping_task_is_left_alone(config, timeout)?,
    ])
}

fn blocking_task_is_interrupted(config: &WatchdogConfig, timeout: Duration) -> Result<Check, StallError> {
    let spin_for = timeout.saturating_mul(8);
    let report = Supervisor::new(config.clone())
        .with_policy(InterruptPolicy::alarm())
        .run("blocking-task", |_| async move {
            let target = Instant::now() + spin_for;
            while Instant::now() < target {
                checkpoint()?;
            }
            Ok::<(), Interrupted>(())
        })?;

    let (passed, detail) = match report.exit {
        SupervisorExit::Interrupted(interrupted) => match interrupted.downcast_ref::<AlarmInterrupt>() {
            Some(alarm) => (true, alarm.message().to_string()),
            None => (false, format!("unexpected interrupt: {interrupted}")),
        },
        SupervisorExit::Completed(_) => (false, "AlarmInterrupt not raised!".to_string()),
    };
    Ok(Check {
        name: "AlarmInterrupt is raised in a blocking task",
        passed,
        detail,
    })
}

fn sleeping_task_is_left_alone(config: &WatchdogConfig, timeout: Duration) -> Result<Check, StallError> {
    let sleep_for = timeout.saturating_mul(2);
    let report = Supervisor::new(config.clone())
        .with_policy(InterruptPolicy::alarm())
        .run("sleeping-task", |_| async move {
            tokio::time::sleep(sleep_for).await;
        })?;

    let (passed, detail) = match (&report.exit, report.triggers) {
        (SupervisorExit::Completed(()), 0) => (true, format!("slept {sleep_for:?} undisturbed")),
        (SupervisorExit::Completed(()), n) => (false, format!("{n} unexpected blocking report(s)")),
        (SupervisorExit::Interrupted(interrupted), _) => {
            (false, format!("unexpected interrupt: {interrupted}"))
        }
    };
    Ok(Check {
        name: "AlarmInterrupt is not raised on a cooperative sleep",
        passed,
        detail,
    })
}
