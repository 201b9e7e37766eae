//! `stallwatch-kernel` – blocking detection for cooperative runtimes
//!
//! A single-threaded tokio runtime only switches tasks at `.await` points.
//! One task that spins, or calls blocking code, freezes every other task.
//! This crate notices that from outside the runtime and reacts.
//!
//! # Modules
//!
//! - [`alarm`] – [`ThreadAlarm`][alarm::ThreadAlarm]: a one-shot countdown
//!   alarm whose handler runs on a dedicated control thread, so it fires even
//!   when the runtime never yields.
//! - [`activity`] – [`ActivityTracker`][activity::ActivityTracker] and
//!   [`Monitored`][activity::Monitored]: record which task is being polled,
//!   produce stack snapshots, and carry interrupts into tasks, observed at
//!   [`checkpoint`][activity::checkpoint] calls and poll boundaries.
//! - [`policy`] – [`InterruptPolicy`][policy::InterruptPolicy]: log only,
//!   raise a fixed value, or build a fresh value per trigger.
//! - [`detector`] – [`BlockingDetector`][detector::BlockingDetector]: the
//!   watchdog task itself.
//! - [`fork`] – [`WorkerPool`][fork::WorkerPool] and `fork_safely`: drain
//!   background workers before forking the process.

pub mod activity;
pub mod alarm;
pub mod detector;
pub mod fork;
pub mod policy;

pub use activity::{ActivityTracker, FrameSnapshot, Monitored, StackSnapshot, checkpoint};
pub use alarm::{AlarmHandler, AlarmSource, Precision, ThreadAlarm};
pub use detector::{BlockingDetector, DetectorBuilder, RESET_FRACTION};
#[cfg(unix)]
pub use fork::{ForkResult, fork_safely};
pub use fork::{WorkerPool, prepare_for_fork};
pub use policy::{InterruptFactory, InterruptPolicy};
