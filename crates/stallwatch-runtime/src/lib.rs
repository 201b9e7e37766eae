//! `stallwatch-runtime` – hosting cooperative tasks under a blocking detector
//!
//! # Modules
//!
//! - [`supervisor`] – [`Supervisor`][supervisor::Supervisor]: builds a
//!   current-thread tokio runtime, starts a
//!   [`BlockingDetector`][stallwatch_kernel::BlockingDetector] on it and runs a
//!   root task, catching [`Interrupted`][stallwatch_types::Interrupted]
//!   explicitly.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: installs the
//!   global `tracing` subscriber with an optional OTLP span exporter.  Set
//!   `OTEL_EXPORTER_OTLP_ENDPOINT` to enable trace export.

pub mod supervisor;
pub mod telemetry;

pub use supervisor::{Supervisor, SupervisorExit, SupervisorReport};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
