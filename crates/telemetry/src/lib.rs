//! Training telemetry
//!
//! [`TrainingReporter`] keeps the per-interval loss and skip bookkeeping of a
//! training loop, writes time-series scalars to a [`MetricSink`] and emits a
//! human-readable summary line every `log_interval` iterations.

pub mod reporter;
pub mod sink;

pub use reporter::{IterationReport, MemoryStats, TrainingReporter};
pub use sink::{CompositeSink, JsonlSink, MetricSink, NoOpSink, TracingSink};
