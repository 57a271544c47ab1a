//! Per-iteration training telemetry

use chrono::Local;
use runtime_core::{LoggingArgs, ProcessGroup, TrainingArgs};
use std::collections::BTreeMap;
use std::fmt::Write;
use tracing::info;

use crate::sink::MetricSink;

/// Accelerator memory counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemoryStats {
    pub reserved_bytes: u64,
    pub allocated_bytes: u64,
    pub allocation_count: u64,
}

/// What one training iteration produced
#[derive(Debug, Clone, Default)]
pub struct IterationReport {
    pub iteration: u64,
    pub losses: BTreeMap<String, f64>,
    pub learning_rate: f64,
    /// Only set on the first and last pipeline stages when a decoupled rate is configured
    pub decoupled_learning_rate: Option<f64>,
    pub loss_scale: f64,
    /// The optimizer step was skipped, e.g. on gradient overflow
    pub skipped: bool,
    pub grad_norm: Option<f64>,
    pub params_norm: Option<f64>,
    pub num_zeros_in_grad: Option<f64>,
    pub consumed_train_samples: u64,
    pub num_microbatches: u64,
    pub memory: Option<MemoryStats>,
}

/// Totals since the last log line
#[derive(Debug, Default)]
struct IntervalTotals {
    advanced: u64,
    skipped: u64,
    nan: u64,
    losses: BTreeMap<String, f64>,
}

/// Accumulates training statistics and reports them at fixed intervals
pub struct TrainingReporter {
    logging: LoggingArgs,
    train_iters: u64,
    micro_batch_size: u64,
    data_parallel_size: usize,
    world_size: usize,
    /// Only the last rank prints summary lines and writes scalars
    emit: bool,
    sink: Box<dyn MetricSink>,
    totals: IntervalTotals,
    report_memory: bool,
    last_line: Option<String>,
}

fn due(iteration: u64, interval: u64) -> bool {
    interval > 0 && iteration % interval == 0
}

impl TrainingReporter {
    pub fn new(args: &TrainingArgs, group: &dyn ProcessGroup, sink: Box<dyn MetricSink>) -> Self {
        let topology = group.topology();
        Self {
            logging: args.logging.clone(),
            train_iters: args.train_iters,
            micro_batch_size: args.micro_batch_size,
            data_parallel_size: topology.data,
            world_size: topology.world_size(),
            emit: group.is_last_rank(),
            sink,
            totals: IntervalTotals::default(),
            report_memory: true,
            last_line: None,
        }
    }

    /// Most recent summary line, if one has been emitted
    pub fn last_line(&self) -> Option<&str> {
        self.last_line.as_deref()
    }

    /// Account for one iteration, writing scalars and the summary line when
    /// their intervals come due.
    ///
    /// Returns whether memory still needs to be reported.
    pub fn log_training(&mut self, report: &IterationReport) -> bool {
        self.accumulate(report);

        if self.emit && due(report.iteration, self.logging.tensorboard_log_interval) {
            self.write_scalars(report);
        }

        if due(report.iteration, self.logging.log_interval) {
            let line = self.summary_line(report);
            if self.emit {
                info!("{}", line);
            }
            self.last_line = Some(line);

            if self.report_memory && report.learning_rate > 0.0 {
                if let Some(memory) = report.memory {
                    info!(
                        iteration = report.iteration,
                        reserved_mb = memory.reserved_bytes / NUM_BYTES_IN_MEGABYTE,
                        allocated_mb = memory.allocated_bytes / NUM_BYTES_IN_MEGABYTE,
                        allocations = memory.allocation_count,
                        "Memory after {} iterations",
                        report.iteration
                    );
                }
                self.report_memory = false;
            }
        }

        self.report_memory
    }

    /// Write validation losses as `validation: <key>` scalars
    pub fn log_validation(&self, losses: &BTreeMap<String, f64>, iteration: u64, consumed_train_samples: u64) {
        if !self.emit {
            return;
        }
        for (key, value) in losses {
            let name = format!("validation: {}", key);
            self.sink.add_scalar(&name, *value, iteration);
            self.sink
                .add_scalar(&format!("{} vs samples", name), *value, consumed_train_samples);
        }
    }

    pub fn flush(&self) -> runtime_core::Result<()> {
        self.sink.flush()
    }

    fn accumulate(&mut self, report: &IterationReport) {
        let totals = &mut self.totals;
        if report.skipped {
            totals.skipped += 1;
            let got_nan = report.losses.values().any(|v| v.is_nan() || v.is_infinite());
            totals.nan += u64::from(got_nan);
        } else {
            totals.advanced += 1;
            for (key, value) in &report.losses {
                *totals.losses.entry(key.clone()).or_insert(0.0) += value;
            }
        }
    }

    fn write_scalars(&self, report: &IterationReport) {
        let step = report.iteration;
        let samples = report.consumed_train_samples;
        let sink = self.sink.as_ref();
        let pair = |name: &str, value: f64| {
            sink.add_scalar(name, value, step);
            sink.add_scalar(&format!("{} vs samples", name), value, samples);
        };

        if self.logging.log_learning_rate_to_tensorboard {
            sink.add_scalar("learning-rate", report.learning_rate, step);
            if let Some(decoupled) = report.decoupled_learning_rate {
                sink.add_scalar("decoupled-learning-rate", decoupled, step);
            }
            sink.add_scalar("learning-rate vs samples", report.learning_rate, samples);
        }
        if self.logging.log_batch_size_to_tensorboard {
            pair("batch-size", self.batch_size(report) as f64);
        }
        for (key, value) in &report.losses {
            pair(key, *value);
        }
        if self.logging.log_loss_scale_to_tensorboard {
            pair("loss-scale", report.loss_scale);
        }
        if self.logging.log_world_size_to_tensorboard {
            pair("world-size", self.world_size as f64);
        }
        if let Some(grad_norm) = report.grad_norm {
            pair("grad-norm", grad_norm);
        }
        if let Some(num_zeros) = report.num_zeros_in_grad {
            pair("num-zeros", num_zeros);
        }
        if let Some(params_norm) = report.params_norm {
            pair("params-norm", params_norm);
        }
        if self.logging.log_memory_to_tensorboard {
            if let Some(memory) = report.memory {
                sink.add_scalar("mem-reserved-bytes", memory.reserved_bytes as f64, step);
                sink.add_scalar("mem-allocated-bytes", memory.allocated_bytes as f64, step);
                sink.add_scalar("mem-allocated-count", memory.allocation_count as f64, step);
            }
        }
    }

    /// Build the summary line and reset the interval totals
    fn summary_line(&mut self, report: &IterationReport) -> String {
        let totals = std::mem::take(&mut self.totals);
        let mut line = format!(" [{}]", Local::now().format("%Y-%m-%d %H:%M:%S"));

        // Writing to a String cannot fail
        let _ = write!(line, " iteration {:8}/{:8} |", report.iteration, self.train_iters);
        let _ = write!(line, " consumed samples: {:12} |", report.consumed_train_samples);
        let _ = write!(line, " learning rate: {:.6E} |", report.learning_rate);
        if let Some(decoupled) = report.decoupled_learning_rate {
            let _ = write!(line, " decoupled learning rate: {:.6E} |", decoupled);
        }
        for (key, total) in &totals.losses {
            let avg = total / totals.advanced.max(1) as f64;
            if avg > 0.0 {
                let _ = write!(line, " {}: {:.4} |", key, avg);
            }
        }
        let _ = write!(line, " loss scale: {:.1} |", report.loss_scale);
        if let Some(grad_norm) = report.grad_norm {
            let _ = write!(line, " grad norm: {:.3} |", grad_norm);
        }
        if let Some(num_zeros) = report.num_zeros_in_grad {
            let _ = write!(line, " num zeros: {:.1} |", num_zeros);
        }
        if let Some(params_norm) = report.params_norm {
            let _ = write!(line, " params norm: {:.3} |", params_norm);
        }
        let _ = write!(line, " number of skipped iterations: {:3} |", totals.skipped);
        let _ = write!(line, " number of nan iterations: {:3} |", totals.nan);
        line
    }

    fn batch_size(&self, report: &IterationReport) -> u64 {
        self.micro_batch_size * self.data_parallel_size as u64 * report.num_microbatches
    }
}

const NUM_BYTES_IN_MEGABYTE: u64 = 1024 * 1024;
