//! Scalar sinks for time-series metrics

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use runtime_core::Result;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Destination for `(name, value, step)` scalars
pub trait MetricSink: Send + Sync {
    /// Record one scalar at `step`
    fn add_scalar(&self, name: &str, value: f64, step: u64);

    /// Push buffered scalars to their destination
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Drops every scalar
pub struct NoOpSink;

impl MetricSink for NoOpSink {
    fn add_scalar(&self, _name: &str, _value: f64, _step: u64) {}
}

/// Fans scalars out to several sinks
#[derive(Default)]
pub struct CompositeSink {
    sinks: Vec<Box<dyn MetricSink>>,
}

impl CompositeSink {
    pub fn new(sinks: Vec<Box<dyn MetricSink>>) -> Self {
        Self { sinks }
    }

    pub fn add(&mut self, sink: Box<dyn MetricSink>) {
        self.sinks.push(sink);
    }
}

impl MetricSink for CompositeSink {
    fn add_scalar(&self, name: &str, value: f64, step: u64) {
        for sink in &self.sinks {
            sink.add_scalar(name, value, step);
        }
    }

    /// Flushes every sink, returning the first error
    fn flush(&self) -> Result<()> {
        let mut first = None;
        for sink in &self.sinks {
            if let Err(e) = sink.flush() {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// Emits each scalar as a `debug` tracing event
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn add_scalar(&self, name: &str, value: f64, step: u64) {
        tracing::debug!(name, value, step, "scalar");
    }
}

/// One line of a [`JsonlSink`] file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub value: f64,
    pub step: u64,
}

/// Appends one JSON object per scalar to a file
pub struct JsonlSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    /// Open `path` for appending, creating it if needed
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricSink for JsonlSink {
    fn add_scalar(&self, name: &str, value: f64, step: u64) {
        let event = ScalarEvent {
            timestamp: Utc::now(),
            name: name.to_string(),
            value,
            step,
        };
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(name, error = %e, "Dropping unserializable scalar");
                return;
            }
        };
        if let Err(e) = writeln!(self.writer.lock(), "{}", line) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to write scalar");
        }
    }

    fn flush(&self) -> Result<()> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        let _ = self.writer.get_mut().flush();
    }
}
