//! Scalar reporting sinks and running loss averages.
//!
//! The epoch driver owns one [`Reporter`] per worker run. Only the master
//! writes to a file; every other worker gets a [`NullSink`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// One point of a scalar time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub tag: String,
    pub value: f32,
    pub step: usize,
    pub wall_time: f64,
}

/// Destination for scalar time series.
pub trait ReportSink: Send {
    fn add_scalar(&mut self, tag: &str, value: f32, step: usize) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Appends JSON lines to `<log_dir>/tensorboard/scalars.jsonl`.
pub struct ScalarFileSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ScalarFileSink {
    pub fn create(log_dir: &Path) -> Result<Self> {
        let dir = log_dir.join("tensorboard");
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join("scalars.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReportSink for ScalarFileSink {
    fn add_scalar(&mut self, tag: &str, value: f32, step: usize) -> Result<()> {
        let record = ScalarRecord {
            tag: tag.to_string(),
            value,
            step,
            wall_time: wall_time(),
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ReportSink for NullSink {
    fn add_scalar(&mut self, _tag: &str, _value: f32, _step: usize) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Shared in-memory sink; clones observe the same records.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<ScalarRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ScalarRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Values recorded under `tag`, in insertion order.
    pub fn series(&self, tag: &str) -> Vec<(usize, f32)> {
        self.records()
            .into_iter()
            .filter(|r| r.tag == tag)
            .map(|r| (r.step, r.value))
            .collect()
    }
}

impl ReportSink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f32, step: usize) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ScalarRecord {
                tag: tag.to_string(),
                value,
                step,
                wall_time: wall_time(),
            });
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Owns the sink for one worker run.
pub struct Reporter {
    sink: Box<dyn ReportSink>,
}

impl Reporter {
    pub fn new(sink: impl ReportSink + 'static) -> Self {
        Self {
            sink: Box::new(sink),
        }
    }

    pub fn null() -> Self {
        Self::new(NullSink)
    }

    pub fn scalars(&mut self, values: &[(&str, f32)], step: usize) -> Result<()> {
        for (tag, value) in values {
            self.sink.add_scalar(tag, *value, step)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush()
    }
}

/// Running sums of named losses between two log lines.
#[derive(Debug, Default, Clone)]
pub struct LossAccumulator {
    sums: BTreeMap<&'static str, f64>,
    count: usize,
}

impl LossAccumulator {
    pub fn add(&mut self, values: &[(&'static str, f32)]) {
        for &(tag, value) in values {
            *self.sums.entry(tag).or_insert(0.0) += f64::from(value);
        }
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Mean of `tag` since the last reset, 0 if nothing was added.
    pub fn mean(&self, tag: &str) -> f32 {
        match self.sums.get(tag) {
            Some(sum) if self.count > 0 => (sum / self.count as f64) as f32,
            _ => 0.0,
        }
    }

    /// Every mean, then clear.
    pub fn drain(&mut self) -> Vec<(&'static str, f32)> {
        let means = self
            .sums
            .keys()
            .map(|&tag| (tag, self.mean(tag)))
            .collect();
        self.sums.clear();
        self.count = 0;
        means
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_writes_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = ScalarFileSink::create(dir.path()).expect("sink");
        sink.add_scalar("train/mel_loss", 0.5, 10).expect("write");
        sink.add_scalar("eval/mel_loss", 0.25, 1).expect("write");
        sink.flush().expect("flush");

        let text = std::fs::read_to_string(dir.path().join("tensorboard/scalars.jsonl"))
            .expect("read");
        let records: Vec<ScalarRecord> = text
            .lines()
            .map(|line| serde_json::from_str(line).expect("json"))
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tag, "train/mel_loss");
        assert_eq!(records[1].step, 1);
    }

    #[test]
    fn memory_sink_clones_share_records() {
        let sink = MemorySink::new();
        let mut reporter = Reporter::new(sink.clone());
        reporter.scalars(&[("a", 1.0), ("b", 2.0)], 3).expect("report");
        assert_eq!(sink.series("b"), vec![(3, 2.0)]);
    }

    #[test]
    fn accumulator_averages_and_resets() {
        let mut acc = LossAccumulator::default();
        acc.add(&[("mel", 1.0), ("gen", 4.0)]);
        acc.add(&[("mel", 3.0), ("gen", 0.0)]);
        assert_eq!(acc.mean("mel"), 2.0);
        let drained = acc.drain();
        assert_eq!(drained, vec![("gen", 2.0), ("mel", 2.0)]);
        assert_eq!(acc.count(), 0);
        assert_eq!(acc.mean("mel"), 0.0);
    }
}
