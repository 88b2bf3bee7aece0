//! Process-wide timing and counters for the training phases.
//!
//! Every worker thread records into the same atomics, so totals are summed
//! over workers. The table printed with `--verbose` is the only consumer.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Named metrics tracked by the perf collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    DataLoad,
    Align,
    DiscriminatorPhase,
    GeneratorPhase,
    Validation,
    CheckpointSave,
    CheckpointLoad,
    SyncWait,
    BatchesTrained,
    BatchesSkipped,
    ValidationBatches,
}

impl Metric {
    const ALL: [Metric; 11] = [
        Metric::DataLoad,
        Metric::Align,
        Metric::DiscriminatorPhase,
        Metric::GeneratorPhase,
        Metric::Validation,
        Metric::CheckpointSave,
        Metric::CheckpointLoad,
        Metric::SyncWait,
        Metric::BatchesTrained,
        Metric::BatchesSkipped,
        Metric::ValidationBatches,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Metric::DataLoad => "data.load",
            Metric::Align => "step.align",
            Metric::DiscriminatorPhase => "step.discriminator",
            Metric::GeneratorPhase => "step.generator",
            Metric::Validation => "validation",
            Metric::CheckpointSave => "checkpoint.save",
            Metric::CheckpointLoad => "checkpoint.load",
            Metric::SyncWait => "sync.wait",
            Metric::BatchesTrained => "batches.trained",
            Metric::BatchesSkipped => "batches.skipped",
            Metric::ValidationBatches => "batches.validation",
        }
    }

    /// Counters only accumulate events; every other metric is timed.
    fn is_counter(self) -> bool {
        matches!(
            self,
            Metric::BatchesTrained | Metric::BatchesSkipped | Metric::ValidationBatches
        )
    }
}

#[derive(Default)]
struct Cell {
    micros: AtomicU64,
    events: AtomicU64,
}

struct Collector {
    started: Instant,
    cells: [Cell; Metric::ALL.len()],
}

fn collector() -> &'static Collector {
    static COLLECTOR: OnceLock<Collector> = OnceLock::new();
    COLLECTOR.get_or_init(|| Collector {
        started: Instant::now(),
        cells: Default::default(),
    })
}

fn cell(metric: Metric) -> &'static Cell {
    &collector().cells[metric as usize]
}

/// Timer that charges its lifetime to a metric when dropped.
pub struct PerfSpan {
    metric: Metric,
    start: Instant,
}

impl Drop for PerfSpan {
    fn drop(&mut self) {
        add_duration(self.metric, self.start.elapsed());
    }
}

/// Start timing `metric`.
pub fn span(metric: Metric) -> PerfSpan {
    PerfSpan {
        metric,
        start: Instant::now(),
    }
}

pub fn add_duration(metric: Metric, duration: Duration) {
    let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
    let cell = cell(metric);
    cell.micros.fetch_add(micros, Ordering::Relaxed);
    cell.events.fetch_add(1, Ordering::Relaxed);
}

pub fn add_count(metric: Metric, delta: u64) {
    cell(metric).events.fetch_add(delta, Ordering::Relaxed);
}

/// Table of every metric that recorded at least one event, slowest first.
pub fn report() -> String {
    let collector = collector();
    let mut timed = Vec::new();
    let mut counters = Vec::new();
    for metric in Metric::ALL {
        let cell = cell(metric);
        let events = cell.events.load(Ordering::Relaxed);
        if events == 0 {
            continue;
        }
        if metric.is_counter() {
            counters.push((metric, events));
        } else {
            timed.push((metric, cell.micros.load(Ordering::Relaxed), events));
        }
    }
    timed.sort_by(|a, b| b.1.cmp(&a.1));

    let mut out = String::new();
    let _ = writeln!(
        out,
        "Performance summary (uptime: {:.3}s)",
        collector.started.elapsed().as_secs_f64()
    );
    if timed.is_empty() && counters.is_empty() {
        let _ = writeln!(out, "No performance data recorded.");
        return out;
    }
    if !timed.is_empty() {
        let _ = writeln!(out, "  {:<24} {:>10} {:>8} {:>10}", "phase", "total", "count", "avg");
        for (metric, micros, events) in timed {
            let _ = writeln!(
                out,
                "  {:<24} {:>9.3}s {:>8} {:>8.2}ms",
                metric.name(),
                micros as f64 / 1e6,
                events,
                micros as f64 / events as f64 / 1e3
            );
        }
    }
    for (metric, events) in counters {
        let _ = writeln!(out, "  {:<24} {:>10}", metric.name(), events);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_lists_recorded_metrics() {
        drop(span(Metric::CheckpointLoad));
        add_count(Metric::BatchesSkipped, 2);
        let text = report();
        assert!(text.contains("checkpoint.load"));
        assert!(text.contains("batches.skipped"));
        assert!(!text.contains("No performance data"));
    }

    #[test]
    fn every_metric_has_its_own_cell() {
        for (i, metric) in Metric::ALL.into_iter().enumerate() {
            assert_eq!(metric as usize, i);
        }
    }
}
