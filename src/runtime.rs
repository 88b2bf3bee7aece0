//! Worker threads and the collectives they share.
//!
//! [`launch`] starts one thread per worker. Workers never share model state;
//! they only meet at collectives on a [`WorkerGroup`]: labelled sync points
//! after each optimizer phase and scalar reductions after validation. A
//! worker that fails aborts the group so peers blocked in a collective return
//! [`TrainError::WorkerAborted`] instead of waiting forever.

use crate::error::TrainError;
use crate::perf::{self, Metric};
use anyhow::{anyhow, Result};
use std::any::Any;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

#[derive(Debug, Default)]
struct GroupState {
    generation: u64,
    label: Option<String>,
    values: Vec<f64>,
    arrived: usize,
    result: f64,
    aborted: bool,
}

/// Cancellable barrier carrying one `f64` per worker.
#[derive(Debug)]
pub struct WorkerGroup {
    world_size: usize,
    state: Mutex<GroupState>,
    cond: Condvar,
}

impl WorkerGroup {
    pub fn new(world_size: usize) -> Self {
        let world_size = world_size.max(1);
        Self {
            world_size,
            state: Mutex::new(GroupState {
                values: vec![0.0; world_size],
                ..GroupState::default()
            }),
            cond: Condvar::new(),
        }
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake every waiter and fail all current and future collectives.
    pub fn abort(&self) {
        self.lock().aborted = true;
        self.cond.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    /// Block until every worker contributed under `label`; the last arrival
    /// applies `reduce` to the values in rank order.
    fn collective(
        &self,
        rank: usize,
        label: &str,
        value: f64,
        reduce: impl FnOnce(&[f64]) -> f64,
    ) -> Result<f64> {
        let _span = perf::span(Metric::SyncWait);
        let mut state = self.lock();
        if state.aborted {
            return Err(TrainError::WorkerAborted { rank }.into());
        }
        match state.label.as_deref() {
            Some(expected) if expected != label => {
                let err = TrainError::CollectiveMismatch {
                    rank,
                    expected: expected.to_string(),
                    found: label.to_string(),
                };
                state.aborted = true;
                drop(state);
                self.cond.notify_all();
                return Err(err.into());
            }
            Some(_) => {}
            None => state.label = Some(label.to_string()),
        }

        state.values[rank] = value;
        state.arrived += 1;
        let generation = state.generation;
        if state.arrived == self.world_size {
            let result = reduce(&state.values);
            state.result = result;
            state.arrived = 0;
            state.label = None;
            state.generation += 1;
            drop(state);
            self.cond.notify_all();
            return Ok(result);
        }

        while state.generation == generation && !state.aborted {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.generation == generation {
            return Err(TrainError::WorkerAborted { rank }.into());
        }
        Ok(state.result)
    }
}

/// A worker's view of the group.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub rank: usize,
    pub world_size: usize,
    group: Arc<WorkerGroup>,
}

impl WorkerContext {
    pub fn new(rank: usize, group: Arc<WorkerGroup>) -> Self {
        Self {
            rank,
            world_size: group.world_size(),
            group,
        }
    }

    /// A group of one, for running without peers.
    pub fn single() -> Self {
        Self::new(0, Arc::new(WorkerGroup::new(1)))
    }

    /// Rank 0 performs every side effect: logs, scalars and checkpoints.
    pub fn is_master(&self) -> bool {
        self.rank == 0
    }

    /// Sampling seed for this worker.
    pub fn seed(&self, base: u64) -> u64 {
        base.wrapping_add(self.rank as u64)
    }

    /// Barrier named `label`; every worker must pass the same labels in order.
    pub fn sync_point(&self, label: &str) -> Result<()> {
        self.group.collective(self.rank, label, 0.0, |_| 0.0).map(|_| ())
    }

    /// Reduce one scalar per worker; every worker receives the same result.
    pub fn mesh_reduce(&self, key: &str, value: f64, reduce: fn(&[f64]) -> f64) -> Result<f64> {
        self.group.collective(self.rank, key, value, reduce)
    }

    /// Mean over workers of `value`.
    pub fn all_reduce_mean(&self, key: &str, value: f64) -> Result<f64> {
        self.mesh_reduce(key, value, |values| {
            values.iter().sum::<f64>() / values.len() as f64
        })
    }

    pub fn abort(&self) {
        self.group.abort();
    }
}

/// Aborts the group unless disarmed, so a panicking worker releases its peers.
struct AbortOnDrop<'a> {
    group: &'a WorkerGroup,
    armed: bool,
}

impl Drop for AbortOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.group.abort();
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `worker` on `world_size` threads and collect their results in rank order.
///
/// If any worker fails, the returned error is the first failure that is not a
/// [`TrainError::WorkerAborted`] raised on a peer.
pub fn launch<T, F>(world_size: usize, worker: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(WorkerContext) -> Result<T> + Sync,
{
    let group = Arc::new(WorkerGroup::new(world_size));
    let world_size = group.world_size();
    let results: Vec<Result<T>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let ctx = WorkerContext::new(rank, Arc::clone(&group));
                let group = Arc::clone(&group);
                let worker = &worker;
                thread::Builder::new()
                    .name(format!("worker-{rank}"))
                    .spawn_scoped(scope, move || {
                        let mut guard = AbortOnDrop {
                            group: &group,
                            armed: true,
                        };
                        let result = worker(ctx);
                        if result.is_ok() {
                            guard.armed = false;
                        }
                        result
                    })
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| match handle {
                Ok(handle) => handle
                    .join()
                    .unwrap_or_else(|payload| Err(anyhow!("worker {rank} panicked: {}", panic_message(payload)))),
                Err(err) => {
                    group.abort();
                    Err(anyhow!("failed to spawn worker {rank}: {err}"))
                }
            })
            .collect()
    });

    let mut outputs = Vec::with_capacity(world_size);
    let mut root_cause = None;
    let mut aborted = None;
    for result in results {
        match result {
            Ok(value) => outputs.push(value),
            Err(err) => {
                let is_abort = matches!(
                    err.downcast_ref::<TrainError>(),
                    Some(TrainError::WorkerAborted { .. })
                );
                let slot = if is_abort { &mut aborted } else { &mut root_cause };
                if slot.is_none() {
                    *slot = Some(err);
                }
            }
        }
    }
    match root_cause.or(aborted) {
        Some(err) => Err(err),
        None => Ok(outputs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_reduce_mean_is_identical_on_every_worker() {
        let results = launch(4, |ctx| {
            let local = (ctx.rank + 1) as f64;
            ctx.sync_point("discriminator")?;
            let mean = ctx.all_reduce_mean("loss_test", local)?;
            let max = ctx.mesh_reduce("max", local, |v| v.iter().copied().fold(f64::MIN, f64::max))?;
            Ok((mean, max))
        })
        .expect("launch");
        assert_eq!(results, vec![(2.5, 4.0); 4]);
    }

    #[test]
    fn mismatched_labels_fail_the_run() {
        let err = launch(2, |ctx| {
            let label = if ctx.is_master() { "generator" } else { "discriminator" };
            ctx.sync_point(label)
        })
        .expect_err("mismatch");
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::CollectiveMismatch { .. })
        ));
    }

    #[test]
    fn failing_worker_releases_blocked_peers() {
        let err = launch(3, |ctx| {
            if ctx.rank == 2 {
                anyhow::bail!("disk full");
            }
            ctx.sync_point("generator")?;
            ctx.sync_point("generator")
        })
        .expect_err("abort");
        assert_eq!(err.to_string(), "disk full");
    }

    #[test]
    fn panicking_worker_is_reported() {
        let err = launch(2, |ctx| {
            if ctx.rank == 1 {
                panic!("boom");
            }
            ctx.sync_point("generator")
        })
        .expect_err("panic");
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn seeds_differ_per_worker() {
        let group = Arc::new(WorkerGroup::new(2));
        let a = WorkerContext::new(0, Arc::clone(&group));
        let b = WorkerContext::new(1, group);
        assert_ne!(a.seed(1234), b.seed(1234));
        assert!(a.is_master() && !b.is_master());
    }
}
