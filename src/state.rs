//! Counters that persist across checkpoints.

/// Epoch, optimization-step and best-loss bookkeeping for one worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingState {
    /// Index of the current (or next) epoch, zero-based.
    pub epoch: usize,
    /// Optimization steps taken; skipped batches do not count.
    pub iters: usize,
    /// Lowest validation loss seen at an epoch checkpoint.
    pub best_loss: f32,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            epoch: 0,
            iters: 0,
            best_loss: f32::INFINITY,
        }
    }
}

impl TrainingState {
    /// State after restoring a checkpoint at `epoch` with `iters` steps.
    pub fn resumed(epoch: usize, iters: usize) -> Self {
        Self {
            epoch,
            iters,
            ..Self::default()
        }
    }

    /// Record a validation loss, returning true when it is a new best.
    pub fn observe_validation(&mut self, loss: f32) -> bool {
        if loss < self.best_loss {
            self.best_loss = loss;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::TrainingState;

    #[test]
    fn best_loss_only_decreases() {
        let mut state = TrainingState::resumed(3, 120);
        assert_eq!(state.epoch, 3);
        assert!(state.observe_validation(0.8));
        assert!(!state.observe_validation(0.9));
        assert!(state.observe_validation(0.5));
        assert_eq!(state.best_loss, 0.5);
        // NaN never replaces a finite best.
        assert!(!state.observe_validation(f32::NAN));
    }
}
