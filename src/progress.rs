//! Workflow progress state, observed by the CLI while a run executes.
//!
//! A single writer (the executor) mutates the state and publishes snapshots
//! through a `watch` channel; observers only ever read the latest value.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preparing,
    Processing,
    Confirming,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressState {
    pub stage: Stage,
    /// Zero-based index of the batch currently being worked.
    pub current_batch: usize,
    pub total_batches: usize,
    pub processed_count: usize,
    pub total_count: usize,
    pub last_error: Option<String>,
}

impl ProgressState {
    pub fn new(total_batches: usize, total_count: usize) -> Self {
        Self {
            stage: Stage::Preparing,
            current_batch: 0,
            total_batches,
            processed_count: 0,
            total_count,
            last_error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.stage, Stage::Complete | Stage::Failed)
    }
}

/// Owns the mutable [`ProgressState`] for one funding run and the sending
/// half of its watch channel. Stage transitions are funneled through the
/// methods below; success-path transitions never move backwards and
/// `Complete`/`Failed` are terminal.
pub struct ProgressTracker {
    state: ProgressState,
    tx: watch::Sender<ProgressState>,
}

impl ProgressTracker {
    pub fn new() -> (Self, watch::Receiver<ProgressState>) {
        let state = ProgressState::new(0, 0);
        let (tx, rx) = watch::channel(state.clone());
        (Self { state, tx }, rx)
    }

    /// Reset for a fresh run. Totals are only known once the plan is
    /// partitioned, so this fires after construction, before the first batch.
    pub fn begin_run(&mut self, total_batches: usize, total_count: usize) {
        debug_assert!(!self.state.is_terminal());
        self.state = ProgressState::new(total_batches, total_count);
        self.publish();
    }

    pub fn begin_batch(&mut self, batch: usize) {
        debug_assert!(matches!(
            self.state.stage,
            Stage::Preparing | Stage::Confirming
        ));
        debug_assert!(batch >= self.state.current_batch);
        self.state.stage = Stage::Processing;
        self.state.current_batch = batch;
        self.publish();
    }

    pub fn confirming(&mut self) {
        debug_assert_eq!(self.state.stage, Stage::Processing);
        self.state.stage = Stage::Confirming;
        self.publish();
    }

    /// Record a confirmed batch of `count` accounts. `processed_count` is
    /// monotonically non-decreasing within a run.
    pub fn batch_confirmed(&mut self, count: usize) {
        debug_assert_eq!(self.state.stage, Stage::Confirming);
        self.state.processed_count += count;
        debug_assert!(self.state.processed_count <= self.state.total_count);
        self.publish();
    }

    pub fn complete(&mut self) {
        debug_assert!(!self.state.is_terminal());
        self.state.stage = Stage::Complete;
        self.publish();
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        debug_assert!(!self.state.is_terminal());
        self.state.stage = Stage::Failed;
        self.state.last_error = Some(message.into());
        self.publish();
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    fn publish(&self) {
        // Nobody listening is fine; the state is still readable via state().
        let _ = self.tx.send(self.state.clone());
    }
}
