/// Running counters for one rank's training loop.
#[derive(Debug, Default, Clone)]
pub struct TrainMetrics {
    /// Optimizer updates applied.
    pub steps: u64,
    pub batches: u64,
    pub records: u64,
    pub skipped_records: u64,
    pub truncated_records: u64,
    pub checkpoints_written: u64,
    pub epochs_completed: usize,
    pub last_loss: f32,
}

impl TrainMetrics {
    #[inline]
    pub fn bump_step(&mut self) {
        self.steps += 1;
    }

    #[inline]
    pub fn add_batches(&mut self, n: usize) {
        self.batches += n as u64;
    }

    #[inline]
    pub fn add_records(&mut self, n: usize) {
        self.records += n as u64;
    }

    #[inline]
    pub fn bump_checkpoint(&mut self) {
        self.checkpoints_written += 1;
    }
}
