use std::time::{SystemTime, UNIX_EPOCH};

use corpus::PipelineState;
use serde::{Deserialize, Serialize};

/// One rank's captured data-plane state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankState {
    pub rank: usize,
    pub pipeline: PipelineState,
}

/// Checkpoint manifest: everything besides the state blobs needed to resume
/// a run. Immutable once published; superseded, never mutated, by later
/// checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Optimizer updates completed.
    pub step: u64,
    pub epoch: usize,
    pub ranks: Vec<RankState>,
    pub unix_time_secs: u64,
}

impl Manifest {
    pub fn new(step: u64, epoch: usize, ranks: Vec<RankState>) -> Self {
        let unix_time_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            step,
            epoch,
            ranks,
            unix_time_secs,
        }
    }

    /// The captured pipeline state for `rank`, if present.
    pub fn rank_state(&self, rank: usize) -> Option<&PipelineState> {
        self.ranks
            .iter()
            .find(|r| r.rank == rank)
            .map(|r| &r.pipeline)
    }
}
