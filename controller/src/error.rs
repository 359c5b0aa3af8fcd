use std::{error::Error, fmt};

use checkpoint::CheckpointErr;
use coordinator::CoordErr;
use corpus::CorpusErr;

/// The controller module's result type.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// Training loop failures.
///
/// Data errors are recovered below this layer (skip, truncate); everything
/// surfacing here is fatal and requires an operator restart from the last
/// checkpoint, except where noted on the variant.
#[derive(Debug)]
pub enum TrainErr {
    Data(CorpusErr),
    Checkpoint(CheckpointErr),
    Coordination(CoordErr),
    /// Numeric divergence. The run stops immediately and writes no further
    /// checkpoint, so the last good one stays recoverable.
    NonFiniteLoss { step: u64, loss: f32 },
    /// A restored state blob does not match the capability's shape.
    StateMismatch {
        tensor: String,
        got: usize,
        expected: usize,
    },
    /// The loaded manifest has no entry for this rank.
    MissingRankState { rank: usize },
    InvalidConfig(String),
    /// The blocking-pool task died before returning its buffers.
    Join(String),
}

impl fmt::Display for TrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainErr::Data(e) => write!(f, "data error: {e}"),
            TrainErr::Checkpoint(e) => write!(f, "checkpoint error: {e}"),
            TrainErr::Coordination(e) => write!(f, "coordination error: {e}"),
            TrainErr::NonFiniteLoss { step, loss } => {
                write!(f, "non-finite loss {loss} at step {step}")
            }
            TrainErr::StateMismatch {
                tensor,
                got,
                expected,
            } => write!(
                f,
                "state length mismatch for {tensor}: got {got}, expected {expected}"
            ),
            TrainErr::MissingRankState { rank } => {
                write!(f, "checkpoint manifest has no state for rank {rank}")
            }
            TrainErr::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            TrainErr::Join(msg) => write!(f, "compute join error: {msg}"),
        }
    }
}

impl Error for TrainErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainErr::Data(e) => Some(e),
            TrainErr::Checkpoint(e) => Some(e),
            TrainErr::Coordination(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CorpusErr> for TrainErr {
    fn from(value: CorpusErr) -> Self {
        Self::Data(value)
    }
}

impl From<CheckpointErr> for TrainErr {
    fn from(value: CheckpointErr) -> Self {
        Self::Checkpoint(value)
    }
}

impl From<CoordErr> for TrainErr {
    fn from(value: CoordErr) -> Self {
        Self::Coordination(value)
    }
}
