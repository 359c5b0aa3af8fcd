use std::{error::Error, fmt, time::Duration};

/// The coordinator module's result type.
pub type Result<T> = std::result::Result<T, CoordErr>;

/// Process-group coordination failures. All of these are fatal for the
/// group: recovery is a full-group restart from the common last checkpoint.
#[derive(Debug)]
pub enum CoordErr {
    /// A rank failed to reach the rendezvous within the bounded timeout.
    BarrierTimeout { rank: usize, waited: Duration },
    /// A rank contributed a gradient of the wrong length.
    SizeMismatch {
        rank: usize,
        got: usize,
        expected: usize,
    },
    /// A rank never delivered its state to the gather.
    MissingRank { rank: usize },
    InvalidRank { rank: usize, world_size: usize },
    WorldSizeZero,
}

impl fmt::Display for CoordErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordErr::BarrierTimeout { rank, waited } => write!(
                f,
                "rank {rank} timed out at the barrier after {}s",
                waited.as_secs_f64(),
            ),
            CoordErr::SizeMismatch {
                rank,
                got,
                expected,
            } => write!(
                f,
                "gradient length mismatch from rank {rank}: got {got}, expected {expected}"
            ),
            CoordErr::MissingRank { rank } => {
                write!(f, "rank {rank} missing from state gather")
            }
            CoordErr::InvalidRank { rank, world_size } => {
                write!(f, "rank {rank} out of range for world size {world_size}")
            }
            CoordErr::WorldSizeZero => write!(f, "world size must be greater than 0"),
        }
    }
}

impl Error for CoordErr {}
