pub mod error;
pub mod partition;
pub mod sync;

pub use error::{CoordErr, Result};
pub use partition::{partition, partition_range};
pub use sync::{GradientSync, LocalGroup, WRITER_RANK, is_checkpoint_writer};
