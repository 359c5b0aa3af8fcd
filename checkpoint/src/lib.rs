pub mod error;
pub mod manifest;
pub mod store;

pub use error::{CheckpointErr, Result};
pub use manifest::{Manifest, RankState};
pub use store::{CheckpointStore, LATEST, StateBundle};
