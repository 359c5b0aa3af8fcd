pub mod capability;
pub mod config;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod stop;

pub use capability::{ModelCapability, ModelState};
pub use config::TrainerConfig;
pub use controller::{Controller, Phase, RunSummary};
pub use error::{Result, TrainErr};
pub use metrics::TrainMetrics;
pub use stop::StopToken;
