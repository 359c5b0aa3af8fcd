use std::{num::NonZeroUsize, path::PathBuf};

use corpus::{EpochMode, PipelineConfig, RecordPolicy};
use serde::Deserialize;

use crate::error::{Result, TrainErr};

/// Immutable execution bounds for one training run.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainerConfig {
    /// Full corpus shard list; each rank reads its disjoint partition.
    pub shards: Vec<PathBuf>,
    pub checkpoint_dir: PathBuf,
    /// Secondary checkpoint location tried once after a failed write.
    #[serde(default)]
    pub fallback_dir: Option<PathBuf>,

    /// Shuffle window capacity W: memory versus shuffle quality.
    pub shuffle_window_size: NonZeroUsize,
    pub batch_size: NonZeroUsize,
    /// Batches accumulated into one optimizer update.
    pub grad_accum_steps: NonZeroUsize,
    pub checkpoint_interval_steps: NonZeroUsize,
    pub checkpoint_retain_count: NonZeroUsize,
    /// Hard per-row length ceiling; longer rows are truncated and flagged.
    pub max_seq_len_ceiling: NonZeroUsize,

    /// Resume from the latest checkpoint if one exists.
    #[serde(default)]
    pub resume: bool,
    /// Shuffle seed; omitted means OS entropy (run not reproducible).
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub epoch_mode: EpochMode,
    #[serde(default)]
    pub record_policy: RecordPolicy,
    #[serde(default = "default_true")]
    pub prefetch: bool,

    #[serde(default)]
    pub max_steps: Option<u64>,
    #[serde(default)]
    pub max_epochs: Option<usize>,

    /// Bound on the interrupt-time checkpoint; on expiry the process exits
    /// anyway, losing only the unsaved partial progress.
    #[serde(default = "default_grace_secs")]
    pub interrupt_grace_secs: u64,
    #[serde(default = "default_barrier_timeout_secs")]
    pub barrier_timeout_secs: u64,
    #[serde(default = "default_log_every_steps")]
    pub log_every_steps: u64,
}

fn default_true() -> bool {
    true
}

fn default_grace_secs() -> u64 {
    30
}

fn default_barrier_timeout_secs() -> u64 {
    60
}

fn default_log_every_steps() -> u64 {
    50
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.shards.is_empty() {
            return Err(TrainErr::InvalidConfig(
                "at least one shard is required".into(),
            ));
        }

        // Every encoded row carries two end-of-sequence ids.
        if self.max_seq_len_ceiling.get() < 2 {
            return Err(TrainErr::InvalidConfig(
                "max_seq_len_ceiling must be at least 2".into(),
            ));
        }

        if self.log_every_steps == 0 {
            return Err(TrainErr::InvalidConfig(
                "log_every_steps must be greater than 0".into(),
            ));
        }

        if self.epoch_mode == EpochMode::Wrap
            && self.max_steps.is_none()
            && self.max_epochs.is_none()
        {
            return Err(TrainErr::InvalidConfig(
                "wrap mode requires max_steps or max_epochs".into(),
            ));
        }

        Ok(())
    }

    /// Data-plane config for one rank's shard partition and effective seed.
    pub fn pipeline_config(&self, shards: Vec<PathBuf>, seed: u64) -> PipelineConfig {
        PipelineConfig {
            shards,
            window_capacity: self.shuffle_window_size,
            batch_size: self.batch_size,
            max_seq_len: self.max_seq_len_ceiling,
            epoch_mode: self.epoch_mode,
            policy: self.record_policy,
            seed,
            prefetch: self.prefetch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> TrainerConfig {
        serde_json::from_str(
            r#"{
                "shards": ["data/0.jsonl"],
                "checkpoint_dir": "ckpt",
                "shuffle_window_size": 128,
                "batch_size": 8,
                "grad_accum_steps": 4,
                "checkpoint_interval_steps": 100,
                "checkpoint_retain_count": 3,
                "max_seq_len_ceiling": 512
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn minimal_json_config_parses_with_defaults() {
        let cfg = base();
        assert!(cfg.prefetch);
        assert!(!cfg.resume);
        assert_eq!(cfg.epoch_mode, EpochMode::SinglePass);
        assert_eq!(cfg.record_policy, RecordPolicy::Skip);
        assert_eq!(cfg.interrupt_grace_secs, 30);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn wrap_mode_requires_a_bound() {
        let mut cfg = base();
        cfg.epoch_mode = EpochMode::Wrap;
        assert!(matches!(cfg.validate(), Err(TrainErr::InvalidConfig(_))));

        cfg.max_epochs = Some(2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_shard_list_is_rejected() {
        let mut cfg = base();
        cfg.shards.clear();
        assert!(matches!(cfg.validate(), Err(TrainErr::InvalidConfig(_))));
    }
}
