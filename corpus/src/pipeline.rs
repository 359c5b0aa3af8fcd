use std::{num::NonZeroUsize, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    collate::{Batch, Collator},
    error::Result,
    record::Record,
    shuffle::ShuffleBuffer,
    source::{Cursor, EpochMode, RecordPolicy, RecordSource, RecordStream},
    prefetch::Prefetcher,
};

/// Everything the data plane needs for one rank.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// This rank's shard partition, in traversal order.
    pub shards: Vec<PathBuf>,
    pub window_capacity: NonZeroUsize,
    pub batch_size: NonZeroUsize,
    /// Hard per-row length ceiling; longer rows are truncated and flagged.
    pub max_seq_len: NonZeroUsize,
    pub epoch_mode: EpochMode,
    pub policy: RecordPolicy,
    pub seed: u64,
    /// Overlap disk reads with batch consumption.
    pub prefetch: bool,
}

/// Explicit pipeline state, passed into and out of the data plane rather
/// than living in ambient globals. Captures the full shuffle window — not
/// merely the cursor — so resumption is exact, not statistical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    pub cursor: Cursor,
    pub epoch: usize,
    pub seed: u64,
    pub rng_draws: u64,
    pub window_capacity: usize,
    pub window: Vec<Record>,
}

/// One rank's data plane: record source → shuffle buffer → collator.
pub struct Pipeline {
    collator: Collator,
}

impl Pipeline {
    /// Builds a fresh pipeline starting at the head of the shard list.
    pub fn open(cfg: &PipelineConfig) -> Result<Self> {
        let source = RecordSource::open(
            cfg.shards.clone(),
            Cursor::default(),
            cfg.epoch_mode,
            cfg.policy,
        )?;
        Self::assemble(cfg, source, None)
    }

    /// Rebuilds a pipeline from checkpointed state: the source is seeked to
    /// the saved cursor and the shuffle window and RNG are restored, so
    /// emission continues exactly where it left off.
    pub fn resume(cfg: &PipelineConfig, state: PipelineState) -> Result<Self> {
        let source = RecordSource::open(
            cfg.shards.clone(),
            state.cursor,
            cfg.epoch_mode,
            cfg.policy,
        )?
        .with_epoch(state.epoch);
        Self::assemble(cfg, source, Some(state))
    }

    fn assemble(
        cfg: &PipelineConfig,
        source: RecordSource,
        state: Option<PipelineState>,
    ) -> Result<Self> {
        let stream: Box<dyn RecordStream> = if cfg.prefetch {
            Box::new(Prefetcher::spawn(source, cfg.window_capacity))
        } else {
            Box::new(source)
        };

        let shuffle = match state {
            None => ShuffleBuffer::new(stream, cfg.window_capacity, cfg.seed),
            Some(state) => ShuffleBuffer::restore(stream, cfg.window_capacity, state)?,
        };

        Ok(Self {
            collator: Collator::new(shuffle, cfg.batch_size, cfg.max_seq_len),
        })
    }

    /// Next collated batch, or `Ok(None)` once the stream is drained.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        self.collator.collect()
    }

    /// Captures the state needed to resume emission exactly from here.
    pub fn snapshot(&self) -> PipelineState {
        self.collator.shuffle().snapshot()
    }

    #[inline]
    pub fn epoch(&self) -> usize {
        self.collator.shuffle().epoch()
    }

    #[inline]
    pub fn cursor(&self) -> Cursor {
        self.collator.shuffle().cursor()
    }

    #[inline]
    pub fn skipped(&self) -> u64 {
        self.collator.shuffle().skipped()
    }

    #[inline]
    pub fn truncated(&self) -> u64 {
        self.collator.truncated_total()
    }
}
