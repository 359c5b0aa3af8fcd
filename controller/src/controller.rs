use std::{fmt, sync::Arc, time::Duration};

use checkpoint::{CheckpointErr, CheckpointStore, LATEST, Manifest, RankState, StateBundle};
use coordinator::{GradientSync, partition};
use corpus::Pipeline;
use log::{error, info, warn};
use rand::Rng;
use tokio::{task, time};

use crate::{
    capability::{ModelCapability, ModelState},
    config::TrainerConfig,
    error::{Result, TrainErr},
    metrics::TrainMetrics,
    stop::StopToken,
};

/// Training loop phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Resuming,
    Running,
    Checkpointing,
    Interrupting,
    Stopped,
    Completed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::Resuming => "resuming",
            Phase::Running => "running",
            Phase::Checkpointing => "checkpointing",
            Phase::Interrupting => "interrupting",
            Phase::Stopped => "stopped",
            Phase::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Final report of a finished (stopped or completed) run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub phase: Phase,
    pub metrics: TrainMetrics,
    pub last_checkpoint: Option<String>,
}

/// What one accumulation window produced on the blocking pool.
#[derive(Debug, Default)]
struct WindowOutcome {
    batches: usize,
    records: usize,
    loss_sum: f32,
    stream_ended: bool,
}

/// Drives steps and epochs for one rank: batch pull, gradient
/// accumulation, cross-rank synchronization, optimizer updates, checkpoint
/// policy and cooperative interrupts.
///
/// Owns the training state; nothing else mutates it. The data pipeline and
/// the model move onto the blocking pool for each accumulation window (O(1)
/// moves, no cloning) and come back for the synchronization and update.
pub struct Controller {
    cfg: TrainerConfig,
    rank: usize,
    seed: u64,
    phase: Phase,
    step: u64,
    store: Arc<CheckpointStore>,
    sync: Option<Arc<dyn GradientSync>>,
    stop: StopToken,
    metrics: TrainMetrics,
    last_checkpoint: Option<String>,
    last_checkpoint_step: Option<u64>,
}

impl Controller {
    /// # Args
    /// * `cfg` - Validated run configuration.
    /// * `rank` - This process's rank within the data-parallel group.
    /// * `sync` - Gradient rendezvous; `None` runs single-rank.
    /// * `stop` - Graceful-stop token, checked at step boundaries.
    pub fn new(
        cfg: TrainerConfig,
        rank: usize,
        sync: Option<Arc<dyn GradientSync>>,
        stop: StopToken,
    ) -> Result<Self> {
        cfg.validate()?;

        let seed = cfg.seed.unwrap_or_else(|| rand::rng().random());
        let store = Arc::new(CheckpointStore::new(
            cfg.checkpoint_dir.clone(),
            cfg.fallback_dir.clone(),
            cfg.checkpoint_retain_count,
        ));

        Ok(Self {
            cfg,
            rank,
            seed,
            phase: Phase::Init,
            step: 0,
            store,
            sync,
            stop,
            metrics: TrainMetrics::default(),
            last_checkpoint: None,
            last_checkpoint_step: None,
        })
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Runs the loop to completion or a graceful stop.
    ///
    /// # Errors
    /// Fatal failures (numeric divergence, exhausted checkpoint retries,
    /// coordination loss) surface here after logging the last valid
    /// checkpoint id; the run must be restarted from it.
    pub async fn run(mut self, model: Box<dyn ModelCapability>) -> Result<RunSummary> {
        match self.drive(model).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                let last = self.store.latest_id();
                error!(
                    "fatal at step {}: {e}; last valid checkpoint: {}",
                    self.step,
                    last.as_deref().unwrap_or("none"),
                );
                Err(e)
            }
        }
    }

    async fn drive(&mut self, mut model: Box<dyn ModelCapability>) -> Result<RunSummary> {
        let world_size = self.sync.as_ref().map_or(1, |s| s.world_size());
        let shards = partition(&self.cfg.shards, self.rank, world_size)?;
        // Distinct presentation streams per rank, reproducible per rank.
        let rank_seed = self.seed.wrapping_add(self.rank as u64);
        let pipeline_cfg = self.cfg.pipeline_config(shards, rank_seed);

        let mut pipeline = if self.cfg.resume {
            self.phase = Phase::Resuming;
            match self.store.load(LATEST) {
                Ok(bundle) => {
                    let state = bundle
                        .manifest
                        .rank_state(self.rank)
                        .cloned()
                        .ok_or(TrainErr::MissingRankState { rank: self.rank })?;
                    model.load_state(&ModelState {
                        tensors: bundle.tensors,
                    })?;
                    self.step = bundle.manifest.step;
                    self.metrics.steps = self.step;
                    self.last_checkpoint = self.store.latest_id();
                    self.last_checkpoint_step = Some(self.step);
                    info!(rank = self.rank, step = self.step; "resumed from checkpoint");
                    Pipeline::resume(&pipeline_cfg, state)?
                }
                Err(CheckpointErr::NotFound(_)) => {
                    info!("no checkpoint found, starting fresh");
                    Pipeline::open(&pipeline_cfg)?
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            Pipeline::open(&pipeline_cfg)?
        };

        self.phase = Phase::Running;
        info!(
            "rank {} running: {} shard(s), window={}, batch={}, accum={}",
            self.rank,
            pipeline_cfg.shards.len(),
            self.cfg.shuffle_window_size,
            self.cfg.batch_size,
            self.cfg.grad_accum_steps,
        );

        loop {
            // Cooperative cancellation, honored only here, between
            // optimizer updates: an in-flight accumulation window always
            // finishes before the interrupt checkpoint is taken.
            if self.stop.is_requested() {
                self.interrupt(&pipeline, model.as_ref()).await?;
                return Ok(self.summary());
            }

            if self.reached_bound(&pipeline) {
                self.complete(&pipeline, model.as_ref()).await?;
                return Ok(self.summary());
            }

            let (returned_pipeline, returned_model, outcome) =
                self.accumulate_window(pipeline, model).await?;
            pipeline = returned_pipeline;
            model = returned_model;

            if outcome.batches == 0 {
                self.complete(&pipeline, model.as_ref()).await?;
                return Ok(self.summary());
            }

            // Normalize by batches actually seen, then synchronize; a
            // partial final window still becomes one well-formed update.
            let scale = 1.0 / outcome.batches as f32;
            for g in model.grad_mut().iter_mut() {
                *g *= scale;
            }
            if let Some(sync) = self.sync.clone() {
                sync.all_reduce(self.rank, model.grad_mut()).await?;
            }
            model.optimizer_step();
            self.step += 1;

            let mean_loss = outcome.loss_sum / outcome.batches as f32;
            self.metrics.bump_step();
            self.metrics.add_batches(outcome.batches);
            self.metrics.add_records(outcome.records);
            self.metrics.last_loss = mean_loss;
            self.metrics.skipped_records = pipeline.skipped();
            self.metrics.truncated_records = pipeline.truncated();
            self.metrics.epochs_completed = pipeline.epoch();

            if self.step == 1 || self.step % self.cfg.log_every_steps == 0 {
                info!(
                    "step {}: loss={mean_loss:.4} epoch={} records={}",
                    self.step,
                    pipeline.epoch(),
                    self.metrics.records,
                );
            }

            if self.step % self.cfg.checkpoint_interval_steps.get() as u64 == 0 {
                self.phase = Phase::Checkpointing;
                self.checkpoint(&pipeline, model.as_ref()).await?;
                self.phase = Phase::Running;
            }

            if outcome.stream_ended {
                self.complete(&pipeline, model.as_ref()).await?;
                return Ok(self.summary());
            }
        }
    }

    /// Pulls and accumulates one gradient window on the blocking pool.
    /// Buffers move out and back in O(1); compute never blocks the runtime.
    async fn accumulate_window(
        &self,
        mut pipeline: Pipeline,
        mut model: Box<dyn ModelCapability>,
    ) -> Result<(Pipeline, Box<dyn ModelCapability>, WindowOutcome)> {
        let accum = self.cfg.grad_accum_steps.get();
        let step = self.step;

        task::spawn_blocking(move || {
            let mut outcome = WindowOutcome::default();

            for _ in 0..accum {
                let Some(batch) = pipeline.next_batch()? else {
                    outcome.stream_ended = true;
                    break;
                };

                let loss = model.forward(&batch);
                if !loss.is_finite() {
                    return Err(TrainErr::NonFiniteLoss { step, loss });
                }
                model.backward(loss);

                outcome.batches += 1;
                outcome.records += batch.len();
                outcome.loss_sum += loss;
            }

            Ok((pipeline, model, outcome))
        })
        .await
        .map_err(|e| TrainErr::Join(e.to_string()))?
    }

    fn reached_bound(&self, pipeline: &Pipeline) -> bool {
        if let Some(max) = self.cfg.max_steps {
            if self.step >= max {
                return true;
            }
        }
        if let Some(max) = self.cfg.max_epochs {
            if pipeline.epoch() >= max {
                return true;
            }
        }
        false
    }

    async fn interrupt(&mut self, pipeline: &Pipeline, model: &dyn ModelCapability) -> Result<()> {
        self.phase = Phase::Interrupting;
        info!(
            "graceful stop at step {}: checkpointing before exit",
            self.step,
        );

        self.phase = Phase::Checkpointing;
        let grace = Duration::from_secs(self.cfg.interrupt_grace_secs);
        match time::timeout(grace, self.checkpoint(pipeline, model)).await {
            Ok(result) => result?,
            Err(_) => warn!(
                "interrupt checkpoint exceeded the {}s grace period; exiting, \
                 progress since {} is lost",
                grace.as_secs(),
                self.last_checkpoint.as_deref().unwrap_or("the run start"),
            ),
        }

        self.phase = Phase::Stopped;
        info!("stopped at step {}", self.step);
        Ok(())
    }

    async fn complete(&mut self, pipeline: &Pipeline, model: &dyn ModelCapability) -> Result<()> {
        info!("run complete at step {}", self.step);
        self.phase = Phase::Checkpointing;
        self.checkpoint(pipeline, model).await?;
        self.phase = Phase::Completed;
        Ok(())
    }

    /// Gathers per-rank pipeline state and, on the designated writer,
    /// persists the full bundle. A checkpoint always reflects the last
    /// completed optimizer update, never a partial accumulation window.
    async fn checkpoint(&mut self, pipeline: &Pipeline, model: &dyn ModelCapability) -> Result<()> {
        if self.last_checkpoint_step == Some(self.step) {
            return Ok(());
        }

        let snapshot = pipeline.snapshot();
        let states = match &self.sync {
            Some(sync) => sync.gather_states(self.rank, snapshot).await?,
            None => Some(vec![(self.rank, snapshot)]),
        };

        if let Some(states) = states {
            let ranks = states
                .into_iter()
                .map(|(rank, pipeline)| RankState { rank, pipeline })
                .collect();
            let bundle = StateBundle {
                manifest: Manifest::new(self.step, pipeline.epoch(), ranks),
                tensors: model.state().tensors,
            };

            let store = Arc::clone(&self.store);
            let id = task::spawn_blocking(move || store.save(&bundle))
                .await
                .map_err(|e| TrainErr::Join(e.to_string()))??;

            self.metrics.bump_checkpoint();
            self.last_checkpoint = Some(id);
        }

        self.last_checkpoint_step = Some(self.step);
        Ok(())
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            phase: self.phase,
            metrics: self.metrics.clone(),
            last_checkpoint: self.last_checkpoint.clone(),
        }
    }
}
