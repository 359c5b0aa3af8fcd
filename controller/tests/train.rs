use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use checkpoint::{CheckpointStore, LATEST};
use controller::{
    Controller, ModelCapability, ModelState, Phase, StopToken, TrainErr, TrainerConfig,
};
use coordinator::LocalGroup;
use corpus::{Batch, EpochMode, Record, RecordPolicy};

const NPARAMS: usize = 4;

fn temp_dir(prefix: &str) -> PathBuf {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("{prefix}-{}-{n}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_shard(dir: &Path, name: &str, count: usize, tag: &str) -> PathBuf {
    let path = dir.join(name);
    let mut body = String::new();
    for i in 0..count {
        let rec = Record::new(format!("{tag}{i}[EOS]"), format!("resp{i}[EOS]"));
        body.push_str(&serde_json::to_string(&rec).unwrap());
        body.push('\n');
    }
    std::fs::write(&path, body).unwrap();
    path
}

fn nz(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
}

fn config(shards: Vec<PathBuf>, checkpoint_dir: PathBuf) -> TrainerConfig {
    TrainerConfig {
        shards,
        checkpoint_dir,
        fallback_dir: None,
        shuffle_window_size: nz(4),
        batch_size: nz(2),
        grad_accum_steps: nz(2),
        checkpoint_interval_steps: nz(2),
        checkpoint_retain_count: nz(10),
        max_seq_len_ceiling: nz(64),
        resume: false,
        seed: Some(11),
        epoch_mode: EpochMode::SinglePass,
        record_policy: RecordPolicy::Skip,
        prefetch: false,
        max_steps: None,
        max_epochs: None,
        interrupt_grace_secs: 30,
        barrier_timeout_secs: 5,
        log_every_steps: 50,
    }
}

/// Deterministic toy capability that records every batch it sees.
struct RecordingModel {
    params: Vec<f32>,
    grad: Vec<f32>,
    updates: u64,
    forwards: usize,
    seen: Arc<Mutex<Vec<Vec<Vec<u32>>>>>,
    stop_during_forward: Option<(usize, StopToken)>,
    nan_at_forward: Option<usize>,
}

impl RecordingModel {
    fn new(seen: Arc<Mutex<Vec<Vec<Vec<u32>>>>>) -> Self {
        Self {
            params: vec![0.0; NPARAMS],
            grad: vec![0.0; NPARAMS],
            updates: 0,
            forwards: 0,
            seen,
            stop_during_forward: None,
            nan_at_forward: None,
        }
    }
}

impl ModelCapability for RecordingModel {
    fn forward(&mut self, batch: &Batch) -> f32 {
        self.forwards += 1;
        self.seen.lock().unwrap().push(batch.rows.clone());

        if let Some((at, stop)) = &self.stop_during_forward {
            if self.forwards == *at {
                stop.request();
            }
        }
        if self.nan_at_forward == Some(self.forwards) {
            return f32::NAN;
        }

        let sum: u64 = batch.rows.iter().flatten().map(|&t| u64::from(t)).sum();
        (sum % 97) as f32 / 97.0 + 0.1
    }

    fn backward(&mut self, loss: f32) {
        for g in &mut self.grad {
            *g += loss;
        }
    }

    fn grad_mut(&mut self) -> &mut [f32] {
        &mut self.grad
    }

    fn optimizer_step(&mut self) {
        for (p, g) in self.params.iter_mut().zip(self.grad.iter()) {
            *p -= 0.1 * *g;
        }
        self.grad.fill(0.0);
        self.updates += 1;
    }

    fn state(&self) -> ModelState {
        ModelState {
            tensors: vec![
                ("model.params".to_string(), self.params.clone()),
                ("opt.updates".to_string(), vec![self.updates as f32]),
            ],
        }
    }

    fn load_state(&mut self, state: &ModelState) -> Result<(), TrainErr> {
        let params = state
            .tensor("model.params")
            .ok_or_else(|| TrainErr::StateMismatch {
                tensor: "model.params".to_string(),
                got: 0,
                expected: NPARAMS,
            })?;
        if params.len() != self.params.len() {
            return Err(TrainErr::StateMismatch {
                tensor: "model.params".to_string(),
                got: params.len(),
                expected: self.params.len(),
            });
        }
        self.params.copy_from_slice(params);
        self.updates = state
            .tensor("opt.updates")
            .and_then(|v| v.first())
            .copied()
            .unwrap_or(0.0) as u64;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_reproduces_the_uninterrupted_batch_sequence() {
    let data = temp_dir("train-resume-data");
    let shards = vec![
        write_shard(&data, "0.jsonl", 30, "a"),
        write_shard(&data, "1.jsonl", 30, "b"),
    ];

    // Reference: one uninterrupted run over the whole corpus.
    let full = Arc::new(Mutex::new(Vec::new()));
    let cfg = config(shards.clone(), temp_dir("train-resume-ref-ckpt"));
    let ctl = Controller::new(cfg, 0, None, StopToken::new()).unwrap();
    let summary = ctl
        .run(Box::new(RecordingModel::new(Arc::clone(&full))))
        .await
        .unwrap();
    assert_eq!(summary.phase, Phase::Completed);

    // Interrupted run: stop after three optimizer updates.
    let ckpt = temp_dir("train-resume-ckpt");
    let before = Arc::new(Mutex::new(Vec::new()));
    let mut cfg = config(shards.clone(), ckpt.clone());
    cfg.max_steps = Some(3);
    let ctl = Controller::new(cfg, 0, None, StopToken::new()).unwrap();
    let summary = ctl
        .run(Box::new(RecordingModel::new(Arc::clone(&before))))
        .await
        .unwrap();
    assert_eq!(summary.phase, Phase::Completed);
    assert_eq!(summary.metrics.steps, 3);

    // Resumed run: picks up from the step-3 checkpoint.
    let after = Arc::new(Mutex::new(Vec::new()));
    let mut cfg = config(shards, ckpt);
    cfg.resume = true;
    let ctl = Controller::new(cfg, 0, None, StopToken::new()).unwrap();
    let summary = ctl
        .run(Box::new(RecordingModel::new(Arc::clone(&after))))
        .await
        .unwrap();
    assert_eq!(summary.phase, Phase::Completed);

    let full = full.lock().unwrap().clone();
    let mut stitched = before.lock().unwrap().clone();
    stitched.extend(after.lock().unwrap().iter().cloned());
    assert_eq!(stitched, full);
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_stop_mid_window_checkpoints_the_completed_update() {
    let data = temp_dir("train-stop-data");
    let shards = vec![write_shard(&data, "0.jsonl", 40, "a")];
    let ckpt = temp_dir("train-stop-ckpt");

    let mut cfg = config(shards, ckpt.clone());
    cfg.grad_accum_steps = nz(8);
    cfg.checkpoint_interval_steps = nz(100);

    // The stop arrives during batch 5 of the 8-batch accumulation window;
    // the window still finishes and exactly one update is applied.
    let stop = StopToken::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut model = RecordingModel::new(Arc::clone(&seen));
    model.stop_during_forward = Some((5, stop.clone()));

    let ctl = Controller::new(cfg.clone(), 0, None, stop).unwrap();
    let summary = ctl.run(Box::new(model)).await.unwrap();

    assert_eq!(summary.phase, Phase::Stopped);
    assert_eq!(summary.metrics.steps, 1);
    assert_eq!(seen.lock().unwrap().len(), 8);

    let store = CheckpointStore::new(ckpt, None, nz(10));
    let bundle = store.load(LATEST).unwrap();
    assert_eq!(bundle.manifest.step, 1);
    // Optimizer state reflects the one completed update, not the partial
    // window in progress when the stop arrived.
    let updates = bundle.tensors.iter().find(|(n, _)| n == "opt.updates").unwrap();
    assert_eq!(updates.1, vec![1.0]);
}

#[tokio::test(flavor = "multi_thread")]
async fn non_finite_loss_is_fatal_and_preserves_the_last_checkpoint() {
    let data = temp_dir("train-nan-data");
    let shards = vec![write_shard(&data, "0.jsonl", 40, "a")];
    let ckpt = temp_dir("train-nan-ckpt");

    let mut cfg = config(shards, ckpt.clone());
    cfg.grad_accum_steps = nz(1);
    cfg.checkpoint_interval_steps = nz(1);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut model = RecordingModel::new(seen);
    model.nan_at_forward = Some(3);

    let ctl = Controller::new(cfg, 0, None, StopToken::new()).unwrap();
    let err = ctl.run(Box::new(model)).await.unwrap_err();
    assert!(matches!(err, TrainErr::NonFiniteLoss { step: 2, .. }));

    // The divergent step wrote nothing; the last good checkpoint survives.
    let store = CheckpointStore::new(ckpt, None, nz(10));
    assert_eq!(store.latest_id().as_deref(), Some("step-00000002"));
}

#[tokio::test(flavor = "multi_thread")]
async fn two_ranks_train_disjoint_shards_and_share_one_manifest() {
    let data = temp_dir("train-group-data");
    let shards = vec![
        write_shard(&data, "0.jsonl", 20, "a"),
        write_shard(&data, "1.jsonl", 20, "b"),
    ];
    let ckpt = temp_dir("train-group-ckpt");

    let group = Arc::new(LocalGroup::new(nz(2), NPARAMS, Duration::from_secs(5)));

    let mut tasks = Vec::new();
    for rank in 0..2 {
        let mut cfg = config(shards.clone(), ckpt.clone());
        cfg.grad_accum_steps = nz(1);
        cfg.checkpoint_interval_steps = nz(5);
        let sync: Arc<dyn coordinator::GradientSync> = group.clone();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let ctl = Controller::new(cfg, rank, Some(sync), StopToken::new()).unwrap();
        tasks.push(tokio::spawn(async move {
            ctl.run(Box::new(RecordingModel::new(seen))).await
        }));
    }

    let mut steps = Vec::new();
    for task in tasks {
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.phase, Phase::Completed);
        steps.push(summary.metrics.steps);
    }
    // Equal shard sizes mean the ranks advance in lockstep.
    assert_eq!(steps[0], steps[1]);

    let store = CheckpointStore::new(ckpt, None, nz(10));
    let bundle = store.load(LATEST).unwrap();
    assert_eq!(bundle.manifest.ranks.len(), 2);
    assert_eq!(bundle.manifest.step, steps[0]);
}
