use std::{
    fs::{self, File},
    io::{self, Write},
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use log::{info, warn};
use safetensors::{
    SafeTensors, serialize,
    tensor::{Dtype, TensorView},
};

use crate::{
    error::{CheckpointErr, Result},
    manifest::Manifest,
};

/// Id alias resolving to the newest published checkpoint.
pub const LATEST: &str = "latest";

const MANIFEST_FILE: &str = "manifest.json";
const STATE_FILE: &str = "state.safetensors";
const STAGE_PREFIX: &str = ".stage-";

/// The full trainer state bundle: manifest plus flat f32 state blobs
/// (model parameters, optimizer moments) keyed by tensor name.
#[derive(Debug, Clone)]
pub struct StateBundle {
    pub manifest: Manifest,
    pub tensors: Vec<(String, Vec<f32>)>,
}

/// Durable snapshot store.
///
/// Layout: one directory per checkpoint id (`step-NNNNNNNN/`) holding the
/// manifest and the safetensors state blob. Writes go to a hidden staging
/// directory first and are published with an atomic rename, so a partially
/// written checkpoint is never visible. Retention keeps the most recent K;
/// older checkpoints are deleted only after the new one is durable, so at
/// least one valid checkpoint always exists.
pub struct CheckpointStore {
    dir: PathBuf,
    fallback: Option<PathBuf>,
    retain: NonZeroUsize,
}

impl CheckpointStore {
    pub fn new(dir: PathBuf, fallback: Option<PathBuf>, retain: NonZeroUsize) -> Self {
        Self {
            dir,
            fallback,
            retain,
        }
    }

    /// Persists `bundle` and returns its id.
    ///
    /// A failed write is retried once against the fallback directory, if
    /// one is configured; a second failure is surfaced as fatal.
    pub fn save(&self, bundle: &StateBundle) -> Result<String> {
        let id = checkpoint_id(bundle.manifest.step);

        if let Err(e) = self.write_to(&self.dir, &id, bundle) {
            let Some(fallback) = &self.fallback else {
                return Err(e);
            };
            warn!(
                "checkpoint write failed ({e}), retrying at fallback {}",
                fallback.display(),
            );
            self.write_to(fallback, &id, bundle)?;
        }

        self.apply_retention();
        info!(step = bundle.manifest.step; "checkpoint published: id={id}");
        Ok(id)
    }

    /// Loads a checkpoint by id, or the newest one for [`LATEST`].
    pub fn load(&self, id: &str) -> Result<StateBundle> {
        let dir = self.resolve(id)?;

        let manifest: Manifest = serde_json::from_slice(&fs::read(dir.join(MANIFEST_FILE))?)?;

        let blob = fs::read(dir.join(STATE_FILE))?;
        let archive = SafeTensors::deserialize(&blob)?;
        let mut tensors: Vec<(String, Vec<f32>)> = archive
            .tensors()
            .into_iter()
            .map(|(name, view)| (name, bytemuck::pod_collect_to_vec(view.data())))
            .collect();
        tensors.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(StateBundle { manifest, tensors })
    }

    /// Id of the newest published checkpoint, if any.
    pub fn latest_id(&self) -> Option<String> {
        self.newest().map(|(step, _)| checkpoint_id(step))
    }

    fn resolve(&self, id: &str) -> Result<PathBuf> {
        if id == LATEST {
            return self
                .newest()
                .map(|(_, dir)| dir)
                .ok_or_else(|| CheckpointErr::NotFound(LATEST.to_string()));
        }

        for base in self.bases() {
            let dir = base.join(id);
            if dir.is_dir() {
                return Ok(dir);
            }
        }
        Err(CheckpointErr::NotFound(id.to_string()))
    }

    fn bases(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.dir).chain(self.fallback.as_ref())
    }

    /// Newest checkpoint across primary and fallback; primary wins ties.
    /// An unreadable base (the situation the fallback exists for) is logged
    /// and skipped rather than masking the other location.
    fn newest(&self) -> Option<(u64, PathBuf)> {
        let mut newest: Option<(u64, PathBuf)> = None;
        for base in self.bases() {
            let entries = match scan(base) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("checkpoint scan failed at {}: {e}", base.display());
                    continue;
                }
            };
            for (step, dir) in entries {
                if newest.as_ref().is_none_or(|(best, _)| step > *best) {
                    newest = Some((step, dir));
                }
            }
        }
        newest
    }

    fn write_to(&self, base: &Path, id: &str, bundle: &StateBundle) -> Result<()> {
        fs::create_dir_all(base)?;

        let staging = base.join(format!("{STAGE_PREFIX}{id}"));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let outcome = (|| -> Result<()> {
            write_file(
                &staging.join(MANIFEST_FILE),
                &serde_json::to_vec_pretty(&bundle.manifest)?,
            )?;

            let views = bundle
                .tensors
                .iter()
                .map(|(name, values)| {
                    let view =
                        TensorView::new(Dtype::F32, vec![values.len()], bytemuck::cast_slice(values))?;
                    Ok((name.as_str(), view))
                })
                .collect::<Result<Vec<_>>>()?;
            write_file(&staging.join(STATE_FILE), &serialize(views, &None)?)?;

            let target = base.join(id);
            if target.exists() {
                fs::remove_dir_all(&target)?;
            }
            fs::rename(&staging, &target)?;
            Ok(())
        })();

        if outcome.is_err() {
            let _ = fs::remove_dir_all(&staging);
        }
        outcome
    }

    /// Deletes checkpoints beyond the retention count, oldest first. Runs
    /// only after the new checkpoint is durable; failures are non-fatal.
    fn apply_retention(&self) {
        for base in self.bases() {
            let mut entries = match scan(base) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("retention scan failed at {}: {e}", base.display());
                    continue;
                }
            };

            entries.sort_by_key(|(step, _)| *step);
            while entries.len() > self.retain.get() {
                let (step, dir) = entries.remove(0);
                match fs::remove_dir_all(&dir) {
                    Ok(()) => info!("retired checkpoint: id={}", checkpoint_id(step)),
                    Err(e) => warn!("failed to retire {}: {e}", dir.display()),
                }
            }
        }
    }
}

fn checkpoint_id(step: u64) -> String {
    format!("step-{step:08}")
}

fn parse_step(name: &str) -> Option<u64> {
    name.strip_prefix("step-")?.parse().ok()
}

/// Published checkpoint directories under `base`; staging dirs and foreign
/// entries are ignored.
fn scan(base: &Path) -> Result<Vec<(u64, PathBuf)>> {
    if !base.exists() {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if let Some(step) = name.to_str().and_then(parse_step) {
            found.push((step, entry.path()));
        }
    }
    Ok(found)
}

fn write_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::RankState;
    use corpus::{Cursor, PipelineState};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_dir(prefix: &str) -> PathBuf {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("{prefix}-{}-{n}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn bundle(step: u64) -> StateBundle {
        let pipeline = PipelineState {
            cursor: Cursor {
                shard: 0,
                offset: step as usize,
            },
            epoch: 0,
            seed: 7,
            rng_draws: step * 3,
            window_capacity: 4,
            window: Vec::new(),
        };
        StateBundle {
            manifest: Manifest::new(step, 0, vec![RankState { rank: 0, pipeline }]),
            tensors: vec![
                ("model.params".to_string(), vec![step as f32; 8]),
                ("opt.momentum".to_string(), vec![0.5; 8]),
            ],
        }
    }

    fn retain(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn latest_returns_most_recent_save() {
        let store = CheckpointStore::new(temp_dir("ckpt-latest"), None, retain(10));

        for step in 1..=3 {
            store.save(&bundle(step)).unwrap();
        }

        let loaded = store.load(LATEST).unwrap();
        assert_eq!(loaded.manifest.step, 3);
        assert_eq!(loaded.tensors[0].0, "model.params");
        assert_eq!(loaded.tensors[0].1, vec![3.0; 8]);
        assert_eq!(store.latest_id().as_deref(), Some("step-00000003"));
    }

    #[test]
    fn load_by_id_returns_that_checkpoint() {
        let store = CheckpointStore::new(temp_dir("ckpt-by-id"), None, retain(10));
        let first = store.save(&bundle(1)).unwrap();
        store.save(&bundle(2)).unwrap();

        let loaded = store.load(&first).unwrap();
        assert_eq!(loaded.manifest.step, 1);
        assert_eq!(loaded.manifest.rank_state(0).unwrap().cursor.offset, 1);
    }

    #[test]
    fn retention_keeps_most_recent_k() {
        let dir = temp_dir("ckpt-retain");
        let store = CheckpointStore::new(dir.clone(), None, retain(2));

        for step in 1..=5 {
            store.save(&bundle(step)).unwrap();
        }

        let mut kept: Vec<u64> = scan(&dir).unwrap().into_iter().map(|(s, _)| s).collect();
        kept.sort_unstable();
        assert_eq!(kept, [4, 5]);
    }

    #[test]
    fn no_staging_directories_survive_a_save() {
        let dir = temp_dir("ckpt-staging");
        let store = CheckpointStore::new(dir.clone(), None, retain(3));
        store.save(&bundle(1)).unwrap();

        let leftovers: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.unwrap().file_name().to_str().map(String::from))
            .filter(|name| name.starts_with(STAGE_PREFIX))
            .collect();
        assert!(leftovers.is_empty(), "staging left behind: {leftovers:?}");
    }

    #[test]
    fn missing_checkpoint_is_not_found() {
        let store = CheckpointStore::new(temp_dir("ckpt-missing"), None, retain(1));

        assert!(matches!(
            store.load(LATEST),
            Err(CheckpointErr::NotFound(_))
        ));
        assert!(matches!(
            store.load("step-00000042"),
            Err(CheckpointErr::NotFound(_))
        ));
        assert_eq!(store.latest_id(), None);
    }

    #[test]
    fn failed_primary_write_falls_back_once() {
        let scratch = temp_dir("ckpt-fallback");
        // A file where the primary directory should be makes every primary
        // write fail.
        let primary = scratch.join("primary");
        fs::write(&primary, b"occupied").unwrap();
        let fallback = scratch.join("fallback");

        let store = CheckpointStore::new(primary, Some(fallback.clone()), retain(2));
        let id = store.save(&bundle(1)).unwrap();

        assert!(fallback.join(&id).is_dir());
        assert_eq!(store.load(LATEST).unwrap().manifest.step, 1);
    }
}
