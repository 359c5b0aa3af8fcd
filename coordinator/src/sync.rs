use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use async_trait::async_trait;
use corpus::PipelineState;
use tokio::{
    sync::{Barrier, Mutex},
    time::timeout,
};

use crate::error::{CoordErr, Result};

/// The rank designated to write checkpoint files; all other ranks hand
/// their state to it at checkpoint boundaries.
pub const WRITER_RANK: usize = 0;

#[inline]
pub fn is_checkpoint_writer(rank: usize) -> bool {
    rank == WRITER_RANK
}

/// Gradient rendezvous across the data-parallel group.
///
/// Independent of any transport: an implementation may run in-process, over
/// a wire, or on top of a collective library. Every operation carries a
/// bounded timeout; a rank that never arrives fails the whole group.
#[async_trait]
pub trait GradientSync: Send + Sync {
    fn world_size(&self) -> usize;

    /// Averages `grad` across all ranks. Blocks until every rank has
    /// contributed; returns with `grad` holding the group average.
    async fn all_reduce(&self, rank: usize, grad: &mut [f32]) -> Result<()>;

    /// Collects per-rank pipeline states at a checkpoint boundary. The
    /// designated writer receives the full set ordered by rank; every other
    /// rank receives `None`.
    async fn gather_states(
        &self,
        rank: usize,
        state: PipelineState,
    ) -> Result<Option<Vec<(usize, PipelineState)>>>;
}

struct Shared {
    sum: Vec<f32>,
    contributed: usize,
    states: Vec<Option<PipelineState>>,
}

/// In-process group: ranks run as tasks of one runtime and meet at a
/// shared accumulator guarded by a barrier. Accumulate, rendezvous, pull
/// the average, rendezvous again so the round is sealed before the next
/// one begins.
#[derive(Clone)]
pub struct LocalGroup {
    world_size: usize,
    timeout: Duration,
    barrier: Arc<Barrier>,
    shared: Arc<Mutex<Shared>>,
}

impl LocalGroup {
    /// # Args
    /// * `world_size` - Number of participating ranks.
    /// * `nparams` - Flat gradient length every rank must contribute.
    /// * `wait` - Bound on every rendezvous.
    pub fn new(world_size: NonZeroUsize, nparams: usize, wait: Duration) -> Self {
        Self {
            world_size: world_size.get(),
            timeout: wait,
            barrier: Arc::new(Barrier::new(world_size.get())),
            shared: Arc::new(Mutex::new(Shared {
                sum: vec![0.0; nparams],
                contributed: 0,
                states: (0..world_size.get()).map(|_| None).collect(),
            })),
        }
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.world_size {
            return Err(CoordErr::InvalidRank {
                rank,
                world_size: self.world_size,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl GradientSync for LocalGroup {
    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn all_reduce(&self, rank: usize, grad: &mut [f32]) -> Result<()> {
        self.check_rank(rank)?;

        let round = async {
            {
                let mut shared = self.shared.lock().await;
                if shared.sum.len() != grad.len() {
                    return Err(CoordErr::SizeMismatch {
                        rank,
                        got: grad.len(),
                        expected: shared.sum.len(),
                    });
                }
                // First contributor of the round clears the previous sum.
                if shared.contributed == 0 {
                    shared.sum.fill(0.0);
                }
                for (acc, g) in shared.sum.iter_mut().zip(grad.iter()) {
                    *acc += *g;
                }
                shared.contributed += 1;
            }
            self.barrier.wait().await;

            {
                let shared = self.shared.lock().await;
                let scale = 1.0 / self.world_size as f32;
                for (g, acc) in grad.iter_mut().zip(shared.sum.iter()) {
                    *g = *acc * scale;
                }
            }
            let pulled = self.barrier.wait().await;

            if pulled.is_leader() {
                let mut shared = self.shared.lock().await;
                shared.contributed = 0;
            }
            // Reset must be visible before anyone re-enters the round.
            self.barrier.wait().await;
            Ok(())
        };

        timeout(self.timeout, round)
            .await
            .map_err(|_| CoordErr::BarrierTimeout {
                rank,
                waited: self.timeout,
            })?
    }

    async fn gather_states(
        &self,
        rank: usize,
        state: PipelineState,
    ) -> Result<Option<Vec<(usize, PipelineState)>>> {
        self.check_rank(rank)?;

        let round = async {
            {
                let mut shared = self.shared.lock().await;
                shared.states[rank] = Some(state);
            }
            self.barrier.wait().await;

            let out = if is_checkpoint_writer(rank) {
                let mut shared = self.shared.lock().await;
                let mut all = Vec::with_capacity(self.world_size);
                for (i, slot) in shared.states.iter_mut().enumerate() {
                    match slot.take() {
                        Some(s) => all.push((i, s)),
                        None => return Err(CoordErr::MissingRank { rank: i }),
                    }
                }
                Some(all)
            } else {
                None
            };

            // Writer has drained the slots; seal the round.
            self.barrier.wait().await;
            Ok(out)
        };

        timeout(self.timeout, round)
            .await
            .map_err(|_| CoordErr::BarrierTimeout {
                rank,
                waited: self.timeout,
            })?
    }
}
