use std::num::NonZeroUsize;

use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    error::{CorpusErr, Result},
    pipeline::PipelineState,
    record::Record,
    source::{Cursor, RecordStream},
};

/// Bounded reservoir decoupling read order from presentation order.
///
/// Holds at most `capacity` records; each emission removes one element at a
/// uniformly random index and backfills from the stream — a single-pass
/// approximate shuffle in O(W) memory, independent of corpus size.
///
/// Index draws always sample the constant range `0..capacity` and reject
/// indices past the current fill level, with every call counted. That makes
/// `(seed, rng_draws)` a complete generator snapshot: restoring re-seeds and
/// replays the counted calls, so an identical (capacity, seed, shard order,
/// cursor, window) quintuple reproduces the identical emission sequence.
pub struct ShuffleBuffer {
    stream: Box<dyn RecordStream>,
    window: Vec<Record>,
    capacity: NonZeroUsize,
    rng: StdRng,
    seed: u64,
    draws: u64,
    cursor: Cursor,
    epoch: usize,
}

impl ShuffleBuffer {
    pub fn new(stream: Box<dyn RecordStream>, capacity: NonZeroUsize, seed: u64) -> Self {
        Self {
            stream,
            window: Vec::with_capacity(capacity.get()),
            capacity,
            rng: StdRng::seed_from_u64(seed),
            seed,
            draws: 0,
            cursor: Cursor::default(),
            epoch: 0,
        }
    }

    /// Rebuilds a buffer from a captured window.
    ///
    /// `stream` must already be positioned at the captured cursor. The RNG
    /// is reconstructed by replaying the counted calls from the seed.
    ///
    /// # Errors
    /// Returns `WindowCapacityMismatch` if the window was captured under a
    /// different capacity.
    pub fn restore(
        stream: Box<dyn RecordStream>,
        capacity: NonZeroUsize,
        state: PipelineState,
    ) -> Result<Self> {
        if state.window_capacity != capacity.get() {
            return Err(CorpusErr::WindowCapacityMismatch {
                expected: capacity.get(),
                got: state.window_capacity,
            });
        }

        let mut rng = StdRng::seed_from_u64(state.seed);
        for _ in 0..state.rng_draws {
            let _ = rng.random_range(0..capacity.get());
        }

        Ok(Self {
            stream,
            window: state.window,
            capacity,
            rng,
            seed: state.seed,
            draws: state.rng_draws,
            cursor: state.cursor,
            epoch: state.epoch,
        })
    }

    /// Pulls from the stream while the window is below capacity.
    pub fn fill(&mut self) -> Result<()> {
        while self.window.len() < self.capacity.get() {
            match self.stream.next_item()? {
                Some(item) => {
                    self.window.push(item.record);
                    self.cursor = item.next_cursor;
                    self.epoch = item.epoch;
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Emits one record at a uniformly random window index, backfilling from
    /// the stream. Returns `Ok(None)` only when the window is empty and the
    /// stream is exhausted.
    pub fn emit(&mut self) -> Result<Option<Record>> {
        self.fill()?;

        if self.window.is_empty() {
            return Ok(None);
        }

        let idx = self.draw();
        Ok(Some(self.window.swap_remove(idx)))
    }

    /// Counted constant-range draw; rejects indices past the fill level.
    fn draw(&mut self) -> usize {
        loop {
            self.draws += 1;
            let idx = self.rng.random_range(0..self.capacity.get());
            if idx < self.window.len() {
                return idx;
            }
        }
    }

    /// Captures the full window plus RNG counters for exact resume.
    pub fn snapshot(&self) -> PipelineState {
        PipelineState {
            cursor: self.cursor,
            epoch: self.epoch,
            seed: self.seed,
            rng_draws: self.draws,
            window_capacity: self.capacity.get(),
            window: self.window.clone(),
        }
    }

    /// Cursor after the last record pulled into the window.
    #[inline]
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    #[inline]
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    #[inline]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[inline]
    pub fn skipped(&self) -> u64 {
        self.stream.skipped()
    }
}
