use std::num::NonZeroUsize;

use log::warn;

use crate::{
    error::Result,
    record::{Record, field_content},
    shuffle::ShuffleBuffer,
};

/// Byte-level token ids; tokenization proper is upstream. Ids 0..=255 are
/// raw bytes, followed by the reserved end-of-sequence and padding ids.
pub const EOS_ID: u32 = 256;
pub const PAD_ID: u32 = 257;
pub const VOCAB_SIZE: usize = 258;

/// Encodes a record as one training row: prompt bytes, end id, response
/// bytes, end id. Markers are consumed, never emitted as raw bytes.
pub fn encode(record: &Record) -> Vec<u32> {
    let prompt = field_content(&record.prompt).as_bytes();
    let response = field_content(&record.response).as_bytes();

    let mut row = Vec::with_capacity(prompt.len() + response.len() + 2);
    row.extend(prompt.iter().map(|&b| u32::from(b)));
    row.push(EOS_ID);
    row.extend(response.iter().map(|&b| u32::from(b)));
    row.push(EOS_ID);
    row
}

/// True maximum sequence length within `rows`. Pure over the assembled
/// batch, recomputed per batch, never a global constant.
pub fn batch_max_len(rows: &[Vec<u32>]) -> usize {
    rows.iter().map(Vec::len).max().unwrap_or(0)
}

/// A collated batch: rows padded to this batch's own longest sequence plus
/// an attention mask over real (non-pad) positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub rows: Vec<Vec<u32>>,
    pub mask: Vec<Vec<bool>>,
    pub max_len: usize,
    /// Rows truncated to the length ceiling while assembling this batch.
    pub truncated: usize,
}

impl Batch {
    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Groups shuffled records into batches.
pub struct Collator {
    shuffle: ShuffleBuffer,
    batch_size: NonZeroUsize,
    ceiling: NonZeroUsize,
    truncated_total: u64,
}

impl Collator {
    pub fn new(shuffle: ShuffleBuffer, batch_size: NonZeroUsize, ceiling: NonZeroUsize) -> Self {
        Self {
            shuffle,
            batch_size,
            ceiling,
            truncated_total: 0,
        }
    }

    /// Pulls up to `batch_size` records and pads them to the batch max
    /// length. Returns a short batch at stream end and `Ok(None)` once no
    /// records remain.
    ///
    /// Rows past the hard ceiling are truncated and flagged exactly once,
    /// never silently dropped.
    pub fn collect(&mut self) -> Result<Option<Batch>> {
        let mut rows = Vec::with_capacity(self.batch_size.get());
        let mut truncated = 0;

        while rows.len() < self.batch_size.get() {
            let Some(record) = self.shuffle.emit()? else {
                break;
            };

            let mut row = encode(&record);
            if row.len() > self.ceiling.get() {
                warn!(
                    "truncating oversize record: len={} ceiling={}",
                    row.len(),
                    self.ceiling,
                );
                row.truncate(self.ceiling.get());
                truncated += 1;
            }
            rows.push(row);
        }

        if rows.is_empty() {
            return Ok(None);
        }

        self.truncated_total += truncated as u64;

        let max_len = batch_max_len(&rows);
        let mask = rows
            .iter()
            .map(|row| {
                let mut m = vec![true; row.len()];
                m.resize(max_len, false);
                m
            })
            .collect();
        for row in &mut rows {
            row.resize(max_len, PAD_ID);
        }

        Ok(Some(Batch {
            rows,
            mask,
            max_len,
            truncated,
        }))
    }

    #[inline]
    pub fn shuffle(&self) -> &ShuffleBuffer {
        &self.shuffle
    }

    #[inline]
    pub fn truncated_total(&self) -> u64 {
        self.truncated_total
    }
}
