use std::{
    fs::File,
    io::{BufRead, BufReader, Lines},
    path::PathBuf,
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    error::{CorpusErr, Result},
    record::{EOS_MARKER, Record},
};

/// Position of the next unread record: (shard index, record offset).
///
/// Monotonic within a shard and advanced only by the [`RecordSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cursor {
    pub shard: usize,
    pub offset: usize,
}

/// What to do when the configured shard list is fully consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpochMode {
    /// Wrap to the first shard and bump the epoch counter (pretraining).
    Wrap,
    /// End the stream after one pass (fine-tuning).
    #[default]
    SinglePass,
}

/// Policy for records that fail to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordPolicy {
    /// Log and skip, never abort the epoch.
    #[default]
    Skip,
    /// Abort the run on the first corrupt record.
    Strict,
}

/// One record pulled off the stream, carrying the cursor *after* itself so
/// downstream snapshots stay exact regardless of buffering depth.
#[derive(Debug, Clone)]
pub struct SourceItem {
    pub record: Record,
    pub next_cursor: Cursor,
    pub epoch: usize,
}

/// Ordered record stream the shuffle buffer pulls from: either a
/// [`RecordSource`] directly or a prefetching wrapper around one.
pub trait RecordStream: Send + Sync {
    fn next_item(&mut self) -> Result<Option<SourceItem>>;

    /// Corrupt records skipped so far.
    fn skipped(&self) -> u64;
}

/// Sequential reader over ordered on-disk shards.
///
/// Guarantees strictly sequential order per shard; no reordering happens at
/// this layer. Shards are JSON-lines files of [`Record`]s, offsets are line
/// indices, so seeking replays the shard head and skips.
pub struct RecordSource {
    shards: Vec<PathBuf>,
    cursor: Cursor,
    epoch: usize,
    mode: EpochMode,
    policy: RecordPolicy,
    reader: Option<Lines<BufReader<File>>>,
    exhausted: bool,
    skipped: u64,
}

impl RecordSource {
    /// Opens the shard list at `start`.
    ///
    /// # Errors
    /// Returns `NoShards` on an empty list and `CursorOutOfRange` when the
    /// start cursor points past the configured shards.
    pub fn open(
        shards: Vec<PathBuf>,
        start: Cursor,
        mode: EpochMode,
        policy: RecordPolicy,
    ) -> Result<Self> {
        if shards.is_empty() {
            return Err(CorpusErr::NoShards);
        }
        if start.shard >= shards.len() {
            return Err(CorpusErr::CursorOutOfRange {
                shard_index: start.shard,
                nshards: shards.len(),
            });
        }

        Ok(Self {
            shards,
            cursor: start,
            epoch: 0,
            mode,
            policy,
            reader: None,
            exhausted: false,
            skipped: 0,
        })
    }

    /// Restores the epoch counter when resuming from a checkpoint.
    pub fn with_epoch(mut self, epoch: usize) -> Self {
        self.epoch = epoch;
        self
    }

    /// Repositions the stream to `cursor`.
    pub fn seek(&mut self, cursor: Cursor) -> Result<()> {
        if cursor.shard >= self.shards.len() {
            return Err(CorpusErr::CursorOutOfRange {
                shard_index: cursor.shard,
                nshards: self.shards.len(),
            });
        }

        self.cursor = cursor;
        self.reader = None;
        self.exhausted = false;
        Ok(())
    }

    #[inline]
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    #[inline]
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Pulls the next record, advancing the cursor.
    ///
    /// Returns `Ok(None)` once the stream ends (single-pass mode only; wrap
    /// mode never ends).
    pub fn next(&mut self) -> Result<Option<SourceItem>> {
        loop {
            if self.exhausted {
                return Ok(None);
            }

            if self.reader.is_none() {
                self.open_current()?;
            }

            match self.reader.as_mut().and_then(|r| r.next()) {
                None => self.advance_shard(),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(line)) => {
                    let at = self.cursor;
                    self.cursor.offset += 1;

                    match decode_line(&line) {
                        Ok(record) => {
                            return Ok(Some(SourceItem {
                                record,
                                next_cursor: self.cursor,
                                epoch: self.epoch,
                            }));
                        }
                        Err(detail) => match self.policy {
                            RecordPolicy::Skip => {
                                self.skipped += 1;
                                warn!(
                                    "skipping corrupt record at {}:{}: {detail}",
                                    self.shards[at.shard].display(),
                                    at.offset,
                                );
                            }
                            RecordPolicy::Strict => {
                                return Err(CorpusErr::CorruptRecord {
                                    shard: self.shards[at.shard].clone(),
                                    offset: at.offset,
                                    detail,
                                });
                            }
                        },
                    }
                }
            }
        }
    }

    fn advance_shard(&mut self) {
        debug!("shard exhausted: index={}", self.cursor.shard);
        self.reader = None;
        self.cursor.shard += 1;
        self.cursor.offset = 0;

        if self.cursor.shard == self.shards.len() {
            match self.mode {
                EpochMode::Wrap => {
                    self.epoch += 1;
                    self.cursor = Cursor::default();
                    debug!(epoch = self.epoch; "corpus wrapped");
                }
                EpochMode::SinglePass => self.exhausted = true,
            }
        }
    }

    fn open_current(&mut self) -> Result<()> {
        let path = &self.shards[self.cursor.shard];
        let file = File::open(path)?;
        let mut lines = BufReader::new(file).lines();

        // Line-indexed cursor over an immutable shard: skip the head.
        for _ in 0..self.cursor.offset {
            match lines.next() {
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }

        self.reader = Some(lines);
        Ok(())
    }
}

impl RecordStream for RecordSource {
    fn next_item(&mut self) -> Result<Option<SourceItem>> {
        self.next()
    }

    fn skipped(&self) -> u64 {
        self.skipped
    }
}

fn decode_line(line: &str) -> std::result::Result<Record, String> {
    let record: Record = serde_json::from_str(line).map_err(|e| e.to_string())?;
    if !record.is_terminated() {
        return Err(format!("field missing end marker {EOS_MARKER:?}"));
    }
    Ok(record)
}
