use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use log::debug;
use tokio::{sync::mpsc, task};

use crate::{
    error::Result,
    source::{RecordSource, RecordStream, SourceItem},
};

/// Asynchronous prefetch: moves a [`RecordSource`] onto the blocking pool
/// and pre-reads items into a bounded channel, so disk reads overlap batch
/// consumption. A full channel blocks the producer (backpressure bounded by
/// the configured depth).
///
/// Each item carries the cursor after itself, so snapshots taken downstream
/// stay exact regardless of how many items sit in the channel; on resume
/// those items are simply re-read.
///
/// Must be spawned from within a tokio runtime; the consuming side is
/// blocking and belongs on the blocking pool as well.
pub struct Prefetcher {
    rx: mpsc::Receiver<Result<SourceItem>>,
    skipped: Arc<AtomicU64>,
}

impl Prefetcher {
    pub fn spawn(mut source: RecordSource, depth: NonZeroUsize) -> Self {
        let (tx, rx) = mpsc::channel(depth.get());
        let skipped = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&skipped);

        task::spawn_blocking(move || {
            loop {
                let item = source.next();
                counter.store(source.skipped(), Ordering::Relaxed);

                match item {
                    Ok(Some(item)) => {
                        if tx.blocking_send(Ok(item)).is_err() {
                            debug!("prefetch consumer dropped, stopping");
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
        });

        Self { rx, skipped }
    }
}

impl RecordStream for Prefetcher {
    fn next_item(&mut self) -> Result<Option<SourceItem>> {
        match self.rx.blocking_recv() {
            Some(res) => res.map(Some),
            None => Ok(None),
        }
    }

    fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        record::Record,
        source::{Cursor, EpochMode, RecordPolicy},
        testutil::{temp_dir, write_shard},
    };

    #[tokio::test(flavor = "multi_thread")]
    async fn preserves_order_and_cursors() {
        let dir = temp_dir("prefetch-order");
        let records: Vec<Record> = (0..16)
            .map(|i| Record::new(format!("p{i}[EOS]"), "r[EOS]"))
            .collect();
        let shard = write_shard(&dir, "a.jsonl", &records);

        let source = RecordSource::open(
            vec![shard],
            Cursor::default(),
            EpochMode::SinglePass,
            RecordPolicy::Skip,
        )
        .unwrap();

        let mut prefetcher = Prefetcher::spawn(source, NonZeroUsize::new(4).unwrap());

        let items = task::spawn_blocking(move || {
            let mut out = Vec::new();
            while let Some(item) = prefetcher.next_item().unwrap() {
                out.push(item);
            }
            out
        })
        .await
        .unwrap();

        assert_eq!(items.len(), 16);
        for (i, item) in items.iter().enumerate() {
            assert_eq!(item.record.prompt, format!("p{i}[EOS]"));
            assert_eq!(item.next_cursor.offset, i + 1);
        }
    }
}
