pub mod collate;
pub mod error;
pub mod pipeline;
pub mod prefetch;
pub mod record;
pub mod shuffle;
pub mod source;

#[cfg(test)]
mod testutil;

pub use collate::{Batch, Collator};
pub use error::{CorpusErr, Result};
pub use pipeline::{Pipeline, PipelineConfig, PipelineState};
pub use prefetch::Prefetcher;
pub use record::{EOS_MARKER, Record};
pub use shuffle::ShuffleBuffer;
pub use source::{Cursor, EpochMode, RecordPolicy, RecordSource, RecordStream, SourceItem};
