use std::{error::Error, fmt, io, path::PathBuf};

/// The corpus module's result type.
pub type Result<T> = std::result::Result<T, CorpusErr>;

/// Data-plane failures.
#[derive(Debug)]
pub enum CorpusErr {
    Io(io::Error),
    /// A record line that could not be decoded, or whose fields are missing
    /// the end-of-sequence marker.
    CorruptRecord {
        shard: PathBuf,
        offset: usize,
        detail: String,
    },
    CursorOutOfRange {
        shard_index: usize,
        nshards: usize,
    },
    /// A restored shuffle window was captured under a different capacity.
    WindowCapacityMismatch {
        expected: usize,
        got: usize,
    },
    NoShards,
}

impl fmt::Display for CorpusErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorpusErr::Io(e) => write!(f, "io error: {e}"),
            CorpusErr::CorruptRecord {
                shard,
                offset,
                detail,
            } => write!(
                f,
                "corrupt record at {}:{offset}: {detail}",
                shard.display()
            ),
            CorpusErr::CursorOutOfRange {
                shard_index,
                nshards,
            } => write!(
                f,
                "cursor shard index {shard_index} out of range for {nshards} shard(s)"
            ),
            CorpusErr::WindowCapacityMismatch { expected, got } => write!(
                f,
                "shuffle window capacity mismatch: configured {expected}, checkpoint has {got}"
            ),
            CorpusErr::NoShards => write!(f, "shard list is empty"),
        }
    }
}

impl Error for CorpusErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CorpusErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CorpusErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
