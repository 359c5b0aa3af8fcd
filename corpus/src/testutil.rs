use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::record::Record;

/// Unique per-test scratch directory under the system temp dir.
pub fn temp_dir(prefix: &str) -> PathBuf {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("{prefix}-{}-{n}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Writes `records` as a JSON-lines shard and returns its path.
pub fn write_shard(dir: &Path, name: &str, records: &[Record]) -> PathBuf {
    let path = dir.join(name);
    let mut body = String::new();
    for rec in records {
        body.push_str(&serde_json::to_string(rec).unwrap());
        body.push('\n');
    }
    std::fs::write(&path, body).unwrap();
    path
}
