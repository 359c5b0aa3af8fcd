use std::ops::Range;

use crate::error::{CoordErr, Result};

/// Splits `total` shards among `world_size` ranks and returns the range for
/// `rank`.
///
/// Properties:
/// - Ranges are contiguous, disjoint and cover `[0..total)`.
/// - Sizes differ by at most 1 (balanced partition).
/// - Purely a function of (total, rank, world_size), so every rank computes
///   the same assignment without communicating.
pub fn partition_range(total: usize, rank: usize, world_size: usize) -> Result<Range<usize>> {
    if world_size == 0 {
        return Err(CoordErr::WorldSizeZero);
    }
    if rank >= world_size {
        return Err(CoordErr::InvalidRank { rank, world_size });
    }

    let base = total / world_size;
    let rem = total % world_size;

    let start = rank * base + rank.min(rem);
    let extra = if rank < rem { 1 } else { 0 };

    Ok(start..start + base + extra)
}

/// This rank's shard subset, in traversal order.
pub fn partition<T: Clone>(items: &[T], rank: usize, world_size: usize) -> Result<Vec<T>> {
    let range = partition_range(items.len(), rank, world_size)?;
    Ok(items[range].to_vec())
}
