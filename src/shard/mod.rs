//! Shard layout: file naming, interval bookkeeping, and the storage
//! objects that stream (`sliding`) or fully load (`memory`) one shard.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::error::{MolinoError, Result};
use crate::model::Vid;

pub mod codec;
pub mod index;
pub mod memory;
pub mod sliding;

pub use codec::{AdjacencyEncoder, AdjacencyScanner, RecordHeader};
pub use index::{IndexEntry, SparseShardIndex};
pub use memory::MemoryShard;
pub use sliding::SlidingShard;

/// Contiguous vertex-id range owned by one shard. Bounds are inclusive.
/// The shard holds every edge whose destination falls inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardInterval {
    pub lo: Vid,
    pub hi: Vid,
}

impl ShardInterval {
    pub fn new(lo: Vid, hi: Vid) -> Self {
        Self { lo, hi }
    }

    pub fn contains(&self, vid: Vid) -> bool {
        self.lo <= vid && vid <= self.hi
    }

    /// Number of vertex ids covered.
    pub fn num_vertices(&self) -> usize {
        (self.hi - self.lo) as usize + 1
    }
}

pub fn edata_filename(base: &str, nshards: usize, shard: usize) -> String {
    format!("{base}.edata.{nshards}.{shard}")
}

pub fn adj_filename(base: &str, nshards: usize, shard: usize) -> String {
    format!("{base}.{nshards}.adj.{shard}")
}

pub fn intervals_filename(base: &str, nshards: usize) -> String {
    format!("{base}.{nshards}.intervals")
}

pub fn vertex_values_filename(base: &str, value_size: usize) -> String {
    format!("{base}.vertex.{value_size}")
}

pub fn vertexmap_filename(base: &str) -> String {
    format!("{base}.vertexmap")
}

pub fn preprocess_filename(base: &str) -> String {
    format!("{base}.preprocess")
}

pub fn degree_ordered_basename(base: &str) -> String {
    format!("{base}_degord")
}

/// Writes the interval list: one `lo hi` line per shard.
pub fn write_intervals(base: &str, intervals: &[ShardInterval]) -> Result<()> {
    let mut out = File::create(intervals_filename(base, intervals.len()))?;
    for iv in intervals {
        writeln!(out, "{} {}", iv.lo, iv.hi)?;
    }
    out.sync_all()?;
    Ok(())
}

/// Loads and validates the interval list for `(base, nshards)`: intervals
/// must be contiguous from vertex 0 with ascending bounds.
pub fn load_intervals(base: &str, nshards: usize) -> Result<Vec<ShardInterval>> {
    let path = intervals_filename(base, nshards);
    let file = File::open(&path)?;
    let mut intervals = Vec::with_capacity(nshards);
    let mut expect_lo: Vid = 0;
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let mut it = line.split_whitespace();
        let (lo, hi) = match (it.next(), it.next()) {
            (Some(lo), Some(hi)) => (
                lo.parse::<Vid>()
                    .map_err(|e| MolinoError::Corruption(format!("{path}:{lineno}: {e}")))?,
                hi.parse::<Vid>()
                    .map_err(|e| MolinoError::Corruption(format!("{path}:{lineno}: {e}")))?,
            ),
            _ => {
                return Err(MolinoError::Corruption(format!(
                    "{path}:{lineno}: expected `lo hi`"
                )))
            }
        };
        if lo != expect_lo || hi < lo {
            return Err(MolinoError::Corruption(format!(
                "{path}:{lineno}: interval [{lo}, {hi}] does not continue from {expect_lo}"
            )));
        }
        intervals.push(ShardInterval::new(lo, hi));
        expect_lo = hi + 1;
    }
    if intervals.len() != nshards {
        return Err(MolinoError::Corruption(format!(
            "{path}: {} intervals, expected {nshards}",
            intervals.len()
        )));
    }
    Ok(intervals)
}

/// Checks whether a complete shard set already exists for `base`. With a
/// shard-count hint only that count is probed; otherwise the directory is
/// scanned for any `<base>.<N>.intervals` whose file set is complete.
pub fn find_existing_shards(base: &str, hint: Option<usize>) -> Option<usize> {
    if let Some(nshards) = hint {
        return shard_set_complete(base, nshards).then_some(nshards);
    }

    let base_path = Path::new(base);
    let dir = match base_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let stem = base_path.file_name()?.to_str()?;
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(middle) = name
            .strip_prefix(stem)
            .and_then(|rest| rest.strip_prefix('.'))
            .and_then(|rest| rest.strip_suffix(".intervals"))
        else {
            continue;
        };
        if let Ok(nshards) = middle.parse::<usize>() {
            if shard_set_complete(base, nshards) {
                return Some(nshards);
            }
        }
    }
    None
}

fn shard_set_complete(base: &str, nshards: usize) -> bool {
    if nshards == 0 || !Path::new(&intervals_filename(base, nshards)).exists() {
        return false;
    }
    (0..nshards).all(|k| {
        Path::new(&adj_filename(base, nshards, k)).exists()
            && Path::new(&edata_filename(base, nshards, k)).exists()
    })
}
