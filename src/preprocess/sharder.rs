//! The sharder: a two-phase external sorter turning an edge stream into
//! shard files.
//!
//! Phase one buffers `add_edge` calls and spills sorted runs into the
//! preprocess stream. Phase two merges the runs, picks vertex-aligned
//! interval boundaries that balance edge counts, and writes each shard's
//! adjacency and edge-data files.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::str::FromStr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{MolinoError, Result};
use crate::metrics::EngineMetrics;
use crate::model::{EdgeValue, Vid};
use crate::preprocess::stream::{PreprocessStream, ShovelEdge, StreamWriter};
use crate::shard::codec::AdjacencyEncoder;
use crate::shard::{
    ShardInterval, adj_filename, edata_filename, find_existing_shards, preprocess_filename,
    write_intervals,
};

/// Requested shard count: explicit, or sized so each edge-data file lands
/// near the configured target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NshardsSpec {
    Count(usize),
    Auto,
}

impl NshardsSpec {
    pub fn hint(&self) -> Option<usize> {
        match self {
            NshardsSpec::Count(n) => Some(*n),
            NshardsSpec::Auto => None,
        }
    }
}

impl FromStr for NshardsSpec {
    type Err = MolinoError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(NshardsSpec::Auto);
        }
        let n = s
            .parse::<usize>()
            .map_err(|_| MolinoError::InvalidArgument(format!("nshards must be a count or 'auto', got {s:?}")))?;
        if n == 0 {
            return Err(MolinoError::InvalidArgument("nshards must be at least 1".into()));
        }
        Ok(NshardsSpec::Count(n))
    }
}

enum IngestState<E: EdgeValue> {
    Idle,
    Ingesting(StreamWriter<E>),
    Done(PreprocessStream),
}

pub struct Sharder<E: EdgeValue> {
    base: String,
    config: EngineConfig,
    metrics: Arc<EngineMetrics>,
    buffer: Vec<ShovelEdge<E>>,
    state: IngestState<E>,
}

impl<E: EdgeValue> Sharder<E> {
    pub fn new(base: &str, config: EngineConfig, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            base: base.to_string(),
            config,
            metrics,
            buffer: Vec::new(),
            state: IngestState::Idle,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn preprocess_path(&self) -> String {
        preprocess_filename(&self.base)
    }

    pub fn preprocessed_exists(&self) -> bool {
        PreprocessStream::open(self.preprocess_path()).is_ok()
    }

    pub fn start_ingest(&mut self) -> Result<()> {
        let writer = StreamWriter::create(self.preprocess_path())?;
        self.buffer.reserve(self.config.ingest_buffer_edges);
        self.state = IngestState::Ingesting(writer);
        info!(base = %self.base, "sharder.ingest.start");
        Ok(())
    }

    /// Buffers one edge; spills a sorted run when the buffer fills. The
    /// sharder accepts whatever it is given — self-edge filtering is the
    /// parsers' responsibility.
    pub fn add_edge(&mut self, src: Vid, dst: Vid, value: E) -> Result<()> {
        let IngestState::Ingesting(_) = &self.state else {
            return Err(MolinoError::InvalidArgument(
                "add_edge outside an ingest phase".into(),
            ));
        };
        self.buffer.push(ShovelEdge { src, dst, value });
        if self.buffer.len() >= self.config.ingest_buffer_edges {
            self.spill_run()?;
        }
        Ok(())
    }

    pub fn finish_ingest(&mut self) -> Result<()> {
        self.spill_run()?;
        let state = std::mem::replace(&mut self.state, IngestState::Idle);
        let IngestState::Ingesting(writer) = state else {
            return Err(MolinoError::InvalidArgument(
                "finish_ingest outside an ingest phase".into(),
            ));
        };
        let stream = writer.finish()?;
        info!(
            base = %self.base,
            edges = stream.num_edges(),
            runs = stream.num_runs(),
            max_vid = stream.max_vid(),
            "sharder.ingest.done"
        );
        self.state = IngestState::Done(stream);
        Ok(())
    }

    fn spill_run(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let IngestState::Ingesting(writer) = &mut self.state else {
            return Err(MolinoError::InvalidArgument(
                "spill outside an ingest phase".into(),
            ));
        };
        writer.write_run(&mut self.buffer)?;
        self.buffer.clear();
        self.metrics.record_run_spilled();
        Ok(())
    }

    /// Phase two. Reopens the preprocess stream (which may predate this
    /// process), resolves the shard count, and writes the shard files.
    /// A complete existing shard set makes this a no-op.
    pub fn create_shards(&mut self, spec: NshardsSpec) -> Result<usize> {
        // Reopen from disk rather than trusting ingest-time state: a
        // preprocessor stage may have rewritten the stream in between.
        self.state = IngestState::Idle;
        let stream = PreprocessStream::open(self.preprocess_path())?;
        stream.check_record_size::<E>()?;

        let total_edges = stream.num_edges();
        let nshards = match spec {
            NshardsSpec::Count(n) => n,
            NshardsSpec::Auto => {
                let bytes = total_edges * E::SIZE as u64;
                (bytes.div_ceil(self.config.auto_shard_target_bytes) as usize).max(1)
            }
        };
        if nshards == 0 {
            return Err(MolinoError::InvalidArgument("nshards must be at least 1".into()));
        }

        if find_existing_shards(&self.base, Some(nshards)).is_some() {
            info!(base = %self.base, nshards, "sharder.shards_exist");
            self.state = IngestState::Done(stream);
            return Ok(nshards);
        }

        let intervals = self.choose_intervals(&stream, nshards, total_edges)?;
        self.write_shards(&stream, &intervals)?;
        write_intervals(&self.base, &intervals)?;
        info!(base = %self.base, nshards, edges = total_edges, "sharder.done");
        self.state = IngestState::Done(stream);
        Ok(nshards)
    }

    /// First merge pass: walk edges in destination order and cut a shard
    /// boundary (aligned to a vertex) whenever the running count reaches
    /// the per-shard share.
    fn choose_intervals(
        &self,
        stream: &PreprocessStream,
        nshards: usize,
        total_edges: u64,
    ) -> Result<Vec<ShardInterval>> {
        let max_vid = stream.max_vid();
        if (max_vid as u64) + 1 < nshards as u64 {
            return Err(MolinoError::InvalidArgument(format!(
                "cannot cut {} vertices into {nshards} shards",
                max_vid as u64 + 1
            )));
        }

        let target = total_edges.div_ceil(nshards as u64).max(1);
        let mut cuts: Vec<Vid> = Vec::with_capacity(nshards.saturating_sub(1));
        let mut count = 0u64;
        let mut last_dst: Option<Vid> = None;

        let mut merger = stream.merge::<E>()?;
        while let Some(edge) = merger.next_edge()? {
            if cuts.len() + 1 < nshards && count >= target && last_dst.is_some_and(|d| d != edge.dst)
            {
                cuts.push(edge.dst - 1);
                count = 0;
            }
            count += 1;
            last_dst = Some(edge.dst);
        }

        let mut intervals = Vec::with_capacity(nshards);
        let mut lo: Vid = 0;
        for hi in cuts {
            intervals.push(ShardInterval::new(lo, hi));
            lo = hi + 1;
        }
        intervals.push(ShardInterval::new(lo, max_vid));

        // Sparse or skewed graphs can yield fewer cuts than requested;
        // split the widest intervals until the count matches.
        while intervals.len() < nshards {
            let widest = intervals
                .iter()
                .enumerate()
                .max_by_key(|(_, iv)| iv.num_vertices())
                .map(|(i, _)| i)
                .ok_or_else(|| MolinoError::Corruption("no intervals computed".into()))?;
            let iv = intervals[widest];
            if iv.num_vertices() < 2 {
                return Err(MolinoError::InvalidArgument(format!(
                    "cannot cut {} vertices into {nshards} shards",
                    max_vid as u64 + 1
                )));
            }
            let mid = iv.lo + (iv.hi - iv.lo) / 2;
            intervals[widest] = ShardInterval::new(iv.lo, mid);
            intervals.insert(widest + 1, ShardInterval::new(mid + 1, iv.hi));
            warn!(
                nshards,
                "sharder.padded_intervals: edge balance could not fill every shard"
            );
        }
        Ok(intervals)
    }

    /// Second merge pass: collect one shard's edges at a time (a shard is
    /// sized to fit in memory — the same premise the execution window
    /// relies on), regroup them by source, and encode.
    fn write_shards(&self, stream: &PreprocessStream, intervals: &[ShardInterval]) -> Result<()> {
        let nshards = intervals.len();
        let mut merger = stream.merge::<E>()?;

        for (shard, interval) in intervals.iter().enumerate() {
            let mut edges: Vec<ShovelEdge<E>> = Vec::new();
            while merger
                .peek()
                .is_some_and(|edge| interval.contains(edge.dst))
            {
                let edge = merger
                    .next_edge()?
                    .ok_or_else(|| MolinoError::Corruption("merge cursor lost an edge".into()))?;
                edges.push(edge);
            }
            edges.sort_unstable_by_key(|e| (e.src, e.dst));
            self.write_one_shard(shard, nshards, interval, &edges)?;
        }

        if let Some(edge) = merger.peek() {
            return Err(MolinoError::Corruption(format!(
                "edge ({}, {}) falls outside every shard interval",
                edge.src, edge.dst
            )));
        }
        Ok(())
    }

    fn write_one_shard(
        &self,
        shard: usize,
        nshards: usize,
        interval: &ShardInterval,
        edges: &[ShovelEdge<E>],
    ) -> Result<()> {
        let adj_file = File::create(adj_filename(&self.base, nshards, shard))?;
        let mut encoder = AdjacencyEncoder::new(BufWriter::new(adj_file));
        let edata_file = File::create(edata_filename(&self.base, nshards, shard))?;
        let mut edata = BufWriter::new(edata_file);

        let mut value_buf = vec![0u8; E::SIZE];
        let mut dsts: Vec<Vid> = Vec::new();
        let mut idx = 0;
        while idx < edges.len() {
            let src = edges[idx].src;
            dsts.clear();
            while idx < edges.len() && edges[idx].src == src {
                dsts.push(edges[idx].dst);
                edges[idx].value.write_to(&mut value_buf);
                edata.write_all(&value_buf)?;
                idx += 1;
            }
            encoder.append(src, &dsts)?;
        }

        let adj_out = encoder.finish()?;
        adj_out
            .into_inner()
            .map_err(|e| MolinoError::Io(e.into_error()))?
            .sync_all()?;
        edata
            .into_inner()
            .map_err(|e| MolinoError::Io(e.into_error()))?
            .sync_all()?;
        info!(
            shard,
            nshards,
            lo = interval.lo,
            hi = interval.hi,
            edges = edges.len(),
            "sharder.shard_written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::codec::AdjacencyScanner;
    use crate::shard::load_intervals;
    use tempfile::tempdir;

    fn shard_edges(base: &str, nshards: usize, shard: usize) -> Vec<(Vid, Vid)> {
        let bytes = std::fs::read(adj_filename(base, nshards, shard)).unwrap();
        let mut scanner = AdjacencyScanner::new(&bytes);
        let mut out = Vec::new();
        while let Some(rec) = scanner.next_record().unwrap() {
            for dst in rec.dsts() {
                out.push((rec.src, dst));
            }
        }
        out
    }

    fn shard_small_graph(base: &str) -> usize {
        let mut sharder =
            Sharder::<u32>::new(base, EngineConfig::compact(), Arc::new(EngineMetrics::new()));
        sharder.start_ingest().unwrap();
        for &(src, dst) in &[(0u32, 1u32), (0, 2), (1, 2), (2, 0), (3, 0)] {
            sharder.add_edge(src, dst, 0).unwrap();
        }
        sharder.finish_ingest().unwrap();
        sharder.create_shards(NshardsSpec::Count(2)).unwrap()
    }

    #[test]
    fn balanced_intervals_on_the_reference_graph() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("g").to_str().unwrap().to_string();
        let nshards = shard_small_graph(&base);
        assert_eq!(nshards, 2);

        let intervals = load_intervals(&base, 2).unwrap();
        assert_eq!(
            intervals,
            vec![ShardInterval::new(0, 1), ShardInterval::new(2, 3)]
        );

        // Shard 0 holds dst in {0, 1}, grouped by source.
        assert_eq!(shard_edges(&base, 2, 0), vec![(0, 1), (2, 0), (3, 0)]);
        assert_eq!(shard_edges(&base, 2, 1), vec![(0, 2), (1, 2)]);
    }

    #[test]
    fn sharding_twice_leaves_files_unchanged() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("g").to_str().unwrap().to_string();
        shard_small_graph(&base);
        let before = std::fs::read(adj_filename(&base, 2, 0)).unwrap();
        let mtime = std::fs::metadata(adj_filename(&base, 2, 0))
            .unwrap()
            .modified()
            .unwrap();

        // Second run sees the complete set and does nothing.
        let mut sharder = Sharder::<u32>::new(
            &base,
            EngineConfig::compact(),
            Arc::new(EngineMetrics::new()),
        );
        assert_eq!(sharder.create_shards(NshardsSpec::Count(2)).unwrap(), 2);
        assert_eq!(std::fs::read(adj_filename(&base, 2, 0)).unwrap(), before);
        assert_eq!(
            std::fs::metadata(adj_filename(&base, 2, 0))
                .unwrap()
                .modified()
                .unwrap(),
            mtime
        );
    }

    #[test]
    fn spills_multiple_runs_and_merges_them() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("g").to_str().unwrap().to_string();
        let config = EngineConfig {
            ingest_buffer_edges: 8,
            ..EngineConfig::compact()
        };
        let metrics = Arc::new(EngineMetrics::new());
        let mut sharder = Sharder::<u32>::new(&base, config, Arc::clone(&metrics));
        sharder.start_ingest().unwrap();
        // 100 edges all into a few destinations, reverse order.
        for i in (0..100u32).rev() {
            sharder.add_edge(i + 1, i % 5, i).unwrap();
        }
        sharder.finish_ingest().unwrap();
        assert!(metrics.snapshot().runs_spilled > 1);

        let nshards = sharder.create_shards(NshardsSpec::Count(3)).unwrap();
        let intervals = load_intervals(&base, nshards).unwrap();
        let mut total = 0;
        for (k, iv) in intervals.iter().enumerate() {
            let edges = shard_edges(&base, nshards, k);
            total += edges.len();
            assert!(edges.iter().all(|&(_, dst)| iv.contains(dst)));
            // Sources ascend within a shard.
            let srcs: Vec<Vid> = edges.iter().map(|&(s, _)| s).collect();
            let mut sorted = srcs.clone();
            sorted.sort_unstable();
            assert_eq!(srcs, sorted);
        }
        assert_eq!(total, 100);
    }

    #[test]
    fn auto_picks_shard_count_from_target_size() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("g").to_str().unwrap().to_string();
        let config = EngineConfig {
            auto_shard_target_bytes: 100,
            ..EngineConfig::compact()
        };
        let mut sharder = Sharder::<u32>::new(&base, config, Arc::new(EngineMetrics::new()));
        sharder.start_ingest().unwrap();
        // 100 edges * 4 bytes = 400 bytes of edge data -> 4 shards.
        for i in 0..100u32 {
            sharder.add_edge(i, (i + 1) % 100, 0).unwrap();
        }
        sharder.finish_ingest().unwrap();
        assert_eq!(sharder.create_shards(NshardsSpec::Auto).unwrap(), 4);
    }

    #[test]
    fn more_shards_than_vertices_is_an_error() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("g").to_str().unwrap().to_string();
        let mut sharder = Sharder::<u32>::new(
            &base,
            EngineConfig::compact(),
            Arc::new(EngineMetrics::new()),
        );
        sharder.start_ingest().unwrap();
        sharder.add_edge(0, 1, 0).unwrap();
        sharder.finish_ingest().unwrap();
        assert!(sharder.create_shards(NshardsSpec::Count(5)).is_err());
    }

    #[test]
    fn nshards_spec_parses() {
        assert_eq!("auto".parse::<NshardsSpec>().unwrap(), NshardsSpec::Auto);
        assert_eq!(
            "4".parse::<NshardsSpec>().unwrap(),
            NshardsSpec::Count(4)
        );
        assert!("0".parse::<NshardsSpec>().is_err());
        assert!("four".parse::<NshardsSpec>().is_err());
    }
}
