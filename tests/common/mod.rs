#![allow(dead_code)]

use std::sync::Arc;

use molino::config::EngineConfig;
use molino::io::StripedIo;
use molino::metrics::EngineMetrics;
use molino::model::{EdgeValue, GraphVertex, VertexCapabilities, Vid};
use molino::preprocess::{NshardsSpec, Sharder};
use molino::shard::sliding::SlidingShardOptions;
use molino::shard::{ShardInterval, SlidingShard, load_intervals};

/// Small-buffer config so tiny test graphs still exercise run spills and
/// block rotation.
pub fn test_config() -> EngineConfig {
    EngineConfig::compact()
}

/// Runs the full sharder pipeline over in-memory edges.
pub fn build_shards<E: EdgeValue>(
    base: &str,
    edges: &[(Vid, Vid, E)],
    nshards: usize,
) -> Vec<ShardInterval> {
    build_shards_with_config(base, edges, nshards, &test_config())
}

pub fn build_shards_with_config<E: EdgeValue>(
    base: &str,
    edges: &[(Vid, Vid, E)],
    nshards: usize,
    config: &EngineConfig,
) -> Vec<ShardInterval> {
    let mut sharder = Sharder::<E>::new(base, config.clone(), Arc::new(EngineMetrics::new()));
    sharder.start_ingest().unwrap();
    for &(src, dst, value) in edges {
        sharder.add_edge(src, dst, value).unwrap();
    }
    sharder.finish_ingest().unwrap();
    let n = sharder.create_shards(NshardsSpec::Count(nshards)).unwrap();
    load_intervals(base, n).unwrap()
}

/// Streams every shard front to back through its sliding cursor and
/// collects `(src, dst, value)` triples — the multiset a correct shard set
/// must reproduce.
pub fn stream_all_edges<E: EdgeValue>(
    base: &str,
    intervals: &[ShardInterval],
    max_vid: Vid,
) -> Vec<(Vid, Vid, E)> {
    let io = StripedIo::new(2, Arc::new(EngineMetrics::new()));
    let nshards = intervals.len();
    let config = test_config();
    let mut out = Vec::new();

    for (shard, &interval) in intervals.iter().enumerate() {
        let mut slider = SlidingShard::<E>::open(
            io.clone(),
            base,
            nshards,
            shard,
            interval,
            &config,
            VertexCapabilities::default(),
            SlidingShardOptions::default(),
        )
        .unwrap();
        let mut vertices: Vec<GraphVertex<E>> =
            (0..=max_vid).map(GraphVertex::new).collect();
        slider
            .read_next_vertices(&mut vertices, 0, true)
            .unwrap();
        slider.complete_loads().unwrap();
        for vertex in &vertices {
            for edge in vertex.outedges() {
                out.push((vertex.id(), edge.vertex(), edge.value().unwrap()));
            }
        }
        drop(vertices);
        slider.flush().unwrap();
    }
    out
}

/// Multiset comparison key order.
pub fn sorted<E: EdgeValue + PartialOrd>(mut edges: Vec<(Vid, Vid, E)>) -> Vec<(Vid, Vid, E)> {
    edges.sort_by(|a, b| {
        (a.0, a.1)
            .cmp(&(b.0, b.1))
            .then(a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
    });
    edges
}
