//! Property tests: sharding round-trips arbitrary edge lists, intervals
//! always partition the id space, and the skip-run encoding beats the
//! naive layout whenever sources have gaps.

mod common;

use proptest::prelude::*;

use molino::model::Vid;
use molino::shard::codec::{AdjacencyEncoder, AdjacencyScanner};
use tempfile::tempdir;

use common::{build_shards, sorted, stream_all_edges};

fn arb_edges() -> impl Strategy<Value = Vec<(Vid, Vid, u32)>> {
    prop::collection::vec((0u32..200, 0u32..200, any::<u32>()), 1..250).prop_map(|edges| {
        edges
            .into_iter()
            .filter(|&(src, dst, _)| src != dst)
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_shard_and_stream_roundtrips(edges in arb_edges(), nshards in 1usize..5) {
        prop_assume!(!edges.is_empty());
        let max_vid = edges.iter().map(|&(s, d, _)| s.max(d)).max().unwrap();
        prop_assume!(max_vid as usize + 1 >= nshards);

        let dir = tempdir().unwrap();
        let base = dir.path().join("g").to_str().unwrap().to_string();
        let intervals = build_shards(&base, &edges, nshards);

        // Partition: contiguous cover of [0, max_vid].
        prop_assert_eq!(intervals.len(), nshards);
        prop_assert_eq!(intervals[0].lo, 0);
        prop_assert_eq!(intervals.last().unwrap().hi, max_vid);
        for pair in intervals.windows(2) {
            prop_assert_eq!(pair[0].hi + 1, pair[1].lo);
        }

        // Round-trip as a multiset, values included.
        let streamed = stream_all_edges::<u32>(&base, &intervals, max_vid);
        prop_assert_eq!(sorted(streamed), sorted(edges));
    }

    #[test]
    fn prop_skip_runs_roundtrip_and_beat_naive(
        gaps in prop::collection::vec((1u32..600, 1usize..4), 1..20)
    ) {
        // Sources with configurable gaps before each of them.
        let mut records: Vec<(Vid, Vec<Vid>)> = Vec::new();
        let mut src: Vid = 0;
        for (gap, degree) in gaps {
            src += gap;
            records.push((src, (0..degree as Vid).collect()));
            src += 1;
        }

        let mut encoder = AdjacencyEncoder::new(Vec::new());
        for (src, dsts) in &records {
            encoder.append(*src, dsts).unwrap();
        }
        let bytes = encoder.finish().unwrap();

        // Exact round-trip.
        let mut scanner = AdjacencyScanner::new(&bytes);
        let mut decoded = Vec::new();
        while let Some(rec) = scanner.next_record().unwrap() {
            decoded.push((rec.src, rec.dsts().collect::<Vec<_>>()));
        }
        prop_assert_eq!(&decoded, &records);

        // Strictly shorter than spelling every absent source out as a
        // (count = 0, id) pair.
        let last_src = records.last().unwrap().0;
        let present: usize = records.len();
        let present_bytes: usize = records
            .iter()
            .map(|(_, dsts)| {
                let header = if dsts.len() < 255 { 1 } else { 5 };
                header + 4 * dsts.len()
            })
            .sum();
        let absent = last_src as usize + 1 - present;
        let naive = present_bytes + absent * 5;
        prop_assert!(bytes.len() < naive);
    }
}
