//! Preprocessing pipeline: parse a text graph, externally sort it into the
//! preprocess stream, optionally run rewrite stages, and create shards.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tracing::info;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::metrics::EngineMetrics;
use crate::model::EdgeValue;
use crate::shard::find_existing_shards;

pub mod parse;
pub mod relabel;
pub mod sharder;
pub mod stream;

pub use parse::{AdjacencyListParser, EdgeListParser, GraphIngest};
pub use relabel::{DegreeOrdering, PreprocessStage, read_vertexmap};
pub use sharder::{NshardsSpec, Sharder};
pub use stream::{PreprocessStream, ShovelEdge};

/// Converts the text graph at `input` into shards, reusing whatever
/// earlier stages already produced: a complete shard set short-circuits
/// everything, an existing preprocess stream skips re-parsing. Returns the
/// shard count. The sharded base name is `input` plus the stage suffixes.
pub fn convert<E: EdgeValue>(
    input: &str,
    parser: &dyn GraphIngest<E>,
    nshards: NshardsSpec,
    mut stages: Vec<Box<dyn PreprocessStage<E>>>,
    config: &EngineConfig,
    metrics: &Arc<EngineMetrics>,
) -> Result<usize> {
    let suffix: String = stages.iter().map(|s| s.suffix()).collect();
    let base = format!("{input}{suffix}");

    if let Some(n) = find_existing_shards(&base, nshards.hint()) {
        info!(base = %base, nshards = n, "convert.shards_exist");
        return Ok(n);
    }

    let mut sharder = Sharder::<E>::new(&base, config.clone(), Arc::clone(metrics));
    if sharder.preprocessed_exists() {
        info!(base = %base, "convert.preprocessed_exists");
    } else {
        sharder.start_ingest()?;
        let mut reader = BufReader::new(File::open(input)?);
        parser.ingest(&mut reader, &mut sharder)?;
        sharder.finish_ingest()?;
        for stage in &mut stages {
            stage.reprocess(&sharder.preprocess_path(), input)?;
        }
    }
    sharder.create_shards(nshards)
}
