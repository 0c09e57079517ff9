//! Command-line preprocessor: converts an edge-list or adjacency-list
//! text graph into molino shards.

use std::collections::HashMap;
use std::process;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use molino::config::EngineConfig;
use molino::error::{MolinoError, Result};
use molino::metrics::EngineMetrics;
use molino::model::{EdgeValue, PairValue};
use molino::preprocess::{
    AdjacencyListParser, DegreeOrdering, EdgeListParser, GraphIngest, NshardsSpec,
    PreprocessStage, convert,
};

const USAGE: &str = "\
molino-sharder: create shards from a text graph

USAGE:
    molino-sharder file=<path> filetype=<edgelist|adjlist> \
edgedatatype=<type> nshards=<n|auto> [degree_order=true]

ARGUMENTS:
    file=<path>        input graph; shard files are created next to it
    filetype=          edgelist | adjlist
    edgedatatype=      int, uint, short, float, char, double, boolean,
                       long, int-int, float-float
    nshards=           shard count, or 'auto' for ~256 MB edge data each
    degree_order=true  relabel vertices in ascending degree order first
";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run() {
        Ok(nshards) => {
            println!("created {nshards} shard(s)");
        }
        Err(err) => {
            eprintln!("molino-sharder: {err}");
            eprintln!();
            eprintln!("{USAGE}");
            process::exit(1);
        }
    }
}

fn run() -> Result<usize> {
    let mut options: HashMap<String, String> = HashMap::new();
    for arg in std::env::args().skip(1) {
        let Some((key, value)) = arg.split_once('=') else {
            return Err(MolinoError::InvalidArgument(format!(
                "expected key=value, got {arg:?}"
            )));
        };
        options.insert(key.to_string(), value.to_string());
    }

    let file = required(&options, "file")?;
    let filetype = required(&options, "filetype")?;
    let edgedatatype = required(&options, "edgedatatype")?;
    let nshards: NshardsSpec = required(&options, "nshards")?.parse()?;
    let degree_order = options.get("degree_order").map(String::as_str) == Some("true");

    match edgedatatype {
        "int" => shard::<i32>(file, filetype, nshards, degree_order),
        "uint" => shard::<u32>(file, filetype, nshards, degree_order),
        "short" => shard::<i16>(file, filetype, nshards, degree_order),
        "float" => shard::<f32>(file, filetype, nshards, degree_order),
        "char" => shard::<u8>(file, filetype, nshards, degree_order),
        "double" => shard::<f64>(file, filetype, nshards, degree_order),
        "boolean" => shard::<bool>(file, filetype, nshards, degree_order),
        "long" => shard::<i64>(file, filetype, nshards, degree_order),
        "int-int" => shard::<PairValue<i32>>(file, filetype, nshards, degree_order),
        "float-float" => shard::<PairValue<f32>>(file, filetype, nshards, degree_order),
        other => Err(MolinoError::InvalidArgument(format!(
            "unknown edgedatatype {other:?}"
        ))),
    }
}

fn required<'a>(options: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    options
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| MolinoError::InvalidArgument(format!("missing required argument {key}=")))
}

fn shard<E: EdgeValue>(
    file: &str,
    filetype: &str,
    nshards: NshardsSpec,
    degree_order: bool,
) -> Result<usize> {
    let parser: Box<dyn GraphIngest<E>> = match filetype {
        "edgelist" => Box::new(EdgeListParser),
        "adjlist" => Box::new(AdjacencyListParser),
        other => {
            return Err(MolinoError::InvalidArgument(format!(
                "filetype must be 'edgelist' or 'adjlist', got {other:?}"
            )))
        }
    };
    let stages: Vec<Box<dyn PreprocessStage<E>>> = if degree_order {
        vec![Box::new(DegreeOrdering)]
    } else {
        Vec::new()
    };
    convert::<E>(
        file,
        parser.as_ref(),
        nshards,
        stages,
        &EngineConfig::default(),
        &Arc::new(EngineMetrics::new()),
    )
}
