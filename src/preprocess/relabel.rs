//! Preprocessor stages: transformations applied to the preprocessed edge
//! stream between ingestion and shard creation. The one shipped stage
//! relabels vertices in ascending degree order.

use std::fs::File;
use std::io::Write;

use tracing::{debug, info};

use crate::error::{MolinoError, Result};
use crate::model::{EdgeValue, Vid};
use crate::preprocess::stream::{PreprocessStream, StreamWriter};
use crate::shard::vertexmap_filename;

/// A stage rewrites the preprocess stream in place. Its suffix becomes
/// part of the sharded base name, so different stage chains coexist on
/// disk.
pub trait PreprocessStage<E: EdgeValue> {
    fn suffix(&self) -> &'static str;
    fn reprocess(&mut self, stream_path: &str, base: &str) -> Result<()>;
}

/// Relabels vertices so that ids ascend with undirected degree: new id 0
/// is the minimum-degree vertex. The old-to-new table is persisted next to
/// the graph as `<base>.vertexmap`.
#[derive(Debug, Default)]
pub struct DegreeOrdering;

impl DegreeOrdering {
    fn build_table(stream: &PreprocessStream, degrees: &[u32]) -> Vec<Vid> {
        let nverts = degrees.len();
        let mut order: Vec<(u32, Vid)> = (0..nverts as Vid).map(|v| (degrees[v as usize], v)).collect();
        order.sort_unstable();

        let mut table = vec![0 as Vid; nverts];
        for (rank, &(_, old)) in order.iter().enumerate() {
            table[old as usize] = rank as Vid;
        }
        debug!(
            nverts,
            max_vid = stream.max_vid(),
            "degree_order.table_built"
        );
        table
    }
}

impl<E: EdgeValue> PreprocessStage<E> for DegreeOrdering {
    fn suffix(&self) -> &'static str {
        "_degord"
    }

    fn reprocess(&mut self, stream_path: &str, base: &str) -> Result<()> {
        let stream = PreprocessStream::open(stream_path)?;
        stream.check_record_size::<E>()?;
        let nverts = stream.max_vid() as usize + 1;

        // Pass one: undirected degree per vertex.
        let mut degrees = vec![0u32; nverts];
        for run in 0..stream.num_runs() {
            let mut reader = stream.run_reader::<E>(run)?;
            while let Some(edge) = reader.next_edge()? {
                degrees[edge.src as usize] += 1;
                degrees[edge.dst as usize] += 1;
            }
        }

        let table = Self::build_table(&stream, &degrees);
        write_vertexmap(&vertexmap_filename(base), &table)?;

        // Pass two: rewrite each run with translated endpoints. The
        // translation breaks a run's sort order, so each run (bounded by
        // the ingest buffer) is re-sorted before it is written back.
        let tmp_path = format!("{stream_path}.old");
        std::fs::rename(stream_path, &tmp_path)?;
        let old = PreprocessStream::open(&tmp_path)?;
        let mut writer = StreamWriter::<E>::create(stream_path)?;
        for run in 0..old.num_runs() {
            let mut reader = old.run_reader::<E>(run)?;
            let mut edges = Vec::with_capacity(old.run_len(run) as usize);
            while let Some(mut edge) = reader.next_edge()? {
                edge.src = table[edge.src as usize];
                edge.dst = table[edge.dst as usize];
                edges.push(edge);
            }
            writer.write_run(&mut edges)?;
        }
        writer.finish()?;
        std::fs::remove_file(&tmp_path)?;

        info!(
            base,
            nverts,
            edges = old.num_edges(),
            "degree_order.done"
        );
        Ok(())
    }
}

/// Writes the translation table as a packed little-endian `u32` array, one
/// entry per vertex — all `nverts * 4` bytes of it.
fn write_vertexmap(path: &str, table: &[Vid]) -> Result<()> {
    let mut out = File::create(path)?;
    let mut bytes = Vec::with_capacity(table.len() * 4);
    for &new_id in table {
        bytes.extend_from_slice(&new_id.to_le_bytes());
    }
    out.write_all(&bytes)?;
    out.sync_all()?;
    Ok(())
}

/// Loads a persisted translation table.
pub fn read_vertexmap(path: &str) -> Result<Vec<Vid>> {
    let bytes = std::fs::read(path)?;
    if bytes.len() % 4 != 0 {
        return Err(MolinoError::Corruption(format!(
            "vertexmap {path} has length {} (not a multiple of 4)",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|raw| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(raw);
            Vid::from_le_bytes(buf)
        })
        .collect())
}
