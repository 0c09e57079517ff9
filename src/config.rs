/// Tunables for the storage engine and the preprocessor. Every component
/// takes the pieces it needs by value; there is no global configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of one streamed edge-data block in bytes. Rounded up per shard
    /// so that it is a multiple of the edge record size.
    pub blocksize: usize,
    /// Number of striped I/O worker threads.
    pub io_stripes: usize,
    /// Edges buffered in memory before the sharder spills a sorted run.
    pub ingest_buffer_edges: usize,
    /// Target edge-data file size per shard when `nshards=auto`.
    pub auto_shard_target_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            blocksize: 4 * 1024 * 1024,
            io_stripes: 4,
            ingest_buffer_edges: 4 * 1024 * 1024,
            auto_shard_target_bytes: 256 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Small buffers and runs; exercises spills and block rotation on tiny
    /// inputs. Intended for tests.
    pub fn compact() -> Self {
        Self {
            blocksize: 4096,
            io_stripes: 2,
            ingest_buffer_edges: 1024,
            auto_shard_target_bytes: 1024 * 1024,
        }
    }

    /// Larger streaming blocks for bulk preprocessing on fast disks.
    pub fn bulk() -> Self {
        Self {
            blocksize: 32 * 1024 * 1024,
            io_stripes: 8,
            ingest_buffer_edges: 16 * 1024 * 1024,
            auto_shard_target_bytes: 256 * 1024 * 1024,
        }
    }

    /// Block size padded up to a multiple of the edge record size, so a
    /// block never splits a record.
    pub fn blocksize_for(&self, record_size: usize) -> usize {
        let bs = self.blocksize.max(record_size);
        bs.div_ceil(record_size) * record_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocksize_is_padded_to_record_multiple() {
        let config = EngineConfig {
            blocksize: 1000,
            ..EngineConfig::default()
        };
        assert_eq!(config.blocksize_for(12), 1008);
        assert_eq!(config.blocksize_for(4), 1000);
        // A record larger than the block forces one record per block.
        assert_eq!(config.blocksize_for(2048), 2048);
    }
}
