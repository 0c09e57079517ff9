use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters threaded through the I/O manager, the shards, and the
/// preprocessor. Shared by `Arc`; all updates are relaxed.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    block_reads: AtomicU64,
    block_writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    buffers_handed_out: AtomicU64,
    buffers_recycled: AtomicU64,
    edges_streamed: AtomicU64,
    checkpoints_recorded: AtomicU64,
    runs_spilled: AtomicU64,
    windows_executed: AtomicU64,
    parse_errors: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MetricsSnapshot {
    pub block_reads: u64,
    pub block_writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub buffers_handed_out: u64,
    pub buffers_recycled: u64,
    pub edges_streamed: u64,
    pub checkpoints_recorded: u64,
    pub runs_spilled: u64,
    pub windows_executed: u64,
    pub parse_errors: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_block_read(&self, bytes: u64) {
        self.block_reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_block_write(&self, bytes: u64) {
        self.block_writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_buffer_handed_out(&self) {
        self.buffers_handed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffer_recycled(&self) {
        self.buffers_recycled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_edges_streamed(&self, n: u64) {
        self.edges_streamed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_checkpoint(&self) {
        self.checkpoints_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_spilled(&self) {
        self.runs_spilled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_window(&self) {
        self.windows_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn block_reads(&self) -> u64 {
        self.block_reads.load(Ordering::Relaxed)
    }

    pub fn block_writes(&self) -> u64 {
        self.block_writes.load(Ordering::Relaxed)
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            block_reads: self.block_reads.load(Ordering::Relaxed),
            block_writes: self.block_writes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            buffers_handed_out: self.buffers_handed_out.load(Ordering::Relaxed),
            buffers_recycled: self.buffers_recycled.load(Ordering::Relaxed),
            edges_streamed: self.edges_streamed.load(Ordering::Relaxed),
            checkpoints_recorded: self.checkpoints_recorded.load(Ordering::Relaxed),
            runs_spilled: self.runs_spilled.load(Ordering::Relaxed),
            windows_executed: self.windows_executed.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = EngineMetrics::new();
        metrics.record_block_read(4096);
        metrics.record_block_read(4096);
        metrics.record_block_write(512);
        metrics.record_checkpoint();

        let snap = metrics.snapshot();
        assert_eq!(snap.block_reads, 2);
        assert_eq!(snap.bytes_read, 8192);
        assert_eq!(snap.block_writes, 1);
        assert_eq!(snap.checkpoints_recorded, 1);
        assert!(snap.to_json().unwrap().contains("\"block_reads\": 2"));
    }
}
