//! The sliding shard: a forward-only streaming cursor over one shard's
//! out-edges. Within a pass it is advanced window by window; edge-data
//! blocks it touched are committed back when the cursor moves past them.

use std::marker::PhantomData;

use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::error::{MolinoError, Result};
use crate::io::{BlockBuf, IoTicket, SessionId, StripedIo};
use crate::model::{EdgeSlot, EdgeValue, GraphVertex, VertexCapabilities, Vid};
use crate::shard::codec::{RecordHeader, decode_header};
use crate::shard::index::SparseShardIndex;
use crate::shard::{ShardInterval, adj_filename, edata_filename};

/// Minimum vertex distance between recorded checkpoints.
pub const CHECKPOINT_MIN_STRIDE: u32 = 100_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct SlidingShardOptions {
    /// Suppress all edge-data writebacks (read-only passes).
    pub disable_writes: bool,
    /// Stream topology only; no edge-data session is opened and edge
    /// handles carry no slots.
    pub only_adjacency: bool,
}

struct StreamBlock {
    buf: BlockBuf,
    offset: u64,
    end: u64,
    active: bool,
    loaded: bool,
    pending: Option<IoTicket>,
}

struct AdjBlock {
    buf: BlockBuf,
    offset: u64,
    end: u64,
}

pub struct SlidingShard<E: EdgeValue> {
    io: StripedIo,
    interval: ShardInterval,
    blocksize: usize,
    edata_session: Option<SessionId>,
    adj_session: SessionId,
    adj_filesize: u64,
    edata_filesize: u64,

    cur_vid: Vid,
    adj_off: u64,
    edata_off: u64,
    window_start_edata_off: u64,

    blocks: Vec<StreamBlock>,
    adj_block: Option<AdjBlock>,
    index: SparseShardIndex,

    caps: VertexCapabilities,
    opts: SlidingShardOptions,
    async_loading: bool,
    _edge: PhantomData<E>,
}

impl<E: EdgeValue> SlidingShard<E> {
    pub fn open(
        io: StripedIo,
        base: &str,
        nshards: usize,
        shard: usize,
        interval: ShardInterval,
        config: &EngineConfig,
        caps: VertexCapabilities,
        opts: SlidingShardOptions,
    ) -> Result<Self> {
        let adj_session = io.open_session(adj_filename(base, nshards, shard), false)?;
        let adj_filesize = io.file_len(adj_session)?;

        let (edata_session, edata_filesize) = if opts.only_adjacency {
            (None, 0)
        } else {
            let session =
                io.open_session(edata_filename(base, nshards, shard), !opts.disable_writes)?;
            let len = io.file_len(session)?;
            (Some(session), len)
        };

        debug!(
            shard,
            nshards,
            lo = interval.lo,
            hi = interval.hi,
            adj_bytes = adj_filesize,
            edata_bytes = edata_filesize,
            "sliding.open"
        );

        Ok(Self {
            io,
            interval,
            blocksize: config.blocksize_for(E::SIZE),
            edata_session,
            adj_session,
            adj_filesize,
            edata_filesize,
            cur_vid: 0,
            adj_off: 0,
            edata_off: 0,
            window_start_edata_off: 0,
            blocks: Vec::new(),
            adj_block: None,
            index: SparseShardIndex::new(),
            caps,
            opts,
            async_loading: !caps.has_computational_edges,
            _edge: PhantomData,
        })
    }

    pub fn interval(&self) -> ShardInterval {
        self.interval
    }

    pub fn num_edges(&self) -> u64 {
        self.edata_filesize / E::SIZE as u64
    }

    /// Edge-data byte range consumed by the current window so far.
    pub fn window_edata_range(&self) -> (u64, u64) {
        (self.window_start_edata_off, self.edata_off)
    }

    /// Decodes out-edges of `start .. start + vertices.len()` into the
    /// caller's vertex slots. On the index-building pass (`record_index`)
    /// checkpoints are dropped every `max(100_000, n/16)` sources; on later
    /// passes the cursor first fast-forwards via the index.
    ///
    /// Edge slots handed out under the asynchronous load policy must not
    /// be read until [`SlidingShard::complete_loads`] has returned.
    pub fn read_next_vertices(
        &mut self,
        vertices: &mut [GraphVertex<E>],
        start: Vid,
        record_index: bool,
    ) -> Result<()> {
        if !record_index {
            self.move_close_to(start);
        }
        self.release_passed_blocks()?;
        self.window_start_edata_off = self.edata_off;

        let nvecs = vertices.len();
        let window_end = start.saturating_add(nvecs as Vid);
        let stride = CHECKPOINT_MIN_STRIDE.max(nvecs as u32 / 16);
        let mut last_recorded = start;
        let mut edges = 0u64;

        while self.adj_off < self.adj_filesize && self.cur_vid < window_end {
            if record_index && self.cur_vid.saturating_sub(last_recorded) >= stride {
                self.index
                    .checkpoint(self.cur_vid, self.adj_off, self.edata_off);
                self.io.metrics().record_checkpoint();
                last_recorded = self.cur_vid;
            }

            match self.read_header()? {
                RecordHeader::Skip { count } => {
                    self.cur_vid += count;
                    continue;
                }
                RecordHeader::Edges { count } => {
                    if self.cur_vid < start {
                        self.skip_edges(count);
                    } else {
                        let slot_idx = (self.cur_vid - start) as usize;
                        let vertex = &mut vertices[slot_idx];
                        if vertex.id() != self.cur_vid {
                            return Err(MolinoError::Corruption(format!(
                                "vertex slot {} holds id {}, cursor at {}",
                                slot_idx,
                                vertex.id(),
                                self.cur_vid
                            )));
                        }
                        if vertex.scheduled {
                            self.attach_out_edges(vertex, count)?;
                            edges += count as u64;
                        } else {
                            self.skip_edges(count);
                        }
                    }
                    self.cur_vid += 1;
                }
            }
        }

        self.io.metrics().record_edges_streamed(edges);
        trace!(
            shard_lo = self.interval.lo,
            start,
            nvecs,
            edges,
            adj_off = self.adj_off,
            "sliding.window"
        );
        Ok(())
    }

    /// Waits for every in-flight block load issued by the last
    /// `read_next_vertices` call.
    pub fn complete_loads(&mut self) -> Result<()> {
        for block in &mut self.blocks {
            if let Some(ticket) = block.pending.take() {
                ticket.wait()?;
            }
        }
        Ok(())
    }

    /// Commits and releases every buffer, including the adjacency block,
    /// and drains any writeback still queued from earlier evictions.
    pub fn flush(&mut self) -> Result<()> {
        let blocks = std::mem::take(&mut self.blocks);
        for block in blocks {
            self.commit_block(block, true)?;
        }
        if let Some(adj) = self.adj_block.take() {
            self.io.release(self.adj_session, adj.buf)?;
        }
        if let Some(session) = self.edata_session {
            self.io.wait_pending(session)?;
        }
        Ok(())
    }

    /// Rewinds (or repositions) the cursor for a new pass. Outstanding
    /// blocks are committed first.
    pub fn set_offset(&mut self, adj_off: u64, vid: Vid, edata_off: u64) -> Result<()> {
        self.flush()?;
        self.adj_off = adj_off;
        self.cur_vid = vid;
        self.edata_off = edata_off;
        Ok(())
    }

    fn move_close_to(&mut self, vid: Vid) {
        if self.cur_vid >= vid {
            return;
        }
        let (ckpt_vid, entry) = self.index.floor(vid);
        if ckpt_vid > self.cur_vid {
            trace!(
                from = self.cur_vid,
                to = ckpt_vid,
                adj_off = entry.adj_off,
                "sliding.fast_forward"
            );
            self.cur_vid = ckpt_vid;
            self.adj_off = entry.adj_off;
            self.edata_off = entry.edata_off;
        }
    }

    fn read_header(&mut self) -> Result<RecordHeader> {
        // Headers are at most 5 bytes; the adjacency block loader keeps the
        // cursor inside the current block, so byte-wise reads are cheap.
        decode_header(&mut || self.read_adj_byte())
    }

    fn read_adj_byte(&mut self) -> Result<u8> {
        self.ensure_adj_block(1)?;
        let block = self
            .adj_block
            .as_ref()
            .ok_or_else(|| MolinoError::Corruption("adjacency block missing".into()))?;
        let pos = (self.adj_off - block.offset) as usize;
        let byte = block.buf.read_with(|bytes| bytes[pos]);
        self.adj_off += 1;
        Ok(byte)
    }

    fn read_adj_u32(&mut self) -> Result<u32> {
        self.ensure_adj_block(4)?;
        let block = self
            .adj_block
            .as_ref()
            .ok_or_else(|| MolinoError::Corruption("adjacency block missing".into()))?;
        let pos = (self.adj_off - block.offset) as usize;
        let value = block.buf.read_with(|bytes| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[pos..pos + 4]);
            u32::from_le_bytes(raw)
        });
        self.adj_off += 4;
        Ok(value)
    }

    fn ensure_adj_block(&mut self, need: usize) -> Result<()> {
        let covered = self
            .adj_block
            .as_ref()
            .is_some_and(|b| b.offset <= self.adj_off && self.adj_off + need as u64 <= b.end);
        if covered {
            return Ok(());
        }
        if let Some(old) = self.adj_block.take() {
            self.io.release(self.adj_session, old.buf)?;
        }
        if self.adj_off + need as u64 > self.adj_filesize {
            return Err(MolinoError::Corruption(format!(
                "adjacency file truncated at offset {} (size {})",
                self.adj_off, self.adj_filesize
            )));
        }
        let end = self.adj_filesize.min(self.adj_off + self.blocksize as u64);
        let len = (end - self.adj_off) as usize;
        let buf = self.io.alloc(self.adj_session, len, self.adj_off)?;
        self.io.read_now(self.adj_session, &buf, len, self.adj_off)?;
        self.adj_block = Some(AdjBlock {
            buf,
            offset: self.adj_off,
            end,
        });
        Ok(())
    }

    fn attach_out_edges(&mut self, vertex: &mut GraphVertex<E>, count: u32) -> Result<()> {
        for _ in 0..count {
            let dst = self.read_adj_u32()?;
            if !self.interval.contains(dst) {
                return Err(MolinoError::Corruption(format!(
                    "destination {dst} outside shard interval [{}, {}] at adjacency offset {}",
                    self.interval.lo, self.interval.hi, self.adj_off
                )));
            }
            let slot = self.next_edge_slot()?;
            vertex.add_outedge(dst, slot);
        }
        Ok(())
    }

    fn next_edge_slot(&mut self) -> Result<Option<EdgeSlot>> {
        if self.opts.only_adjacency {
            return Ok(None);
        }
        let idx = self.ensure_cur_block()?;
        let block = &mut self.blocks[idx];
        if !block.loaded {
            block.loaded = true;
            if self.caps.reads_out_edges {
                let session = self
                    .edata_session
                    .ok_or_else(|| MolinoError::Corruption("edge-data session missing".into()))?;
                let len = (block.end - block.offset) as usize;
                if self.async_loading {
                    block.pending = Some(self.io.read_async(session, &block.buf, len, block.offset)?);
                } else {
                    self.io.read_now(session, &block.buf, len, block.offset)?;
                }
            }
        }
        block.active = true;
        let pos = (self.edata_off - block.offset) as usize;
        let slot = block.buf.slot(pos);
        self.edata_off += E::SIZE as u64;
        Ok(Some(slot))
    }

    /// Allocates (or finds) the block covering the current edge-data
    /// cursor and returns its position in the active list.
    fn ensure_cur_block(&mut self) -> Result<usize> {
        let need = E::SIZE as u64;
        if let Some(idx) = self
            .blocks
            .iter()
            .position(|b| b.offset <= self.edata_off && self.edata_off + need <= b.end)
        {
            return Ok(idx);
        }
        if self.edata_off + need > self.edata_filesize {
            return Err(MolinoError::Corruption(format!(
                "edge-data file too short: need {} bytes at offset {} (size {})",
                need, self.edata_off, self.edata_filesize
            )));
        }
        let session = self
            .edata_session
            .ok_or_else(|| MolinoError::Corruption("edge-data session missing".into()))?;
        let end = self.edata_filesize.min(self.edata_off + self.blocksize as u64);
        let len = (end - self.edata_off) as usize;
        let buf = self.io.alloc(session, len, self.edata_off)?;
        self.blocks.push(StreamBlock {
            buf,
            offset: self.edata_off,
            end,
            active: false,
            loaded: false,
            pending: None,
        });
        Ok(self.blocks.len() - 1)
    }

    fn skip_edges(&mut self, count: u32) {
        self.adj_off += count as u64 * 4;
        if !self.opts.only_adjacency {
            self.edata_off += count as u64 * E::SIZE as u64;
        }
    }

    /// Releases blocks the cursor has fully passed; active ones are
    /// committed asynchronously.
    fn release_passed_blocks(&mut self) -> Result<()> {
        let mut idx = 0;
        while idx < self.blocks.len() {
            if self.blocks[idx].end <= self.edata_off {
                let block = self.blocks.swap_remove(idx);
                self.commit_block(block, false)?;
            } else {
                idx += 1;
            }
        }
        Ok(())
    }

    fn commit_block(&mut self, mut block: StreamBlock, synchronously: bool) -> Result<()> {
        let session = match self.edata_session {
            Some(session) => session,
            None => return Ok(()),
        };
        if let Some(ticket) = block.pending.take() {
            // Stripe FIFO already orders the load before a queued write,
            // but a synchronous commit path must not overtake it.
            if synchronously {
                ticket.wait()?;
            }
        }
        if block.active && !self.opts.disable_writes {
            if synchronously {
                let touched = self.edata_off.clamp(block.offset, block.end) - block.offset;
                if touched > 0 {
                    self.io
                        .write_now(session, block.buf, touched as usize, block.offset)?;
                    return Ok(());
                }
            } else {
                let len = (block.end - block.offset) as usize;
                self.io
                    .write_async(session, block.buf, len, block.offset, true)?;
                return Ok(());
            }
        }
        self.io.release(session, block.buf)
    }
}

impl<E: EdgeValue> Drop for SlidingShard<E> {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::error!(error = %err, "sliding.drop.flush_failed");
        }
        if let Some(session) = self.edata_session.take() {
            let _ = self.io.close_session(session);
        }
        let _ = self.io.close_session(self.adj_session);
    }
}
