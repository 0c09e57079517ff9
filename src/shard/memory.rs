//! The memory shard: the shard whose interval is the current execution
//! window, loaded in full for random access. One adjacency scan attaches
//! in-edges to every window vertex, plus out-edges for sources that fall
//! inside the window themselves; both views hand out slots into the same
//! loaded edge-data image.

use std::fs::File;
use std::marker::PhantomData;

use memmap2::Mmap;
use tracing::debug;

use crate::error::{MolinoError, Result};
use crate::io::{BlockBuf, SessionId, StripedIo};
use crate::model::{EdgeValue, GraphVertex, Vid};
use crate::shard::codec::AdjacencyScanner;
use crate::shard::{ShardInterval, adj_filename, edata_filename};

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryShardOptions {
    pub disable_writes: bool,
    pub only_adjacency: bool,
}

enum AdjImage {
    Mapped(Mmap),
    Buffered(Vec<u8>),
}

impl AdjImage {
    fn bytes(&self) -> &[u8] {
        match self {
            AdjImage::Mapped(map) => map,
            AdjImage::Buffered(buf) => buf,
        }
    }
}

pub struct MemoryShard<E: EdgeValue> {
    io: StripedIo,
    interval: ShardInterval,
    adj: AdjImage,
    edata_session: Option<SessionId>,
    edata: Option<BlockBuf>,
    edata_len: u64,
    opts: MemoryShardOptions,
    // Cursor state a sliding shard over the same files would be left with
    // after streaming every in-window source; valid after `load_vertices`.
    exit_cursor: Option<(u64, Vid, u64)>,
    _edge: PhantomData<E>,
}

impl<E: EdgeValue> MemoryShard<E> {
    /// Opens shard `shard` of `nshards` and loads its adjacency and edge
    /// data in bulk.
    pub fn open(
        io: StripedIo,
        base: &str,
        nshards: usize,
        shard: usize,
        interval: ShardInterval,
        opts: MemoryShardOptions,
    ) -> Result<Self> {
        let adj_path = adj_filename(base, nshards, shard);
        let adj_file = File::open(&adj_path)?;
        let adj_len = adj_file.metadata()?.len();
        let adj = if adj_len > 0 {
            // Safety: shard files are owned by this process for the pass;
            // the mapping is read-only and never outlives the file handle.
            match unsafe { Mmap::map(&adj_file) } {
                Ok(map) => AdjImage::Mapped(map),
                Err(_) => AdjImage::Buffered(std::fs::read(&adj_path)?),
            }
        } else {
            AdjImage::Buffered(Vec::new())
        };

        let (edata_session, edata, edata_len) = if opts.only_adjacency {
            (None, None, 0)
        } else {
            let path = edata_filename(base, nshards, shard);
            let session = io.open_session(&path, !opts.disable_writes)?;
            let len = io.file_len(session)?;
            let buf = if len > 0 {
                let buf = io.alloc(session, len as usize, 0)?;
                io.read_now(session, &buf, len as usize, 0)?;
                Some(buf)
            } else {
                None
            };
            (Some(session), buf, len)
        };

        if edata_len % E::SIZE as u64 != 0 {
            return Err(MolinoError::Corruption(format!(
                "edge-data size {} is not a multiple of the {}-byte record",
                edata_len,
                E::SIZE
            )));
        }

        debug!(
            shard,
            nshards,
            lo = interval.lo,
            hi = interval.hi,
            adj_bytes = adj_len,
            edata_bytes = edata_len,
            "memshard.open"
        );

        Ok(Self {
            io,
            interval,
            adj,
            edata_session,
            edata,
            edata_len,
            opts,
            exit_cursor: None,
            _edge: PhantomData,
        })
    }

    pub fn interval(&self) -> ShardInterval {
        self.interval
    }

    pub fn num_edges(&self) -> u64 {
        self.edata_len / E::SIZE as u64
    }

    /// Scans the adjacency once, attaching in-edges (and in-window
    /// out-edges) to the caller's vertex slots. Slot `i` must carry id
    /// `interval.lo + i`.
    pub fn load_vertices(&mut self, vertices: &mut [GraphVertex<E>]) -> Result<()> {
        if vertices.len() != self.interval.num_vertices() {
            return Err(MolinoError::InvalidArgument(format!(
                "window of {} slots for interval [{}, {}]",
                vertices.len(),
                self.interval.lo,
                self.interval.hi
            )));
        }

        let lo = self.interval.lo;
        let hi = self.interval.hi;
        let bytes = self.adj.bytes();
        let mut scanner = AdjacencyScanner::new(bytes);
        let mut edge_idx: u64 = 0;
        let mut exit_cursor = None;

        loop {
            let pos_before = scanner.position() as u64;
            let vid_before = scanner.next_source();
            let Some(rec) = scanner.next_record()? else {
                break;
            };
            if exit_cursor.is_none() && rec.src > hi {
                exit_cursor = Some((pos_before, vid_before, edge_idx * E::SIZE as u64));
            }
            let src_in_window = self.interval.contains(rec.src);
            for dst in rec.dsts() {
                if !self.interval.contains(dst) {
                    return Err(MolinoError::Corruption(format!(
                        "destination {dst} outside shard interval [{lo}, {hi}] in memory shard"
                    )));
                }
                let slot = match &self.edata {
                    Some(buf) => {
                        let pos = edge_idx as usize * E::SIZE;
                        if pos + E::SIZE > buf.len() {
                            return Err(MolinoError::Corruption(format!(
                                "adjacency names more edges than the edge-data file holds ({})",
                                self.num_edges()
                            )));
                        }
                        Some(buf.slot(pos))
                    }
                    None => None,
                };
                let dst_slot = (dst - lo) as usize;
                if vertices[dst_slot].scheduled {
                    vertices[dst_slot].add_inedge(rec.src, slot.clone());
                }
                if src_in_window {
                    let src_slot = (rec.src - lo) as usize;
                    if vertices[src_slot].scheduled {
                        vertices[src_slot].add_outedge(dst, slot.clone());
                    }
                }
                edge_idx += 1;
            }
        }

        let fallback = (
            bytes.len() as u64,
            scanner.next_source(),
            edge_idx * E::SIZE as u64,
        );
        if !self.opts.only_adjacency && edge_idx * E::SIZE as u64 != self.edata_len {
            return Err(MolinoError::Corruption(format!(
                "adjacency describes {} edges but the edge-data file holds {}",
                edge_idx,
                self.num_edges()
            )));
        }

        self.exit_cursor = Some(exit_cursor.unwrap_or(fallback));
        self.io.metrics().record_edges_streamed(edge_idx);
        Ok(())
    }

    /// Cursor a sliding shard over this shard should be repositioned to
    /// after the window: the first adjacency record past the interval.
    pub fn streaming_exit(&self) -> Result<(u64, Vid, u64)> {
        self.exit_cursor.ok_or_else(|| {
            MolinoError::InvalidArgument("streaming_exit before load_vertices".into())
        })
    }

    /// Writes the (possibly mutated) edge-data image back. Called once per
    /// window, after every sliding shard of the window has committed.
    pub fn commit(&mut self) -> Result<()> {
        let Some(buf) = self.edata.take() else {
            return Ok(());
        };
        let session = self
            .edata_session
            .ok_or_else(|| MolinoError::Corruption("edge-data session missing".into()))?;
        if self.opts.disable_writes {
            self.io.release(session, buf)?;
        } else {
            let len = buf.len();
            self.io.write_now(session, buf, len, 0)?;
        }
        Ok(())
    }
}

impl<E: EdgeValue> Drop for MemoryShard<E> {
    fn drop(&mut self) {
        if let Some(buf) = self.edata.take() {
            if let Some(session) = self.edata_session {
                let _ = self.io.release(session, buf);
            }
        }
        if let Some(session) = self.edata_session.take() {
            let _ = self.io.close_session(session);
        }
    }
}
