//! Striped I/O manager.
//!
//! Every shard file is owned by one *session*. A session is pinned to one
//! of a fixed set of worker stripes; all asynchronous operations of a
//! session execute on its stripe in submission order, which is what makes
//! reads observe completed writes to the same byte range of the same
//! session. Synchronous operations drain the session's queue first, so the
//! only suspension points are `read_now`, `write_now` and the explicit
//! waits.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, trace};

use crate::error::{MolinoError, Result};
use crate::metrics::EngineMetrics;
use crate::model::{EdgeSlot, SharedBytes};

/// Opaque handle to an open file session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(usize);

/// A pooled buffer covering one contiguous byte range of a file.
///
/// The pool owns the storage; holders go through the shared handle for
/// every access and give the buffer back with [`StripedIo::release`] (or
/// let a releasing write do it).
#[derive(Clone)]
pub struct BlockBuf {
    bytes: SharedBytes,
    logical_offset: u64,
    len: usize,
}

impl BlockBuf {
    pub fn logical_offset(&self) -> u64 {
        self.logical_offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &SharedBytes {
        &self.bytes
    }

    /// Edge-value handle at a byte position inside this buffer.
    pub fn slot(&self, pos: usize) -> EdgeSlot {
        EdgeSlot::new(Arc::clone(&self.bytes), pos)
    }

    pub fn read_with<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        f(&self.bytes.read()[..self.len])
    }

    pub fn write_with<T>(&self, f: impl FnOnce(&mut [u8]) -> T) -> T {
        f(&mut self.bytes.write()[..self.len])
    }
}

enum IoKind {
    Read,
    Write { release: bool },
}

struct IoRequest {
    kind: IoKind,
    file: Arc<File>,
    bytes: SharedBytes,
    len: usize,
    offset: u64,
    session: SessionId,
    done: Mutex<Option<std::result::Result<(), String>>>,
    cv: Condvar,
    pending: Arc<PendingOps>,
}

impl IoRequest {
    fn finish(&self, result: std::result::Result<(), String>) {
        {
            let mut done = self.done.lock();
            *done = Some(result);
        }
        self.cv.notify_all();
        self.pending.decrement();
    }
}

/// Completion handle for an asynchronous operation.
pub struct IoTicket {
    req: Arc<IoRequest>,
}

impl IoTicket {
    /// Blocks until the operation completes.
    pub fn wait(self) -> Result<()> {
        let mut done = self.req.done.lock();
        while done.is_none() {
            self.req.cv.wait(&mut done);
        }
        match done.take() {
            Some(Ok(())) => Ok(()),
            Some(Err(msg)) => Err(MolinoError::Io(io::Error::new(ErrorKind::Other, msg))),
            None => unreachable!("ticket woken without result"),
        }
    }
}

struct PendingOps {
    count: Mutex<usize>,
    cv: Condvar,
}

impl PendingOps {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
        })
    }

    fn increment(&self) {
        *self.count.lock() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.cv.notify_all();
        }
    }

    fn wait_empty(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cv.wait(&mut count);
        }
    }
}

struct SessionState {
    file: Arc<File>,
    path: PathBuf,
    writable: bool,
    stripe: usize,
    pool: Vec<SharedBytes>,
    pending: Arc<PendingOps>,
}

struct StripeState {
    queue: VecDeque<Arc<IoRequest>>,
    worker_running: bool,
}

struct Stripe {
    state: Mutex<StripeState>,
}

struct IoShared {
    stripes: Vec<Stripe>,
    sessions: Mutex<Vec<Option<SessionState>>>,
    metrics: Arc<EngineMetrics>,
}

/// The I/O manager. Cheap to clone via internal `Arc`; one instance serves
/// every shard of an engine.
#[derive(Clone)]
pub struct StripedIo {
    shared: Arc<IoShared>,
}

impl StripedIo {
    pub fn new(nstripes: usize, metrics: Arc<EngineMetrics>) -> Self {
        let nstripes = nstripes.max(1);
        let stripes = (0..nstripes)
            .map(|_| Stripe {
                state: Mutex::new(StripeState {
                    queue: VecDeque::new(),
                    worker_running: false,
                }),
            })
            .collect();
        Self {
            shared: Arc::new(IoShared {
                stripes,
                sessions: Mutex::new(Vec::new()),
                metrics,
            }),
        }
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.shared.metrics
    }

    pub fn open_session(&self, path: impl AsRef<Path>, writable: bool) -> Result<SessionId> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .truncate(false)
            .open(path)?;

        let mut sessions = self.shared.sessions.lock();
        let slot = sessions.iter().position(Option::is_none).unwrap_or_else(|| {
            sessions.push(None);
            sessions.len() - 1
        });
        let stripe = slot % self.shared.stripes.len();
        sessions[slot] = Some(SessionState {
            file: Arc::new(file),
            path: path.to_path_buf(),
            writable,
            stripe,
            pool: Vec::new(),
            pending: PendingOps::new(),
        });
        debug!(
            session = slot,
            stripe,
            writable,
            path = %path.display(),
            "io.session.open"
        );
        Ok(SessionId(slot))
    }

    /// Drains outstanding operations and drops the session. Buffers still
    /// held by callers stay valid until their last handle drops, but can
    /// no longer be used for I/O.
    pub fn close_session(&self, session: SessionId) -> Result<()> {
        self.wait_pending(session)?;
        let mut sessions = self.shared.sessions.lock();
        let state = sessions
            .get_mut(session.0)
            .and_then(Option::take)
            .ok_or_else(|| MolinoError::InvalidArgument(format!("unknown session {}", session.0)))?;
        debug!(session = session.0, path = %state.path.display(), "io.session.close");
        Ok(())
    }

    pub fn file_len(&self, session: SessionId) -> Result<u64> {
        let file = self.session_file(session)?;
        Ok(file.metadata()?.len())
    }

    /// Hands out a buffer of exactly `len` bytes, recycling a pooled
    /// allocation when one of the right size is free.
    pub fn alloc(&self, session: SessionId, len: usize, logical_offset: u64) -> Result<BlockBuf> {
        let mut sessions = self.shared.sessions.lock();
        let state = session_mut(&mut sessions, session)?;
        let recycled = state
            .pool
            .iter()
            .position(|bytes| bytes.read().len() == len)
            .map(|idx| state.pool.swap_remove(idx));
        drop(sessions);

        let bytes = match recycled {
            Some(bytes) => {
                self.shared.metrics.record_buffer_recycled();
                bytes
            }
            None => Arc::new(RwLock::new(vec![0u8; len].into_boxed_slice())),
        };
        self.shared.metrics.record_buffer_handed_out();
        Ok(BlockBuf {
            bytes,
            logical_offset,
            len,
        })
    }

    /// Returns a buffer to the session pool. A buffer that still has other
    /// live handles is dropped instead of pooled.
    pub fn release(&self, session: SessionId, buf: BlockBuf) -> Result<()> {
        let mut sessions = self.shared.sessions.lock();
        let state = session_mut(&mut sessions, session)?;
        let BlockBuf { bytes, .. } = buf;
        if Arc::strong_count(&bytes) == 1 {
            state.pool.push(bytes);
        }
        Ok(())
    }

    /// Synchronous positional read into `buf`. Drains the session queue
    /// first so the read observes every completed asynchronous write.
    pub fn read_now(
        &self,
        session: SessionId,
        buf: &BlockBuf,
        len: usize,
        offset: u64,
    ) -> Result<()> {
        self.wait_pending(session)?;
        let file = self.session_file(session)?;
        {
            let mut guard = buf.bytes.write();
            read_exact_at(&file, offset, &mut guard[..len])?;
        }
        self.shared.metrics.record_block_read(len as u64);
        Ok(())
    }

    pub fn read_async(
        &self,
        session: SessionId,
        buf: &BlockBuf,
        len: usize,
        offset: u64,
    ) -> Result<IoTicket> {
        self.enqueue(session, IoKind::Read, Arc::clone(&buf.bytes), len, offset)
    }

    /// Synchronous positional write; consumes and releases the buffer.
    pub fn write_now(
        &self,
        session: SessionId,
        buf: BlockBuf,
        len: usize,
        offset: u64,
    ) -> Result<()> {
        self.wait_pending(session)?;
        let file = self.session_file(session)?;
        {
            let guard = buf.bytes.read();
            write_all_at(&file, offset, &guard[..len])?;
        }
        self.shared.metrics.record_block_write(len as u64);
        self.release(session, buf)
    }

    /// Asynchronous positional write. With `release_after` the buffer goes
    /// back to the pool once the write completes.
    pub fn write_async(
        &self,
        session: SessionId,
        buf: BlockBuf,
        len: usize,
        offset: u64,
        release_after: bool,
    ) -> Result<IoTicket> {
        let ticket = self.enqueue(
            session,
            IoKind::Write {
                release: release_after,
            },
            Arc::clone(&buf.bytes),
            len,
            offset,
        )?;
        // The queued request holds its own handle; dropping this one lets
        // the post-write release actually pool the storage.
        drop(buf);
        Ok(ticket)
    }

    /// Blocks until every queued operation of the session has completed.
    pub fn wait_pending(&self, session: SessionId) -> Result<()> {
        let pending = {
            let sessions = self.shared.sessions.lock();
            Arc::clone(&session_ref(&sessions, session)?.pending)
        };
        pending.wait_empty();
        Ok(())
    }

    fn session_file(&self, session: SessionId) -> Result<Arc<File>> {
        let sessions = self.shared.sessions.lock();
        Ok(Arc::clone(&session_ref(&sessions, session)?.file))
    }

    fn enqueue(
        &self,
        session: SessionId,
        kind: IoKind,
        bytes: SharedBytes,
        len: usize,
        offset: u64,
    ) -> Result<IoTicket> {
        let (file, stripe, pending) = {
            let sessions = self.shared.sessions.lock();
            let state = session_ref(&sessions, session)?;
            if matches!(kind, IoKind::Write { .. }) && !state.writable {
                return Err(MolinoError::InvalidArgument(format!(
                    "session {} opened read-only",
                    session.0
                )));
            }
            (
                Arc::clone(&state.file),
                state.stripe,
                Arc::clone(&state.pending),
            )
        };

        let req = Arc::new(IoRequest {
            kind,
            file,
            bytes,
            len,
            offset,
            session,
            done: Mutex::new(None),
            cv: Condvar::new(),
            pending,
        });
        req.pending.increment();

        let stripe_state = &self.shared.stripes[stripe];
        let spawn_worker = {
            let mut state = stripe_state.state.lock();
            state.queue.push_back(Arc::clone(&req));
            if state.worker_running {
                false
            } else {
                state.worker_running = true;
                true
            }
        };
        if spawn_worker {
            let shared = Arc::clone(&self.shared);
            thread::spawn(move || worker_loop(shared, stripe));
        }
        trace!(session = session.0, stripe, offset, len, "io.enqueue");
        Ok(IoTicket { req })
    }
}

fn session_ref(sessions: &[Option<SessionState>], session: SessionId) -> Result<&SessionState> {
    sessions
        .get(session.0)
        .and_then(Option::as_ref)
        .ok_or_else(|| MolinoError::InvalidArgument(format!("unknown session {}", session.0)))
}

fn session_mut(
    sessions: &mut [Option<SessionState>],
    session: SessionId,
) -> Result<&mut SessionState> {
    sessions
        .get_mut(session.0)
        .and_then(Option::as_mut)
        .ok_or_else(|| MolinoError::InvalidArgument(format!("unknown session {}", session.0)))
}

fn worker_loop(shared: Arc<IoShared>, stripe: usize) {
    loop {
        let req = {
            let mut state = shared.stripes[stripe].state.lock();
            match state.queue.pop_front() {
                Some(req) => req,
                None => {
                    state.worker_running = false;
                    break;
                }
            }
        };
        let result = execute(&shared, &req);
        req.finish(result.map_err(|e| e.to_string()));
    }
}

fn execute(shared: &IoShared, req: &IoRequest) -> Result<()> {
    match req.kind {
        IoKind::Read => {
            let mut guard = req.bytes.write();
            read_exact_at(&req.file, req.offset, &mut guard[..req.len])?;
            drop(guard);
            shared.metrics.record_block_read(req.len as u64);
        }
        IoKind::Write { release } => {
            {
                let guard = req.bytes.read();
                write_all_at(&req.file, req.offset, &guard[..req.len])?;
            }
            shared.metrics.record_block_write(req.len as u64);
            if release {
                let mut sessions = shared.sessions.lock();
                if let Some(state) = sessions.get_mut(req.session.0).and_then(Option::as_mut) {
                    // A releasing caller dropped its handle at enqueue time,
                    // so the request's own clone is the sole survivor. Pool
                    // only then; a live slot handle keeps the buffer out.
                    if Arc::strong_count(&req.bytes) == 1 {
                        state.pool.push(Arc::clone(&req.bytes));
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn read_exact_at(file: &File, mut offset: u64, mut dst: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    while !dst.is_empty() {
        let read = file.read_at(dst, offset)?;
        if read == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "read_at reached EOF",
            ));
        }
        let (_, tail) = dst.split_at_mut(read);
        dst = tail;
        offset += read as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at(file: &File, mut offset: u64, mut src: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    while !src.is_empty() {
        let written = file.write_at(src, offset)?;
        if written == 0 {
            return Err(io::Error::new(
                ErrorKind::WriteZero,
                "write_at wrote zero bytes",
            ));
        }
        src = &src[written..];
        offset += written as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut offset: u64, mut dst: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !dst.is_empty() {
        let read = file.seek_read(dst, offset)?;
        if read == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "seek_read reached EOF",
            ));
        }
        let (_, tail) = dst.split_at_mut(read);
        dst = tail;
        offset += read as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut offset: u64, mut src: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !src.is_empty() {
        let written = file.seek_write(src, offset)?;
        if written == 0 {
            return Err(io::Error::new(
                ErrorKind::WriteZero,
                "seek_write wrote zero bytes",
            ));
        }
        src = &src[written..];
        offset += written as u64;
    }
    Ok(())
}
