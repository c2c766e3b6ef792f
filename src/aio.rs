//! Asynchronous sub-operation dispatch and fan-out tracking.
//!
//! A logical operation (write, read, load) fans out into one or more disk
//! sub-operations. Each sub-operation runs on its own spawned task over a
//! shared file handle and reports back through a completion closure; the
//! per-operation [`AioState`] record tallies the completions and decides
//! when the logical operation is done. Completions may arrive in any order.

use std::fmt;
use std::io;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// File handles are shared with in-flight sub-operation tasks, which seek
/// and transfer under the async lock the way a single event loop would.
pub(crate) type FileHandle = Arc<tokio::sync::Mutex<File>>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Correlation id for a logical operation or one of its sub-operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) fn next() -> Self {
        RequestId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Data handed to a finish callback when its logical operation completes.
pub struct Finish {
    /// Id of the logical operation, as returned at submission.
    pub request: RequestId,
    /// Bytes transferred (for reads, after overlaying buffered fragments).
    pub size: u64,
    /// Number of sub-operations that failed; `0` means full success.
    pub errors: u32,
    /// The read data, present for read operations only.
    pub data: Option<Bytes>,
}

/// Primary completion callback of a logical operation.
pub type FinishFn = Box<dyn FnOnce(Finish) + Send + 'static>;

/// Secondary subscriber callback, attached after submission. Receives the
/// request id and the operation's requested byte count.
pub type NotifyFn = Box<dyn FnOnce(RequestId, u64) + Send + 'static>;

/// A disk sub-operation.
pub(crate) enum SubOp {
    /// Positioned write of `data` at `offset`.
    Write {
        file: FileHandle,
        offset: u64,
        data: Bytes,
    },
    /// Whole-file snapshot: rewrite from the start, truncate to the new
    /// length, then flush. Used for the metadata files.
    Snapshot { file: FileHandle, data: Bytes },
    /// Positioned read of `len` bytes at `offset`. A caller-supplied buffer
    /// is grown to `len` if needed; reads past end-of-file come back short.
    Read {
        file: FileHandle,
        offset: u64,
        len: usize,
        buf: Option<BytesMut>,
    },
}

/// Successful result of a sub-operation.
pub(crate) enum OpOutput {
    Wrote,
    Read { data: BytesMut, transferred: usize },
}

async fn run_op(op: SubOp) -> io::Result<OpOutput> {
    match op {
        SubOp::Write { file, offset, data } => {
            let mut f = file.lock().await;
            f.seek(SeekFrom::Start(offset)).await?;
            f.write_all(&data).await?;
            Ok(OpOutput::Wrote)
        }
        SubOp::Snapshot { file, data } => {
            let mut f = file.lock().await;
            f.seek(SeekFrom::Start(0)).await?;
            f.write_all(&data).await?;
            f.set_len(data.len() as u64).await?;
            f.sync_data().await?;
            Ok(OpOutput::Wrote)
        }
        SubOp::Read {
            file,
            offset,
            len,
            buf,
        } => {
            let mut f = file.lock().await;
            f.seek(SeekFrom::Start(offset)).await?;
            let mut buf = buf.unwrap_or_else(|| BytesMut::zeroed(len));
            if buf.len() < len {
                buf.resize(len, 0);
            }
            let mut filled = 0;
            while filled < len {
                let n = f.read(&mut buf[filled..len]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            // Reads past end-of-file come back short; the rest of the
            // buffer must not leak stale caller contents.
            buf[filled..len].fill(0);
            buf.truncate(len);
            Ok(OpOutput::Read {
                data: buf,
                transferred: filled,
            })
        }
    }
}

/// Runs `op` on a spawned task and hands the result to `done`. The closure
/// keeps whatever it captures alive for the duration of the transfer, which
/// is how in-flight operations pin their owning map. Fails synchronously
/// when no runtime is available to carry the operation; nothing is spawned
/// in that case.
pub(crate) fn dispatch<F>(op: SubOp, done: F) -> io::Result<()>
where
    F: FnOnce(io::Result<OpOutput>) + Send + 'static,
{
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    runtime.spawn(async move {
        done(run_op(op).await);
    });
    Ok(())
}

/// Removes a backing file, logging on failure. Fired when an abandoned map
/// is torn down.
pub(crate) fn unlink(path: PathBuf) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!("no runtime available to unlink {}", path.display());
        return;
    };
    runtime.spawn(async move {
        if let Err(err) = tokio::fs::remove_file(&path).await {
            tracing::warn!("failed to unlink {}: {err}", path.display());
        }
    });
}

/// What to do with a sub-operation's result when it completes.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SubKind {
    /// Aligned data write covering whole pages `first..=last`.
    Aligned { first: u64, last: u64 },
    /// Promotion write of a fully buffered page.
    Promote { page: u64 },
    /// Final under-sized write of the trailing page at end-of-file.
    Finalize { page: u64 },
    /// Data read for a caller.
    ReadData,
    /// Fixed-prefix read of the main metadata file.
    LoadPrefix,
    /// Remainder read of the main metadata file.
    LoadRest,
    /// Whole read of the auxiliary metadata file.
    LoadAux,
}

pub(crate) struct SubSlot {
    pub id: RequestId,
    pub kind: SubKind,
    pub done: bool,
    pub error: Option<i32>,
}

/// What the logical operation as a whole is.
#[derive(Debug, Clone, Copy)]
pub(crate) enum StateKind {
    Write,
    Read { offset: u64 },
    Load,
    Finalize,
}

pub(crate) struct NotifyNode {
    pub owner: u64,
    pub bytes: u64,
    pub cancelled: bool,
    pub callback: NotifyFn,
}

/// The fan-out factor is small and bounded: a write dispatches at most an
/// aligned middle plus two promotion writes, a load at most three reads.
pub(crate) const MAX_SUBS: usize = 4;

/// Per-logical-operation tracking record.
///
/// Holds a small slot array of outstanding sub-operations searched linearly
/// on completion. Eligible for finish-and-destroy exactly when every slot
/// has completed.
pub(crate) struct AioState {
    pub id: RequestId,
    pub owner: u64,
    pub kind: StateKind,
    pub requested: u64,
    pub subs: Vec<SubSlot>,
    pub finished: usize,
    pub errors: u32,
    pub cancelled: bool,
    pub finish: Option<FinishFn>,
    pub read_buf: Option<BytesMut>,
    pub transferred: u64,
    pub notify: Vec<NotifyNode>,
}

impl AioState {
    pub fn new(id: RequestId, owner: u64, kind: StateKind, requested: u64) -> Self {
        Self {
            id,
            owner,
            kind,
            requested,
            subs: Vec::with_capacity(MAX_SUBS),
            finished: 0,
            errors: 0,
            cancelled: false,
            finish: None,
            read_buf: None,
            transferred: 0,
            notify: Vec::new(),
        }
    }

    pub fn add_sub(&mut self, id: RequestId, kind: SubKind) {
        debug_assert!(self.subs.len() < MAX_SUBS);
        self.subs.push(SubSlot {
            id,
            kind,
            done: false,
            error: None,
        });
    }

    pub fn contains(&self, sub: RequestId) -> bool {
        self.subs.iter().any(|s| s.id == sub)
    }

    /// Marks the slot for `sub` as complete and returns its kind. Panics if
    /// the slot already completed: a duplicate completion means the request
    /// accounting is corrupt and continuing would corrupt the file.
    pub fn record(&mut self, sub: RequestId, error: Option<i32>) -> SubKind {
        let slot = self
            .subs
            .iter_mut()
            .find(|s| s.id == sub)
            .expect("sub-request not registered on this state");
        assert!(!slot.done, "duplicate completion for sub-request {sub}");
        slot.done = true;
        slot.error = error;
        self.finished += 1;
        if error.is_some() {
            self.errors += 1;
        }
        slot.kind
    }

    pub fn is_finished(&self) -> bool {
        self.finished == self.subs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        let a = RequestId::next();
        let b = RequestId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_state_fan_in() {
        let id = RequestId::next();
        let mut state = AioState::new(id, 7, StateKind::Write, 100);
        let s1 = RequestId::next();
        let s2 = RequestId::next();
        state.add_sub(s1, SubKind::Promote { page: 0 });
        state.add_sub(s2, SubKind::Aligned { first: 1, last: 2 });
        assert!(!state.is_finished());

        state.record(s2, None);
        assert!(!state.is_finished());
        state.record(s1, Some(5));
        assert!(state.is_finished());
        assert_eq!(state.errors, 1);
    }

    #[test]
    #[should_panic(expected = "duplicate completion")]
    fn test_duplicate_completion_panics() {
        let mut state = AioState::new(RequestId::next(), 0, StateKind::Write, 0);
        let s = RequestId::next();
        state.add_sub(s, SubKind::ReadData);
        state.record(s, None);
        state.record(s, None);
    }
}
