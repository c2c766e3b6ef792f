//! The file-mapped storage engine.
//!
//! A [`FileMap`] assembles a logical file on disk from out-of-order byte
//! ranges. Page-aligned data goes straight to asynchronous writes; sub-page
//! fragments are buffered in the partial store until their page fills up
//! and can be promoted to an aligned write. A bitmap records which pages
//! are durable, and both it and an optional caller blob are persisted to
//! coalesced metadata snapshots so an interrupted transfer can resume.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};

use crate::aio::{
    self, AioState, FileHandle, Finish, FinishFn, NotifyFn, NotifyNode, OpOutput, RequestId,
    StateKind, SubKind, SubOp,
};
use crate::bitmap::PageBitmap;
use crate::error::FileMapError;
use crate::meta::{self, MainRecord, FORMAT_VERSION, LOAD_PREFIX_LEN};
use crate::partial::{Merge, PartialStore};
use crate::split::split;

/// Backing-file locations and creation parameters for a map.
#[derive(Debug, Clone)]
pub struct FileMapConfig {
    /// The raw data file; its byte layout mirrors the logical file exactly.
    pub data_path: PathBuf,
    /// The main metadata file (size, page size, completeness bitmap).
    pub meta_path: PathBuf,
    /// Optional second metadata file holding one opaque caller blob.
    pub aux_meta_path: Option<PathBuf>,
    pub page_size: u32,
    /// Truncate existing backing files when creating.
    pub truncate: bool,
}

/// How a write was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    /// Sub-operations are in flight; the finish callback will run later.
    /// The id correlates cancellation and notify subscriptions.
    Pending(RequestId),
    /// No asynchronous work was needed; the finish callback already ran.
    Finished,
}

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    opened: bool,
    close_requested: bool,
    unlink_on_close: bool,
    loading: bool,
    complete: bool,
    meta_dirty: bool,
    aux_dirty: bool,
    progress_dirty: bool,
    retry_complete: bool,
}

/// One coalescing slot per metadata file: while a snapshot write is in
/// flight only the newest pending buffer is kept, never a queue.
#[derive(Default)]
struct MetaFlight {
    main_req: Option<RequestId>,
    main_next: Option<Bytes>,
    aux_req: Option<RequestId>,
    aux_next: Option<Bytes>,
}

#[derive(Default)]
struct LoadBufs {
    prefix: Option<(BytesMut, usize)>,
    rest: Option<(BytesMut, usize)>,
    aux: Option<(BytesMut, usize)>,
}

struct Inner {
    page_size: u32,
    logical_size: u64,
    flags: Flags,
    data_file: Option<FileHandle>,
    meta_file: Option<FileHandle>,
    aux_file: Option<FileHandle>,
    data_path: PathBuf,
    meta_path: PathBuf,
    aux_path: Option<PathBuf>,
    bitmap: PageBitmap,
    partials: PartialStore,
    states: Vec<AioState>,
    /// Outstanding references: explicit locks plus one per in-flight
    /// sub-operation. Closing is deferred until this drains.
    refs: usize,
    /// Sub-requests whose state was destroyed by a failed dispatch; their
    /// completions are dropped on arrival.
    orphaned_subs: Vec<RequestId>,
    meta_flight: MetaFlight,
    aux_blob: Option<Bytes>,
    load_bufs: LoadBufs,
    progress: Option<(usize, String)>,
}

struct Shared {
    inner: Mutex<Inner>,
}

/// Callbacks to run once the engine lock is released.
enum Action {
    Complete(FinishFn, Finish),
    Notify(NotifyFn, RequestId, u64),
}

fn run_actions(actions: Vec<Action>) {
    for action in actions {
        match action {
            Action::Complete(cb, finish) => cb(finish),
            Action::Notify(cb, request, bytes) => cb(request, bytes),
        }
    }
}

async fn open_backing(path: &Path, truncate: bool) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(truncate)
        .open(path)
        .await
}

fn wrap(file: File) -> FileHandle {
    Arc::new(tokio::sync::Mutex::new(file))
}

/// Handle to a file-mapped storage object. Clones share the same map; the
/// map stays alive while any clone or any in-flight sub-operation holds it.
#[derive(Clone)]
pub struct FileMap {
    shared: Arc<Shared>,
}

impl FileMap {
    /// Opens (or creates) the backing files and returns a fresh map. An
    /// initial metadata snapshot is dispatched so the map is loadable from
    /// the moment it exists.
    pub async fn create(config: FileMapConfig) -> Result<FileMap, FileMapError> {
        if config.page_size == 0 {
            return Err(FileMapError::InvalidPageSize(0));
        }
        let meta = open_backing(&config.meta_path, config.truncate)
            .await
            .map_err(|source| FileMapError::OpenMetadata {
                path: config.meta_path.clone(),
                source,
            })?;
        let aux = match &config.aux_meta_path {
            Some(path) => Some(open_backing(path, config.truncate).await.map_err(
                |source| FileMapError::OpenAuxMetadata {
                    path: path.clone(),
                    source,
                },
            )?),
            None => None,
        };
        let data = open_backing(&config.data_path, config.truncate)
            .await
            .map_err(|source| FileMapError::OpenData {
                path: config.data_path.clone(),
                source,
            })?;

        tracing::debug!(
            "created map for {} (page size {})",
            config.data_path.display(),
            config.page_size
        );
        let map = FileMap {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::new(config, meta, aux, data, false)),
            }),
        };
        {
            let mut inner = map.shared.inner.lock();
            inner.flags.meta_dirty = true;
            inner.persist_main(&map.shared);
        }
        Ok(map)
    }

    /// Opens existing backing files and restores the map from its metadata.
    /// The returned handle is still loading: reads and writes are refused
    /// until `finish` has run. Load failures surface through the callback's
    /// error count, leaving an empty map behind.
    pub async fn load(
        config: FileMapConfig,
        finish: FinishFn,
        owner: u64,
    ) -> Result<FileMap, FileMapError> {
        if config.page_size == 0 {
            return Err(FileMapError::InvalidPageSize(0));
        }
        let meta = open_backing(&config.meta_path, false)
            .await
            .map_err(|source| FileMapError::OpenMetadata {
                path: config.meta_path.clone(),
                source,
            })?;
        let meta_len = meta
            .metadata()
            .await
            .map_err(|source| FileMapError::OpenMetadata {
                path: config.meta_path.clone(),
                source,
            })?
            .len();
        let mut aux_len = 0;
        let aux = match &config.aux_meta_path {
            Some(path) => {
                let file = open_backing(path, false).await.map_err(|source| {
                    FileMapError::OpenAuxMetadata {
                        path: path.clone(),
                        source,
                    }
                })?;
                aux_len = file
                    .metadata()
                    .await
                    .map_err(|source| FileMapError::OpenAuxMetadata {
                        path: path.clone(),
                        source,
                    })?
                    .len();
                Some(file)
            }
            None => None,
        };
        let data = open_backing(&config.data_path, false)
            .await
            .map_err(|source| FileMapError::OpenData {
                path: config.data_path.clone(),
                source,
            })?;

        tracing::debug!("loading map from {}", config.data_path.display());
        let map = FileMap {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::new(config, meta, aux, data, true)),
            }),
        };
        {
            let mut inner = map.shared.inner.lock();
            let id = RequestId::next();
            let mut st = AioState::new(id, owner, StateKind::Load, 0);
            st.finish = Some(finish);

            let mut dispatch = || -> io::Result<()> {
                let meta_file = inner.meta_file.clone();
                if let Some(file) = meta_file {
                    inner.dispatch_sub(
                        &map.shared,
                        &mut st,
                        SubKind::LoadPrefix,
                        SubOp::Read {
                            file: file.clone(),
                            offset: 0,
                            len: LOAD_PREFIX_LEN,
                            buf: None,
                        },
                    )?;
                    let rest = meta_len.saturating_sub(LOAD_PREFIX_LEN as u64) as usize;
                    if rest > 0 {
                        inner.dispatch_sub(
                            &map.shared,
                            &mut st,
                            SubKind::LoadRest,
                            SubOp::Read {
                                file,
                                offset: LOAD_PREFIX_LEN as u64,
                                len: rest,
                                buf: None,
                            },
                        )?;
                    }
                }
                if aux_len > 0 {
                    if let Some(file) = inner.aux_file.clone() {
                        inner.dispatch_sub(
                            &map.shared,
                            &mut st,
                            SubKind::LoadAux,
                            SubOp::Read {
                                file,
                                offset: 0,
                                len: aux_len as usize,
                                buf: None,
                            },
                        )?;
                    }
                }
                Ok(())
            };
            if let Err(err) = dispatch() {
                return Err(inner.abort_submit(st, err));
            }
            inner.states.push(st);
        }
        Ok(map)
    }

    /// Submits a logical write of `data` at `offset`. The aligned middle of
    /// the range is written directly; misaligned fragments are buffered and
    /// written once their pages fill. Returns [`Submit::Finished`] when no
    /// disk work was needed (the callback has already run), otherwise a
    /// request id for cancellation and notify subscriptions.
    pub fn write(
        &self,
        offset: u64,
        data: Bytes,
        finish: FinishFn,
        owner: u64,
    ) -> Result<Submit, FileMapError> {
        let mut actions = Vec::new();
        let result = {
            let mut inner = self.shared.inner.lock();
            inner.submit_write(&self.shared, offset, data, finish, owner, &mut actions)
        };
        run_actions(actions);
        result
    }

    /// Submits an asynchronous read of `len` bytes at `offset` from the
    /// data file. Bytes still sitting in a partial page are overlaid on the
    /// disk contents before the callback runs, so anything reported by
    /// [`FileMap::valid_range`] reads back correctly. A caller-supplied
    /// buffer is reused when provided.
    pub fn read(
        &self,
        offset: u64,
        len: usize,
        buf: Option<BytesMut>,
        finish: FinishFn,
        owner: u64,
    ) -> Result<RequestId, FileMapError> {
        let mut inner = self.shared.inner.lock();
        if inner.flags.loading {
            return Err(FileMapError::Loading);
        }
        if !inner.flags.opened {
            return Err(FileMapError::Closed);
        }
        let file = inner.data_file.clone().ok_or(FileMapError::Closed)?;
        let id = RequestId::next();
        let mut st = AioState::new(id, owner, StateKind::Read { offset }, len as u64);
        st.finish = Some(finish);
        if let Err(err) = inner.dispatch_sub(
            &self.shared,
            &mut st,
            SubKind::ReadData,
            SubOp::Read {
                file,
                offset,
                len,
                buf,
            },
        ) {
            return Err(inner.abort_submit(st, err));
        }
        inner.states.push(st);
        Ok(id)
    }

    /// Declares the logical file finished. Requires every page below the
    /// end to be durable; a single trailing partial page is flushed as the
    /// final under-sized write. Returns false when bytes are still missing.
    /// More than one surviving partial page is a corruption signal: the
    /// call is refused and retried automatically once in-flight writes
    /// drain.
    pub fn mark_complete(&self) -> bool {
        let mut inner = self.shared.inner.lock();
        inner.try_mark_complete(&self.shared)
    }

    pub fn is_complete(&self) -> bool {
        self.shared.inner.lock().flags.complete
    }

    pub fn is_loading(&self) -> bool {
        self.shared.inner.lock().flags.loading
    }

    /// Highest byte offset ever written plus one.
    pub fn logical_size(&self) -> u64 {
        self.shared.inner.lock().logical_size
    }

    pub fn page_size(&self) -> u32 {
        self.shared.inner.lock().page_size
    }

    /// Outstanding references: explicit locks plus in-flight sub-operations.
    pub fn in_flight(&self) -> usize {
        self.shared.inner.lock().refs
    }

    /// Longest contiguous readable byte range starting at `base`, clipped
    /// to `limit` (both inclusive). Combines durable pages with usable
    /// partial-page bytes at the edges. `None` when `base` itself is not
    /// covered.
    pub fn valid_range(&self, base: u64, limit: u64) -> Option<(u64, u64)> {
        self.shared.inner.lock().valid_range(base, limit)
    }

    /// True when every byte of `base..=limit` is readable right now.
    pub fn has_bytes(&self, base: u64, limit: u64) -> bool {
        self.shared
            .inner
            .lock()
            .valid_range(base, limit)
            .is_some_and(|(_, last)| last >= limit)
    }

    /// Cancels every live operation with the given owner, including a
    /// pending load, and individually cancels matching notify subscribers.
    /// Suppresses their callbacks only: the underlying disk operations run
    /// to completion and still release their references. Returns how many
    /// operations were cancelled.
    pub fn cancel_owner(&self, owner: u64) -> usize {
        let mut inner = self.shared.inner.lock();
        let mut count = 0;
        for st in &mut inner.states {
            if st.owner == owner && !st.cancelled {
                st.cancelled = true;
                count += 1;
            }
            for node in &mut st.notify {
                if node.owner == owner {
                    node.cancelled = true;
                }
            }
        }
        if count > 0 {
            tracing::debug!("cancelled {count} operations for owner {owner}");
        }
        count
    }

    /// Cancels a single live operation by its request id.
    pub fn cancel_request(&self, request: RequestId) -> bool {
        let mut inner = self.shared.inner.lock();
        for st in &mut inner.states {
            if st.id == request && !st.cancelled {
                st.cancelled = true;
                return true;
            }
        }
        false
    }

    /// Attaches a secondary completion callback to a live, not-yet-cancelled
    /// operation. Returns false when the operation already finished or was
    /// cancelled, in which case the caller should treat it as done.
    pub fn attach_notify(&self, request: RequestId, callback: NotifyFn, owner: u64) -> bool {
        let mut inner = self.shared.inner.lock();
        for st in &mut inner.states {
            if st.id == request && !st.cancelled {
                let bytes = st.requested;
                st.notify.push(NotifyNode {
                    owner,
                    bytes,
                    cancelled: false,
                    callback,
                });
                return true;
            }
        }
        false
    }

    /// Stores the opaque auxiliary blob and schedules its (coalesced)
    /// persistence. Requires an `aux_meta_path` in the config to survive a
    /// restart.
    pub fn set_aux_blob(&self, blob: Bytes) {
        let mut inner = self.shared.inner.lock();
        inner.aux_blob = Some(blob);
        inner.flags.aux_dirty = true;
        inner.persist_aux(&self.shared);
    }

    pub fn aux_blob(&self) -> Option<Bytes> {
        self.shared.inner.lock().aux_blob.clone()
    }

    /// Forces a metadata snapshot now (still coalesced with any in-flight
    /// snapshot write).
    pub fn flush_meta(&self) {
        let mut inner = self.shared.inner.lock();
        inner.flags.meta_dirty = true;
        inner.persist_main(&self.shared);
        if inner.aux_blob.is_some() {
            inner.flags.aux_dirty = true;
            inner.persist_aux(&self.shared);
        }
    }

    /// Pins the map open. `close` is deferred while any lock is held.
    pub fn lock(&self) {
        self.shared.inner.lock().refs += 1;
    }

    pub fn unlock(&self) {
        let mut inner = self.shared.inner.lock();
        debug_assert!(inner.refs > 0, "unlock without matching lock");
        inner.refs = inner.refs.saturating_sub(1);
        inner.drain(&self.shared);
    }

    /// Soft close: performed immediately when idle, otherwise deferred
    /// until locks, in-flight operations and metadata writes drain. Dirty
    /// metadata is persisted before the handles drop.
    pub fn close(&self) {
        let mut inner = self.shared.inner.lock();
        if !inner.flags.opened && inner.data_file.is_none() {
            return;
        }
        inner.flags.close_requested = true;
        inner.drain(&self.shared);
    }

    /// Abandons the map: cancels every live operation, then closes and
    /// unlinks all backing files once in-flight work drains.
    pub fn remove(&self) {
        let mut inner = self.shared.inner.lock();
        for st in &mut inner.states {
            st.cancelled = true;
        }
        inner.flags.unlink_on_close = true;
        inner.flags.close_requested = true;
        inner.drain(&self.shared);
    }

    /// Renders completeness as one character per column: `#` for fully
    /// durable, `.` for untouched, digits for partially complete tenths.
    /// Recomputed only when completeness changed since the last call.
    pub fn progress_string(&self, width: usize) -> String {
        self.shared.inner.lock().progress_string(width)
    }

    fn on_sub_complete(shared: &Arc<Shared>, sub: RequestId, result: io::Result<OpOutput>) {
        let mut actions = Vec::new();
        {
            let mut inner = shared.inner.lock();
            inner.refs = inner.refs.saturating_sub(1);
            if inner.meta_flight.main_req == Some(sub) {
                inner.meta_complete(shared, true, result);
            } else if inner.meta_flight.aux_req == Some(sub) {
                inner.meta_complete(shared, false, result);
            } else if let Some(pos) = inner.orphaned_subs.iter().position(|&o| o == sub) {
                inner.orphaned_subs.swap_remove(pos);
            } else {
                inner.sub_complete(shared, sub, result, &mut actions);
            }
            inner.drain(shared);
        }
        run_actions(actions);
    }
}

impl Inner {
    fn new(config: FileMapConfig, meta: File, aux: Option<File>, data: File, loading: bool) -> Self {
        Inner {
            page_size: config.page_size,
            logical_size: 0,
            flags: Flags {
                opened: true,
                loading,
                ..Flags::default()
            },
            data_file: Some(wrap(data)),
            meta_file: Some(wrap(meta)),
            aux_file: aux.map(wrap),
            data_path: config.data_path,
            meta_path: config.meta_path,
            aux_path: config.aux_meta_path,
            bitmap: PageBitmap::new(),
            partials: PartialStore::new(config.page_size),
            states: Vec::new(),
            refs: 0,
            orphaned_subs: Vec::new(),
            meta_flight: MetaFlight::default(),
            aux_blob: None,
            load_bufs: LoadBufs::default(),
            progress: None,
        }
    }

    /// Registers a new sub-operation on `st` and hands it to a spawned
    /// task. The completion closure holds the map alive until it fires.
    /// The completion cannot race the registration: it has to take the
    /// engine lock the caller is still holding.
    fn dispatch_sub(
        &mut self,
        shared: &Arc<Shared>,
        st: &mut AioState,
        kind: SubKind,
        op: SubOp,
    ) -> io::Result<()> {
        let sub_id = RequestId::next();
        let shared = shared.clone();
        aio::dispatch(op, move |result| {
            FileMap::on_sub_complete(&shared, sub_id, result);
        })?;
        st.add_sub(sub_id, kind);
        self.refs += 1;
        Ok(())
    }

    /// Tears down a logical call whose dispatch failed synchronously: the
    /// sub-operations already in flight are orphaned (their completions
    /// will be dropped) and the state is destroyed, so nothing partial
    /// survives the error.
    fn abort_submit(&mut self, st: AioState, err: io::Error) -> FileMapError {
        tracing::warn!("dispatch failed, orphaning {} sub-requests: {err}", st.subs.len());
        for slot in &st.subs {
            self.orphaned_subs.push(slot.id);
        }
        FileMapError::Dispatch(err)
    }

    fn submit_write(
        &mut self,
        shared: &Arc<Shared>,
        offset: u64,
        data: Bytes,
        finish: FinishFn,
        owner: u64,
        actions: &mut Vec<Action>,
    ) -> Result<Submit, FileMapError> {
        if self.flags.loading {
            return Err(FileMapError::Loading);
        }
        if !self.flags.opened {
            return Err(FileMapError::Closed);
        }
        let data_file = self.data_file.clone().ok_or(FileMapError::Closed)?;

        let len = data.len() as u64;
        let id = RequestId::next();
        let mut st = AioState::new(id, owner, StateKind::Write, len);
        st.finish = Some(finish);

        if len > 0 {
            let s = split(offset, len, self.page_size);

            if s.middle > 0 {
                let first = s.middle_first_page(offset, self.page_size);
                let last = s.middle_last_page(offset, self.page_size);
                // Durable pages are never rewritten.
                if !self.bitmap.range_complete(first, last) {
                    let middle =
                        data.slice(s.head as usize..(s.head as u64 + s.middle) as usize);
                    if let Err(err) = self.dispatch_sub(
                        shared,
                        &mut st,
                        SubKind::Aligned { first, last },
                        SubOp::Write {
                            file: data_file.clone(),
                            offset: offset + s.head as u64,
                            data: middle,
                        },
                    ) {
                        return Err(self.abort_submit(st, err));
                    }
                }
            }
            if s.head > 0 {
                let rel = (offset % self.page_size as u64) as u32;
                let frag = data.slice(..s.head as usize);
                if let Err(err) =
                    self.merge_fragment(shared, &mut st, &data_file, s.first_page, rel, frag)
                {
                    return Err(self.abort_submit(st, err));
                }
            }
            if s.tail > 0 {
                let frag = data.slice(data.len() - s.tail as usize..);
                if let Err(err) =
                    self.merge_fragment(shared, &mut st, &data_file, s.last_page, 0, frag)
                {
                    return Err(self.abort_submit(st, err));
                }
            }

            if offset + len > self.logical_size {
                self.logical_size = offset + len;
                self.flags.meta_dirty = true;
                self.flags.progress_dirty = true;
            }
        }

        if st.subs.is_empty() {
            if self.flags.meta_dirty {
                self.persist_main(shared);
            }
            if let Some(cb) = st.finish.take() {
                actions.push(Action::Complete(
                    cb,
                    Finish {
                        request: id,
                        size: len,
                        errors: 0,
                        data: None,
                    },
                ));
            }
            Ok(Submit::Finished)
        } else {
            self.states.push(st);
            Ok(Submit::Pending(id))
        }
    }

    fn merge_fragment(
        &mut self,
        shared: &Arc<Shared>,
        st: &mut AioState,
        file: &FileHandle,
        page: u64,
        rel: u32,
        frag: Bytes,
    ) -> io::Result<()> {
        if self.bitmap.test(page) {
            // Already durable; rewrites are a no-op.
            return Ok(());
        }
        match self.partials.merge(page, rel, &frag) {
            Merge::Buffered => {}
            Merge::Gap => {
                tracing::trace!("fragment for page {page} at +{rel} does not connect yet");
            }
            Merge::Promoted(buf) => {
                let offset = page * self.page_size as u64;
                self.dispatch_sub(
                    shared,
                    st,
                    SubKind::Promote { page },
                    SubOp::Write {
                        file: file.clone(),
                        offset,
                        data: buf,
                    },
                )?;
            }
        }
        Ok(())
    }

    fn sub_complete(
        &mut self,
        shared: &Arc<Shared>,
        sub: RequestId,
        result: io::Result<OpOutput>,
        actions: &mut Vec<Action>,
    ) {
        let idx = self
            .states
            .iter()
            .position(|s| s.contains(sub))
            .expect("completion for unregistered sub-request");

        let (error, output) = match result {
            Ok(out) => (None, Some(out)),
            Err(err) => {
                tracing::warn!("sub-request {sub} failed: {err}");
                (Some(err.raw_os_error().unwrap_or(-1)), None)
            }
        };
        let kind = self.states[idx].record(sub, error);
        if let Some(out) = output {
            self.apply_success(idx, kind, out);
        }

        if self.states[idx].is_finished() {
            let st = self.states.remove(idx);
            self.finish_state(shared, st, actions);
        }
    }

    fn apply_success(&mut self, idx: usize, kind: SubKind, out: OpOutput) {
        match kind {
            SubKind::Aligned { first, last } => {
                for page in first..=last {
                    self.bitmap.set(page);
                    // Anything still buffered for these pages is stale.
                    self.partials.take(page);
                }
                self.flags.meta_dirty = true;
                self.flags.progress_dirty = true;
            }
            SubKind::Promote { page } | SubKind::Finalize { page } => {
                self.bitmap.set(page);
                self.partials.take(page);
                self.flags.meta_dirty = true;
                self.flags.progress_dirty = true;
            }
            SubKind::ReadData => {
                if let OpOutput::Read { data, transferred } = out {
                    let st = &mut self.states[idx];
                    st.read_buf = Some(data);
                    st.transferred = transferred as u64;
                }
            }
            SubKind::LoadPrefix => {
                if let OpOutput::Read { data, transferred } = out {
                    self.load_bufs.prefix = Some((data, transferred));
                }
            }
            SubKind::LoadRest => {
                if let OpOutput::Read { data, transferred } = out {
                    self.load_bufs.rest = Some((data, transferred));
                }
            }
            SubKind::LoadAux => {
                if let OpOutput::Read { data, transferred } = out {
                    self.load_bufs.aux = Some((data, transferred));
                }
            }
        }
    }

    fn finish_state(&mut self, shared: &Arc<Shared>, mut st: AioState, actions: &mut Vec<Action>) {
        match st.kind {
            StateKind::Load => self.apply_load(&mut st),
            StateKind::Read { offset } => self.overlay_partials(offset, &mut st),
            _ => {}
        }
        if matches!(st.kind, StateKind::Finalize) && st.errors == 0 {
            self.flags.complete = true;
            self.flags.meta_dirty = true;
            self.flags.progress_dirty = true;
            tracing::debug!("map complete at {} bytes", self.logical_size);
        }
        if st.errors > 0 {
            let codes: Vec<i32> = st.subs.iter().filter_map(|s| s.error).collect();
            tracing::debug!(
                "operation {} finished with {} failed sub-requests, codes {codes:?}",
                st.id,
                st.errors
            );
        }

        let size = match st.kind {
            StateKind::Read { .. } => st.transferred,
            _ => st.requested,
        };
        let data = st.read_buf.take().map(BytesMut::freeze);
        if !st.cancelled {
            if let Some(cb) = st.finish.take() {
                actions.push(Action::Complete(
                    cb,
                    Finish {
                        request: st.id,
                        size,
                        errors: st.errors,
                        data,
                    },
                ));
            }
        }
        for node in st.notify {
            if !node.cancelled {
                actions.push(Action::Notify(node.callback, st.id, node.bytes));
            }
        }

        if self.flags.meta_dirty {
            self.persist_main(shared);
        }
        if self.flags.aux_dirty {
            self.persist_aux(shared);
        }
        if self.flags.retry_complete && self.states.is_empty() {
            self.flags.retry_complete = false;
            self.try_mark_complete(shared);
        }
    }

    fn apply_load(&mut self, st: &mut AioState) {
        self.flags.loading = false;
        let mut main = BytesMut::new();
        if let Some((buf, n)) = self.load_bufs.prefix.take() {
            main.extend_from_slice(&buf[..n]);
        }
        if let Some((buf, n)) = self.load_bufs.rest.take() {
            main.extend_from_slice(&buf[..n]);
        }
        match meta::unpack_main(main.freeze()) {
            Ok((record, bitmap)) => {
                self.page_size = record.page_size;
                self.logical_size = record.logical_size;
                self.flags.complete = record.complete;
                self.bitmap = bitmap;
                self.partials = PartialStore::new(record.page_size);
                self.flags.progress_dirty = true;
                tracing::debug!(
                    "loaded map: {} bytes, page size {}, {} durable pages",
                    self.logical_size,
                    self.page_size,
                    self.bitmap.count()
                );
            }
            Err(err) => {
                tracing::warn!("metadata unpack failed, starting empty: {err}");
                st.errors += 1;
            }
        }
        if let Some((buf, n)) = self.load_bufs.aux.take() {
            match meta::unpack_aux(Bytes::copy_from_slice(&buf[..n])) {
                Ok(blob) => self.aux_blob = Some(blob),
                Err(err) => {
                    tracing::warn!("auxiliary metadata unpack failed: {err}");
                    st.errors += 1;
                }
            }
        }
    }

    /// Copies buffered partial-page bytes over the freshly read data so the
    /// caller sees what `valid_range` promised, not stale disk contents.
    fn overlay_partials(&self, offset: u64, st: &mut AioState) {
        let Some(buf) = st.read_buf.as_mut() else {
            return;
        };
        let ps = self.page_size as u64;
        let start = offset;
        let end = offset + buf.len() as u64;
        for p in self.partials.iter() {
            let valid_start = p.page * ps + p.valid_from as u64;
            let valid_end = p.page * ps + p.valid_to as u64;
            let lo = valid_start.max(start);
            let hi = valid_end.min(end);
            if lo >= hi {
                continue;
            }
            let src = p.valid_bytes();
            let src_off = (lo - valid_start) as usize;
            let dst_off = (lo - start) as usize;
            let n = (hi - lo) as usize;
            buf[dst_off..dst_off + n].copy_from_slice(&src[src_off..src_off + n]);
            st.transferred = st.transferred.max(hi - start);
        }
    }

    fn try_mark_complete(&mut self, shared: &Arc<Shared>) -> bool {
        if self.flags.complete {
            return true;
        }
        if self.flags.loading || !self.flags.opened {
            return false;
        }
        if self.logical_size == 0 {
            self.flags.complete = true;
            self.flags.meta_dirty = true;
            self.persist_main(shared);
            return true;
        }

        let ps = self.page_size as u64;
        let last_page = (self.logical_size - 1) / ps;
        let tail_len = self.logical_size - last_page * ps;
        let aligned_eof = tail_len == ps;

        if self.partials.len() > 1 {
            tracing::error!(
                "{} partial pages remain at completion, only the final page may be partial; \
                 retrying once in-flight writes drain",
                self.partials.len()
            );
            self.flags.retry_complete = true;
            return false;
        }

        let prefix_ok = if aligned_eof {
            self.bitmap.range_complete(0, last_page)
        } else if last_page == 0 {
            true
        } else {
            self.bitmap.range_complete(0, last_page - 1)
        };
        if !prefix_ok {
            tracing::warn!("completion refused: pages missing below end of file");
            return false;
        }

        if aligned_eof {
            if !self.partials.is_empty() {
                tracing::error!(
                    "stray partial page at aligned end of file; retrying once writes drain"
                );
                self.flags.retry_complete = true;
                return false;
            }
            self.flags.complete = true;
            self.flags.meta_dirty = true;
            self.flags.progress_dirty = true;
            self.persist_main(shared);
            tracing::debug!("map complete at {} bytes", self.logical_size);
            return true;
        }

        assert!(
            !self.bitmap.test(last_page),
            "final page marked durable beyond end of file"
        );
        let tail_ok = self
            .partials
            .get(last_page)
            .is_some_and(|p| p.valid_from == 0 && p.valid_to as u64 == tail_len);
        if !tail_ok {
            if self.partials.len() == 1 && self.partials.get(last_page).is_none() {
                tracing::error!(
                    "stray partial page is not the final page; retrying once writes drain"
                );
                self.flags.retry_complete = true;
            } else {
                tracing::warn!("completion refused: trailing bytes missing");
            }
            return false;
        }

        let Some(file) = self.data_file.clone() else {
            return false;
        };
        let Some(partial) = self.partials.take(last_page) else {
            return false;
        };
        let data = Bytes::copy_from_slice(partial.valid_bytes());
        let id = RequestId::next();
        let mut st = AioState::new(id, 0, StateKind::Finalize, data.len() as u64);
        if let Err(err) = self.dispatch_sub(
            shared,
            &mut st,
            SubKind::Finalize { page: last_page },
            SubOp::Write {
                file,
                offset: last_page * ps,
                data,
            },
        ) {
            tracing::warn!("could not flush final partial page: {err}");
            return false;
        }
        self.states.push(st);
        tracing::debug!("flushing final partial page {last_page} ({tail_len} bytes)");
        true
    }

    fn valid_range(&self, base: u64, limit: u64) -> Option<(u64, u64)> {
        if self.logical_size == 0 || base >= self.logical_size {
            return None;
        }
        let limit = limit.min(self.logical_size - 1);
        if base > limit {
            return None;
        }
        if self.flags.complete {
            return Some((base, limit));
        }

        let ps = self.page_size as u64;
        let limit_page = limit / ps;

        // Walk coverage forward from `base`: durable runs advance whole
        // pages at a time, buffered partials advance to their valid end
        // and chain further only when they reach the page boundary.
        let mut cur = base;
        while cur <= limit {
            let page = cur / ps;
            let rel = cur - page * ps;
            if self.bitmap.test(page) {
                let run_end = match self.bitmap.complete_run(page, limit_page) {
                    Some((_, end)) => end,
                    None => page,
                };
                cur = (run_end + 1) * ps;
            } else if let Some(p) = self.partials.get(page) {
                if (p.valid_from as u64) <= rel && rel < p.valid_to as u64 {
                    cur = page * ps + p.valid_to as u64;
                } else {
                    break;
                }
            } else {
                break;
            }
        }

        if cur == base {
            None
        } else {
            Some((base, (cur - 1).min(limit)))
        }
    }

    fn persist_main(&mut self, shared: &Arc<Shared>) {
        self.flags.meta_dirty = false;
        if self.meta_file.is_none() {
            return;
        }
        let record = MainRecord {
            version: FORMAT_VERSION,
            logical_size: self.logical_size,
            page_size: self.page_size,
            complete: self.flags.complete,
        };
        let buf = meta::pack_main(&record, &self.bitmap);
        if self.meta_flight.main_req.is_some() {
            // Newest snapshot wins; whatever was stashed is obsolete.
            self.meta_flight.main_next = Some(buf);
        } else {
            self.dispatch_meta(shared, true, buf);
        }
    }

    fn persist_aux(&mut self, shared: &Arc<Shared>) {
        self.flags.aux_dirty = false;
        if self.aux_file.is_none() {
            return;
        }
        let Some(blob) = self.aux_blob.clone() else {
            return;
        };
        let buf = meta::pack_aux(blob);
        if self.meta_flight.aux_req.is_some() {
            self.meta_flight.aux_next = Some(buf);
        } else {
            self.dispatch_meta(shared, false, buf);
        }
    }

    fn dispatch_meta(&mut self, shared: &Arc<Shared>, main: bool, buf: Bytes) {
        let file = if main {
            self.meta_file.clone()
        } else {
            self.aux_file.clone()
        };
        let Some(file) = file else {
            return;
        };
        let id = RequestId::next();
        let shared = shared.clone();
        match aio::dispatch(SubOp::Snapshot { file, data: buf }, move |result| {
            FileMap::on_sub_complete(&shared, id, result);
        }) {
            Ok(()) => {
                if main {
                    self.meta_flight.main_req = Some(id);
                } else {
                    self.meta_flight.aux_req = Some(id);
                }
                self.refs += 1;
            }
            Err(err) => tracing::warn!("metadata snapshot dispatch failed: {err}"),
        }
    }

    fn meta_complete(&mut self, shared: &Arc<Shared>, main: bool, result: io::Result<OpOutput>) {
        if let Err(err) = result {
            tracing::warn!("metadata snapshot write failed: {err}");
        }
        let next = if main {
            self.meta_flight.main_req = None;
            self.meta_flight.main_next.take()
        } else {
            self.meta_flight.aux_req = None;
            self.meta_flight.aux_next.take()
        };
        if let Some(buf) = next {
            self.dispatch_meta(shared, main, buf);
        }
    }

    /// Re-attempts a deferred close once references and metadata writes
    /// drain. Dirty metadata is snapshotted first, pushing the close behind
    /// that final write.
    fn drain(&mut self, shared: &Arc<Shared>) {
        if !self.flags.close_requested {
            return;
        }
        if self.refs > 0 || !self.states.is_empty() {
            return;
        }
        if self.meta_flight.main_req.is_some() || self.meta_flight.aux_req.is_some() {
            return;
        }
        if self.flags.meta_dirty || self.flags.aux_dirty {
            if self.flags.meta_dirty {
                self.persist_main(shared);
            }
            if self.flags.aux_dirty {
                self.persist_aux(shared);
            }
            return;
        }
        self.do_close();
    }

    fn do_close(&mut self) {
        self.flags.opened = false;
        self.flags.close_requested = false;
        self.data_file = None;
        self.meta_file = None;
        self.aux_file = None;
        if self.flags.unlink_on_close {
            aio::unlink(self.data_path.clone());
            aio::unlink(self.meta_path.clone());
            if let Some(path) = &self.aux_path {
                aio::unlink(path.clone());
            }
            tracing::debug!("removed backing files for {}", self.data_path.display());
        } else {
            tracing::debug!("closed map for {}", self.data_path.display());
        }
    }

    fn progress_string(&mut self, width: usize) -> String {
        if width == 0 {
            return String::new();
        }
        if !self.flags.progress_dirty {
            if let Some((cached_width, text)) = &self.progress {
                if *cached_width == width {
                    return text.clone();
                }
            }
        }

        let ps = self.page_size as u64;
        let pages = self.logical_size.div_ceil(ps);
        let text = if pages == 0 {
            ".".repeat(width)
        } else {
            let mut out = String::with_capacity(width);
            for col in 0..width as u64 {
                let lo = col * pages / width as u64;
                let hi = (((col + 1) * pages) / width as u64).max(lo + 1).min(pages);
                let total = hi - lo;
                let done = if self.flags.complete {
                    total
                } else {
                    self.bitmap.count_range(lo, hi - 1) as u64
                };
                let ch = if done == total {
                    '#'
                } else if done == 0 {
                    '.'
                } else {
                    (b'0' + ((done * 10) / total).clamp(1, 9) as u8) as char
                };
                out.push(ch);
            }
            out
        };
        self.progress = Some((width, text.clone()));
        self.flags.progress_dirty = false;
        text
    }
}
