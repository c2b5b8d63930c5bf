use crate::config::DispatcherConfig;
use crate::error::{Result, TideError};
use crate::event::{EventId, EventKind, EventQuery, EventQueue, EventSnapshot, PolledEvent, WaitMode};
use crate::handle::{Cookie, HandleTable, Resource};
use crate::io::{BlobIoDesc, Extent, Hyperslab};
use crate::kv::KvGetOutcome;
use crate::migrate::{FsCentralStore, MigrationEngine};
use crate::store::{ArrayStruct, Container, Object, ObjectEntry};
use crate::txn::{AbortFlag, ContainerTids, FinishOutcome, TransMode, TransStatus};
use crate::types::{
    Checksum, ContainerMode, HintList, Layout, MemDesc, ObjectFilter, ObjectId, ObjectKind,
    TransId, SCRATCH_LEN,
};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// The facade every client goes through. Owns the handle table, the open
/// containers, the central tier, and the event queues; all public operations
/// take cookie handles and validate them here.
pub struct Dispatcher {
    handles: HandleTable,
    containers: Mutex<BTreeMap<String, Arc<Container>>>,
    engine: Arc<MigrationEngine>,
}

struct ObjBinding {
    object: Arc<Object>,
    container: Arc<Container>,
    mode: ContainerMode,
    writable: bool,
}

impl Dispatcher {
    pub fn new(config: &DispatcherConfig) -> Result<Arc<Self>> {
        let central = Arc::new(FsCentralStore::with_catalog(
            config.central_dir.clone(),
            config.catalog_path(),
        )?);
        tracing::info!("dispatcher up, central tier at {:?}", config.central_dir);
        Ok(Arc::new(Self {
            handles: HandleTable::new(),
            containers: Mutex::new(BTreeMap::new()),
            engine: Arc::new(MigrationEngine::new(central)),
        }))
    }

    /// Tear down: close every outstanding handle and abort every queue.
    pub fn shutdown(&self) {
        for resource in self.handles.drain() {
            match resource {
                Resource::Container { container, .. } => container.closed(),
                Resource::Object { object, .. } => object.close(),
                Resource::Queue(queue) => queue.destroy(),
            }
        }
        tracing::info!("dispatcher shut down");
    }

    // Handle plumbing.

    fn container_of(&self, cookie: Cookie) -> Result<(Arc<Container>, ContainerMode)> {
        match self.handles.get(cookie)? {
            Resource::Container { container, mode } => Ok((container, mode)),
            _ => Err(TideError::InvalidArgument(
                "handle is not a container handle".to_string(),
            )),
        }
    }

    fn object_of(&self, cookie: Cookie) -> Result<ObjBinding> {
        match self.handles.get(cookie)? {
            Resource::Object {
                object,
                container,
                mode,
                writable,
            } => Ok(ObjBinding {
                object,
                container,
                mode,
                writable,
            }),
            _ => Err(TideError::InvalidArgument(
                "handle is not an object handle".to_string(),
            )),
        }
    }

    fn queue_of(&self, cookie: Cookie) -> Result<Arc<EventQueue>> {
        match self.handles.get(cookie)? {
            Resource::Queue(queue) => Ok(queue),
            _ => Err(TideError::InvalidArgument(
                "handle is not an event queue handle".to_string(),
            )),
        }
    }

    fn check_writable_tid(container: &Container, tid: TransId) -> Result<()> {
        if !container.txns.is_writable(tid) {
            return Err(TideError::StateConflict(format!(
                "transaction {} is not open for writing",
                tid
            )));
        }
        Ok(())
    }

    fn check_readable_tid(container: &Container, tid: TransId) -> Result<()> {
        if !container.txns.is_readable(tid) {
            return Err(TideError::StateConflict(format!(
                "transaction {} is not readable",
                tid
            )));
        }
        Ok(())
    }

    // Container lifecycle.

    pub fn container_open(&self, name: &str, mode: ContainerMode, create: bool) -> Result<Cookie> {
        let container = {
            let mut containers = self.containers.lock().unwrap();
            match containers.get(name) {
                Some(container) => container.clone(),
                None if create => {
                    let container = Arc::new(Container::new(name));
                    containers.insert(name.to_string(), container.clone());
                    tracing::info!("created container {}", name);
                    container
                }
                None => {
                    return Err(TideError::NotFound(format!("container not found: {}", name)))
                }
            }
        };
        container.opened();
        Ok(self.handles.insert(Resource::Container { container, mode }))
    }

    pub fn container_close(&self, cookie: Cookie) -> Result<()> {
        let (container, _) = self.container_of(cookie)?;
        self.handles.close(cookie)?;
        container.closed();
        Ok(())
    }

    /// Remove a container. Only legal while nobody holds it open; without
    /// `force` the container must also be empty.
    pub fn container_unlink(&self, name: &str, force: bool) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get(name)
            .ok_or_else(|| TideError::NotFound(format!("container not found: {}", name)))?;
        if container.open_count() > 0 {
            return Err(TideError::StateConflict(format!(
                "container {} is open {} time(s)",
                name,
                container.open_count()
            )));
        }
        if !force && !container.is_empty() {
            return Err(TideError::NotEmpty(name.to_string()));
        }
        containers.remove(name);
        tracing::info!("unlinked container {}", name);
        Ok(())
    }

    pub fn container_query_tids(&self, cookie: Cookie) -> Result<ContainerTids> {
        let (container, _) = self.container_of(cookie)?;
        Ok(container.txns.query())
    }

    pub fn container_list_obj(
        &self,
        cookie: Cookie,
        tid: TransId,
        filter: ObjectFilter,
        offset: u64,
        num: u64,
    ) -> Result<Vec<ObjectEntry>> {
        let (container, mode) = self.container_of(cookie)?;
        if !mode.readable() {
            return Err(TideError::PermissionDenied(
                "container is open write-only".to_string(),
            ));
        }
        Self::check_readable_tid(&container, tid)?;
        Ok(container.list_objects(tid, filter, offset, num))
    }

    pub async fn container_snapshot(&self, cookie: Cookie, name: &str) -> Result<TransId> {
        let (container, mode) = self.container_of(cookie)?;
        if !mode.writable() {
            return Err(TideError::PermissionDenied(
                "container is open read-only".to_string(),
            ));
        }
        self.engine.snapshot(&container, name).await
    }

    // Transactions.

    pub fn trans_start(
        &self,
        cookie: Cookie,
        tid: TransId,
        mode: TransMode,
        num_ranks: u32,
        hints: &HintList,
    ) -> Result<TransId> {
        let (container, cmode) = self.container_of(cookie)?;
        match mode {
            TransMode::Write if !cmode.writable() => {
                return Err(TideError::PermissionDenied(
                    "container is open read-only".to_string(),
                ))
            }
            TransMode::Read if !cmode.readable() => {
                return Err(TideError::PermissionDenied(
                    "container is open write-only".to_string(),
                ))
            }
            _ => {}
        }
        container.txns.start(tid, mode, num_ranks, hints)
    }

    /// Finish a transaction. When the finish aborts transactions, their
    /// burst-buffer updates are rolled back across every object.
    pub async fn trans_finish(
        &self,
        cookie: Cookie,
        tid: TransId,
        abort: AbortFlag,
    ) -> Result<FinishOutcome> {
        let (container, _) = self.container_of(cookie)?;
        let outcome = container.txns.finish(tid, abort).await?;
        for &aborted in &outcome.aborted {
            for object in container.all_objects() {
                object.rollback(aborted);
            }
        }
        Ok(outcome)
    }

    /// Move a handle from `tid` to the next transaction. The participant
    /// count must match the one `tid` was started with; slip keeps it.
    pub async fn trans_slip(
        &self,
        cookie: Cookie,
        tid: TransId,
        num_ranks: u32,
        hints: &HintList,
    ) -> Result<TransId> {
        let (container, _) = self.container_of(cookie)?;
        container.txns.check_num_ranks(tid, num_ranks)?;
        let (next, _) = container.txns.slip(tid, hints).await?;
        Ok(next)
    }

    pub async fn trans_persist(&self, cookie: Cookie, tid: TransId) -> Result<()> {
        let (container, mode) = self.container_of(cookie)?;
        if !mode.writable() {
            return Err(TideError::PermissionDenied(
                "container is open read-only".to_string(),
            ));
        }
        self.engine.persist(&container, tid).await
    }

    pub fn trans_query(&self, cookie: Cookie, tid: TransId) -> Result<TransStatus> {
        let (container, _) = self.container_of(cookie)?;
        Ok(container.txns.status(tid))
    }

    // Objects.

    /// Create an object under a write transaction and return a write handle
    /// bound to it.
    pub fn obj_create(
        &self,
        cookie: Cookie,
        tid: TransId,
        kind: ObjectKind,
        name: Option<&str>,
        array: Option<ArrayStruct>,
    ) -> Result<(ObjectId, Cookie)> {
        let (container, mode) = self.container_of(cookie)?;
        if !mode.writable() {
            return Err(TideError::PermissionDenied(
                "container is open read-only".to_string(),
            ));
        }
        Self::check_writable_tid(&container, tid)?;
        let object = container.create_object(tid, kind, name, array)?;
        object.open();
        let id = object.id;
        let cookie = self.handles.insert(Resource::Object {
            object,
            container,
            mode,
            writable: true,
        });
        Ok((id, cookie))
    }

    pub fn obj_open_write(&self, cookie: Cookie, id: ObjectId) -> Result<Cookie> {
        let (container, mode) = self.container_of(cookie)?;
        if !mode.writable() {
            return Err(TideError::PermissionDenied(
                "write-open denied on a read-only container".to_string(),
            ));
        }
        let object = container.get_object(id)?;
        object.open();
        Ok(self.handles.insert(Resource::Object {
            object,
            container,
            mode,
            writable: true,
        }))
    }

    pub fn obj_open_read(&self, cookie: Cookie, id: ObjectId) -> Result<Cookie> {
        let (container, mode) = self.container_of(cookie)?;
        if !mode.readable() {
            return Err(TideError::PermissionDenied(
                "read-open denied on a write-only container".to_string(),
            ));
        }
        let object = container.get_object(id)?;
        object.open();
        Ok(self.handles.insert(Resource::Object {
            object,
            container,
            mode,
            writable: false,
        }))
    }

    pub fn obj_close(&self, cookie: Cookie) -> Result<()> {
        let b = self.object_of(cookie)?;
        self.handles.close(cookie)?;
        b.object.close();
        Ok(())
    }

    pub fn obj_unlink(&self, cookie: Cookie, id: ObjectId, tid: TransId) -> Result<()> {
        let (container, mode) = self.container_of(cookie)?;
        if !mode.writable() {
            return Err(TideError::PermissionDenied(
                "container is open read-only".to_string(),
            ));
        }
        Self::check_writable_tid(&container, tid)?;
        container.get_object(id)?.unlink(tid)
    }

    // Scratchpad and layout.

    pub fn obj_set_scratch(
        &self,
        cookie: Cookie,
        tid: TransId,
        scratch: &[u8; SCRATCH_LEN],
        cs: Option<Checksum>,
    ) -> Result<Checksum> {
        let b = self.object_of(cookie)?;
        if !b.writable {
            return Err(TideError::PermissionDenied(
                "scratchpad writes need a write handle".to_string(),
            ));
        }
        Self::check_writable_tid(&b.container, tid)?;
        b.object.set_scratch(tid, scratch, cs)
    }

    pub fn obj_get_scratch(
        &self,
        cookie: Cookie,
        tid: TransId,
    ) -> Result<([u8; SCRATCH_LEN], Checksum)> {
        let b = self.object_of(cookie)?;
        if !b.mode.readable() {
            return Err(TideError::PermissionDenied(
                "container is open write-only".to_string(),
            ));
        }
        Self::check_readable_tid(&b.container, tid)?;
        b.object.get_scratch(tid)
    }

    pub fn obj_set_layout(&self, cookie: Cookie, tid: TransId, layout: Layout) -> Result<()> {
        let b = self.object_of(cookie)?;
        if !b.writable {
            return Err(TideError::PermissionDenied(
                "layout changes need a write handle".to_string(),
            ));
        }
        Self::check_writable_tid(&b.container, tid)?;
        b.object.set_layout(tid, layout)?;
        Ok(())
    }

    pub fn obj_get_layout(&self, cookie: Cookie, tid: TransId) -> Result<Layout> {
        let b = self.object_of(cookie)?;
        Ok(b.object.get_layout(tid))
    }

    // Arrays.

    pub fn array_get_struct(&self, cookie: Cookie) -> Result<ArrayStruct> {
        let b = self.object_of(cookie)?;
        b.object.get_struct()
    }

    pub fn array_extend(&self, cookie: Cookie, tid: TransId, firstdim_len: u64) -> Result<()> {
        let b = self.object_of(cookie)?;
        if !b.writable {
            return Err(TideError::PermissionDenied(
                "extend needs a write handle".to_string(),
            ));
        }
        Self::check_writable_tid(&b.container, tid)?;
        b.object.extend(firstdim_len)
    }

    /// Write a hyperslab selection. The payload is the gather list in
    /// logical row-major order; one checksum covers the whole payload.
    /// Returns the (verified or computed) payload checksum.
    pub fn array_write(
        &self,
        cookie: Cookie,
        tid: TransId,
        slab: &Hyperslab,
        mem: &MemDesc,
        cs: Option<Checksum>,
    ) -> Result<Checksum> {
        let b = self.object_of(cookie)?;
        if !b.writable {
            return Err(TideError::PermissionDenied(
                "writes need a write handle".to_string(),
            ));
        }
        Self::check_writable_tid(&b.container, tid)?;
        let st = b.object.get_struct()?;
        let runs = slab.byte_runs(st.cell_size, &st.current_dims, &st.dims_seq)?;
        Self::write_runs(&b.object, tid, &runs, mem, cs)
    }

    /// Read a hyperslab selection. Returns the payload in logical row-major
    /// order and its checksum.
    pub fn array_read(
        &self,
        cookie: Cookie,
        tid: TransId,
        slab: &Hyperslab,
    ) -> Result<(Bytes, Checksum)> {
        let b = self.object_of(cookie)?;
        if !b.mode.readable() {
            return Err(TideError::PermissionDenied(
                "container is open write-only".to_string(),
            ));
        }
        Self::check_readable_tid(&b.container, tid)?;
        let st = b.object.get_struct()?;
        let runs = slab.byte_runs(st.cell_size, &st.current_dims, &st.dims_seq)?;
        let data = b.object.read_ranges(tid, &runs)?;
        let cs = Checksum::of_bytes(&data);
        Ok((data, cs))
    }

    // Blobs.

    pub fn blob_write(
        &self,
        cookie: Cookie,
        tid: TransId,
        desc: &BlobIoDesc,
        mem: &MemDesc,
        cs: Option<Checksum>,
    ) -> Result<Checksum> {
        let b = self.object_of(cookie)?;
        if !b.writable {
            return Err(TideError::PermissionDenied(
                "writes need a write handle".to_string(),
            ));
        }
        if b.object.kind != ObjectKind::Blob {
            return Err(TideError::InvalidArgument(format!(
                "object {} is not a blob",
                b.object.id
            )));
        }
        Self::check_writable_tid(&b.container, tid)?;
        desc.validate()?;
        Self::write_runs(&b.object, tid, &desc.ranges(), mem, cs)
    }

    pub fn blob_read(
        &self,
        cookie: Cookie,
        tid: TransId,
        desc: &BlobIoDesc,
    ) -> Result<(Bytes, Checksum)> {
        let b = self.object_of(cookie)?;
        if !b.mode.readable() {
            return Err(TideError::PermissionDenied(
                "container is open write-only".to_string(),
            ));
        }
        if b.object.kind != ObjectKind::Blob {
            return Err(TideError::InvalidArgument(format!(
                "object {} is not a blob",
                b.object.id
            )));
        }
        Self::check_readable_tid(&b.container, tid)?;
        desc.validate()?;
        let data = b.object.read_ranges(tid, &desc.ranges())?;
        let cs = Checksum::of_bytes(&data);
        Ok((data, cs))
    }

    /// Scatter one verified payload over the target byte runs.
    fn write_runs(
        object: &Object,
        tid: TransId,
        runs: &[(u64, u64)],
        mem: &MemDesc,
        cs: Option<Checksum>,
    ) -> Result<Checksum> {
        let expect: u64 = runs.iter().map(|&(_, len)| len).sum();
        if mem.total_len() != expect {
            return Err(TideError::InvalidArgument(format!(
                "payload is {} bytes, selection covers {}",
                mem.total_len(),
                expect
            )));
        }
        let cs = match cs {
            Some(cs) => {
                cs.verify(mem.frags.iter().map(|f| f.as_ref()))?;
                cs
            }
            None => mem.checksum(),
        };
        // Zero-length transfers are legal no-ops.
        if expect == 0 {
            return Ok(cs);
        }

        let payload = mem.gather();
        let mut extents = Vec::with_capacity(runs.len());
        let mut pos = 0usize;
        for &(offset, len) in runs {
            extents.push(Extent {
                offset,
                data: payload.slice(pos..pos + len as usize),
            });
            pos += len as usize;
        }
        object.write_extents(tid, extents)?;
        Ok(cs)
    }

    // Key-value.

    pub fn kv_set(
        &self,
        cookie: Cookie,
        tid: TransId,
        key: &str,
        value: Bytes,
        cs: Option<Checksum>,
    ) -> Result<Checksum> {
        let b = self.object_of(cookie)?;
        if !b.writable {
            return Err(TideError::PermissionDenied(
                "writes need a write handle".to_string(),
            ));
        }
        Self::check_writable_tid(&b.container, tid)?;
        b.object.with_kv(|kv| kv.set(tid, key, value, cs))
    }

    pub fn kv_get_num(&self, cookie: Cookie, tid: TransId) -> Result<u64> {
        let b = self.kv_read_binding(cookie, tid)?;
        b.object.with_kv(|kv| kv.get_num(tid))
    }

    pub fn kv_get_value(
        &self,
        cookie: Cookie,
        tid: TransId,
        key: &str,
        capacity: Option<usize>,
    ) -> Result<KvGetOutcome> {
        let b = self.kv_read_binding(cookie, tid)?;
        b.object.with_kv(|kv| kv.get_value(tid, key, capacity))
    }

    pub fn kv_list_key(
        &self,
        cookie: Cookie,
        tid: TransId,
        offset: u64,
        num: u64,
    ) -> Result<Vec<String>> {
        let b = self.kv_read_binding(cookie, tid)?;
        b.object.with_kv(|kv| kv.list_keys(tid, offset, num))
    }

    pub fn kv_get_list(
        &self,
        cookie: Cookie,
        tid: TransId,
        offset: u64,
        num: u64,
    ) -> Result<Vec<(String, Bytes, Checksum)>> {
        let b = self.kv_read_binding(cookie, tid)?;
        b.object.with_kv(|kv| kv.get_list(tid, offset, num))
    }

    pub fn kv_unlink_keys(
        &self,
        cookie: Cookie,
        tid: TransId,
        keys: &[String],
    ) -> Result<Vec<Result<()>>> {
        let b = self.object_of(cookie)?;
        if !b.writable {
            return Err(TideError::PermissionDenied(
                "writes need a write handle".to_string(),
            ));
        }
        Self::check_writable_tid(&b.container, tid)?;
        b.object.with_kv(|kv| kv.unlink_keys(tid, keys))
    }

    fn kv_read_binding(&self, cookie: Cookie, tid: TransId) -> Result<ObjBinding> {
        let b = self.object_of(cookie)?;
        if !b.mode.readable() {
            return Err(TideError::PermissionDenied(
                "container is open write-only".to_string(),
            ));
        }
        Self::check_readable_tid(&b.container, tid)?;
        Ok(b)
    }

    // Migration.

    /// Pre-stage an object from the central tier. An array hyperslab narrows
    /// the staged bytes; KV objects ignore it.
    pub async fn obj_fetch(
        &self,
        cookie: Cookie,
        tid: TransId,
        slab: Option<&Hyperslab>,
        layout: Option<Layout>,
    ) -> Result<TransId> {
        let b = self.object_of(cookie)?;
        let ranges = match (slab, b.object.kind) {
            (Some(slab), ObjectKind::Array) => {
                let st = b.object.get_struct()?;
                Some(slab.byte_runs(st.cell_size, &st.current_dims, &st.dims_seq)?)
            }
            _ => None,
        };
        self.engine
            .fetch(&b.container, &b.object, tid, ranges.as_deref(), layout)
            .await
    }

    pub async fn obj_replica(
        &self,
        cookie: Cookie,
        tid: TransId,
        this_only: bool,
        layout: Layout,
    ) -> Result<TransId> {
        let b = self.object_of(cookie)?;
        self.engine
            .replica(&b.container, &b.object, tid, this_only, layout)
            .await
    }

    pub fn obj_purge(&self, cookie: Cookie, tid: TransId) -> Result<()> {
        let b = self.object_of(cookie)?;
        self.engine.purge(&b.container, &b.object, tid)
    }

    // Event queues.

    pub fn queue_create(&self) -> Cookie {
        self.handles.insert(Resource::Queue(Arc::new(EventQueue::new())))
    }

    pub fn queue_destroy(&self, cookie: Cookie) -> Result<()> {
        let queue = self.queue_of(cookie)?;
        self.handles.close(cookie)?;
        queue.destroy();
        Ok(())
    }

    pub async fn queue_poll(
        &self,
        cookie: Cookie,
        mode: WaitMode,
        max_events: usize,
    ) -> Result<Vec<PolledEvent>> {
        let queue = self.queue_of(cookie)?;
        Ok(queue.poll(mode, max_events).await)
    }

    pub fn queue_query(
        &self,
        cookie: Cookie,
        mask: EventQuery,
        max_events: usize,
    ) -> Result<(usize, Vec<EventSnapshot>)> {
        Ok(self.queue_of(cookie)?.query(mask, max_events))
    }

    pub fn event_abort(&self, cookie: Cookie, event: EventId) -> Result<()> {
        self.queue_of(cookie)?.abort(event)
    }

    pub fn event_finalize(&self, cookie: Cookie, event: EventId) -> Result<()> {
        self.queue_of(cookie)?.finalize(event)
    }

    /// Persist as an asynchronous operation tracked on an event queue.
    pub fn submit_persist(
        self: &Arc<Self>,
        queue_cookie: Cookie,
        container_cookie: Cookie,
        tid: TransId,
    ) -> Result<EventId> {
        let queue = self.queue_of(queue_cookie)?;
        let (container, mode) = self.container_of(container_cookie)?;
        if !mode.writable() {
            return Err(TideError::PermissionDenied(
                "container is open read-only".to_string(),
            ));
        }
        // Register on the container's persist log at submission, not when the
        // task runs, so a purge racing the queued persist is deferred onto it.
        MigrationEngine::register_persist(&container, tid)?;
        let engine = self.engine.clone();
        Ok(queue.submit(EventKind::TransPersist, async move {
            engine.run_persist(&container, tid).await
        }))
    }

    /// Snapshot as an asynchronous operation tracked on an event queue.
    pub fn submit_snapshot(
        self: &Arc<Self>,
        queue_cookie: Cookie,
        container_cookie: Cookie,
        name: &str,
    ) -> Result<EventId> {
        let queue = self.queue_of(queue_cookie)?;
        let (container, mode) = self.container_of(container_cookie)?;
        if !mode.writable() {
            return Err(TideError::PermissionDenied(
                "container is open read-only".to_string(),
            ));
        }
        let engine = self.engine.clone();
        let name = name.to_string();
        Ok(queue.submit(EventKind::Snapshot, async move {
            engine.snapshot(&container, &name).await.map(|_| ())
        }))
    }
}
