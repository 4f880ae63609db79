//! Drives a [`Syncer`] from the work queue: resolves both sides of a request,
//! applies the guards and dispatches to the strategy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::core::DynamicObject;
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vsync_core::translate::{CONTROLLER_LABEL, KIND_ANNOTATION, SKIP_BACKSYNC_ANNOTATION, UID_ANNOTATION};
use vsync_core::{GroupVersionKind, NameMapping, NamespacedName};
use vsync_kubehub::{meta, ClientError, ObjectEvent};

use crate::{
    kind_annotation, patcher, KeyedLock, ObjectCache, Options, Request, SyncContext, SyncError, SyncEvent, SyncResult,
    SyncToHostEvent, SyncToVirtualEvent, Syncer, WorkQueue,
};

pub struct SyncController {
    syncer: Syncer,
    ctx: SyncContext,
    queue: Arc<WorkQueue>,
    locks: KeyedLock,
    cache: Option<ObjectCache>,
    options: Options,
}

/// Both sides of a request after the guards ran.
struct Resolved {
    virtual_name: NamespacedName,
    host_name: NamespacedName,
    virtual_: Option<DynamicObject>,
    host: Option<DynamicObject>,
}

impl SyncController {
    pub fn new(syncer: Syncer, ctx: SyncContext, options: Options) -> Self {
        let queue = Arc::new(WorkQueue::new(options.requeue_base, options.requeue_max));
        let cache = syncer.options.object_caching.then(ObjectCache::new);
        Self { syncer, ctx, queue, locks: KeyedLock::new(), cache, options }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn cache(&self) -> Option<&ObjectCache> {
        self.cache.as_ref()
    }

    pub fn syncer(&self) -> &Syncer {
        &self.syncer
    }

    fn gvk(&self) -> &GroupVersionKind {
        self.syncer.gvk()
    }

    pub fn enqueue_virtual(&self, obj: &DynamicObject, deleted: bool) {
        let req = Request::virtual_(&meta::name_of(obj));
        self.queue.add(if deleted { req.deleted() } else { req });
    }

    /// Queues a host change. Unmanaged objects are offered to the importer and
    /// dropped unless it adopts them.
    pub async fn enqueue_host(&self, obj: &DynamicObject, deleted: bool) {
        let managed = match self.syncer.mapper.is_managed(&self.ctx, obj) {
            Ok(managed) => managed,
            Err(e) => {
                warn!(kind = %self.gvk().kind, name = %meta::name_of(obj), error = %e, "check host object managed");
                return;
            }
        };
        if !managed {
            let Some(importer) = &self.syncer.importer else {
                return;
            };
            if deleted || meta::is_terminating(obj) {
                return;
            }
            match importer.import(&self.ctx, obj).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    warn!(kind = %self.gvk().kind, name = %meta::name_of(obj), error = %e, "import host object");
                    return;
                }
            }
        }
        let req = Request::host(&meta::name_of(obj));
        self.queue.add(if deleted { req.deleted() } else { req });
    }

    /// Requeues the virtual side of every mapping the store reports for our kind.
    pub fn watch_mappings(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let store = self.ctx.mappings.clone()?;
        let mut rx = store.watch(self.gvk());
        let this = self.clone();
        Some(tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    _ = cancel.cancelled() => break,
                    name = rx.recv() => name,
                };
                let Some(name) = name else {
                    break;
                };
                if !name.virtual_name.is_empty() {
                    this.queue.add(Request::virtual_(&name.virtual_name));
                }
            }
        }))
    }

    /// Forwards object events of both clusters into the queue.
    pub fn feed(
        self: &Arc<Self>,
        mut virtual_events: mpsc::Receiver<ObjectEvent>,
        mut host_events: mpsc::Receiver<ObjectEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let (mut virtual_open, mut host_open) = (true, true);
            while virtual_open || host_open {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    ev = virtual_events.recv(), if virtual_open => match ev {
                        Some(ObjectEvent::Applied(obj)) => this.enqueue_virtual(&obj, false),
                        Some(ObjectEvent::Deleted(obj)) => this.enqueue_virtual(&obj, true),
                        None => virtual_open = false,
                    },
                    ev = host_events.recv(), if host_open => match ev {
                        Some(ObjectEvent::Applied(obj)) => this.enqueue_host(&obj, false).await,
                        Some(ObjectEvent::Deleted(obj)) => this.enqueue_host(&obj, true).await,
                        None => host_open = false,
                    },
                }
            }
        })
    }

    /// Runs the worker pool until `cancel` fires, then drains in-flight work.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) {
        let workers = self.options.max_concurrent_reconciles.max(1);
        info!(syncer = %self.syncer.name, gvk = %self.gvk().key(), workers, "starting sync controller");
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                while let Some(req) = this.queue.get().await {
                    this.process(&req).await;
                }
            }));
        }
        cancel.cancelled().await;
        self.queue.shutdown();
        for h in handles {
            let _ = h.await;
        }
        info!(syncer = %self.syncer.name, "sync controller stopped");
    }

    /// Reconciles one queue item and schedules its retry.
    pub async fn process(&self, req: &Request) {
        let started = Instant::now();
        let result = self.reconcile(req).await;
        counter!("reconcile_total", 1u64);
        histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        match result {
            Ok(SyncResult::Done) => self.queue.forget(req),
            Ok(SyncResult::Requeue) => self.queue.add_rate_limited(req.clone()),
            Ok(SyncResult::RequeueAfter(delay)) => {
                self.queue.forget(req);
                self.queue.add_after(req.clone(), delay);
            }
            Err(e) => {
                counter!("reconcile_errors", 1u64);
                warn!(syncer = %self.syncer.name, request = %req, error = %e, "reconcile failed");
                self.queue.add_rate_limited(req.clone());
            }
        }
        self.queue.done(req);
    }

    pub async fn reconcile(&self, req: &Request) -> Result<SyncResult, SyncError> {
        let decoded = req.decode();
        let ctx = &self.ctx;
        let gvk = self.gvk().clone();
        let mapper = &self.syncer.mapper;

        let (virtual_name, host_name) = if decoded.from_host {
            let host = if decoded.delete { None } else { ctx.host_client.get(&gvk, &decoded.name).await? };
            (mapper.host_to_virtual(ctx, &decoded.name, host.as_ref()), decoded.name.clone())
        } else {
            let virtual_ = if decoded.delete { None } else { ctx.virtual_client.get(&gvk, &decoded.name).await? };
            (decoded.name.clone(), mapper.virtual_to_host(ctx, &decoded.name, virtual_.as_ref()))
        };
        if virtual_name.is_empty() {
            debug!(syncer = %self.syncer.name, request = %req, "no virtual counterpart");
            return Ok(SyncResult::Done);
        }

        let _guard = self.locks.lock(&virtual_name.to_string()).await;

        if let Some(starter) = &self.syncer.starter {
            if starter.reconcile_start(ctx, req).await? {
                debug!(syncer = %self.syncer.name, request = %req, "reconcile skipped by starter");
                return Ok(SyncResult::Done);
            }
            let result = self.reconcile_locked(req, virtual_name, host_name).await;
            starter.reconcile_end().await;
            return result;
        }
        self.reconcile_locked(req, virtual_name, host_name).await
    }

    async fn reconcile_locked(
        &self,
        req: &Request,
        virtual_name: NamespacedName,
        host_name: NamespacedName,
    ) -> Result<SyncResult, SyncError> {
        let decoded = req.decode();
        let ctx = &self.ctx;
        let gvk = self.gvk().clone();

        // A delete request treats its side as gone even if a read still returns it.
        let virtual_ = if decoded.delete && !decoded.from_host {
            None
        } else {
            ctx.virtual_client.get(&gvk, &virtual_name).await?
        };
        let host = if (decoded.delete && decoded.from_host) || host_name.is_empty() {
            None
        } else {
            ctx.host_client.get(&gvk, &host_name).await?
        };

        let (virtual_old, host_old) = match &self.cache {
            Some(cache) => (cache.virtual_.get(&virtual_name), cache.host.get(&host_name)),
            None => (None, None),
        };
        if stale(virtual_old.as_ref(), virtual_.as_ref()) || stale(host_old.as_ref(), host.as_ref()) {
            debug!(syncer = %self.syncer.name, request = %req, "cache is newer than the read, requeue");
            return Ok(SyncResult::Requeue);
        }

        let Some(resolved) = self.exclude(Resolved { virtual_name, host_name, virtual_, host })? else {
            return Ok(SyncResult::Done);
        };
        if let (Some(importer), Some(h)) = (&self.syncer.importer, &resolved.host) {
            if importer.ignore_host_object(ctx, h) {
                debug!(syncer = %self.syncer.name, host = %resolved.host_name, "host object ignored by importer");
                return Ok(SyncResult::Requeue);
            }
        }
        let mapping = NameMapping::new(gvk.clone(), resolved.virtual_name.clone(), resolved.host_name.clone());
        let sync_ctx = ctx.with_mapping(mapping.clone());

        let record = resolved.virtual_.is_some();
        let outcome = self.dispatch(&sync_ctx, &resolved, virtual_old, host_old).await;
        if let (Ok(SyncResult::Done), Some(cache)) = (&outcome, &self.cache) {
            // Cache what the strategy wrote, not what it was handed.
            match self.read_written(&gvk, &resolved, decoded.delete.then_some(decoded.from_host)).await {
                Ok((virtual_, host)) => cache.update(&resolved.virtual_name, virtual_.as_ref(), &resolved.host_name, host.as_ref()),
                Err(e) => debug!(syncer = %self.syncer.name, error = %e, "re-read after sync failed, cache left as is"),
            }
        }

        let saved = if record { self.record_mapping(&sync_ctx, &mapping).await } else { Ok(()) };
        match (outcome, saved) {
            (Ok(result), Ok(())) => Ok(result),
            (Err(e), Ok(())) | (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(s)) => Err(SyncError::join(e, s)),
        }
    }

    async fn dispatch(
        &self,
        ctx: &SyncContext,
        resolved: &Resolved,
        virtual_old: Option<DynamicObject>,
        host_old: Option<DynamicObject>,
    ) -> Result<SyncResult, SyncError> {
        let strategy = &self.syncer.strategy;
        let (stage, result) = match (&resolved.virtual_, &resolved.host) {
            (Some(v), Some(h)) => {
                if !self.syncer.options.disable_uid_deletion {
                    if let Some(result) = self.uid_guard(ctx, v, h).await? {
                        return Ok(result);
                    }
                }
                let event = SyncEvent { virtual_old, virtual_: v.clone(), host_old, host: h.clone() };
                ("sync", strategy.sync(ctx, event).await)
            }
            (Some(v), None) => {
                let event = SyncToHostEvent { virtual_: v.clone(), host_old };
                ("sync to host", strategy.sync_to_host(ctx, event).await)
            }
            (None, Some(h)) => {
                if meta::annotation(h, SKIP_BACKSYNC_ANNOTATION) == Some("true") {
                    debug!(syncer = %self.syncer.name, host = %resolved.host_name, "skip backsync");
                    return Ok(SyncResult::Done);
                }
                let event = SyncToVirtualEvent { host: h.clone(), virtual_old };
                ("sync to virtual", strategy.sync_to_virtual(ctx, event).await)
            }
            (None, None) => return Ok(SyncResult::Done),
        };
        match result {
            Err(e) if e.is_conflict() => {
                debug!(syncer = %self.syncer.name, virtual_ = %resolved.virtual_name, error = %e, "conflict, requeue");
                Ok(SyncResult::Requeue)
            }
            Err(e) => Err(SyncError::stage(stage, e)),
            ok => ok,
        }
    }

    /// A host object created for an earlier virtual object of the same name is
    /// removed before anything is synced into it.
    async fn uid_guard(
        &self,
        ctx: &SyncContext,
        virtual_: &DynamicObject,
        host: &DynamicObject,
    ) -> Result<Option<SyncResult>, SyncError> {
        let host_uid = meta::annotation(host, UID_ANNOTATION).unwrap_or("");
        if host_uid.is_empty() || host_uid == meta::uid(virtual_) {
            return Ok(None);
        }
        let kind = meta::annotation(host, KIND_ANNOTATION).unwrap_or("");
        if !kind.is_empty() && kind != kind_annotation(self.gvk()) {
            return Ok(None);
        }
        if meta::is_terminating(host) {
            return Ok(Some(SyncResult::RequeueAfter(Duration::from_secs(1))));
        }
        info!(
            host = %meta::name_of(host),
            host_uid,
            virtual_uid = meta::uid(virtual_),
            "host object belongs to a former virtual object"
        );
        patcher::delete_host_object(ctx, self.gvk(), host, "virtual object uid is different").await.map(Some)
    }

    /// Reads both sides back after a sync. `deleted_side` is `Some(from_host)` for a
    /// delete request; that side stays gone.
    async fn read_written(
        &self,
        gvk: &GroupVersionKind,
        resolved: &Resolved,
        deleted_side: Option<bool>,
    ) -> Result<(Option<DynamicObject>, Option<DynamicObject>), ClientError> {
        let virtual_ = if deleted_side == Some(false) {
            None
        } else {
            self.ctx.virtual_client.get(gvk, &resolved.virtual_name).await?
        };
        let host = if deleted_side == Some(true) || resolved.host_name.is_empty() {
            None
        } else {
            self.ctx.host_client.get(gvk, &resolved.host_name).await?
        };
        Ok((virtual_, host))
    }

    /// Returns `None` when either side belongs to someone else; the pair is
    /// then left alone entirely.
    fn exclude(&self, resolved: Resolved) -> Result<Option<Resolved>, SyncError> {
        if resolved.virtual_.as_ref().is_some_and(|v| self.exclude_virtual(v)) {
            debug!(virtual_ = %resolved.virtual_name, "virtual object excluded");
            return Ok(None);
        }
        if let Some(host) = &resolved.host {
            if self.exclude_host(host, &resolved.virtual_name, resolved.virtual_.is_some())? {
                debug!(host = %resolved.host_name, "host object excluded");
                return Ok(None);
            }
        }
        Ok(Some(resolved))
    }

    fn exclude_virtual(&self, obj: &DynamicObject) -> bool {
        if let Some(excluder) = &self.syncer.excluder {
            return excluder.exclude_virtual(obj);
        }
        if meta::label(obj, CONTROLLER_LABEL).is_some_and(|v| !v.is_empty()) {
            return true;
        }
        meta::annotation(obj, CONTROLLER_LABEL).is_some_and(|owner| !owner.is_empty() && owner != self.syncer.name)
    }

    fn exclude_host(&self, obj: &DynamicObject, virtual_name: &NamespacedName, expects: bool) -> Result<bool, SyncError> {
        if !self.syncer.mapper.is_managed(&self.ctx, obj)? {
            return Ok(true);
        }
        if let Some(excluder) = &self.syncer.excluder {
            return Ok(excluder.exclude_host(obj));
        }
        if meta::label(obj, CONTROLLER_LABEL).is_some_and(|v| !v.is_empty()) {
            return Ok(true);
        }
        let Some(owner) = meta::annotation(obj, CONTROLLER_LABEL).filter(|o| !o.is_empty() && *o != self.syncer.name) else {
            return Ok(false);
        };
        let kind = meta::annotation(obj, KIND_ANNOTATION).unwrap_or("");
        let excluded = match kind.split('/').collect::<Vec<_>>().as_slice() {
            [group, version, kind] => GroupVersionKind::new(*group, *version, *kind) == *self.gvk(),
            _ => true,
        };
        if excluded && expects {
            debug!(host = %meta::name_of(obj), owner, "host object controlled elsewhere");
            return Err(SyncError::OwnershipConflict {
                host: meta::name_of(obj).to_string(),
                virtual_: virtual_name.to_string(),
            });
        }
        Ok(excluded)
    }

    async fn record_mapping(&self, ctx: &SyncContext, mapping: &NameMapping) -> Result<(), SyncError> {
        if self.syncer.options.skip_mappings_recording || !mapping.is_complete() {
            return Ok(());
        }
        let Some(store) = &ctx.mappings else {
            return Ok(());
        };
        store
            .record_reference_and_save(&ctx.mapping, mapping, mapping)
            .await
            .map_err(|e| SyncError::stage("record mapping", e.into()))
    }
}

fn stale(cached: Option<&DynamicObject>, read: Option<&DynamicObject>) -> bool {
    match (cached, read) {
        (Some(cached), Some(read)) => meta::newer_resource_version(cached, read),
        _ => false,
    }
}
