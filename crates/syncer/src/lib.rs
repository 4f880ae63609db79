//! vsync syncer: reconciles one kind between the virtual and the host cluster.
//!
//! A [`Syncer`] bundles the capabilities of one kind (how names map, how objects
//! are copied and the optional hooks); a [`SyncController`] drives it from a
//! shared work queue.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::core::DynamicObject;
use vsync_core::{CoreError, GroupVersionKind, MappingContext, NameMapping, NamespacedName, Translator};
use vsync_kubehub::{ClientError, SharedClient};
use vsync_merge::MergeError;
use vsync_patches::PatchError;
use vsync_store::{Store, StoreError};

pub mod cache;
pub mod controller;
pub mod generic;
pub mod lock;
pub mod patcher;
pub mod queue;
pub mod request;

pub use cache::ObjectCache;
pub use controller::SyncController;
pub use lock::KeyedLock;
pub use queue::WorkQueue;
pub use request::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResult {
    Done,
    Requeue,
    RequeueAfter(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("conflict: host object {host} belongs to another controller but virtual object {virtual_} expects it")]
    OwnershipConflict { host: String, virtual_: String },
    #[error("{stage}: {source}")]
    Stage { stage: &'static str, source: Box<SyncError> },
    #[error("{0}; {1}")]
    Joined(Box<SyncError>, Box<SyncError>),
    #[error("{0}")]
    Other(String),
}

impl SyncError {
    pub fn is_conflict(&self) -> bool {
        match self {
            SyncError::Client(e) => e.is_conflict(),
            SyncError::Store(e) => e.is_conflict(),
            SyncError::OwnershipConflict { .. } => true,
            SyncError::Stage { source, .. } => source.is_conflict(),
            SyncError::Joined(a, b) => a.is_conflict() || b.is_conflict(),
            _ => false,
        }
    }

    pub(crate) fn stage(stage: &'static str, source: SyncError) -> Self {
        SyncError::Stage { stage, source: Box::new(source) }
    }

    /// Combines two failures of one reconcile, keeping both messages.
    pub fn join(a: SyncError, b: SyncError) -> Self {
        SyncError::Joined(Box::new(a), Box::new(b))
    }
}

/// Controller tuning read from the environment.
#[derive(Debug, Clone)]
pub struct Options {
    pub max_concurrent_reconciles: usize,
    pub gc_interval: Duration,
    pub requeue_base: Duration,
    pub requeue_max: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: 10,
            gc_interval: vsync_store::DEFAULT_GC_INTERVAL,
            requeue_base: Duration::from_millis(5),
            requeue_max: Duration::from_secs(1000),
        }
    }
}

impl Options {
    pub fn from_env() -> Self {
        let d = Self::default();
        let workers = std::env::var("VSYNC_MAX_CONCURRENT_RECONCILES").ok().and_then(|s| s.parse::<usize>().ok());
        let gc_secs = std::env::var("VSYNC_GC_INTERVAL_SECS").ok().and_then(|s| s.parse::<u64>().ok());
        let base_ms = std::env::var("VSYNC_REQUEUE_BASE_MS").ok().and_then(|s| s.parse::<u64>().ok());
        let max_secs = std::env::var("VSYNC_REQUEUE_MAX_SECS").ok().and_then(|s| s.parse::<u64>().ok());
        Self {
            max_concurrent_reconciles: workers.filter(|n| *n > 0).unwrap_or(d.max_concurrent_reconciles),
            gc_interval: gc_secs.map(Duration::from_secs).unwrap_or(d.gc_interval),
            requeue_base: base_ms.map(Duration::from_millis).unwrap_or(d.requeue_base),
            requeue_max: max_secs.map(Duration::from_secs).unwrap_or(d.requeue_max),
        }
    }
}

/// Everything a reconcile step needs: both clusters, the mapping store and the
/// mapping currently being reconciled.
#[derive(Clone)]
pub struct SyncContext {
    pub virtual_client: SharedClient,
    pub host_client: SharedClient,
    pub mappings: Option<Arc<Store>>,
    pub translator: Arc<Translator>,
    pub mapping: MappingContext,
}

impl SyncContext {
    pub fn new(virtual_client: SharedClient, host_client: SharedClient, translator: Arc<Translator>) -> Self {
        Self { virtual_client, host_client, mappings: None, translator, mapping: MappingContext::default() }
    }

    pub fn with_store(mut self, store: Arc<Store>) -> Self {
        self.mappings = Some(store);
        self
    }

    pub fn with_mapping(&self, current: NameMapping) -> Self {
        Self { mapping: MappingContext::with_current(current), ..self.clone() }
    }
}

/// Value of the kind annotation for `gvk`: always the `group/version/Kind` triple,
/// with an empty group for core kinds.
pub fn kind_annotation(gvk: &GroupVersionKind) -> String {
    format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
}

/// Name translation for one kind. `virtual_to_host`/`host_to_virtual` return an
/// empty name when the object has no counterpart.
pub trait Mapper: Send + Sync {
    fn gvk(&self) -> &GroupVersionKind;
    fn virtual_to_host(&self, ctx: &SyncContext, name: &NamespacedName, obj: Option<&DynamicObject>) -> NamespacedName;
    fn host_to_virtual(&self, ctx: &SyncContext, name: &NamespacedName, obj: Option<&DynamicObject>) -> NamespacedName;
    fn is_managed(&self, ctx: &SyncContext, obj: &DynamicObject) -> Result<bool, SyncError>;
}

#[derive(Debug, Clone)]
pub struct SyncToHostEvent {
    pub virtual_: DynamicObject,
    pub host_old: Option<DynamicObject>,
}

#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub virtual_old: Option<DynamicObject>,
    pub virtual_: DynamicObject,
    pub host_old: Option<DynamicObject>,
    pub host: DynamicObject,
}

#[derive(Debug, Clone)]
pub struct SyncToVirtualEvent {
    pub host: DynamicObject,
    pub virtual_old: Option<DynamicObject>,
}

/// The three ways a pair can be found: only virtual, both, only host.
#[async_trait]
pub trait SyncStrategy: Send + Sync {
    async fn sync_to_host(&self, ctx: &SyncContext, event: SyncToHostEvent) -> Result<SyncResult, SyncError>;
    async fn sync(&self, ctx: &SyncContext, event: SyncEvent) -> Result<SyncResult, SyncError>;
    async fn sync_to_virtual(&self, ctx: &SyncContext, event: SyncToVirtualEvent) -> Result<SyncResult, SyncError>;
}

/// Gate around every reconcile.
#[async_trait]
pub trait Starter: Send + Sync {
    /// Returns true to skip this request.
    async fn reconcile_start(&self, ctx: &SyncContext, req: &Request) -> Result<bool, SyncError>;
    async fn reconcile_end(&self);
}

/// Adopts host objects that are not managed yet.
#[async_trait]
pub trait Importer: Send + Sync {
    /// Returns true when the object was adopted and should be synced.
    async fn import(&self, ctx: &SyncContext, host: &DynamicObject) -> Result<bool, SyncError>;
    fn ignore_host_object(&self, ctx: &SyncContext, host: &DynamicObject) -> bool;
}

pub trait ObjectExcluder: Send + Sync {
    fn exclude_virtual(&self, obj: &DynamicObject) -> bool;
    fn exclude_host(&self, obj: &DynamicObject) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncerOptions {
    pub object_caching: bool,
    pub skip_mappings_recording: bool,
    pub disable_uid_deletion: bool,
}

/// The capabilities of one kind, composed explicitly.
#[derive(Clone)]
pub struct Syncer {
    pub name: String,
    pub mapper: Arc<dyn Mapper>,
    pub strategy: Arc<dyn SyncStrategy>,
    pub importer: Option<Arc<dyn Importer>>,
    pub excluder: Option<Arc<dyn ObjectExcluder>>,
    pub starter: Option<Arc<dyn Starter>>,
    pub options: SyncerOptions,
}

impl Syncer {
    pub fn new(name: impl Into<String>, mapper: Arc<dyn Mapper>, strategy: Arc<dyn SyncStrategy>) -> Self {
        Self {
            name: name.into(),
            mapper,
            strategy,
            importer: None,
            excluder: None,
            starter: None,
            options: SyncerOptions::default(),
        }
    }

    /// A syncer whose mapper and strategy are the same value.
    pub fn single<T>(name: impl Into<String>, inner: Arc<T>) -> Self
    where
        T: Mapper + SyncStrategy + 'static,
    {
        Self::new(name, inner.clone(), inner)
    }

    pub fn with_importer(mut self, importer: Arc<dyn Importer>) -> Self {
        self.importer = Some(importer);
        self
    }

    pub fn with_excluder(mut self, excluder: Arc<dyn ObjectExcluder>) -> Self {
        self.excluder = Some(excluder);
        self
    }

    pub fn with_starter(mut self, starter: Arc<dyn Starter>) -> Self {
        self.starter = Some(starter);
        self
    }

    pub fn with_options(mut self, options: SyncerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn gvk(&self) -> &GroupVersionKind {
        self.mapper.gvk()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_are_found_through_wrappers() {
        let conflict = SyncError::Client(ClientError::Conflict {
            kind: "Secret".into(),
            name: "default/a".into(),
            message: "stale".into(),
        });
        let wrapped = SyncError::stage("sync", conflict);
        assert!(wrapped.is_conflict());
        let joined = SyncError::join(SyncError::Other("boom".into()), wrapped);
        assert!(joined.is_conflict());
        assert_eq!(joined.to_string(), "boom; sync: conflict on Secret default/a: stale");
        assert!(!SyncError::Other("boom".into()).is_conflict());
    }

    #[test]
    fn kind_annotation_keeps_empty_group() {
        assert_eq!(kind_annotation(&GroupVersionKind::new("", "v1", "Secret")), "/v1/Secret");
        assert_eq!(
            kind_annotation(&GroupVersionKind::new("networking.k8s.io", "v1", "Ingress")),
            "networking.k8s.io/v1/Ingress"
        );
    }

    #[test]
    fn options_default() {
        let o = Options::default();
        assert_eq!(o.max_concurrent_reconciles, 10);
        assert_eq!(o.requeue_base, Duration::from_millis(5));
        assert_eq!(o.gc_interval, Duration::from_secs(300));
    }
}
