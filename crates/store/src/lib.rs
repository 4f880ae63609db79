//! vsync mapping store: which virtual object corresponds to which host object,
//! which other objects each mapping references, and which labels were translated
//! on its behalf.

#![forbid(unsafe_code)]

use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vsync_core::{GroupVersionKind, LabelMapping, Mapping, MappingContext, NameMapping, NamespacedName, Object};
use vsync_kubehub::{ClientError, SharedClient};

pub mod backend;
pub mod etcd;

pub use backend::{Backend, BackendWatchEvent, BackendWatchEventType, BackendWatchResponse, MemoryBackend};
pub use etcd::{mapping_key, parse_mapping_key, EtcdBackend, KvClient, KvEvent, MemoryKv};

pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(300);
const REWATCH_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("there is already another name mapping {key} -> {existing} that conflicts with {key} -> {wanted}")]
    NameConflict { key: String, existing: String, wanted: String },
    #[error("there is already another label mapping {key} -> {existing} that conflicts with {key} -> {wanted}")]
    LabelConflict { key: String, existing: String, wanted: String },
    #[error("invalid mapping key {0}")]
    InvalidKey(String),
    #[error("backend: {0}")]
    Backend(String),
    #[error("save mapping {mapping}: {source}")]
    Save { mapping: String, source: Box<StoreError> },
    #[error("remove mapping from backend: {0}")]
    Delete(Box<StoreError>),
    #[error("encoding mapping: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl StoreError {
    /// Name and label collisions; callers requeue on these.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::NameConflict { .. } | StoreError::LabelConflict { .. })
    }
}

/// Validates mappings coming from the backend or from callers before they are kept.
pub type VerifyMapping = Arc<dyn Fn(&NameMapping) -> bool + Send + Sync>;

/// Index entry: the translated counterpart plus every mapping that keeps it alive.
#[derive(Debug, Clone)]
struct Lookup<T> {
    target: T,
    owners: Vec<NameMapping>,
}

fn link<K: Hash + Eq, T>(index: &mut FxHashMap<K, Lookup<T>>, key: K, target: T, owner: &NameMapping) {
    let entry = index.entry(key).or_insert_with(|| Lookup { target, owners: Vec::new() });
    if !entry.owners.contains(owner) {
        entry.owners.push(owner.clone());
    }
}

fn unlink<K: Hash + Eq, T>(index: &mut FxHashMap<K, Lookup<T>>, key: &K, owner: &NameMapping) {
    if let Some(entry) = index.get_mut(key) {
        entry.owners.retain(|o| o != owner);
        if entry.owners.is_empty() {
            index.remove(key);
        }
    }
}

/// Sizes of the internal tables, mostly for tests and debug logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexSizes {
    pub mappings: usize,
    pub host_to_virtual: usize,
    pub virtual_to_host: usize,
    pub host_labels: usize,
    pub virtual_labels: usize,
    pub host_labels_cluster: usize,
    pub virtual_labels_cluster: usize,
}

#[derive(Default)]
struct Indices {
    mappings: FxHashMap<NameMapping, Mapping>,
    host_to_virtual: FxHashMap<Object, Lookup<Object>>,
    virtual_to_host: FxHashMap<Object, Lookup<Object>>,
    host_to_virtual_label: FxHashMap<String, Lookup<String>>,
    virtual_to_host_label: FxHashMap<String, Lookup<String>>,
    host_to_virtual_label_cluster: FxHashMap<String, Lookup<String>>,
    virtual_to_host_label_cluster: FxHashMap<String, Lookup<String>>,
    watches: FxHashMap<GroupVersionKind, Vec<mpsc::UnboundedSender<NameMapping>>>,
}

impl Indices {
    fn dispatch(&mut self, name: &NameMapping) {
        if let Some(watchers) = self.watches.get_mut(&name.group_version_kind) {
            watchers.retain(|tx| tx.send(name.clone()).is_ok());
        }
    }

    /// Completes a half query (one side empty) through the name indices and
    /// returns the key of the stored mapping.
    fn find_key(&self, query: &NameMapping) -> Option<NameMapping> {
        if query.is_empty() {
            return None;
        }
        let mut key = query.clone();
        if key.virtual_name.is_empty() {
            key.virtual_name = self.host_to_virtual.get(&query.host())?.target.name.clone();
        } else if key.host_name.is_empty() {
            key.host_name = self.virtual_to_host.get(&query.virtual_())?.target.name.clone();
        }
        self.mappings.contains_key(&key).then_some(key)
    }

    fn check_name_conflict(&self, name: &NameMapping) -> Result<(), StoreError> {
        let (host, virtual_) = (name.host(), name.virtual_());
        if let Some(existing) = self.host_to_virtual.get(&host) {
            if existing.target != virtual_ {
                return Err(StoreError::NameConflict {
                    key: host.to_string(),
                    existing: existing.target.to_string(),
                    wanted: virtual_.to_string(),
                });
            }
        }
        if let Some(existing) = self.virtual_to_host.get(&virtual_) {
            if existing.target != host {
                return Err(StoreError::NameConflict {
                    key: virtual_.to_string(),
                    existing: existing.target.to_string(),
                    wanted: host.to_string(),
                });
            }
        }
        Ok(())
    }

    fn link_name(&mut self, owner: &NameMapping, name: &NameMapping) {
        link(&mut self.host_to_virtual, name.host(), name.virtual_(), owner);
        link(&mut self.virtual_to_host, name.virtual_(), name.host(), owner);
    }

    fn unlink_name(&mut self, owner: &NameMapping, name: &NameMapping) {
        unlink(&mut self.host_to_virtual, &name.host(), owner);
        unlink(&mut self.virtual_to_host, &name.virtual_(), owner);
    }

    fn link_label(&mut self, owner: &NameMapping, label: &LabelMapping, cluster: bool) {
        let (h2v, v2h) = self.label_maps(cluster);
        link(h2v, label.host.clone(), label.virtual_.clone(), owner);
        link(v2h, label.virtual_.clone(), label.host.clone(), owner);
    }

    fn unlink_label(&mut self, owner: &NameMapping, label: &LabelMapping, cluster: bool) {
        let (h2v, v2h) = self.label_maps(cluster);
        unlink(h2v, &label.host, owner);
        unlink(v2h, &label.virtual_, owner);
    }

    #[allow(clippy::type_complexity)]
    fn label_maps(
        &mut self,
        cluster: bool,
    ) -> (&mut FxHashMap<String, Lookup<String>>, &mut FxHashMap<String, Lookup<String>>) {
        if cluster {
            (&mut self.host_to_virtual_label_cluster, &mut self.virtual_to_host_label_cluster)
        } else {
            (&mut self.host_to_virtual_label, &mut self.virtual_to_host_label)
        }
    }

    fn check_label_conflict(&self, label: &LabelMapping, cluster: bool) -> Result<(), StoreError> {
        let (h2v, v2h) = if cluster {
            (&self.host_to_virtual_label_cluster, &self.virtual_to_host_label_cluster)
        } else {
            (&self.host_to_virtual_label, &self.virtual_to_host_label)
        };
        if let Some(existing) = h2v.get(&label.host) {
            if existing.target != label.virtual_ {
                return Err(StoreError::LabelConflict {
                    key: label.host.clone(),
                    existing: existing.target.clone(),
                    wanted: label.virtual_.clone(),
                });
            }
        }
        if let Some(existing) = v2h.get(&label.virtual_) {
            if existing.target != label.host {
                return Err(StoreError::LabelConflict {
                    key: label.virtual_.clone(),
                    existing: existing.target.clone(),
                    wanted: label.host.clone(),
                });
            }
        }
        Ok(())
    }

    fn add_mapping(&mut self, mapping: Mapping) {
        let key = mapping.name_mapping.clone();
        self.link_name(&key, &key);
        self.dispatch(&key);
        for reference in &mapping.references {
            self.link_name(&key, reference);
            self.dispatch(reference);
        }
        for label in &mapping.labels {
            self.link_label(&key, label, false);
        }
        for label in &mapping.labels_cluster {
            self.link_label(&key, label, true);
        }
        self.mappings.insert(key, mapping);
    }

    fn remove_mapping(&mut self, key: &NameMapping) -> Option<Mapping> {
        let mapping = self.mappings.remove(key)?;
        self.unlink_name(key, key);
        self.dispatch(key);
        for reference in &mapping.references {
            self.unlink_name(key, reference);
            self.dispatch(reference);
        }
        for label in &mapping.labels {
            self.unlink_label(key, label, false);
        }
        for label in &mapping.labels_cluster {
            self.unlink_label(key, label, true);
        }
        Some(mapping)
    }

    /// Creates the owner mapping when `belongs_to` can be completed with `name`.
    fn create_mapping(&mut self, name: &NameMapping, belongs_to: &NameMapping) -> Option<NameMapping> {
        if belongs_to.is_empty() {
            return None;
        }
        let mut key = belongs_to.clone();
        if !key.is_complete() {
            if name.group_version_kind != belongs_to.group_version_kind {
                info!(owner = %belongs_to, name = %name, "cannot create name mapping, owner is incomplete and of another kind");
                return None;
            }
            if key.virtual_name.is_empty() && key.host_name == name.host_name {
                key.virtual_name = name.virtual_name.clone();
            } else if key.host_name.is_empty() && key.virtual_name == name.virtual_name {
                key.host_name = name.host_name.clone();
            } else {
                return None;
            }
        }
        info!(host = %key.host(), virtual_ = %key.virtual_(), name = %name, "create name mapping");
        self.add_mapping(Mapping::new(key.clone()));
        Some(key)
    }

    fn references_to(&self, virtual_: &Object) -> Vec<NameMapping> {
        if virtual_.is_empty() {
            return Vec::new();
        }
        let Some(lookup) = self.virtual_to_host.get(virtual_) else {
            return Vec::new();
        };
        let own = NameMapping::new(virtual_.gvk.clone(), virtual_.name.clone(), lookup.target.name.clone());
        lookup.owners.iter().filter(|owner| **owner != own).cloned().collect()
    }

    fn sizes(&self) -> IndexSizes {
        IndexSizes {
            mappings: self.mappings.len(),
            host_to_virtual: self.host_to_virtual.len(),
            virtual_to_host: self.virtual_to_host.len(),
            host_labels: self.host_to_virtual_label.len(),
            virtual_labels: self.virtual_to_host_label.len(),
            host_labels_cluster: self.host_to_virtual_label_cluster.len(),
            virtual_labels_cluster: self.virtual_to_host_label_cluster.len(),
        }
    }
}

/// Mapping table with reference counted name and label indices, persisted through a
/// [`Backend`] and kept in sync with other writers through the backend watch.
pub struct Store {
    state: RwLock<Indices>,
    backend: Arc<dyn Backend>,
    sender: String,
    virtual_client: SharedClient,
    host_client: SharedClient,
    verify: Option<VerifyMapping>,
}

impl Store {
    pub fn new(virtual_client: SharedClient, host_client: SharedClient, backend: Arc<dyn Backend>) -> Self {
        Self {
            state: RwLock::new(Indices::default()),
            backend,
            sender: uuid::Uuid::new_v4().to_string(),
            virtual_client,
            host_client,
            verify: None,
        }
    }

    pub fn with_verify(mut self, verify: VerifyMapping) -> Self {
        self.verify = Some(verify);
        self
    }

    /// Identity stamped on every mapping this store writes.
    pub fn sender(&self) -> &str {
        &self.sender
    }

    fn verified(&self, name: &NameMapping) -> bool {
        self.verify.as_ref().map_or(true, |verify| verify(name))
    }

    /// Loads the persisted mappings and starts following the backend.
    ///
    /// The first watch is opened before this returns, so writes made to the backend
    /// afterwards are never missed.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<JoinHandle<()>, StoreError> {
        let started = Instant::now();
        let mappings = self.backend.list().await?;
        {
            let mut st = self.state.write();
            for mut mapping in mappings {
                if !self.verified(&mapping.name_mapping) {
                    continue;
                }
                mapping.changed = false;
                st.remove_mapping(&mapping.name_mapping);
                debug!(mapping = %mapping.name_mapping, "add mapping");
                st.add_mapping(mapping);
            }
            info!(mappings = st.mappings.len(), "mapping store loaded");
        }
        histogram!("mapping_store_load_ms", started.elapsed().as_secs_f64() * 1000.0);

        let mut events = self.backend.watch().await;
        let store = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                let resp = tokio::select! {
                    _ = cancel.cancelled() => break,
                    resp = events.recv() => resp,
                };
                match resp {
                    Some(resp) => store.handle_event(resp),
                    None => {
                        info!("mapping store watch has ended");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(REWATCH_DELAY) => {}
                        }
                        events = store.backend.watch().await;
                    }
                }
            }
            debug!("mapping store watch loop stopped");
        }))
    }

    /// Applies one batch of backend changes made by other writers.
    pub fn handle_event(&self, resp: BackendWatchResponse) {
        if let Some(err) = resp.err {
            warn!(error = %err, "watch error in mapping store");
            return;
        }
        let mut st = self.state.write();
        for event in resp.events {
            if event.mapping.sender == self.sender {
                continue;
            }
            if event.kind == BackendWatchEventType::Update && !self.verified(&event.mapping.name_mapping) {
                continue;
            }
            debug!(kind = ?event.kind, mapping = %event.mapping.name_mapping, "mapping store received event");
            // reconstructed deletes only carry the virtual side
            if let Some(key) = st.find_key(&event.mapping.name_mapping) {
                st.remove_mapping(&key);
            }
            if event.kind == BackendWatchEventType::Update {
                let mut mapping = event.mapping;
                mapping.changed = false;
                st.add_mapping(mapping);
            }
        }
    }

    /// Records `name` as belonging to the mapping `belongs_to` resolves to, creating
    /// that mapping if needed. Incomplete names are ignored.
    pub fn record_reference(&self, _ctx: &MappingContext, name: &NameMapping, belongs_to: &NameMapping) -> Result<(), StoreError> {
        if !name.is_complete() {
            return Ok(());
        }
        let mut st = self.state.write();
        st.check_name_conflict(name)?;
        if !self.verified(name) {
            return Ok(());
        }
        let Some(key) = st.find_key(belongs_to) else {
            st.create_mapping(name, belongs_to);
            return Ok(());
        };
        if key == *name {
            return Ok(());
        }
        let Some(mapping) = st.mappings.get_mut(&key) else {
            return Ok(());
        };
        if mapping.references.contains(name) {
            return Ok(());
        }
        mapping.references.push(name.clone());
        mapping.changed = true;
        info!(host = %name.host(), virtual_ = %name.virtual_(), owner = %key.virtual_(), "add mapping reference");
        st.link_name(&key, name);
        st.dispatch(name);
        Ok(())
    }

    pub async fn record_reference_and_save(
        &self,
        ctx: &MappingContext,
        name: &NameMapping,
        belongs_to: &NameMapping,
    ) -> Result<(), StoreError> {
        self.record_reference(ctx, name, belongs_to)?;
        self.save_mapping(ctx, belongs_to).await
    }

    pub fn delete_reference(&self, _ctx: &MappingContext, name: &NameMapping, belongs_to: &NameMapping) -> Result<(), StoreError> {
        if !name.is_complete() {
            return Ok(());
        }
        let mut st = self.state.write();
        let Some(key) = st.find_key(belongs_to) else {
            return Ok(());
        };
        let Some(mapping) = st.mappings.get_mut(&key) else {
            return Ok(());
        };
        let before = mapping.references.len();
        mapping.references.retain(|r| r != name);
        if mapping.references.len() == before {
            return Ok(());
        }
        mapping.changed = true;
        info!(host = %name.host(), virtual_ = %name.virtual_(), owner = %key.virtual_(), "delete mapping reference");
        st.unlink_name(&key, name);
        st.dispatch(name);
        Ok(())
    }

    pub async fn delete_reference_and_save(
        &self,
        ctx: &MappingContext,
        name: &NameMapping,
        belongs_to: &NameMapping,
    ) -> Result<(), StoreError> {
        self.delete_reference(ctx, name, belongs_to)?;
        self.save_mapping(ctx, belongs_to).await
    }

    fn record_label_on(&self, label: &LabelMapping, owner: &NameMapping, cluster: bool) -> Result<(), StoreError> {
        if label.virtual_.is_empty() || label.host.is_empty() {
            return Ok(());
        }
        let mut st = self.state.write();
        st.check_label_conflict(label, cluster)?;
        let Some(key) = st.find_key(owner) else {
            return Ok(());
        };
        let Some(mapping) = st.mappings.get_mut(&key) else {
            return Ok(());
        };
        let labels = if cluster { &mut mapping.labels_cluster } else { &mut mapping.labels };
        if labels.contains(label) {
            return Ok(());
        }
        labels.push(label.clone());
        mapping.changed = true;
        debug!(host = %label.host, virtual_ = %label.virtual_, owner = %key, cluster, "add label mapping");
        st.link_label(&key, label, cluster);
        Ok(())
    }

    /// Records a translated label key on the mapping `belongs_to` resolves to.
    pub fn record_label(&self, _ctx: &MappingContext, label: &LabelMapping, belongs_to: &NameMapping) -> Result<(), StoreError> {
        self.record_label_on(label, belongs_to, false)
    }

    /// Cluster-scoped label translation. The owner is the mapping currently being
    /// reconciled; without one nothing is recorded.
    pub fn record_label_cluster(&self, ctx: &MappingContext, label: &LabelMapping, _belongs_to: &NameMapping) -> Result<(), StoreError> {
        match ctx.current.as_ref() {
            Some(owner) => self.record_label_on(label, owner, true),
            None => Ok(()),
        }
    }

    /// Persists the mapping `name` resolves to if it changed since the last save.
    pub async fn save_mapping(&self, _ctx: &MappingContext, name: &NameMapping) -> Result<(), StoreError> {
        let snapshot = {
            let mut st = self.state.write();
            let Some(key) = st.find_key(name) else {
                return Ok(());
            };
            let Some(mapping) = st.mappings.get_mut(&key) else {
                return Ok(());
            };
            if !mapping.changed {
                return Ok(());
            }
            mapping.sender = self.sender.clone();
            mapping.changed = false;
            mapping.clone()
        };

        info!(mapping = %snapshot.name_mapping, references = snapshot.references.len(), "save object mappings in store");
        if let Err(e) = self.backend.save(&snapshot).await {
            if let Some(mapping) = self.state.write().mappings.get_mut(&snapshot.name_mapping) {
                mapping.changed = true;
            }
            return Err(StoreError::Save { mapping: snapshot.name_mapping.to_string(), source: Box::new(e) });
        }
        Ok(())
    }

    /// Removes the mapping `name` resolves to from the backend and the indices.
    pub async fn delete_mapping(&self, _ctx: &MappingContext, name: &NameMapping) -> Result<(), StoreError> {
        let snapshot = {
            let st = self.state.read();
            let Some(key) = st.find_key(name) else {
                return Ok(());
            };
            match st.mappings.get(&key) {
                Some(mapping) => Mapping { sender: self.sender.clone(), ..mapping.clone() },
                None => return Ok(()),
            }
        };
        self.backend.delete(&snapshot).await.map_err(|e| StoreError::Delete(Box::new(e)))?;
        self.state.write().remove_mapping(&snapshot.name_mapping);
        info!(mapping = %snapshot.name_mapping, "remove object mappings in store");
        Ok(())
    }

    /// Owner mappings that reference `virtual_`, excluding its own mapping.
    pub fn references_to(&self, virtual_: &Object) -> Vec<NameMapping> {
        let refs = self.state.read().references_to(virtual_);
        debug!(object = %virtual_, references = refs.len(), "found references for object");
        refs
    }

    pub fn host_to_virtual_name(&self, host: &Object) -> Option<NamespacedName> {
        self.state.read().host_to_virtual.get(host).map(|l| l.target.name.clone())
    }

    pub fn virtual_to_host_name(&self, virtual_: &Object) -> Option<NamespacedName> {
        self.state.read().virtual_to_host.get(virtual_).map(|l| l.target.name.clone())
    }

    pub fn has_host_object(&self, host: &Object) -> bool {
        self.state.read().host_to_virtual.contains_key(host)
    }

    pub fn has_virtual_object(&self, virtual_: &Object) -> bool {
        self.state.read().virtual_to_host.contains_key(virtual_)
    }

    pub fn host_to_virtual_label(&self, host: &str) -> Option<String> {
        self.state.read().host_to_virtual_label.get(host).map(|l| l.target.clone())
    }

    pub fn virtual_to_host_label(&self, virtual_: &str) -> Option<String> {
        self.state.read().virtual_to_host_label.get(virtual_).map(|l| l.target.clone())
    }

    pub fn host_to_virtual_label_cluster(&self, host: &str) -> Option<String> {
        self.state.read().host_to_virtual_label_cluster.get(host).map(|l| l.target.clone())
    }

    pub fn virtual_to_host_label_cluster(&self, virtual_: &str) -> Option<String> {
        self.state.read().virtual_to_host_label_cluster.get(virtual_).map(|l| l.target.clone())
    }

    /// Notifies about every name of `gvk` that is added to or removed from the
    /// indices. The subscription ends when the receiver is dropped.
    pub fn watch(&self, gvk: &GroupVersionKind) -> mpsc::UnboundedReceiver<NameMapping> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.write().watches.entry(gvk.clone()).or_default().push(tx);
        rx
    }

    pub fn mapping(&self, name: &NameMapping) -> Option<Mapping> {
        let st = self.state.read();
        st.find_key(name).and_then(|key| st.mappings.get(&key).cloned())
    }

    pub fn len(&self) -> usize {
        self.state.read().mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn index_sizes(&self) -> IndexSizes {
        self.state.read().sizes()
    }

    async fn object_exists(&self, name: &NameMapping) -> bool {
        let gvk = &name.group_version_kind;
        match self.virtual_client.get(gvk, &name.virtual_name).await {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(e) => {
                // transient errors keep the mapping until the next run
                info!(virtual_ = %name.virtual_(), error = %e, "error retrieving virtual object");
                return true;
            }
        }
        match self.host_client.get(gvk, &name.host_name).await {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                info!(host = %name.host(), error = %e, "error retrieving host object");
                true
            }
        }
    }

    /// Deletes every mapping whose virtual and host objects are both gone.
    /// Returns the number of mappings removed.
    pub async fn garbage_collect(&self) -> usize {
        let started = Instant::now();
        // probing happens unlocked, so reconciles never wait on the collector
        let keys: Vec<NameMapping> = self.state.read().mappings.keys().cloned().collect();
        debug!(mappings = keys.len(), "start mappings garbage collection");
        let ctx = MappingContext::default();
        let mut deleted = 0usize;
        for key in keys {
            if self.object_exists(&key).await {
                continue;
            }
            match self.delete_mapping(&ctx, &key).await {
                Ok(()) => {
                    deleted += 1;
                    info!(mapping = %key, "removed mapping as both virtual and host were not found");
                }
                Err(e) => warn!(mapping = %key, error = %e, "garbage collect mapping"),
            }
        }
        counter!("mapping_gc_deleted", deleted as u64);
        histogram!("mapping_gc_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(deleted, took_ms = started.elapsed().as_millis() as u64, "garbage collection done");
        deleted
    }

    /// Runs [`Store::garbage_collect`] every `interval` until cancelled. The first run
    /// happens immediately.
    pub fn start_garbage_collection(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        store.garbage_collect().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nm(kind: &str, v: (&str, &str), h: (&str, &str)) -> NameMapping {
        NameMapping::new(GroupVersionKind::new("", "v1", kind), NamespacedName::new(v.0, v.1), NamespacedName::new(h.0, h.1))
    }

    #[test]
    fn lookups_are_reference_counted() {
        let mut idx = Indices::default();
        let owner_a = nm("Pod", ("ns", "a"), ("host", "a-x-ns"));
        let owner_b = nm("Pod", ("ns", "b"), ("host", "b-x-ns"));
        let secret = nm("Secret", ("ns", "s"), ("host", "s-x-ns"));

        idx.link_name(&owner_a, &secret);
        idx.link_name(&owner_b, &secret);
        idx.link_name(&owner_b, &secret);
        assert_eq!(idx.virtual_to_host[&secret.virtual_()].owners.len(), 2);

        idx.unlink_name(&owner_a, &secret);
        assert!(idx.host_to_virtual.contains_key(&secret.host()));
        idx.unlink_name(&owner_b, &secret);
        assert!(idx.host_to_virtual.is_empty());
        assert!(idx.virtual_to_host.is_empty());
    }

    #[test]
    fn half_queries_are_completed() {
        let mut idx = Indices::default();
        let pod = nm("Pod", ("ns", "a"), ("host", "a-x-ns"));
        idx.add_mapping(Mapping::new(pod.clone()));

        let by_virtual = NameMapping::new(pod.group_version_kind.clone(), pod.virtual_name.clone(), NamespacedName::default());
        let by_host = NameMapping::new(pod.group_version_kind.clone(), NamespacedName::default(), pod.host_name.clone());
        assert_eq!(idx.find_key(&by_virtual), Some(pod.clone()));
        assert_eq!(idx.find_key(&by_host), Some(pod.clone()));
        assert_eq!(idx.find_key(&NameMapping::default()), None);
    }

    #[test]
    fn conflicts_display_both_sides() {
        let mut idx = Indices::default();
        let pod = nm("Pod", ("ns", "a"), ("host", "a-x-ns"));
        idx.add_mapping(Mapping::new(pod.clone()));
        let other = nm("Pod", ("ns", "a"), ("other", "other"));
        let err = idx.check_name_conflict(&other).unwrap_err();
        assert!(err.is_conflict());
        assert!(err.to_string().starts_with("there is already another name mapping"), "{err}");
    }
}
