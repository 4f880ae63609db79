//! Persistence seam of the mapping store and its in-memory implementation.

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use vsync_core::{Mapping, NameMapping};

use crate::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendWatchEventType {
    Update,
    Delete,
    /// A delete whose payload could not be decoded; the mapping was rebuilt from the
    /// storage key and only carries the kind and the virtual name.
    DeleteReconstructed,
}

#[derive(Debug, Clone)]
pub struct BackendWatchEvent {
    pub kind: BackendWatchEventType,
    pub mapping: Mapping,
}

/// One batch of watch events, or the error that interrupted the watch.
#[derive(Debug, Default)]
pub struct BackendWatchResponse {
    pub events: Vec<BackendWatchEvent>,
    pub err: Option<StoreError>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn list(&self) -> Result<Vec<Mapping>, StoreError>;
    /// Stream of changes. The channel closes when the underlying watch ends.
    async fn watch(&self) -> mpsc::UnboundedReceiver<BackendWatchResponse>;
    async fn save(&self, mapping: &Mapping) -> Result<(), StoreError>;
    async fn delete(&self, mapping: &Mapping) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryState {
    mappings: FxHashMap<NameMapping, Mapping>,
    watches: Vec<mpsc::UnboundedSender<BackendWatchResponse>>,
}

/// Process-local backend. Every save and delete is fanned out to all open watches
/// before the call returns.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of watches still open.
    pub fn watcher_count(&self) -> usize {
        let mut st = self.state.lock();
        st.watches.retain(|tx| !tx.is_closed());
        st.watches.len()
    }

    fn fan_out(st: &mut MemoryState, kind: BackendWatchEventType, mapping: &Mapping) {
        st.watches.retain(|tx| {
            let event = BackendWatchEvent { kind, mapping: mapping.clone() };
            tx.send(BackendWatchResponse { events: vec![event], err: None }).is_ok()
        });
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn list(&self) -> Result<Vec<Mapping>, StoreError> {
        Ok(self.state.lock().mappings.values().cloned().collect())
    }

    async fn watch(&self) -> mpsc::UnboundedReceiver<BackendWatchResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().watches.push(tx);
        rx
    }

    async fn save(&self, mapping: &Mapping) -> Result<(), StoreError> {
        let mut st = self.state.lock();
        st.mappings.insert(mapping.name_mapping.clone(), mapping.clone());
        Self::fan_out(&mut st, BackendWatchEventType::Update, mapping);
        Ok(())
    }

    async fn delete(&self, mapping: &Mapping) -> Result<(), StoreError> {
        let mut st = self.state.lock();
        st.mappings.remove(&mapping.name_mapping);
        Self::fan_out(&mut st, BackendWatchEventType::Delete, mapping);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsync_core::{GroupVersionKind, NamespacedName};

    fn mapping(name: &str) -> Mapping {
        Mapping::new(NameMapping::new(
            GroupVersionKind::new("", "v1", "Secret"),
            NamespacedName::new("default", name),
            NamespacedName::new("host", format!("{name}-x-default-x-vc")),
        ))
    }

    #[tokio::test]
    async fn saves_fan_out_to_watchers() {
        let backend = MemoryBackend::new();
        let mut a = backend.watch().await;
        let b = backend.watch().await;
        assert_eq!(backend.watcher_count(), 2);
        drop(b);
        assert_eq!(backend.watcher_count(), 1);

        backend.save(&mapping("a")).await.unwrap();
        backend.delete(&mapping("a")).await.unwrap();
        let first = a.recv().await.unwrap();
        assert_eq!(first.events[0].kind, BackendWatchEventType::Update);
        let second = a.recv().await.unwrap();
        assert_eq!(second.events[0].kind, BackendWatchEventType::Delete);
        assert!(backend.list().await.unwrap().is_empty());
    }
}
