//! Mapping backend on top of an etcd-style key-value store.
//!
//! Keys are `/vcluster/mappings/<group>/<version>/<kind>/[<namespace>/]<name>` built
//! from the virtual name; values are the JSON-encoded [`Mapping`]. The layout is a
//! durable format: delete events without a usable value are turned back into a
//! mapping from the key alone.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vsync_core::{GroupVersionKind, Mapping, NameMapping, NamespacedName};

use crate::backend::{Backend, BackendWatchEvent, BackendWatchEventType, BackendWatchResponse};
use crate::StoreError;

pub const MAPPINGS_PREFIX: &str = "/vcluster/mappings/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvEvent {
    Put { key: String, value: Vec<u8> },
    /// etcd delete events usually carry no value.
    Delete { key: String, value: Option<Vec<u8>> },
}

/// The few key-value calls the backend needs.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<Vec<KvEvent>>, StoreError>;
}

pub fn mapping_key(name: &NameMapping) -> String {
    let gvk = &name.group_version_kind;
    let v = &name.virtual_name;
    if v.namespace.is_empty() {
        format!("{MAPPINGS_PREFIX}{}/{}/{}/{}", gvk.group, gvk.version, gvk.kind, v.name)
    } else {
        format!("{MAPPINGS_PREFIX}{}/{}/{}/{}/{}", gvk.group, gvk.version, gvk.kind, v.namespace, v.name)
    }
}

/// Rebuilds the kind and virtual name from a storage key. The group segment may be
/// empty, so empty segments are kept.
pub fn parse_mapping_key(key: &str) -> Result<NameMapping, StoreError> {
    let rest = key.strip_prefix(MAPPINGS_PREFIX).ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
    let parts: Vec<&str> = rest.split('/').collect();
    let (gvk, virtual_name) = match parts.as_slice() {
        [group, version, kind, name] => (GroupVersionKind::new(*group, *version, *kind), NamespacedName::cluster(*name)),
        [group, version, kind, namespace, name] => {
            (GroupVersionKind::new(*group, *version, *kind), NamespacedName::new(*namespace, *name))
        }
        _ => return Err(StoreError::InvalidKey(key.to_string())),
    };
    if gvk.version.is_empty() || gvk.kind.is_empty() || virtual_name.name.is_empty() {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(NameMapping::new(gvk, virtual_name, NamespacedName::default()))
}

fn decode(value: &[u8]) -> Result<Mapping, StoreError> {
    Ok(serde_json::from_slice(value)?)
}

fn translate_events(batch: Vec<KvEvent>) -> BackendWatchResponse {
    let mut out = BackendWatchResponse::default();
    for event in batch {
        match event {
            KvEvent::Put { key, value } => match decode(&value) {
                Ok(mapping) => out.events.push(BackendWatchEvent { kind: BackendWatchEventType::Update, mapping }),
                Err(e) => {
                    out.err = Some(StoreError::Backend(format!("decode mapping {key}: {e}")));
                    return out;
                }
            },
            KvEvent::Delete { key, value } => {
                if let Some(mapping) = value.as_deref().and_then(|v| decode(v).ok()) {
                    out.events.push(BackendWatchEvent { kind: BackendWatchEventType::Delete, mapping });
                    continue;
                }
                match parse_mapping_key(&key) {
                    Ok(name) => out.events.push(BackendWatchEvent {
                        kind: BackendWatchEventType::DeleteReconstructed,
                        mapping: Mapping { name_mapping: name, ..Default::default() },
                    }),
                    Err(e) => {
                        out.err = Some(e);
                        return out;
                    }
                }
            }
        }
    }
    out
}

pub struct EtcdBackend<C> {
    client: Arc<C>,
}

impl<C: KvClient + 'static> EtcdBackend<C> {
    pub fn new(client: C) -> Self {
        Self { client: Arc::new(client) }
    }
}

#[async_trait]
impl<C: KvClient + 'static> Backend for EtcdBackend<C> {
    async fn list(&self) -> Result<Vec<Mapping>, StoreError> {
        let mut out = Vec::new();
        for (key, value) in self.client.list_prefix(MAPPINGS_PREFIX).await? {
            match decode(&value) {
                Ok(mapping) => out.push(mapping),
                Err(e) => warn!(key = %key, error = %e, "skipping undecodable mapping"),
            }
        }
        Ok(out)
    }

    async fn watch(&self) -> mpsc::UnboundedReceiver<BackendWatchResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut events = match self.client.watch_prefix(MAPPINGS_PREFIX).await {
            Ok(events) => events,
            Err(e) => {
                let _ = tx.send(BackendWatchResponse { events: Vec::new(), err: Some(e) });
                return rx;
            }
        };
        tokio::spawn(async move {
            while let Some(batch) = events.recv().await {
                if tx.send(translate_events(batch)).is_err() {
                    break;
                }
            }
            debug!("mapping watch closed");
        });
        rx
    }

    async fn save(&self, mapping: &Mapping) -> Result<(), StoreError> {
        let value = serde_json::to_vec(mapping)?;
        self.client.put(&mapping_key(&mapping.name_mapping), value).await
    }

    async fn delete(&self, mapping: &Mapping) -> Result<(), StoreError> {
        self.client.delete(&mapping_key(&mapping.name_mapping)).await
    }
}

#[derive(Default)]
struct MemoryKvState {
    data: BTreeMap<String, Vec<u8>>,
    watches: Vec<(String, mpsc::UnboundedSender<Vec<KvEvent>>)>,
}

/// In-process [`KvClient`] with etcd's delete semantics (no value on delete events).
#[derive(Default)]
pub struct MemoryKv {
    state: Mutex<MemoryKvState>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(st: &mut MemoryKvState, event: KvEvent) {
        let key = match &event {
            KvEvent::Put { key, .. } | KvEvent::Delete { key, .. } => key.clone(),
        };
        st.watches.retain(|(prefix, tx)| !key.starts_with(prefix.as_str()) || tx.send(vec![event.clone()]).is_ok());
    }

    /// Writes a raw value, bypassing mapping encoding.
    pub fn put_raw(&self, key: &str, value: Vec<u8>) {
        let mut st = self.state.lock();
        st.data.insert(key.to_string(), value.clone());
        Self::notify(&mut st, KvEvent::Put { key: key.to_string(), value });
    }
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let st = self.state.lock();
        Ok(st.data.range(prefix.to_string()..).take_while(|(k, _)| k.starts_with(prefix)).map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.put_raw(key, value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut st = self.state.lock();
        if st.data.remove(key).is_some() {
            Self::notify(&mut st, KvEvent::Delete { key: key.to_string(), value: None });
        }
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<Vec<KvEvent>>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().watches.push((prefix.to_string(), tx));
        Ok(rx)
    }
}

#[cfg(feature = "etcd")]
pub use self::remote::EtcdClient;

#[cfg(feature = "etcd")]
mod remote {
    use super::*;
    use etcd_client::{Client, EventType, GetOptions, WatchOptions};

    fn backend_err(e: etcd_client::Error) -> StoreError {
        StoreError::Backend(e.to_string())
    }

    /// [`KvClient`] backed by a real etcd cluster.
    pub struct EtcdClient {
        client: Client,
    }

    impl EtcdClient {
        pub async fn connect(endpoints: &[String]) -> Result<Self, StoreError> {
            let client = Client::connect(endpoints, None).await.map_err(backend_err)?;
            Ok(Self { client })
        }
    }

    #[async_trait]
    impl KvClient for EtcdClient {
        async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
            let mut kv = self.client.kv_client();
            let resp = kv.get(prefix, Some(GetOptions::new().with_prefix())).await.map_err(backend_err)?;
            Ok(resp.kvs().iter().map(|kv| (String::from_utf8_lossy(kv.key()).into_owned(), kv.value().to_vec())).collect())
        }

        async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
            self.client.kv_client().put(key, value, None).await.map_err(backend_err)?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.client.kv_client().delete(key, None).await.map_err(backend_err)?;
            Ok(())
        }

        async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<Vec<KvEvent>>, StoreError> {
            let (watcher, mut stream) =
                self.client.watch_client().watch(prefix, Some(WatchOptions::new().with_prefix())).await.map_err(backend_err)?;
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                // keep the watch open for as long as the stream is read
                let _watcher = watcher;
                loop {
                    let resp = match stream.message().await {
                        Ok(Some(resp)) => resp,
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "etcd watch failed");
                            break;
                        }
                    };
                    let batch: Vec<KvEvent> = resp
                        .events()
                        .iter()
                        .filter_map(|ev| {
                            let kv = ev.kv()?;
                            let key = String::from_utf8_lossy(kv.key()).into_owned();
                            Some(match ev.event_type() {
                                EventType::Put => KvEvent::Put { key, value: kv.value().to_vec() },
                                EventType::Delete => {
                                    let value = Some(kv.value().to_vec()).filter(|v| !v.is_empty());
                                    KvEvent::Delete { key, value }
                                }
                            })
                        })
                        .collect();
                    if !batch.is_empty() && tx.send(batch).is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(ns: &str, name: &str) -> NameMapping {
        NameMapping::new(
            GroupVersionKind::new("", "v1", "Secret"),
            NamespacedName::new(ns, name),
            NamespacedName::new("host", format!("{name}-x-{ns}-x-vc")),
        )
    }

    #[test]
    fn keys_round_trip() {
        let m = secret("default", "db");
        let key = mapping_key(&m);
        assert_eq!(key, "/vcluster/mappings//v1/Secret/default/db");
        let parsed = parse_mapping_key(&key).unwrap();
        assert_eq!(parsed.group_version_kind, m.group_version_kind);
        assert_eq!(parsed.virtual_name, m.virtual_name);
        assert!(parsed.host_name.is_empty());

        let cluster = NameMapping::new(
            GroupVersionKind::new("storage.k8s.io", "v1", "StorageClass"),
            NamespacedName::cluster("fast"),
            NamespacedName::cluster("fast-x-vc"),
        );
        let key = mapping_key(&cluster);
        assert_eq!(key, "/vcluster/mappings/storage.k8s.io/v1/StorageClass/fast");
        assert_eq!(parse_mapping_key(&key).unwrap().virtual_name, NamespacedName::cluster("fast"));

        for bad in ["/other/v1/Secret/a", "/vcluster/mappings/v1/Secret", "/vcluster/mappings/a/b/c/d/e/f"] {
            assert!(parse_mapping_key(bad).is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn deletes_without_value_are_reconstructed() {
        let backend = EtcdBackend::new(MemoryKv::new());
        let mut rx = backend.watch().await;
        let mapping = Mapping::new(secret("default", "db"));
        backend.save(&mapping).await.unwrap();
        backend.delete(&mapping).await.unwrap();

        let put = rx.recv().await.unwrap();
        assert_eq!(put.events[0].kind, BackendWatchEventType::Update);
        assert_eq!(put.events[0].mapping.name_mapping, mapping.name_mapping);

        let del = rx.recv().await.unwrap();
        assert!(del.err.is_none());
        assert_eq!(del.events[0].kind, BackendWatchEventType::DeleteReconstructed);
        assert_eq!(del.events[0].mapping.name_mapping.virtual_name, NamespacedName::new("default", "db"));
        assert!(backend.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_values_surface_as_errors() {
        let kv = MemoryKv::new();
        kv.put_raw("/vcluster/mappings//v1/Secret/default/broken", b"{not json".to_vec());
        let backend = EtcdBackend::new(kv);
        assert!(backend.list().await.unwrap().is_empty());

        let resp = translate_events(vec![KvEvent::Put { key: "k".into(), value: b"nope".to_vec() }]);
        assert!(resp.err.is_some());
    }
}
