//! vsync kubehub: object access for both clusters and watcher wiring

#![forbid(unsafe_code)]

use std::sync::Arc;

use futures::TryStreamExt;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind as KubeGvk},
    runtime::watcher::{self, Event},
    Client,
};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vsync_core::{GroupVersionKind, NamespacedName};

pub mod fake;
pub mod meta;

pub use fake::FakeClient;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },
    #[error("conflict on {kind} {name}: {message}")]
    Conflict { kind: String, name: String, message: String },
    #[error("serializing object: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Kube(kube::Error),
    #[error("{0}")]
    Other(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClientError::AlreadyExists { .. })
    }

    fn from_kube(err: kube::Error, gvk: &GroupVersionKind, name: &NamespacedName) -> Self {
        let kind = gvk.kind.clone();
        let name = name.to_string();
        match err {
            kube::Error::Api(resp) if resp.code == 404 => ClientError::NotFound { kind, name },
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                ClientError::AlreadyExists { kind, name }
            }
            kube::Error::Api(resp) if resp.code == 409 => ClientError::Conflict { kind, name, message: resp.message },
            other => ClientError::Kube(other),
        }
    }
}

/// Typed-agnostic access to one cluster.
///
/// `get` maps not-found to `None`; every other failure is an error.
#[async_trait::async_trait]
pub trait ObjectClient: Send + Sync {
    async fn get(&self, gvk: &GroupVersionKind, name: &NamespacedName) -> Result<Option<DynamicObject>, ClientError>;
    async fn create(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, ClientError>;
    async fn update(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, ClientError>;
    async fn update_status(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, ClientError>;
    async fn delete(&self, gvk: &GroupVersionKind, name: &NamespacedName) -> Result<(), ClientError>;
}

pub type SharedClient = Arc<dyn ObjectClient>;

fn erase<K: kube::Resource<DynamicType = ()>>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

/// Built-in kinds resolved without discovery.
fn builtin_scheme() -> FxHashMap<GroupVersionKind, ApiResource> {
    use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Namespace, PersistentVolumeClaim, Pod, Secret, Service, ServiceAccount};
    use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};

    let mut scheme = FxHashMap::default();
    for ar in [
        erase::<ConfigMap>(),
        erase::<Endpoints>(),
        erase::<Namespace>(),
        erase::<PersistentVolumeClaim>(),
        erase::<Pod>(),
        erase::<Secret>(),
        erase::<Service>(),
        erase::<ServiceAccount>(),
        erase::<Ingress>(),
        erase::<NetworkPolicy>(),
    ] {
        scheme.insert(GroupVersionKind::new(ar.group.clone(), ar.version.clone(), ar.kind.clone()), ar);
    }
    scheme
}

/// [`ObjectClient`] backed by a kube-rs client.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    scheme: FxHashMap<GroupVersionKind, ApiResource>,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client, scheme: builtin_scheme() }
    }

    pub async fn try_default() -> Result<Self, ClientError> {
        let client = Client::try_default().await.map_err(ClientError::Kube)?;
        Ok(Self::new(client))
    }

    /// Registers a resource (e.g. a CRD) so it resolves without guessing the plural.
    pub fn register(&mut self, ar: ApiResource) {
        self.scheme.insert(GroupVersionKind::new(ar.group.clone(), ar.version.clone(), ar.kind.clone()), ar);
    }

    pub fn api_resource(&self, gvk: &GroupVersionKind) -> ApiResource {
        match self.scheme.get(gvk) {
            Some(ar) => ar.clone(),
            None => {
                debug!(gvk = %gvk.key(), "kind not in scheme, using dynamic resource");
                ApiResource::from_gvk(&KubeGvk::gvk(&gvk.group, &gvk.version, &gvk.kind))
            }
        }
    }

    fn api(&self, gvk: &GroupVersionKind, namespace: &str) -> Api<DynamicObject> {
        let ar = self.api_resource(gvk);
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), &ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

#[async_trait::async_trait]
impl ObjectClient for KubeClient {
    async fn get(&self, gvk: &GroupVersionKind, name: &NamespacedName) -> Result<Option<DynamicObject>, ClientError> {
        let api = self.api(gvk, &name.namespace);
        api.get_opt(&name.name).await.map_err(|e| ClientError::from_kube(e, gvk, name))
    }

    async fn create(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let name = meta::name_of(obj);
        let api = self.api(gvk, &name.namespace);
        api.create(&PostParams::default(), obj).await.map_err(|e| ClientError::from_kube(e, gvk, &name))
    }

    async fn update(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let name = meta::name_of(obj);
        let api = self.api(gvk, &name.namespace);
        api.replace(&name.name, &PostParams::default(), obj)
            .await
            .map_err(|e| ClientError::from_kube(e, gvk, &name))
    }

    async fn update_status(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let name = meta::name_of(obj);
        let api = self.api(gvk, &name.namespace);
        let status = obj.data.get("status").cloned().unwrap_or(serde_json::Value::Null);
        let body = serde_json::json!({ "status": status });
        api.patch_status(&name.name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| ClientError::from_kube(e, gvk, &name))
    }

    async fn delete(&self, gvk: &GroupVersionKind, name: &NamespacedName) -> Result<(), ClientError> {
        let api = self.api(gvk, &name.namespace);
        api.delete(&name.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| ClientError::from_kube(e, gvk, name))
    }
}

/// A change observed on one cluster.
#[derive(Debug, Clone)]
pub enum ObjectEvent {
    Applied(DynamicObject),
    Deleted(DynamicObject),
}

/// Start list+watch for a kind and forward every change into `tx`.
///
/// Returns when the stream ends or the receiver is dropped.
pub async fn watch_objects(
    client: &KubeClient,
    gvk: &GroupVersionKind,
    namespace: Option<&str>,
    tx: mpsc::Sender<ObjectEvent>,
) -> Result<(), ClientError> {
    let api = client.api(gvk, namespace.unwrap_or(""));
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(gvk = %gvk.key(), ns = ?namespace, "watcher started");
    while let Some(ev) = stream
        .try_next()
        .await
        .map_err(|e| ClientError::Other(format!("watch {}: {}", gvk.key(), e)))?
    {
        let sent = match ev {
            Event::Applied(o) => tx.send(ObjectEvent::Applied(o)).await,
            Event::Deleted(o) => tx.send(ObjectEvent::Deleted(o)).await,
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                let mut res = Ok(());
                for o in list {
                    res = tx.send(ObjectEvent::Applied(o)).await;
                    if res.is_err() {
                        break;
                    }
                }
                res
            }
        };
        if sent.is_err() {
            debug!(gvk = %gvk.key(), "event receiver dropped; stopping watcher");
            return Ok(());
        }
    }
    warn!(gvk = %gvk.key(), "watcher stream ended");
    Ok(())
}
