//! In-memory [`ObjectClient`] used by tests and offline tooling.

use kube::core::DynamicObject;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use vsync_core::{GroupVersionKind, NamespacedName};

use crate::{meta, ClientError, ObjectClient};

type Key = (GroupVersionKind, NamespacedName);

#[derive(Default)]
struct State {
    objects: FxHashMap<Key, DynamicObject>,
    failing: FxHashSet<Key>,
    revision: u64,
}

/// Keeps objects in a map and behaves like an API server for the calls the engine makes:
/// uids and resourceVersions are assigned, stale updates conflict.
#[derive(Default)]
pub struct FakeClient {
    state: Mutex<State>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object as-is, filling uid and resourceVersion when missing.
    pub fn insert(&self, gvk: &GroupVersionKind, mut obj: DynamicObject) -> DynamicObject {
        let mut st = self.state.lock();
        st.revision += 1;
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        obj.metadata.resource_version = Some(st.revision.to_string());
        if obj.types.is_none() {
            obj.types = Some(meta::type_meta(gvk));
        }
        st.objects.insert((gvk.clone(), meta::name_of(&obj)), obj.clone());
        obj
    }

    pub fn object(&self, gvk: &GroupVersionKind, name: &NamespacedName) -> Option<DynamicObject> {
        self.state.lock().objects.get(&(gvk.clone(), name.clone())).cloned()
    }

    pub fn contains(&self, gvk: &GroupVersionKind, name: &NamespacedName) -> bool {
        self.state.lock().objects.contains_key(&(gvk.clone(), name.clone()))
    }

    pub fn len(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gets for this object fail with a transient error until cleared.
    pub fn fail_gets(&self, gvk: &GroupVersionKind, name: &NamespacedName, fail: bool) {
        let mut st = self.state.lock();
        let key = (gvk.clone(), name.clone());
        if fail {
            st.failing.insert(key);
        } else {
            st.failing.remove(&key);
        }
    }

    /// Sets a deletion timestamp, as if the object had finalizers pending.
    pub fn mark_terminating(&self, gvk: &GroupVersionKind, name: &NamespacedName) -> Result<(), ClientError> {
        let ts = serde_json::from_value(serde_json::Value::String("2024-01-01T00:00:00Z".into()))?;
        let mut st = self.state.lock();
        match st.objects.get_mut(&(gvk.clone(), name.clone())) {
            Some(obj) => {
                obj.metadata.deletion_timestamp = Some(ts);
                Ok(())
            }
            None => Err(ClientError::NotFound { kind: gvk.kind.clone(), name: name.to_string() }),
        }
    }
}

#[async_trait::async_trait]
impl ObjectClient for FakeClient {
    async fn get(&self, gvk: &GroupVersionKind, name: &NamespacedName) -> Result<Option<DynamicObject>, ClientError> {
        let st = self.state.lock();
        let key = (gvk.clone(), name.clone());
        if st.failing.contains(&key) {
            return Err(ClientError::Other(format!("injected failure reading {} {}", gvk.kind, name)));
        }
        Ok(st.objects.get(&key).cloned())
    }

    async fn create(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let name = meta::name_of(obj);
        if self.contains(gvk, &name) {
            return Err(ClientError::AlreadyExists { kind: gvk.kind.clone(), name: name.to_string() });
        }
        let mut obj = obj.clone();
        obj.metadata.uid = None;
        Ok(self.insert(gvk, obj))
    }

    async fn update(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let name = meta::name_of(obj);
        let current = self
            .object(gvk, &name)
            .ok_or_else(|| ClientError::NotFound { kind: gvk.kind.clone(), name: name.to_string() })?;
        if let Some(rv) = obj.metadata.resource_version.as_deref() {
            if rv != meta::resource_version(&current) {
                return Err(ClientError::Conflict {
                    kind: gvk.kind.clone(),
                    name: name.to_string(),
                    message: "the object has been modified; please apply your changes to the latest version".into(),
                });
            }
        }
        let mut next = obj.clone();
        next.metadata.uid = current.metadata.uid.clone();
        next.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
        Ok(self.insert(gvk, next))
    }

    async fn update_status(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let name = meta::name_of(obj);
        let mut current = self
            .object(gvk, &name)
            .ok_or_else(|| ClientError::NotFound { kind: gvk.kind.clone(), name: name.to_string() })?;
        match obj.data.get("status") {
            Some(status) => current.data["status"] = status.clone(),
            None => {
                if let Some(map) = current.data.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        Ok(self.insert(gvk, current))
    }

    async fn delete(&self, gvk: &GroupVersionKind, name: &NamespacedName) -> Result<(), ClientError> {
        match self.state.lock().objects.remove(&(gvk.clone(), name.clone())) {
            Some(_) => Ok(()),
            None => Err(ClientError::NotFound { kind: gvk.kind.clone(), name: name.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(name: &str) -> DynamicObject {
        let mut obj = DynamicObject { types: None, metadata: Default::default(), data: serde_json::json!({"data": {"a": "1"}}) };
        obj.metadata.name = Some(name.into());
        obj.metadata.namespace = Some("default".into());
        obj
    }

    #[tokio::test]
    async fn create_update_delete() {
        let gvk = GroupVersionKind::new("", "v1", "ConfigMap");
        let c = FakeClient::new();
        let created = c.create(&gvk, &cm("a")).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert!(c.create(&gvk, &cm("a")).await.unwrap_err().is_already_exists());

        let mut stale = created.clone();
        let mut fresh = created.clone();
        fresh.data["data"]["a"] = "2".into();
        c.update(&gvk, &fresh).await.unwrap();
        stale.data["data"]["a"] = "3".into();
        assert!(c.update(&gvk, &stale).await.unwrap_err().is_conflict());

        let name = NamespacedName::new("default", "a");
        assert_eq!(c.get(&gvk, &name).await.unwrap().unwrap().data["data"]["a"], "2");
        c.delete(&gvk, &name).await.unwrap();
        assert!(c.get(&gvk, &name).await.unwrap().is_none());
        assert!(c.delete(&gvk, &name).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn injected_failures() {
        let gvk = GroupVersionKind::new("", "v1", "ConfigMap");
        let c = FakeClient::new();
        let name = NamespacedName::new("default", "a");
        c.fail_gets(&gvk, &name, true);
        assert!(c.get(&gvk, &name).await.is_err());
        c.fail_gets(&gvk, &name, false);
        assert!(c.get(&gvk, &name).await.unwrap().is_none());
    }
}
