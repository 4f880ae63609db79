//! Last objects a syncer saw on each side, used as the "old" value of the next sync.

use kube::core::DynamicObject;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use vsync_core::NamespacedName;

#[derive(Default)]
pub struct ObjectMap {
    objects: Mutex<FxHashMap<NamespacedName, DynamicObject>>,
}

impl ObjectMap {
    pub fn get(&self, name: &NamespacedName) -> Option<DynamicObject> {
        self.objects.lock().get(name).cloned()
    }

    pub fn put(&self, name: NamespacedName, obj: DynamicObject) {
        self.objects.lock().insert(name, obj);
    }

    pub fn remove(&self, name: &NamespacedName) {
        self.objects.lock().remove(name);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct ObjectCache {
    pub virtual_: ObjectMap,
    pub host: ObjectMap,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores what a finished sync left behind; absent sides are forgotten.
    pub fn update(
        &self,
        virtual_name: &NamespacedName,
        virtual_: Option<&DynamicObject>,
        host_name: &NamespacedName,
        host: Option<&DynamicObject>,
    ) {
        match virtual_ {
            Some(obj) => self.virtual_.put(virtual_name.clone(), obj.clone()),
            None => self.virtual_.remove(virtual_name),
        }
        match host {
            Some(obj) => self.host.put(host_name.clone(), obj.clone()),
            None => self.host.remove(host_name),
        }
    }
}
