//! Strategies driven by configuration instead of code.

pub mod export;
pub mod from_host;
pub mod resolver;

use std::collections::BTreeMap;

use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use vsync_core::GroupVersionKind;
use vsync_patches::Patch;

pub use export::{ExportConfig, ExportSyncer};
pub use from_host::{parse_host_namespaces_from_mappings, FromHostConfig, FromHostSyncer};
pub use resolver::{HostToVirtual, VirtualToHost};

/// Restricts a generic syncer to objects carrying all of these labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(default)]
    pub label_selector: BTreeMap<String, String>,
}

impl Selector {
    pub fn matches(&self, obj: &DynamicObject) -> bool {
        let labels = obj.metadata.labels.as_ref();
        self.label_selector
            .iter()
            .all(|(k, v)| labels.and_then(|l| l.get(k)).is_some_and(|actual| actual == v))
    }
}

/// Kind of the objects a rewriteName rule names when it asks for them to follow
/// the owner.
pub(crate) fn referenced_kind(patch: &Patch) -> Option<GroupVersionKind> {
    let sync = patch.sync?;
    if sync.secret == Some(true) {
        Some(GroupVersionKind::new("", "v1", "Secret"))
    } else if sync.config_map == Some(true) {
        Some(GroupVersionKind::new("", "v1", "ConfigMap"))
    } else {
        None
    }
}

pub(crate) fn prepare_all(patches: &mut [Patch]) -> Result<(), vsync_patches::PatchError> {
    patches.iter_mut().try_for_each(Patch::prepare)
}
