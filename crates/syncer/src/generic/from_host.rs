//! Imports host objects from configured namespaces into the virtual cluster.
//!
//! Mappings are keyed by host location and point at the virtual one:
//! `host-ns/name: virtual-ns/name`, `host-ns/*: virtual-ns/*`, `/name: virtual-ns/name`
//! for the vcluster namespace, and the empty key for everything in the vcluster
//! namespace (`"": virtual-ns` or `"": virtual-ns/*`).

use std::collections::{BTreeMap, BTreeSet};
use std::slice;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::core::{DynamicObject, ObjectMeta};
use serde::{Deserialize, Serialize};
use tracing::info;
use vsync_core::translate::MARKER_LABEL;
use vsync_core::{GroupVersionKind, NamespacedName, Translator};
use vsync_kubehub::meta;
use vsync_patches::{apply_patches, Patch};

use super::prepare_all;
use super::resolver::HostToVirtual;
use crate::patcher;
use crate::{
    Mapper, ObjectExcluder, SyncContext, SyncError, SyncEvent, SyncResult, SyncStrategy, SyncToHostEvent, SyncToVirtualEvent,
    Syncer,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FromHostConfig {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub mappings: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<Patch>,
    /// Virtual `namespace/name` keys this syncer must leave alone.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub exclude: BTreeSet<String>,
}

pub struct FromHostSyncer {
    name: String,
    gvk: GroupVersionKind,
    host_to_virtual: BTreeMap<String, String>,
    virtual_to_host: BTreeMap<String, String>,
    patches: Vec<Patch>,
    exclude: BTreeSet<String>,
    translator: Arc<Translator>,
}

/// Host namespaces the mappings read from. The empty key stands for the vcluster
/// namespace.
pub fn parse_host_namespaces_from_mappings(mappings: &BTreeMap<String, String>, vcluster_namespace: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for host in mappings.keys() {
        if host.is_empty() {
            out.insert(vcluster_namespace.to_string());
        }
        if let [ns, _] = host.split('/').collect::<Vec<_>>().as_slice() {
            out.insert(ns.to_string());
        }
    }
    out
}

fn matches_host_object(host: &NamespacedName, mappings: &BTreeMap<String, String>, vcluster_namespace: &str) -> Option<NamespacedName> {
    let key = format!("{}/{}", host.namespace, host.name);
    if let Some((ns, name)) = mappings.get(&key).and_then(|v| v.split_once('/')) {
        if !name.is_empty() {
            let name = if name == "*" { host.name.as_str() } else { name };
            return Some(NamespacedName::new(ns, name));
        }
    }
    if let Some((ns, _)) = mappings.get(&format!("{}/*", host.namespace)).and_then(|v| v.split_once('/')) {
        return Some(NamespacedName::new(ns, host.name.clone()));
    }
    if host.namespace != vcluster_namespace {
        return None;
    }
    if let Some(value) = mappings.get(&format!("/{}", host.name)) {
        let (ns, name) = value.split_once('/')?;
        return Some(NamespacedName::new(ns, name));
    }
    let value = mappings.get("")?;
    match value.split_once('/') {
        Some((ns, name)) if !name.is_empty() => Some(NamespacedName::new(ns, host.name.clone())),
        Some(_) => None,
        None => Some(NamespacedName::new(value.clone(), host.name.clone())),
    }
}

fn matches_virtual_object(
    virtual_: &NamespacedName,
    virtual_to_host: &BTreeMap<String, String>,
    vcluster_namespace: &str,
) -> Option<NamespacedName> {
    if let Some(host) = virtual_to_host.get(&format!("{}/{}", virtual_.namespace, virtual_.name)) {
        if host == "*" {
            return Some(NamespacedName::new(vcluster_namespace, virtual_.name.clone()));
        }
        if let Some((ns, name)) = host.split_once('/').filter(|(_, name)| !name.is_empty()) {
            let ns = if ns.is_empty() { vcluster_namespace } else { ns };
            return Some(NamespacedName::new(ns, name));
        }
    }
    if let Some((ns, _)) = virtual_to_host.get(&format!("{}/*", virtual_.namespace)).and_then(|h| h.split_once('/')) {
        return Some(NamespacedName::new(ns, virtual_.name.clone()));
    }
    match virtual_to_host.get(&virtual_.namespace) {
        Some(host) if host.is_empty() => Some(NamespacedName::new(vcluster_namespace, virtual_.name.clone())),
        _ => None,
    }
}

impl FromHostSyncer {
    pub fn new(config: FromHostConfig, translator: Arc<Translator>) -> Result<Self, SyncError> {
        let gvk = GroupVersionKind::from_api_version(&config.api_version, &config.kind);
        let virtual_to_host = config.mappings.iter().map(|(h, v)| (v.clone(), h.clone())).collect();
        let mut patches = config.patches;
        prepare_all(&mut patches)?;
        Ok(Self {
            name: format!("from-host-{}", gvk.kind.to_lowercase()),
            gvk,
            host_to_virtual: config.mappings,
            virtual_to_host,
            patches,
            exclude: config.exclude,
            translator,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host namespaces that need watching.
    pub fn host_namespaces(&self) -> BTreeSet<String> {
        parse_host_namespaces_from_mappings(&self.host_to_virtual, &self.translator.target_namespace)
    }

    pub fn into_syncer(self) -> Syncer {
        let name = self.name.clone();
        let this = Arc::new(self);
        Syncer::single(name, this.clone()).with_excluder(this)
    }

    fn vcluster_namespace(&self) -> &str {
        &self.translator.target_namespace
    }

    /// Virtual counterpart of a host object, carrying its content.
    fn virtual_from_host(&self, ctx: &SyncContext, host: &DynamicObject, name: NamespacedName) -> Result<DynamicObject, SyncError> {
        let mut obj = DynamicObject {
            types: Some(meta::type_meta(&self.gvk)),
            metadata: ObjectMeta {
                name: Some(name.name),
                namespace: Some(name.namespace),
                labels: host.metadata.labels.clone(),
                annotations: host.metadata.annotations.clone(),
                ..Default::default()
            },
            data: host.data.clone(),
        };
        self.apply_patches(ctx, &mut obj, host)?;
        Ok(obj)
    }

    fn apply_patches(&self, ctx: &SyncContext, obj: &mut DynamicObject, host: &DynamicObject) -> Result<(), SyncError> {
        let source = serde_json::to_value(host)?;
        let host_namespace = meta::name_of(host).namespace;
        for patch in &self.patches {
            let resolver = HostToVirtual::new(ctx.mappings.as_deref(), self.gvk.clone(), host_namespace.clone());
            apply_patches(obj, Some(&source), slice::from_ref(patch), &[], Some(&resolver))?;
        }
        Ok(())
    }

    async fn ensure_namespace(&self, ctx: &SyncContext, namespace: &str) -> Result<Option<SyncResult>, SyncError> {
        let ns_gvk = GroupVersionKind::new("", "v1", "Namespace");
        match ctx.virtual_client.get(&ns_gvk, &NamespacedName::cluster(namespace)).await? {
            Some(ns) if meta::is_terminating(&ns) => Ok(Some(SyncResult::RequeueAfter(Duration::from_secs(5)))),
            Some(_) => Ok(None),
            None => {
                let ns = DynamicObject {
                    types: Some(meta::type_meta(&ns_gvk)),
                    metadata: ObjectMeta { name: Some(namespace.to_string()), ..Default::default() },
                    data: serde_json::json!({}),
                };
                match ctx.virtual_client.create(&ns_gvk, &ns).await {
                    Ok(_) => info!(namespace, "created virtual namespace"),
                    Err(e) if e.is_already_exists() => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(Some(SyncResult::Requeue))
            }
        }
    }
}

impl Mapper for FromHostSyncer {
    fn gvk(&self) -> &GroupVersionKind {
        &self.gvk
    }

    fn virtual_to_host(&self, _ctx: &SyncContext, name: &NamespacedName, _obj: Option<&DynamicObject>) -> NamespacedName {
        matches_virtual_object(name, &self.virtual_to_host, self.vcluster_namespace()).unwrap_or_default()
    }

    fn host_to_virtual(&self, _ctx: &SyncContext, name: &NamespacedName, _obj: Option<&DynamicObject>) -> NamespacedName {
        matches_host_object(name, &self.host_to_virtual, self.vcluster_namespace()).unwrap_or_default()
    }

    /// Objects synced from virtual to host carry the marker and are never imported.
    fn is_managed(&self, _ctx: &SyncContext, obj: &DynamicObject) -> Result<bool, SyncError> {
        if meta::label(obj, MARKER_LABEL).is_some() {
            return Ok(false);
        }
        Ok(matches_host_object(&meta::name_of(obj), &self.host_to_virtual, self.vcluster_namespace()).is_some())
    }
}

impl ObjectExcluder for FromHostSyncer {
    fn exclude_virtual(&self, obj: &DynamicObject) -> bool {
        let name = meta::name_of(obj);
        self.exclude.contains(&format!("{}/{}", name.namespace, name.name))
    }

    fn exclude_host(&self, _obj: &DynamicObject) -> bool {
        false
    }
}

#[async_trait]
impl SyncStrategy for FromHostSyncer {
    /// The host source is gone.
    async fn sync_to_host(&self, ctx: &SyncContext, event: SyncToHostEvent) -> Result<SyncResult, SyncError> {
        patcher::delete_virtual_object(ctx, &self.gvk, &event.virtual_, "host object was deleted").await
    }

    async fn sync(&self, ctx: &SyncContext, event: SyncEvent) -> Result<SyncResult, SyncError> {
        let mut next = event.virtual_.clone();
        next.data = event.host.data.clone();
        next.metadata.labels = event.host.metadata.labels.clone();
        next.metadata.annotations = event.host.metadata.annotations.clone();
        self.apply_patches(ctx, &mut next, &event.host)?;
        patcher::apply_object(ctx.virtual_client.as_ref(), &self.gvk, Some(&event.virtual_), &next).await?;
        Ok(SyncResult::Done)
    }

    async fn sync_to_virtual(&self, ctx: &SyncContext, event: SyncToVirtualEvent) -> Result<SyncResult, SyncError> {
        if event.virtual_old.is_some() || meta::is_terminating(&event.host) {
            return patcher::delete_host_object(ctx, &self.gvk, &event.host, "virtual object was deleted").await;
        }
        let name = self.host_to_virtual(ctx, &meta::name_of(&event.host), Some(&event.host));
        if name.is_empty() {
            return Ok(SyncResult::Done);
        }
        if let Some(result) = self.ensure_namespace(ctx, &name.namespace).await? {
            return Ok(result);
        }
        let obj = self.virtual_from_host(ctx, &event.host, name)?;
        patcher::apply_object(ctx.virtual_client.as_ref(), &self.gvk, None, &obj).await?;
        Ok(SyncResult::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mappings(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn host_namespaces_from_mappings() {
        let m = mappings(&[("my-ns/my-cm", "target2/my-cm"), ("my-ns-2/*", "target3/*")]);
        let got = parse_host_namespaces_from_mappings(&m, "vcluster");
        assert_eq!(got, BTreeSet::from(["my-ns".to_string(), "my-ns-2".to_string()]));

        let m = mappings(&[("", "default"), ("other/a", "default/a")]);
        let got = parse_host_namespaces_from_mappings(&m, "vcluster");
        assert_eq!(got, BTreeSet::from(["vcluster".to_string(), "other".to_string()]));
    }

    #[test]
    fn host_matching_order() {
        let m = mappings(&[
            ("team/config", "apps/settings"),
            ("team/*", "apps/*"),
            ("/shared", "infra/shared-copy"),
            ("", "imported"),
        ]);
        let host = |ns: &str, name: &str| matches_host_object(&NamespacedName::new(ns, name), &m, "vc-ns");
        assert_eq!(host("team", "config"), Some(NamespacedName::new("apps", "settings")));
        assert_eq!(host("team", "other"), Some(NamespacedName::new("apps", "other")));
        assert_eq!(host("vc-ns", "shared"), Some(NamespacedName::new("infra", "shared-copy")));
        assert_eq!(host("vc-ns", "anything"), Some(NamespacedName::new("imported", "anything")));
        assert_eq!(host("elsewhere", "config"), None);
    }

    #[test]
    fn virtual_matching_reverses_host_rules() {
        let m = mappings(&[("team/config", "apps/settings"), ("team/*", "apps/*"), ("", "imported")]);
        let reversed: BTreeMap<_, _> = m.iter().map(|(h, v)| (v.clone(), h.clone())).collect();
        let virt = |ns: &str, name: &str| matches_virtual_object(&NamespacedName::new(ns, name), &reversed, "vc-ns");
        assert_eq!(virt("apps", "settings"), Some(NamespacedName::new("team", "config")));
        assert_eq!(virt("apps", "x"), Some(NamespacedName::new("team", "x")));
        assert_eq!(virt("imported", "x"), Some(NamespacedName::new("vc-ns", "x")));
        assert_eq!(virt("nowhere", "x"), None);
    }
}
