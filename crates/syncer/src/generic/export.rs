//! Copies virtual objects of a configured kind into the host namespace.

use std::slice;
use std::sync::Arc;

use async_trait::async_trait;
use kube::core::{DynamicObject, ObjectMeta};
use serde::{Deserialize, Serialize};
use tracing::debug;
use vsync_core::translate::{CONTROLLER_LABEL, KIND_ANNOTATION, NAMESPACE_ANNOTATION, NAME_ANNOTATION, UID_ANNOTATION};
use vsync_core::{GroupVersionKind, NameMapping, NamespacedName, Object, Translator};
use vsync_kubehub::meta;
use vsync_patches::{apply_patches, Patch, PatchOp};

use super::resolver::{HostToVirtual, VirtualToHost};
use super::{prepare_all, referenced_kind, Selector};
use crate::patcher::{self, ApplyOutcome};
use crate::{
    kind_annotation, Mapper, SyncContext, SyncError, SyncEvent, SyncResult, SyncStrategy, SyncToHostEvent, SyncToVirtualEvent,
    Syncer,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportConfig {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<Patch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reverse_patches: Vec<Patch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Selector>,
}

pub struct ExportSyncer {
    name: String,
    gvk: GroupVersionKind,
    patches: Vec<Patch>,
    reverse_patches: Vec<Patch>,
    selector: Option<Selector>,
    translator: Arc<Translator>,
}

impl ExportSyncer {
    /// Compiles the rules. `status` is always copied back from the host unless a
    /// reverse patch already claims it.
    pub fn new(config: ExportConfig, translator: Arc<Translator>) -> Result<Self, SyncError> {
        let gvk = GroupVersionKind::from_api_version(&config.api_version, &config.kind);
        let mut patches = config.patches;
        let mut reverse_patches = config.reverse_patches;
        if !reverse_patches.iter().any(|p| p.path == "status") {
            let mut status = Patch::new(PatchOp::CopyFromObject, "status");
            status.from_path = "status".into();
            reverse_patches.insert(0, status);
        }
        prepare_all(&mut patches)?;
        prepare_all(&mut reverse_patches)?;
        let name = format!("{}/{}/GenericExport", gvk.kind.to_lowercase(), gvk.group.to_lowercase());
        Ok(Self { name, gvk, patches, reverse_patches, selector: config.selector, translator })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_syncer(self) -> Syncer {
        let name = self.name.clone();
        Syncer::single(name, Arc::new(self))
    }

    fn selected(&self, obj: &DynamicObject) -> bool {
        self.selector.as_ref().map(|s| s.matches(obj)).unwrap_or(true)
    }

    fn host_name(&self, name: &NamespacedName) -> NamespacedName {
        if name.namespace.is_empty() {
            NamespacedName::cluster(self.translator.host_name_cluster(&name.name))
        } else {
            NamespacedName::new(self.translator.target_namespace.clone(), self.translator.host_name(&name.name, &name.namespace))
        }
    }

    /// Host skeleton of a virtual object: translated identity, host labels and the
    /// annotations pointing back at the virtual object.
    fn translate_metadata(&self, virtual_: &DynamicObject) -> DynamicObject {
        let vname = meta::name_of(virtual_);
        let host_name = self.host_name(&vname);
        let mut annotations = virtual_.metadata.annotations.clone().unwrap_or_default();
        annotations.insert(NAME_ANNOTATION.into(), vname.name.clone());
        annotations.insert(NAMESPACE_ANNOTATION.into(), vname.namespace.clone());
        annotations.insert(UID_ANNOTATION.into(), meta::uid(virtual_).to_string());
        annotations.insert(KIND_ANNOTATION.into(), kind_annotation(&self.gvk));
        annotations.insert(CONTROLLER_LABEL.into(), self.name.clone());
        let labels = self.translator.host_labels(&virtual_.metadata.labels.clone().unwrap_or_default(), &vname.namespace);

        DynamicObject {
            types: Some(meta::type_meta(&self.gvk)),
            metadata: ObjectMeta {
                name: Some(host_name.name),
                namespace: (!host_name.namespace.is_empty()).then_some(host_name.namespace),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            data: virtual_.data.clone(),
        }
    }

    /// The host object the virtual one should produce, and the references its
    /// rewriteName rules asked to follow. Paths owned by reverse patches keep the
    /// value of `existing`.
    fn desired_host(
        &self,
        virtual_: &DynamicObject,
        existing: Option<&DynamicObject>,
    ) -> Result<(DynamicObject, Vec<NameMapping>), SyncError> {
        let vname = meta::name_of(virtual_);
        let source = serde_json::to_value(virtual_)?;
        let mut host = self.translate_metadata(virtual_);
        let mut references = Vec::new();
        for patch in &self.patches {
            let resolver = VirtualToHost::new(&self.translator, vname.namespace.clone());
            apply_patches(&mut host, Some(&source), slice::from_ref(patch), &[], Some(&resolver))?;
            if let Some(gvk) = referenced_kind(patch) {
                for (virtual_ref, host_ref) in resolver.into_translated() {
                    references.push(NameMapping::new(gvk.clone(), virtual_ref, host_ref));
                }
            }
        }
        apply_patches(&mut host, None, &[], &self.reverse_patches, None)?;

        if let Some(existing) = existing {
            let kept: Vec<Patch> = self
                .reverse_patches
                .iter()
                .filter(|p| p.ignore != Some(true))
                .map(|p| {
                    let mut keep = Patch::new(PatchOp::CopyFromObject, p.path.clone());
                    keep.from_path = p.path.clone();
                    keep
                })
                .collect();
            apply_patches(&mut host, Some(&serde_json::to_value(existing)?), &kept, &[], None)?;
            host.metadata.resource_version = existing.metadata.resource_version.clone();
            host.metadata.uid = existing.metadata.uid.clone();
        }
        Ok((host, references))
    }

    /// Applies the reverse patches from the host onto a copy of the virtual object.
    fn desired_virtual(&self, ctx: &SyncContext, virtual_: &DynamicObject, host: &DynamicObject) -> Result<DynamicObject, SyncError> {
        let source = serde_json::to_value(host)?;
        let host_namespace = meta::name_of(host).namespace;
        let mut next = virtual_.clone();
        for patch in self.reverse_patches.iter().filter(|p| p.ignore != Some(true)) {
            let gvk = referenced_kind(patch).unwrap_or_else(|| self.gvk.clone());
            let resolver = HostToVirtual::new(ctx.mappings.as_deref(), gvk, host_namespace.clone());
            apply_patches(&mut next, Some(&source), slice::from_ref(patch), &[], Some(&resolver))?;
        }
        Ok(next)
    }

    fn record_references(&self, ctx: &SyncContext, references: &[NameMapping]) -> Result<(), SyncError> {
        let (Some(store), Some(owner)) = (&ctx.mappings, &ctx.mapping.current) else {
            return Ok(());
        };
        if references.is_empty() {
            return Ok(());
        }
        // References only attach to an owner that is already recorded.
        store.record_reference(&ctx.mapping, owner, owner)?;
        for reference in references {
            store.record_reference(&ctx.mapping, reference, owner)?;
        }
        Ok(())
    }
}

impl Mapper for ExportSyncer {
    fn gvk(&self) -> &GroupVersionKind {
        &self.gvk
    }

    fn virtual_to_host(&self, _ctx: &SyncContext, name: &NamespacedName, _obj: Option<&DynamicObject>) -> NamespacedName {
        self.host_name(name)
    }

    fn host_to_virtual(&self, ctx: &SyncContext, name: &NamespacedName, obj: Option<&DynamicObject>) -> NamespacedName {
        if let Some(vname) = obj.and_then(|o| meta::annotation(o, NAME_ANNOTATION)).filter(|n| !n.is_empty()) {
            let ns = obj.and_then(|o| meta::annotation(o, NAMESPACE_ANNOTATION)).unwrap_or("");
            return NamespacedName::new(ns, vname);
        }
        ctx.mappings
            .as_ref()
            .and_then(|store| store.host_to_virtual_name(&Object::new(self.gvk.clone(), name.clone())))
            .unwrap_or_default()
    }

    fn is_managed(&self, _ctx: &SyncContext, obj: &DynamicObject) -> Result<bool, SyncError> {
        Ok(self.translator.is_managed(obj.metadata.labels.as_ref()))
    }
}

#[async_trait]
impl SyncStrategy for ExportSyncer {
    async fn sync_to_host(&self, ctx: &SyncContext, event: SyncToHostEvent) -> Result<SyncResult, SyncError> {
        let virtual_ = &event.virtual_;
        if meta::is_terminating(virtual_) || !self.selected(virtual_) {
            return Ok(SyncResult::Done);
        }
        let (host, references) = self.desired_host(virtual_, None)?;
        patcher::apply_object(ctx.host_client.as_ref(), &self.gvk, None, &host).await?;
        self.record_references(ctx, &references)?;
        Ok(SyncResult::Done)
    }

    async fn sync(&self, ctx: &SyncContext, event: SyncEvent) -> Result<SyncResult, SyncError> {
        let (virtual_, host) = (&event.virtual_, &event.host);
        if meta::is_terminating(virtual_) || meta::is_terminating(host) {
            if !meta::is_terminating(host) {
                return patcher::delete_host_object(ctx, &self.gvk, host, "virtual object is being deleted").await;
            }
            return Ok(SyncResult::Done);
        }
        if !self.selected(virtual_) {
            return patcher::delete_host_object(ctx, &self.gvk, host, "virtual object no longer matches the selector").await;
        }

        let next_virtual = self.desired_virtual(ctx, virtual_, host)?;
        if let ApplyOutcome::Updated(_) =
            patcher::apply_object(ctx.virtual_client.as_ref(), &self.gvk, Some(virtual_), &next_virtual).await?
        {
            debug!(syncer = %self.name, virtual_ = %meta::name_of(virtual_), "copied host changes back");
            return Ok(SyncResult::Done);
        }

        let (next_host, references) = self.desired_host(virtual_, Some(host))?;
        patcher::apply_object(ctx.host_client.as_ref(), &self.gvk, Some(host), &next_host).await?;
        self.record_references(ctx, &references)?;
        Ok(SyncResult::Done)
    }

    async fn sync_to_virtual(&self, ctx: &SyncContext, event: SyncToVirtualEvent) -> Result<SyncResult, SyncError> {
        if !self.translator.is_managed(event.host.metadata.labels.as_ref()) {
            return Ok(SyncResult::Done);
        }
        patcher::delete_host_object(ctx, &self.gvk, &event.host, "virtual object was deleted").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_loads_and_gets_status_reverse_patch() {
        let config: ExportConfig = serde_yaml::from_str(
            r#"
apiVersion: cert-manager.io/v1
kind: Certificate
patches:
  - op: rewriteName
    path: spec.secretName
    sync:
      secret: true
selector:
  labelSelector:
    export: "true"
"#,
        )
        .unwrap();
        let s = ExportSyncer::new(config, Arc::new(Translator::new("vc", "host-ns"))).unwrap();
        assert_eq!(s.name(), "certificate/cert-manager.io/GenericExport");
        assert_eq!(s.reverse_patches.len(), 1);
        assert_eq!(s.reverse_patches[0].path, "status");
        assert_eq!(s.gvk, GroupVersionKind::new("cert-manager.io", "v1", "Certificate"));
    }

    #[test]
    fn bad_regex_is_rejected() {
        let mut patch = Patch::new(PatchOp::RewriteName, "spec.ref");
        patch.regex = "(".into();
        let config = ExportConfig { api_version: "v1".into(), kind: "ConfigMap".into(), patches: vec![patch], ..Default::default() };
        assert!(ExportSyncer::new(config, Arc::new(Translator::new("vc", "host-ns"))).is_err());
    }
}
