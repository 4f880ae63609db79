use std::collections::BTreeMap;
use std::sync::Arc;

use kube::core::DynamicObject;
use serde_json::json;
use vsync_core::translate::{CONTROLLER_LABEL, NAME_ANNOTATION};
use vsync_core::{GroupVersionKind, NamespacedName, Object, Translator};
use vsync_kubehub::{meta, FakeClient, ObjectClient};
use vsync_store::{MemoryBackend, Store};
use vsync_syncer::generic::{ExportConfig, ExportSyncer, FromHostConfig, FromHostSyncer};
use vsync_syncer::{Options, Request, SyncContext, SyncController, SyncResult, Syncer, SyncerOptions};

struct Env {
    virtual_: Arc<FakeClient>,
    host: Arc<FakeClient>,
    store: Arc<Store>,
    controller: SyncController,
}

fn env(build: impl FnOnce(Arc<Translator>) -> Syncer) -> Env {
    let translator = Arc::new(Translator::new("vc", "host-ns"));
    let virtual_ = Arc::new(FakeClient::new());
    let host = Arc::new(FakeClient::new());
    let store = Arc::new(Store::new(virtual_.clone(), host.clone(), Arc::new(MemoryBackend::new())));
    let ctx = SyncContext::new(virtual_.clone(), host.clone(), translator.clone()).with_store(store.clone());
    let controller = SyncController::new(build(translator), ctx, Options::default());
    Env { virtual_, host, store, controller }
}

fn object(ns: &str, name: &str, data: serde_json::Value) -> DynamicObject {
    let mut obj = DynamicObject { types: None, metadata: Default::default(), data };
    obj.metadata.name = Some(name.into());
    obj.metadata.namespace = Some(ns.into());
    obj
}

fn certificates() -> GroupVersionKind {
    GroupVersionKind::new("cert-manager.io", "v1", "Certificate")
}

fn export_config() -> ExportConfig {
    serde_yaml::from_str(
        r#"
apiVersion: cert-manager.io/v1
kind: Certificate
patches:
  - op: rewriteName
    path: spec.secretName
    sync:
      secret: true
"#,
    )
    .unwrap()
}

#[tokio::test]
async fn export_creates_host_and_tracks_the_secret() {
    let e = env(|t| ExportSyncer::new(export_config(), t).unwrap().into_syncer());
    let gvk = certificates();
    let vname = NamespacedName::new("team-a", "web");
    let hname = NamespacedName::new("host-ns", "web-x-team-a-x-vc");
    let v = e.virtual_.insert(&gvk, object("team-a", "web", json!({"spec": {"secretName": "web-tls", "dnsNames": ["a.example.com"]}})));

    assert_eq!(e.controller.reconcile(&Request::virtual_(&vname)).await.unwrap(), SyncResult::Done);
    let host = e.host.object(&gvk, &hname).expect("host object created");
    assert_eq!(host.data["spec"]["secretName"], "web-tls-x-team-a-x-vc");
    assert_eq!(host.data["spec"]["dnsNames"], json!(["a.example.com"]));
    assert_eq!(meta::annotation(&host, NAME_ANNOTATION), Some("web"));
    assert_eq!(meta::annotation(&host, CONTROLLER_LABEL), Some("certificate/cert-manager.io/GenericExport"));
    assert_eq!(meta::annotation(&host, vsync_core::translate::UID_ANNOTATION), Some(meta::uid(&v)));

    let secret = Object::new(GroupVersionKind::new("", "v1", "Secret"), NamespacedName::new("host-ns", "web-tls-x-team-a-x-vc"));
    assert_eq!(e.store.host_to_virtual_name(&secret), Some(NamespacedName::new("team-a", "web-tls")));
    assert_eq!(e.store.virtual_to_host_name(&Object::new(gvk.clone(), vname.clone())), Some(hname.clone()));

    // Nothing changed, nothing written.
    let rv = meta::resource_version(&host).to_string();
    e.controller.reconcile(&Request::virtual_(&vname)).await.unwrap();
    assert_eq!(meta::resource_version(&e.host.object(&gvk, &hname).unwrap()), rv);
}

#[tokio::test]
async fn export_copies_status_back_and_cleans_up() {
    let e = env(|t| ExportSyncer::new(export_config(), t).unwrap().into_syncer());
    let gvk = certificates();
    let vname = NamespacedName::new("team-a", "web");
    let hname = NamespacedName::new("host-ns", "web-x-team-a-x-vc");
    e.virtual_.insert(&gvk, object("team-a", "web", json!({"spec": {"secretName": "web-tls"}})));
    e.controller.reconcile(&Request::virtual_(&vname)).await.unwrap();

    let mut host = e.host.object(&gvk, &hname).unwrap();
    host.data["status"] = json!({"conditions": [{"type": "Ready", "status": "True"}]});
    e.host.insert(&gvk, host);
    e.controller.reconcile(&Request::host(&hname)).await.unwrap();
    let synced = e.virtual_.object(&gvk, &vname).unwrap();
    assert_eq!(synced.data["status"]["conditions"][0]["type"], "Ready");

    // The host keeps its own status on the next forward sync.
    e.controller.reconcile(&Request::virtual_(&vname)).await.unwrap();
    assert_eq!(e.host.object(&gvk, &hname).unwrap().data["status"]["conditions"][0]["status"], "True");

    e.virtual_.delete(&gvk, &vname).await.unwrap();
    e.controller.reconcile(&Request::virtual_(&vname).deleted()).await.unwrap();
    assert!(!e.host.contains(&gvk, &hname));
}

#[tokio::test]
async fn export_honours_the_selector() {
    let mut config = export_config();
    config.selector = Some(vsync_syncer::generic::Selector {
        label_selector: BTreeMap::from([("export".to_string(), "true".to_string())]),
    });
    let e = env(|t| ExportSyncer::new(config, t).unwrap().into_syncer());
    let gvk = certificates();
    let vname = NamespacedName::new("team-a", "web");
    let hname = NamespacedName::new("host-ns", "web-x-team-a-x-vc");
    let mut v = e.virtual_.insert(&gvk, object("team-a", "web", json!({"spec": {"secretName": "web-tls"}})));
    e.controller.reconcile(&Request::virtual_(&vname)).await.unwrap();
    assert!(e.host.is_empty());

    meta::set_label(&mut v, "export", "true");
    let mut v = e.virtual_.insert(&gvk, v);
    e.controller.reconcile(&Request::virtual_(&vname)).await.unwrap();
    assert!(e.host.contains(&gvk, &hname));

    // Dropping the label removes the export.
    if let Some(labels) = v.metadata.labels.as_mut() {
        labels.remove("export");
    }
    e.virtual_.insert(&gvk, v);
    e.controller.reconcile(&Request::virtual_(&vname)).await.unwrap();
    assert!(!e.host.contains(&gvk, &hname));
}

#[tokio::test]
async fn export_leaves_objects_claimed_by_another_controller() {
    let e = env(|t| ExportSyncer::new(export_config(), t).unwrap().into_syncer());
    let gvk = certificates();
    let vname = NamespacedName::new("team-a", "web");
    let hname = NamespacedName::new("host-ns", "web-x-team-a-x-vc");
    let mut v = e.virtual_.insert(&gvk, object("team-a", "web", json!({"spec": {"secretName": "web-tls"}})));
    e.controller.reconcile(&Request::virtual_(&vname)).await.unwrap();
    let host = e.host.object(&gvk, &hname).expect("host object created");

    meta::set_annotation(&mut v, CONTROLLER_LABEL, "someone-else");
    e.virtual_.insert(&gvk, v);
    assert_eq!(e.controller.reconcile(&Request::virtual_(&vname)).await.unwrap(), SyncResult::Done);
    assert_eq!(e.controller.reconcile(&Request::host(&hname)).await.unwrap(), SyncResult::Done);
    let kept = e.host.object(&gvk, &hname).expect("host object kept");
    assert_eq!(meta::resource_version(&kept), meta::resource_version(&host));
}

#[tokio::test]
async fn export_caches_the_objects_it_wrote() {
    let e = env(|t| {
        ExportSyncer::new(export_config(), t)
            .unwrap()
            .into_syncer()
            .with_options(SyncerOptions { object_caching: true, ..Default::default() })
    });
    let gvk = certificates();
    let vname = NamespacedName::new("team-a", "web");
    let hname = NamespacedName::new("host-ns", "web-x-team-a-x-vc");
    e.virtual_.insert(&gvk, object("team-a", "web", json!({"spec": {"secretName": "web-tls"}})));
    e.controller.reconcile(&Request::virtual_(&vname)).await.unwrap();

    let cache = e.controller.cache().expect("caching enabled");
    let created = e.host.object(&gvk, &hname).unwrap();
    let cached = cache.host.get(&hname).expect("created host object cached");
    assert_eq!(meta::resource_version(&cached), meta::resource_version(&created));
    assert_eq!(cached.data["spec"]["secretName"], "web-tls-x-team-a-x-vc");
    let stored = e.virtual_.object(&gvk, &vname).unwrap();
    assert_eq!(meta::resource_version(&cache.virtual_.get(&vname).unwrap()), meta::resource_version(&stored));

    // A host change is synced against the cached copy without a requeue.
    let mut host = created;
    host.data["status"] = json!({"conditions": [{"type": "Ready", "status": "True"}]});
    e.host.insert(&gvk, host);
    assert_eq!(e.controller.reconcile(&Request::host(&hname)).await.unwrap(), SyncResult::Done);
    assert_eq!(e.virtual_.object(&gvk, &vname).unwrap().data["status"]["conditions"][0]["type"], "Ready");
}

fn config_maps() -> GroupVersionKind {
    GroupVersionKind::new("", "v1", "ConfigMap")
}

fn from_host() -> impl FnOnce(Arc<Translator>) -> Syncer {
    |t| {
        let config = FromHostConfig {
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            mappings: BTreeMap::from([("team/config".to_string(), "apps/settings".to_string())]),
            ..Default::default()
        };
        FromHostSyncer::new(config, t).unwrap().into_syncer()
    }
}

#[tokio::test]
async fn from_host_imports_updates_and_removes() {
    let e = env(from_host());
    let gvk = config_maps();
    let hname = NamespacedName::new("team", "config");
    let vname = NamespacedName::new("apps", "settings");
    e.host.insert(&gvk, object("team", "config", json!({"data": {"mode": "fast"}})));

    // First pass only makes room for the object.
    assert_eq!(e.controller.reconcile(&Request::host(&hname)).await.unwrap(), SyncResult::Requeue);
    assert!(e.virtual_.contains(&GroupVersionKind::new("", "v1", "Namespace"), &NamespacedName::cluster("apps")));
    assert!(!e.virtual_.contains(&gvk, &vname));

    e.controller.reconcile(&Request::host(&hname)).await.unwrap();
    assert_eq!(e.virtual_.object(&gvk, &vname).unwrap().data["data"]["mode"], "fast");

    let mut host = e.host.object(&gvk, &hname).unwrap();
    host.data["data"]["mode"] = json!("safe");
    e.host.insert(&gvk, host);
    e.controller.reconcile(&Request::host(&hname)).await.unwrap();
    assert_eq!(e.virtual_.object(&gvk, &vname).unwrap().data["data"]["mode"], "safe");

    e.host.delete(&gvk, &hname).await.unwrap();
    e.controller.reconcile(&Request::host(&hname).deleted()).await.unwrap();
    assert!(!e.virtual_.contains(&gvk, &vname));
}

#[tokio::test]
async fn from_host_ignores_unmapped_and_synced_objects() {
    let e = env(from_host());
    let gvk = config_maps();
    let other = object("team", "unrelated", json!({}));
    e.host.insert(&gvk, other.clone());
    e.controller.enqueue_host(&other, false).await;
    assert!(e.controller.queue().is_empty());

    let mut synced = object("team", "config", json!({}));
    meta::set_label(&mut synced, vsync_core::translate::MARKER_LABEL, "vc");
    e.controller.enqueue_host(&synced, false).await;
    assert!(e.controller.queue().is_empty());
}
