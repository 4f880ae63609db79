//! Writes desired objects to a cluster and removes counterparts that lost their source.

use kube::core::DynamicObject;
use serde_json::Value;
use tracing::{debug, info};
use vsync_core::GroupVersionKind;
use vsync_kubehub::{meta, ClientError, ObjectClient};

use crate::{SyncContext, SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Created(DynamicObject),
    Updated(DynamicObject),
    Unchanged,
}

/// Server-managed fields that never count as a change.
fn comparable(obj: &DynamicObject) -> Result<Value, ClientError> {
    let mut v = serde_json::to_value(obj)?;
    if let Some(md) = v.get_mut("metadata").and_then(Value::as_object_mut) {
        for key in ["resourceVersion", "uid", "creationTimestamp", "generation", "managedFields", "deletionTimestamp"] {
            md.remove(key);
        }
    }
    Ok(v)
}

/// Creates `after` when `before` is absent, otherwise updates it unless nothing
/// but server-managed metadata differs. The update carries `before`'s resourceVersion.
pub async fn apply_object(
    client: &dyn ObjectClient,
    gvk: &GroupVersionKind,
    before: Option<&DynamicObject>,
    after: &DynamicObject,
) -> Result<ApplyOutcome, ClientError> {
    let name = meta::name_of(after);
    let Some(before) = before else {
        let created = client.create(gvk, after).await?;
        info!(kind = %gvk.kind, name = %name, "created object");
        return Ok(ApplyOutcome::Created(created));
    };

    let patch = vsync_merge::create_merge_patch(&comparable(before)?, &comparable(after)?);
    if patch.as_object().map(|m| m.is_empty()).unwrap_or(false) {
        debug!(kind = %gvk.kind, name = %name, "object unchanged");
        return Ok(ApplyOutcome::Unchanged);
    }

    let mut next = after.clone();
    next.metadata.resource_version = before.metadata.resource_version.clone();
    next.metadata.uid = before.metadata.uid.clone();
    let status_changed = patch.get("status").is_some();
    let mut updated = client.update(gvk, &next).await?;
    if status_changed && updated.data.get("status") != next.data.get("status") {
        updated = client.update_status(gvk, &next_with_version(&next, &updated)).await?;
    }
    info!(kind = %gvk.kind, name = %name, patch = %patch, "updated object");
    Ok(ApplyOutcome::Updated(updated))
}

fn next_with_version(next: &DynamicObject, updated: &DynamicObject) -> DynamicObject {
    let mut obj = next.clone();
    obj.metadata.resource_version = updated.metadata.resource_version.clone();
    obj
}

async fn delete_object(
    client: &dyn ObjectClient,
    gvk: &GroupVersionKind,
    obj: &DynamicObject,
    stage: &'static str,
    reason: &str,
) -> Result<SyncResult, SyncError> {
    let name = meta::name_of(obj);
    info!(kind = %gvk.kind, name = %name, reason, "{stage}");
    match client.delete(gvk, &name).await {
        Ok(()) => Ok(SyncResult::Done),
        Err(e) if e.is_not_found() => Ok(SyncResult::Done),
        Err(e) => Err(SyncError::stage(stage, e.into())),
    }
}

pub async fn delete_host_object(
    ctx: &SyncContext,
    gvk: &GroupVersionKind,
    obj: &DynamicObject,
    reason: &str,
) -> Result<SyncResult, SyncError> {
    delete_object(ctx.host_client.as_ref(), gvk, obj, "delete host object", reason).await
}

pub async fn delete_virtual_object(
    ctx: &SyncContext,
    gvk: &GroupVersionKind,
    obj: &DynamicObject,
    reason: &str,
) -> Result<SyncResult, SyncError> {
    delete_object(ctx.virtual_client.as_ref(), gvk, obj, "delete virtual object", reason).await
}
