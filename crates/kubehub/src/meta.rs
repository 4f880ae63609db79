//! Small accessors over object metadata.

use std::collections::BTreeMap;

use kube::core::{DynamicObject, TypeMeta};
use vsync_core::{GroupVersionKind, NamespacedName, Object};

pub fn name_of(obj: &DynamicObject) -> NamespacedName {
    NamespacedName::new(
        obj.metadata.namespace.clone().unwrap_or_default(),
        obj.metadata.name.clone().unwrap_or_default(),
    )
}

pub fn object_ref(gvk: &GroupVersionKind, obj: &DynamicObject) -> Object {
    Object::new(gvk.clone(), name_of(obj))
}

pub fn gvk_of(obj: &DynamicObject) -> Option<GroupVersionKind> {
    obj.types.as_ref().map(|t| GroupVersionKind::from_api_version(&t.api_version, &t.kind))
}

pub fn type_meta(gvk: &GroupVersionKind) -> TypeMeta {
    TypeMeta { api_version: gvk.api_version(), kind: gvk.kind.clone() }
}

pub fn annotation<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata.annotations.as_ref().and_then(|a| a.get(key)).map(String::as_str)
}

pub fn label<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata.labels.as_ref().and_then(|l| l.get(key)).map(String::as_str)
}

pub fn set_annotation(obj: &mut DynamicObject, key: &str, value: impl Into<String>) {
    obj.metadata.annotations.get_or_insert_with(BTreeMap::new).insert(key.to_string(), value.into());
}

pub fn set_label(obj: &mut DynamicObject, key: &str, value: impl Into<String>) {
    obj.metadata.labels.get_or_insert_with(BTreeMap::new).insert(key.to_string(), value.into());
}

pub fn uid(obj: &DynamicObject) -> &str {
    obj.metadata.uid.as_deref().unwrap_or("")
}

pub fn resource_version(obj: &DynamicObject) -> &str {
    obj.metadata.resource_version.as_deref().unwrap_or("")
}

pub fn is_terminating(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}

/// True when `a` carries a strictly newer numeric resourceVersion than `b`.
pub fn newer_resource_version(a: &DynamicObject, b: &DynamicObject) -> bool {
    match (resource_version(a).parse::<u64>(), resource_version(b).parse::<u64>()) {
        (Ok(a), Ok(b)) => a > b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors() {
        let gvk = GroupVersionKind::new("", "v1", "ConfigMap");
        let mut obj = DynamicObject {
            types: Some(type_meta(&gvk)),
            metadata: Default::default(),
            data: serde_json::json!({}),
        };
        obj.metadata.name = Some("cm".into());
        obj.metadata.namespace = Some("default".into());
        set_annotation(&mut obj, "a", "b");
        set_label(&mut obj, "l", "v");
        assert_eq!(name_of(&obj).to_string(), "default/cm");
        assert_eq!(gvk_of(&obj), Some(gvk));
        assert_eq!(annotation(&obj, "a"), Some("b"));
        assert_eq!(label(&obj, "l"), Some("v"));
        assert!(!is_terminating(&obj));

        let mut newer = obj.clone();
        obj.metadata.resource_version = Some("5".into());
        newer.metadata.resource_version = Some("7".into());
        assert!(newer_resource_version(&newer, &obj));
        assert!(!newer_resource_version(&obj, &newer));
    }
}
