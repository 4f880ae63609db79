//! vsync merge: JSON merge patches (RFC 7386) and the bidirectional field helpers
//! syncers use to decide which side of a pair wins.

#![forbid(unsafe_code)]

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value as Json};

pub mod tree;

pub use tree::{add_path_element, join_path, Patch};

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("invalid path {0}")]
    Path(String),
    #[error("expected an object, got {0}")]
    NotAnObject(String),
    #[error("serializing object: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Computes the merge patch that turns `original` into `modified`.
pub fn create_merge_patch(original: &Json, modified: &Json) -> Json {
    match (original, modified) {
        (Json::Object(orig), Json::Object(next)) => {
            let mut patch = Map::new();
            for key in orig.keys() {
                if !next.contains_key(key) {
                    patch.insert(key.clone(), Json::Null);
                }
            }
            for (key, value) in next {
                match orig.get(key) {
                    Some(prev) if prev == value => {}
                    Some(prev @ Json::Object(_)) if value.is_object() => {
                        patch.insert(key.clone(), create_merge_patch(prev, value));
                    }
                    _ => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            Json::Object(patch)
        }
        _ => modified.clone(),
    }
}

/// Applies a merge patch in place. `null` members delete keys.
pub fn apply_merge_patch(target: &mut Json, patch: &Json) {
    let Json::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(Map::new());
    }
    if let Json::Object(map) = target {
        for (key, value) in patch {
            if value.is_null() {
                map.remove(key);
            } else {
                apply_merge_patch(map.entry(key.clone()).or_insert(Json::Null), value);
            }
        }
    }
}

/// Merge patch between two objects, keeping only metadata annotations, labels and
/// finalizers out of the metadata delta. Spec and status deltas pass through.
pub fn calculate_merge_patch<T: Serialize>(before: &T, after: &T) -> Result<Patch, MergeError> {
    let before = serde_json::to_value(before)?;
    let after = serde_json::to_value(after)?;
    let mut patch = Patch::from_json(create_merge_patch(&before, &after))?;
    patch.delete_all_except("metadata", &["annotations", "labels", "finalizers"])?;
    if patch.value("metadata").map(|m| m.as_object().map(Map::is_empty).unwrap_or(false)).unwrap_or(false) {
        patch.delete("metadata")?;
    }
    Ok(patch)
}

/// Three-way field copy between a virtual and a host object.
///
/// A virtual change wins; otherwise a host change wins; otherwise both stay.
pub fn copy_bidirectional<T: PartialEq + Clone>(virtual_old: &T, virtual_: &T, host_old: &T, host: &T) -> (T, T) {
    if virtual_ != virtual_old {
        return (virtual_.clone(), virtual_.clone());
    }
    if host != host_old {
        return (host.clone(), host.clone());
    }
    (virtual_.clone(), host.clone())
}

/// Like [`copy_bidirectional`], but the changed side's delta is merged into the
/// other side instead of replacing it, so independent additions on both sides survive.
pub fn merge_bidirectional<T>(virtual_old: &T, virtual_: &T, host_old: &T, host: &T) -> Result<(T, T), MergeError>
where
    T: Serialize + DeserializeOwned + PartialEq + Clone,
{
    if virtual_ != virtual_old {
        let delta = create_merge_patch(&serde_json::to_value(virtual_old)?, &serde_json::to_value(virtual_)?);
        let mut next_host = serde_json::to_value(host)?;
        apply_merge_patch(&mut next_host, &delta);
        return Ok((virtual_.clone(), serde_json::from_value(next_host)?));
    }
    if host != host_old {
        let delta = create_merge_patch(&serde_json::to_value(host_old)?, &serde_json::to_value(host)?);
        let mut next_virtual = serde_json::to_value(virtual_)?;
        apply_merge_patch(&mut next_virtual, &delta);
        return Ok((serde_json::from_value(next_virtual)?, host.clone()));
    }
    Ok((virtual_.clone(), host.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn merge_patch_roundtrip() {
        let a = json!({"a": 1, "b": {"c": 2, "d": 3}, "e": [1]});
        let b = json!({"a": 1, "b": {"c": 4}, "e": [1, 2], "f": "new"});
        let patch = create_merge_patch(&a, &b);
        assert_eq!(patch, json!({"b": {"c": 4, "d": null}, "e": [1, 2], "f": "new"}));
        let mut target = a.clone();
        apply_merge_patch(&mut target, &patch);
        assert_eq!(target, b);
    }

    #[test]
    fn calculate_keeps_only_metadata_allow_list() {
        let before = json!({"metadata": {"name": "a", "resourceVersion": "1", "labels": {"x": "1"}}, "spec": {"r": 1}});
        let after = json!({
            "metadata": {"name": "a", "resourceVersion": "2", "labels": {"x": "2"}, "finalizers": ["f"]},
            "spec": {"r": 2}
        });
        let patch = calculate_merge_patch(&before, &after).unwrap();
        assert_eq!(*patch.as_json(), json!({"metadata": {"labels": {"x": "2"}, "finalizers": ["f"]}, "spec": {"r": 2}}));

        let only_rv = json!({"metadata": {"name": "a", "resourceVersion": "3", "labels": {"x": "1"}}, "spec": {"r": 1}});
        assert!(calculate_merge_patch(&before, &only_rv).unwrap().is_empty());
    }

    #[test]
    fn patch_apply_onto_typed_value() {
        let mut labels: BTreeMap<String, String> = [("a".to_string(), "1".to_string())].into();
        let patch = Patch::from_json(json!({"a": null, "b": "2"})).unwrap();
        patch.apply(&mut labels).unwrap();
        assert_eq!(labels, [("b".to_string(), "2".to_string())].into());
    }

    #[test]
    fn copy_prefers_virtual_when_both_changed() {
        assert_eq!(copy_bidirectional(&"v0", &"v1", &"h0", &"h1"), ("v1", "v1"));
        assert_eq!(copy_bidirectional(&"v0", &"v0", &"h0", &"h1"), ("h1", "h1"));
        assert_eq!(copy_bidirectional(&"v0", &"v0", &"h0", &"h0"), ("v0", "h0"));
    }

    #[test]
    fn merge_keeps_independent_additions() {
        let map = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        };
        let virtual_old = map(&[("a", "1")]);
        let virtual_ = map(&[("a", "1"), ("b", "2")]);
        let host_old = map(&[("a", "1")]);
        let host = map(&[("a", "1"), ("c", "3")]);
        let (v, h) = merge_bidirectional(&virtual_old, &virtual_, &host_old, &host).unwrap();
        assert_eq!(h, map(&[("a", "1"), ("b", "2"), ("c", "3")]));
        assert_eq!(v, virtual_);

        let (v, h) = merge_bidirectional(&virtual_old, &virtual_old, &host_old, &host).unwrap();
        assert_eq!(v, map(&[("a", "1"), ("c", "3")]));
        assert_eq!(h, host);
    }
}
