//! The patch operations, applied to a YAML tree.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde_yaml::Value;
use tracing::trace;

use crate::conditions::{validate_all, validate_all_within};
use crate::node::{self, Location, Step};
use crate::path::Path;
use crate::{NameResolver, Patch, PatchError, PatchOp};

fn op_err(op: PatchOp, message: impl Into<String>) -> PatchError {
    PatchError::Op { op, message: message.into() }
}

fn set(tree: &mut Value, loc: &[Step], value: Value) {
    if let Some(n) = node::get_mut(tree, loc) {
        *n = value;
    }
}

fn resolver_for<'a>(patch: &Patch, resolver: Option<&'a dyn NameResolver>) -> Result<&'a dyn NameResolver, PatchError> {
    resolver.ok_or_else(|| op_err(patch.op, "no name resolver configured"))
}

/// Matches of `path` that pass the patch conditions, evaluated before any mutation.
fn gated(tree: &Value, path: &Path, patch: &Patch) -> Result<Vec<Location>, PatchError> {
    let mut out = Vec::new();
    for loc in node::find(tree, path) {
        if validate_all(tree, Some(&loc), &patch.conditions)? {
            out.push(loc);
        }
    }
    Ok(out)
}

/// Removes locations deepest-last-first so earlier sequence indices stay valid.
fn remove_all(tree: &mut Value, mut locs: Vec<Location>) {
    locs.sort();
    for loc in locs.iter().rev() {
        node::remove(tree, loc);
    }
}

pub fn apply_patch(
    tree: &mut Value,
    source: Option<&Value>,
    patch: &Patch,
    resolver: Option<&dyn NameResolver>,
) -> Result<(), PatchError> {
    let path = Path::parse(&patch.path)?;
    trace!(op = %patch.op, path = %patch.path, "applying patch");
    match patch.op {
        PatchOp::Replace => replace(tree, &path, patch),
        PatchOp::Remove => {
            let locs = gated(tree, &path, patch)?;
            remove_all(tree, locs);
            Ok(())
        }
        PatchOp::Add => add(tree, &path, patch),
        PatchOp::CopyFromObject => copy_from_object(tree, source, &path, patch),
        PatchOp::RewriteName => rewrite_name(tree, &path, patch, resolver_for(patch, resolver)?),
        PatchOp::RewriteLabelKey => rewrite_label_key(tree, &path, patch, resolver_for(patch, resolver)?),
        PatchOp::RewriteLabelSelector => rewrite_label_selector(tree, &path, patch, resolver_for(patch, resolver)?),
        PatchOp::RewriteLabelExpressionsSelector => {
            rewrite_label_expressions_selector(tree, &path, patch, resolver_for(patch, resolver)?)
        }
    }
}

fn replace(tree: &mut Value, path: &Path, patch: &Patch) -> Result<(), PatchError> {
    for loc in gated(tree, path, patch)? {
        set(tree, &loc, patch.value.clone());
    }
    Ok(())
}

fn add(tree: &mut Value, path: &Path, patch: &Patch) -> Result<(), PatchError> {
    let locs = node::find(tree, path);
    if locs.is_empty() {
        if validate_all(tree, None, &patch.conditions)? {
            node::create_path(tree, path, patch.value.clone())?;
        }
        return Ok(());
    }
    for loc in locs {
        if !validate_all(tree, Some(&loc), &patch.conditions)? {
            continue;
        }
        let parent_is_sequence = loc
            .split_last()
            .map(|(_, parent)| matches!(node::get(tree, parent), Some(Value::Sequence(_))))
            .unwrap_or(false);
        match node::get(tree, &loc) {
            Some(Value::Mapping(_)) if !patch.value.is_mapping() => {
                return Err(op_err(patch.op, format!("cannot add a non-mapping value to the mapping at {}", patch.path)));
            }
            Some(Value::Mapping(_)) | Some(Value::Sequence(_)) => {
                if let Some(target) = node::get_mut(tree, &loc) {
                    node::add_node(target, patch.value.clone());
                }
            }
            Some(_) if parent_is_sequence => insert_after(tree, &loc, patch.value.clone()),
            Some(_) => set(tree, &loc, patch.value.clone()),
            None => {}
        }
    }
    Ok(())
}

/// Inserts `value` after the sequence element at `loc` unless the sequence already
/// holds it.
fn insert_after(tree: &mut Value, loc: &[Step], value: Value) {
    let Some((Step::Index(i), parent)) = loc.split_last() else {
        return;
    };
    if let Some(Value::Sequence(seq)) = node::get_mut(tree, parent) {
        if !seq.contains(&value) {
            seq.insert((*i + 1).min(seq.len()), value);
        }
    }
}

fn copy_from_object(tree: &mut Value, source: Option<&Value>, path: &Path, patch: &Patch) -> Result<(), PatchError> {
    let Some(source) = source else {
        return Ok(());
    };
    let from = if patch.from_path.is_empty() { path.clone() } else { Path::parse(&patch.from_path)? };
    let from_locs = node::find(source, &from);
    if from_locs.len() > 1 {
        return Err(op_err(patch.op, format!("more than 1 match found for path {from}")));
    }
    let from_value = from_locs.first().and_then(|l| node::get(source, l)).cloned();

    let locs = node::find(tree, path);
    if locs.is_empty() {
        if let Some(v) = from_value {
            if validate_all(tree, None, &patch.conditions)? {
                node::create_path(tree, path, v)?;
            }
        }
        return Ok(());
    }

    let mut removals = Vec::new();
    for loc in locs {
        if !validate_all(tree, Some(&loc), &patch.conditions)? {
            continue;
        }
        match &from_value {
            Some(v) => set(tree, &loc, v.clone()),
            None => removals.push(loc),
        }
    }
    remove_all(tree, removals);
    Ok(())
}

/// Translates the name at `loc`; condition paths are resolved below `base`.
fn translate_at(
    tree: &mut Value,
    base: &Location,
    loc: &Location,
    patch: &Patch,
    resolver: &dyn NameResolver,
    namespace: &str,
) -> Result<(), PatchError> {
    let Some(Value::String(name)) = node::get(tree, loc) else {
        return Ok(());
    };
    if !validate_all_within(tree, base, Some(loc), &patch.conditions)? {
        return Ok(());
    }
    let translated = if namespace.is_empty() {
        resolver.translate_name(name, patch.parsed_regex.as_ref(), &patch.from_path)?
    } else {
        resolver.translate_name_with_namespace(name, namespace, patch.parsed_regex.as_ref(), &patch.from_path)?
    };
    set(tree, loc, Value::String(translated));
    Ok(())
}

/// Rewrites the name (and namespace) references held by the node at `at`.
fn rewrite_reference(tree: &mut Value, at: &Location, patch: &Patch, resolver: &dyn NameResolver) -> Result<(), PatchError> {
    let mut namespace_loc = None;
    let mut namespace = String::new();
    if !patch.namespace_path.is_empty() {
        let mut found = node::find_from(tree, at.clone(), &Path::parse(&patch.namespace_path)?);
        if found.len() > 1 {
            return Err(op_err(patch.op, "found multiple namespace references"));
        }
        if let Some(loc) = found.pop() {
            namespace = node::get(tree, &loc).and_then(Value::as_str).unwrap_or_default().to_string();
            namespace_loc = Some(loc);
        }
    }

    let names = if patch.name_path.is_empty() {
        vec![at.clone()]
    } else {
        node::find_from(tree, at.clone(), &Path::parse(&patch.name_path)?)
    };
    for loc in &names {
        translate_at(tree, at, loc, patch, resolver, &namespace)?;
    }

    if let Some(loc) = namespace_loc.filter(|_| !namespace.is_empty()) {
        if validate_all_within(tree, at, Some(&loc), &patch.conditions)? {
            set(tree, &loc, Value::String(resolver.translate_namespace_ref(&namespace)?));
        }
    }
    Ok(())
}

fn rewrite_name(tree: &mut Value, path: &Path, patch: &Patch, resolver: &dyn NameResolver) -> Result<(), PatchError> {
    for loc in node::find(tree, path) {
        match node::get(tree, &loc) {
            Some(Value::String(_)) => translate_at(tree, &Location::new(), &loc, patch, resolver, "")?,
            Some(Value::Sequence(items)) => {
                let len = items.len();
                for i in 0..len {
                    let mut item = loc.clone();
                    item.push(Step::Index(i));
                    rewrite_reference(tree, &item, patch, resolver)?;
                }
            }
            Some(Value::Mapping(_)) => rewrite_reference(tree, &loc, patch, resolver)?,
            _ => {}
        }
    }
    Ok(())
}

fn rewrite_label_key(tree: &mut Value, path: &Path, patch: &Patch, resolver: &dyn NameResolver) -> Result<(), PatchError> {
    for loc in gated(tree, path, patch)? {
        let key = match node::get(tree, &loc) {
            Some(Value::String(k)) if !k.is_empty() => k.clone(),
            _ => continue,
        };
        set(tree, &loc, Value::String(resolver.translate_label_key(&key)?));
    }
    Ok(())
}

fn rewrite_label_selector(tree: &mut Value, path: &Path, patch: &Patch, resolver: &dyn NameResolver) -> Result<(), PatchError> {
    for loc in gated(tree, path, patch)? {
        let Some(current @ Value::Mapping(_)) = node::get(tree, &loc) else {
            continue;
        };
        let selector: BTreeMap<String, String> = serde_yaml::from_value(current.clone())
            .map_err(|e| op_err(patch.op, format!("unmarshal label selector: {e}")))?;
        let translated = resolver.translate_label_selector(selector)?;
        set(tree, &loc, serde_yaml::to_value(translated)?);
    }
    Ok(())
}

fn rewrite_label_expressions_selector(
    tree: &mut Value,
    path: &Path,
    patch: &Patch,
    resolver: &dyn NameResolver,
) -> Result<(), PatchError> {
    for loc in gated(tree, path, patch)? {
        let Some(current @ Value::Mapping(_)) = node::get(tree, &loc) else {
            continue;
        };
        let selector: LabelSelector = serde_yaml::from_value(current.clone())
            .map_err(|e| op_err(patch.op, format!("unmarshal label selector: {e}")))?;
        let translated = resolver.translate_label_expressions_selector(selector)?;
        set(tree, &loc, serde_yaml::to_value(translated)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    fn run(doc: &str, patch: Patch) -> Value {
        let mut tree = yaml(doc);
        apply_patch(&mut tree, None, &patch, None).unwrap();
        tree
    }

    #[test]
    fn remove_targets_positions_not_values() {
        let out = run("list: [a, b, a, c]", Patch::new(PatchOp::Remove, "list[2]"));
        assert_eq!(out, yaml("list: [a, b, c]"));
        let out = run("list: [a, b, a, c]", Patch::new(PatchOp::Remove, "list[*]"));
        assert_eq!(out, yaml("list: []"));
    }

    #[test]
    fn add_after_scalar_in_sequence() {
        let out = run("list: [a, c]", Patch::new(PatchOp::Add, "list[0]").with_value(Value::from("b")));
        assert_eq!(out, yaml("list: [a, b, c]"));
        let again = {
            let mut t = out.clone();
            apply_patch(&mut t, None, &Patch::new(PatchOp::Add, "list[0]").with_value(Value::from("b")), None).unwrap();
            t
        };
        assert_eq!(again, out);
    }

    #[test]
    fn add_merges_into_mapping() {
        let out = run("meta: {labels: {a: '1'}}", Patch::new(PatchOp::Add, "meta.labels").with_value(yaml("{b: '2'}")));
        assert_eq!(out, yaml("meta: {labels: {a: '1', b: '2'}}"));
        let mut tree = yaml("meta: {labels: {}}");
        let err = apply_patch(&mut tree, None, &Patch::new(PatchOp::Add, "meta.labels").with_value(Value::from(1)), None);
        assert!(err.is_err());
    }

    #[test]
    fn copy_removes_when_source_is_missing() {
        let mut tree = yaml("status: {phase: Ready}");
        let source = yaml("spec: {}");
        apply_patch(&mut tree, Some(&source), &Patch::new(PatchOp::CopyFromObject, "status"), None).unwrap();
        assert_eq!(tree, yaml("{}"));
    }

    #[test]
    fn copy_rejects_ambiguous_source() {
        let mut tree = yaml("{}");
        let source = yaml("items: [{a: 1}, {a: 2}]");
        let mut patch = Patch::new(PatchOp::CopyFromObject, "a");
        patch.from_path = "items[*].a".into();
        let err = apply_patch(&mut tree, Some(&source), &patch, None).unwrap_err();
        assert!(err.to_string().contains("more than 1 match"), "{err}");
    }

    #[test]
    fn rewrite_without_resolver_fails() {
        let mut tree = yaml("name: abc");
        assert!(apply_patch(&mut tree, None, &Patch::new(PatchOp::RewriteName, "name"), None).is_err());
    }
}
