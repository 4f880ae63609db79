use serde_yaml::Value;

use crate::node::{self, Location};
use crate::path::Path;
use crate::{PatchCondition, PatchError};

fn is_empty_node(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Mapping(m) => m.is_empty(),
        Value::Sequence(s) => s.is_empty(),
        Value::Tagged(t) => is_empty_node(&t.value),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Nodes a condition looks at: `path` from `base`, else `subPath` below the match,
/// else the match itself.
fn targets<'a>(
    root: &'a Value,
    base: &Location,
    matched: Option<&Location>,
    cond: &PatchCondition,
) -> Result<Vec<&'a Value>, PatchError> {
    let locs = if !cond.path.is_empty() {
        node::find_from(root, base.clone(), &Path::parse(&cond.path)?)
    } else if let Some(loc) = matched {
        if cond.sub_path.is_empty() {
            vec![loc.clone()]
        } else {
            node::find_from(root, loc.clone(), &Path::parse(&cond.sub_path)?)
        }
    } else {
        Vec::new()
    };
    Ok(locs.iter().filter_map(|l| node::get(root, l)).collect())
}

pub fn validate_condition(root: &Value, matched: Option<&Location>, cond: &PatchCondition) -> Result<bool, PatchError> {
    validate_condition_within(root, &Location::new(), matched, cond)
}

fn validate_condition_within(
    root: &Value,
    base: &Location,
    matched: Option<&Location>,
    cond: &PatchCondition,
) -> Result<bool, PatchError> {
    let nodes = targets(root, base, matched, cond)?;

    if let Some(empty) = cond.empty {
        let all_empty = nodes.iter().all(|n| is_empty_node(n));
        if empty != all_empty {
            return Ok(false);
        }
    }
    if let Some(want) = &cond.equal {
        if !nodes.iter().any(|n| *n == want) {
            return Ok(false);
        }
    }
    if let Some(unwanted) = &cond.not_equal {
        if nodes.iter().any(|n| *n == unwanted) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// True when every condition holds for the match (or for no match, when `matched`
/// is `None`).
pub fn validate_all(root: &Value, matched: Option<&Location>, conditions: &[PatchCondition]) -> Result<bool, PatchError> {
    validate_all_within(root, &Location::new(), matched, conditions)
}

/// Like [`validate_all`] with condition paths resolved below `base` instead of the root.
pub fn validate_all_within(
    root: &Value,
    base: &Location,
    matched: Option<&Location>,
    conditions: &[PatchCondition],
) -> Result<bool, PatchError> {
    for cond in conditions {
        if !validate_condition_within(root, base, matched, cond)? {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    fn cond(path: &str) -> PatchCondition {
        PatchCondition { path: path.into(), ..Default::default() }
    }

    #[test]
    fn empty_checks() {
        let doc = yaml("test: {abc: test, blank: '', status: {}}");
        assert!(validate_condition(&doc, None, &PatchCondition { empty: Some(true), ..cond("test.missing") }).unwrap());
        assert!(validate_condition(&doc, None, &PatchCondition { empty: Some(true), ..cond("test.blank") }).unwrap());
        assert!(validate_condition(&doc, None, &PatchCondition { empty: Some(true), ..cond("test.status") }).unwrap());
        assert!(!validate_condition(&doc, None, &PatchCondition { empty: Some(true), ..cond("test.abc") }).unwrap());
        assert!(validate_condition(&doc, None, &PatchCondition { empty: Some(false), ..cond("test.abc") }).unwrap());
        assert!(!validate_condition(&doc, None, &PatchCondition { empty: Some(false), ..cond("test.missing") }).unwrap());
    }

    #[test]
    fn equality_against_structures() {
        let doc = yaml("test: {status: {test: test}}");
        let eq = PatchCondition { equal: Some(yaml("{test: test}")), ..cond("test.status") };
        assert!(validate_condition(&doc, None, &eq).unwrap());
        let ne = PatchCondition { not_equal: Some(yaml("{test: test}")), ..cond("test.status") };
        assert!(!validate_condition(&doc, None, &ne).unwrap());
        let other = PatchCondition { equal: Some(yaml("{test: test1}")), ..cond("test.status") };
        assert!(!validate_condition(&doc, None, &other).unwrap());
    }

    #[test]
    fn sub_path_is_relative_to_match() {
        let doc = yaml("items: [{name: a, ready: true}, {name: b, ready: false}]");
        let locs = node::find(&doc, &Path::parse("items[*]").unwrap());
        let c = PatchCondition { sub_path: "ready".into(), equal: Some(Value::Bool(true)), ..Default::default() };
        let gated: Vec<bool> = locs.iter().map(|l| validate_all(&doc, Some(l), &[c.clone()]).unwrap()).collect();
        assert_eq!(gated, vec![true, false]);
    }
}
