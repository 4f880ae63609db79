//! Navigation over YAML trees by location.
//!
//! A [`Location`] is the chain of map keys and sequence indices from the root to a
//! node. Matches are reported as locations so callers can mutate the tree afterwards
//! without holding references into it.

use serde_yaml::{Mapping, Value};

use crate::path::{Filter, FilterOp, Path, Segment};
use crate::PatchError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Step {
    Key(String),
    Index(usize),
}

pub type Location = Vec<Step>;

/// String form of a scalar, as filters and conditions compare it.
pub fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some("null".to_string()),
        _ => None,
    }
}

fn map_key(k: &Value) -> Option<String> {
    match k {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn children(node: &Value) -> Vec<(Step, &Value)> {
    match node {
        Value::Mapping(m) => m.iter().filter_map(|(k, v)| map_key(k).map(|k| (Step::Key(k), v))).collect(),
        Value::Sequence(s) => s.iter().enumerate().map(|(i, v)| (Step::Index(i), v)).collect(),
        Value::Tagged(t) => children(&t.value),
        _ => Vec::new(),
    }
}

fn filter_matches(node: &Value, filter: &Filter) -> bool {
    let mut cur = Some(node);
    for key in &filter.field {
        cur = cur.and_then(|n| n.as_mapping()).and_then(|m| m.get(key.as_str()));
    }
    match (&filter.op, cur) {
        (FilterOp::Exists, found) => found.is_some(),
        (FilterOp::Eq(want), Some(v)) => scalar_string(v).as_deref() == Some(want.as_str()),
        (FilterOp::Ne(want), Some(v)) => scalar_string(v).as_deref() != Some(want.as_str()),
        (FilterOp::Ne(_), None) => true,
        (FilterOp::Matches(re), Some(Value::String(s))) => re.is_match(s),
        _ => false,
    }
}

fn collect_recursive(node: &Value, key: &str, loc: &Location, out: &mut Vec<Location>) {
    if let Value::Mapping(m) = node {
        if m.get(key).is_some() {
            let mut l = loc.clone();
            l.push(Step::Key(key.to_string()));
            out.push(l);
        }
    }
    for (step, child) in children(node) {
        let mut l = loc.clone();
        l.push(step);
        collect_recursive(child, key, &l, out);
    }
}

fn step_matches(node: &Value, loc: &Location, seg: &Segment) -> Vec<Location> {
    let extend = |step: Step| {
        let mut l = loc.clone();
        l.push(step);
        l
    };
    match seg {
        Segment::Child(k) => match node {
            Value::Mapping(m) if m.get(k.as_str()).is_some() => vec![extend(Step::Key(k.clone()))],
            _ => Vec::new(),
        },
        Segment::Index(i) => match node {
            Value::Sequence(s) if *i < s.len() => vec![extend(Step::Index(*i))],
            _ => Vec::new(),
        },
        Segment::Wildcard => children(node).into_iter().map(|(step, _)| extend(step)).collect(),
        Segment::Recursive(k) => {
            let mut out = Vec::new();
            collect_recursive(node, k, loc, &mut out);
            out
        }
        Segment::Filter(f) => children(node)
            .into_iter()
            .filter(|(_, child)| filter_matches(child, f))
            .map(|(step, _)| extend(step))
            .collect(),
    }
}

/// Locations of every node matching `path` below `root`, in document order.
pub fn find(root: &Value, path: &Path) -> Vec<Location> {
    find_from(root, Vec::new(), path)
}

/// Like [`find`], starting at `start` (a location inside `root`).
pub fn find_from(root: &Value, start: Location, path: &Path) -> Vec<Location> {
    let mut current = vec![start];
    for seg in &path.segments {
        let mut next = Vec::new();
        for loc in &current {
            if let Some(node) = get(root, loc) {
                for l in step_matches(node, loc, seg) {
                    if !next.contains(&l) {
                        next.push(l);
                    }
                }
            }
        }
        current = next;
        if current.is_empty() {
            break;
        }
    }
    current
}

pub fn get<'a>(root: &'a Value, loc: &[Step]) -> Option<&'a Value> {
    loc.iter().try_fold(root, |node, step| match (step, node) {
        (Step::Key(k), Value::Mapping(m)) => m.get(k.as_str()),
        (Step::Index(i), Value::Sequence(s)) => s.get(*i),
        _ => None,
    })
}

pub fn get_mut<'a>(root: &'a mut Value, loc: &[Step]) -> Option<&'a mut Value> {
    loc.iter().try_fold(root, |node, step| match (step, node) {
        (Step::Key(k), Value::Mapping(m)) => m.get_mut(k.as_str()),
        (Step::Index(i), Value::Sequence(s)) => s.get_mut(*i),
        _ => None,
    })
}

/// Removes the node at `loc` from its parent. Returns whether something was removed.
pub fn remove(root: &mut Value, loc: &[Step]) -> bool {
    let Some((last, parent)) = loc.split_last() else {
        return false;
    };
    match (last, get_mut(root, parent)) {
        (Step::Key(k), Some(Value::Mapping(m))) => m.shift_remove(k.as_str()).is_some(),
        (Step::Index(i), Some(Value::Sequence(s))) if *i < s.len() => {
            s.remove(*i);
            true
        }
        _ => false,
    }
}

/// Wraps `value` so that it sits at the end of `segments` (maps for keys, sequences for indices).
fn wrap(value: Value, segments: &[Segment], raw: &str) -> Result<Value, PatchError> {
    segments.iter().rev().try_fold(value, |inner, seg| match seg {
        Segment::Child(k) => {
            let mut m = Mapping::new();
            m.insert(Value::String(k.clone()), inner);
            Ok(Value::Mapping(m))
        }
        Segment::Index(_) => Ok(Value::Sequence(vec![inner])),
        _ => Err(PatchError::Path { path: raw.to_string(), reason: "cannot create a path through a wildcard, filter or recursive segment".into() }),
    })
}

/// Merges `addition` into `target`: maps merge key by key, sequences gain missing
/// elements, anything else is replaced.
pub fn add_node(target: &mut Value, addition: Value) {
    match (target, addition) {
        (Value::Mapping(t), Value::Mapping(a)) => {
            for (k, v) in a {
                match t.get_mut(&k) {
                    Some(existing @ (Value::Mapping(_) | Value::Sequence(_))) => add_node(existing, v),
                    _ => {
                        t.insert(k, v);
                    }
                }
            }
        }
        (Value::Sequence(t), Value::Sequence(a)) => {
            for v in a {
                if !t.contains(&v) {
                    t.push(v);
                }
            }
        }
        (Value::Sequence(t), v) => {
            if !t.contains(&v) {
                t.push(v);
            }
        }
        (t, v) => *t = v,
    }
}

/// Creates `path` below `root` and stores `value` at its end.
///
/// The deepest existing prefix of the path is located first; the missing rest is
/// built as nested maps and sequences and merged into every prefix match.
pub fn create_path(root: &mut Value, path: &Path, value: Value) -> Result<(), PatchError> {
    let segs = &path.segments;
    for split in (0..=segs.len()).rev() {
        let prefix = path.prefix(split);
        let parents = find(root, &prefix);
        if parents.is_empty() {
            continue;
        }
        let rest = &segs[split..];
        let addition = wrap(value.clone(), rest, &path.to_string())?;
        for loc in parents {
            if let Some(node) = get_mut(root, &loc) {
                if rest.is_empty() {
                    *node = addition.clone();
                } else {
                    if !matches!(node, Value::Mapping(_) | Value::Sequence(_)) {
                        *node = Value::Mapping(Mapping::new());
                    }
                    add_node(node, addition.clone());
                }
            }
        }
        return Ok(());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    fn path(p: &str) -> Path {
        Path::parse(p).unwrap()
    }

    #[test]
    fn finds_wildcards_filters_and_recursive() {
        let doc = yaml(
            r#"
deployments:
  - name: backend-a
    parent1: {child1: x}
  - name: frontend
    parent1: {child1: y}
  - name: backend-b
    parent1: {child1: z}
"#,
        );
        let locs = find(&doc, &path("$.deployments[?(@.name=~/^backend/)].parent1.child1"));
        let vals: Vec<_> = locs.iter().map(|l| get(&doc, l).and_then(Value::as_str).unwrap()).collect();
        assert_eq!(vals, vec!["x", "z"]);

        assert_eq!(find(&doc, &path("deployments[*].name")).len(), 3);
        assert_eq!(find(&doc, &path("..child1")).len(), 3);
        assert_eq!(find(&doc, &path("deployments[?(@.name != 'frontend')]")).len(), 2);
        assert!(find(&doc, &path("deployments[7]")).is_empty());
    }

    #[test]
    fn remove_by_position() {
        let mut doc = yaml("list: [a, a, b]");
        assert!(remove(&mut doc, &[Step::Key("list".into()), Step::Index(1)]));
        assert_eq!(doc, yaml("list: [a, b]"));
        assert!(!remove(&mut doc, &[Step::Key("missing".into())]));
    }

    #[test]
    fn create_path_wraps_sequences() {
        let mut doc = yaml("test: {test3: {}}");
        create_path(&mut doc, &path("test.test2[0].test3"), Value::String("abc".into())).unwrap();
        assert_eq!(doc, yaml("test: {test3: {}, test2: [{test3: abc}]}"));

        let mut empty = Value::Null;
        create_path(&mut empty, &path("a.b"), Value::Bool(true)).unwrap();
        assert_eq!(empty, yaml("a: {b: true}"));
    }

    #[test]
    fn add_node_merges() {
        let mut t = yaml("{a: 1, l: [x]}");
        add_node(&mut t, yaml("{b: 2, l: [x, y]}"));
        assert_eq!(t, yaml("{a: 1, l: [x, y], b: 2}"));
    }
}
