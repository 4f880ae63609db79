//! Path-addressable JSON tree used to build and inspect merge patches.
//!
//! Paths are dot separated. `*` (or `[*]`) expands over every child of a map or
//! sequence, `[n]` and `.n` index sequences, and keys containing `.`, `[` or `]`
//! are written quoted: `metadata.annotations."example.com/key"` or
//! `metadata.annotations["example.com/key"]`.

use std::fmt;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value as Json};

use crate::MergeError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Any,
}

fn parse_path(path: &str) -> Result<Vec<Segment>, MergeError> {
    let err = |msg: &str| MergeError::Path(format!("{path}: {msg}"));
    let chars: Vec<char> = path.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '.' => i += 1,
            '"' | '\'' => {
                let quote = chars[i];
                let start = i + 1;
                let end = chars[start..].iter().position(|c| *c == quote).ok_or_else(|| err("unterminated quote"))? + start;
                out.push(Segment::Key(chars[start..end].iter().collect()));
                i = end + 1;
            }
            '[' => {
                let close = chars[i..].iter().position(|c| *c == ']');
                match chars.get(i + 1) {
                    Some('"') | Some('\'') => {
                        let quote = chars[i + 1];
                        let start = i + 2;
                        let end = chars[start..].iter().position(|c| *c == quote).ok_or_else(|| err("unterminated quote"))? + start;
                        if chars.get(end + 1) != Some(&']') {
                            return Err(err("expected ] after quoted key"));
                        }
                        out.push(Segment::Key(chars[start..end].iter().collect()));
                        i = end + 2;
                    }
                    _ => {
                        let close = close.ok_or_else(|| err("unterminated ["))? + i;
                        let inner: String = chars[i + 1..close].iter().collect();
                        if inner == "*" {
                            out.push(Segment::Any);
                        } else if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_digit()) {
                            out.push(Segment::Key(inner));
                        } else {
                            return Err(err("expected index, * or quoted key inside []"));
                        }
                        i = close + 1;
                    }
                }
            }
            _ => {
                let start = i;
                while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                    i += 1;
                }
                let key: String = chars[start..i].iter().collect();
                if key == "*" {
                    out.push(Segment::Any);
                } else {
                    out.push(Segment::Key(key));
                }
            }
        }
    }
    Ok(out)
}

/// Appends `key` to `path`, quoting it when it holds path syntax characters.
pub fn add_path_element(path: &str, key: &str) -> String {
    let elem = if key.contains(['.', '[', ']']) { format!("\"{key}\"") } else { key.to_string() };
    if path.is_empty() {
        elem
    } else {
        format!("{path}.{elem}")
    }
}

pub fn join_path(parts: &[&str]) -> String {
    parts.iter().fold(String::new(), |acc, p| add_path_element(&acc, p))
}

fn index_of(key: &str) -> Option<usize> {
    key.parse::<usize>().ok()
}

/// Every concrete `(path, pointer)` pair matching `segments`, existing nodes only.
fn expand(root: &Json, segments: &[Segment]) -> Vec<(String, Vec<String>)> {
    let mut out = Vec::new();
    fn walk(node: &Json, segs: &[Segment], path: String, ptr: Vec<String>, out: &mut Vec<(String, Vec<String>)>) {
        let Some((head, rest)) = segs.split_first() else {
            out.push((path, ptr));
            return;
        };
        let mut step = |key: &str, child: &Json| {
            let mut p = ptr.clone();
            p.push(key.to_string());
            walk(child, rest, add_path_element(&path, key), p, out);
        };
        match (head, node) {
            (Segment::Any, Json::Object(map)) => map.iter().for_each(|(k, v)| step(k, v)),
            (Segment::Any, Json::Array(arr)) => arr.iter().enumerate().for_each(|(i, v)| step(&i.to_string(), v)),
            (Segment::Key(k), Json::Object(map)) => {
                if let Some(v) = map.get(k) {
                    step(k, v)
                }
            }
            (Segment::Key(k), Json::Array(arr)) => {
                if let Some(v) = index_of(k).and_then(|i| arr.get(i)) {
                    step(k, v)
                }
            }
            _ => {}
        }
    }
    walk(root, segments, String::new(), Vec::new(), &mut out);
    out
}

fn get_ptr<'a>(root: &'a Json, ptr: &[String]) -> Option<&'a Json> {
    ptr.iter().try_fold(root, |node, key| match node {
        Json::Object(map) => map.get(key),
        Json::Array(arr) => index_of(key).and_then(|i| arr.get(i)),
        _ => None,
    })
}

fn get_ptr_mut<'a>(root: &'a mut Json, ptr: &[String]) -> Option<&'a mut Json> {
    ptr.iter().try_fold(root, |node, key| match node {
        Json::Object(map) => map.get_mut(key),
        Json::Array(arr) => index_of(key).and_then(move |i| arr.get_mut(i)),
        _ => None,
    })
}

fn empty_container_for(next: Option<&Segment>) -> Json {
    match next {
        Some(Segment::Key(k)) if index_of(k).is_some() => Json::Array(Vec::new()),
        _ => Json::Object(Map::new()),
    }
}

/// Sets `value` at `segs` below `node`, creating maps and growing sequences on the way.
fn set_at(node: &mut Json, segs: &[Segment], value: &Json) -> Result<(), MergeError> {
    let Some((head, rest)) = segs.split_first() else {
        *node = value.clone();
        return Ok(());
    };
    if node.is_null() {
        *node = empty_container_for(Some(head));
    }
    match (head, node) {
        (Segment::Any, Json::Object(map)) => map.values_mut().try_for_each(|v| set_at(v, rest, value)),
        (Segment::Any, Json::Array(arr)) => arr.iter_mut().try_for_each(|v| set_at(v, rest, value)),
        (Segment::Key(k), Json::Object(map)) => {
            let child = map.entry(k.clone()).or_insert_with(|| empty_container_for(rest.first()));
            set_at(child, rest, value)
        }
        (Segment::Key(k), Json::Array(arr)) => {
            let idx = index_of(k).ok_or_else(|| MergeError::Path(format!("cannot use key {k} on a sequence")))?;
            while arr.len() <= idx {
                arr.push(Json::Null);
            }
            set_at(&mut arr[idx], rest, value)
        }
        (Segment::Any, _) => Ok(()),
        (Segment::Key(k), other) => Err(MergeError::Path(format!("cannot set {k} below scalar {other}"))),
    }
}

/// A merge-patch document with path helpers. The root is always a map.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch(Json);

impl Default for Patch {
    fn default() -> Self {
        Self(Json::Object(Map::new()))
    }
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_object<T: Serialize>(obj: &T) -> Result<Self, MergeError> {
        match serde_json::to_value(obj)? {
            v @ Json::Object(_) => Ok(Self(v)),
            Json::Null => Ok(Self::default()),
            other => Err(MergeError::NotAnObject(other.to_string())),
        }
    }

    pub fn from_json(value: Json) -> Result<Self, MergeError> {
        Self::from_object(&value)
    }

    pub fn into_json(self) -> Json {
        self.0
    }

    pub fn as_json(&self) -> &Json {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.as_object().map(Map::is_empty).unwrap_or(true)
    }

    pub fn clear(&mut self) {
        self.0 = Json::Object(Map::new());
    }

    /// Calls `f` for every existing value matching `path` and stores what it returns.
    ///
    /// Returning `None` removes the value.
    pub fn translate<F>(&mut self, path: &str, mut f: F) -> Result<(), MergeError>
    where
        F: FnMut(&str, &Json) -> Result<Option<Json>, MergeError>,
    {
        let segments = parse_path(path)?;
        let mut matches = expand(&self.0, &segments);
        // Removals from sequences must run back to front.
        matches.reverse();
        for (concrete, ptr) in matches {
            let Some(current) = get_ptr(&self.0, &ptr) else { continue };
            match f(&concrete, current)? {
                Some(next) => {
                    if let Some(slot) = get_ptr_mut(&mut self.0, &ptr) {
                        *slot = next;
                    }
                }
                None => remove_ptr(&mut self.0, &ptr),
            }
        }
        Ok(())
    }

    /// Like [`Patch::translate`] for paths known at compile time.
    ///
    /// # Panics
    /// Panics when `path` does not parse or `f` fails.
    pub fn must_translate<F>(&mut self, path: &str, f: F)
    where
        F: FnMut(&str, &Json) -> Result<Option<Json>, MergeError>,
    {
        if let Err(e) = self.translate(path, f) {
            panic!("translate {path}: {e}");
        }
    }

    pub fn set(&mut self, path: &str, value: impl Into<Json>) -> Result<(), MergeError> {
        let segments = parse_path(path)?;
        set_at(&mut self.0, &segments, &value.into())
    }

    pub fn delete(&mut self, path: &str) -> Result<(), MergeError> {
        self.translate(path, |_, _| Ok(None))
    }

    /// Keeps only `keep` inside the map at `path`. An empty path means the root.
    pub fn delete_all_except(&mut self, path: &str, keep: &[&str]) -> Result<(), MergeError> {
        let segments = parse_path(path)?;
        for (_, ptr) in expand(&self.0, &segments) {
            if let Some(Json::Object(map)) = get_ptr_mut(&mut self.0, &ptr) {
                map.retain(|k, _| keep.contains(&k.as_str()));
            }
        }
        Ok(())
    }

    /// First value matching `path`.
    pub fn value(&self, path: &str) -> Option<&Json> {
        let segments = parse_path(path).ok()?;
        let (_, ptr) = expand(&self.0, &segments).into_iter().next()?;
        get_ptr(&self.0, &ptr)
    }

    pub fn value_as<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, MergeError> {
        match self.value(path) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    pub fn has(&self, path: &str) -> bool {
        self.value(path).is_some()
    }

    /// Applies this patch as a JSON merge patch onto `obj`.
    pub fn apply<T: Serialize + DeserializeOwned>(&self, obj: &mut T) -> Result<(), MergeError> {
        let mut target = serde_json::to_value(&*obj)?;
        crate::apply_merge_patch(&mut target, &self.0);
        *obj = serde_json::from_value(target)?;
        Ok(())
    }
}

fn remove_ptr(root: &mut Json, ptr: &[String]) {
    let Some((last, parent)) = ptr.split_last() else { return };
    match get_ptr_mut(root, parent) {
        Some(Json::Object(map)) => {
            map.remove(last);
        }
        Some(Json::Array(arr)) => {
            if let Some(i) = index_of(last).filter(|i| *i < arr.len()) {
                arr.remove(i);
            }
        }
        _ => {}
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(fmt::Error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch(v: Json) -> Patch {
        Patch::from_json(v).unwrap()
    }

    #[test]
    fn parses_quoted_and_bracketed_keys() {
        assert_eq!(
            parse_path(r#"metadata.annotations["a.b/c"]"#).unwrap(),
            vec![Segment::Key("metadata".into()), Segment::Key("annotations".into()), Segment::Key("a.b/c".into())]
        );
        assert_eq!(parse_path(r#"spec."x.y".*"#).unwrap()[2], Segment::Any);
        assert_eq!(parse_path("spec.rules[*][0]").unwrap()[3], Segment::Key("0".into()));
        assert!(parse_path("spec[abc]").is_err());
        assert!(parse_path(r#"spec."open"#).is_err());
    }

    #[test]
    fn translate_over_wildcards() {
        let mut p = patch(json!({"spec": {"rules": [{"host": "a"}, {"other": 1}, {"host": "b"}]}}));
        let mut seen = Vec::new();
        p.translate("spec.rules[*].host", |path, v| {
            seen.push(path.to_string());
            Ok(Some(json!(format!("{}-x", v.as_str().unwrap_or_default()))))
        })
        .unwrap();
        assert_eq!(*p.as_json(), json!({"spec": {"rules": [{"host": "a-x"}, {"other": 1}, {"host": "b-x"}]}}));
        seen.sort();
        assert_eq!(seen, vec!["spec.rules.0.host", "spec.rules.2.host"]);

        let mut p2 = patch(json!({"spec": {"rules": [{"host": "a"}]}}));
        p2.translate("spec.rules.*.host", |_, _| Ok(Some(json!("z")))).unwrap();
        assert_eq!(p2.value("spec.rules.0.host"), Some(&json!("z")));
    }

    #[test]
    fn translate_reports_quoted_paths() {
        let mut p = patch(json!({"spec": {"rules": {"test.object.other": ["v"]}}}));
        let mut paths = Vec::new();
        p.translate("spec.rules[*][*]", |path, v| {
            paths.push(path.to_string());
            Ok(Some(v.clone()))
        })
        .unwrap();
        assert_eq!(paths, vec![r#"spec.rules."test.object.other".0"#]);
        assert!(p.has(r#"spec.rules["test.object.other"]"#));
    }

    #[test]
    fn set_creates_and_grows() {
        let mut p = Patch::new();
        p.set("spec.containers[2].name", "c").unwrap();
        assert_eq!(*p.as_json(), json!({"spec": {"containers": [null, null, {"name": "c"}]}}));

        let mut p = patch(json!({"spec": {"servers": [{"hosts": ["a", "b"]}, {"hosts": ["c"]}]}}));
        p.set("spec.servers[*].hosts[*]", "x").unwrap();
        assert_eq!(*p.as_json(), json!({"spec": {"servers": [{"hosts": ["x", "x"]}, {"hosts": ["x"]}]}}));

        let mut p = patch(json!({"a": 1}));
        assert!(p.set("a.b", 2).is_err());
    }

    #[test]
    fn delete_and_delete_all_except() {
        let mut p = patch(json!({"metadata": {"name": "a", "labels": {"x": "1"}, "uid": "u"}, "spec": {"list": [1, 2, 3]}}));
        p.delete("spec.list[*]").unwrap();
        assert_eq!(p.value("spec.list"), Some(&json!([])));
        p.delete_all_except("metadata", &["labels"]).unwrap();
        assert_eq!(p.value("metadata"), Some(&json!({"labels": {"x": "1"}})));
        p.delete_all_except("", &["metadata"]).unwrap();
        assert!(!p.has("spec"));
    }

    #[test]
    fn typed_values() {
        let p = patch(json!({"spec": {"replicas": 3, "names": ["a"]}}));
        assert_eq!(p.value_as::<i64>("spec.replicas").unwrap(), Some(3));
        assert_eq!(p.value_as::<Vec<String>>("spec.names").unwrap(), Some(vec!["a".to_string()]));
        assert_eq!(p.value_as::<i64>("spec.missing").unwrap(), None);
        assert!(p.value_as::<i64>("spec.names").is_err());
    }

    #[test]
    #[should_panic]
    fn must_translate_panics_on_bad_path() {
        Patch::new().must_translate("spec[", |_, v| Ok(Some(v.clone())));
    }

    #[test]
    fn join_quotes_special_keys() {
        assert_eq!(join_path(&["metadata", "annotations", "example.com/x"]), r#"metadata.annotations."example.com/x""#);
        assert_eq!(join_path(&["a"]), "a");
    }
}
