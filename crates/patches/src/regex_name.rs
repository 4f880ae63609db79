//! Regex-driven name rewriting: `$NAME` and `$NAMESPACE` in a pattern become named
//! captures whose spans are replaced by translated values.

use regex::Regex;
use vsync_core::NamespacedName;

use crate::PatchError;

const DNS1123_LABEL: &str = "[a-z0-9]([-a-z0-9]*[a-z0-9])?";

/// Expands `$NAMESPACE` (first, since `$NAME` is its prefix) and `$NAME` into the
/// `namespace` and `name` capture groups and compiles the result.
pub fn prepare_regex(pattern: &str) -> Result<Regex, PatchError> {
    let expanded = pattern
        .replace("$NAMESPACE", &format!("(?P<namespace>{DNS1123_LABEL})"))
        .replace("$NAME", &format!("(?P<name>{DNS1123_LABEL})"));
    Ok(Regex::new(&expanded)?)
}

/// Replaces every captured name (and namespace) span in `input` with the value
/// `translate(name, namespace)` returns. Everything outside the captures is kept
/// byte for byte.
pub fn process_regex<F>(re: &Regex, input: &str, mut translate: F) -> String
where
    F: FnMut(&str, &str) -> NamespacedName,
{
    let mut spans: Vec<(usize, usize, String)> = Vec::new();
    for caps in re.captures_iter(input) {
        let Some(name) = caps.name("name") else {
            continue;
        };
        let namespace = caps.name("namespace");
        let translated = translate(name.as_str(), namespace.map(|m| m.as_str()).unwrap_or(""));
        spans.push((name.start(), name.end(), translated.name));
        if let Some(ns) = namespace {
            spans.push((ns.start(), ns.end(), translated.namespace));
        }
    }
    spans.sort_by_key(|(start, _, _)| *start);

    let mut out = input.to_string();
    let mut offset: isize = 0;
    for (start, end, replacement) in spans {
        let from = (start as isize + offset) as usize;
        let to = (end as isize + offset) as usize;
        out.replace_range(from..to, &replacement);
        offset += replacement.len() as isize - (end - start) as isize;
    }
    out
}
