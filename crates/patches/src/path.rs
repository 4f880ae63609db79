//! Parser for the YAML path subset used by patch rules.
//!
//! Supported: optional `$` root, `.key`, `..key` (recursive descent), `[n]`, `[*]`,
//! `.*`, `['key']` / `["key"]` and filters `[?(@.a.b)]`, `[?(@.a == 'v')]`,
//! `[?(@.a != 'v')]`, `[?(@.a =~ /re/)]`.

use std::fmt;

use regex::Regex;

use crate::PatchError;

#[derive(Debug, Clone)]
pub enum FilterOp {
    Exists,
    Eq(String),
    Ne(String),
    Matches(Regex),
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub field: Vec<String>,
    pub op: FilterOp,
}

#[derive(Debug, Clone)]
pub enum Segment {
    Child(String),
    Index(usize),
    Wildcard,
    Recursive(String),
    Filter(Filter),
}

impl Segment {
    /// Name of the child this segment addresses, if it addresses exactly one.
    pub fn child_name(&self) -> Option<String> {
        match self {
            Segment::Child(k) | Segment::Recursive(k) => Some(k.clone()),
            Segment::Index(i) => Some(i.to_string()),
            Segment::Wildcard | Segment::Filter(_) => None,
        }
    }
}

/// A parsed path. `starts[i]` is the byte offset where segment `i` begins.
#[derive(Debug, Clone)]
pub struct Path {
    raw: String,
    pub segments: Vec<Segment>,
    starts: Vec<usize>,
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

struct Parser<'a> {
    raw: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

fn is_key_byte(b: u8) -> bool {
    !matches!(
        b,
        b'.' | b'[' | b']' | b'{' | b'}' | b'(' | b')' | b'\'' | b'"' | b'?' | b'@' | b'$' | b',' | b'=' | b'!' | b'~'
    )
        && !b.is_ascii_whitespace()
}

impl<'a> Parser<'a> {
    fn err(&self, reason: impl Into<String>) -> PatchError {
        PatchError::Path { path: self.raw.to_string(), reason: format!("{} at offset {}", reason.into(), self.pos) }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().map(|b| b.is_ascii_whitespace()).unwrap_or(false) {
            self.pos += 1;
        }
    }

    fn key(&mut self) -> Result<String, PatchError> {
        let start = self.pos;
        while self.peek().map(is_key_byte).unwrap_or(false) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.err(match self.peek() {
                Some(b) => format!("unexpected character {:?}", b as char),
                None => "unexpected end of path".to_string(),
            }));
        }
        Ok(self.raw[start..self.pos].to_string())
    }

    fn quoted(&mut self) -> Result<String, PatchError> {
        let quote = self.peek().ok_or_else(|| self.err("expected quote"))?;
        self.pos += 1;
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == quote {
                let out = self.raw[start..self.pos].to_string();
                self.pos += 1;
                return Ok(out);
            }
            self.pos += 1;
        }
        Err(self.err("unterminated quoted key"))
    }

    fn filter(&mut self) -> Result<Filter, PatchError> {
        self.skip_ws();
        if !self.eat(b'@') {
            return Err(self.err("filter must start with @"));
        }
        let mut field = Vec::new();
        while self.eat(b'.') {
            field.push(self.key()?);
        }
        self.skip_ws();
        let op = if self.peek() == Some(b')') {
            FilterOp::Exists
        } else {
            let rest = &self.raw[self.pos..];
            let kind = if rest.starts_with("==") {
                "=="
            } else if rest.starts_with("!=") {
                "!="
            } else if rest.starts_with("=~") {
                "=~"
            } else {
                return Err(self.err("expected ==, != or =~ in filter"));
            };
            self.pos += 2;
            self.skip_ws();
            let value = match self.peek() {
                Some(b'\'') | Some(b'"') => self.quoted()?,
                Some(b'/') => {
                    self.pos += 1;
                    let start = self.pos;
                    while self.peek().map(|b| b != b'/').unwrap_or(false) {
                        if self.peek() == Some(b'\\') {
                            self.pos += 1;
                        }
                        self.pos += 1;
                    }
                    if !self.eat(b'/') {
                        return Err(self.err("unterminated regex in filter"));
                    }
                    self.raw[start..self.pos - 1].to_string()
                }
                _ => {
                    let start = self.pos;
                    while self.peek().map(|b| b != b')' && !b.is_ascii_whitespace()).unwrap_or(false) {
                        self.pos += 1;
                    }
                    self.raw[start..self.pos].to_string()
                }
            };
            match kind {
                "==" => FilterOp::Eq(value),
                "!=" => FilterOp::Ne(value),
                _ => FilterOp::Matches(Regex::new(&value).map_err(|e| self.err(format!("invalid filter regex: {e}")))?),
            }
        };
        self.skip_ws();
        if !(self.eat(b')') && self.eat(b']')) {
            return Err(self.err("expected )] to close filter"));
        }
        Ok(Filter { field, op })
    }

    fn bracket(&mut self) -> Result<Segment, PatchError> {
        match self.peek() {
            Some(b'\'') | Some(b'"') => {
                let key = self.quoted()?;
                if !self.eat(b']') {
                    return Err(self.err("expected ] after quoted key"));
                }
                Ok(Segment::Child(key))
            }
            Some(b'*') => {
                self.pos += 1;
                if !self.eat(b']') {
                    return Err(self.err("expected ] after *"));
                }
                Ok(Segment::Wildcard)
            }
            Some(b'?') => {
                self.pos += 1;
                if !self.eat(b'(') {
                    return Err(self.err("expected ( after ?"));
                }
                Ok(Segment::Filter(self.filter()?))
            }
            Some(b) if b.is_ascii_digit() => {
                let start = self.pos;
                while self.peek().map(|b| b.is_ascii_digit()).unwrap_or(false) {
                    self.pos += 1;
                }
                let idx = self.raw[start..self.pos].parse::<usize>().map_err(|e| self.err(e.to_string()))?;
                if !self.eat(b']') {
                    return Err(self.err("expected ] after index"));
                }
                Ok(Segment::Index(idx))
            }
            _ => Err(self.err("expected index, *, filter or quoted key")),
        }
    }

    fn parse(mut self) -> Result<Path, PatchError> {
        let mut segments = Vec::new();
        let mut starts = Vec::new();
        // `$` is the root; a bare key may only open a path without it.
        let rooted = self.eat(b'$');
        let first = self.pos;
        while self.pos < self.bytes.len() {
            let start = self.pos;
            let seg = match self.peek() {
                Some(b'.') => {
                    self.pos += 1;
                    if self.eat(b'.') {
                        if self.eat(b'*') {
                            return Err(self.err("recursive wildcard is not supported"));
                        }
                        if self.eat(b'[') {
                            match self.bracket()? {
                                Segment::Child(k) => Segment::Recursive(k),
                                _ => return Err(self.err("recursive descent needs a key")),
                            }
                        } else {
                            Segment::Recursive(self.key()?)
                        }
                    } else if self.eat(b'*') {
                        Segment::Wildcard
                    } else if start == 0 && !rooted {
                        return Err(self.err("path must not start with ."));
                    } else {
                        Segment::Child(self.key()?)
                    }
                }
                Some(b'[') => {
                    self.pos += 1;
                    self.bracket()?
                }
                Some(b'*') if start == first && !rooted => {
                    self.pos += 1;
                    Segment::Wildcard
                }
                Some(_) if start == first && !rooted => Segment::Child(self.key()?),
                Some(b) => return Err(self.err(format!("unexpected character {:?}", b as char))),
                None => break,
            };
            segments.push(seg);
            starts.push(start);
        }
        Ok(Path { raw: self.raw.to_string(), segments, starts })
    }
}

impl Path {
    pub fn parse(raw: &str) -> Result<Self, PatchError> {
        let raw = raw.trim();
        Parser { raw, bytes: raw.as_bytes(), pos: 0 }.parse()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The first `n` segments as a path of their own.
    pub fn prefix(&self, n: usize) -> Path {
        let n = n.min(self.segments.len());
        let end = self.starts.get(n).copied().unwrap_or(self.raw.len());
        Path { raw: self.raw[..end].to_string(), segments: self.segments[..n].to_vec(), starts: self.starts[..n].to_vec() }
    }

    /// True when every segment addresses a single concrete child.
    pub fn is_concrete(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Child(_) | Segment::Index(_)))
    }

    /// The path without its last segment, as written.
    pub fn parent(&self) -> String {
        match self.starts.last() {
            Some(start) => self.raw[..*start].to_string(),
            None => self.raw.clone(),
        }
    }

    pub fn child_name(&self) -> Option<String> {
        self.segments.last().and_then(Segment::child_name)
    }
}

pub fn parent_path(path: &str) -> Result<String, PatchError> {
    Ok(Path::parse(path)?.parent())
}

pub fn child_name(path: &str) -> Result<String, PatchError> {
    Path::parse(path)?
        .child_name()
        .ok_or_else(|| PatchError::Path { path: path.to_string(), reason: "last segment does not name a child".into() })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(p: &str) -> Vec<String> {
        Path::parse(p)
            .unwrap()
            .segments
            .iter()
            .map(|s| match s {
                Segment::Child(k) => format!("child:{k}"),
                Segment::Index(i) => format!("index:{i}"),
                Segment::Wildcard => "*".to_string(),
                Segment::Recursive(k) => format!("..{k}"),
                Segment::Filter(_) => "filter".to_string(),
            })
            .collect()
    }

    #[test]
    fn bracket_keys_name_the_child() {
        assert_eq!(child_name("deployments['baz']").unwrap(), "baz");
        assert_eq!(child_name("deployments[\"baz\"]").unwrap(), "baz");
        assert_eq!(child_name("metadata.annotations['a.b/c']").unwrap(), "a.b/c");
    }

    #[test]
    fn parent_of_filtered_path() {
        assert_eq!(
            parent_path("$.deployments[?(@.name=~/^backend/)].parent1.child1").unwrap(),
            "$.deployments[?(@.name=~/^backend/)].parent1"
        );
        assert_eq!(parent_path("a.b[0]").unwrap(), "a.b");
        assert_eq!(parent_path("a").unwrap(), "");
    }

    #[test]
    fn segment_kinds() {
        assert_eq!(kinds("spec.containers[0].image"), vec!["child:spec", "child:containers", "index:0", "child:image"]);
        assert_eq!(kinds("$.spec.*"), vec!["child:spec", "*"]);
        assert_eq!(kinds("test..abc"), vec!["child:test", "..abc"]);
        assert_eq!(kinds("list[?(@.name == 'a')].value"), vec!["child:list", "filter", "child:value"]);
        assert_eq!(kinds("$['spec']"), vec!["child:spec"]);
        assert!(Path::parse("$").unwrap().is_empty());
    }

    #[test]
    fn invalid_paths_report_parsing_path() {
        for bad in ["name{]", "a[", "a['x", "a[?(@.x == 'y']", "a[?(name)]", "..*", ".a"] {
            let err = Path::parse(bad).unwrap_err().to_string();
            assert!(err.contains("parsing path"), "{bad}: {err}");
        }
    }

    #[test]
    fn filters_parse_operators() {
        let p = Path::parse("items[?(@.meta.name != \"x\")]").unwrap();
        match &p.segments[1] {
            Segment::Filter(Filter { field, op: FilterOp::Ne(v) }) => {
                assert_eq!(field, &vec!["meta".to_string(), "name".to_string()]);
                assert_eq!(v, "x");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(Path::parse("items[?(@.ready)]").unwrap().segments[1], Segment::Filter(Filter { op: FilterOp::Exists, .. })));
    }
}
