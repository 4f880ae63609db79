//! vsync core types: object identity, name mappings and translation helpers.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod translate;

pub use translate::{safe_concat_name, Translator};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidGvkKey(String),
    #[error("mapping between different group version kinds is not allowed: {host} and {virtual_}")]
    GvkMismatch { host: String, virtual_: String },
}

/// Group/Version/Kind of a Kubernetes object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// `v1/Kind` for the core group, `group/v1/Kind` otherwise.
    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn parse_key(key: &str) -> Result<Self, CoreError> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", *version, *kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new(*group, *version, *kind)),
            _ => Err(CoreError::InvalidGvkKey(key.to_string())),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: String::new(), name: name.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    /// Parses `ns/name` or `name`.
    pub fn parse(s: &str) -> Self {
        match s.split_once('/') {
            Some((ns, name)) => Self::new(ns, name),
            None => Self::cluster(s),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// A typed object reference on one side (virtual or host).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Object {
    pub gvk: GroupVersionKind,
    pub name: NamespacedName,
}

impl Object {
    pub fn new(gvk: GroupVersionKind, name: NamespacedName) -> Self {
        Self { gvk, name }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}", self.gvk, self.name)
    }
}

/// Correlation between a virtual object and its host counterpart.
///
/// A mapping with only one side set is a lookup query, not a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameMapping {
    pub group_version_kind: GroupVersionKind,
    #[serde(default)]
    pub virtual_name: NamespacedName,
    #[serde(default)]
    pub host_name: NamespacedName,
}

impl NameMapping {
    pub fn new(gvk: GroupVersionKind, virtual_name: NamespacedName, host_name: NamespacedName) -> Self {
        Self { group_version_kind: gvk, virtual_name, host_name }
    }

    /// Builds a mapping from a host and a virtual reference of the same kind.
    pub fn from_objects(host: &Object, virtual_: &Object) -> Result<Self, CoreError> {
        if host.gvk != virtual_.gvk {
            return Err(CoreError::GvkMismatch { host: host.gvk.to_string(), virtual_: virtual_.gvk.to_string() });
        }
        Ok(Self::new(host.gvk.clone(), virtual_.name.clone(), host.name.clone()))
    }

    pub fn is_empty(&self) -> bool {
        self.virtual_name.is_empty() && self.host_name.is_empty()
    }

    /// Both sides are known.
    pub fn is_complete(&self) -> bool {
        !self.virtual_name.is_empty() && !self.host_name.is_empty()
    }

    pub fn virtual_(&self) -> Object {
        Object::new(self.group_version_kind.clone(), self.virtual_name.clone())
    }

    pub fn host(&self) -> Object {
        Object::new(self.group_version_kind.clone(), self.host_name.clone())
    }
}

impl fmt::Display for NameMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{} -> {}", self.group_version_kind, self.virtual_name, self.host_name)
    }
}

/// Correlation between a virtual label and a host label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelMapping {
    #[serde(rename = "virtual")]
    pub virtual_: String,
    pub host: String,
}

impl LabelMapping {
    pub fn new(virtual_: impl Into<String>, host: impl Into<String>) -> Self {
        Self { virtual_: virtual_.into(), host: host.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.virtual_.is_empty() && self.host.is_empty()
    }
}

/// Persisted form of a [`NameMapping`] together with everything that belongs to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    #[serde(flatten)]
    pub name_mapping: NameMapping,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<NameMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<LabelMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels_cluster: Vec<LabelMapping>,
    /// Set when the in-memory state differs from the persisted one.
    #[serde(skip)]
    pub changed: bool,
}

impl Mapping {
    pub fn new(name_mapping: NameMapping) -> Self {
        Self { name_mapping, changed: true, ..Default::default() }
    }

    pub fn key(&self) -> &NameMapping {
        &self.name_mapping
    }
}

/// Per-reconcile context handed to mapping operations.
///
/// `current` is the primary mapping of the object being reconciled, if known.
#[derive(Debug, Clone, Default)]
pub struct MappingContext {
    pub current: Option<NameMapping>,
}

impl MappingContext {
    pub fn with_current(mapping: NameMapping) -> Self {
        Self { current: Some(mapping) }
    }
}
