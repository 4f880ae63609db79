//! vsync patches: user-configured transformations applied to objects on their way
//! between the virtual and the host cluster.
//!
//! Objects are converted to YAML trees through their JSON form, every [`Patch`] is
//! applied in order, and the tree is written back only when all of them succeeded.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use metrics::counter;
use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_yaml::Value;
use tracing::debug;

pub mod conditions;
pub mod node;
pub mod ops;
pub mod path;
pub mod regex_name;

pub use path::{child_name, parent_path, Path};
pub use regex_name::{prepare_regex, process_regex};

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("parsing path {path}: {reason}")]
    Path { path: String, reason: String },
    #[error("{op}: {message}")]
    Op { op: PatchOp, message: String },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("apply patch {op} on path {path}: {source}")]
    Apply { op: PatchOp, path: String, source: Box<PatchError> },
}

/// Errors a [`NameResolver`] returns.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("{0} is not supported in this direction")]
    NotSupported(String),
    #[error("{0}")]
    Failed(String),
}

impl ResolveError {
    pub fn is_not_supported(&self) -> bool {
        matches!(self, ResolveError::NotSupported(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PatchOp {
    RewriteName,
    RewriteLabelKey,
    RewriteLabelExpressionsSelector,
    RewriteLabelSelector,
    Replace,
    Remove,
    Add,
    CopyFromObject,
}

impl fmt::Display for PatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PatchOp::RewriteName => "rewriteName",
            PatchOp::RewriteLabelKey => "rewriteLabelKey",
            PatchOp::RewriteLabelExpressionsSelector => "rewriteLabelExpressionsSelector",
            PatchOp::RewriteLabelSelector => "rewriteLabelSelector",
            PatchOp::Replace => "replace",
            PatchOp::Remove => "remove",
            PatchOp::Add => "add",
            PatchOp::CopyFromObject => "copyFromObject",
        };
        f.write_str(s)
    }
}

/// Gate evaluated per match. Every constraint that is set must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchCondition {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equal: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_equal: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty: Option<bool>,
}

/// Kinds whose objects, named by a rewriteName rule, follow the owning object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSync {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<bool>,
    #[serde(default, rename = "configmap", skip_serializing_if = "Option::is_none")]
    pub config_map: Option<bool>,
}

/// One transformation rule, as it appears in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    pub op: PatchOp,
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace_path: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub regex: String,
    #[serde(skip)]
    pub parsed_regex: Option<Regex>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PatchCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<PatchSync>,
}

impl Patch {
    pub fn new(op: PatchOp, path: impl Into<String>) -> Self {
        Self {
            op,
            path: path.into(),
            from_path: String::new(),
            name_path: String::new(),
            namespace_path: String::new(),
            value: Value::Null,
            regex: String::new(),
            parsed_regex: None,
            conditions: Vec::new(),
            ignore: None,
            sync: None,
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = value;
        self
    }

    pub fn with_condition(mut self, condition: PatchCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Compiles `regex` into `parsed_regex`. Rules loaded from configuration must be
    /// prepared before they are applied.
    pub fn prepare(&mut self) -> Result<(), PatchError> {
        if !self.regex.is_empty() && self.parsed_regex.is_none() {
            self.parsed_regex = Some(prepare_regex(&self.regex)?);
        }
        Ok(())
    }
}

/// Translates names and labels for the rewrite operations.
///
/// One-directional resolvers return [`ResolveError::NotSupported`] for what they
/// cannot translate.
pub trait NameResolver {
    fn translate_name(&self, name: &str, regex: Option<&Regex>, path: &str) -> Result<String, ResolveError>;
    fn translate_name_with_namespace(
        &self,
        name: &str,
        namespace: &str,
        regex: Option<&Regex>,
        path: &str,
    ) -> Result<String, ResolveError>;
    fn translate_label_key(&self, key: &str) -> Result<String, ResolveError>;
    fn translate_label_expressions_selector(&self, selector: LabelSelector) -> Result<LabelSelector, ResolveError>;
    fn translate_label_selector(&self, selector: BTreeMap<String, String>) -> Result<BTreeMap<String, String>, ResolveError>;
    fn translate_namespace_ref(&self, namespace: &str) -> Result<String, ResolveError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied,
    Skipped,
}

/// Applies `patches` to `dest`, then strips every path owned by a non-ignored
/// reverse patch. `dest` is only written when every step succeeded and the tree
/// actually changed.
pub fn apply_patches<T>(
    dest: &mut T,
    source: Option<&serde_json::Value>,
    patches: &[Patch],
    reverse_patches: &[Patch],
    resolver: Option<&dyn NameResolver>,
) -> Result<PatchOutcome, PatchError>
where
    T: Serialize + DeserializeOwned,
{
    let before: Value = serde_yaml::to_value(serde_json::to_value(&*dest)?)?;
    let source: Option<Value> = source.map(serde_yaml::to_value).transpose()?;
    let mut tree = before.clone();

    for patch in patches {
        ops::apply_patch(&mut tree, source.as_ref(), patch, resolver)
            .map_err(|e| PatchError::Apply { op: patch.op, path: patch.path.clone(), source: Box::new(e) })?;
    }

    for patch in reverse_patches {
        if patch.ignore == Some(true) {
            continue;
        }
        let remove = Patch::new(PatchOp::Remove, patch.path.clone());
        ops::apply_patch(&mut tree, source.as_ref(), &remove, resolver)
            .map_err(|e| PatchError::Apply { op: PatchOp::Remove, path: patch.path.clone(), source: Box::new(e) })?;
    }

    if tree == before {
        return Ok(PatchOutcome::Skipped);
    }
    *dest = serde_json::from_value(serde_json::to_value(&tree)?)?;
    counter!("patch_applied", 1u64);
    debug!(patches = patches.len(), reverse = reverse_patches.len(), "patches applied");
    Ok(PatchOutcome::Applied)
}
