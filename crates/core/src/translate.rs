//! Host naming and label conventions.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

pub const MARKER_LABEL: &str = "vcluster.loft.sh/managed-by";
pub const CONTROLLER_LABEL: &str = "vcluster.loft.sh/controlled-by";
pub const NAMESPACE_LABEL: &str = "vcluster.loft.sh/namespace";
pub const LABEL_PREFIX: &str = "vcluster.loft.sh/label";

pub const NAME_ANNOTATION: &str = "vcluster.loft.sh/object-name";
pub const NAMESPACE_ANNOTATION: &str = "vcluster.loft.sh/object-namespace";
pub const UID_ANNOTATION: &str = "vcluster.loft.sh/object-uid";
pub const KIND_ANNOTATION: &str = "vcluster.loft.sh/object-kind";
pub const HOST_NAME_ANNOTATION: &str = "vcluster.loft.sh/object-host-name";
pub const HOST_NAMESPACE_ANNOTATION: &str = "vcluster.loft.sh/object-host-namespace";
pub const SKIP_BACKSYNC_ANNOTATION: &str = "vcluster.loft.sh/skip-backsync";

const MAX_NAME_LEN: usize = 63;

fn sha256_hex(input: &str) -> String {
    Sha256::digest(input.as_bytes()).iter().map(|b| format!("{b:02x}")).collect()
}

/// Joins `parts` with `-`, shortening to a hashed suffix when the result exceeds 63 characters.
pub fn safe_concat_name(parts: &[&str]) -> String {
    let full = parts.join("-");
    if full.len() <= MAX_NAME_LEN {
        return full;
    }
    let digest = sha256_hex(&full);
    let head: String = full.chars().take(52).collect();
    format!("{}-{}", head, &digest[..10]).replace(".-", "-")
}

/// Naming configuration for one virtual cluster.
///
/// Constructed once at startup and passed by reference to everything that translates names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translator {
    pub vcluster_name: String,
    /// Host namespace all namespaced virtual objects are synced into.
    pub target_namespace: String,
}

impl Translator {
    pub fn new(vcluster_name: impl Into<String>, target_namespace: impl Into<String>) -> Self {
        Self { vcluster_name: vcluster_name.into(), target_namespace: target_namespace.into() }
    }

    /// Host name of a namespaced virtual object: `name-x-namespace-x-vcluster`.
    pub fn host_name(&self, name: &str, namespace: &str) -> String {
        if name.is_empty() {
            return String::new();
        }
        safe_concat_name(&[name, "x", namespace, "x", &self.vcluster_name])
    }

    /// Host name of a cluster-scoped virtual object.
    pub fn host_name_cluster(&self, name: &str) -> String {
        if name.is_empty() {
            return String::new();
        }
        safe_concat_name(&["vcluster", name, "x", &self.target_namespace, "x", &self.vcluster_name])
    }

    /// Label key a virtual label is stored under on the host side.
    pub fn host_label_key(&self, key: &str) -> String {
        if key == MARKER_LABEL || key == NAMESPACE_LABEL || key == CONTROLLER_LABEL {
            return key.to_string();
        }
        let digest = sha256_hex(key);
        format!("{}-{}", LABEL_PREFIX, safe_concat_name(&[&self.vcluster_name, "x", &digest[..10]]))
    }

    pub fn marker(&self) -> &str {
        &self.vcluster_name
    }

    /// Host labels for a virtual object's labels, plus marker and namespace labels.
    pub fn host_labels(&self, labels: &BTreeMap<String, String>, virtual_namespace: &str) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (k, v) in labels {
            if k == MARKER_LABEL || k == NAMESPACE_LABEL {
                continue;
            }
            out.insert(self.host_label_key(k), v.clone());
        }
        out.insert(MARKER_LABEL.to_string(), self.marker().to_string());
        if !virtual_namespace.is_empty() {
            out.insert(NAMESPACE_LABEL.to_string(), virtual_namespace.to_string());
        }
        out
    }

    pub fn is_managed(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        labels.and_then(|l| l.get(MARKER_LABEL)).map(|m| m == self.marker()).unwrap_or(false)
    }
}
