//! Work items. Host-origin and delete requests share the queue with plain virtual
//! requests by prefixing the namespace.

use std::fmt;

use vsync_core::NamespacedName;

pub const HOST_PREFIX: &str = "host#";
pub const DELETE_PREFIX: &str = "delete#";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Request {
    pub namespace: String,
    pub name: String,
}

/// A request with its prefixes taken apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub name: NamespacedName,
    pub from_host: bool,
    pub delete: bool,
}

impl Request {
    pub fn virtual_(name: &NamespacedName) -> Self {
        Self { namespace: name.namespace.clone(), name: name.name.clone() }
    }

    pub fn host(name: &NamespacedName) -> Self {
        Self { namespace: format!("{HOST_PREFIX}{}", name.namespace), name: name.name.clone() }
    }

    /// Marks the named side as gone. Applied on top of [`Request::virtual_`] or
    /// [`Request::host`], which yields `delete#host#ns` for host deletions.
    pub fn deleted(self) -> Self {
        Self { namespace: format!("{DELETE_PREFIX}{}", self.namespace), name: self.name }
    }

    pub fn decode(&self) -> Decoded {
        let (delete, rest) = match self.namespace.strip_prefix(DELETE_PREFIX) {
            Some(rest) => (true, rest),
            None => (false, self.namespace.as_str()),
        };
        let (from_host, ns) = match rest.strip_prefix(HOST_PREFIX) {
            Some(ns) => (true, ns),
            None => (false, rest),
        };
        Decoded { name: NamespacedName::new(ns, self.name.clone()), from_host, delete }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}
