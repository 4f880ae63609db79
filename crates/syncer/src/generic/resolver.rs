//! Name resolvers for the two directions of a generic syncer.

use std::cell::RefCell;
use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use regex::Regex;
use vsync_core::{GroupVersionKind, NamespacedName, Object, Translator};
use vsync_patches::{process_regex, NameResolver, ResolveError};
use vsync_store::Store;

/// Translates names found in a virtual object into host names and remembers every
/// translation it made.
pub struct VirtualToHost<'a> {
    translator: &'a Translator,
    namespace: String,
    translated: RefCell<Vec<(NamespacedName, NamespacedName)>>,
}

impl<'a> VirtualToHost<'a> {
    /// `namespace` is the virtual namespace names without one are resolved in.
    pub fn new(translator: &'a Translator, namespace: impl Into<String>) -> Self {
        Self { translator, namespace: namespace.into(), translated: RefCell::new(Vec::new()) }
    }

    /// Pairs of (virtual, host) names translated so far.
    pub fn into_translated(self) -> Vec<(NamespacedName, NamespacedName)> {
        self.translated.into_inner()
    }

    fn host(&self, name: &str, namespace: &str) -> NamespacedName {
        let host = NamespacedName::new(
            self.translator.target_namespace.clone(),
            self.translator.host_name(name, namespace),
        );
        self.translated.borrow_mut().push((NamespacedName::new(namespace, name), host.clone()));
        host
    }
}

impl NameResolver for VirtualToHost<'_> {
    fn translate_name(&self, name: &str, regex: Option<&Regex>, path: &str) -> Result<String, ResolveError> {
        self.translate_name_with_namespace(name, &self.namespace, regex, path)
    }

    fn translate_name_with_namespace(
        &self,
        name: &str,
        namespace: &str,
        regex: Option<&Regex>,
        _path: &str,
    ) -> Result<String, ResolveError> {
        match regex {
            Some(re) => Ok(process_regex(re, name, |n, captured| {
                let ns = if captured.is_empty() { namespace } else { captured };
                self.host(n, ns)
            })),
            None => Ok(self.host(name, namespace).name),
        }
    }

    fn translate_label_key(&self, key: &str) -> Result<String, ResolveError> {
        Ok(self.translator.host_label_key(key))
    }

    fn translate_label_expressions_selector(&self, mut selector: LabelSelector) -> Result<LabelSelector, ResolveError> {
        let labels = selector.match_labels.take().unwrap_or_default();
        selector.match_labels = Some(self.translator.host_labels(&labels, &self.namespace));
        if let Some(exprs) = selector.match_expressions.as_mut() {
            for expr in exprs {
                expr.key = self.translator.host_label_key(&expr.key);
            }
        }
        Ok(selector)
    }

    fn translate_label_selector(&self, selector: BTreeMap<String, String>) -> Result<BTreeMap<String, String>, ResolveError> {
        Ok(self.translator.host_labels(&selector, &self.namespace))
    }

    fn translate_namespace_ref(&self, _namespace: &str) -> Result<String, ResolveError> {
        Ok(self.translator.target_namespace.clone())
    }
}

/// Translates host names back through the mapping store. Only plain names are
/// supported in this direction.
pub struct HostToVirtual<'a> {
    store: Option<&'a Store>,
    gvk: GroupVersionKind,
    namespace: String,
}

impl<'a> HostToVirtual<'a> {
    pub fn new(store: Option<&'a Store>, gvk: GroupVersionKind, host_namespace: impl Into<String>) -> Self {
        Self { store, gvk, namespace: host_namespace.into() }
    }

    fn lookup(&self, name: &str, namespace: &str) -> Result<String, ResolveError> {
        let host = Object::new(self.gvk.clone(), NamespacedName::new(namespace, name));
        self.store
            .and_then(|s| s.host_to_virtual_name(&host))
            .map(|v| v.name)
            .ok_or_else(|| ResolveError::Failed(format!("could not translate {name} host resource name to vcluster resource name")))
    }
}

impl NameResolver for HostToVirtual<'_> {
    fn translate_name(&self, name: &str, regex: Option<&Regex>, _path: &str) -> Result<String, ResolveError> {
        if regex.is_some() {
            return Err(ResolveError::NotSupported("regex name translation".into()));
        }
        self.lookup(name, &self.namespace)
    }

    fn translate_name_with_namespace(
        &self,
        name: &str,
        namespace: &str,
        regex: Option<&Regex>,
        _path: &str,
    ) -> Result<String, ResolveError> {
        if regex.is_some() {
            return Err(ResolveError::NotSupported("regex name translation".into()));
        }
        self.lookup(name, namespace)
    }

    fn translate_label_key(&self, _key: &str) -> Result<String, ResolveError> {
        Err(ResolveError::NotSupported("label key translation".into()))
    }

    fn translate_label_expressions_selector(&self, _selector: LabelSelector) -> Result<LabelSelector, ResolveError> {
        Err(ResolveError::NotSupported("label selector translation".into()))
    }

    fn translate_label_selector(&self, _selector: BTreeMap<String, String>) -> Result<BTreeMap<String, String>, ResolveError> {
        Err(ResolveError::NotSupported("label selector translation".into()))
    }

    fn translate_namespace_ref(&self, _namespace: &str) -> Result<String, ResolveError> {
        Err(ResolveError::NotSupported("namespace reference translation".into()))
    }
}
