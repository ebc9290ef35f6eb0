//! Bidirectional URI prefix table.
//!
//! A prefix `m` mapped to `math/` lets `math/add` travel as `m:add`.
//! [`PrefixTable::define`] records the mapping and hands back the PREFIX
//! announcement; the owner must put that announcement on the wire before any
//! message that relies on it.

use std::collections::{BTreeMap, HashMap};

use wamp_core::Message;

/// Short-prefix to full-URI mapping with reverse lookup for shrinking.
#[derive(Clone, Debug, Default)]
pub struct PrefixTable {
    by_prefix: BTreeMap<String, String>,
    by_uri: HashMap<String, String>,
}

impl PrefixTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `prefix` can be expanded back: non-empty and without `:`.
    pub fn is_valid_prefix(prefix: &str) -> bool {
        !prefix.is_empty() && !prefix.contains(':')
    }

    /// Insert or overwrite `prefix`, returning the PREFIX message to announce.
    ///
    /// Every call produces an announcement, including redefinitions.
    pub fn define(&mut self, prefix: impl Into<String>, uri: impl Into<String>) -> Message {
        let prefix = prefix.into();
        let uri = uri.into();

        if let Some(previous) = self.by_prefix.insert(prefix.clone(), uri.clone()) {
            if previous != uri {
                self.forget_reverse(&previous, &prefix);
            }
        }
        let _ = self.by_uri.insert(uri.clone(), prefix.clone());

        Message::Prefix { prefix, uri }
    }

    /// Remove `prefix`, returning the URI it mapped to.
    pub fn undefine(&mut self, prefix: &str) -> Option<String> {
        let uri = self.by_prefix.remove(prefix)?;
        self.forget_reverse(&uri, prefix);
        Some(uri)
    }

    /// URI that `prefix` expands to.
    pub fn get(&self, prefix: &str) -> Option<&str> {
        self.by_prefix.get(prefix).map(String::as_str)
    }

    /// Compress `uri` to `prefix:suffix` using the longest matching target.
    ///
    /// Returns `uri` unchanged when no stored URI is a prefix of it.
    pub fn shrink(&self, uri: &str) -> String {
        self.by_uri
            .iter()
            .filter(|(target, _)| !target.is_empty() && uri.starts_with(target.as_str()))
            .max_by_key(|(target, _)| target.len())
            .map_or_else(
                || uri.to_owned(),
                |(target, prefix)| format!("{prefix}:{}", &uri[target.len()..]),
            )
    }

    /// Expand a `prefix:suffix` reference back to the full URI.
    ///
    /// Inputs without a known prefix (including full URIs such as
    /// `http://...`) are returned unchanged.
    pub fn expand(&self, reference: &str) -> String {
        reference
            .split_once(':')
            .and_then(|(prefix, suffix)| self.get(prefix).map(|uri| format!("{uri}{suffix}")))
            .unwrap_or_else(|| reference.to_owned())
    }

    /// Defined prefixes in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.by_prefix.iter().map(|(p, u)| (p.as_str(), u.as_str()))
    }

    /// Number of defined prefixes.
    pub fn len(&self) -> usize {
        self.by_prefix.len()
    }

    /// Whether no prefixes are defined.
    pub fn is_empty(&self) -> bool {
        self.by_prefix.is_empty()
    }

    /// Drop the reverse entry `uri -> prefix`, falling back to another prefix
    /// that still targets `uri`.
    fn forget_reverse(&mut self, uri: &str, prefix: &str) {
        if self.by_uri.get(uri).map(String::as_str) != Some(prefix) {
            return;
        }
        let _ = self.by_uri.remove(uri);
        if let Some(other) = self
            .by_prefix
            .iter()
            .find(|(_, target)| target.as_str() == uri)
            .map(|(p, _)| p.clone())
        {
            let _ = self.by_uri.insert(uri.to_owned(), other);
        }
    }
}
