//! In-memory registry of mocked hosts
//!
//! Shared between the daemon's request handlers, which mutate it while
//! holding the daemon's operation lock, and the HTTP routing handlers, which
//! only read it.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use crate::daemon::protocol::MockedHost;

/// Cheaply cloneable handle on the mocked-host list
#[derive(Debug, Clone, Default)]
pub struct Registry {
    hosts: Arc<RwLock<Vec<MockedHost>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current entries in insertion order
    pub fn snapshot(&self) -> Vec<MockedHost> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Add a mapping, replacing the directory of an existing entry for the
    /// same host in place
    ///
    /// Returns the entry that was replaced, if any.
    pub fn insert(&self, entry: MockedHost) -> Option<MockedHost> {
        let mut hosts = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
        match hosts
            .iter_mut()
            .find(|existing| existing.host.eq_ignore_ascii_case(&entry.host))
        {
            Some(existing) => Some(std::mem::replace(existing, entry)),
            None => {
                hosts.push(entry);
                None
            }
        }
    }

    /// Remove every entry for `host`, returning what was removed
    pub fn remove(&self, host: &str) -> Vec<MockedHost> {
        let mut hosts = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *hosts)
            .into_iter()
            .partition(|entry| entry.host.eq_ignore_ascii_case(host));
        *hosts = kept;
        removed
    }

    /// Empty the registry, returning the previous entries
    pub fn clear(&self) -> Vec<MockedHost> {
        let mut hosts = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *hosts)
    }

    /// Directory served for `host`; the first matching entry wins
    pub fn lookup(&self, host: &str) -> Option<PathBuf> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|entry| entry.host.eq_ignore_ascii_case(host))
            .map(|entry| entry.directory.clone())
    }

    /// Distinct host names, in insertion order
    pub fn host_names(&self) -> Vec<String> {
        let hosts = self.hosts.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = Vec::with_capacity(hosts.len());
        for entry in hosts.iter() {
            if !names.iter().any(|name| name.eq_ignore_ascii_case(&entry.host)) {
                names.push(entry.host.clone());
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_snapshot() {
        let registry = Registry::new();
        assert!(registry.is_empty());

        assert!(registry.insert(MockedHost::new("a.local", "/srv/a")).is_none());
        assert!(registry.insert(MockedHost::new("b.local", "/srv/b")).is_none());

        assert_eq!(
            registry.snapshot(),
            vec![
                MockedHost::new("a.local", "/srv/a"),
                MockedHost::new("b.local", "/srv/b"),
            ]
        );
    }

    #[test]
    fn test_insert_replaces_duplicate_host() {
        let registry = Registry::new();
        registry.insert(MockedHost::new("a.local", "/srv/a"));
        registry.insert(MockedHost::new("b.local", "/srv/b"));

        let replaced = registry.insert(MockedHost::new("A.local", "/srv/new"));
        assert_eq!(replaced, Some(MockedHost::new("a.local", "/srv/a")));
        assert_eq!(registry.snapshot().len(), 2);
        assert_eq!(registry.lookup("a.local"), Some(PathBuf::from("/srv/new")));
    }

    #[test]
    fn test_remove() {
        let registry = Registry::new();
        registry.insert(MockedHost::new("a.local", "/srv/a"));
        registry.insert(MockedHost::new("b.local", "/srv/b"));

        let removed = registry.remove("a.local");
        assert_eq!(removed, vec![MockedHost::new("a.local", "/srv/a")]);
        assert_eq!(registry.snapshot(), vec![MockedHost::new("b.local", "/srv/b")]);
        assert!(registry.remove("a.local").is_empty());
    }

    #[test]
    fn test_clear() {
        let registry = Registry::new();
        registry.insert(MockedHost::new("a.local", "/srv/a"));
        let previous = registry.clear();
        assert_eq!(previous.len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = Registry::new();
        registry.insert(MockedHost::new("a.local", "/srv/a"));
        assert_eq!(registry.lookup("A.LOCAL"), Some(PathBuf::from("/srv/a")));
        assert_eq!(registry.lookup("b.local"), None);
    }

    #[test]
    fn test_clones_share_state() {
        let registry = Registry::new();
        let view = registry.clone();
        registry.insert(MockedHost::new("a.local", "/srv/a"));
        assert_eq!(view.host_names(), vec!["a.local".to_string()]);
    }
}
