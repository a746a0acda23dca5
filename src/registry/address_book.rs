//! Discovered provider addresses, keyed by `{interface}_{version}`
//!
//! Lists are copy-on-write: writers build a new `Vec` and swap the `Arc`, so readers
//! holding a snapshot never observe a half-applied change.

use crate::common::path::{expand_providers, node_name, ProviderNode};
use crate::common::utils::shuffle;
use crate::coord::{ChildEvent, ChildEventKind};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Default)]
pub struct AddressBook {
    lists: RwLock<HashMap<String, Arc<Vec<String>>>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, key: &str) -> Option<Arc<Vec<String>>> {
        self.lists
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lists
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Full reload from the provider node names of one service.
    pub fn replace<S: AsRef<str>>(&self, key: &str, children: &[S]) {
        let expanded = expand_providers(children);
        self.lists
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), Arc::new(expanded));
    }

    /// Append the weighted entries of one node and reshuffle the whole list.
    pub fn add(&self, key: &str, node: &ProviderNode) {
        let mut lists = self.lists.write().unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<String> = lists.get(key).map(|l| l.to_vec()).unwrap_or_default();
        next.extend(node.expand());
        shuffle(&mut next);
        lists.insert(key.to_string(), Arc::new(next));
    }

    /// Remove one occurrence per weighted entry of `node`.
    pub fn remove(&self, key: &str, node: &ProviderNode) {
        let mut lists = self.lists.write().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = lists.get(key) else {
            return;
        };
        let mut next = current.to_vec();
        for address in node.expand() {
            if let Some(pos) = next.iter().position(|a| *a == address) {
                next.remove(pos);
            }
        }
        lists.insert(key.to_string(), Arc::new(next));
    }

    /// Apply a child-watch event on `{service}/providers`.
    pub fn apply(&self, key: &str, event: &ChildEvent) -> crate::Result<()> {
        let node: ProviderNode = node_name(&event.path).parse()?;
        match event.kind {
            ChildEventKind::Added => self.add(key, &node),
            ChildEventKind::Removed => self.remove(key, &node),
            ChildEventKind::Updated => {}
        }
        Ok(())
    }

    pub fn keys(&self) -> Vec<String> {
        self.lists
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(book: &AddressBook, key: &str) -> Vec<String> {
        let mut v = book.snapshot(key).unwrap().to_vec();
        v.sort();
        v
    }

    #[test]
    fn test_replace_expands_weights() {
        let book = AddressBook::new();
        book.replace("Echo_1.0", &["10.0.0.1:9090:3", "10.0.0.2:9090:1"]);
        assert_eq!(
            sorted(&book, "Echo_1.0"),
            vec!["10.0.0.1:9090", "10.0.0.1:9090", "10.0.0.1:9090", "10.0.0.2:9090"]
        );
    }

    #[test]
    fn test_removed_event_drops_single_occurrence() {
        let book = AddressBook::new();
        book.replace("Echo_1.0", &["h1:100:2", "h2:200:1"]);

        book.apply(
            "Echo_1.0",
            &ChildEvent {
                kind: ChildEventKind::Removed,
                path: "/soa/x/providers/h1:100:1".into(),
            },
        )
        .unwrap();
        assert_eq!(sorted(&book, "Echo_1.0"), vec!["h1:100", "h2:200"]);
    }

    #[test]
    fn test_snapshot_is_stable_across_writes() {
        let book = AddressBook::new();
        book.replace("Echo_1.0", &["h1:100:1"]);
        let before = book.snapshot("Echo_1.0").unwrap();
        book.add("Echo_1.0", &"h2:200:1".parse().unwrap());
        assert_eq!(before.len(), 1);
        assert_eq!(book.snapshot("Echo_1.0").unwrap().len(), 2);
    }

    #[test]
    fn test_malformed_event_is_error() {
        let book = AddressBook::new();
        let event = ChildEvent {
            kind: ChildEventKind::Added,
            path: "/p/providers/garbage".into(),
        };
        assert!(book.apply("Echo_1.0", &event).is_err());
        assert!(!book.contains("Echo_1.0"));
    }
}
