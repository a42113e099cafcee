//! Anchor/name table: a bidirectional map between names and addresses.
//!
//! Names are unique and compared case-insensitively. Each address carries at most one name.

use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").expect("valid anchor name regex")
});

/// Whether `name` can be used as an anchor name.
pub fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

/// Result of binding a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorOutcome {
    /// The name that was actually bound.
    pub name: String,
    /// Whether the requested name collided and was replaced by [`AnchorOutcome::name`].
    pub renamed: bool,
}

/// Names bound to addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnchorTable {
    by_address: BTreeMap<usize, String>,
    by_name: HashMap<String, usize>,
}

fn fold(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl AnchorTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of anchors.
    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    /// Whether no anchors are bound.
    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// Address bound to `name`.
    pub fn address(&self, name: &str) -> Option<usize> {
        self.by_name.get(&fold(name)).copied()
    }

    /// Name bound to `address`.
    pub fn name_at(&self, address: usize) -> Option<&str> {
        self.by_address.get(&address).map(String::as_str)
    }

    /// Whether `name` is in use (case-insensitive).
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(&fold(name))
    }

    /// All anchors ordered by address.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.by_address
            .iter()
            .map(|(address, name)| (*address, name.as_str()))
    }

    /// Anchors bound inside `start..end`, ordered by address.
    pub fn in_range(&self, start: usize, end: usize) -> impl Iterator<Item = (usize, &str)> {
        self.by_address
            .range(start..end.max(start))
            .map(|(address, name)| (*address, name.as_str()))
    }

    /// `name` if unused, otherwise the first of `name_copy`, `name_copy2`, `name_copy3`, ...
    /// that is unused.
    pub fn uniquify(&self, name: &str) -> String {
        if !self.contains(name) {
            return name.to_string();
        }
        let base = format!("{}_copy", name);
        if !self.contains(&base) {
            return base;
        }
        (2usize..)
            .map(|n| format!("{}{}", base, n))
            .find(|candidate| !self.contains(candidate))
            .unwrap_or(base)
    }

    /// Bind `name` to `address`. The caller guarantees both are free.
    pub(crate) fn bind(&mut self, address: usize, name: String) {
        debug_assert!(!self.by_address.contains_key(&address));
        debug_assert!(!self.contains(&name));
        self.by_name.insert(fold(&name), address);
        self.by_address.insert(address, name);
    }

    /// Remove the name bound to `address`.
    pub(crate) fn unbind(&mut self, address: usize) -> Option<String> {
        let name = self.by_address.remove(&address)?;
        self.by_name.remove(&fold(&name));
        Some(name)
    }

    pub(crate) fn clear(&mut self) {
        self.by_address.clear();
        self.by_name.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(is_valid_name("data.pokemon.names"));
        assert!(is_valid_name("_scratch-1"));
        assert!(!is_valid_name("1st"));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name(""));
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut table = AnchorTable::new();
        table.bind(0x100, "Items".to_string());
        assert_eq!(table.address("items"), Some(0x100));
        assert_eq!(table.address("ITEMS"), Some(0x100));
        assert_eq!(table.name_at(0x100), Some("Items"));
    }

    #[test]
    fn test_uniquify() {
        let mut table = AnchorTable::new();
        assert_eq!(table.uniquify("moves"), "moves");
        table.bind(0x10, "moves".to_string());
        assert_eq!(table.uniquify("Moves"), "Moves_copy");
        table.bind(0x20, "moves_copy".to_string());
        assert_eq!(table.uniquify("moves"), "moves_copy2");
        table.bind(0x30, "moves_copy2".to_string());
        assert_eq!(table.uniquify("moves"), "moves_copy3");
    }

    #[test]
    fn test_unbind_and_range() {
        let mut table = AnchorTable::new();
        table.bind(0x10, "a".to_string());
        table.bind(0x20, "b".to_string());
        table.bind(0x30, "c".to_string());

        let inside: Vec<usize> = table.in_range(0x11, 0x31).map(|(a, _)| a).collect();
        assert_eq!(inside, vec![0x20, 0x30]);

        assert_eq!(table.unbind(0x20), Some("b".to_string()));
        assert!(!table.contains("B"));
        assert_eq!(table.len(), 2);
    }
}
