use indexmap::IndexMap;

use crate::condition::ConditionKey;

/// Where a raw condition is found in persistent storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadInfo {
    pub address: String,
}

/// A derived condition and the keys it is computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub target: ConditionKey,
    pub dependencies: Vec<ConditionKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentEntry {
    Load(LoadInfo),
    Derive(Dependency),
}

impl ContentEntry {
    pub fn is_derived(&self) -> bool {
        matches!(self, ContentEntry::Derive(_))
    }
}

/// The set of conditions a client wants, independent of any IOV.
///
/// Keys are unique; iteration follows declaration order.
#[derive(Debug, Clone, Default)]
pub struct ConditionsContent {
    entries: IndexMap<ConditionKey, ContentEntry>,
}

impl ConditionsContent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a raw condition. Returns `false` if the key is already declared.
    pub fn insert_key(&mut self, key: ConditionKey, address: impl Into<String>) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(
            key,
            ContentEntry::Load(LoadInfo {
                address: address.into(),
            }),
        );
        true
    }

    /// Declare a derived condition. Returns `false` if the key is already declared.
    pub fn add_dependency(&mut self, target: ConditionKey, dependencies: Vec<ConditionKey>) -> bool {
        if self.entries.contains_key(&target) {
            return false;
        }
        self.entries.insert(
            target,
            ContentEntry::Derive(Dependency {
                target,
                dependencies,
            }),
        );
        true
    }

    pub fn get(&self, key: ConditionKey) -> Option<&ContentEntry> {
        self.entries.get(&key)
    }

    pub fn contains(&self, key: ConditionKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn remove(&mut self, key: ConditionKey) -> bool {
        self.entries.shift_remove(&key).is_some()
    }

    /// Add every entry of `other` not yet declared here. Returns how many were added.
    pub fn merge(&mut self, other: &ConditionsContent) -> usize {
        let mut added = 0;
        for (key, entry) in &other.entries {
            if !self.entries.contains_key(key) {
                self.entries.insert(*key, entry.clone());
                added += 1;
            }
        }
        added
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConditionKey, &ContentEntry)> {
        self.entries.iter().map(|(key, entry)| (*key, entry))
    }

    pub fn loads(&self) -> impl Iterator<Item = (ConditionKey, &LoadInfo)> {
        self.entries.iter().filter_map(|(key, entry)| match entry {
            ContentEntry::Load(info) => Some((*key, info)),
            ContentEntry::Derive(_) => None,
        })
    }

    pub fn derived(&self) -> impl Iterator<Item = &Dependency> {
        self.entries.values().filter_map(|entry| match entry {
            ContentEntry::Derive(dependency) => Some(dependency),
            ContentEntry::Load(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
