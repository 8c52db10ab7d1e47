use indexmap::IndexMap;

use crate::{
    condition::{Condition, ConditionKey},
    iov::{Iov, IovKey},
};

/// Resolved conditions of one slice for one requested IOV.
///
/// Tracks the combined validity: the intersection of the validities of all
/// conditions it holds.
#[derive(Debug, Default)]
pub struct UserPool {
    iov: Option<Iov>,
    validity: Option<Iov>,
    conditions: IndexMap<ConditionKey, Condition>,
}

impl UserPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all content and bind the pool to a new requested IOV.
    pub(crate) fn bind(&mut self, iov: Iov) {
        self.conditions.clear();
        self.validity = Some(Iov::new(iov.iov_type().clone(), IovKey::full()));
        self.iov = Some(iov);
    }

    /// The requested IOV, if bound.
    pub fn iov(&self) -> Option<&Iov> {
        self.iov.as_ref()
    }

    /// The combined validity of the held conditions, if bound.
    pub fn validity(&self) -> Option<&Iov> {
        self.validity.as_ref()
    }

    /// Returns `false` if the key is already present.
    pub fn insert(&mut self, condition: Condition) -> bool {
        if self.conditions.contains_key(&condition.key()) {
            return false;
        }
        if let Some(narrowed) = self
            .validity
            .as_ref()
            .and_then(|validity| validity.intersect(condition.iov()))
        {
            self.validity = Some(narrowed);
        }
        self.conditions.insert(condition.key(), condition);
        true
    }

    pub fn get(&self, key: ConditionKey) -> Option<Condition> {
        self.conditions.get(&key).cloned()
    }

    pub fn contains(&self, key: ConditionKey) -> bool {
        self.conditions.contains_key(&key)
    }

    pub fn remove(&mut self, key: ConditionKey) -> bool {
        self.conditions.shift_remove(&key).is_some()
    }

    pub fn scan<F: FnMut(&Condition)>(&self, mut processor: F) {
        for condition in self.conditions.values() {
            processor(condition);
        }
    }

    /// Remove all conditions and the IOV binding.
    pub fn clear(&mut self) {
        self.conditions.clear();
        self.iov = None;
        self.validity = None;
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}
