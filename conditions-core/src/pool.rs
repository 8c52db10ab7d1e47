use std::sync::atomic::{AtomicU32, Ordering};

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::{
    condition::{Condition, ConditionKey},
    iov::Iov,
};

/// All conditions sharing one exact IOV key range within one IOV type.
///
/// Every contained condition is bound to the pool's IOV. Pools are created by
/// the manager (see [`crate::manager::ConditionsManager::register_iov`]) and
/// shared as `Arc<ConditionsPool>`.
#[derive(Debug)]
pub struct ConditionsPool {
    iov: Iov,
    conditions: RwLock<IndexMap<ConditionKey, Condition>>,
    age: AtomicU32,
}

impl ConditionsPool {
    pub(crate) fn new(iov: Iov) -> Self {
        Self {
            iov,
            conditions: RwLock::new(IndexMap::new()),
            age: AtomicU32::new(0),
        }
    }

    pub fn iov(&self) -> &Iov {
        &self.iov
    }

    /// Insert a condition bound to this pool's IOV.
    ///
    /// Returns `false` and leaves the pool untouched if the key is already present.
    pub fn insert(&self, condition: Condition) -> bool {
        debug_assert_eq!(condition.iov(), &self.iov);
        let mut conditions = self.conditions.write();
        if conditions.contains_key(&condition.key()) {
            return false;
        }
        conditions.insert(condition.key(), condition);
        true
    }

    pub fn get(&self, key: ConditionKey) -> Option<Condition> {
        self.conditions.read().get(&key).cloned()
    }

    pub fn contains(&self, key: ConditionKey) -> bool {
        self.conditions.read().contains_key(&key)
    }

    /// Append the condition for `key` (if present) to `out`, resetting its age.
    pub fn select(&self, key: ConditionKey, out: &mut Vec<Condition>) -> bool {
        match self.conditions.read().get(&key) {
            Some(condition) => {
                condition.touch();
                out.push(condition.clone());
                true
            }
            None => false,
        }
    }

    pub fn select_all(&self, out: &mut Vec<Condition>) -> usize {
        let conditions = self.conditions.read();
        out.extend(conditions.values().cloned());
        conditions.len()
    }

    /// Remove every condition older than `max_age`. `max_age == 0` clears the pool.
    pub fn clean(&self, max_age: u32) -> usize {
        let mut conditions = self.conditions.write();
        let before = conditions.len();
        if max_age == 0 {
            conditions.clear();
        } else {
            conditions.retain(|_, condition| condition.age() <= max_age);
        }
        before - conditions.len()
    }

    pub fn len(&self) -> usize {
        self.conditions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.read().is_empty()
    }

    /// Cleanup cycles survived since the pool was last selected.
    pub fn age(&self) -> u32 {
        self.age.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self) {
        self.age.store(0, Ordering::Relaxed);
    }

    /// Age the pool and all of its conditions by one cleanup cycle.
    pub(crate) fn tick(&self) {
        self.age.fetch_add(1, Ordering::Relaxed);
        for condition in self.conditions.read().values() {
            condition.tick();
        }
    }
}
