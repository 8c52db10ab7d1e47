use std::collections::BTreeMap;

use crate::{
    condition::{Condition, ConditionKey},
    iov::{Iov, IovKey},
};

/// Staged conditions per target pool: `(IOV type index, IOV range)`.
pub type UpdateEntries = BTreeMap<(usize, IovKey), Vec<Condition>>;

/// Staging area for conditions not yet merged into the permanent pools.
///
/// Staged conditions are already bound to their target IOV but are not
/// ACTIVE until [`crate::manager::ConditionsManager::push_updates`] merges them.
#[derive(Debug, Default)]
pub struct UpdatePool {
    pending: UpdateEntries,
}

impl UpdatePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&mut self, condition: Condition) {
        let iov = condition.iov();
        self.pending
            .entry((iov.type_index(), iov.key()))
            .or_default()
            .push(condition);
    }

    /// Remove and return every staged entry.
    pub fn pop_entries(&mut self) -> UpdateEntries {
        std::mem::take(&mut self.pending)
    }

    /// Collect staged conditions for `key` whose IOV overlaps `requested`.
    pub fn select_range(&self, key: ConditionKey, requested: &Iov, out: &mut Vec<Condition>) -> usize {
        let before = out.len();
        for ((type_index, range), conditions) in &self.pending {
            if *type_index != requested.type_index() || !range.overlaps(&requested.key()) {
                continue;
            }
            out.extend(conditions.iter().filter(|c| c.key() == key).cloned());
        }
        out.len() - before
    }

    /// Number of staged conditions.
    pub fn len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.values().all(Vec::is_empty)
    }
}
