use std::{collections::BTreeMap, sync::Arc};

use crate::{
    cleanup::CleanupPolicy,
    condition::{Condition, ConditionKey},
    iov::{Iov, IovKey, IovType},
    pool::ConditionsPool,
};

/// All pools of one IOV type, keyed by their exact IOV range.
///
/// Distinct ranges are never merged, overlaps are resolved when selecting.
#[derive(Debug)]
pub struct ConditionsIovPool {
    iov_type: Arc<IovType>,
    elements: BTreeMap<IovKey, Arc<ConditionsPool>>,
}

impl ConditionsIovPool {
    pub(crate) fn new(iov_type: Arc<IovType>) -> Self {
        Self {
            iov_type,
            elements: BTreeMap::new(),
        }
    }

    pub fn iov_type(&self) -> &Arc<IovType> {
        &self.iov_type
    }

    pub fn get(&self, key: &IovKey) -> Option<&Arc<ConditionsPool>> {
        self.elements.get(key)
    }

    /// Look up the pool for `key`, creating it on first use.
    ///
    /// Returns the pool and whether it was created.
    pub(crate) fn get_or_create(&mut self, key: IovKey) -> (Arc<ConditionsPool>, bool) {
        if let Some(pool) = self.elements.get(&key) {
            return (pool.clone(), false);
        }
        let pool = Arc::new(ConditionsPool::new(Iov::new(self.iov_type.clone(), key)));
        self.elements.insert(key, pool.clone());
        (pool, true)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Arc<ConditionsPool>> {
        self.elements.values()
    }

    /// Number of pools.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Number of conditions over all pools.
    pub fn condition_count(&self) -> usize {
        self.elements.values().map(|pool| pool.len()).sum()
    }

    /// Collect `key` from every pool whose range contains the requested range.
    ///
    /// For a point request this is the same as an overlap test.
    pub fn select(&self, key: ConditionKey, requested: &IovKey, out: &mut Vec<Condition>) -> usize {
        let before = out.len();
        for (range, pool) in &self.elements {
            if range.contains(requested) {
                pool.touch();
                pool.select(key, out);
            }
        }
        out.len() - before
    }

    /// Collect `key` from every pool whose range overlaps the requested range.
    pub fn select_range(
        &self,
        key: ConditionKey,
        requested: &IovKey,
        out: &mut Vec<Condition>,
    ) -> usize {
        let before = out.len();
        for (range, pool) in &self.elements {
            if range.overlaps(requested) {
                pool.touch();
                pool.select(key, out);
            }
        }
        out.len() - before
    }

    /// Forward an age cleanup to every pool. Pools themselves are kept.
    pub fn clean(&self, max_age: u32) -> usize {
        self.elements.values().map(|pool| pool.clean(max_age)).sum()
    }

    /// Apply an eviction policy: selected pools are dropped as a whole,
    /// survivors are pruned by the policy's condition age threshold.
    pub fn clean_with(&mut self, policy: &dyn CleanupPolicy) -> usize {
        let mut removed = 0;
        self.elements.retain(|range, pool| {
            if policy.evict_pool(pool) {
                tracing::debug!(
                    "Removing IOV pool {}:{} with {} conditions",
                    pool.iov().iov_type(),
                    range,
                    pool.len()
                );
                removed += pool.len();
                false
            } else {
                if let Some(max_age) = policy.max_condition_age() {
                    if max_age > 0 {
                        removed += pool.clean(max_age);
                    }
                }
                true
            }
        });
        removed
    }

    pub(crate) fn tick(&self) {
        for pool in self.elements.values() {
            pool.tick();
        }
    }
}

/// Whether the validities of `conditions` jointly cover `requested` without gaps.
///
/// Candidates may arrive in any order, so the target window is shrunk from
/// both ends for at most `conditions.len()` passes. Integer ranges that abut
/// (`[1,4]` and `[5,10]`) count as contiguous.
pub fn is_range_complete(requested: &IovKey, conditions: &[Condition]) -> bool {
    if conditions.is_empty() {
        return false;
    }
    if requested.is_discrete() {
        return conditions
            .iter()
            .any(|condition| condition.iov().key().contains(requested));
    }
    let mut low = requested.first();
    let mut high = requested.second();
    for _ in 0..conditions.len() {
        let mut progressed = false;
        for condition in conditions {
            let key = condition.iov().key();
            if key.first() <= low.saturating_add(1) && key.second() > low {
                low = key.second();
                progressed = true;
            }
            if key.first().saturating_add(1) <= high && key.second() >= high {
                high = key.first();
                progressed = true;
            }
            if low >= high {
                return true;
            }
        }
        if !progressed {
            return false;
        }
    }
    false
}
