//! The conditions manager: owner of all IOV pools and the staging area.
//!
//! Two locks guard the shared state. The pool lock protects the per-type
//! pool tables, the update lock protects the staging area. They are never
//! held at the same time.

use std::{
    any::Any,
    collections::{HashMap, HashSet},
    sync::Arc,
};

use conditions_config::CONFIG;
use parking_lot::{Mutex, RwLock};

use crate::{
    cleanup::{AgeCleanup, CleanupPolicy},
    condition::{Condition, ConditionBuilder, ConditionKey},
    content::{ConditionsContent, ContentEntry, Dependency, LoadInfo},
    derivation::{DerivationEngine, UpdateContext},
    error::{ConditionsError, LoaderError},
    iov::{Iov, IovKey, IovType},
    iov_pool::{is_range_complete, ConditionsIovPool},
    listener::ConditionsListener,
    loader::{DataLoader, Loaded},
    pool::ConditionsPool,
    result::PrepareResult,
    slice::ConditionsSlice,
    update_pool::UpdatePool,
};

type UserData<'a> = Option<&'a (dyn Any + Send + Sync)>;

pub struct ConditionsManagerBuilder {
    max_iov_types: usize,
    loader: Option<Arc<dyn DataLoader>>,
    engine: Option<Arc<dyn DerivationEngine>>,
    cleanup: Option<Arc<dyn CleanupPolicy>>,
    listeners: Vec<Arc<dyn ConditionsListener>>,
}

impl Default for ConditionsManagerBuilder {
    fn default() -> Self {
        let cleanup: Option<Arc<dyn CleanupPolicy>> = if CONFIG.cleanup_max_age > 0 {
            Some(Arc::new(AgeCleanup::new(CONFIG.cleanup_max_age)))
        } else {
            None
        };
        Self {
            max_iov_types: CONFIG.max_iov_types,
            loader: None,
            engine: None,
            cleanup,
            listeners: Vec::new(),
        }
    }
}

impl ConditionsManagerBuilder {
    pub fn max_iov_types(mut self, max_iov_types: usize) -> Self {
        self.max_iov_types = max_iov_types;
        self
    }

    pub fn loader(mut self, loader: Arc<dyn DataLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn derivation(mut self, engine: Arc<dyn DerivationEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Policy applied after every `compute`. `None` disables automatic cleanup.
    pub fn cleanup(mut self, policy: Option<Arc<dyn CleanupPolicy>>) -> Self {
        self.cleanup = policy;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ConditionsListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> Arc<ConditionsManager> {
        tracing::info!(
            "Creating conditions manager with capacity for {} IOV types",
            self.max_iov_types
        );
        Arc::new(ConditionsManager {
            capacity: self.max_iov_types,
            pools: RwLock::new((0..self.max_iov_types).map(|_| None).collect()),
            updates: Mutex::new(UpdatePool::new()),
            loader: self.loader,
            engine: self.engine,
            cleanup: RwLock::new(self.cleanup),
            listeners: RwLock::new(self.listeners),
        })
    }
}

/// Pool and condition counts of one registered IOV type.
#[derive(Debug, Clone)]
pub struct TypeStatistics {
    pub iov_type: Arc<IovType>,
    pub pools: usize,
    pub conditions: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ManagerStatistics {
    pub types: Vec<TypeStatistics>,
    /// Conditions waiting in the staging area.
    pub staged: usize,
}

impl ManagerStatistics {
    pub fn conditions(&self) -> usize {
        self.types.iter().map(|t| t.conditions).sum()
    }

    pub fn pools(&self) -> usize {
        self.types.iter().map(|t| t.pools).sum()
    }
}

pub struct ConditionsManager {
    capacity: usize,
    pools: RwLock<Vec<Option<ConditionsIovPool>>>,
    updates: Mutex<UpdatePool>,
    loader: Option<Arc<dyn DataLoader>>,
    engine: Option<Arc<dyn DerivationEngine>>,
    cleanup: RwLock<Option<Arc<dyn CleanupPolicy>>>,
    listeners: RwLock<Vec<Arc<dyn ConditionsListener>>>,
}

impl ConditionsManager {
    pub fn builder() -> ConditionsManagerBuilder {
        ConditionsManagerBuilder::default()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register an IOV type under `index`.
    ///
    /// Registering the same index and name again returns the existing type.
    pub fn register_iov_type(
        &self,
        index: usize,
        name: &str,
    ) -> Result<Arc<IovType>, ConditionsError> {
        if index >= self.capacity {
            return Err(ConditionsError::IovTypeOutOfBounds {
                index,
                name: name.to_string(),
                capacity: self.capacity,
            });
        }
        let mut pools = self.pools.write();
        match &pools[index] {
            Some(existing) if existing.iov_type().name() == name => Ok(existing.iov_type().clone()),
            Some(existing) => Err(ConditionsError::IovTypeConflict {
                index,
                name: name.to_string(),
                existing: existing.iov_type().name().to_string(),
            }),
            None => {
                let iov_type = Arc::new(IovType::new(index, name));
                pools[index] = Some(ConditionsIovPool::new(iov_type.clone()));
                tracing::info!("Registered IOV type {}", iov_type);
                Ok(iov_type)
            }
        }
    }

    pub fn iov_type(&self, index: usize) -> Option<Arc<IovType>> {
        self.pools
            .read()
            .get(index)
            .and_then(Option::as_ref)
            .map(|pool| pool.iov_type().clone())
    }

    pub fn iov_type_by_name(&self, name: &str) -> Option<Arc<IovType>> {
        self.pools
            .read()
            .iter()
            .flatten()
            .find(|pool| pool.iov_type().name() == name)
            .map(|pool| pool.iov_type().clone())
    }

    pub fn iov_types(&self) -> Vec<Arc<IovType>> {
        self.pools
            .read()
            .iter()
            .flatten()
            .map(|pool| pool.iov_type().clone())
            .collect()
    }

    /// Access the IOV pool of a registered type.
    pub fn with_iov_pool<R>(
        &self,
        iov_type: &IovType,
        f: impl FnOnce(&ConditionsIovPool) -> R,
    ) -> Result<R, ConditionsError> {
        let pools = self.pools.read();
        Ok(f(registered(&pools, iov_type)?))
    }

    /// Find or create the pool for the exact range `key` of `iov_type`.
    pub fn register_iov(
        &self,
        iov_type: &IovType,
        key: IovKey,
    ) -> Result<Arc<ConditionsPool>, ConditionsError> {
        let mut pools = self.pools.write();
        let iov_pool = registered_mut(&mut pools, iov_type)?;
        let (pool, created) = iov_pool.get_or_create(key);
        if created {
            tracing::info!("Created IOV pool for: {}", pool.iov());
        }
        Ok(pool)
    }

    /// Register a condition in `pool` without taking the manager's pool lock.
    ///
    /// Returns `false` if the key is already present in the pool.
    pub fn register_unlocked(
        &self,
        pool: &ConditionsPool,
        condition: ConditionBuilder,
    ) -> Result<bool, ConditionsError> {
        Ok(self.publish(pool, condition)?.is_some())
    }

    /// Register a batch of conditions in one pool.
    ///
    /// Stops at the first condition without payload. Conditions registered
    /// before it stay registered.
    pub fn block_register(
        &self,
        pool: &ConditionsPool,
        conditions: Vec<ConditionBuilder>,
    ) -> Result<usize, ConditionsError> {
        let mut registered = 0;
        for condition in conditions {
            if self.publish(pool, condition)?.is_some() {
                registered += 1;
            }
        }
        Ok(registered)
    }

    /// Stage a condition for `iov`. It becomes visible to `select` right away
    /// and moves to the permanent pools with the next `push_updates`.
    pub fn queue_update(
        &self,
        iov: &Iov,
        condition: ConditionBuilder,
    ) -> Result<Condition, ConditionsError> {
        {
            let pools = self.pools.read();
            registered(&pools, iov.iov_type())?;
        }
        let key = condition.key();
        let condition = condition
            .bind(iov.clone())
            .ok_or_else(|| ConditionsError::InvalidCondition {
                key,
                iov: iov.to_string(),
            })?;
        self.updates.lock().stage(condition.clone());
        Ok(condition)
    }

    /// Move all staged conditions to the permanent pools.
    ///
    /// Returns the number of conditions merged.
    pub fn push_updates(&self) -> usize {
        let entries = self.updates.lock().pop_entries();
        if entries.is_empty() {
            return 0;
        }

        let mut targets = Vec::with_capacity(entries.len());
        {
            let mut pools = self.pools.write();
            for ((type_index, key), conditions) in entries {
                let Some(iov_pool) = pools.get_mut(type_index).and_then(Option::as_mut) else {
                    tracing::warn!(
                        "Dropping {} staged conditions of unregistered IOV type {}",
                        conditions.len(),
                        type_index
                    );
                    continue;
                };
                let (pool, created) = iov_pool.get_or_create(key);
                if created {
                    tracing::info!("Created IOV pool for: {}", pool.iov());
                }
                targets.push((pool, conditions));
            }
        }

        let mut merged = 0;
        for (pool, conditions) in targets {
            for condition in conditions {
                let key = condition.key();
                if self.register_bound(&pool, condition) {
                    merged += 1;
                } else {
                    tracing::warn!(
                        "Staged condition {} already present in pool {}",
                        key,
                        pool.iov()
                    );
                }
            }
        }
        tracing::debug!("Merged {} staged conditions", merged);
        merged
    }

    /// Collect every condition of `key` whose validity contains `iov`,
    /// from the permanent pools and the staging area.
    pub fn select(
        &self,
        key: ConditionKey,
        iov: &Iov,
        out: &mut Vec<Condition>,
    ) -> Result<bool, ConditionsError> {
        let requested = iov.key();
        let mut found = {
            let pools = self.pools.read();
            registered(&pools, iov.iov_type())?.select(key, &requested, out)
        };
        found += self.updates.lock().select_range(key, iov, out);
        Ok(found > 0)
    }

    /// Collect every condition of `key` whose validity overlaps `iov`.
    ///
    /// Returns whether the collected validities cover `iov` without gaps.
    pub fn select_range(
        &self,
        key: ConditionKey,
        iov: &Iov,
        out: &mut Vec<Condition>,
    ) -> Result<bool, ConditionsError> {
        let requested = iov.key();
        let start = out.len();
        {
            let pools = self.pools.read();
            registered(&pools, iov.iov_type())?.select_range(key, &requested, out);
        }
        self.updates.lock().select_range(key, iov, out);
        Ok(is_range_complete(&requested, &out[start..]))
    }

    /// Resolve the slice's declared content for the discrete `iov`:
    /// select what is present, load what is missing, compute derived conditions.
    pub fn prepare(
        &self,
        iov: &Iov,
        slice: &mut ConditionsSlice,
        user: UserData<'_>,
    ) -> Result<PrepareResult, ConditionsError> {
        let mut result = self.load(iov, slice, user)?;
        result += self.compute(iov, slice, user)?;
        tracing::debug!(
            "Prepared {} for {} keys: {} selected, {} loaded, {} computed, {} missing",
            iov,
            result.total(),
            result.selected,
            result.loaded,
            result.computed,
            result.missing
        );
        Ok(result)
    }

    /// First phase of `prepare`. Binds the slice to `iov` and resolves every
    /// declared key through the pools or the data loader. Derived keys that
    /// are not present are left to `compute`.
    pub fn load(
        &self,
        iov: &Iov,
        slice: &mut ConditionsSlice,
        _user: UserData<'_>,
    ) -> Result<PrepareResult, ConditionsError> {
        if iov.has_range() {
            return Err(ConditionsError::InvalidIov(format!(
                "conditions can only be prepared for a discrete IOV, got {}",
                iov
            )));
        }
        {
            let pools = self.pools.read();
            registered(&pools, iov.iov_type())?;
        }

        self.push_updates();
        slice.pool.bind(iov.clone());

        let content = slice.content().clone();
        let keys: Vec<ConditionKey> = content.iter().map(|(key, _)| key).collect();
        let candidates = self.select_many(&keys, iov)?;

        let mut result = PrepareResult::default();
        let mut to_load: Vec<(ConditionKey, &LoadInfo)> = Vec::new();
        for ((key, entry), mut found) in content.iter().zip(candidates) {
            match found.len() {
                0 => match entry {
                    ContentEntry::Load(info) => to_load.push((key, info)),
                    ContentEntry::Derive(_) => {}
                },
                1 => {
                    if let Some(condition) = found.pop() {
                        slice.pool.insert(condition);
                        result.selected += 1;
                    }
                }
                candidates => {
                    for condition in &found {
                        tracing::error!(
                            "Ambiguous condition {} for {}: candidate with validity {}",
                            key,
                            iov,
                            condition.iov()
                        );
                    }
                    return Err(ConditionsError::AmbiguousCondition {
                        key,
                        iov: iov.to_string(),
                        candidates,
                    });
                }
            }
        }

        if to_load.is_empty() {
            return Ok(result);
        }
        let Some(loader) = &self.loader else {
            tracing::debug!("No data loader installed, {} keys missing", to_load.len());
            result.missing += to_load.len();
            return Ok(result);
        };

        let mut outcomes = loader.load_batch(&to_load, iov).into_iter();
        for (key, _) in &to_load {
            match outcomes.next() {
                Some(Ok(Loaded {
                    validity,
                    condition,
                })) => {
                    let pool = self.register_iov(iov.iov_type(), validity)?;
                    let condition = self.publish_or_existing(&pool, condition)?;
                    if validity.contains(&iov.key()) {
                        slice.pool.insert(condition);
                        result.loaded += 1;
                    } else {
                        tracing::warn!(
                            "Loaded condition {} with validity {} does not cover {}",
                            key,
                            validity,
                            iov
                        );
                        result.missing += 1;
                    }
                }
                Some(Err(LoaderError::NotFound)) | None => {
                    tracing::debug!("Condition {} not found for {}", key, iov);
                    result.missing += 1;
                }
                Some(Err(LoaderError::Storage(source))) => {
                    return Err(ConditionsError::Storage {
                        key: *key,
                        iov: iov.to_string(),
                        source,
                    });
                }
            }
        }
        Ok(result)
    }

    /// Second phase of `prepare`. Computes the declared derived conditions
    /// not yet present in the slice, then applies the cleanup policy.
    pub fn compute(
        &self,
        iov: &Iov,
        slice: &mut ConditionsSlice,
        user: UserData<'_>,
    ) -> Result<PrepareResult, ConditionsError> {
        let bound = slice.iov().cloned().ok_or(ConditionsError::UnboundSlice)?;
        if bound != *iov {
            return Err(ConditionsError::InvalidIov(format!(
                "slice is bound to {}, cannot compute for {}",
                bound, iov
            )));
        }

        let content = slice.content().clone();
        let targets: Vec<&Dependency> = content
            .derived()
            .filter(|dependency| !slice.pool.contains(dependency.target))
            .collect();

        let mut result = PrepareResult::default();
        if !targets.is_empty() {
            match &self.engine {
                Some(engine) => {
                    result += self.compute_targets(engine.as_ref(), &targets, iov, slice, user)?;
                }
                None => {
                    tracing::debug!(
                        "No derivation engine installed, {} keys missing",
                        targets.len()
                    );
                    result.missing += targets.len();
                }
            }
        }

        self.run_cleanup();
        Ok(result)
    }

    fn compute_targets(
        &self,
        engine: &dyn DerivationEngine,
        targets: &[&Dependency],
        iov: &Iov,
        slice: &mut ConditionsSlice,
        user: UserData<'_>,
    ) -> Result<PrepareResult, ConditionsError> {
        let ctx = UpdateContext { iov, user };
        let by_key: HashMap<ConditionKey, &Dependency> =
            targets.iter().map(|d| (d.target, *d)).collect();
        let mut handled = HashSet::new();
        let mut result = PrepareResult::default();

        for key in engine.order(targets) {
            let Some(dependency) = by_key.get(&key) else {
                continue;
            };
            if !handled.insert(key) {
                continue;
            }

            let resolved: Option<Vec<Condition>> = dependency
                .dependencies
                .iter()
                .map(|dep| slice.pool.get(*dep))
                .collect();
            let Some(resolved) = resolved else {
                tracing::debug!("Cannot compute {} for {}: dependencies missing", key, iov);
                result.missing += 1;
                continue;
            };

            let built = match engine.compute(key, &resolved, &ctx) {
                Ok(built) if built.is_valid() => built.derived(),
                Ok(_) => {
                    tracing::warn!("Derivation of {} for {} produced no payload", key, iov);
                    result.missing += 1;
                    continue;
                }
                Err(err) => {
                    tracing::warn!("Failed to compute {} for {}: {}", key, iov, err);
                    result.missing += 1;
                    continue;
                }
            };

            let validity = derived_validity(iov.key(), &resolved);
            let pool = self.register_iov(iov.iov_type(), validity)?;
            let condition = self.publish_or_existing(&pool, built)?;
            slice.pool.insert(condition);
            result.computed += 1;
        }

        result.missing += targets.len() - handled.len();
        Ok(result)
    }

    /// Age cleanup of every pool of one IOV type. `max_age == 0` empties them.
    pub fn clean(&self, iov_type: &IovType, max_age: u32) -> Result<usize, ConditionsError> {
        let pools = self.pools.read();
        let removed = registered(&pools, iov_type)?.clean(max_age);
        tracing::debug!("Cleaned {} conditions of IOV type {}", removed, iov_type);
        Ok(removed)
    }

    /// Age every pool and condition by one cycle, then apply `policy`.
    ///
    /// Returns `(iov types visited, conditions removed)`.
    pub fn clean_with(&self, policy: &dyn CleanupPolicy) -> (usize, usize) {
        let mut pools = self.pools.write();
        let mut visited = 0;
        let mut removed = 0;
        for iov_pool in pools.iter_mut().flatten() {
            iov_pool.tick();
            if policy.applies_to(iov_pool) {
                visited += 1;
                removed += iov_pool.clean_with(policy);
            }
        }
        (visited, removed)
    }

    /// Remove every condition from every pool.
    ///
    /// Returns `(iov types visited, conditions removed)`.
    pub fn clear(&self) -> (usize, usize) {
        let pools = self.pools.read();
        let mut visited = 0;
        let mut removed = 0;
        for iov_pool in pools.iter().flatten() {
            visited += 1;
            removed += iov_pool.clean(0);
        }
        tracing::info!("Cleared {} conditions from {} IOV types", removed, visited);
        (visited, removed)
    }

    /// Replace the policy applied after `compute`.
    pub fn adopt_cleanup(&self, policy: Option<Arc<dyn CleanupPolicy>>) {
        *self.cleanup.write() = policy;
    }

    pub fn add_listener(&self, listener: Arc<dyn ConditionsListener>) {
        self.listeners.write().push(listener);
    }

    /// Declare every registered non-derived condition of `iov_type` in `content`.
    ///
    /// Returns the number of keys added.
    pub fn fill_content(
        &self,
        content: &mut ConditionsContent,
        iov_type: &IovType,
    ) -> Result<usize, ConditionsError> {
        let mut conditions = Vec::new();
        {
            let pools = self.pools.read();
            for pool in registered(&pools, iov_type)?.pools() {
                pool.select_all(&mut conditions);
            }
        }
        Ok(conditions
            .iter()
            .filter(|condition| !condition.is_derived())
            .filter(|condition| {
                content.insert_key(condition.key(), condition.address().unwrap_or_default())
            })
            .count())
    }

    pub fn statistics(&self) -> ManagerStatistics {
        let types = self
            .pools
            .read()
            .iter()
            .flatten()
            .map(|iov_pool| TypeStatistics {
                iov_type: iov_pool.iov_type().clone(),
                pools: iov_pool.len(),
                conditions: iov_pool.condition_count(),
            })
            .collect();
        ManagerStatistics {
            types,
            staged: self.updates.lock().len(),
        }
    }

    /// Bind and register a condition. `Ok(None)` if the key is already in the pool.
    pub(crate) fn publish(
        &self,
        pool: &ConditionsPool,
        condition: ConditionBuilder,
    ) -> Result<Option<Condition>, ConditionsError> {
        let key = condition.key();
        let condition = condition
            .bind(pool.iov().clone())
            .ok_or_else(|| ConditionsError::InvalidCondition {
                key,
                iov: pool.iov().to_string(),
            })?;
        Ok(self.register_bound(pool, condition.clone()).then_some(condition))
    }

    /// Like `publish`, but a concurrent registration of the same key wins.
    fn publish_or_existing(
        &self,
        pool: &ConditionsPool,
        condition: ConditionBuilder,
    ) -> Result<Condition, ConditionsError> {
        let key = condition.key();
        let condition = condition
            .bind(pool.iov().clone())
            .ok_or_else(|| ConditionsError::InvalidCondition {
                key,
                iov: pool.iov().to_string(),
            })?;
        if self.register_bound(pool, condition.clone()) {
            return Ok(condition);
        }
        Ok(pool.get(key).unwrap_or(condition))
    }

    fn register_bound(&self, pool: &ConditionsPool, condition: Condition) -> bool {
        condition.activate();
        if !pool.insert(condition.clone()) {
            return false;
        }
        tracing::debug!("Registered condition {} in pool {}", condition.key(), pool.iov());
        for listener in self.listeners.read().iter() {
            listener.on_register_condition(&condition);
        }
        true
    }

    /// Select candidates for many keys, taking each lock once.
    fn select_many(
        &self,
        keys: &[ConditionKey],
        iov: &Iov,
    ) -> Result<Vec<Vec<Condition>>, ConditionsError> {
        let requested = iov.key();
        let mut candidates: Vec<Vec<Condition>> = vec![Vec::new(); keys.len()];
        {
            let pools = self.pools.read();
            let iov_pool = registered(&pools, iov.iov_type())?;
            for (key, out) in keys.iter().zip(candidates.iter_mut()) {
                iov_pool.select(*key, &requested, out);
            }
        }
        {
            let updates = self.updates.lock();
            if !updates.is_empty() {
                for (key, out) in keys.iter().zip(candidates.iter_mut()) {
                    updates.select_range(*key, iov, out);
                }
            }
        }
        Ok(candidates)
    }

    fn run_cleanup(&self) {
        let Some(policy) = self.cleanup.read().clone() else {
            return;
        };
        let (visited, removed) = self.clean_with(policy.as_ref());
        if removed > 0 {
            tracing::debug!(
                "Cleanup removed {} conditions from {} IOV types",
                removed,
                visited
            );
        }
    }
}

impl std::fmt::Debug for ConditionsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionsManager")
            .field("capacity", &self.capacity)
            .field("statistics", &self.statistics())
            .finish()
    }
}

/// Intersection of the dependency validities, or the requested point
/// if there are none.
fn derived_validity(requested: IovKey, dependencies: &[Condition]) -> IovKey {
    dependencies
        .iter()
        .try_fold(IovKey::full(), |acc, dependency| {
            acc.intersect(&dependency.iov().key())
        })
        .filter(|_| !dependencies.is_empty())
        .unwrap_or(requested)
}

fn registered<'a>(
    pools: &'a [Option<ConditionsIovPool>],
    iov_type: &IovType,
) -> Result<&'a ConditionsIovPool, ConditionsError> {
    pools
        .get(iov_type.index())
        .and_then(Option::as_ref)
        .filter(|pool| **pool.iov_type() == *iov_type)
        .ok_or_else(|| ConditionsError::UnknownIovType(iov_type.to_string()))
}

fn registered_mut<'a>(
    pools: &'a mut [Option<ConditionsIovPool>],
    iov_type: &IovType,
) -> Result<&'a mut ConditionsIovPool, ConditionsError> {
    pools
        .get_mut(iov_type.index())
        .and_then(Option::as_mut)
        .filter(|pool| **pool.iov_type() == *iov_type)
        .ok_or_else(|| ConditionsError::UnknownIovType(iov_type.to_string()))
}
