//! Computation of derived conditions.

use std::{
    any::Any,
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::{
    condition::{Condition, ConditionBuilder, ConditionKey},
    content::Dependency,
    error::DerivationError,
    iov::Iov,
};

/// Per-request context handed to derivations.
#[derive(Clone, Copy)]
pub struct UpdateContext<'a> {
    /// The IOV the slice is being prepared for.
    pub iov: &'a Iov,
    /// Opaque caller data.
    pub user: Option<&'a (dyn Any + Send + Sync)>,
}

impl<'a> UpdateContext<'a> {
    pub fn new(iov: &'a Iov) -> Self {
        Self { iov, user: None }
    }

    pub fn with_user(mut self, user: &'a (dyn Any + Send + Sync)) -> Self {
        self.user = Some(user);
        self
    }

    pub fn user<T: Any>(&self) -> Option<&T> {
        self.user.and_then(|user| user.downcast_ref::<T>())
    }
}

pub trait DerivationEngine: Send + Sync {
    /// Order in which the derived conditions must be computed.
    ///
    /// The default orders by dependencies among the targets themselves,
    /// keeping declaration order otherwise. Targets caught in a cycle come last.
    fn order(&self, targets: &[&Dependency]) -> Vec<ConditionKey> {
        dependency_order(targets)
    }

    /// Compute `key` from its resolved dependencies, given in declaration order.
    fn compute(
        &self,
        key: ConditionKey,
        dependencies: &[Condition],
        ctx: &UpdateContext<'_>,
    ) -> Result<ConditionBuilder, DerivationError>;
}

/// Kahn's algorithm over the target set.
pub fn dependency_order(targets: &[&Dependency]) -> Vec<ConditionKey> {
    let target_keys: HashSet<ConditionKey> = targets.iter().map(|d| d.target).collect();
    let mut pending: HashMap<ConditionKey, usize> = targets
        .iter()
        .map(|d| {
            let inner = d
                .dependencies
                .iter()
                .filter(|dep| target_keys.contains(dep))
                .count();
            (d.target, inner)
        })
        .collect();

    let mut order = Vec::with_capacity(targets.len());
    let mut done = HashSet::new();
    loop {
        let ready: Vec<ConditionKey> = targets
            .iter()
            .map(|d| d.target)
            .filter(|key| !done.contains(key) && pending.get(key) == Some(&0))
            .collect();
        if ready.is_empty() {
            break;
        }
        for key in ready {
            done.insert(key);
            order.push(key);
            for dependent in targets.iter().filter(|d| d.dependencies.contains(&key)) {
                if let Some(count) = pending.get_mut(&dependent.target) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }
    order.extend(
        targets
            .iter()
            .map(|d| d.target)
            .filter(|key| !done.contains(key)),
    );
    order
}

pub type DerivationFn = Arc<
    dyn Fn(ConditionKey, &[Condition], &UpdateContext<'_>) -> Result<ConditionBuilder, DerivationError>
        + Send
        + Sync,
>;

/// Engine dispatching to a callback registered per derived key, with an
/// optional fallback for unregistered keys.
#[derive(Default, Clone)]
pub struct CallbackEngine {
    callbacks: HashMap<ConditionKey, DerivationFn>,
    fallback: Option<DerivationFn>,
}

impl CallbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, key: ConditionKey, callback: F) -> &mut Self
    where
        F: Fn(ConditionKey, &[Condition], &UpdateContext<'_>) -> Result<ConditionBuilder, DerivationError>
            + Send
            + Sync
            + 'static,
    {
        self.callbacks.insert(key, Arc::new(callback));
        self
    }

    pub fn with_fallback<F>(mut self, callback: F) -> Self
    where
        F: Fn(ConditionKey, &[Condition], &UpdateContext<'_>) -> Result<ConditionBuilder, DerivationError>
            + Send
            + Sync
            + 'static,
    {
        self.fallback = Some(Arc::new(callback));
        self
    }
}

impl DerivationEngine for CallbackEngine {
    fn compute(
        &self,
        key: ConditionKey,
        dependencies: &[Condition],
        ctx: &UpdateContext<'_>,
    ) -> Result<ConditionBuilder, DerivationError> {
        match self.callbacks.get(&key).or(self.fallback.as_ref()) {
            Some(callback) => callback(key, dependencies, ctx),
            None => Err(DerivationError::Failed(format!(
                "no derivation registered for {}",
                key
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iov::IovType;

    fn dep(target: u64, dependencies: &[u64]) -> Dependency {
        Dependency {
            target: ConditionKey(target),
            dependencies: dependencies.iter().map(|k| ConditionKey(*k)).collect(),
        }
    }

    #[test]
    fn dependents_follow_their_dependencies() {
        let deps = [dep(3, &[2]), dep(2, &[1]), dep(4, &[100])];
        let refs: Vec<_> = deps.iter().collect();
        assert_eq!(
            dependency_order(&refs),
            vec![ConditionKey(2), ConditionKey(4), ConditionKey(3)]
        );
    }

    #[test]
    fn cycles_are_appended_last() {
        let deps = [dep(1, &[2]), dep(2, &[1]), dep(3, &[])];
        let refs: Vec<_> = deps.iter().collect();
        assert_eq!(
            dependency_order(&refs),
            vec![ConditionKey(3), ConditionKey(1), ConditionKey(2)]
        );
    }

    #[test]
    fn callback_engine_dispatches_by_key() {
        let mut engine = CallbackEngine::new();
        engine.register(ConditionKey(7), |key, deps, _| {
            Ok(ConditionBuilder::new(key).with_value(deps.len()).derived())
        });

        let run = Arc::new(IovType::new(0, "run"));
        let iov = Iov::discrete(run, 5);
        let ctx = UpdateContext::new(&iov).with_user(&42u32);
        assert_eq!(ctx.user::<u32>(), Some(&42));

        let built = engine.compute(ConditionKey(7), &[], &ctx).unwrap();
        assert!(built.is_valid());
        assert!(matches!(
            engine.compute(ConditionKey(8), &[], &ctx),
            Err(DerivationError::Failed(_))
        ));
    }
}
