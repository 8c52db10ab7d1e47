//! Eviction policies for the permanent pools.
//!
//! A policy is consulted once per cleanup cycle: first per IOV type
//! ([`CleanupPolicy::applies_to`]), then per pool of that type
//! ([`CleanupPolicy::evict_pool`]). Surviving pools are optionally pruned of
//! conditions older than [`CleanupPolicy::max_condition_age`].

use crate::{
    iov::IovKey,
    iov_pool::ConditionsIovPool,
    pool::ConditionsPool,
};

pub trait CleanupPolicy: Send + Sync {
    /// Whether the pools of this IOV type are visited in this cycle.
    fn applies_to(&self, _iov_pool: &ConditionsIovPool) -> bool {
        true
    }

    /// Whether the whole pool is dropped.
    fn evict_pool(&self, pool: &ConditionsPool) -> bool;

    /// Age threshold for conditions of surviving pools. `None` keeps them all.
    fn max_condition_age(&self) -> Option<u32> {
        None
    }
}

/// Drops pools that were not selected for more than `max_age` cycles.
#[derive(Debug, Clone, Copy)]
pub struct AgeCleanup {
    pub max_age: u32,
}

impl AgeCleanup {
    pub fn new(max_age: u32) -> Self {
        Self { max_age }
    }
}

impl CleanupPolicy for AgeCleanup {
    fn evict_pool(&self, pool: &ConditionsPool) -> bool {
        pool.age() > self.max_age
    }

    fn max_condition_age(&self) -> Option<u32> {
        Some(self.max_age)
    }
}

/// Drops every pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullCleanup;

impl CleanupPolicy for FullCleanup {
    fn evict_pool(&self, _pool: &ConditionsPool) -> bool {
        true
    }
}

/// Drops pools of one IOV type lying entirely outside the active window.
#[derive(Debug, Clone)]
pub struct WindowCleanup {
    pub iov_type: usize,
    pub window: IovKey,
}

impl WindowCleanup {
    pub fn new(iov_type: usize, window: IovKey) -> Self {
        Self { iov_type, window }
    }
}

impl CleanupPolicy for WindowCleanup {
    fn applies_to(&self, iov_pool: &ConditionsIovPool) -> bool {
        iov_pool.iov_type().index() == self.iov_type
    }

    fn evict_pool(&self, pool: &ConditionsPool) -> bool {
        !pool.iov().key().overlaps(&self.window)
    }
}
