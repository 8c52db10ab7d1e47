use std::sync::Arc;

use bitflags::bitflags;

use crate::{
    condition::{Condition, ConditionBuilder, ConditionKey},
    content::ConditionsContent,
    error::ConditionsError,
    iov::Iov,
    manager::ConditionsManager,
    pool::ConditionsPool,
    result::PrepareResult,
    user_pool::UserPool,
};

bitflags! {
    /// Where [`ConditionsSlice::manage`] registers a condition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ManageFlags: u8 {
        const REGISTER_MANAGER = 1 << 0;
        const REGISTER_POOL = 1 << 1;
        const REGISTER_FULL = Self::REGISTER_MANAGER.bits() | Self::REGISTER_POOL.bits();
    }
}

/// A request-scoped view of the declared content, resolved for one IOV at a time.
///
/// A slice is owned by a single request. It may be prepared repeatedly
/// for different IOVs; each `prepare` empties and refills its user pool.
pub struct ConditionsSlice {
    manager: Arc<ConditionsManager>,
    content: Arc<ConditionsContent>,
    pub(crate) pool: UserPool,
}

impl ConditionsSlice {
    pub fn new(manager: Arc<ConditionsManager>, content: Arc<ConditionsContent>) -> Self {
        Self {
            manager,
            content,
            pool: UserPool::new(),
        }
    }

    pub fn manager(&self) -> &Arc<ConditionsManager> {
        &self.manager
    }

    pub fn content(&self) -> &Arc<ConditionsContent> {
        &self.content
    }

    pub fn pool(&self) -> &UserPool {
        &self.pool
    }

    /// The requested IOV of the last `prepare`.
    pub fn iov(&self) -> Option<&Iov> {
        self.pool.iov()
    }

    /// Combined validity of the resolved conditions.
    pub fn validity(&self) -> Option<&Iov> {
        self.pool.validity()
    }

    /// Resolve the declared content for `iov` through the owning manager.
    pub fn prepare(&mut self, iov: &Iov) -> Result<PrepareResult, ConditionsError> {
        let manager = self.manager.clone();
        manager.prepare(iov, self, None)
    }

    /// Register a condition of a detector element with the manager under the
    /// slice's combined validity, then add it to the slice.
    pub fn insert(
        &mut self,
        detector: &str,
        item_key: u32,
        condition: ConditionBuilder,
    ) -> Result<bool, ConditionsError> {
        let key = ConditionKey::for_item(detector, item_key);
        if condition.key() != key {
            return Err(ConditionsError::InvalidCondition {
                key: condition.key(),
                iov: format!("expected key {} for {}", key, detector),
            });
        }
        let validity = self.validity().cloned().ok_or(ConditionsError::UnboundSlice)?;
        let pool = self.manager.register_iov(validity.iov_type(), validity.key())?;
        let registered = self.register(&pool, condition)?;
        Ok(self.pool.insert(registered))
    }

    /// Read through to the user pool. No implicit load.
    pub fn get(&self, detector: &str, item_key: u32) -> Option<Condition> {
        self.pool.get(ConditionKey::for_item(detector, item_key))
    }

    pub fn get_key(&self, key: ConditionKey) -> Option<Condition> {
        self.pool.get(key)
    }

    /// Register a condition with the manager, the local pool, or both.
    ///
    /// With `REGISTER_MANAGER` the condition goes into `pool` if given,
    /// otherwise into the manager pool of the slice's combined validity.
    pub fn manage(
        &mut self,
        pool: Option<&Arc<ConditionsPool>>,
        condition: ConditionBuilder,
        flags: ManageFlags,
    ) -> Result<bool, ConditionsError> {
        let validity = self.validity().cloned().ok_or(ConditionsError::UnboundSlice)?;
        let key = condition.key();
        if !condition.is_valid() {
            return Err(ConditionsError::InvalidCondition {
                key,
                iov: validity.to_string(),
            });
        }

        let published = if flags.contains(ManageFlags::REGISTER_MANAGER) {
            let pool = match pool {
                Some(pool) => pool.clone(),
                None => self.manager.register_iov(validity.iov_type(), validity.key())?,
            };
            self.register(&pool, condition)?
        } else {
            condition
                .bind(validity.clone())
                .ok_or_else(|| ConditionsError::InvalidCondition {
                    key,
                    iov: validity.to_string(),
                })?
        };

        if flags.contains(ManageFlags::REGISTER_POOL) {
            return Ok(self.pool.insert(published));
        }
        Ok(flags.contains(ManageFlags::REGISTER_MANAGER))
    }

    /// Clear the user pool. The manager's pools are not affected.
    pub fn reset(&mut self) {
        self.pool.clear();
    }

    pub fn scan<F: FnMut(&Condition)>(&self, processor: F) {
        self.pool.scan(processor)
    }

    fn register(
        &self,
        pool: &ConditionsPool,
        condition: ConditionBuilder,
    ) -> Result<Condition, ConditionsError> {
        let key = condition.key();
        self.manager
            .publish(pool, condition)?
            .ok_or_else(|| ConditionsError::RegistrationFailed {
                key,
                iov: pool.iov().to_string(),
            })
    }
}

impl std::fmt::Debug for ConditionsSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionsSlice")
            .field("content", &self.content.len())
            .field("iov", &self.pool.iov().map(ToString::to_string))
            .field("conditions", &self.pool.len())
            .finish()
    }
}
