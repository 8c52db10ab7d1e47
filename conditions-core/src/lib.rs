//! Interval-of-validity keyed conditions store.
//!
//! Conditions are immutable values registered under the interval over which
//! they are valid. A [`slice::ConditionsSlice`] resolves a declared set of
//! keys for one point through the [`manager::ConditionsManager`], loading or
//! computing what is not yet present.

pub mod cleanup;
pub mod condition;
pub mod content;
pub mod derivation;
pub mod error;
pub mod iov;
pub mod iov_pool;
pub mod listener;
pub mod loader;
pub mod manager;
pub mod pool;
pub mod result;
pub mod slice;
pub mod update_pool;
pub mod user_pool;

pub mod prelude {
    pub use crate::cleanup::{AgeCleanup, CleanupPolicy, FullCleanup, WindowCleanup};
    pub use crate::condition::{Condition, ConditionBuilder, ConditionFlags, ConditionKey};
    pub use crate::content::{ConditionsContent, ContentEntry, Dependency, LoadInfo};
    pub use crate::derivation::{CallbackEngine, DerivationEngine, UpdateContext};
    pub use crate::error::{ConditionsError, DerivationError, LoaderError};
    pub use crate::iov::{Iov, IovKey, IovType};
    pub use crate::iov_pool::ConditionsIovPool;
    pub use crate::listener::ConditionsListener;
    pub use crate::loader::{DataLoader, Loaded, MemoryLoader};
    pub use crate::manager::{ConditionsManager, ConditionsManagerBuilder, ManagerStatistics};
    pub use crate::pool::ConditionsPool;
    pub use crate::result::PrepareResult;
    pub use crate::slice::{ConditionsSlice, ManageFlags};
}
