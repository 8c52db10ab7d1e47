use crate::condition::ConditionKey;

/// Errors raised by the conditions store.
///
/// All of them are fatal for the current request. Absence of data is not an
/// error and never shows up here.
#[derive(Debug, thiserror::Error)]
pub enum ConditionsError {
    /// An IOV type index is reused with a different name.
    #[error("Cannot register IOV type {name}. Type {index} already in use by {existing}")]
    IovTypeConflict {
        index: usize,
        name: String,
        existing: String,
    },

    #[error("Cannot register IOV type {name} with index {index}. Value out of bounds: [0,{capacity})")]
    IovTypeOutOfBounds {
        index: usize,
        name: String,
        capacity: usize,
    },

    #[error("Request to access an unregistered IOV type: {0}")]
    UnknownIovType(String),

    #[error("Invalid IOV: {0}")]
    InvalidIov(String),

    /// Conditions without payload may not be registered or inserted.
    #[error("Invalid condition {key} may not be registered [IOV: {iov}]")]
    InvalidCondition { key: ConditionKey, iov: String },

    /// A discrete request resolved to more than one condition.
    #[error("Condition {key} is ambiguous for IOV {iov}: {candidates} candidates")]
    AmbiguousCondition {
        key: ConditionKey,
        iov: String,
        candidates: usize,
    },

    #[error("Failed to load condition {key} for IOV {iov}: {source}")]
    Storage {
        key: ConditionKey,
        iov: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to register condition {key} according to IOV {iov}")]
    RegistrationFailed { key: ConditionKey, iov: String },

    #[error("Conditions slice is not bound to an IOV. Call prepare first.")]
    UnboundSlice,
}

/// Failure modes of a [`crate::loader::DataLoader`].
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// Recoverable: the key has no stored value for the requested IOV.
    #[error("Condition not found")]
    NotFound,
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Failure modes of a [`crate::derivation::DerivationEngine`]. Always recoverable.
#[derive(Debug, thiserror::Error)]
pub enum DerivationError {
    #[error("Missing dependency {0}")]
    MissingDependency(ConditionKey),
    #[error("Derivation failed: {0}")]
    Failed(String),
}
