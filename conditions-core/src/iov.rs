//! Intervals of validity.
//!
//! An [`Iov`] is a closed integer interval `[first, second]` on a named axis
//! (an [`IovType`], e.g. `run` or `time`). A discrete IOV is a single point
//! (`first == second`).

use std::{cmp::Ordering, fmt::Display, sync::Arc};

use crate::error::ConditionsError;

/// A named validity axis. Immutable once registered with a manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IovType {
    index: usize,
    name: String,
}

impl IovType {
    pub(crate) fn new(index: usize, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for IovType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.index)
    }
}

/// The `[first, second]` range of an IOV. Invariant: `first <= second`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IovKey {
    first: i64,
    second: i64,
}

impl IovKey {
    pub fn new(first: i64, second: i64) -> Result<Self, ConditionsError> {
        if first > second {
            return Err(ConditionsError::InvalidIov(format!(
                "lower bound {} exceeds upper bound {}",
                first, second
            )));
        }
        Ok(Self { first, second })
    }

    pub fn point(value: i64) -> Self {
        Self {
            first: value,
            second: value,
        }
    }

    /// The unbounded key, used as the neutral element of [`IovKey::intersect`].
    pub fn full() -> Self {
        Self {
            first: i64::MIN,
            second: i64::MAX,
        }
    }

    pub fn first(&self) -> i64 {
        self.first
    }

    pub fn second(&self) -> i64 {
        self.second
    }

    pub fn is_discrete(&self) -> bool {
        self.first == self.second
    }

    pub fn overlaps(&self, other: &IovKey) -> bool {
        self.first <= other.second && other.first <= self.second
    }

    /// Whether `other` lies entirely inside `self`.
    pub fn contains(&self, other: &IovKey) -> bool {
        self.first <= other.first && other.second <= self.second
    }

    pub fn intersect(&self, other: &IovKey) -> Option<IovKey> {
        let first = self.first.max(other.first);
        let second = self.second.min(other.second);
        (first <= second).then_some(IovKey { first, second })
    }
}

impl PartialOrd for IovKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IovKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.first, self.second).cmp(&(other.first, other.second))
    }
}

impl Display for IovKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_discrete() {
            write!(f, "{}", self.first)
        } else {
            write!(f, "[{}-{}]", self.first, self.second)
        }
    }
}

/// A validity interval bound to its axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Iov {
    iov_type: Arc<IovType>,
    key: IovKey,
}

impl Iov {
    pub fn new(iov_type: Arc<IovType>, key: IovKey) -> Self {
        Self { iov_type, key }
    }

    pub fn discrete(iov_type: Arc<IovType>, point: i64) -> Self {
        Self::new(iov_type, IovKey::point(point))
    }

    pub fn range(iov_type: Arc<IovType>, first: i64, second: i64) -> Result<Self, ConditionsError> {
        Ok(Self::new(iov_type, IovKey::new(first, second)?))
    }

    pub fn iov_type(&self) -> &Arc<IovType> {
        &self.iov_type
    }

    /// Fast-path copy of the axis index.
    pub fn type_index(&self) -> usize {
        self.iov_type.index
    }

    pub fn key(&self) -> IovKey {
        self.key
    }

    pub fn has_range(&self) -> bool {
        !self.key.is_discrete()
    }

    pub fn is_same_type(&self, other: &Iov) -> bool {
        self.iov_type == other.iov_type
    }

    /// Overlap test. IOVs on different axes never overlap.
    pub fn overlaps(&self, other: &Iov) -> bool {
        self.is_same_type(other) && self.key.overlaps(&other.key)
    }

    pub fn contains(&self, other: &Iov) -> bool {
        self.is_same_type(other) && self.key.contains(&other.key)
    }

    pub fn intersect(&self, other: &Iov) -> Option<Iov> {
        if !self.is_same_type(other) {
            return None;
        }
        self.key
            .intersect(&other.key)
            .map(|key| Iov::new(self.iov_type.clone(), key))
    }
}

impl Display for Iov {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.iov_type, self.key)
    }
}
