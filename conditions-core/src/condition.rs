//! Condition records.
//!
//! A condition starts life as a mutable [`ConditionBuilder`] produced by a
//! loader or a derivation. Binding it to an IOV publishes it as a
//! [`Condition`]: a cheap, reference-counted handle whose payload can no
//! longer change. Only the flags and the cleanup age stay mutable.

use std::{
    any::Any,
    fmt::Display,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use bitflags::bitflags;

use crate::iov::Iov;

/// Type-erased condition payload.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// 64-bit condition identifier.
///
/// The upper 32 bits hash the detector element path, the lower 32 bits hash
/// the item name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConditionKey(pub u64);

impl ConditionKey {
    pub fn new(detector: &str, item: &str) -> Self {
        Self::from_parts(hash32(detector), hash32(item))
    }

    pub fn from_parts(detector_key: u32, item_key: u32) -> Self {
        Self(((detector_key as u64) << 32) | item_key as u64)
    }

    /// Key of an item of a detector element given by path.
    pub fn for_item(detector: &str, item_key: u32) -> Self {
        Self::from_parts(hash32(detector), item_key)
    }

    pub fn detector_key(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn item_key(&self) -> u32 {
        self.0 as u32
    }
}

impl From<u64> for ConditionKey {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for ConditionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// FNV-1a, 32 bit.
pub fn hash32(value: &str) -> u32 {
    value.bytes().fold(0x811c_9dc5u32, |hash, byte| {
        (hash ^ byte as u32).wrapping_mul(0x0100_0193)
    })
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConditionFlags: u32 {
        /// Registered with a permanent pool.
        const ACTIVE = 1 << 0;
        /// Computed from other conditions rather than loaded.
        const DERIVED = 1 << 1;
    }
}

/// An unpublished condition.
#[derive(Clone)]
pub struct ConditionBuilder {
    key: ConditionKey,
    name: Option<String>,
    address: Option<String>,
    value: Option<Payload>,
    flags: ConditionFlags,
}

impl ConditionBuilder {
    pub fn new(key: impl Into<ConditionKey>) -> Self {
        Self {
            key: key.into(),
            name: None,
            address: None,
            value: None,
            flags: ConditionFlags::empty(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_value<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.value = Some(Arc::new(value));
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.value = Some(payload);
        self
    }

    pub fn derived(mut self) -> Self {
        self.flags |= ConditionFlags::DERIVED;
        self
    }

    pub fn key(&self) -> ConditionKey {
        self.key
    }

    /// A condition without payload is invalid and cannot be published.
    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }

    /// Publish the condition under `iov`. Returns `None` for invalid builders.
    pub fn bind(self, iov: Iov) -> Option<Condition> {
        let value = self.value?;
        Some(Condition {
            inner: Arc::new(ConditionInner {
                key: self.key,
                name: self.name,
                address: self.address,
                value,
                iov,
                flags: AtomicU32::new(self.flags.bits()),
                age: AtomicU32::new(0),
            }),
        })
    }
}

impl std::fmt::Debug for ConditionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionBuilder")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("valid", &self.is_valid())
            .field("flags", &self.flags)
            .finish()
    }
}

struct ConditionInner {
    key: ConditionKey,
    name: Option<String>,
    address: Option<String>,
    value: Payload,
    iov: Iov,
    flags: AtomicU32,
    age: AtomicU32,
}

/// A published, shared condition.
///
/// Cloning is cheap and yields another handle to the same record.
#[derive(Clone)]
pub struct Condition {
    inner: Arc<ConditionInner>,
}

impl Condition {
    pub fn key(&self) -> ConditionKey {
        self.inner.key
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn address(&self) -> Option<&str> {
        self.inner.address.as_deref()
    }

    pub fn iov(&self) -> &Iov {
        &self.inner.iov
    }

    pub fn payload(&self) -> &Payload {
        &self.inner.value
    }

    /// Typed access to the payload.
    pub fn value<T: Any>(&self) -> Option<&T> {
        self.inner.value.downcast_ref::<T>()
    }

    pub fn flags(&self) -> ConditionFlags {
        ConditionFlags::from_bits_truncate(self.inner.flags.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.flags().contains(ConditionFlags::ACTIVE)
    }

    pub fn is_derived(&self) -> bool {
        self.flags().contains(ConditionFlags::DERIVED)
    }

    pub(crate) fn activate(&self) {
        self.inner
            .flags
            .fetch_or(ConditionFlags::ACTIVE.bits(), Ordering::AcqRel);
    }

    /// Number of cleanup cycles survived since the condition was last used.
    pub fn age(&self) -> u32 {
        self.inner.age.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self) {
        self.inner.age.store(0, Ordering::Relaxed);
    }

    pub(crate) fn tick(&self) {
        self.inner.age.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether both handles refer to the same record.
    pub fn ptr_eq(&self, other: &Condition) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition")
            .field("key", &self.inner.key)
            .field("name", &self.inner.name)
            .field("iov", &self.inner.iov.to_string())
            .field("flags", &self.flags())
            .field("age", &self.age())
            .finish()
    }
}

impl Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner.name {
            Some(name) => write!(f, "{} [{}] IOV:{}", name, self.inner.key, self.inner.iov),
            None => write!(f, "{} IOV:{}", self.inner.key, self.inner.iov),
        }
    }
}
