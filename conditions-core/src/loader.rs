//! Access to raw conditions in persistent storage.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::RwLock;

use crate::{
    condition::{ConditionBuilder, ConditionKey, Payload},
    content::LoadInfo,
    error::LoaderError,
    iov::{Iov, IovKey},
};

/// A raw condition fetched from storage, together with its stored validity.
#[derive(Debug)]
pub struct Loaded {
    pub validity: IovKey,
    pub condition: ConditionBuilder,
}

pub trait DataLoader: Send + Sync {
    /// Fetch the value of `key` valid for `iov`.
    fn load(&self, key: ConditionKey, info: &LoadInfo, iov: &Iov) -> Result<Loaded, LoaderError>;

    /// Fetch several keys for the same IOV. Results follow the request order.
    fn load_batch(
        &self,
        requests: &[(ConditionKey, &LoadInfo)],
        iov: &Iov,
    ) -> Vec<Result<Loaded, LoaderError>> {
        requests
            .iter()
            .map(|(key, info)| self.load(*key, info, iov))
            .collect()
    }
}

#[derive(Clone)]
struct StoredValue {
    validity: IovKey,
    name: Option<String>,
    payload: Payload,
}

/// Loader backed by an in-memory table of `key -> [(validity, payload)]`.
#[derive(Default)]
pub struct MemoryLoader {
    values: RwLock<BTreeMap<ConditionKey, Vec<StoredValue>>>,
    loads: AtomicUsize,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: std::any::Any + Send + Sync>(&self, key: ConditionKey, validity: IovKey, value: T) {
        self.insert_payload(key, validity, None, std::sync::Arc::new(value));
    }

    pub fn insert_named<T: std::any::Any + Send + Sync>(
        &self,
        key: ConditionKey,
        name: impl Into<String>,
        validity: IovKey,
        value: T,
    ) {
        self.insert_payload(key, validity, Some(name.into()), std::sync::Arc::new(value));
    }

    fn insert_payload(&self, key: ConditionKey, validity: IovKey, name: Option<String>, payload: Payload) {
        self.values.write().entry(key).or_default().push(StoredValue {
            validity,
            name,
            payload,
        });
    }

    /// Number of successful loads served so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

impl DataLoader for MemoryLoader {
    fn load(&self, key: ConditionKey, info: &LoadInfo, iov: &Iov) -> Result<Loaded, LoaderError> {
        let values = self.values.read();
        let stored = values
            .get(&key)
            .and_then(|entries| entries.iter().find(|v| v.validity.contains(&iov.key())))
            .ok_or(LoaderError::NotFound)?;

        let mut condition = ConditionBuilder::new(key)
            .with_address(info.address.clone())
            .with_payload(stored.payload.clone());
        if let Some(name) = &stored.name {
            condition = condition.with_name(name.clone());
        }
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(Loaded {
            validity: stored.validity,
            condition,
        })
    }
}
