use std::sync::Arc;

use conditions_core::prelude::*;

/// Item key of the derived condition of every detector element.
pub const DERIVED_ITEM: u32 = 0xFFFF;

#[derive(Debug, Clone, Copy)]
pub struct Layout {
    /// Number of validity ranges per condition.
    pub iovs: i64,
    /// Length of each validity range.
    pub runs: i64,
    pub detectors: usize,
    pub items: u32,
}

impl Layout {
    /// Last point covered by the stored conditions.
    pub fn last_point(&self) -> i64 {
        self.iovs * self.runs
    }

    pub fn detector_name(index: usize) -> String {
        format!("/world/detector_{}", index)
    }
}

/// Populate a loader with one value per item and validity range.
pub fn populate(layout: &Layout) -> Arc<MemoryLoader> {
    let loader = Arc::new(MemoryLoader::new());
    for detector in 0..layout.detectors {
        let name = Layout::detector_name(detector);
        for item in 0..layout.items {
            let key = ConditionKey::for_item(&name, item);
            for iov in 0..layout.iovs {
                let first = iov * layout.runs + 1;
                let validity = IovKey::new(first, first + layout.runs - 1)
                    .unwrap_or_else(|_| IovKey::point(first));
                loader.insert_named(
                    key,
                    format!("{}#{}", name, item),
                    validity,
                    (first as f64) + item as f64,
                );
            }
        }
    }
    loader
}

/// Declare every stored item plus one derived sum per detector element.
pub fn content(layout: &Layout) -> ConditionsContent {
    let mut content = ConditionsContent::new();
    for detector in 0..layout.detectors {
        let name = Layout::detector_name(detector);
        let items: Vec<ConditionKey> = (0..layout.items)
            .map(|item| ConditionKey::for_item(&name, item))
            .collect();
        for (item, key) in items.iter().enumerate() {
            content.insert_key(*key, format!("{}#{}", name, item));
        }
        content.add_dependency(ConditionKey::for_item(&name, DERIVED_ITEM), items);
    }
    content
}

/// Derived conditions are the sum of their dependencies.
pub fn engine() -> CallbackEngine {
    CallbackEngine::new().with_fallback(|key, dependencies, _ctx| {
        let mut sum = 0.0;
        for dependency in dependencies {
            sum += dependency
                .value::<f64>()
                .ok_or(DerivationError::MissingDependency(dependency.key()))?;
        }
        Ok(ConditionBuilder::new(key).with_value(sum))
    })
}
