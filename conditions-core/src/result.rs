use std::ops::{Add, AddAssign};

/// Outcome counters of a `prepare`, `load` or `compute` call.
///
/// Every declared key of the slice's content lands in exactly one counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrepareResult {
    /// Already present in the permanent or staged pools.
    pub selected: usize,
    /// Fetched through the data loader.
    pub loaded: usize,
    /// Computed through the derivation engine.
    pub computed: usize,
    /// Not resolvable for the requested IOV.
    pub missing: usize,
}

impl PrepareResult {
    pub fn total(&self) -> usize {
        self.selected + self.loaded + self.computed + self.missing
    }
}

impl Add for PrepareResult {
    type Output = PrepareResult;

    fn add(mut self, rhs: PrepareResult) -> PrepareResult {
        self += rhs;
        self
    }
}

impl AddAssign for PrepareResult {
    fn add_assign(&mut self, rhs: PrepareResult) {
        self.selected += rhs.selected;
        self.loaded += rhs.loaded;
        self.computed += rhs.computed;
        self.missing += rhs.missing;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_accumulate() {
        let mut total = PrepareResult::default();
        total += PrepareResult {
            selected: 1,
            loaded: 2,
            computed: 3,
            missing: 4,
        };
        let total = total
            + PrepareResult {
                selected: 1,
                ..Default::default()
            };
        assert_eq!(total.selected, 2);
        assert_eq!(total.total(), 11);
    }
}
