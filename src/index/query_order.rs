//! Backend consultation order

use ahash::AHashSet;

use super::IndexLocation;

/// Ordered set of index locations; duplicates collapse to the first occurrence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOrder {
    order: Vec<IndexLocation>,
}

impl QueryOrder {
    pub fn new(locations: impl IntoIterator<Item = IndexLocation>) -> Self {
        let mut seen = AHashSet::new();
        let order = locations.into_iter().filter(|l| seen.insert(*l)).collect();
        Self { order }
    }

    /// Move `locations` to the front in the given order; the rest keep their
    /// relative order behind them
    pub fn prioritize(&mut self, locations: &[IndexLocation]) {
        let front = QueryOrder::new(locations.iter().copied());
        let rest = self.order.iter().copied().filter(|l| !front.contains(*l));
        self.order = front.order.iter().copied().chain(rest).collect();
    }

    pub fn contains(&self, location: IndexLocation) -> bool {
        self.order.contains(&location)
    }

    pub fn iter(&self) -> impl Iterator<Item = IndexLocation> + '_ {
        self.order.iter().copied()
    }

    pub fn as_slice(&self) -> &[IndexLocation] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for QueryOrder {
    fn default() -> Self {
        Self::new(IndexLocation::default_order())
    }
}

impl From<Vec<IndexLocation>> for QueryOrder {
    fn from(locations: Vec<IndexLocation>) -> Self {
        Self::new(locations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use IndexLocation::{Extension, Metadata};

    #[test]
    fn test_duplicates_collapse() {
        let order = QueryOrder::new([Metadata, Extension, Metadata]);
        assert_eq!(order.as_slice(), &[Metadata, Extension]);
    }

    #[test]
    fn test_prioritize() {
        let mut order = QueryOrder::default();
        assert_eq!(order.as_slice(), &[Extension, Metadata]);

        order.prioritize(&[Metadata]);
        assert_eq!(order.as_slice(), &[Metadata, Extension]);

        // idempotent
        order.prioritize(&[Metadata]);
        assert_eq!(order.as_slice(), &[Metadata, Extension]);

        order.prioritize(&[Extension, Metadata, Extension]);
        assert_eq!(order.as_slice(), &[Extension, Metadata]);
    }

    #[test]
    fn test_prioritize_adds_missing_location() {
        let mut order = QueryOrder::new([Extension]);
        order.prioritize(&[Metadata]);
        assert_eq!(order.as_slice(), &[Metadata, Extension]);
        assert!(order.contains(Metadata));
    }
}
