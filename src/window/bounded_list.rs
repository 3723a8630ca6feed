//! Fixed-capacity list that evicts its oldest element when full.

use std::collections::VecDeque;

use super::errors::{WindowError, WindowResult};

/// Bounded FIFO cache. Not a protocol window: eviction is silent.
#[derive(Debug, Clone)]
pub struct BoundedList<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> BoundedList<T> {
    pub fn new(capacity: usize) -> WindowResult<Self> {
        if capacity == 0 {
            return Err(WindowError::InvalidCapacity(capacity));
        }
        Ok(Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
        })
    }

    /// Append, evicting the oldest element when at capacity.
    pub fn add(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn remove_from_head(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: PartialEq> BoundedList<T> {
    pub fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest() {
        let mut list = BoundedList::new(3).unwrap();
        for i in 1..=5 {
            list.add(i);
        }
        assert_eq!(list.len(), 3);
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![3, 4, 5]);
        assert!(!list.contains(&1));
    }

    #[test]
    fn test_remove_from_head() {
        let mut list = BoundedList::new(2).unwrap();
        list.add("a");
        list.add("b");
        assert_eq!(list.remove_from_head(), Some("a"));
        assert_eq!(list.remove_from_head(), Some("b"));
        assert_eq!(list.remove_from_head(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(
            BoundedList::<u8>::new(0).unwrap_err(),
            WindowError::InvalidCapacity(0)
        );
    }
}
