//! Monitor registry.
//!
//! Tracks the ordered set of observation targets of a session: cache set
//! indices for Prime+Probe, raw addresses for Flush+Reload. Registration
//! order fixes the column order of every result row produced afterwards.

use thiserror::Error;

use crate::session::SessionError;

/// Errors that can occur when changing the monitored target set.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorError {
    /// The set index lies outside the discovered geometry.
    #[error("cache set {index} is outside the discovered geometry ({total} sets)")]
    OutOfRange {
        /// Rejected set index
        index: usize,
        /// Total sets in the geometry
        total: usize,
    },
    /// The set exists but has no usable eviction set.
    #[error("cache set {index} has no usable eviction set")]
    Unusable {
        /// Rejected set index
        index: usize,
    },
    /// The target is already monitored.
    #[error("target is already monitored")]
    Duplicate,
    /// The target is not currently monitored.
    #[error("target is not monitored")]
    NotMonitored,
    /// The registry is at capacity.
    #[error("monitor registry is full ({capacity} targets)")]
    Exhausted {
        /// Registry capacity
        capacity: usize,
    },
    /// The session is released.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Ordered collection of monitored targets.
///
/// Rejections leave the registry unchanged; targets are never clamped or
/// wrapped into range by the owning session.
#[derive(Debug)]
pub struct MonitorRegistry<T> {
    targets: Vec<T>,
    capacity: usize,
}

impl<T: Copy + PartialEq> MonitorRegistry<T> {
    /// Creates an empty registry bounded at `capacity` targets.
    pub fn with_capacity(capacity: usize) -> Self {
        MonitorRegistry {
            targets: Vec::new(),
            capacity,
        }
    }

    /// Appends a target.
    ///
    /// # Errors
    ///
    /// [`MonitorError::Duplicate`] if the target is already present,
    /// [`MonitorError::Exhausted`] if the registry is full.
    pub fn insert(&mut self, target: T) -> Result<(), MonitorError> {
        if self.targets.contains(&target) {
            return Err(MonitorError::Duplicate);
        }
        if self.targets.len() == self.capacity {
            return Err(MonitorError::Exhausted {
                capacity: self.capacity,
            });
        }
        self.targets.push(target);
        Ok(())
    }

    /// Removes a target, preserving the order of the rest.
    ///
    /// # Errors
    ///
    /// [`MonitorError::NotMonitored`] if the target is absent.
    pub fn remove(&mut self, target: T) -> Result<(), MonitorError> {
        match self.targets.iter().position(|&t| t == target) {
            Some(index) => {
                self.targets.remove(index);
                Ok(())
            }
            None => Err(MonitorError::NotMonitored),
        }
    }

    /// Drops every target.
    pub fn clear(&mut self) {
        self.targets.clear();
    }

    /// Monitored targets in registration order.
    pub fn targets(&self) -> &[T] {
        &self.targets
    }

    /// Number of monitored targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether nothing is monitored.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_keeps_registration_order() {
        let mut registry = MonitorRegistry::with_capacity(8);
        registry.insert(17usize).unwrap();
        registry.insert(81).unwrap();
        registry.insert(145).unwrap();
        assert_eq!(registry.targets(), &[17, 81, 145]);
    }

    #[test]
    fn duplicate_is_rejected_and_registry_unchanged() {
        let mut registry = MonitorRegistry::with_capacity(8);
        registry.insert(3usize).unwrap();
        registry.insert(4).unwrap();
        assert_eq!(registry.insert(3), Err(MonitorError::Duplicate));
        assert_eq!(registry.targets(), &[3, 4]);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut registry = MonitorRegistry::with_capacity(2);
        registry.insert(0usize).unwrap();
        registry.insert(1).unwrap();
        assert_eq!(
            registry.insert(2),
            Err(MonitorError::Exhausted { capacity: 2 })
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn remove_preserves_order_of_rest() {
        let mut registry = MonitorRegistry::with_capacity(8);
        for set in [10usize, 20, 30] {
            registry.insert(set).unwrap();
        }
        registry.remove(20).unwrap();
        assert_eq!(registry.targets(), &[10, 30]);
        assert_eq!(registry.remove(20), Err(MonitorError::NotMonitored));
    }
}
