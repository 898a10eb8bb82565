//! Named instance registry
//!
//! An explicit create-or-get map owned by whoever composes the primitives.
//! There is no process-wide default registry.

use crate::errors::ConfigError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Thread-safe map from name to a shared primitive instance
#[derive(Debug)]
pub struct Registry<T> {
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Return the instance registered under `name`, creating it with `create`
    /// if there is none
    ///
    /// `create` runs at most once per name, under the write lock. A
    /// construction error leaves the registry unchanged.
    pub fn get_or_insert_with<F>(&self, name: &str, create: F) -> Result<Arc<T>, ConfigError>
    where
        F: FnOnce() -> Result<T, ConfigError>,
    {
        if let Some(existing) = self.find(name) {
            return Ok(existing);
        }

        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(name) {
            return Ok(Arc::clone(existing));
        }
        let created = Arc::new(create()?);
        entries.insert(name.to_string(), Arc::clone(&created));
        tracing::debug!(%name, "registered instance");
        Ok(created)
    }

    pub fn find(&self, name: &str) -> Option<Arc<T>> {
        self.entries.read().get(name).cloned()
    }

    /// Unregister `name`; callers holding the instance keep using it
    pub fn remove(&self, name: &str) -> Option<Arc<T>> {
        self.entries.write().remove(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulkhead::{BulkheadConfig, SemaphoreBulkhead};
    use crate::circuit::{CircuitBreaker, CircuitBreakerConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_get_or_insert_creates_once() {
        let registry: Registry<CircuitBreaker> = Registry::new();
        let created = AtomicUsize::new(0);

        let make = || {
            created.fetch_add(1, Ordering::SeqCst);
            CircuitBreaker::new("payments", CircuitBreakerConfig::default())
        };
        let first = registry.get_or_insert_with("payments", make).unwrap();
        let second = registry
            .get_or_insert_with("payments", || {
                created.fetch_add(1, Ordering::SeqCst);
                CircuitBreaker::new("payments", CircuitBreakerConfig::default())
            })
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_construction_is_not_registered() {
        let registry: Registry<SemaphoreBulkhead> = Registry::new();
        let result = registry.get_or_insert_with("db", || {
            SemaphoreBulkhead::new(
                "db",
                BulkheadConfig {
                    max_concurrent_calls: 0,
                    ..Default::default()
                },
            )
        });

        assert!(result.is_err());
        assert!(registry.find("db").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_find_remove_and_names() {
        let registry: Registry<SemaphoreBulkhead> = Registry::default();
        for name in ["search", "billing"] {
            registry
                .get_or_insert_with(name, || {
                    SemaphoreBulkhead::new(name, BulkheadConfig::default())
                })
                .unwrap();
        }

        assert_eq!(registry.names(), vec!["billing", "search"]);
        let removed = registry.remove("search").unwrap();
        assert_eq!(removed.name(), "search");
        assert!(registry.find("search").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_get_or_insert_shares_instance() {
        let registry: Arc<Registry<SemaphoreBulkhead>> = Arc::new(Registry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry
                        .get_or_insert_with("shared", || {
                            SemaphoreBulkhead::new("shared", BulkheadConfig::default())
                        })
                        .unwrap()
                })
            })
            .collect();

        let instances: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(instances.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
