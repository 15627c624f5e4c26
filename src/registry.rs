//! Mapping from queue names to the queue implementation that owns them.
//!
//! Each named queue is bound to exactly one provider; everything else falls
//! through to the default provider. Ambiguous configurations are rejected at
//! registration time, not at commit time.

use crate::errors::{Error, Result};
use futures_util::future::BoxFuture;
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

/// A queue implementation that can accept enqueue mutations on a caller's
/// open transaction.
///
/// [`JobQueue`](crate::JobQueue) is the relational implementation; alternate
/// transports implement the same contract.
pub trait QueueProvider: Send + Sync {
    /// Insert `job_id` into `queue` without committing.
    fn enqueue<'a>(
        &'a self,
        tx: &'a mut Transaction<'_, Postgres>,
        queue: &'a str,
        job_id: i64,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Registry resolving queue names to providers.
pub struct QueueRegistry {
    default: Arc<dyn QueueProvider>,
    bindings: HashMap<String, Arc<dyn QueueProvider>>,
}

impl QueueRegistry {
    /// Create a registry where every unbound queue name resolves to
    /// `default`.
    pub fn new(default: Arc<dyn QueueProvider>) -> Self {
        Self {
            default,
            bindings: HashMap::new(),
        }
    }

    /// Bind a queue name to a specific provider.
    ///
    /// Binding the same name twice is rejected eagerly with
    /// [`Error::QueueAlreadyBound`].
    pub fn bind(&mut self, queue: &str, provider: Arc<dyn QueueProvider>) -> Result<()> {
        if queue.is_empty() {
            return Err(Error::InvalidArgument("queue name must not be empty"));
        }

        match self.bindings.entry(queue.to_owned()) {
            Entry::Occupied(_) => Err(Error::QueueAlreadyBound(queue.to_owned())),
            Entry::Vacant(slot) => {
                slot.insert(provider);
                Ok(())
            }
        }
    }

    /// The provider owning `queue`.
    pub fn resolve(&self, queue: &str) -> Arc<dyn QueueProvider> {
        self.bindings
            .get(queue)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("bindings", &self.bindings.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};
    use futures_util::FutureExt;

    struct StubProvider;

    impl QueueProvider for StubProvider {
        fn enqueue<'a>(
            &'a self,
            _tx: &'a mut Transaction<'_, Postgres>,
            _queue: &'a str,
            _job_id: i64,
        ) -> BoxFuture<'a, Result<()>> {
            async { Ok(()) }.boxed()
        }
    }

    #[test]
    fn duplicate_bindings_are_rejected_eagerly() {
        let mut registry = QueueRegistry::new(Arc::new(StubProvider));
        assert_ok!(registry.bind("critical", Arc::new(StubProvider)));

        let error = assert_err!(registry.bind("critical", Arc::new(StubProvider)));
        assert!(matches!(error, Error::QueueAlreadyBound(name) if name == "critical"));
    }

    #[test]
    fn empty_queue_names_are_rejected() {
        let mut registry = QueueRegistry::new(Arc::new(StubProvider));
        let error = assert_err!(registry.bind("", Arc::new(StubProvider)));
        assert!(matches!(error, Error::InvalidArgument(_)));
    }

    #[test]
    fn unbound_names_resolve_to_the_default_provider() {
        let default: Arc<dyn QueueProvider> = Arc::new(StubProvider);
        let bound: Arc<dyn QueueProvider> = Arc::new(StubProvider);

        let mut registry = QueueRegistry::new(default.clone());
        assert_ok!(registry.bind("critical", bound.clone()));

        assert!(Arc::ptr_eq(&registry.resolve("critical"), &bound));
        assert!(Arc::ptr_eq(&registry.resolve("anything-else"), &default));
    }
}
