//! Queue provider registry.
//!
//! Providers map queue names to queue implementations. A deployment has one
//! default provider; specific queues can be routed elsewhere. A single
//! fetch may only span queues served by one provider.

use dashmap::DashMap;
use std::sync::Arc;

use crate::db::DbContext;
use crate::error::{Error, Result};
use crate::queue::JobQueue;

/// Maps a queue name to the queue implementation serving it.
pub trait QueueProvider: Send + Sync {
    fn job_queue(&self) -> Arc<JobQueue>;
}

/// The built-in provider: one shared [`JobQueue`] over the job collection.
pub struct DefaultQueueProvider {
    queue: Arc<JobQueue>,
}

impl DefaultQueueProvider {
    pub fn new(context: Arc<DbContext>) -> Self {
        Self {
            queue: Arc::new(JobQueue::new(context)),
        }
    }
}

impl QueueProvider for DefaultQueueProvider {
    fn job_queue(&self) -> Arc<JobQueue> {
        Arc::clone(&self.queue)
    }
}

/// Registry of queue providers keyed by queue name.
pub struct QueueProviders {
    default_provider: Arc<dyn QueueProvider>,
    by_queue: DashMap<String, Arc<dyn QueueProvider>>,
}

impl QueueProviders {
    /// A registry with only the required default provider.
    pub fn new(default_provider: Arc<dyn QueueProvider>) -> Self {
        Self {
            default_provider,
            by_queue: DashMap::new(),
        }
    }

    /// Route `queue` to a specific provider instead of the default.
    pub fn register(&self, queue: impl Into<String>, provider: Arc<dyn QueueProvider>) {
        self.by_queue.insert(queue.into(), provider);
    }

    /// The provider serving `queue`.
    pub fn provider_for(&self, queue: &str) -> Arc<dyn QueueProvider> {
        self.by_queue
            .get(queue)
            .map(|entry| Arc::clone(entry.value()))
            .unwrap_or_else(|| Arc::clone(&self.default_provider))
    }

    /// Resolve the single provider serving every queue in `queues`.
    ///
    /// Fails with [`Error::MixedProviders`] when the set spans more than
    /// one provider, and with an invalid-argument error when it is empty.
    pub fn resolve(&self, queues: &[String]) -> Result<Arc<dyn QueueProvider>> {
        let mut resolved: Option<Arc<dyn QueueProvider>> = None;
        for queue in queues {
            let provider = self.provider_for(queue);
            match &resolved {
                None => resolved = Some(provider),
                Some(previous) if Arc::ptr_eq(previous, &provider) => {}
                Some(_) => return Err(Error::MixedProviders),
            }
        }
        resolved.ok_or_else(|| Error::invalid_argument("queues must not be empty"))
    }
}
