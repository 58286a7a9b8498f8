//! Process-wide context holding the queue backend of every host.
//!
//! Passed explicitly to setup and teardown code instead of living in a
//! global. Cheap to clone; clones share the same registry.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::QueueError;
use crate::queue::QueueBackend;

#[derive(Clone, Default)]
pub struct Runtime {
    queues: Arc<DashMap<String, Arc<dyn QueueBackend>>>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend` for `host`, returning the backend it replaced.
    pub fn set_queue(
        &self,
        host: &str,
        backend: Arc<dyn QueueBackend>,
    ) -> Option<Arc<dyn QueueBackend>> {
        self.queues.insert(host.to_string(), backend)
    }

    pub fn queue(&self, host: &str) -> Option<Arc<dyn QueueBackend>> {
        self.queues.get(host).map(|q| q.value().clone())
    }

    pub fn remove_queue(&self, host: &str) -> Option<Arc<dyn QueueBackend>> {
        self.queues.remove(host).map(|(_, q)| q)
    }

    /// Registered host names, sorted.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.queues.iter().map(|q| q.key().clone()).collect();
        hosts.sort();
        hosts
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Remove and close every backend. Returns the hosts whose close failed.
    pub async fn close_all(&self) -> Vec<(String, QueueError)> {
        let mut failures = Vec::new();

        for host in self.hosts() {
            let Some(backend) = self.remove_queue(&host) else {
                continue;
            };
            if let Err(e) = backend.close().await {
                tracing::error!(host = %host, error = %e, "Failed to close queue backend");
                failures.push((host, e));
            }
        }

        failures
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").field("hosts", &self.hosts()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueueBackend;

    #[test]
    fn test_set_and_replace() {
        let runtime = Runtime::new();
        assert!(runtime.is_empty());

        let first: Arc<dyn QueueBackend> = Arc::new(MemoryQueueBackend::unbounded());
        let second: Arc<dyn QueueBackend> = Arc::new(MemoryQueueBackend::unbounded());

        assert!(runtime.set_queue("default", first.clone()).is_none());
        let replaced = runtime.set_queue("default", second.clone()).unwrap();

        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(Arc::ptr_eq(&runtime.queue("default").unwrap(), &second));
        assert_eq!(runtime.len(), 1);
    }

    #[test]
    fn test_clones_share_registry() {
        let runtime = Runtime::new();
        let clone = runtime.clone();
        clone.set_queue("b", Arc::new(MemoryQueueBackend::unbounded()));
        clone.set_queue("a", Arc::new(MemoryQueueBackend::unbounded()));

        assert_eq!(runtime.hosts(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_close_all_empties_registry() {
        let runtime = Runtime::new();
        runtime.set_queue("a", Arc::new(MemoryQueueBackend::unbounded()));
        runtime.set_queue("b", Arc::new(MemoryQueueBackend::unbounded()));

        let failures = runtime.close_all().await;
        assert!(failures.is_empty());
        assert!(runtime.is_empty());
    }
}
