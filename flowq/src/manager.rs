use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, instrument};

use crate::{QueueResult, QueueError, QueueConfig, queue::JobQueue, store::PriorityStore};

/// Produces the store a newly opened queue runs on
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn create(&self, config: &QueueConfig) -> QueueResult<Arc<dyn PriorityStore>>;
}

/// Hands every queue the same store instance
pub struct SharedStore(pub Arc<dyn PriorityStore>);

#[async_trait]
impl StoreFactory for SharedStore {
    async fn create(&self, _config: &QueueConfig) -> QueueResult<Arc<dyn PriorityStore>> {
        Ok(self.0.clone())
    }
}

/// Connects a Redis store per queue from `QueueConfig::store`
#[cfg(feature = "redis")]
pub struct RedisStoreFactory;

#[cfg(feature = "redis")]
#[async_trait]
impl StoreFactory for RedisStoreFactory {
    async fn create(&self, config: &QueueConfig) -> QueueResult<Arc<dyn PriorityStore>> {
        let store = crate::store::RedisStore::connect(&config.store, config.poll_interval).await?;
        Ok(Arc::new(store))
    }
}

/// Registry of open queues, one [`JobQueue`] per name.
///
/// Pass the manager (or the queues it hands out) to producers and workers;
/// there is no global instance.
pub struct QueueManager {
    factory: Box<dyn StoreFactory>,
    queues: RwLock<HashMap<String, Arc<JobQueue>>>,
}

impl QueueManager {
    pub fn new(factory: impl StoreFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Manager whose queues all share one in-process store
    #[cfg(feature = "memory")]
    pub fn in_memory() -> Self {
        Self::new(SharedStore(Arc::new(crate::store::MemoryStore::new())))
    }

    #[cfg(feature = "redis")]
    pub fn redis() -> Self {
        Self::new(RedisStoreFactory)
    }

    /// Open a queue. Fails with `QueueAlreadyOpen` if the name is taken and
    /// with `Connection` if the store is unreachable.
    #[instrument(skip(self, config), fields(queue = %config.queue_name))]
    pub async fn open(&self, config: QueueConfig) -> QueueResult<Arc<JobQueue>> {
        let name = config.queue_name.clone();
        if self.queues.read().contains_key(&name) {
            return Err(QueueError::QueueAlreadyOpen(name));
        }

        let store = self.factory.create(&config).await?;
        let queue = Arc::new(JobQueue::connect(store, config).await?);

        // Another caller may have opened the same name while we connected
        let mut queues = self.queues.write();
        if queues.contains_key(&name) {
            queue.close();
            return Err(QueueError::QueueAlreadyOpen(name));
        }
        queues.insert(name, queue.clone());
        Ok(queue)
    }

    pub fn get(&self, name: &str) -> QueueResult<Arc<JobQueue>> {
        self.queues
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))
    }

    /// Remove and close a queue. Holders of the queue see `QueueClosed`
    /// from then on.
    pub fn close(&self, name: &str) -> QueueResult<()> {
        let queue = self
            .queues
            .write()
            .remove(name)
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))?;
        queue.close();
        Ok(())
    }

    pub fn close_all(&self) {
        let queues: Vec<Arc<JobQueue>> = self.queues.write().drain().map(|(_, queue)| queue).collect();
        for queue in &queues {
            queue.close();
        }
        info!(closed = queues.len(), "Closed all queues");
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("queues", &self.queue_names())
            .finish()
    }
}
