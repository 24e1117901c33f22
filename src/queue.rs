use crate::{
    config::{ConnectionConfig, QueueConfig, QueueConfigBuilder},
    driver::{AddOptions, Driver, ProcessOutcome},
    error::Result,
    job::{Job, JobHandler},
    registry::{ConnectionRegistry, StoreFactory},
    store::{RemoteQueueClient, TableOps},
};
use serde::Serialize;
use std::sync::Arc;

/// Main queue interface, bound to one connection and one logical queue
#[derive(Clone)]
pub struct Queue {
    registry: Arc<ConnectionRegistry>,
    driver: Driver,
}

impl Queue {
    /// Create a new Queue builder
    pub fn builder() -> QueueBuilder {
        QueueBuilder::new()
    }

    /// Queue on the default connection of a registry
    pub async fn new(registry: Arc<ConnectionRegistry>) -> Result<Self> {
        let driver = registry.default_driver().await?;
        Ok(Self { registry, driver })
    }

    /// Queue with custom configuration and no bound collaborators
    pub async fn with_config(config: QueueConfig) -> Result<Self> {
        config.validate()?;
        Self::new(Arc::new(ConnectionRegistry::new(config))).await
    }

    /// Same registry, another connection
    pub async fn connection(&self, name: &str) -> Result<Queue> {
        let driver = self.registry.driver(name).await?;
        Ok(Self {
            registry: Arc::clone(&self.registry),
            driver,
        })
    }

    /// Same connection, another logical queue
    pub fn queue<S: Into<String>>(&self, name: S) -> Queue {
        Self {
            registry: Arc::clone(&self.registry),
            driver: self.driver.with_queue(name),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn name(&self) -> &str {
        self.driver.queue_name()
    }

    pub async fn add<T>(&self, data: &T) -> Result<Job>
    where
        T: Serialize + ?Sized,
    {
        self.driver.add(data).await
    }

    pub async fn add_with<T>(&self, data: &T, options: AddOptions) -> Result<Job>
    where
        T: Serialize + ?Sized,
    {
        self.driver.add_with(data, options).await
    }

    pub async fn pop(&self) -> Result<Option<Job>> {
        self.driver.pop().await
    }

    pub async fn peek(&self) -> Result<Option<Job>> {
        self.driver.peek().await
    }

    pub async fn ack(&self, job_id: &str) -> Result<()> {
        self.driver.ack(job_id).await
    }

    pub async fn ack_strict(&self, job_id: &str) -> Result<()> {
        self.driver.ack_strict(job_id).await
    }

    pub async fn length(&self) -> Result<u64> {
        self.driver.length().await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        self.driver.is_empty().await
    }

    /// Clear all jobs of this queue and its dead letter queue (useful for testing)
    pub async fn truncate(&self) -> Result<()> {
        self.driver.truncate().await
    }

    pub async fn process(&self, handler: &dyn JobHandler) -> Result<ProcessOutcome> {
        self.driver.process(handler).await
    }

    /// Close this queue's connection for every handle sharing it
    pub async fn close(&self) -> Result<()> {
        self.registry.close(self.driver.connection_name()).await
    }
}

/// Builder for Queue
pub struct QueueBuilder {
    config: QueueConfigBuilder,
    tables: Vec<(String, Arc<dyn TableOps>)>,
    remote_clients: Vec<(String, Arc<dyn RemoteQueueClient>)>,
    factories: Vec<(String, Arc<dyn StoreFactory>)>,
}

impl QueueBuilder {
    pub fn new() -> Self {
        Self {
            config: QueueConfigBuilder::new(),
            tables: Vec::new(),
            remote_clients: Vec::new(),
            factories: Vec::new(),
        }
    }

    /// Add a named connection
    pub fn connection<S: Into<String>>(mut self, name: S, config: ConnectionConfig) -> Self {
        self.config = self.config.connection(name, config);
        self
    }

    /// Set the connection the queue starts on
    pub fn default_connection<S: Into<String>>(mut self, name: S) -> Self {
        self.config = self.config.default_connection(name);
        self
    }

    /// Table operations for a database connection
    pub fn table<S: Into<String>>(mut self, connection: S, ops: Arc<dyn TableOps>) -> Self {
        self.tables.push((connection.into(), ops));
        self
    }

    /// Client for a remote connection
    pub fn remote_client<S: Into<String>>(
        mut self,
        connection: S,
        client: Arc<dyn RemoteQueueClient>,
    ) -> Self {
        self.remote_clients.push((connection.into(), client));
        self
    }

    /// Store factory for a custom backend kind
    pub fn driver<S, F>(mut self, kind: S, factory: F) -> Self
    where
        S: Into<String>,
        F: StoreFactory + 'static,
    {
        let factory: Arc<dyn StoreFactory> = Arc::new(factory);
        self.factories.push((kind.into(), factory));
        self
    }

    /// Build the registry without connecting anything
    pub fn build_registry(self) -> Result<ConnectionRegistry> {
        let registry = ConnectionRegistry::new(self.config.build_and_validate()?);
        for (connection, ops) in self.tables {
            registry.bind_table(connection, ops);
        }
        for (connection, client) in self.remote_clients {
            registry.bind_remote_client(connection, client);
        }
        for (kind, factory) in self.factories {
            registry.register_shared_driver(kind, factory);
        }
        Ok(registry)
    }

    /// Build the Queue, connecting its default connection
    pub async fn build(self) -> Result<Queue> {
        Queue::new(Arc::new(self.build_registry()?)).await
    }
}

impl Default for QueueBuilder {
    fn default() -> Self {
        Self::new()
    }
}
