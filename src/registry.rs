use crate::{
    config::{ConnectionConfig, DriverKind, QueueConfig},
    driver::Driver,
    error::{Error, Result},
    store::{
        DatabaseStore, JobStore, MemoryStore, RedisStore, RemoteQueueClient, RemoteStore,
        TableOps,
    },
};
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};
use tokio::sync::Mutex;

/// Builds the job store of a custom backend kind
pub trait StoreFactory: Send + Sync {
    fn create(&self, connection: &str, config: &ConnectionConfig) -> Result<Arc<dyn JobStore>>;
}

impl<F> StoreFactory for F
where
    F: Fn(&str, &ConnectionConfig) -> Result<Arc<dyn JobStore>> + Send + Sync,
{
    fn create(&self, connection: &str, config: &ConnectionConfig) -> Result<Arc<dyn JobStore>> {
        self(connection, config)
    }
}

/// Maps connection names to drivers.
///
/// Stores are built and connected on first use and then shared by every
/// driver of that connection. Closing a connection drops the cached store, so
/// drivers still holding it see `StoreUnavailable` afterwards.
pub struct ConnectionRegistry {
    config: QueueConfig,
    stores: Mutex<HashMap<String, Arc<dyn JobStore>>>,
    factories: RwLock<HashMap<String, Arc<dyn StoreFactory>>>,
    tables: RwLock<HashMap<String, Arc<dyn TableOps>>>,
    remote_clients: RwLock<HashMap<String, Arc<dyn RemoteQueueClient>>>,
}

impl ConnectionRegistry {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            stores: Mutex::new(HashMap::new()),
            factories: RwLock::new(HashMap::new()),
            tables: RwLock::new(HashMap::new()),
            remote_clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Register the store factory of a custom backend kind
    pub fn register_driver<S, F>(&self, kind: S, factory: F)
    where
        S: Into<String>,
        F: StoreFactory + 'static,
    {
        self.register_shared_driver(kind, Arc::new(factory));
    }

    pub fn register_shared_driver<S: Into<String>>(&self, kind: S, factory: Arc<dyn StoreFactory>) {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.into(), factory);
    }

    /// Bind the table operations a database connection runs on
    pub fn bind_table<S: Into<String>>(&self, connection: S, ops: Arc<dyn TableOps>) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection.into(), ops);
    }

    /// Bind the client a remote connection talks through
    pub fn bind_remote_client<S: Into<String>>(
        &self,
        connection: S,
        client: Arc<dyn RemoteQueueClient>,
    ) {
        self.remote_clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection.into(), client);
    }

    /// Driver for the default connection
    pub async fn default_driver(&self) -> Result<Driver> {
        let name = self.config.default_connection.clone();
        self.driver(&name).await
    }

    /// Driver for a named connection, on its configured queue
    pub async fn driver(&self, connection: &str) -> Result<Driver> {
        let config = self.config.connection(connection)?.clone();
        let store = self.store(connection).await?;
        Ok(Driver::new(connection, config, store))
    }

    /// Shared, connected store of a named connection
    pub async fn store(&self, connection: &str) -> Result<Arc<dyn JobStore>> {
        let config = self.config.connection(connection)?;
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(connection) {
            return Ok(Arc::clone(store));
        }

        let store = self.build_store(connection, config)?;
        store.connect().await?;
        log::info!(
            "Connected {} store for connection {}",
            store.kind(),
            connection
        );
        stores.insert(connection.to_string(), Arc::clone(&store));
        Ok(store)
    }

    fn build_store(&self, connection: &str, config: &ConnectionConfig) -> Result<Arc<dyn JobStore>> {
        let store: Arc<dyn JobStore> = match &config.driver {
            DriverKind::Memory => Arc::new(MemoryStore::new()),
            DriverKind::Database => {
                let ops = self
                    .tables
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(connection)
                    .cloned()
                    .ok_or_else(|| {
                        Error::StoreUnavailable(format!(
                            "no table operations bound for connection '{}'",
                            connection
                        ))
                    })?;
                Arc::new(DatabaseStore::new(config.table.clone(), ops))
            }
            DriverKind::Remote => {
                let client = self
                    .remote_clients
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(connection)
                    .cloned()
                    .ok_or_else(|| {
                        Error::StoreUnavailable(format!(
                            "no remote queue client bound for connection '{}'",
                            connection
                        ))
                    })?;
                let mut store = RemoteStore::new(client).receive_wait(config.receive_wait);
                if let Some(group) = &config.message_group {
                    store = store.message_group(group.clone());
                }
                Arc::new(store)
            }
            DriverKind::Redis => {
                Arc::new(RedisStore::open(&config.redis_url, config.key_prefix.clone())?)
            }
            DriverKind::Custom(kind) => {
                let factory = self
                    .factories
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(kind)
                    .cloned()
                    .ok_or_else(|| Error::DriverNotFound(kind.clone()))?;
                factory.create(connection, config)?
            }
        };
        Ok(store)
    }

    /// Close a connection and drop its cached store
    pub async fn close(&self, connection: &str) -> Result<()> {
        let store = self.stores.lock().await.remove(connection);
        if let Some(store) = store {
            store.close().await?;
            log::info!("Closed connection {}", connection);
        }
        Ok(())
    }

    /// Close every open connection
    pub async fn close_all(&self) -> Result<()> {
        let stores: Vec<_> = self.stores.lock().await.drain().collect();
        for (connection, store) in stores {
            store.close().await?;
            log::info!("Closed connection {}", connection);
        }
        Ok(())
    }
}
