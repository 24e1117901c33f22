use crate::{
    backoff::BackoffPolicy,
    error::{Error, Result},
};
use std::{collections::HashMap, env, fmt, str::FromStr, time::Duration};

pub const DEFAULT_CONNECTION: &str = "default";
pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_TABLE: &str = "queue_jobs";
pub const DEFAULT_KEY_PREFIX: &str = "leasequeue";

const MAX_JITTER: Duration = Duration::from_millis(250);

/// Backend kind a connection is served by
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DriverKind {
    Memory,
    Database,
    Remote,
    Redis,
    /// A backend registered at runtime through `ConnectionRegistry::register_driver`
    Custom(String),
}

impl DriverKind {
    pub fn as_str(&self) -> &str {
        match self {
            DriverKind::Memory => "memory",
            DriverKind::Database => "database",
            DriverKind::Remote => "remote",
            DriverKind::Redis => "redis",
            DriverKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let kind = match s.trim().to_ascii_lowercase().as_str() {
            "" => return Err(Error::Config("Driver kind cannot be empty".to_string())),
            "memory" => DriverKind::Memory,
            "database" | "db" => DriverKind::Database,
            "remote" | "sqs" => DriverKind::Remote,
            "redis" => DriverKind::Redis,
            other => DriverKind::Custom(other.to_string()),
        };
        Ok(kind)
    }
}

/// Configuration for one named connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub driver: DriverKind,
    pub queue: String,
    pub deadletter: Option<String>,
    pub attempts: u32,
    pub backoff: Option<BackoffPolicy>,
    pub visibility_timeout: Duration,
    pub no_ack_delay: Duration,
    pub worker_interval: Duration,
    pub worker_timeout: Duration,
    pub worker_initial_offset: Option<Duration>,
    pub worker_jitter_max: Option<Duration>,
    pub worker_concurrency: usize,
    pub table: String,
    pub redis_url: String,
    pub key_prefix: String,
    pub message_group: Option<String>,
    pub receive_wait: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::Memory,
            queue: DEFAULT_QUEUE.to_string(),
            deadletter: None,
            attempts: 1,
            backoff: None,
            visibility_timeout: Duration::from_secs(300),
            no_ack_delay: Duration::ZERO,
            worker_interval: Duration::from_millis(1000),
            worker_timeout: Duration::from_secs(300),
            worker_initial_offset: None,
            worker_jitter_max: None,
            worker_concurrency: 1,
            table: DEFAULT_TABLE.to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            message_group: None,
            receive_wait: Duration::ZERO,
        }
    }
}

impl ConnectionConfig {
    /// Create a connection config for the given backend with default values
    pub fn new(driver: DriverKind) -> Self {
        Self {
            driver,
            ..Self::default()
        }
    }

    pub fn memory() -> Self {
        Self::new(DriverKind::Memory)
    }

    pub fn database() -> Self {
        Self::new(DriverKind::Database)
    }

    pub fn remote() -> Self {
        Self::new(DriverKind::Remote)
    }

    pub fn redis<S: Into<String>>(url: S) -> Self {
        Self {
            redis_url: url.into(),
            ..Self::new(DriverKind::Redis)
        }
    }

    /// Set the queue name
    pub fn queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the dead letter queue name
    pub fn deadletter<S: Into<String>>(mut self, queue: S) -> Self {
        self.deadletter = Some(queue.into());
        self
    }

    /// Set the attempt budget given to new jobs
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Set the retry backoff policy
    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = Some(policy);
        self
    }

    /// Set how long a leased job stays hidden from other workers
    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Set the redelivery delay for jobs whose handler returned without acking
    pub fn no_ack_delay(mut self, delay: Duration) -> Self {
        self.no_ack_delay = delay;
        self
    }

    /// Set the worker polling interval
    pub fn worker_interval(mut self, interval: Duration) -> Self {
        self.worker_interval = interval;
        self
    }

    /// Set the timeout of one worker run
    pub fn worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    /// Override the computed first-poll offset
    pub fn worker_initial_offset(mut self, offset: Duration) -> Self {
        self.worker_initial_offset = Some(offset);
        self
    }

    /// Set the maximum random delay added between worker runs
    pub fn worker_jitter_max(mut self, jitter: Duration) -> Self {
        self.worker_jitter_max = Some(jitter);
        self
    }

    /// Set the number of polling loops per worker
    pub fn worker_concurrency(mut self, concurrency: usize) -> Self {
        self.worker_concurrency = concurrency;
        self
    }

    /// Set the jobs table of a database connection
    pub fn table<S: Into<String>>(mut self, table: S) -> Self {
        self.table = table.into();
        self
    }

    /// Set the key prefix of a redis connection
    pub fn key_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the message group used for strict-order remote queues
    pub fn message_group<S: Into<String>>(mut self, group: S) -> Self {
        self.message_group = Some(group.into());
        self
    }

    /// Set the long-poll wait of remote receives
    pub fn receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    /// Jitter bound between worker runs: the configured value, or
    /// `min(250ms, interval / 2)`.
    pub fn effective_jitter_max(&self) -> Duration {
        self.worker_jitter_max
            .unwrap_or_else(|| MAX_JITTER.min(self.worker_interval / 2))
    }

    /// Load a connection configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = ConnectionConfig::default();

        if let Ok(driver) = env::var("LEASEQUEUE_DRIVER") {
            config.driver = driver.parse()?;
        }

        if let Ok(queue) = env::var("LEASEQUEUE_QUEUE") {
            config.queue = queue;
        }

        if let Ok(deadletter) = env::var("LEASEQUEUE_DEADLETTER") {
            if !deadletter.is_empty() {
                config.deadletter = Some(deadletter);
            }
        }

        if let Ok(attempts) = env::var("LEASEQUEUE_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse::<u32>() {
                config.attempts = attempts;
            }
        }

        if let Some(timeout) = env_millis("LEASEQUEUE_VISIBILITY_TIMEOUT_MS") {
            config.visibility_timeout = timeout;
        }

        if let Some(interval) = env_millis("LEASEQUEUE_WORKER_INTERVAL_MS") {
            config.worker_interval = interval;
        }

        if let Some(timeout) = env_millis("LEASEQUEUE_WORKER_TIMEOUT_MS") {
            config.worker_timeout = timeout;
        }

        if let Some(offset) = env_millis("LEASEQUEUE_WORKER_INITIAL_OFFSET_MS") {
            config.worker_initial_offset = Some(offset);
        }

        if let Some(jitter) = env_millis("LEASEQUEUE_WORKER_JITTER_MAX_MS") {
            config.worker_jitter_max = Some(jitter);
        }

        if let Ok(table) = env::var("LEASEQUEUE_TABLE") {
            config.table = table;
        }

        if let Ok(redis_url) = env::var("LEASEQUEUE_REDIS_URL") {
            config.redis_url = redis_url;
        }

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.queue.is_empty() {
            return Err("Queue name cannot be empty".to_string());
        }

        if self.deadletter.as_deref() == Some(self.queue.as_str()) {
            return Err("Dead letter queue must differ from the source queue".to_string());
        }

        if self.worker_interval.is_zero() {
            return Err("Worker interval must be greater than 0".to_string());
        }

        if self.worker_timeout.is_zero() {
            return Err("Worker timeout must be greater than 0".to_string());
        }

        if self.worker_concurrency == 0 {
            return Err("Worker concurrency must be greater than 0".to_string());
        }

        if self.visibility_timeout.is_zero() {
            return Err("Visibility timeout must be greater than 0".to_string());
        }

        if let Some(backoff) = &self.backoff {
            if backoff.jitter_factor.is_nan() || backoff.jitter_factor < 0.0 {
                return Err("Backoff jitter factor must be a non-negative number".to_string());
            }
        }

        match self.driver {
            DriverKind::Database if self.table.is_empty() => {
                Err("Database table name cannot be empty".to_string())
            }
            DriverKind::Redis if self.redis_url.is_empty() => {
                Err("Redis URL cannot be empty".to_string())
            }
            _ => Ok(()),
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// All named connections known to a process
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub default_connection: String,
    pub connections: HashMap<String, ConnectionConfig>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let mut connections = HashMap::new();
        connections.insert(DEFAULT_CONNECTION.to_string(), ConnectionConfig::memory());
        Self {
            default_connection: DEFAULT_CONNECTION.to_string(),
            connections,
        }
    }
}

impl QueueConfig {
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::new()
    }

    /// Look up a named connection
    pub fn connection(&self, name: &str) -> Result<&ConnectionConfig> {
        self.connections
            .get(name)
            .ok_or_else(|| Error::ConfigurationMissing(name.to_string()))
    }

    /// Single-connection configuration read from `LEASEQUEUE_*` variables
    pub fn from_env() -> Result<Self> {
        let name = env::var("LEASEQUEUE_CONNECTION")
            .unwrap_or_else(|_| DEFAULT_CONNECTION.to_string());
        QueueConfigBuilder::new()
            .connection(name.clone(), ConnectionConfig::from_env()?)
            .default_connection(name)
            .build_and_validate()
    }

    /// Validate every connection
    pub fn validate(&self) -> Result<()> {
        if !self.connections.contains_key(&self.default_connection) {
            return Err(Error::ConfigurationMissing(self.default_connection.clone()));
        }

        for (name, connection) in &self.connections {
            connection
                .validate()
                .map_err(|msg| Error::Config(format!("connection '{}': {}", name, msg)))?;
        }

        Ok(())
    }
}

/// Builder for QueueConfig
#[derive(Debug, Default)]
pub struct QueueConfigBuilder {
    default_connection: Option<String>,
    connections: HashMap<String, ConnectionConfig>,
}

impl QueueConfigBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a named connection. The first connection added becomes
    /// the default unless `default_connection` says otherwise.
    pub fn connection<S: Into<String>>(mut self, name: S, config: ConnectionConfig) -> Self {
        let name = name.into();
        if self.default_connection.is_none() {
            self.default_connection = Some(name.clone());
        }
        self.connections.insert(name, config);
        self
    }

    /// Set the default connection name
    pub fn default_connection<S: Into<String>>(mut self, name: S) -> Self {
        self.default_connection = Some(name.into());
        self
    }

    /// Validate and build the final configuration
    pub fn build_and_validate(self) -> Result<QueueConfig> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }

    /// Build the final configuration
    pub fn build(self) -> QueueConfig {
        QueueConfig {
            default_connection: self
                .default_connection
                .unwrap_or_else(|| DEFAULT_CONNECTION.to_string()),
            connections: self.connections,
        }
    }
}
