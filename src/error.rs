use std::{fmt, time::Duration};

/// Error types for leasequeue operations
#[derive(Debug)]
pub enum Error {
    /// A connection name was referenced that has no configuration entry
    ConfigurationMissing(String),
    /// The configured backend kind has no registered implementation
    DriverNotFound(String),
    /// A strict-order remote queue disagrees with the configured expectation
    QueueTypeMismatch(String),
    /// The job id does not exist in the queue
    JobNotFound(String),
    /// The job exists but is not currently leased
    JobNotLeased(String),
    /// Error raised by user processing logic
    HandlerFailure(String),
    /// A scheduled run exceeded its timeout budget
    WorkerTimeout(Duration),
    /// The backing client is not connected
    StoreUnavailable(String),
    /// Invalid configuration values
    Config(String),
    /// The remote queue service rejected a call
    Remote(String),
    /// Redis connection or operation errors
    Redis(redis::RedisError),
    /// JSON serialization/deserialization errors
    Serialization(serde_json::Error),
}

impl Error {
    /// Stable error name used in failure records
    pub fn name(&self) -> &'static str {
        match self {
            Error::ConfigurationMissing(_) => "ConfigurationMissing",
            Error::DriverNotFound(_) => "DriverNotFound",
            Error::QueueTypeMismatch(_) => "QueueTypeMismatch",
            Error::JobNotFound(_) => "JobNotFound",
            Error::JobNotLeased(_) => "JobNotLeased",
            Error::HandlerFailure(_) => "HandlerFailure",
            Error::WorkerTimeout(_) => "WorkerTimeout",
            Error::StoreUnavailable(_) => "StoreUnavailable",
            Error::Config(_) => "Config",
            Error::Remote(_) => "Remote",
            Error::Redis(_) => "Redis",
            Error::Serialization(_) => "Serialization",
        }
    }

    /// Stable error code used in failure records
    pub fn code(&self) -> &'static str {
        match self {
            Error::ConfigurationMissing(_) => "E_CONFIGURATION_MISSING",
            Error::DriverNotFound(_) => "E_DRIVER_NOT_FOUND",
            Error::QueueTypeMismatch(_) => "E_QUEUE_TYPE_MISMATCH",
            Error::JobNotFound(_) => "E_JOB_NOT_FOUND",
            Error::JobNotLeased(_) => "E_JOB_NOT_LEASED",
            Error::HandlerFailure(_) => "E_HANDLER_FAILURE",
            Error::WorkerTimeout(_) => "E_WORKER_TIMEOUT",
            Error::StoreUnavailable(_) => "E_STORE_UNAVAILABLE",
            Error::Config(_) => "E_CONFIG",
            Error::Remote(_) => "E_REMOTE",
            Error::Redis(_) => "E_REDIS",
            Error::Serialization(_) => "E_SERIALIZATION",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConfigurationMissing(name) => {
                write!(f, "Missing configuration for connection: {}", name)
            }
            Error::DriverNotFound(kind) => write!(f, "No driver registered for: {}", kind),
            Error::QueueTypeMismatch(msg) => write!(f, "Queue type mismatch: {}", msg),
            Error::JobNotFound(id) => write!(f, "Job not found: {}", id),
            Error::JobNotLeased(id) => write!(f, "Job not leased: {}", id),
            Error::HandlerFailure(msg) => write!(f, "Job processing error: {}", msg),
            Error::WorkerTimeout(after) => write!(f, "Worker run timed out after {:?}", after),
            Error::StoreUnavailable(msg) => write!(f, "Store unavailable: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Remote(msg) => write!(f, "Remote queue error: {}", msg),
            Error::Redis(e) => write!(f, "Redis error: {}", e),
            Error::Serialization(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Redis(e) => Some(e),
            Error::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Redis(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err)
    }
}

/// Result type for leasequeue operations
pub type Result<T> = std::result::Result<T, Error>;
