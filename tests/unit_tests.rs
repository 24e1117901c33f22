use leasequeue::{
    config::{DEFAULT_CONNECTION, DEFAULT_TABLE},
    store::{JobStore, RedisStore},
    BackoffPolicy, ConnectionConfig, DriverKind, Error, FailureRecord, Job, NewJob, QueueConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

fn sample_job() -> Job {
    Job {
        id: "job_123".to_string(),
        queue: "emails".to_string(),
        data: json!({"to": "user@example.com"}),
        attempts: 3,
        attempts_left: 2,
        available_at: 1_000,
        reserved_until: None,
        created_at: 900,
        former_queue: None,
    }
}

#[test]
fn test_connection_config_builder() {
    let config = ConnectionConfig::database()
        .queue("emails")
        .deadletter("emails_failed")
        .attempts(4)
        .backoff(BackoffPolicy::exponential(Duration::from_millis(500)))
        .visibility_timeout(Duration::from_secs(60))
        .no_ack_delay(Duration::from_secs(2))
        .worker_interval(Duration::from_millis(500))
        .worker_timeout(Duration::from_secs(30))
        .worker_concurrency(3)
        .table("jobs");

    assert_eq!(config.driver, DriverKind::Database);
    assert_eq!(config.queue, "emails");
    assert_eq!(config.deadletter.as_deref(), Some("emails_failed"));
    assert_eq!(config.attempts, 4);
    assert_eq!(
        config.backoff,
        Some(BackoffPolicy::exponential(Duration::from_millis(500)))
    );
    assert_eq!(config.visibility_timeout, Duration::from_secs(60));
    assert_eq!(config.no_ack_delay, Duration::from_secs(2));
    assert_eq!(config.worker_interval, Duration::from_millis(500));
    assert_eq!(config.worker_timeout, Duration::from_secs(30));
    assert_eq!(config.worker_concurrency, 3);
    assert_eq!(config.table, "jobs");
    assert!(config.validate().is_ok());
}

#[test]
fn test_connection_config_defaults() {
    let config = ConnectionConfig::default();

    assert_eq!(config.driver, DriverKind::Memory);
    assert_eq!(config.queue, "default");
    assert!(config.deadletter.is_none());
    assert_eq!(config.attempts, 1);
    assert!(config.backoff.is_none());
    assert_eq!(config.worker_interval, Duration::from_millis(1000));
    assert_eq!(config.worker_timeout, Duration::from_secs(300));
    assert!(config.worker_initial_offset.is_none());
    assert_eq!(config.table, DEFAULT_TABLE);
    assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
}

#[test]
fn test_effective_jitter_max() {
    let config = ConnectionConfig::memory();
    assert_eq!(config.effective_jitter_max(), Duration::from_millis(250));

    let config = ConnectionConfig::memory().worker_interval(Duration::from_millis(100));
    assert_eq!(config.effective_jitter_max(), Duration::from_millis(50));

    let config = ConnectionConfig::memory().worker_jitter_max(Duration::from_millis(7));
    assert_eq!(config.effective_jitter_max(), Duration::from_millis(7));
}

#[test]
fn test_connection_config_validation() {
    assert!(ConnectionConfig::memory().queue("").validate().is_err());
    assert!(ConnectionConfig::memory()
        .queue("a")
        .deadletter("a")
        .validate()
        .is_err());
    assert!(ConnectionConfig::memory()
        .worker_interval(Duration::ZERO)
        .validate()
        .is_err());
    assert!(ConnectionConfig::memory()
        .worker_concurrency(0)
        .validate()
        .is_err());
    assert!(ConnectionConfig::database().table("").validate().is_err());
    assert!(ConnectionConfig::memory()
        .backoff(BackoffPolicy::fixed(Duration::from_secs(1)).jitter(f64::NAN))
        .validate()
        .is_err());
}

#[test]
fn test_queue_config_builder() {
    let config = QueueConfig::builder()
        .connection("primary", ConnectionConfig::memory())
        .connection("jobs_db", ConnectionConfig::database())
        .build();

    assert_eq!(config.default_connection, "primary");
    assert_eq!(config.connections.len(), 2);
    assert_eq!(
        config.connection("jobs_db").map(|c| c.driver.clone()).ok(),
        Some(DriverKind::Database)
    );

    match config.connection("missing") {
        Err(Error::ConfigurationMissing(name)) => assert_eq!(name, "missing"),
        other => panic!("Expected ConfigurationMissing, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_queue_config_default_and_validation() {
    let config = QueueConfig::default();
    assert_eq!(config.default_connection, DEFAULT_CONNECTION);
    assert!(config.validate().is_ok());

    let result = QueueConfig::builder()
        .connection("primary", ConnectionConfig::memory())
        .default_connection("other")
        .build_and_validate();
    assert!(matches!(result, Err(Error::ConfigurationMissing(_))));

    let result = QueueConfig::builder()
        .connection("primary", ConnectionConfig::memory().attempts(2).queue(""))
        .build_and_validate();
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_driver_kind_parsing() {
    assert_eq!("memory".parse::<DriverKind>().ok(), Some(DriverKind::Memory));
    assert_eq!("DB".parse::<DriverKind>().ok(), Some(DriverKind::Database));
    assert_eq!("sqs".parse::<DriverKind>().ok(), Some(DriverKind::Remote));
    assert_eq!("redis".parse::<DriverKind>().ok(), Some(DriverKind::Redis));
    assert_eq!(
        "kafka".parse::<DriverKind>().ok(),
        Some(DriverKind::Custom("kafka".to_string()))
    );
    assert!("  ".parse::<DriverKind>().is_err());
    assert_eq!(DriverKind::Remote.to_string(), "remote");
}

#[test]
fn test_error_display() {
    let config_error = Error::Config("Invalid configuration".to_string());
    assert_eq!(
        config_error.to_string(),
        "Configuration error: Invalid configuration"
    );

    let job_error = Error::HandlerFailure("Job failed".to_string());
    assert_eq!(job_error.to_string(), "Job processing error: Job failed");

    let missing = Error::ConfigurationMissing("reports".to_string());
    assert_eq!(
        missing.to_string(),
        "Missing configuration for connection: reports"
    );

    let driver = Error::DriverNotFound("kafka".to_string());
    assert_eq!(driver.to_string(), "No driver registered for: kafka");
}

#[test]
fn test_error_metadata() {
    let error = Error::HandlerFailure("boom".to_string());
    assert_eq!(error.name(), "HandlerFailure");
    assert_eq!(error.code(), "E_HANDLER_FAILURE");

    let timeout = Error::WorkerTimeout(Duration::from_secs(1));
    assert_eq!(timeout.name(), "WorkerTimeout");

    assert_eq!(Error::Config("x".to_string()).code(), "E_CONFIG");
}

#[test]
fn test_error_from_serde() {
    let serde_error = serde_json::from_str::<String>("invalid json").unwrap_err();
    let leasequeue_error: Error = serde_error.into();

    match leasequeue_error {
        Error::Serialization(_) => {} // Expected
        _ => panic!("Expected Serialization error"),
    }
}

#[test]
fn test_job_eligibility() {
    let mut job = sample_job();

    assert!(!job.is_eligible(999));
    assert!(job.is_eligible(1_000));
    assert!(!job.is_leased(1_000));

    job.reserved_until = Some(2_000);
    assert!(job.is_leased(1_500));
    assert!(!job.is_eligible(1_500));
    assert!(job.is_eligible(2_000));
    assert!(!job.is_leased(2_000));

    assert_eq!(job.attempts_consumed(), 1);
}

#[test]
fn test_dead_letter_copy() {
    let job = sample_job();
    let copy = NewJob::dead_letter_of(&job);

    assert_eq!(copy.data, job.data);
    assert_eq!(copy.attempts, 0);
    assert_eq!(copy.delay, Duration::ZERO);
    assert_eq!(copy.former_queue.as_deref(), Some("emails"));
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct EmailJob {
    to: String,
}

#[test]
fn test_job_data_deserialization() {
    let job = sample_job();
    let email: EmailJob = job.deserialize_data().unwrap();
    assert_eq!(email.to, "user@example.com");

    let wrong: leasequeue::Result<Vec<u32>> = job.deserialize_data();
    assert!(matches!(wrong, Err(Error::Serialization(_))));
}

#[test]
fn test_job_serializes_camel_case() {
    let value = serde_json::to_value(sample_job()).unwrap();

    assert_eq!(value["attemptsLeft"], json!(2));
    assert_eq!(value["availableAt"], json!(1_000));
    assert_eq!(value["reservedUntil"], json!(null));
    assert_eq!(value["formerQueue"], json!(null));
}

#[test]
fn test_failure_record() {
    let job = sample_job();
    let error = Error::from(serde_json::from_str::<String>("{").unwrap_err());
    let record = FailureRecord::new(&error, "emails", Some("emails_failed"), Some(&job));

    assert_eq!(record.queue_name, "emails");
    assert_eq!(record.deadletter_name.as_deref(), Some("emails_failed"));
    assert_eq!(record.error_name, "Serialization");
    assert_eq!(record.error_code, "E_SERIALIZATION");
    // the error and its serde_json source
    assert_eq!(record.stack.len(), 2);
    assert_eq!(record.job.as_ref().map(|j| j.id.as_str()), Some("job_123"));

    let value = serde_json::to_value(&record).unwrap();
    assert_eq!(value["queueName"], json!("emails"));
    assert_eq!(value["deadletterName"], json!("emails_failed"));
    assert_eq!(value["errorCode"], json!("E_SERIALIZATION"));
    assert_eq!(value["job"]["id"], json!("job_123"));
}

#[tokio::test]
async fn test_redis_store_starts_disconnected() -> leasequeue::Result<()> {
    // opening a client does not touch the network
    let store = RedisStore::open("redis://127.0.0.1:6379", "leasequeue-test")?;
    assert!(!store.is_connected());

    store.close().await?;
    assert!(!store.is_connected());
    assert!(matches!(
        store.length("jobs").await,
        Err(Error::StoreUnavailable(_))
    ));
    Ok(())
}
