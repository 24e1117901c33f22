//! Backend over a remote message-queue service with visibility timeouts.
//!
//! The service has no non-destructive read: a lease is a receive with a
//! visibility timeout, an ack is a delete by receipt handle, and a retry delay
//! is a visibility change. Attempts are derived from the service's own
//! receive count. Queues whose name ends in `.fifo` are strict-order queues
//! and need a message group and a deduplication id on every send.

use crate::{
    error::{Error, Result},
    job::{add_millis, now_millis, Job, NewJob},
    store::{AckOutcome, JobStore},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

pub const FIFO_SUFFIX: &str = ".fifo";
pub const ATTR_FIFO_QUEUE: &str = "FifoQueue";
pub const ATTR_CONTENT_BASED_DEDUPLICATION: &str = "ContentBasedDeduplication";
pub const ATTR_MESSAGES: &str = "ApproximateNumberOfMessages";
pub const ATTR_MESSAGES_NOT_VISIBLE: &str = "ApproximateNumberOfMessagesNotVisible";
pub const ATTR_MESSAGES_DELAYED: &str = "ApproximateNumberOfMessagesDelayed";
/// Longest visibility timeout the service accepts (12 hours)
pub const MAX_VISIBILITY_SECONDS: u32 = 43_200;
pub const MAX_DEDUPLICATION_ID_LEN: usize = 128;

/// Lease held between the receive and the delete of a `take_next`
const TAKE_LEASE: Duration = Duration::from_secs(30);

/// Message to send
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingMessage {
    pub body: String,
    pub group_id: Option<String>,
    pub deduplication_id: Option<String>,
    pub delay_seconds: u32,
}

/// Message returned by a receive
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMessage {
    pub message_id: String,
    /// Handle scoped to this delivery, needed to delete or change visibility
    pub receipt_handle: String,
    pub body: String,
    /// Deliveries so far, this one included
    pub receive_count: u32,
}

/// Calls the remote queue backend makes against the service
#[async_trait]
pub trait RemoteQueueClient: Send + Sync {
    /// Send a message, returning its message id
    async fn send(&self, queue: &str, message: OutgoingMessage) -> Result<String>;

    /// Receive up to `max_messages`, hiding them for `visibility_seconds`
    async fn receive(
        &self,
        queue: &str,
        max_messages: u32,
        wait_seconds: u32,
        visibility_seconds: u32,
        attempt_id: Option<&str>,
    ) -> Result<Vec<RemoteMessage>>;

    /// Delete by receipt handle. `false` when the handle is unknown or stale.
    async fn delete(&self, queue: &str, receipt_handle: &str) -> Result<bool>;

    /// Fails with `JobNotFound` for an unknown or stale handle and
    /// `JobNotLeased` when the message is no longer in flight.
    async fn change_visibility(&self, queue: &str, receipt_handle: &str, seconds: u32)
        -> Result<()>;

    async fn purge(&self, queue: &str) -> Result<()>;

    async fn get_attributes(&self, queue: &str, names: &[&str])
        -> Result<HashMap<String, String>>;
}

/// Job fields carried in the message body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    data: serde_json::Value,
    attempts: u32,
    created_at: i64,
    former_queue: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct QueueMode {
    strict_order: bool,
    content_deduplication: bool,
}

/// Deduplication id for a strict-order send: content hash plus a timestamp
/// and sequence suffix, so identical bodies sent apart are both delivered.
pub fn deduplication_id(body: &str, sequence: u64) -> String {
    let timestamp = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| now_millis().saturating_mul(1_000_000));
    let mut id = format!("{:x}-{}-{}", Sha256::digest(body.as_bytes()), timestamp, sequence);
    id.truncate(MAX_DEDUPLICATION_ID_LEN);
    id
}

/// Whole seconds covering `duration`, capped at the service maximum
pub fn visibility_seconds(duration: Duration) -> u32 {
    let ms = duration.as_millis();
    let seconds = ms.div_ceil(1000);
    seconds.min(MAX_VISIBILITY_SECONDS as u128) as u32
}

pub struct RemoteStore {
    client: Arc<dyn RemoteQueueClient>,
    message_group: Option<String>,
    receive_wait: Duration,
    modes: Mutex<HashMap<String, QueueMode>>,
    sequence: AtomicU64,
    connected: AtomicBool,
}

impl RemoteStore {
    pub fn new(client: Arc<dyn RemoteQueueClient>) -> Self {
        Self {
            client,
            message_group: None,
            receive_wait: Duration::ZERO,
            modes: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            connected: AtomicBool::new(false),
        }
    }

    /// Message group for strict-order sends. Defaults to the queue name.
    pub fn message_group<S: Into<String>>(mut self, group: S) -> Self {
        self.message_group = Some(group.into());
        self
    }

    /// Long-poll wait of receives
    pub fn receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::StoreUnavailable(
                "remote queue client is not connected".to_string(),
            ))
        }
    }

    /// Queue type as reported by the service, checked once per queue against
    /// the `.fifo` naming convention.
    async fn queue_mode(&self, queue: &str) -> Result<QueueMode> {
        if let Some(mode) = self
            .modes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
        {
            return Ok(*mode);
        }

        let attributes = self
            .client
            .get_attributes(queue, &[ATTR_FIFO_QUEUE, ATTR_CONTENT_BASED_DEDUPLICATION])
            .await?;
        let flag = |name: &str| {
            attributes
                .get(name)
                .is_some_and(|value| value.eq_ignore_ascii_case("true"))
        };

        let expects_strict_order = queue.ends_with(FIFO_SUFFIX);
        let strict_order = flag(ATTR_FIFO_QUEUE);
        if strict_order != expects_strict_order {
            return Err(Error::QueueTypeMismatch(format!(
                "queue '{}' is {}a strict-order queue on the server but its name {} the '{}' suffix",
                queue,
                if strict_order { "" } else { "not " },
                if expects_strict_order { "has" } else { "lacks" },
                FIFO_SUFFIX
            )));
        }

        let mode = QueueMode {
            strict_order,
            content_deduplication: flag(ATTR_CONTENT_BASED_DEDUPLICATION),
        };
        self.modes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue.to_string(), mode);
        Ok(mode)
    }

    fn job_from_message(
        queue: &str,
        message: RemoteMessage,
        now: i64,
        visibility: Duration,
    ) -> Result<Job> {
        let envelope: Envelope = serde_json::from_str(&message.body)?;
        Ok(Job {
            id: message.receipt_handle,
            queue: queue.to_string(),
            data: envelope.data,
            attempts: envelope.attempts,
            attempts_left: envelope.attempts.saturating_sub(message.receive_count),
            available_at: now,
            reserved_until: Some(add_millis(now, visibility)),
            created_at: envelope.created_at,
            former_queue: envelope.former_queue,
        })
    }
}

#[async_trait]
impl JobStore for RemoteStore {
    fn kind(&self) -> &str {
        "remote"
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.modes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn add(&self, queue: &str, new: NewJob) -> Result<Job> {
        self.ensure_connected()?;
        let mode = self.queue_mode(queue).await?;
        if mode.strict_order && !new.delay.is_zero() {
            return Err(Error::Config(format!(
                "strict-order queue '{}' does not support per-job delays ({:?} requested)",
                queue, new.delay
            )));
        }
        let now = now_millis();

        let envelope = Envelope {
            data: new.data.clone(),
            attempts: new.attempts,
            created_at: now,
            former_queue: new.former_queue.clone(),
        };
        let body = serde_json::to_string(&envelope)?;

        let mut message = OutgoingMessage {
            delay_seconds: visibility_seconds(new.delay),
            ..OutgoingMessage::default()
        };
        if mode.strict_order {
            message.group_id = Some(
                self.message_group
                    .clone()
                    .unwrap_or_else(|| queue.to_string()),
            );
            if !mode.content_deduplication {
                let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
                message.deduplication_id = Some(deduplication_id(&body, sequence));
            }
        }
        message.body = body;

        let message_id = self.client.send(queue, message).await?;
        Ok(Job::from_new(message_id, queue, new, now))
    }

    async fn lease_next(&self, queue: &str, visibility: Duration) -> Result<Option<Job>> {
        self.ensure_connected()?;
        let mode = self.queue_mode(queue).await?;
        let attempt_id = mode
            .strict_order
            .then(|| uuid::Uuid::new_v4().to_string());

        let messages = self
            .client
            .receive(
                queue,
                1,
                visibility_seconds(self.receive_wait),
                visibility_seconds(visibility),
                attempt_id.as_deref(),
            )
            .await?;

        let now = now_millis();
        messages
            .into_iter()
            .next()
            .map(|message| Self::job_from_message(queue, message, now, visibility))
            .transpose()
    }

    async fn take_next(&self, queue: &str) -> Result<Option<Job>> {
        let Some(job) = self.lease_next(queue, TAKE_LEASE).await? else {
            return Ok(None);
        };
        self.client.delete(queue, &job.id).await?;
        Ok(Some(job))
    }

    fn supports_peek(&self) -> bool {
        false
    }

    fn min_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn max_delay(&self) -> Option<Duration> {
        Some(Duration::from_secs(MAX_VISIBILITY_SECONDS as u64))
    }

    async fn ack(&self, queue: &str, job_id: &str) -> Result<AckOutcome> {
        self.ensure_connected()?;
        Ok(if self.client.delete(queue, job_id).await? {
            AckOutcome::Removed
        } else {
            AckOutcome::NotFound
        })
    }

    async fn ack_leased(&self, queue: &str, job: &Job) -> Result<AckOutcome> {
        // the receipt handle is already scoped to one delivery
        self.ack(queue, &job.id).await
    }

    async fn reschedule(&self, queue: &str, job: &Job, delay: Duration) -> Result<bool> {
        self.ensure_connected()?;
        match self
            .client
            .change_visibility(queue, &job.id, visibility_seconds(delay))
            .await
        {
            Ok(()) => Ok(true),
            Err(Error::JobNotFound(_)) | Err(Error::JobNotLeased(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn release_expired_leases(&self, _queue: &str) -> Result<u64> {
        // the service expires visibility timeouts itself
        Ok(0)
    }

    async fn length(&self, queue: &str) -> Result<u64> {
        self.ensure_connected()?;
        let attributes = self
            .client
            .get_attributes(
                queue,
                &[ATTR_MESSAGES, ATTR_MESSAGES_NOT_VISIBLE, ATTR_MESSAGES_DELAYED],
            )
            .await?;
        Ok(attributes
            .values()
            .filter_map(|count| count.parse::<u64>().ok())
            .sum())
    }

    async fn truncate(&self, queue: &str) -> Result<()> {
        self.ensure_connected()?;
        self.client.purge(queue).await
    }
}
