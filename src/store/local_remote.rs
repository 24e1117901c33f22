use crate::{
    error::{Error, Result},
    job::now_millis,
    store::remote::{
        OutgoingMessage, RemoteMessage, RemoteQueueClient, ATTR_CONTENT_BASED_DEDUPLICATION,
        ATTR_FIFO_QUEUE, ATTR_MESSAGES, ATTR_MESSAGES_DELAYED, ATTR_MESSAGES_NOT_VISIBLE,
        FIFO_SUFFIX, MAX_VISIBILITY_SECONDS,
    },
};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

const DEDUPLICATION_WINDOW_MS: i64 = 5 * 60 * 1000;
const RECEIVE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug)]
struct StoredMessage {
    message_id: String,
    body: String,
    group_id: Option<String>,
    visible_at: i64,
    receive_count: u32,
    receipt_handle: Option<String>,
}

impl StoredMessage {
    fn in_flight(&self, now: i64) -> bool {
        self.receipt_handle.is_some() && self.visible_at > now
    }
}

#[derive(Debug, Default)]
struct QueueState {
    strict_order: bool,
    content_deduplication: bool,
    messages: Vec<StoredMessage>,
    /// deduplication id -> (sent at, message id)
    sent: HashMap<String, (i64, String)>,
}

/// In-process emulation of the remote queue service: visibility timeouts,
/// receive counts, strict-order groups and deduplication windows.
///
/// Queues are created on first use, strict-order when their name ends in
/// `.fifo`. `create_queue` sets attributes explicitly.
#[derive(Debug, Default)]
pub struct LocalRemoteQueue {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl LocalRemoteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reset the attributes of) a queue
    pub fn create_queue(&self, name: &str, strict_order: bool, content_deduplication: bool) {
        let mut queues = self.lock();
        let state = queues.entry(name.to_string()).or_default();
        state.strict_order = strict_order;
        state.content_deduplication = content_deduplication;
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state<'a>(
        queues: &'a mut HashMap<String, QueueState>,
        name: &str,
    ) -> &'a mut QueueState {
        queues
            .entry(name.to_string())
            .or_insert_with(|| QueueState {
                strict_order: name.ends_with(FIFO_SUFFIX),
                ..QueueState::default()
            })
    }

    fn try_receive(
        &self,
        queue: &str,
        max_messages: u32,
        visibility_seconds: u32,
    ) -> Vec<RemoteMessage> {
        let now = now_millis();
        let mut queues = self.lock();
        let state = Self::state(&mut queues, queue);
        let visible_until = now + visibility_seconds.min(MAX_VISIBILITY_SECONDS) as i64 * 1000;

        let mut blocked_groups = HashSet::new();
        let mut received = Vec::new();
        for message in state.messages.iter_mut() {
            if received.len() >= max_messages as usize {
                break;
            }
            let group = message.group_id.clone();
            if state.strict_order {
                if let Some(group) = &group {
                    if blocked_groups.contains(group) {
                        continue;
                    }
                }
            }
            if message.visible_at > now {
                // later messages of a strict-order group wait behind this one
                if state.strict_order {
                    if let Some(group) = group {
                        blocked_groups.insert(group);
                    }
                }
                continue;
            }

            let receipt_handle = uuid::Uuid::new_v4().to_string();
            message.receive_count += 1;
            message.visible_at = visible_until;
            message.receipt_handle = Some(receipt_handle.clone());
            received.push(RemoteMessage {
                message_id: message.message_id.clone(),
                receipt_handle,
                body: message.body.clone(),
                receive_count: message.receive_count,
            });
        }
        received
    }
}

#[async_trait]
impl RemoteQueueClient for LocalRemoteQueue {
    async fn send(&self, queue: &str, message: OutgoingMessage) -> Result<String> {
        let now = now_millis();
        let mut queues = self.lock();
        let state = Self::state(&mut queues, queue);

        if state.strict_order {
            if message.delay_seconds > 0 {
                return Err(Error::Remote(format!(
                    "InvalidParameterValue: strict-order queue '{}' does not support per-message delays",
                    queue
                )));
            }
            if message.group_id.is_none() {
                return Err(Error::Remote(format!(
                    "MissingParameter: strict-order queue '{}' requires a message group id",
                    queue
                )));
            }

            let deduplication_id = match message.deduplication_id {
                Some(id) => id,
                None if state.content_deduplication => {
                    format!("{:x}", Sha256::digest(message.body.as_bytes()))
                }
                None => {
                    return Err(Error::Remote(format!(
                        "InvalidParameterValue: strict-order queue '{}' requires a deduplication id",
                        queue
                    )))
                }
            };

            state
                .sent
                .retain(|_, (sent_at, _)| now - *sent_at < DEDUPLICATION_WINDOW_MS);
            if let Some((_, message_id)) = state.sent.get(&deduplication_id) {
                // accepted but not enqueued again
                return Ok(message_id.clone());
            }

            let message_id = uuid::Uuid::new_v4().to_string();
            state
                .sent
                .insert(deduplication_id, (now, message_id.clone()));
            state.messages.push(StoredMessage {
                message_id: message_id.clone(),
                body: message.body,
                group_id: message.group_id,
                visible_at: now,
                receive_count: 0,
                receipt_handle: None,
            });
            return Ok(message_id);
        }

        let message_id = uuid::Uuid::new_v4().to_string();
        state.messages.push(StoredMessage {
            message_id: message_id.clone(),
            body: message.body,
            group_id: message.group_id,
            visible_at: now + message.delay_seconds as i64 * 1000,
            receive_count: 0,
            receipt_handle: None,
        });
        Ok(message_id)
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: u32,
        wait_seconds: u32,
        visibility_seconds: u32,
        _attempt_id: Option<&str>,
    ) -> Result<Vec<RemoteMessage>> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(wait_seconds as u64);
        loop {
            let received = self.try_receive(queue, max_messages.max(1), visibility_seconds);
            if !received.is_empty() || tokio::time::Instant::now() >= deadline {
                return Ok(received);
            }
            tokio::time::sleep(RECEIVE_POLL).await;
        }
    }

    async fn delete(&self, queue: &str, receipt_handle: &str) -> Result<bool> {
        let mut queues = self.lock();
        let state = Self::state(&mut queues, queue);
        let before = state.messages.len();
        state
            .messages
            .retain(|message| message.receipt_handle.as_deref() != Some(receipt_handle));
        Ok(state.messages.len() < before)
    }

    async fn change_visibility(
        &self,
        queue: &str,
        receipt_handle: &str,
        seconds: u32,
    ) -> Result<()> {
        if seconds > MAX_VISIBILITY_SECONDS {
            return Err(Error::Remote(format!(
                "InvalidParameterValue: visibility timeout {}s exceeds {}s",
                seconds, MAX_VISIBILITY_SECONDS
            )));
        }

        let now = now_millis();
        let mut queues = self.lock();
        let state = Self::state(&mut queues, queue);
        let message = state
            .messages
            .iter_mut()
            .find(|message| message.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| Error::JobNotFound(receipt_handle.to_string()))?;

        if !message.in_flight(now) {
            return Err(Error::JobNotLeased(receipt_handle.to_string()));
        }
        message.visible_at = now + seconds as i64 * 1000;
        Ok(())
    }

    async fn purge(&self, queue: &str) -> Result<()> {
        let mut queues = self.lock();
        let state = Self::state(&mut queues, queue);
        state.messages.clear();
        state.sent.clear();
        Ok(())
    }

    async fn get_attributes(
        &self,
        queue: &str,
        names: &[&str],
    ) -> Result<HashMap<String, String>> {
        let now = now_millis();
        let mut queues = self.lock();
        let state = Self::state(&mut queues, queue);

        let visible = state
            .messages
            .iter()
            .filter(|message| message.visible_at <= now)
            .count();
        let not_visible = state
            .messages
            .iter()
            .filter(|message| message.in_flight(now))
            .count();
        let delayed = state.messages.len() - visible - not_visible;

        let all = [
            (ATTR_FIFO_QUEUE, state.strict_order.to_string()),
            (
                ATTR_CONTENT_BASED_DEDUPLICATION,
                state.content_deduplication.to_string(),
            ),
            (ATTR_MESSAGES, visible.to_string()),
            (ATTR_MESSAGES_NOT_VISIBLE, not_visible.to_string()),
            (ATTR_MESSAGES_DELAYED, delayed.to_string()),
        ];

        Ok(all
            .into_iter()
            .filter(|(name, _)| names.contains(&"All") || names.contains(name))
            .map(|(name, value)| (name.to_string(), value))
            .collect())
    }
}
