//! Redis Streams work queue.
//!
//! Messages are appended with XADD and read through a consumer group
//! (XREADGROUP), which gives at-least-once delivery: an entry read by a
//! consumer stays in that consumer's pending list until XACKed, and a
//! restarted consumer with the same name drains its own pending entries
//! before asking for fresh ones.

use redis::streams::{StreamPendingReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::models::operation::Operation;

const MESSAGE_FIELD: &str = "data";

/// On-queue payload. Mutable job state (status, progress) is not carried
/// here: the worker re-reads the row on dispatch so cancellations and races
/// are observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: Uuid,
    pub operations: Vec<Operation>,
}

/// A message handed to a dispatch task; `id` is the stream entry id used for
/// acknowledgement.
#[derive(Debug)]
pub struct QueueMessage {
    pub id: String,
    pub job: JobMessage,
}

/// Observational queue statistics, best-effort.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub stream_length: i64,
    pub pending_count: i64,
    pub consumer_count: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("job message serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("malformed queue message: missing data field")]
    MalformedMessage,
}

/// Producer half, used by the acceptor.
pub struct JobQueue {
    client: redis::Client,
    stream: String,
}

impl JobQueue {
    pub fn new(redis_url: &str, stream: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            stream: stream.to_string(),
        })
    }

    /// Append a job message; returns once Redis has accepted the entry.
    pub async fn enqueue(&self, msg: &JobMessage) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(msg)?;
        let _id: String = conn
            .xadd(&self.stream, "*", &[(MESSAGE_FIELD, payload.as_str())])
            .await?;
        Ok(())
    }

    /// Stream length plus the group's pending/consumer counts. A missing
    /// group (no worker has started yet) reads as zeros.
    pub async fn stats(&self, group: &str) -> Result<QueueStats, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let stream_length: i64 = conn.xlen(&self.stream).await?;

        let (pending_count, consumer_count) =
            match conn.xpending::<_, _, StreamPendingReply>(&self.stream, group).await {
                Ok(StreamPendingReply::Data(data)) => {
                    (data.count as i64, data.consumers.len() as i64)
                }
                Ok(StreamPendingReply::Empty) => (0, 0),
                Err(_) => (0, 0),
            };

        Ok(QueueStats {
            stream_length,
            pending_count,
            consumer_count,
        })
    }

    /// Redis connectivity probe for health checks.
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

/// Consumer half, used by worker dispatch tasks. All tasks in one process
/// share a single consumer name so a restarted process resumes its own
/// unacknowledged work.
pub struct JobConsumer {
    client: redis::Client,
    stream: String,
    group: String,
    consumer: String,
    poll_timeout: Duration,
}

impl JobConsumer {
    pub fn new(
        redis_url: &str,
        stream: &str,
        group: &str,
        consumer: &str,
        poll_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            poll_timeout,
        })
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }

    /// Create the consumer group if it does not exist yet. Idempotent.
    pub async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let created: Result<String, redis::RedisError> = conn
            .xgroup_create_mkstream(&self.stream, &self.group, "0")
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Two-phase read: first drain this consumer's own previously-delivered
    /// but unacknowledged entries (non-blocking), then block up to
    /// `poll_timeout` for a fresh one. `None` means the blocking read timed
    /// out with nothing to do.
    pub async fn consume(&self) -> Result<Option<QueueMessage>, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let pending_opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1);
        let pending: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &["0"], &pending_opts)
            .await?;
        if let Some(msg) = first_message(pending)? {
            return Ok(Some(msg));
        }

        let fresh_opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1)
            .block(self.poll_timeout.as_millis() as usize);
        let fresh: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &[">"], &fresh_opts)
            .await?;
        first_message(fresh)
    }

    /// Acknowledge an entry within the group; it will not be redelivered.
    pub async fn ack(&self, message_id: &str) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _acked: i64 = conn.xack(&self.stream, &self.group, &[message_id]).await?;
        Ok(())
    }
}

fn first_message(reply: Option<StreamReadReply>) -> Result<Option<QueueMessage>, QueueError> {
    let Some(reply) = reply else {
        return Ok(None);
    };
    let Some(key) = reply.keys.into_iter().next() else {
        return Ok(None);
    };
    let Some(entry) = key.ids.into_iter().next() else {
        return Ok(None);
    };

    let payload: String = entry
        .get(MESSAGE_FIELD)
        .ok_or(QueueError::MalformedMessage)?;
    let job: JobMessage = serde_json::from_str(&payload)?;

    Ok(Some(QueueMessage { id: entry.id, job }))
}
