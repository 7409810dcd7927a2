//! Redis-backed stage queues.
//!
//! Same pending/processing list pattern as a classic reliable queue:
//! LPUSH onto pending, RPOPLPUSH into processing, LREM on ack. Dead letters
//! go to a separate list per stage. All keys carry a TTL so an abandoned
//! deployment does not hold messages forever.

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::QueueError;
use crate::models::message::{PipelineMessage, Stage};

use super::{DeadLetter, StageQueue};

const KEY_PREFIX: &str = "sync_orchestrator";

pub struct RedisStageQueue {
    client: redis::Client,
    ttl_secs: i64,
}

impl RedisStageQueue {
    pub fn new(redis_url: &str, ttl_secs: u64) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            ttl_secs: ttl_secs as i64,
        })
    }

    fn pending_key(stage: Stage) -> String {
        format!("{KEY_PREFIX}:{stage}:pending")
    }

    fn processing_key(stage: Stage) -> String {
        format!("{KEY_PREFIX}:{stage}:processing")
    }

    fn dead_key(stage: Stage) -> String {
        format!("{KEY_PREFIX}:{stage}:dead")
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[async_trait]
impl StageQueue for RedisStageQueue {
    async fn enqueue(&self, msg: &PipelineMessage) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(msg).map_err(QueueError::Serialize)?;
        let key = Self::pending_key(msg.stage);
        conn.lpush::<_, _, ()>(&key, &payload)
            .await
            .map_err(QueueError::Redis)?;
        conn.expire::<_, ()>(&key, self.ttl_secs)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn dequeue(&self, stage: Stage) -> Result<Option<PipelineMessage>, QueueError> {
        let mut conn = self.connection().await?;
        let result: Option<String> = conn
            .rpoplpush(Self::pending_key(stage), Self::processing_key(stage))
            .await
            .map_err(QueueError::Redis)?;

        match result {
            Some(payload) => {
                let msg: PipelineMessage =
                    serde_json::from_str(&payload).map_err(QueueError::Serialize)?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, msg: &PipelineMessage) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(msg).map_err(QueueError::Serialize)?;
        conn.lrem::<_, _, ()>(Self::processing_key(msg.stage), 1, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn requeue(&self, msg: &PipelineMessage) -> Result<(), QueueError> {
        self.enqueue(&msg.requeued()).await?;
        self.ack(msg).await
    }

    async fn dead_letter(&self, msg: &PipelineMessage, error: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let entry = DeadLetter::new(msg.clone(), error);
        let payload = serde_json::to_string(&entry).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(Self::dead_key(msg.stage), &payload)
            .await
            .map_err(QueueError::Redis)?;
        self.ack(msg).await
    }

    async fn depth(&self, stage: Stage) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn
            .llen(Self::pending_key(stage))
            .await
            .map_err(QueueError::Redis)?;
        Ok(depth)
    }

    async fn recover(&self, stage: Stage) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let mut recovered = 0u64;
        loop {
            let moved: Option<String> = conn
                .rpoplpush(Self::processing_key(stage), Self::pending_key(stage))
                .await
                .map_err(QueueError::Redis)?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn dead_letters(&self, stage: Stage) -> Result<Vec<DeadLetter>, QueueError> {
        let mut conn = self.connection().await?;
        let payloads: Vec<String> = conn
            .lrange(Self::dead_key(stage), 0, -1)
            .await
            .map_err(QueueError::Redis)?;

        let mut entries = Vec::with_capacity(payloads.len());
        // LPUSH order means newest first; reverse to oldest first.
        for payload in payloads.into_iter().rev() {
            entries.push(serde_json::from_str(&payload).map_err(QueueError::Serialize)?);
        }
        Ok(entries)
    }
}
