use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::error::{JobplaneError, Result};
use crate::jobs::job::JobArguments;

/// Broker payload for one worker-pool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub execution_result_id: Uuid,
    pub job_class_path: String,
    pub arguments: JobArguments,
}

/// Named-topic task queue shared by the dispatcher and the worker pool.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, message: &TaskMessage) -> Result<()>;

    /// Wait up to `timeout` for a message on any of `topics`, checked in order.
    async fn consume(&self, topics: &[String], timeout: Duration) -> Result<Option<TaskMessage>>;
}

/// In-process broker. Messages live only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, VecDeque<TaskMessage>>>,
    notify: Notify,
    unavailable: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the broker going away (publish and consume fail).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub async fn depth(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .await
            .get(topic)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(JobplaneError::Broker("broker is unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    async fn try_pop(&self, topics: &[String]) -> Option<TaskMessage> {
        let mut queues = self.topics.lock().await;
        topics
            .iter()
            .find_map(|topic| queues.get_mut(topic).and_then(VecDeque::pop_front))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, message: &TaskMessage) -> Result<()> {
        self.check_available()?;
        self.topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .push_back(message.clone());
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, topics: &[String], timeout: Duration) -> Result<Option<TaskMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.check_available()?;
            let notified = self.notify.notified();
            if let Some(message) = self.try_pop(topics).await {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

const REDIS_KEY_PREFIX: &str = "jobplane:queue:";

/// Redis list per topic: LPUSH to publish, BRPOP to consume.
pub struct RedisBroker {
    client: redis::Client,
}

impl RedisBroker {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| JobplaneError::Configuration(format!("invalid broker url: {}", e)))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(broker_error)
    }
}

fn broker_error(e: redis::RedisError) -> JobplaneError {
    JobplaneError::Broker(e.to_string())
}

fn redis_key(topic: &str) -> String {
    format!("{}{}", REDIS_KEY_PREFIX, topic)
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, message: &TaskMessage) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.connection().await?;
        redis::cmd("LPUSH")
            .arg(redis_key(topic))
            .arg(payload)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(broker_error)?;
        Ok(())
    }

    async fn consume(&self, topics: &[String], timeout: Duration) -> Result<Option<TaskMessage>> {
        let keys: Vec<String> = topics.iter().map(|t| redis_key(t)).collect();
        let mut conn = self.connection().await?;
        let popped = redis::cmd("BRPOP")
            .arg(keys)
            .arg(timeout.as_secs_f64())
            .query_async::<_, Option<(String, String)>>(&mut conn)
            .await
            .map_err(broker_error)?;
        match popped {
            Some((_key, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }
}
