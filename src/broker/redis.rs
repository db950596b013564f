//! Redis-backed queue broker. Each queue is three lists (one per priority
//! lane) plus a membership set for idempotent enqueue and a processing
//! list with a deadline hash for peek-and-lease dequeue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{BrokerError, Delivery, Priority, QueueBroker, QueueKey};

const KEY_PREFIX: &str = "visionflow";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Serialize, Deserialize)]
struct InflightRecord {
    lane: String,
    deadline_ms: i64,
}

pub struct RedisBroker {
    client: redis::Client,
    capacity: usize,
    inflight_ttl: Duration,
    /// Per-queue admission gates. tokio's mutex grants the lock to
    /// waiters oldest-first, so producers blocked at capacity are
    /// admitted in FIFO order.
    gates: Mutex<HashMap<QueueKey, Arc<Mutex<()>>>>,
}

fn lane_key(queue: QueueKey, priority: Priority) -> String {
    format!("{KEY_PREFIX}:{}:{}", queue.name(), priority.lane())
}

fn members_key(queue: QueueKey) -> String {
    format!("{KEY_PREFIX}:{}:members", queue.name())
}

fn processing_key(queue: QueueKey) -> String {
    format!("{KEY_PREFIX}:{}:processing", queue.name())
}

fn deadlines_key(queue: QueueKey) -> String {
    format!("{KEY_PREFIX}:{}:deadlines", queue.name())
}

impl RedisBroker {
    pub fn new(
        redis_url: &str,
        capacity: usize,
        inflight_ttl: Duration,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            capacity,
            inflight_ttl,
            gates: Mutex::new(HashMap::new()),
        })
    }

    async fn admission_gate(&self, queue: QueueKey) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().await;
        gates.entry(queue).or_default().clone()
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, BrokerError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn waiting(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        queue: QueueKey,
    ) -> Result<usize, BrokerError> {
        let mut total = 0usize;
        for priority in Priority::DRAIN_ORDER {
            let len: usize = conn.llen(lane_key(queue, priority)).await?;
            total += len;
        }
        Ok(total)
    }
}

#[async_trait]
impl QueueBroker for RedisBroker {
    async fn enqueue(
        &self,
        queue: QueueKey,
        task_id: Uuid,
        priority: Priority,
    ) -> Result<bool, BrokerError> {
        // One producer holds the gate at a time; the rest queue behind it
        // oldest-first, so when the queue store frees a slot only the
        // longest-waiting producer can take it. The slot itself is only
        // observable by polling, since consumers may drain from other
        // processes.
        let gate = self.admission_gate(queue).await;
        let _admission = gate.lock().await;

        let mut conn = self.connection().await?;
        let added: i64 = conn
            .sadd(members_key(queue), task_id.to_string())
            .await?;
        if added == 0 {
            return Ok(false);
        }
        // Backpressure: hold the producer until a slot opens. Membership is
        // already claimed, so concurrent duplicates stay suppressed while
        // we wait.
        loop {
            if self.waiting(&mut conn, queue).await? < self.capacity {
                conn.lpush::<_, _, ()>(lane_key(queue, priority), task_id.to_string())
                    .await?;
                return Ok(true);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn dequeue(
        &self,
        queue: QueueKey,
        wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let mut conn = self.connection().await?;
        let started = std::time::Instant::now();
        loop {
            for priority in Priority::DRAIN_ORDER {
                let value: Option<String> = conn
                    .rpoplpush(lane_key(queue, priority), processing_key(queue))
                    .await?;
                if let Some(raw) = value {
                    let task_id = Uuid::parse_str(&raw).map_err(|_| {
                        BrokerError::Payload(serde_json::Error::io(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("queue item is not a uuid: {raw}"),
                        )))
                    })?;
                    let record = InflightRecord {
                        lane: priority.lane().to_string(),
                        deadline_ms: (Utc::now()
                            + chrono::Duration::from_std(self.inflight_ttl)
                                .unwrap_or_else(|_| chrono::Duration::seconds(300)))
                        .timestamp_millis(),
                    };
                    conn.hset::<_, _, _, ()>(
                        deadlines_key(queue),
                        &raw,
                        serde_json::to_string(&record)?,
                    )
                    .await?;
                    return Ok(Some(Delivery {
                        queue,
                        task_id,
                        priority,
                    }));
                }
            }
            if started.elapsed() >= wait {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(wait)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;
        let raw = delivery.task_id.to_string();
        conn.lrem::<_, _, ()>(processing_key(delivery.queue), 1, &raw)
            .await?;
        conn.hdel::<_, _, ()>(deadlines_key(delivery.queue), &raw)
            .await?;
        conn.srem::<_, _, ()>(members_key(delivery.queue), &raw)
            .await?;
        Ok(())
    }

    async fn depth(&self, queue: QueueKey) -> Result<usize, BrokerError> {
        let mut conn = self.connection().await?;
        self.waiting(&mut conn, queue).await
    }

    async fn remove(&self, queue: QueueKey, task_id: Uuid) -> Result<bool, BrokerError> {
        let mut conn = self.connection().await?;
        let raw = task_id.to_string();
        let mut removed = 0i64;
        for priority in Priority::DRAIN_ORDER {
            let n: i64 = conn.lrem(lane_key(queue, priority), 1, &raw).await?;
            removed += n;
            if n > 0 {
                break;
            }
        }
        if removed > 0 {
            conn.srem::<_, _, ()>(members_key(queue), &raw).await?;
        }
        Ok(removed > 0)
    }

    async fn requeue_expired(&self) -> Result<usize, BrokerError> {
        let mut conn = self.connection().await?;
        let now_ms = Utc::now().timestamp_millis();
        let mut requeued = 0usize;
        for queue in QueueKey::all() {
            let entries: Vec<(String, String)> = conn.hgetall(deadlines_key(queue)).await?;
            for (raw_id, raw_record) in entries {
                let record: InflightRecord = match serde_json::from_str(&raw_record) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                if record.deadline_ms > now_ms {
                    continue;
                }
                let removed: i64 = conn.lrem(processing_key(queue), 1, &raw_id).await?;
                if removed == 0 {
                    // Already acked; drop the stale deadline.
                    conn.hdel::<_, _, ()>(deadlines_key(queue), &raw_id).await?;
                    continue;
                }
                // Back to the consumer end of its original lane.
                let lane = format!("{KEY_PREFIX}:{}:{}", queue.name(), record.lane);
                conn.rpush::<_, _, ()>(lane, &raw_id).await?;
                conn.hdel::<_, _, ()>(deadlines_key(queue), &raw_id).await?;
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}
