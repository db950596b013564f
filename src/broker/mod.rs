//! Task queue broker: 21 analysis queues, 3 corrective queues, and 3
//! management queues, each a bounded FIFO with priority tiers.
//!
//! The [`QueueBroker`] trait keeps the scheduler independent of the queue
//! store:
//!
//! - **Testing / single node**: [`memory::MemoryBroker`]
//! - **Production**: [`redis::RedisBroker`]

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use strum::IntoEnumIterator;
use uuid::Uuid;

use crate::models::qa::QaTier;
use crate::models::task::AnalysisType;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("queue payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Drain order within a queue: all high before any normal, all normal
/// before any low; FIFO within one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub const DRAIN_ORDER: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn lane(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagementQueue {
    ManualReview,
    Priority,
    BatchCompletion,
}

impl ManagementQueue {
    fn name(self) -> &'static str {
        match self {
            ManagementQueue::ManualReview => "manual_review",
            ManagementQueue::Priority => "priority",
            ManagementQueue::BatchCompletion => "batch_completion",
        }
    }
}

/// Identity of one of the 27 queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKey {
    Analysis(AnalysisType),
    Corrective(QaTier),
    Management(ManagementQueue),
}

impl QueueKey {
    pub fn name(self) -> String {
        match self {
            QueueKey::Analysis(t) => format!("analysis:{t}"),
            QueueKey::Corrective(tier) => format!("corrective:{tier}"),
            QueueKey::Management(q) => format!("management:{}", q.name()),
        }
    }

    /// Every queue, in the round-robin order workers scan them.
    pub fn all() -> Vec<QueueKey> {
        let mut keys: Vec<QueueKey> = AnalysisType::iter().map(QueueKey::Analysis).collect();
        keys.extend(QaTier::ALL.into_iter().map(QueueKey::Corrective));
        keys.extend([
            QueueKey::Management(ManagementQueue::ManualReview),
            QueueKey::Management(ManagementQueue::Priority),
            QueueKey::Management(ManagementQueue::BatchCompletion),
        ]);
        keys
    }

    /// The queues workers drain: analysis first, then corrective.
    pub fn worker_scan() -> Vec<QueueKey> {
        let mut keys: Vec<QueueKey> = QaTier::ALL.into_iter().map(QueueKey::Corrective).collect();
        keys.extend(AnalysisType::iter().map(QueueKey::Analysis));
        keys
    }
}

/// A dequeued item. The task stays tracked as inflight until `ack`; a
/// delivery that is never acked is requeued at the head after the
/// inflight deadline.
#[derive(Debug, Clone, Copy)]
pub struct Delivery {
    pub queue: QueueKey,
    pub task_id: Uuid,
    pub priority: Priority,
}

#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Add a task to a queue. Idempotent on (task_id, queue): a duplicate
    /// returns `false` without growing the queue. Blocks while the queue
    /// is at capacity; no drops.
    async fn enqueue(
        &self,
        queue: QueueKey,
        task_id: Uuid,
        priority: Priority,
    ) -> Result<bool, BrokerError>;

    /// Peek-and-lease the next item in priority-then-FIFO order, waiting
    /// up to `wait` for one to arrive.
    async fn dequeue(&self, queue: QueueKey, wait: Duration)
        -> Result<Option<Delivery>, BrokerError>;

    /// Settle a delivery; the task leaves the queue for good.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Number of waiting (not inflight) items.
    async fn depth(&self, queue: QueueKey) -> Result<usize, BrokerError>;

    /// Drop a waiting task from a queue (cooperative cancel). Inflight
    /// items are untouched.
    async fn remove(&self, queue: QueueKey, task_id: Uuid) -> Result<bool, BrokerError>;

    /// Requeue inflight items whose deadline has passed, at the head of
    /// their original priority lane. Returns how many were requeued.
    async fn requeue_expired(&self) -> Result<usize, BrokerError>;
}
