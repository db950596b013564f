//! In-memory queue broker. Full queue semantics (priority lanes, bounded
//! capacity with blocking producers, inflight deadlines) without a queue
//! store; used by the test suite and by single-node runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex, Notify};
use uuid::Uuid;

use super::{BrokerError, Delivery, Priority, QueueBroker, QueueKey};

const WAIT_SLICE: Duration = Duration::from_millis(25);

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_INFLIGHT_TTL: Duration = Duration::from_secs(300);

struct InflightItem {
    priority: Priority,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    high: VecDeque<Uuid>,
    normal: VecDeque<Uuid>,
    low: VecDeque<Uuid>,
    /// Tasks either waiting or inflight; enforces one-queue-at-a-time.
    members: HashSet<Uuid>,
    inflight: HashMap<Uuid, InflightItem>,
    /// Producers blocked at capacity, oldest first. Each freed slot wakes
    /// exactly the head waiter.
    space_waiters: VecDeque<oneshot::Sender<()>>,
}

impl QueueState {
    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<Uuid> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn waiting(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn pop_next(&mut self) -> Option<(Uuid, Priority)> {
        for priority in Priority::DRAIN_ORDER {
            if let Some(task_id) = self.lane_mut(priority).pop_front() {
                return Some((task_id, priority));
            }
        }
        None
    }

    /// Hand a freed slot to the oldest live waiter. Waiters whose enqueue
    /// was cancelled are skipped so the slot is never lost.
    fn wake_next_producer(&mut self) {
        while let Some(waiter) = self.space_waiters.pop_front() {
            if waiter.send(()).is_ok() {
                break;
            }
        }
    }
}

struct Shared {
    state: Mutex<QueueState>,
    /// Woken when an item arrives.
    arrivals: Notify,
}

pub struct MemoryBroker {
    capacity: usize,
    inflight_ttl: Duration,
    queues: Mutex<HashMap<QueueKey, Arc<Shared>>>,
}

impl MemoryBroker {
    pub fn new(capacity: usize, inflight_ttl: Duration) -> Self {
        Self {
            capacity,
            inflight_ttl,
            queues: Mutex::new(HashMap::new()),
        }
    }

    async fn shared(&self, queue: QueueKey) -> Arc<Shared> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(queue)
            .or_insert_with(|| {
                Arc::new(Shared {
                    state: Mutex::new(QueueState::default()),
                    arrivals: Notify::new(),
                })
            })
            .clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, DEFAULT_INFLIGHT_TTL)
    }
}

#[async_trait]
impl QueueBroker for MemoryBroker {
    async fn enqueue(
        &self,
        queue: QueueKey,
        task_id: Uuid,
        priority: Priority,
    ) -> Result<bool, BrokerError> {
        let shared = self.shared(queue).await;
        // Set once this producer has been handed a freed slot; it then
        // outranks any producer that arrived after it.
        let mut entitled = false;
        loop {
            let waiter = {
                let mut state = shared.state.lock().await;
                if state.members.contains(&task_id) {
                    if entitled {
                        // Not using the slot we were handed; pass it on.
                        state.wake_next_producer();
                    }
                    return Ok(false);
                }
                if state.waiting() < self.capacity
                    && (entitled || state.space_waiters.is_empty())
                {
                    state.members.insert(task_id);
                    state.lane_mut(priority).push_back(task_id);
                    shared.arrivals.notify_one();
                    return Ok(true);
                }
                // At capacity, or older producers are already queued:
                // register and wait for a head-first wakeup. A woken
                // producer that loses the race back to the lock re-enters
                // at the front.
                let (sender, receiver) = oneshot::channel();
                if entitled {
                    state.space_waiters.push_front(sender);
                } else {
                    state.space_waiters.push_back(sender);
                }
                receiver
            };
            entitled = waiter.await.is_ok();
        }
    }

    async fn dequeue(
        &self,
        queue: QueueKey,
        wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let shared = self.shared(queue).await;
        let started = Instant::now();
        loop {
            {
                let mut state = shared.state.lock().await;
                if let Some((task_id, priority)) = state.pop_next() {
                    state.inflight.insert(
                        task_id,
                        InflightItem {
                            priority,
                            deadline: Instant::now() + self.inflight_ttl,
                        },
                    );
                    state.wake_next_producer();
                    return Ok(Some(Delivery {
                        queue,
                        task_id,
                        priority,
                    }));
                }
            }
            let elapsed = started.elapsed();
            if elapsed >= wait {
                return Ok(None);
            }
            let remaining = (wait - elapsed).min(WAIT_SLICE);
            let _ = tokio::time::timeout(remaining, shared.arrivals.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let shared = self.shared(delivery.queue).await;
        let mut state = shared.state.lock().await;
        state.inflight.remove(&delivery.task_id);
        state.members.remove(&delivery.task_id);
        Ok(())
    }

    async fn depth(&self, queue: QueueKey) -> Result<usize, BrokerError> {
        let shared = self.shared(queue).await;
        let state = shared.state.lock().await;
        Ok(state.waiting())
    }

    async fn remove(&self, queue: QueueKey, task_id: Uuid) -> Result<bool, BrokerError> {
        let shared = self.shared(queue).await;
        let mut state = shared.state.lock().await;
        let mut removed = false;
        for priority in Priority::DRAIN_ORDER {
            let lane = state.lane_mut(priority);
            if let Some(pos) = lane.iter().position(|id| *id == task_id) {
                lane.remove(pos);
                removed = true;
                break;
            }
        }
        if removed {
            state.members.remove(&task_id);
            state.wake_next_producer();
        }
        Ok(removed)
    }

    async fn requeue_expired(&self) -> Result<usize, BrokerError> {
        let queues: Vec<Arc<Shared>> = {
            let queues = self.queues.lock().await;
            queues.values().cloned().collect()
        };
        let now = Instant::now();
        let mut requeued = 0;
        for shared in queues {
            let mut state = shared.state.lock().await;
            let expired: Vec<Uuid> = state
                .inflight
                .iter()
                .filter(|(_, item)| item.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            for task_id in expired {
                let item = state.inflight.remove(&task_id).expect("expired item present");
                // Back to the head so a stalled delivery is retried first.
                state.lane_mut(item.priority).push_front(task_id);
                shared.arrivals.notify_one();
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::task::AnalysisType;

    fn key() -> QueueKey {
        QueueKey::Analysis(AnalysisType::Colors)
    }

    #[tokio::test]
    async fn priority_then_fifo_order() {
        let broker = MemoryBroker::default();
        let (a, b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        broker.enqueue(key(), a, Priority::Normal).await.unwrap();
        broker.enqueue(key(), b, Priority::Low).await.unwrap();
        broker.enqueue(key(), c, Priority::High).await.unwrap();
        broker.enqueue(key(), d, Priority::Normal).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            let delivery = broker
                .dequeue(key(), Duration::from_millis(10))
                .await
                .unwrap()
                .unwrap();
            seen.push(delivery.task_id);
            broker.ack(&delivery).await.unwrap();
        }
        assert_eq!(seen, vec![c, a, d, b]);
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_queue() {
        let broker = MemoryBroker::default();
        let task = Uuid::new_v4();
        assert!(broker.enqueue(key(), task, Priority::Normal).await.unwrap());
        assert!(!broker.enqueue(key(), task, Priority::Normal).await.unwrap());
        assert_eq!(broker.depth(key()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn full_queue_blocks_producer_until_a_slot_frees() {
        let broker = Arc::new(MemoryBroker::new(1, DEFAULT_INFLIGHT_TTL));
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        broker.enqueue(key(), first, Priority::Normal).await.unwrap();

        let blocked = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.enqueue(key(), second, Priority::Normal).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "producer should be blocked at capacity");

        let delivery = broker
            .dequeue(key(), Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        broker.ack(&delivery).await.unwrap();

        let admitted = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("blocked producer should be admitted")
            .unwrap()
            .unwrap();
        assert!(admitted);
        assert_eq!(broker.depth(key()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn blocked_producers_are_admitted_in_fifo_order() {
        let broker = Arc::new(MemoryBroker::new(1, DEFAULT_INFLIGHT_TTL));
        let first = Uuid::new_v4();
        broker.enqueue(key(), first, Priority::Normal).await.unwrap();

        // Three producers block at capacity, in a known arrival order.
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut blocked = Vec::new();
        for task in [a, b, c] {
            let broker = broker.clone();
            blocked.push(tokio::spawn(async move {
                broker.enqueue(key(), task, Priority::Normal).await
            }));
            // Let each producer register before the next arrives.
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert!(blocked.iter().all(|handle| !handle.is_finished()));

        // Each dequeue frees one slot and admits exactly the oldest
        // waiter, so the items surface in arrival order.
        let mut seen = Vec::new();
        for _ in 0..4 {
            let delivery = broker
                .dequeue(key(), Duration::from_secs(1))
                .await
                .unwrap()
                .unwrap();
            seen.push(delivery.task_id);
            broker.ack(&delivery).await.unwrap();
        }
        assert_eq!(seen, vec![first, a, b, c]);
        for handle in blocked {
            assert!(handle.await.unwrap().unwrap());
        }
    }

    #[tokio::test]
    async fn unacked_delivery_is_requeued_at_the_head() {
        let broker = MemoryBroker::new(10, Duration::from_millis(1));
        let stalled = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        broker.enqueue(key(), stalled, Priority::Normal).await.unwrap();
        broker.enqueue(key(), fresh, Priority::Normal).await.unwrap();

        let delivery = broker
            .dequeue(key(), Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.task_id, stalled);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(broker.requeue_expired().await.unwrap(), 1);

        let next = broker
            .dequeue(key(), Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.task_id, stalled, "expired delivery returns to the head");
    }
}
