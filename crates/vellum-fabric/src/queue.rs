//! Bounded three-level priority wait queue.
//!
//! Admission control in front of the rate limiter: a fixed number of
//! requests may be in flight; a fixed number may wait. Waiters are served
//! FIFO within a priority level and strictly by priority across levels;
//! under sustained high-priority load, low-priority waiters starve. That
//! trade-off is accepted.
//!
//! When the wait queue is full and the drop-lowest policy is enabled, an
//! arrival with strictly higher priority displaces the lowest-priority
//! waiter; the displaced waiter's pending `acquire` resolves to a
//! queue-full error at displacement time.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use vellum_core::error::{Error, Result};

/// Request priority, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Served before everything else.
    High,
    /// Default priority.
    Medium,
    /// Served only when nothing above waits.
    Low,
}

/// Queue configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum concurrent in-flight admissions.
    pub max_in_flight: usize,
    /// Maximum waiters across all levels.
    pub max_waiting: usize,
    /// Whether a full queue displaces its lowest-priority waiter for a
    /// strictly higher-priority arrival.
    pub drop_lowest: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            max_waiting: 32,
            drop_lowest: true,
        }
    }
}

struct Waiter {
    priority: Priority,
    seq: u64,
    tx: oneshot::Sender<Result<()>>,
}

struct Inner {
    in_flight: usize,
    waiting: Vec<Waiter>,
    next_seq: u64,
}

/// Bounded priority admission queue.
///
/// `acquire` returns an RAII [`QueuePermit`]; dropping the permit admits
/// the head waiter, if any.
pub struct PriorityQueue {
    config: QueueConfig,
    inner: Arc<Mutex<Inner>>,
}

impl PriorityQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(Inner {
                in_flight: 0,
                waiting: Vec::new(),
                next_seq: 0,
            })),
        }
    }

    /// Acquires an admission slot at the given priority.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] when both the in-flight and waiting
    /// capacities are exhausted and this request does not displace a
    /// lower-priority waiter.
    pub async fn acquire(&self, priority: Priority) -> Result<QueuePermit> {
        let rx = {
            let mut inner = self
                .inner
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);

            if inner.in_flight < self.config.max_in_flight {
                inner.in_flight += 1;
                return Ok(QueuePermit {
                    inner: Arc::clone(&self.inner),
                });
            }

            if inner.waiting.len() >= self.config.max_waiting {
                let displaced = if self.config.drop_lowest {
                    // The vec is sorted by (priority, seq), so the lowest
                    // waiter is last. Displace only on strictly lower
                    // priority than the arrival.
                    match inner.waiting.last() {
                        Some(last) if last.priority > priority => inner.waiting.pop(),
                        _ => None,
                    }
                } else {
                    None
                };

                match displaced {
                    Some(waiter) => {
                        let _ = waiter.tx.send(Err(Error::QueueFull {
                            waiting: self.config.max_waiting,
                            in_flight: inner.in_flight,
                        }));
                    }
                    None => {
                        return Err(Error::QueueFull {
                            waiting: inner.waiting.len(),
                            in_flight: inner.in_flight,
                        });
                    }
                }
            }

            let (tx, rx) = oneshot::channel();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let waiter = Waiter { priority, seq, tx };
            let at = inner
                .waiting
                .partition_point(|w| (w.priority, w.seq) <= (priority, seq));
            inner.waiting.insert(at, waiter);
            rx
        };

        match rx.await {
            Ok(Ok(())) => Ok(QueuePermit {
                inner: Arc::clone(&self.inner),
            }),
            Ok(Err(e)) => Err(e),
            // Queue dropped while waiting; treat as displacement.
            Err(_) => Err(Error::QueueFull {
                waiting: self.config.max_waiting,
                in_flight: self.config.max_in_flight,
            }),
        }
    }

    /// Current waiter count, for observability.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .waiting
            .len()
    }

    /// Current in-flight count, for observability.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .in_flight
    }
}

/// RAII admission slot; dropping it admits the head waiter.
pub struct QueuePermit {
    inner: Arc<Mutex<Inner>>,
}

impl Drop for QueuePermit {
    fn drop(&mut self) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Hand the slot to the head waiter; in-flight count is unchanged
        // in that case. A waiter whose receiver vanished (cancelled
        // future) forfeits the slot to the next in line.
        loop {
            if inner.waiting.is_empty() {
                inner.in_flight = inner.in_flight.saturating_sub(1);
                return;
            }
            let waiter = inner.waiting.remove(0);
            if waiter.tx.send(Ok(())).is_ok() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(max_in_flight: usize, max_waiting: usize, drop_lowest: bool) -> PriorityQueue {
        PriorityQueue::new(QueueConfig {
            max_in_flight,
            max_waiting,
            drop_lowest,
        })
    }

    #[tokio::test]
    async fn admits_up_to_capacity() {
        let q = queue(2, 4, true);
        let _a = q.acquire(Priority::Medium).await.unwrap();
        let _b = q.acquire(Priority::Medium).await.unwrap();
        assert_eq!(q.in_flight(), 2);
        assert_eq!(q.waiting(), 0);
    }

    #[tokio::test]
    async fn release_admits_head_waiter() {
        let q = Arc::new(queue(1, 4, true));
        let first = q.acquire(Priority::Medium).await.unwrap();

        let q2 = Arc::clone(&q);
        let waiter = tokio::spawn(async move { q2.acquire(Priority::High).await });
        tokio::task::yield_now().await;
        assert_eq!(q.waiting(), 1);

        drop(first);
        let permit = waiter.await.unwrap();
        assert!(permit.is_ok());
        assert_eq!(q.in_flight(), 1);
    }

    #[tokio::test]
    async fn higher_priority_served_first() {
        let q = Arc::new(queue(1, 8, true));
        let gate = q.acquire(Priority::Medium).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (priority, label) in [
            (Priority::Low, "low"),
            (Priority::Medium, "medium"),
            (Priority::High, "high"),
        ] {
            let q = Arc::clone(&q);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _permit = q.acquire(priority).await.unwrap();
                order.lock().unwrap().push(label);
            }));
            // Deterministic arrival order.
            tokio::task::yield_now().await;
        }

        drop(gate);
        for handle in handles {
            handle.await.unwrap();
        }
        let order = order.lock().unwrap();
        assert_eq!(*order, vec!["high", "medium", "low"]);
    }

    #[tokio::test]
    async fn fifo_within_priority() {
        let q = Arc::new(queue(1, 8, true));
        let gate = q.acquire(Priority::Medium).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for label in ["first", "second", "third"] {
            let q = Arc::clone(&q);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _permit = q.acquire(Priority::Medium).await.unwrap();
                order.lock().unwrap().push(label);
            }));
            tokio::task::yield_now().await;
        }

        drop(gate);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn full_queue_rejects_when_not_displacing() {
        let q = queue(1, 1, false);
        let _gate = q.acquire(Priority::Medium).await.unwrap();
        let q = Arc::new(q);

        let q2 = Arc::clone(&q);
        let _waiter = tokio::spawn(async move { q2.acquire(Priority::Low).await });
        tokio::task::yield_now().await;

        let result = q.acquire(Priority::High).await;
        // drop_lowest disabled: even high priority is rejected.
        assert!(matches!(result, Err(Error::QueueFull { .. })));
    }

    #[tokio::test]
    async fn drop_lowest_displaces_strictly_lower_waiter() {
        let q = Arc::new(queue(1, 1, true));
        let gate = q.acquire(Priority::Medium).await.unwrap();

        let q2 = Arc::clone(&q);
        let low = tokio::spawn(async move { q2.acquire(Priority::Low).await });
        tokio::task::yield_now().await;
        assert_eq!(q.waiting(), 1);

        let q3 = Arc::clone(&q);
        let high = tokio::spawn(async move { q3.acquire(Priority::High).await });
        tokio::task::yield_now().await;

        // The low waiter was rejected synchronously at displacement.
        let low_result = low.await.unwrap();
        assert!(matches!(low_result, Err(Error::QueueFull { .. })));

        drop(gate);
        assert!(high.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn equal_priority_does_not_displace() {
        let q = Arc::new(queue(1, 1, true));
        let _gate = q.acquire(Priority::Medium).await.unwrap();

        let q2 = Arc::clone(&q);
        let _waiter = tokio::spawn(async move { q2.acquire(Priority::Medium).await });
        tokio::task::yield_now().await;

        let result = q.acquire(Priority::Medium).await;
        assert!(matches!(result, Err(Error::QueueFull { .. })));
    }
}
