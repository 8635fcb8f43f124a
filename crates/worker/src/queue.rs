//! Job queue with late acknowledgement.
//!
//! A dequeued job stays in flight until the worker acks it, requeues it for
//! a retry, or hands it back after a crash. Nothing is dropped between
//! dequeue and settlement, so delivery is at-least-once.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pipeline_core::{Error, Job, Result};
use telemetry::metrics;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// A job handed to a worker, tagged for settlement.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: u64,
    pub job: Job,
    /// Set when the job is being delivered again after a crashed attempt
    pub redelivered: bool,
}

/// Queue operations needed by the executor.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<()>;

    /// Waits for the next ready job; `None` once the queue is closed.
    async fn dequeue(&self) -> Option<Delivery>;

    /// Settles a delivery for good.
    async fn ack(&self, delivery_id: u64) -> Result<()>;

    /// Settles a delivery and schedules `job` again after `delay`.
    async fn requeue_after(&self, delivery_id: u64, job: Job, delay: Duration) -> Result<()>;

    /// Returns an unsettled delivery to the front of the queue.
    async fn redeliver(&self, delivery_id: u64, job: Job) -> Result<()>;

    /// Stops handing out jobs; waiting consumers receive `None`.
    fn close(&self);

    /// Jobs ready or waiting for a retry, excluding in-flight ones.
    fn depth(&self) -> usize;

    fn in_flight(&self) -> usize;
}

struct Scheduled {
    due: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so the max-heap pops the earliest due time first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(Job, bool)>,
    delayed: BinaryHeap<Scheduled>,
    in_flight: HashMap<u64, Job>,
    next_id: u64,
    closed: bool,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|s| s.due <= now) {
            if let Some(scheduled) = self.delayed.pop() {
                self.ready.push_back((scheduled.job, false));
            }
        }
    }

    fn depth(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    fn settle(&mut self, delivery_id: u64) -> Result<Job> {
        self.in_flight
            .remove(&delivery_id)
            .ok_or_else(|| Error::queue(format!("unknown delivery {}", delivery_id)))
    }
}

/// In-process queue backed by a ready list and a delay heap.
#[derive(Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn publish_depth(&self, state: &QueueState) {
        metrics().queue_depth.set(state.depth() as u64);
        metrics().in_flight_jobs.set(state.in_flight.len() as u64);
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::queue("queue is closed"));
            }
            state.ready.push_back((job, false));
            self.publish_depth(&state);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Option<Delivery> {
        loop {
            // Registered before inspecting state so a concurrent notify is not lost.
            let notified = self.notify.notified();

            let next_due = {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                state.promote_due(Instant::now());

                if let Some((job, redelivered)) = state.ready.pop_front() {
                    state.next_id += 1;
                    let delivery_id = state.next_id;
                    state.in_flight.insert(delivery_id, job.clone());
                    self.publish_depth(&state);
                    debug!(job_id = %job.id, delivery_id = delivery_id, "Dequeued job");
                    return Some(Delivery {
                        delivery_id,
                        job,
                        redelivered,
                    });
                }
                state.delayed.peek().map(|s| s.due)
            };

            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(due) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, delivery_id: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.settle(delivery_id)?;
        self.publish_depth(&state);
        Ok(())
    }

    async fn requeue_after(&self, delivery_id: u64, job: Job, delay: Duration) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.settle(delivery_id)?;
            state.next_id += 1;
            let seq = state.next_id;
            state.delayed.push(Scheduled {
                due: Instant::now() + delay,
                seq,
                job,
            });
            self.publish_depth(&state);
        }
        // Wake a sleeper so it can recompute its deadline.
        self.notify.notify_one();
        Ok(())
    }

    async fn redeliver(&self, delivery_id: u64, job: Job) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.settle(delivery_id)?;
            state.ready.push_front((job, true));
            self.publish_depth(&state);
        }
        self.notify.notify_one();
        Ok(())
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    fn depth(&self) -> usize {
        self.state.lock().depth()
    }

    fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}
