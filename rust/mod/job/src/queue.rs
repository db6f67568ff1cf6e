use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use vidforge_core::new_id;

/// A unit of deliverable work referencing a stored job.
#[derive(Debug, Clone)]
pub struct TaskMessage {
    pub task_id: String,
    pub job_id: String,
    /// Delivery attempt, starting at 1. Incremented on every redelivery,
    /// whether from an explicit nack or an expired lease.
    pub attempt: u32,
    pub enqueued_at: Instant,
}

/// A claimed message. The holder must `ack` or `nack` it; if neither
/// happens before the visibility timeout, the message is redelivered.
#[derive(Debug)]
pub struct Lease {
    pub msg: TaskMessage,
    token: u64,
}

struct LeasedEntry {
    msg: TaskMessage,
    deadline: Instant,
    token: u64,
}

struct Inner {
    ready: VecDeque<TaskMessage>,
    delayed: Vec<(Instant, TaskMessage)>,
    leased: HashMap<String, LeasedEntry>,
    next_token: u64,
}

/// Queue depth snapshot for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct QueueDepth {
    pub ready: usize,
    pub delayed: usize,
    pub leased: usize,
}

/// In-process task queue with at-least-once delivery.
///
/// Messages move ready -> leased on dequeue and leave the queue on ack.
/// A nack parks the message in the delayed set until its backoff due
/// time; an expired lease silently re-readies the message. Durability
/// across restarts comes from the job store, not from here: on startup
/// the engine rebuilds the queue from persisted non-terminal jobs.
pub struct TaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    visibility: Duration,
}

impl TaskQueue {
    pub fn new(visibility: Duration) -> Self {
        TaskQueue {
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                delayed: Vec::new(),
                leased: HashMap::new(),
                next_token: 0,
            }),
            notify: Notify::new(),
            visibility,
        }
    }

    /// Enqueue work for a job, optionally after a delay. Returns the
    /// task ID assigned to the message.
    pub fn enqueue(&self, job_id: &str, delay: Option<Duration>) -> String {
        let task_id = new_id();
        let msg = TaskMessage {
            task_id: task_id.clone(),
            job_id: job_id.to_string(),
            attempt: 1,
            enqueued_at: Instant::now(),
        };
        {
            let mut inner = self.lock();
            match delay {
                Some(d) if !d.is_zero() => inner.delayed.push((Instant::now() + d, msg)),
                _ => inner.ready.push_back(msg),
            }
        }
        self.notify.notify_one();
        task_id
    }

    /// Wait for the next deliverable message and lease it.
    pub async fn dequeue(&self) -> Lease {
        loop {
            // The notified future must exist before the state check, or a
            // concurrent enqueue between check and await would be lost.
            let notified = self.notify.notified();

            let (lease, next_due) = {
                let mut inner = self.lock();
                let now = Instant::now();
                self.promote_due(&mut inner, now);

                if let Some(msg) = inner.ready.pop_front() {
                    let token = inner.next_token;
                    inner.next_token += 1;
                    inner.leased.insert(
                        msg.task_id.clone(),
                        LeasedEntry { msg: msg.clone(), deadline: now + self.visibility, token },
                    );
                    (Some(Lease { msg, token }), None)
                } else {
                    let next = inner
                        .delayed
                        .iter()
                        .map(|(due, _)| *due)
                        .chain(inner.leased.values().map(|e| e.deadline))
                        .min();
                    (None, next)
                }
            };

            if let Some(lease) = lease {
                return lease;
            }

            match next_due {
                Some(when) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(when) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Remove a leased message from the queue. Returns `false` if the
    /// lease had already expired and the message was redelivered.
    pub fn ack(&self, lease: &Lease) -> bool {
        let mut inner = self.lock();
        let held = inner.leased.get(&lease.msg.task_id).map(|e| e.token) == Some(lease.token);
        if held {
            inner.leased.remove(&lease.msg.task_id);
        }
        held
    }

    /// Return a leased message to the queue after a delay, bumping its
    /// attempt count. Returns `false` if the lease had already expired.
    pub fn nack(&self, lease: &Lease, delay: Duration) -> bool {
        let released = {
            let mut inner = self.lock();
            let held = inner.leased.get(&lease.msg.task_id).map(|e| e.token) == Some(lease.token);
            if held {
                if let Some(mut entry) = inner.leased.remove(&lease.msg.task_id) {
                    entry.msg.attempt += 1;
                    if delay.is_zero() {
                        inner.ready.push_back(entry.msg);
                    } else {
                        inner.delayed.push((Instant::now() + delay, entry.msg));
                    }
                }
            }
            held
        };
        if released {
            self.notify.notify_one();
        }
        released
    }

    pub fn depth(&self) -> QueueDepth {
        let inner = self.lock();
        QueueDepth {
            ready: inner.ready.len(),
            delayed: inner.delayed.len(),
            leased: inner.leased.len(),
        }
    }

    /// Move due delayed messages and expired leases back to ready.
    fn promote_due(&self, inner: &mut Inner, now: Instant) {
        let mut i = 0;
        while i < inner.delayed.len() {
            if inner.delayed[i].0 <= now {
                let (_, msg) = inner.delayed.swap_remove(i);
                inner.ready.push_back(msg);
            } else {
                i += 1;
            }
        }

        let expired: Vec<String> = inner
            .leased
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in expired {
            if let Some(mut entry) = inner.leased.remove(&task_id) {
                warn!(
                    task_id = %task_id,
                    job_id = %entry.msg.job_id,
                    age_secs = entry.msg.enqueued_at.elapsed().as_secs(),
                    "lease expired, redelivering"
                );
                entry.msg.attempt += 1;
                inner.ready.push_back(entry.msg);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue(visibility_secs: u64) -> TaskQueue {
        TaskQueue::new(Duration::from_secs(visibility_secs))
    }

    #[tokio::test(start_paused = true)]
    async fn fifo_delivery() {
        let q = queue(60);
        q.enqueue("job-a", None);
        q.enqueue("job-b", None);

        let first = q.dequeue().await;
        let second = q.dequeue().await;
        assert_eq!(first.msg.job_id, "job-a");
        assert_eq!(second.msg.job_id, "job-b");
        assert_eq!(first.msg.attempt, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_message_waits_for_due_time() {
        let q = queue(60);
        q.enqueue("job-a", Some(Duration::from_secs(5)));

        let start = Instant::now();
        let lease = q.dequeue().await;
        assert_eq!(lease.msg.job_id, "job-a");
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(lease.msg.enqueued_at.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn ack_removes_message() {
        let q = queue(60);
        q.enqueue("job-a", None);

        let lease = q.dequeue().await;
        assert!(q.ack(&lease));

        let depth = q.depth();
        assert_eq!(depth.ready, 0);
        assert_eq!(depth.leased, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn nack_redelivers_with_bumped_attempt() {
        let q = queue(60);
        q.enqueue("job-a", None);

        let lease = q.dequeue().await;
        assert!(q.nack(&lease, Duration::from_secs(2)));

        let again = q.dequeue().await;
        assert_eq!(again.msg.job_id, "job-a");
        assert_eq!(again.msg.attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_redelivered() {
        let q = queue(3);
        q.enqueue("job-a", None);

        let lease = q.dequeue().await;
        tokio::time::sleep(Duration::from_secs(4)).await;

        let again = q.dequeue().await;
        assert_eq!(again.msg.task_id, lease.msg.task_id);
        assert_eq!(again.msg.attempt, 2);

        // The stale lease can no longer ack or nack the message.
        assert!(!q.ack(&lease));
        assert!(!q.nack(&lease, Duration::ZERO));
        assert!(q.ack(&again));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_consumers_get_distinct_messages() {
        let q = Arc::new(queue(60));
        q.enqueue("job-a", None);
        q.enqueue("job-b", None);

        let q1 = q.clone();
        let q2 = q.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { q1.dequeue().await }),
            tokio::spawn(async move { q2.dequeue().await }),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.msg.job_id, b.msg.job_id);
    }
}
