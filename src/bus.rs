//! Notification bus
//!
//! A minimal publish/subscribe mechanism the scheduler and download queue
//! use to broadcast state changes without coupling to their observers.
//! Subscriptions are per subject (a task id or a job id); publishing is
//! synchronous and hands every listener a reference to a cloned snapshot,
//! never a live reference into scheduler-owned state, so observers cannot
//! corrupt it.
//!
//! Delivery is at-least-once per state change within the process; there is
//! no cross-process delivery and no replay for late subscribers.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};

use crate::types::{BatchTask, DownloadJobUpdate, JobId, TaskId};

/// Callback invoked with a task snapshot
pub type TaskListener = dyn Fn(&BatchTask) + Send + Sync;

/// Callback invoked with a download-job snapshot
pub type JobListener = dyn Fn(&DownloadJobUpdate) + Send + Sync;

/// Generic per-subject subscriber registry
///
/// One instance per snapshot type; the bus owns one for tasks and one for
/// download jobs. The registry itself is behind a std Mutex because
/// publishing must stay synchronous (no awaits while delivering).
struct SubscriberSet<K, T: ?Sized> {
    next_token: u64,
    listeners: HashMap<K, Vec<(u64, Arc<T>)>>,
}

impl<K: Eq + Hash + Copy, T: ?Sized> SubscriberSet<K, T> {
    fn new() -> Self {
        Self {
            next_token: 0,
            listeners: HashMap::new(),
        }
    }

    fn insert(&mut self, subject: K, listener: Arc<T>) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        self.listeners
            .entry(subject)
            .or_default()
            .push((token, listener));
        token
    }

    fn remove(&mut self, subject: K, token: u64) {
        if let Some(entries) = self.listeners.get_mut(&subject) {
            entries.retain(|(t, _)| *t != token);
            if entries.is_empty() {
                self.listeners.remove(&subject);
            }
        }
    }

    /// Snapshot the listener list for a subject so callbacks run without
    /// holding the registry lock (a callback may subscribe or unsubscribe).
    fn listeners_for(&self, subject: K) -> Vec<Arc<T>> {
        self.listeners
            .get(&subject)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    fn subscriber_count(&self, subject: K) -> usize {
        self.listeners.get(&subject).map_or(0, Vec::len)
    }
}

struct BusInner {
    task_subs: Mutex<SubscriberSet<TaskId, TaskListener>>,
    job_subs: Mutex<SubscriberSet<JobId, JobListener>>,
}

/// Publish/subscribe hub for task and download-job state changes
///
/// Cloning shares the subscriber registries.
///
/// # Examples
///
/// ```
/// use imagegen_batch::bus::NotificationBus;
/// use imagegen_batch::types::TaskId;
///
/// let bus = NotificationBus::new();
/// let _sub = bus.subscribe_task(TaskId::new(1), |task| {
///     println!("task {} is now {:?}", task.id, task.status);
/// });
/// // dropping `_sub` unsubscribes
/// ```
#[derive(Clone)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus {
    /// Create a new bus with no subscribers
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                task_subs: Mutex::new(SubscriberSet::new()),
                job_subs: Mutex::new(SubscriberSet::new()),
            }),
        }
    }

    /// Subscribe to state changes of one task
    ///
    /// The listener receives a snapshot of the aggregate after every state
    /// change. Dropping the returned [`Subscription`] unsubscribes.
    pub fn subscribe_task<F>(&self, task_id: TaskId, listener: F) -> Subscription
    where
        F: Fn(&BatchTask) + Send + Sync + 'static,
    {
        let token = match self.inner.task_subs.lock() {
            Ok(mut subs) => subs.insert(task_id, Arc::new(listener)),
            Err(poisoned) => poisoned.into_inner().insert(task_id, Arc::new(listener)),
        };
        Subscription {
            bus: Arc::downgrade(&self.inner),
            subject: Subject::Task(task_id),
            token,
        }
    }

    /// Subscribe to progress and completion of one download job
    pub fn subscribe_job<F>(&self, job_id: JobId, listener: F) -> Subscription
    where
        F: Fn(&DownloadJobUpdate) + Send + Sync + 'static,
    {
        let token = match self.inner.job_subs.lock() {
            Ok(mut subs) => subs.insert(job_id, Arc::new(listener)),
            Err(poisoned) => poisoned.into_inner().insert(job_id, Arc::new(listener)),
        };
        Subscription {
            bus: Arc::downgrade(&self.inner),
            subject: Subject::Job(job_id),
            token,
        }
    }

    /// Publish a task snapshot to its subscribers
    ///
    /// The caller passes an already-cloned snapshot; listeners receive a
    /// shared reference to it and run synchronously on the publishing thread.
    pub fn publish_task(&self, snapshot: &BatchTask) {
        let listeners = match self.inner.task_subs.lock() {
            Ok(subs) => subs.listeners_for(snapshot.id),
            Err(poisoned) => poisoned.into_inner().listeners_for(snapshot.id),
        };
        for listener in listeners {
            listener(snapshot);
        }
    }

    /// Publish a download-job snapshot to its subscribers
    pub fn publish_job(&self, update: &DownloadJobUpdate) {
        let listeners = match self.inner.job_subs.lock() {
            Ok(subs) => subs.listeners_for(update.job_id),
            Err(poisoned) => poisoned.into_inner().listeners_for(update.job_id),
        };
        for listener in listeners {
            listener(update);
        }
    }

    /// Number of listeners registered for a task
    pub fn task_subscriber_count(&self, task_id: TaskId) -> usize {
        match self.inner.task_subs.lock() {
            Ok(subs) => subs.subscriber_count(task_id),
            Err(poisoned) => poisoned.into_inner().subscriber_count(task_id),
        }
    }
}

enum Subject {
    Task(TaskId),
    Job(JobId),
}

/// Guard for an active subscription; dropping it unsubscribes
#[must_use = "dropping the subscription immediately unsubscribes the listener"]
pub struct Subscription {
    bus: Weak<BusInner>,
    subject: Subject,
    token: u64,
}

impl Subscription {
    /// Explicitly unsubscribe (equivalent to dropping)
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.bus.upgrade() else {
            return;
        };
        match self.subject {
            Subject::Task(id) => {
                let mut subs = match inner.task_subs.lock() {
                    Ok(subs) => subs,
                    Err(poisoned) => poisoned.into_inner(),
                };
                subs.remove(id, self.token);
            }
            Subject::Job(id) => {
                let mut subs = match inner.job_subs.lock() {
                    Ok(subs) => subs,
                    Err(poisoned) => poisoned.into_inner(),
                };
                subs.remove(id, self.token);
            }
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BatchTaskConfig, JobStatus, TaskKind, TaskStatus};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn snapshot(id: i64) -> BatchTask {
        BatchTask {
            id: TaskId::new(id),
            name: "bus-test".to_string(),
            kind: TaskKind::TextToImage,
            status: TaskStatus::Processing,
            progress: 50,
            total_items: 2,
            completed_items: 1,
            failed_items: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            config: BatchTaskConfig::default(),
            items: vec![],
            results: vec![],
            error: None,
        }
    }

    #[test]
    fn publish_reaches_only_matching_subject() {
        let bus = NotificationBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_a = hits.clone();
        let _sub_a = bus.subscribe_task(TaskId::new(1), move |_| {
            hits_a.fetch_add(1, Ordering::SeqCst);
        });
        let _sub_b = bus.subscribe_task(TaskId::new(2), |_| {
            panic!("subscriber for task 2 must not see task 1 updates");
        });

        bus.publish_task(&snapshot(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus = NotificationBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = hits.clone();
        let sub = bus.subscribe_task(TaskId::new(1), move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish_task(&snapshot(1));
        drop(sub);
        bus.publish_task(&snapshot(1));

        assert_eq!(
            hits.load(Ordering::SeqCst),
            1,
            "no delivery after unsubscribe"
        );
        assert_eq!(bus.task_subscriber_count(TaskId::new(1)), 0);
    }

    #[test]
    fn multiple_subscribers_all_receive() {
        let bus = NotificationBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let subs: Vec<_> = (0..3)
            .map(|_| {
                let hits = hits.clone();
                bus.subscribe_task(TaskId::new(7), move |task| {
                    assert_eq!(task.progress, 50, "listener sees the snapshot");
                    hits.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        bus.publish_task(&snapshot(7));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        drop(subs);
    }

    #[test]
    fn job_updates_are_delivered() {
        let bus = NotificationBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = hits.clone();
        let _sub = bus.subscribe_job(JobId::new(5), move |update| {
            assert!(update.fraction >= 0.5);
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish_job(&DownloadJobUpdate {
            job_id: JobId::new(5),
            status: JobStatus::Fetching,
            fraction: 0.5,
            bytes_per_sec: 1024,
            error: None,
            local_path: None,
        });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_unsubscribe_during_publish() {
        // Delivery snapshots the listener list first, so a callback that
        // drops another subscription must not deadlock or skip delivery.
        let bus = NotificationBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let held: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let hits_a = hits.clone();
        let held_clone = held.clone();
        let sub_a = bus.subscribe_task(TaskId::new(1), move |_| {
            hits_a.fetch_add(1, Ordering::SeqCst);
            // drop the other subscription from inside a callback
            held_clone.lock().unwrap().take();
        });

        let hits_b = hits.clone();
        let sub_b = bus.subscribe_task(TaskId::new(1), move |_| {
            hits_b.fetch_add(1, Ordering::SeqCst);
        });
        *held.lock().unwrap() = Some(sub_b);

        bus.publish_task(&snapshot(1));
        assert_eq!(hits.load(Ordering::SeqCst), 2, "both ran this round");

        bus.publish_task(&snapshot(1));
        assert_eq!(hits.load(Ordering::SeqCst), 3, "only sub_a remains");
        drop(sub_a);
    }
}
