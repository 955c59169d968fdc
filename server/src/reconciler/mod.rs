//! The convergence loop. Each `(service, environment)` key owns one view
//! of desired versus observed state; passes for one key are serialised
//! while keys reconcile in parallel. All errors stay local to the pass —
//! logged, surfaced on the deployment row, never fatal to the loop.

mod pass;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifacts::Signer;
use crate::orchestrator::{labels, Orchestrator};
use crate::persistence::{Change, Persistence};

pub(crate) type Key = (Uuid, Uuid);

#[derive(Clone, Copy, Debug)]
pub struct Settings {
    pub workers: usize,
    pub resync: Duration,
    pub stabilise: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 8,
            resync: Duration::from_secs(60),
            stabilise: Duration::from_secs(120),
        }
    }
}

/// A coalescing keyed queue: enqueues of a pending key fold into one
/// item, and enqueues of a busy key set a rescan bit so the key runs
/// exactly once more after its current pass.
struct KeyedQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Key>,
    pending_set: HashSet<Key>,
    busy: HashSet<Key>,
    rescan: HashSet<Key>,
}

impl KeyedQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn enqueue(&self, key: Key) {
        let mut state = self.state.lock().unwrap();
        if state.busy.contains(&key) {
            state.rescan.insert(key);
            return;
        }
        if state.pending_set.insert(key) {
            state.pending.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Next pending key whose passes are not already running; marks it busy.
    async fn next(&self) -> Key {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(key) = state.pending.pop_front() {
                    state.pending_set.remove(&key);
                    state.busy.insert(key);
                    return key;
                }
            }
            self.notify.notified().await;
        }
    }

    fn done(&self, key: Key) {
        let mut state = self.state.lock().unwrap();
        state.busy.remove(&key);
        if state.rescan.remove(&key) && state.pending_set.insert(key) {
            state.pending.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }
}

pub struct Reconciler {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) persistence: Persistence,
    pub(crate) orchestrator: Arc<dyn Orchestrator>,
    pub(crate) signer: Arc<Signer>,
    pub(crate) settings: Settings,
    queue: KeyedQueue,
}

impl Reconciler {
    pub fn new(
        persistence: Persistence,
        orchestrator: Arc<dyn Orchestrator>,
        signer: Arc<Signer>,
        settings: Settings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                persistence,
                orchestrator,
                signer,
                settings,
                queue: KeyedQueue::new(),
            }),
        }
    }

    /// Start workers and the three input feeds: the store's change
    /// stream, orchestrator events, and the periodic resync tick.
    pub fn spawn(&self) {
        for worker in 0..self.inner.settings.workers.max(1) {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                debug!(worker, "reconcile worker started");
                loop {
                    let key = inner.queue.next().await;
                    if let Err(err) = pass::reconcile(&inner, key).await {
                        // Local by design: the row carries the failure,
                        // the loop moves on.
                        error!(error = %err, ?key, "reconcile pass failed");
                    }
                    inner.queue.done(key);
                }
            });
        }

        self.spawn_change_feed();
        self.spawn_orchestrator_feed();
        self.spawn_resync();
    }

    /// Schedule a pass for a key soon; used by passes that are waiting on
    /// external progress.
    pub(crate) fn requeue_after(inner: &Arc<Inner>, key: Key, delay: Duration) {
        let inner = inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.queue.enqueue(key);
        });
    }

    fn spawn_change_feed(&self) {
        let inner = self.inner.clone();
        let mut changes = inner.persistence.subscribe();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(Change::DeploymentStatusChanged {
                        service_id,
                        environment_id,
                        ..
                    }) => inner.queue.enqueue((service_id, environment_id)),
                    Ok(Change::ReleaseReady { release_id, .. })
                    | Ok(Change::ReleaseFailed { release_id, .. }) => {
                        match inner.persistence.keys_for_release(release_id).await {
                            Ok(keys) => {
                                for key in keys {
                                    inner.queue.enqueue(key);
                                }
                            }
                            Err(err) => warn!(error = %err, "failed to map release to keys"),
                        }
                    }
                    Ok(Change::EnvironmentDraining { environment_id }) => {
                        match inner.persistence.reconcile_keys().await {
                            Ok(keys) => {
                                for key in keys {
                                    if key.1 == environment_id {
                                        inner.queue.enqueue(key);
                                    }
                                }
                            }
                            Err(err) => warn!(error = %err, "failed to enumerate draining keys"),
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "reconciler lagged; resync will catch up");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_orchestrator_feed(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut events = match inner.orchestrator.events().await {
                Ok(events) => events,
                Err(err) => {
                    warn!(error = %err, "orchestrator event feed unavailable; relying on resync");
                    return;
                }
            };

            while let Some(event) = events.next().await {
                let service = event
                    .labels
                    .get(labels::SERVICE)
                    .and_then(|raw| raw.parse().ok());
                let environment = event
                    .labels
                    .get(labels::ENVIRONMENT)
                    .and_then(|raw| raw.parse().ok());
                if let (Some(service), Some(environment)) = (service, environment) {
                    inner.queue.enqueue((service, environment));
                }
            }
        });
    }

    fn spawn_resync(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(inner.settings.resync);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match inner.persistence.reconcile_keys().await {
                    Ok(keys) => {
                        if !keys.is_empty() {
                            info!(count = keys.len(), "resync tick");
                        }
                        for key in keys {
                            inner.queue.enqueue(key);
                        }
                    }
                    Err(err) => warn!(error = %err, "resync enumeration failed"),
                }
            }
        });
    }

    /// Run a single pass for a key, inline. Test seam.
    #[cfg(test)]
    pub(crate) async fn reconcile_once(&self, key: Key) -> crate::Result<()> {
        pass::reconcile(&self.inner, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_coalesces_duplicates() {
        let queue = KeyedQueue::new();
        let key = (Uuid::new_v4(), Uuid::new_v4());

        queue.enqueue(key);
        queue.enqueue(key);
        queue.enqueue(key);
        assert_eq!(queue.pending_len(), 1);
    }

    #[tokio::test]
    async fn busy_keys_fold_into_a_single_rescan() {
        let queue = KeyedQueue::new();
        let key = (Uuid::new_v4(), Uuid::new_v4());

        queue.enqueue(key);
        let taken = queue.next().await;
        assert_eq!(taken, key);

        // Enqueues while the pass runs fold to one rescan.
        queue.enqueue(key);
        queue.enqueue(key);
        assert_eq!(queue.pending_len(), 0);

        queue.done(key);
        assert_eq!(queue.pending_len(), 1);
        let again = queue.next().await;
        assert_eq!(again, key);
        queue.done(key);
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_are_independent() {
        let queue = KeyedQueue::new();
        let a = (Uuid::new_v4(), Uuid::new_v4());
        let b = (Uuid::new_v4(), Uuid::new_v4());

        queue.enqueue(a);
        queue.enqueue(b);
        assert_eq!(queue.pending_len(), 2);

        let first = queue.next().await;
        let second = queue.next().await;
        assert_ne!(first, second);
    }
}
