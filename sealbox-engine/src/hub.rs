//! Broadcast hub
//!
//! Fans coordinator updates out to every registered listener, one per
//! observing instance. A listener that errors or does not answer within the
//! listener timeout is treated as gone and deregistered.
//!
//! The hub also collects two kinds of work items from coordinator updates:
//! uploads waiting for the add-file command and finished downloads to open.
//! `consume_*` hands each item to exactly one caller.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use sealbox_common::{
    ContentReady, CoordinatorUpdate, Direction, HubEvent, JobKey, PendingCommand, TransferProgress,
};

use crate::constants::LISTENER_CHANNEL_SIZE;

/// Returned by a listener whose instance went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("listener closed")]
pub struct ListenerClosed;

/// Receiver of hub broadcasts
#[async_trait]
pub trait HubListener: Send + Sync {
    async fn on_progress(&self, progress: &TransferProgress) -> Result<(), ListenerClosed>;
    async fn on_list_changed(&self, direction: Direction) -> Result<(), ListenerClosed>;
}

/// Listener forwarding events into a bounded channel
///
/// A full channel applies back-pressure; a consumer that stops draining it is
/// evicted by the hub's timeout.
pub struct ChannelListener {
    tx: mpsc::Sender<HubEvent>,
}

impl ChannelListener {
    pub fn new(tx: mpsc::Sender<HubEvent>) -> Self {
        Self { tx }
    }

    /// Listener plus the receiving end of its channel
    pub fn channel() -> (Self, mpsc::Receiver<HubEvent>) {
        let (tx, rx) = mpsc::channel(LISTENER_CHANNEL_SIZE);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl HubListener for ChannelListener {
    async fn on_progress(&self, progress: &TransferProgress) -> Result<(), ListenerClosed> {
        self.tx
            .send(HubEvent::Progress {
                progress: progress.clone(),
            })
            .await
            .map_err(|_| ListenerClosed)
    }

    async fn on_list_changed(&self, direction: Direction) -> Result<(), ListenerClosed> {
        self.tx
            .send(HubEvent::ListChanged { direction })
            .await
            .map_err(|_| ListenerClosed)
    }
}

/// Identifier handed out on registration
pub type ListenerId = u64;

/// Add-file commands by job id
#[derive(Default)]
struct CommandQueue {
    /// Waiting for an actor
    available: BTreeMap<i64, PendingCommand>,
    /// Handed to an actor, outcome not reported yet
    in_flight: BTreeMap<i64, PendingCommand>,
}

struct HubInner {
    listeners: Mutex<HashMap<ListenerId, Arc<dyn HubListener>>>,
    next_id: AtomicU64,
    last_progress: Mutex<HashMap<JobKey, TransferProgress>>,
    commands: Mutex<CommandQueue>,
    ready: Mutex<Vec<ContentReady>>,
    timeout: Duration,
}

/// Lock a hub mutex, recovering the data if a holder panicked
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registry of listeners plus the pull-based work queues
///
/// Cloning is cheap; all clones share one registry.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    /// Create a hub evicting listeners slower than `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(HubInner {
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                last_progress: Mutex::new(HashMap::new()),
                commands: Mutex::new(CommandQueue::default()),
                ready: Mutex::new(Vec::new()),
                timeout,
            }),
        }
    }

    pub fn register(&self, listener: Arc<dyn HubListener>) -> ListenerId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.listeners).insert(id, listener);
        id
    }

    /// Register a channel listener and return its receiver
    pub fn subscribe(&self) -> (ListenerId, mpsc::Receiver<HubEvent>) {
        let (listener, rx) = ChannelListener::channel();
        (self.register(Arc::new(listener)), rx)
    }

    /// Returns true if the listener was registered
    pub fn unregister(&self, id: ListenerId) -> bool {
        lock(&self.inner.listeners).remove(&id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    /// Deliver a coordinator update
    ///
    /// Work items are queued first; then progress (unless identical to the last
    /// report for the job) and the list-changed flag go to every listener.
    pub async fn publish(&self, update: CoordinatorUpdate) {
        self.absorb_commands(update.commands_needed);
        if !update.ready.is_empty() {
            lock(&self.inner.ready).extend(update.ready);
        }

        if let Some(progress) = update.progress
            && self.is_new_progress(&progress)
        {
            self.broadcast(Event::Progress(&progress)).await;
        }
        if update.list_changed {
            self.broadcast(Event::ListChanged(update.direction)).await;
        }
    }

    fn absorb_commands(&self, commands: Vec<PendingCommand>) {
        if commands.is_empty() {
            return;
        }
        let mut queue = lock(&self.inner.commands);
        for command in commands {
            if !queue.in_flight.contains_key(&command.job_id) {
                queue.available.insert(command.job_id, command);
            }
        }
    }

    fn is_new_progress(&self, progress: &TransferProgress) -> bool {
        let mut last = lock(&self.inner.last_progress);
        if last.get(&progress.job) == Some(progress) {
            return false;
        }
        if progress.done {
            last.remove(&progress.job);
        } else {
            last.insert(progress.job.clone(), progress.clone());
        }
        true
    }

    async fn broadcast(&self, event: Event<'_>) {
        let listeners: Vec<(ListenerId, Arc<dyn HubListener>)> = lock(&self.inner.listeners)
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();
        if listeners.is_empty() {
            return;
        }

        let timeout = self.inner.timeout;
        let deliveries = listeners.iter().map(|(id, listener)| async move {
            let delivery = async {
                match event {
                    Event::Progress(progress) => listener.on_progress(progress).await,
                    Event::ListChanged(direction) => listener.on_list_changed(direction).await,
                }
            };
            let ok = matches!(tokio::time::timeout(timeout, delivery).await, Ok(Ok(())));
            (*id, ok)
        });

        let failed: Vec<ListenerId> = join_all(deliveries)
            .await
            .into_iter()
            .filter_map(|(id, ok)| (!ok).then_some(id))
            .collect();

        if !failed.is_empty() {
            let mut registry = lock(&self.inner.listeners);
            for id in failed {
                warn!(listener = id, "listener unresponsive, deregistering");
                registry.remove(&id);
            }
        }
    }

    /// Take every available add-file command
    ///
    /// Taken commands stay reserved until completed, released or discarded,
    /// so no other caller receives them.
    pub fn consume_commands(&self) -> Vec<PendingCommand> {
        let mut queue = lock(&self.inner.commands);
        let taken = std::mem::take(&mut queue.available);
        let commands: Vec<PendingCommand> = taken.values().cloned().collect();
        queue.in_flight.extend(taken);
        commands
    }

    /// Make a consumed command available again after a failed attempt
    pub fn release_command(&self, job_id: i64) {
        let mut queue = lock(&self.inner.commands);
        if let Some(command) = queue.in_flight.remove(&job_id) {
            queue.available.insert(job_id, command);
        }
    }

    /// Forget a command whose job no longer needs it
    pub fn complete_command(&self, job_id: i64) {
        let mut queue = lock(&self.inner.commands);
        queue.in_flight.remove(&job_id);
        if queue.available.remove(&job_id).is_some() {
            debug!(job_id, "command completed before it was consumed");
        }
    }

    /// Take every content-ready notice
    pub fn consume_ready(&self) -> Vec<ContentReady> {
        std::mem::take(&mut *lock(&self.inner.ready))
    }
}

#[derive(Clone, Copy)]
enum Event<'a> {
    Progress(&'a TransferProgress),
    ListChanged(Direction),
}
