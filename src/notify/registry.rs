//! Process-wide registry of per-path change queues.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Default number of notifications a queue retains per subscriber.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

struct NotifierInner {
    queues: RwLock<HashMap<PathBuf, ChangeQueue>>,
    capacity: usize,
}

/// Registry mapping an absolute file path to its change queue.
///
/// Created once at startup and passed by handle to the config store and to
/// every connection pool; clones share the same registry. There is at most one
/// queue per path, and queues are never removed.
///
/// Publishing never blocks. Each queue keeps the last `capacity`
/// notifications per subscriber; a subscriber that falls further behind loses
/// the oldest ones (drop-oldest) and still observes that a change happened.
///
/// # Examples
///
/// ```rust
/// use hotswap_conn::notify::ChangeNotifier;
///
/// # async fn example() {
/// let notifier = ChangeNotifier::new();
/// let mut subscription = notifier.register("/etc/app/db.yaml").subscribe();
///
/// notifier.publish("/etc/app/db.yaml");
/// assert!(subscription.recv().await.is_some());
/// # }
/// ```
#[derive(Clone)]
pub struct ChangeNotifier {
    inner: Arc<NotifierInner>,
}

impl ChangeNotifier {
    /// Create a registry with the default queue capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a registry whose queues retain `capacity` notifications.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                queues: RwLock::new(HashMap::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Return the queue for `path`, creating it if absent.
    ///
    /// Idempotent and safe to call concurrently: every caller for the same path
    /// gets the same queue.
    pub fn register(&self, path: impl AsRef<Path>) -> ChangeQueue {
        let path = path.as_ref();
        if let Some(queue) = self.inner.queues.read().get(path) {
            return queue.clone();
        }

        let mut queues = self.inner.queues.write();
        queues
            .entry(path.to_path_buf())
            .or_insert_with(|| {
                tracing::debug!(path = %path.display(), "Registered change queue");
                ChangeQueue::new(path.to_path_buf(), self.inner.capacity)
            })
            .clone()
    }

    /// Enqueue a change for `path`.
    ///
    /// A path nobody registered, or a queue without subscribers, drops the
    /// notification.
    pub fn publish(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let queue = self.inner.queues.read().get(path).cloned();
        match queue {
            Some(queue) => queue.publish(),
            None => tracing::trace!(path = %path.display(), "No change queue registered"),
        }
    }

    /// Whether a queue exists for `path`.
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.inner.queues.read().contains_key(path.as_ref())
    }

    /// All registered paths.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.inner.queues.read().keys().cloned().collect()
    }

    /// Number of registered queues.
    pub fn len(&self) -> usize {
        self.inner.queues.read().len()
    }

    /// Whether no queue has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// The bounded change queue of one path.
#[derive(Clone)]
pub struct ChangeQueue {
    path: Arc<PathBuf>,
    tx: broadcast::Sender<PathBuf>,
}

impl ChangeQueue {
    fn new(path: PathBuf, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            path: Arc::new(path),
            tx,
        }
    }

    /// The path this queue carries changes for.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start receiving changes published from now on.
    pub fn subscribe(&self) -> ChangeSubscription {
        ChangeSubscription {
            path: Arc::clone(&self.path),
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn publish(&self) {
        match self.tx.send((*self.path).clone()) {
            Ok(receivers) => {
                tracing::debug!(path = %self.path.display(), receivers, "Published change")
            }
            Err(_) => tracing::trace!(path = %self.path.display(), "Change had no subscribers"),
        }
    }
}

/// A subscriber's view of a [`ChangeQueue`].
pub struct ChangeSubscription {
    path: Arc<PathBuf>,
    rx: broadcast::Receiver<PathBuf>,
}

impl ChangeSubscription {
    /// Wait for the next change, in publish order.
    ///
    /// Returns `None` once the registry holding the queue is gone.
    pub async fn recv(&mut self) -> Option<PathBuf> {
        loop {
            match self.rx.recv().await {
                Ok(path) => return Some(path),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        skipped,
                        "Change subscriber lagged, dropped oldest notifications"
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// The path this subscription listens on.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
