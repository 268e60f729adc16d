//! File watching for configuration documents.

use crate::error::{ConfigError, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Watches configuration files and reports which of them were written.
///
/// The parent directory of each file is watched rather than the file itself,
/// so editors that save by writing a new file and renaming it over the old one
/// are still seen. Events for files that are not watched are ignored.
///
/// Bursts of events are debounced on the trailing edge: after the first event
/// the watcher waits `debounce_duration`, then reports every distinct path that
/// changed in that window once. This keeps a truncate-then-write save from
/// being read half way through.
///
/// # Examples
///
/// ```rust,no_run
/// use hotswap_conn::notify::ConfigWatcher;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (watcher, mut rx) = ConfigWatcher::new(Duration::from_millis(100))?;
/// watcher.watch("/path/to/db.yaml").await?;
///
/// while let Some(path) = rx.recv().await {
///     println!("{} changed", path.display());
/// }
/// # Ok(())
/// # }
/// ```
pub struct ConfigWatcher {
    watcher: tokio::sync::Mutex<RecommendedWatcher>,
    debounce_duration: Duration,
    watched_files: Arc<RwLock<HashSet<PathBuf>>>,
}

impl ConfigWatcher {
    /// Create a new watcher and the channel its changed paths arrive on.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying file watcher cannot be created.
    pub fn new(debounce_duration: Duration) -> Result<(Self, mpsc::Receiver<PathBuf>)> {
        let (tx, rx) = mpsc::channel(100);
        let watched_files = Arc::new(RwLock::new(HashSet::new()));

        // Channel for raw paths from notify
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<PathBuf>();

        let filter = Arc::clone(&watched_files);
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }
                let files = filter.read();
                for path in event.paths {
                    if files.contains(&path) {
                        let _ = event_tx.send(path);
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "File watch error"),
        })
        .map_err(|e| ConfigError::Watch(format!("Failed to create file watcher: {}", e)))?;

        tokio::spawn(async move {
            while let Some(first) = event_rx.recv().await {
                sleep(debounce_duration).await;

                let mut pending = vec![first];
                while let Ok(path) = event_rx.try_recv() {
                    if !pending.contains(&path) {
                        pending.push(path);
                    }
                }

                for path in pending {
                    if tx.send(path).await.is_err() {
                        // Receiver dropped, exit
                        return;
                    }
                }
            }
        });

        Ok((
            Self {
                watcher: tokio::sync::Mutex::new(watcher),
                debounce_duration,
                watched_files,
            },
            rx,
        ))
    }

    /// Start reporting writes to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the path does not exist or cannot be watched.
    pub async fn watch(&self, path: impl AsRef<Path>) -> Result<()> {
        let canonical_path = path
            .as_ref()
            .canonicalize()
            .map_err(|e| ConfigError::Watch(format!("Failed to resolve path: {}", e)))?;
        let dir = parent_of(&canonical_path)?;

        let mut watcher = self.watcher.lock().await;
        if !self.watches_dir(&dir) {
            watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .map_err(|e| ConfigError::Watch(format!("Failed to watch path: {}", e)))?;
        }
        self.watched_files.write().insert(canonical_path.clone());

        tracing::info!(path = %canonical_path.display(), "Watching configuration file");
        Ok(())
    }

    /// Stop reporting writes to `path`.
    ///
    /// The parent directory stays watched while other files in it are.
    pub async fn unwatch(&self, path: impl AsRef<Path>) -> Result<()> {
        let canonical_path = path.as_ref().canonicalize().map_err(|e| {
            ConfigError::Watch(format!("Failed to resolve path for unwatching: {}", e))
        })?;
        let dir = parent_of(&canonical_path)?;

        let mut watcher = self.watcher.lock().await;
        if !self.watched_files.write().remove(&canonical_path) {
            return Ok(());
        }
        if !self.watches_dir(&dir) {
            watcher
                .unwatch(&dir)
                .map_err(|e| ConfigError::Watch(format!("Failed to unwatch path: {}", e)))?;
        }
        Ok(())
    }

    /// Get the debounce duration for this watcher.
    pub fn debounce_duration(&self) -> Duration {
        self.debounce_duration
    }

    /// Get a list of currently watched files.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.watched_files.read().iter().cloned().collect()
    }

    fn watches_dir(&self, dir: &Path) -> bool {
        self.watched_files
            .read()
            .iter()
            .any(|file| file.parent() == Some(dir))
    }
}

fn parent_of(path: &Path) -> Result<PathBuf> {
    path.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| ConfigError::Watch(format!("No parent directory: {}", path.display())))
}
