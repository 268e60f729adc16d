//! The configuration store: all documents of a process, looked up by dotted path.

use crate::core::document::ConfigDocument;
use crate::core::loader::ConfigFormat;
use crate::error::{ConfigError, Result};
use crate::notify::{ChangeNotifier, ConfigWatcher};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

/// Default quiet period before a burst of file events is turned into a reload.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

struct StoreInner {
    documents: RwLock<HashMap<String, Arc<ConfigDocument>>>,
    notifier: ChangeNotifier,
    watcher: Mutex<Option<Arc<ConfigWatcher>>>,
    debounce: Duration,
}

/// In-memory store of configuration documents, one per backing file.
///
/// The first segment of a dotted path selects the document by name, the rest
/// walks its tree: `"db.host"` reads `host` from the document named `db`.
///
/// Cloning is cheap; all clones share the same documents and watcher.
///
/// # Examples
///
/// ```rust,no_run
/// use hotswap_conn::prelude::*;
///
/// # async fn example() -> hotswap_conn::error::Result<()> {
/// let notifier = ChangeNotifier::new();
/// let store = ConfigStore::open("config", notifier.clone())?;
/// store.watch_all().await?;
///
/// let host = store.get("db.host");
/// let port: u16 = store.get_as("db.port")?.unwrap_or(3306);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<StoreInner>,
}

impl ConfigStore {
    /// Create an empty store publishing changes into `notifier`.
    pub fn new(notifier: ChangeNotifier) -> Self {
        Self::with_debounce(notifier, DEFAULT_DEBOUNCE)
    }

    /// Create an empty store with a custom watch debounce.
    pub fn with_debounce(notifier: ChangeNotifier, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                documents: RwLock::new(HashMap::new()),
                notifier,
                watcher: Mutex::new(None),
                debounce,
            }),
        }
    }

    /// Load every supported file of `dir`, one document per file named after
    /// its stem.
    ///
    /// Files with other extensions are skipped, and so are files whose stem
    /// contains a `.` (`app.prod.yaml`), since [`get`](Self::get) takes the
    /// document name up to the first dot.
    ///
    /// # Errors
    ///
    /// Fails on the first document that cannot be read or parsed.
    pub fn open(dir: impl AsRef<Path>, notifier: ChangeNotifier) -> Result<Self> {
        let store = Self::new(notifier);
        let dir = dir.as_ref();

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ConfigError::NotFound(dir.to_path_buf()),
                _ => ConfigError::Io(e),
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        for path in paths {
            if ConfigFormat::from_path(&path).is_err() {
                tracing::debug!(path = %path.display(), "Skipping file with unsupported extension");
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.contains('.') {
                tracing::warn!(
                    path = %path.display(),
                    "Skipping file whose name cannot be addressed by a dotted path"
                );
                continue;
            }
            store.load(name.to_string(), &path)?;
        }

        Ok(store)
    }

    /// Load (or replace) the document `name` from `path`.
    ///
    /// The document's path is registered with the change notifier. If `name`
    /// is already loaded from the same file, its tree is replaced in place and
    /// the change is published, exactly like [`reload`](Self::reload). A name
    /// moving to another file gets a new document, and the change is published
    /// on the old path. If the new file fails to parse, the old document is
    /// kept.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::NotFound`] if the file does not exist
    /// - [`ConfigError::Parse`] if the content cannot be parsed
    pub fn load(
        &self,
        name: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> Result<Arc<ConfigDocument>> {
        let name = name.into();
        let path = path.as_ref();

        let previous = self.document(&name);
        if let Some(document) = &previous {
            if path.canonicalize().ok().as_deref() == Some(document.path()) {
                document.reload()?;
                tracing::info!(
                    name = %name,
                    path = %document.path().display(),
                    "Reloaded configuration document"
                );
                self.inner.notifier.publish(document.path());
                return Ok(Arc::clone(document));
            }
        }

        let document = Arc::new(ConfigDocument::load(name.clone(), path)?);
        self.inner.notifier.register(document.path());

        tracing::info!(
            name = %name,
            path = %document.path().display(),
            "Loaded configuration document"
        );

        self.inner
            .documents
            .write()
            .insert(name, Arc::clone(&document));
        if let Some(previous) = previous {
            self.inner.notifier.publish(previous.path());
        }
        self.inner.notifier.publish(document.path());
        Ok(document)
    }

    /// Look up a dotted path. Absent segments yield `None`.
    pub fn get(&self, dotted: &str) -> Option<config::Value> {
        let (name, rest) = match dotted.split_once('.') {
            Some((name, rest)) => (name, Some(rest)),
            None => (dotted, None),
        };
        let document = self.document(name)?;
        match rest {
            Some(rest) => document.get(rest),
            None => Some(config::Value::new(
                None,
                config::ValueKind::Table((*document.tree()).clone()),
            )),
        }
    }

    /// Typed lookup of a dotted path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Deserialize`] when the value exists but has the
    /// wrong shape; absence is `Ok(None)`.
    pub fn get_as<T: DeserializeOwned>(&self, dotted: &str) -> Result<Option<T>> {
        self.get(dotted)
            .map(|value| {
                value.try_deserialize::<T>().map_err(|e| ConfigError::Deserialize {
                    key: dotted.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    /// The document named `name`, if loaded.
    pub fn document(&self, name: &str) -> Option<Arc<ConfigDocument>> {
        self.inner.documents.read().get(name).cloned()
    }

    /// Names of all loaded documents.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.documents.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// The notifier this store publishes into.
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.inner.notifier
    }

    /// Reparse `name` from disk and publish its path on success.
    ///
    /// # Errors
    ///
    /// Returns the parse error and keeps the previous tree if the file is
    /// invalid.
    pub fn reload(&self, name: &str) -> Result<()> {
        let document = self
            .document(name)
            .ok_or_else(|| ConfigError::UnknownDocument(name.to_string()))?;
        document.reload()?;
        self.inner.notifier.publish(document.path());
        Ok(())
    }

    /// Set `dotted` (relative to document `name`) and write the document back
    /// to disk in its own format.
    ///
    /// A watched document is then reloaded by the watcher like any other edit.
    pub fn save(&self, name: &str, dotted: &str, value: impl Into<config::Value>) -> Result<()> {
        let document = self
            .document(name)
            .ok_or_else(|| ConfigError::UnknownDocument(name.to_string()))?;
        document.save(dotted, value.into())?;
        tracing::info!(name = %name, key = %dotted, "Saved configuration value");
        Ok(())
    }

    /// Watch the backing file of `name` for writes.
    ///
    /// Every write reparses the document in place and publishes its path into
    /// the change notifier. A reparse failure is logged and skipped; the
    /// previous tree stays authoritative and the watcher keeps running.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is unknown or the watcher cannot be installed.
    pub async fn watch(&self, name: &str) -> Result<()> {
        let document = self
            .document(name)
            .ok_or_else(|| ConfigError::UnknownDocument(name.to_string()))?;
        let watcher = self.watcher().await?;
        watcher.watch(document.path()).await
    }

    /// Watch every loaded document.
    pub async fn watch_all(&self) -> Result<()> {
        for name in self.names() {
            self.watch(&name).await?;
        }
        Ok(())
    }

    /// Whether a file watcher has been installed.
    pub async fn is_watching(&self) -> bool {
        self.inner.watcher.lock().await.is_some()
    }

    async fn watcher(&self) -> Result<Arc<ConfigWatcher>> {
        let mut slot = self.inner.watcher.lock().await;
        if let Some(watcher) = slot.as_ref() {
            return Ok(Arc::clone(watcher));
        }

        let (watcher, rx) = ConfigWatcher::new(self.inner.debounce)?;
        let watcher = Arc::new(watcher);
        tokio::spawn(apply_changes(Arc::downgrade(&self.inner), rx));
        *slot = Some(Arc::clone(&watcher));
        Ok(watcher)
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("documents", &self.names())
            .field("debounce", &self.inner.debounce)
            .finish_non_exhaustive()
    }
}

/// Reload documents as their files change, until the store is dropped.
async fn apply_changes(store: Weak<StoreInner>, mut rx: mpsc::Receiver<PathBuf>) {
    while let Some(path) = rx.recv().await {
        let Some(inner) = store.upgrade() else {
            break;
        };

        let documents: Vec<Arc<ConfigDocument>> = inner
            .documents
            .read()
            .values()
            .filter(|doc| doc.path() == path.as_path())
            .cloned()
            .collect();

        for document in documents {
            match document.reload() {
                Ok(()) => {
                    tracing::info!(
                        name = %document.name(),
                        path = %path.display(),
                        "Configuration reloaded"
                    );
                    inner.notifier.publish(&path);
                }
                Err(e) => {
                    tracing::warn!(
                        name = %document.name(),
                        path = %path.display(),
                        error = %e,
                        "Configuration reload failed, keeping previous values"
                    );
                }
            }
        }
    }
    tracing::debug!("Configuration watch loop stopped");
}
