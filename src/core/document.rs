//! A single configuration document backed by one file.

use crate::core::loader::{self, ConfigFormat, Table};
use crate::error::{ConfigError, Result};
use arc_swap::ArcSwap;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One configuration document: a base name, a format tag, an absolute backing
/// path and the parsed key/value tree.
///
/// The tree is held in an `ArcSwap`, so readers never block a reload and never
/// observe a partially applied one. A failed reparse leaves the previous tree
/// in place.
pub struct ConfigDocument {
    name: String,
    format: ConfigFormat,
    path: PathBuf,
    tree: ArcSwap<Table>,
}

impl ConfigDocument {
    /// Load a document from `path`.
    ///
    /// The path is canonicalized so it matches the paths reported by the file
    /// watcher and used as keys in the [`ChangeNotifier`](crate::notify::ChangeNotifier).
    ///
    /// # Errors
    ///
    /// - [`ConfigError::UnsupportedFormat`] for an unknown extension
    /// - [`ConfigError::NotFound`] if the file does not exist
    /// - [`ConfigError::Parse`] if the content cannot be parsed
    pub fn load(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        let path = path.canonicalize().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::NotFound(path.to_path_buf()),
            _ => ConfigError::Io(e),
        })?;
        let tree = loader::parse_file(&path, format)?;

        Ok(Self {
            name: name.into(),
            format,
            path,
            tree: ArcSwap::from_pointee(tree),
        })
    }

    /// Base name of the document (the file stem for directory loads).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Format tag.
    pub fn format(&self) -> ConfigFormat {
        self.format
    }

    /// Absolute backing-file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current tree.
    pub fn tree(&self) -> Arc<Table> {
        self.tree.load_full()
    }

    /// Look up a dotted path relative to the document root.
    ///
    /// Returns `None` for any missing segment.
    pub fn get(&self, dotted: &str) -> Option<config::Value> {
        let tree = self.tree.load();
        loader::lookup(&tree, dotted.split('.')).cloned()
    }

    /// Typed lookup of a dotted path relative to the document root.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Deserialize`] if the value exists but does not
    /// have the shape of `T`.
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

    /// Deserialize the whole document into `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        let root = config::Value::new(None, config::ValueKind::Table((*self.tree()).clone()));
        root.try_deserialize::<T>().map_err(|e| ConfigError::Deserialize {
            key: self.name.clone(),
            reason: e.to_string(),
        })
    }

    /// Reparse the backing file and swap the tree in on success.
    pub(crate) fn reload(&self) -> Result<()> {
        let tree = loader::parse_file(&self.path, self.format)?;
        self.tree.store(Arc::new(tree));
        Ok(())
    }

    /// Set `dotted` to `value` and write the document back to its file.
    pub(crate) fn save(&self, dotted: &str, value: config::Value) -> Result<()> {
        let segments: Vec<&str> = dotted.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ConfigError::Write(format!("Invalid key: '{}'", dotted)));
        }

        let mut tree = (*self.tree()).clone();
        loader::insert(&mut tree, &segments, value);
        let text = loader::render(&tree, self.format)?;
        std::fs::write(&self.path, text)?;
        self.tree.store(Arc::new(tree));
        Ok(())
    }
}

impl std::fmt::Debug for ConfigDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigDocument")
            .field("name", &self.name)
            .field("format", &self.format)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
