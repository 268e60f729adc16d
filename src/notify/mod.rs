//! Configuration change notification.
//!
//! A [`ConfigWatcher`] reports writes to configuration files; the config store
//! reparses the document and publishes its path into the [`ChangeNotifier`],
//! where connection pools subscribe per path.

pub mod registry;
pub mod watcher;

pub use registry::{ChangeNotifier, ChangeQueue, ChangeSubscription, DEFAULT_QUEUE_CAPACITY};
pub use watcher::ConfigWatcher;
