//! Configuration documents and the store that owns them.

mod document;
mod loader;
mod store;

pub use document::ConfigDocument;
pub use loader::{ConfigFormat, Table};
pub use store::{ConfigStore, DEFAULT_DEBOUNCE};
