//! Durable key-value storage for state that must survive a restart.
//!
//! This module provides:
//! - A minimal `KvStore` trait (`get_item` / `set_item` / `remove_item`)
//! - A SQLite-backed store for real use and an in-memory store for tests
//! - Versioned, checksummed documents so a schema change or a torn write is
//!   detected on load instead of being deserialized into garbage

mod document;
mod storage;
mod traits;

pub use document::{load_document, save_document, DOCUMENT_VERSION};
pub use storage::{MemoryStore, SqliteStore};
pub use traits::{keys, KvStore};
