//! Client resilience core for the PyKIDS learning app.
//!
//! Keeps a learner's session usable on a flaky connection: reads are served
//! from a short-lived cache, progress writes are batched per learner, failed
//! requests are classified and retried with backoff, and anything that cannot
//! reach the server waits in a persisted offline queue until connectivity
//! returns. [`Core`] wires the parts together.

pub mod api;
pub mod app;
pub mod batch;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod logging;
pub mod offline;
pub mod recovery;
pub mod retry;
pub mod store;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

pub use app::Core;
pub use config::Config;
