//! In-memory storage backend for the lineage resolution engine.
//!
//! [`InMemoryStore`] implements both [`lineage_storage::PathIndexStore`] and
//! [`lineage_storage::ViewStore`]. It is the default backend for tests and
//! single-process deployments, and can simulate a bounded connection pool and
//! fixed I/O latency.

mod store;
mod views;

pub use store::InMemoryStore;
