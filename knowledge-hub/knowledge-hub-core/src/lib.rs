//! Document storage engine for a knowledge base.
//!
//! Documents live behind one of three backends selected at startup: a git
//! working tree, a SQLite store, or the store mirrored into git. Every
//! inbound operation goes through [`access::AccessControl`] before it reaches
//! a backend; see [`manager::StorageManager`] for the entry point.

pub mod access;
pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod git_backend;
pub mod hybrid;
pub mod manager;
pub mod path;
pub mod search;
pub mod store;
pub mod sync;

pub use backend::{Document, DocumentBackend, Metadata, VersionToken, WriteOutcome};
pub use config::{BackendMode, Config};
pub use error::{StoreError, StoreResult};
pub use manager::{Caller, StorageManager};
