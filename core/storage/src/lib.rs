//! Store abstractions for hybridsync.
//!
//! This module provides the two narrow interfaces the sync engine talks to:
//! the authoritative local store ([`LocalStore`]) and the cloud replica
//! ([`CloudAdapter`]), plus the implementations shipped with the workspace.
//!
//! # Design Principles
//! - Local writes are synchronous and authoritative
//! - Cloud operations are async and report categorized failures
//! - Cloud writes are last-write-wins: inserts are upserts, no merging
//! - In-memory implementations double as test fixtures

pub mod cloud;
pub mod local;
pub mod memory;
pub mod rest;
pub mod sqlite;

pub use cloud::{CloudAdapter, CloudResult};
pub use local::{LocalStore, MemoryLocalStore};
pub use memory::{CallKind, CloudCall, MemoryCloudAdapter};
pub use rest::RestCloudAdapter;
pub use sqlite::SqliteLocalStore;
