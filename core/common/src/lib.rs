//! Common utilities and types shared across hybridsync modules.
//!
//! This module provides the error taxonomy and the small value types
//! (shop ids, table names, record filters) that both stores and the sync
//! engine agree on.

pub mod error;
pub mod types;

pub use error::{CloudError, EnqueueError, Error, Result};
pub use types::{record_id, value_key, Record, RecordFilter, ShopId, TableName};
