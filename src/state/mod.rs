//! State management module for Stackwright.
//!
//! This module provides durable storage for the last-applied state of every
//! resource, one record per identity, plus advisory locking around applies.

mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use store::{StateSnapshot, StateStore};
pub use types::{RecordStatus, STATE_VERSION, StateRecord};
