//! Durable local storage for the current session.
//!
//! This module provides:
//! - `KeyValueStore`: the persistence seam, with file, OS keychain and
//!   in-memory backends
//! - `TokenStore`: the session holder used by the rest of the crate, with
//!   change notification
//!
//! Persistence failures never escape `TokenStore`; an unreadable store reads
//! as "no session".

pub mod backend;
pub mod token_store;

pub use backend::{FileStore, KeyValueStore, KeyringStore, MemoryStore};
pub use token_store::{Subscription, TokenStore, SESSION_KEY};
