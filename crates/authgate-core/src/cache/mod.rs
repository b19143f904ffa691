//! Local cache of API responses, scoped to the signed-in user.
//!
//! Data is cached in JSON format and considered stale after 60 minutes.
//! Everything is wiped when the session ends or a different user signs in,
//! so one user's data is never served to another.

pub mod manager;

pub use manager::{CacheManager, CachedData};
