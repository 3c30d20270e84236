//! TTL mutual exclusion
//!
//! [`DistributedLock`] is the single-attempt primitive over a pluggable
//! [`LockStore`]. [`RetriableLock`] wraps it with retry, backoff and release
//! guarantees and is what the engine uses. [`NotificationClusterLock`] elects
//! one node per window for periodic cluster work.

pub mod cluster;
pub mod memory;
pub mod postgres;
pub mod primitive;
pub mod retriable;
pub mod store;

pub use cluster::{LeaderPoller, NotificationClusterLock};
pub use memory::InMemoryLockStore;
pub use postgres::PgLockStore;
pub use primitive::DistributedLock;
pub use retriable::{Backoff, LockOptions, RetriableLock};
pub use store::{LockRecord, LockStore};
