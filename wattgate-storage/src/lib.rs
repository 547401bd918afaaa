//! wattgate Storage Layer
//!
//! Per-process bounded caching plus everything that talks to the shared
//! key-value store: the distributed lock and the session → customer bindings.
//!
//! The shared store is pluggable through [`SharedStore`]. [`RedisStore`] is
//! used when several gateway instances run side by side; [`InMemoryStore`]
//! serves single-instance deployments and tests.

pub mod binding;
pub mod cache;
pub mod lock;
pub mod store;

pub use binding::BindingStore;
pub use cache::{BoundedCache, CacheStats};
pub use lock::{DistributedLock, LockOutcome};
pub use store::{InMemoryStore, RedisStore, SharedStore};
