//! Streamgate Storage - Keyed Store, Locator Cache and Lease Lock
//!
//! Everything here is built on one small contract, [`KeyedStore`]: TTL
//! writes, plain reads and deletes, and an atomic set-if-absent. The locator
//! cache and the per-key lease lock are thin typed layers over that contract,
//! so the same code runs against the in-memory store in tests and against
//! Redis in production.

pub mod cache;
pub mod lock;
pub mod store;

pub use cache::{LocatorCache, CACHE_KEY_PREFIX};
pub use lock::{LeaseGuard, LeaseLock, LockAcquisition, LOCK_KEY_PREFIX};
pub use store::{InMemoryStore, KeyedStore, StoreResult, TimeoutStore};

#[cfg(feature = "redis")]
pub use store::RedisStore;
