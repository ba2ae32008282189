//! Local package cache: file layout, cache-aside policy, fetch coalescing.

pub mod aside;
pub mod coalesce;
pub mod store;

pub use aside::{CacheAside, CachedFile};
pub use store::CacheStore;
