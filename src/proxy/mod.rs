//! Tiered cache proxy.
//!
//! Every intercepted GET is classified into one caching policy. Responses
//! are kept in named caches in a SQLite database, one per generation of app
//! content plus a separate cache for third-party assets.

pub mod classify;
pub mod fetch;
pub mod layer;
pub mod storage;
pub mod traits;

pub use classify::{classify, static_key, Route};
pub use fetch::{Fetcher, HttpFetcher};
pub use layer::{CacheProxy, ProxyRequest};
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheSource, CachedEntry, CachedResponse, Generation, ProxyResponse};
