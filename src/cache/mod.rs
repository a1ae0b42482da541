//! 回放缓存：指纹、条目存储、防抖落盘

pub mod fingerprint;
pub mod persistence;
pub mod reload;

pub use fingerprint::Fingerprint;
pub use persistence::CachePersister;
pub use reload::{CacheConfig, CacheEntry, CacheMatch, CacheSnapshot, ReloadCache};
