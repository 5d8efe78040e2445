pub mod error;
pub mod lru_cache;

pub use error::{AppError, AppResult};
pub use lru_cache::LruCache;
