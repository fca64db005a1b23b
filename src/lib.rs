pub mod cache;
pub mod config;
pub mod error;
pub mod store;
pub mod sync;
pub mod testing;

pub mod prelude {
    pub use crate::cache::{CacheManager, MemorySource, PersonaKey};
    pub use crate::config::CacheConfig;
    pub use crate::error::Result;
    pub use crate::store::{BackingStore, SqliteStore};
    pub use crate::sync::{SyncEngine, SyncOutcome};
}
