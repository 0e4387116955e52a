//! # LeadPilot Datastores
//!
//! `MemoryStore` for tests and single-process use, `SqliteStore` for
//! deployments that must survive restarts. Both implement every trait in
//! `leadpilot_core::traits::store` with the same semantics.

pub mod memory;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use leadpilot_core::error::Result;
use leadpilot_core::traits::store::Datastore;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Buffered change events per subscriber before lagging.
pub const FEED_CAPACITY: usize = 1024;

/// Open the datastore named by a config path. `:memory:` selects the
/// in-process store.
pub fn open_datastore(path: &str) -> Result<Arc<dyn Datastore>> {
    if path == ":memory:" {
        tracing::info!("🗄️ Using in-memory datastore");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let expanded = shellexpand::tilde(path).into_owned();
    tracing::info!("🗄️ Opening SQLite datastore at {}", expanded);
    Ok(Arc::new(SqliteStore::open(Path::new(&expanded))?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_path_selects_memory_store() {
        let store = open_datastore(":memory:").unwrap();
        assert!(store.stage_configs().await.unwrap().is_empty());
    }
}
