//! CLI subcommands.

pub mod chat;
pub mod config_cmd;
pub mod doctor;

use std::sync::Arc;
use turnflow_config::AppConfig;
use turnflow_core::store::Store;
use turnflow_store::{InMemoryStore, SqliteStore};

/// Open the configured store backend.
pub async fn open_store(config: &AppConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    match config.storage.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryStore::new())),
        _ if config.storage.path == ":memory:" => Ok(Arc::new(
            SqliteStore::new("sqlite::memory:")
                .await
                .map_err(|e| format!("Failed to open in-memory SQLite: {e}"))?,
        )),
        _ => {
            let path = config.storage.resolved_path();
            let store = SqliteStore::open(&path)
                .await
                .map_err(|e| format!("Failed to open {}: {e}", path.display()))?;
            Ok(Arc::new(store))
        }
    }
}
