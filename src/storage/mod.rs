//! Storage layer for flows and finished runs.

mod models;
mod sqlite;

use async_trait::async_trait;

use crate::engine::RunSnapshot;
use crate::error::Result;

pub use models::*;
pub use sqlite::SqliteStorage;

/// Where the scheduler hands terminal run snapshots.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_run(&self, snapshot: &RunSnapshot) -> Result<()>;
}
