//! Durable task store backed by a local SQLite database.

use std::path::Path;

use tokio::sync::Mutex;
use turso::{Builder, Connection};

mod tasks;

pub(crate) type DbResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Handle to the upload task database, injected into the scheduler.
///
/// The connection is wrapped in a Mutex to serialize database access;
/// turso's page cache misbehaves when a connection is used concurrently.
pub struct TaskStore {
    conn: Mutex<Connection>,
}

impl TaskStore {
    /// Open (or create) the database and its tables.
    pub async fn open(db_path: &Path) -> DbResult<Self> {
        let path = db_path
            .to_str()
            .ok_or("database path is not valid UTF-8")?;
        let db = Builder::new_local(path).build().await?;
        let conn = db.connect()?;

        conn.execute("PRAGMA foreign_keys = ON;", ()).await?;
        conn.execute_batch(tasks::get_table_sql()).await?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}
