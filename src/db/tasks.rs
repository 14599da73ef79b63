//! Upload task and chunk state persistence.

use std::path::PathBuf;
use std::time::Duration;

use turso::Connection;

use super::{DbResult, TaskStore};
use crate::range::DataRange;
use crate::task::{ChunkState, ChunkStatus, TaskStatus, UploadTask};

/// Get SQL for creating the upload task tables
pub(super) fn get_table_sql() -> &'static str {
    "
    CREATE TABLE IF NOT EXISTS upload_tasks (
        id TEXT PRIMARY KEY,
        file_path TEXT NOT NULL,
        file_name TEXT NOT NULL,
        file_size INTEGER NOT NULL,
        file_mtime INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        drive_id INTEGER NOT NULL,
        parent_folder_id INTEGER NOT NULL,
        queue TEXT NOT NULL,
        status TEXT NOT NULL,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS chunk_states (
        task_id TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        range_lower INTEGER NOT NULL,
        range_upper INTEGER NOT NULL,
        status TEXT NOT NULL,
        remote_chunk_id TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_attempt_at INTEGER,
        PRIMARY KEY (task_id, chunk_index),
        FOREIGN KEY (task_id) REFERENCES upload_tasks(id)
    );

    CREATE INDEX IF NOT EXISTS idx_tasks_status ON upload_tasks(status);
    CREATE INDEX IF NOT EXISTS idx_tasks_parent ON upload_tasks(parent_folder_id);
    "
}

impl TaskStore {
    /// Write a task and all of its chunk rows in one transaction, replacing
    /// any previous record. A crash mid-write leaves the old record intact.
    pub async fn upsert_task(&self, task: &UploadTask) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result = write_task(&conn, task).await;
        match result {
            Ok(()) => {
                conn.execute("COMMIT", ()).await?;
                Ok(())
            }
            Err(error) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(error)
            }
        }
    }

    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        last_error: Option<&str>,
    ) -> DbResult<()> {
        let conn = self.conn.lock().await;
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "UPDATE upload_tasks SET status = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4",
            turso::params![
                status.to_string(),
                last_error.map(str::to_string),
                now,
                task_id
            ],
        )
        .await?;
        Ok(())
    }

    /// Persist one chunk's state after a transfer unit reported in.
    pub async fn update_chunk_state(&self, task_id: &str, chunk: &ChunkState) -> DbResult<()> {
        let conn = self.conn.lock().await;
        let (status, remote_id) = chunk.status.db_encode();
        conn.execute(
            "INSERT INTO chunk_states
             (task_id, chunk_index, range_lower, range_upper, status, remote_chunk_id,
              retry_count, last_attempt_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (task_id, chunk_index) DO UPDATE SET
                 status = ?5, remote_chunk_id = ?6, retry_count = ?7, last_attempt_at = ?8",
            turso::params![
                task_id,
                chunk.index as i64,
                chunk.range.lower as i64,
                chunk.range.upper as i64,
                status,
                remote_id.map(str::to_string),
                chunk.retry_count as i64,
                chunk.last_attempt_at,
            ],
        )
        .await?;

        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "UPDATE upload_tasks SET updated_at = ?1 WHERE id = ?2",
            turso::params![now, task_id],
        )
        .await?;
        Ok(())
    }

    /// Load every task worth restoring after a restart: anything not
    /// completed or cancelled (failed tasks stay retryable). Chunks left
    /// in-flight by a crash come back as not-started.
    pub async fn load_resumable_tasks(&self) -> DbResult<Vec<UploadTask>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT id, file_path, file_name, file_size, file_mtime, user_id, drive_id,
                        parent_folder_id, queue, status, last_error, created_at, updated_at
                 FROM upload_tasks
                 WHERE status != 'completed' AND status != 'cancelled'
                 ORDER BY created_at",
                (),
            )
            .await?;

        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await? {
            let status_text: String = row.get(9)?;
            tasks.push(UploadTask {
                id: row.get(0)?,
                file_path: PathBuf::from(row.get::<String>(1)?),
                file_name: row.get(2)?,
                file_size: row.get::<i64>(3)? as u64,
                file_mtime: row.get(4)?,
                user_id: row.get(5)?,
                drive_id: row.get(6)?,
                parent_folder_id: row.get(7)?,
                queue: row.get(8)?,
                status: TaskStatus::from(status_text),
                last_error: row.get(10)?,
                ranges: Vec::new(),
                chunks: Vec::new(),
                created_at: row.get(11)?,
                updated_at: row.get(12)?,
            });
        }
        drop(rows);

        for task in &mut tasks {
            let mut rows = conn
                .query(
                    "SELECT chunk_index, range_lower, range_upper, status, remote_chunk_id,
                            retry_count, last_attempt_at
                     FROM chunk_states WHERE task_id = ?1 ORDER BY chunk_index",
                    turso::params![task.id.clone()],
                )
                .await?;

            while let Some(row) = rows.next().await? {
                let range = DataRange::new(
                    row.get::<i64>(1)? as u64,
                    row.get::<i64>(2)? as u64,
                );
                let status_text: String = row.get(3)?;
                let mut status =
                    ChunkStatus::db_decode(&status_text, row.get::<Option<String>>(4)?);
                if status == ChunkStatus::InFlight {
                    status = ChunkStatus::NotStarted;
                }
                task.ranges.push(range);
                task.chunks.push(ChunkState {
                    index: row.get::<i64>(0)? as u64,
                    range,
                    status,
                    retry_count: row.get::<i64>(5)? as u32,
                    last_attempt_at: row.get(6)?,
                });
            }
        }

        Ok(tasks)
    }

    /// Delete a task and its chunk rows.
    pub async fn delete_task(&self, task_id: &str) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result = async {
            conn.execute(
                "DELETE FROM chunk_states WHERE task_id = ?1",
                turso::params![task_id],
            )
            .await?;
            conn.execute(
                "DELETE FROM upload_tasks WHERE id = ?1",
                turso::params![task_id],
            )
            .await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => {
                conn.execute("COMMIT", ()).await?;
                Ok(())
            }
            Err(error) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(error)
            }
        }
    }

    /// Purge terminal records older than `max_age`.
    pub async fn cleanup_stale_tasks(&self, max_age: Duration) -> DbResult<usize> {
        let conn = self.conn.lock().await;
        let cutoff = chrono::Utc::now().timestamp() - max_age.as_secs() as i64;

        // Collect ids first; subqueries in DELETE are not supported.
        let mut rows = conn
            .query(
                "SELECT id FROM upload_tasks
                 WHERE (status = 'completed' OR status = 'failed' OR status = 'cancelled')
                 AND updated_at < ?1",
                turso::params![cutoff],
            )
            .await?;

        let mut task_ids: Vec<String> = Vec::new();
        while let Some(row) = rows.next().await? {
            task_ids.push(row.get(0)?);
        }
        drop(rows);

        for task_id in &task_ids {
            conn.execute(
                "DELETE FROM chunk_states WHERE task_id = ?1",
                turso::params![task_id.clone()],
            )
            .await?;
            conn.execute(
                "DELETE FROM upload_tasks WHERE id = ?1",
                turso::params![task_id.clone()],
            )
            .await?;
        }

        Ok(task_ids.len())
    }
}

async fn write_task(conn: &Connection, task: &UploadTask) -> DbResult<()> {
    conn.execute(
        "INSERT INTO upload_tasks
         (id, file_path, file_name, file_size, file_mtime, user_id, drive_id,
          parent_folder_id, queue, status, last_error, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT (id) DO UPDATE SET
             file_path = ?2, file_name = ?3, file_size = ?4, file_mtime = ?5,
             user_id = ?6, drive_id = ?7, parent_folder_id = ?8, queue = ?9,
             status = ?10, last_error = ?11, created_at = ?12, updated_at = ?13",
        turso::params![
            task.id.clone(),
            task.file_path.to_string_lossy().to_string(),
            task.file_name.clone(),
            task.file_size as i64,
            task.file_mtime,
            task.user_id,
            task.drive_id,
            task.parent_folder_id,
            task.queue.clone(),
            task.status.to_string(),
            task.last_error.clone(),
            task.created_at,
            task.updated_at,
        ],
    )
    .await?;

    conn.execute(
        "DELETE FROM chunk_states WHERE task_id = ?1",
        turso::params![task.id.clone()],
    )
    .await?;

    for chunk in &task.chunks {
        let (status, remote_id) = chunk.status.db_encode();
        conn.execute(
            "INSERT INTO chunk_states
             (task_id, chunk_index, range_lower, range_upper, status, remote_chunk_id,
              retry_count, last_attempt_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            turso::params![
                task.id.clone(),
                chunk.index as i64,
                chunk.range.lower as i64,
                chunk.range.upper as i64,
                status,
                remote_id.map(str::to_string),
                chunk.retry_count as i64,
                chunk.last_attempt_at,
            ],
        )
        .await?;
    }

    Ok(())
}
