//! Chunked upload engine.
//!
//! Splits local files into bounded byte ranges, streams each range to remote
//! storage as an independently retryable unit, and coordinates many uploads
//! under a concurrency budget driven by device conditions. Task and chunk
//! state is persisted so uploads resume from the last uploaded chunk after a
//! process restart.
//!
//! ```no_run
//! use std::sync::Arc;
//! use updrive::{NewUpload, TaskStore, UploadConfig, UploadScheduler};
//! use updrive::transport::HttpChunkTransport;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let config = UploadConfig::default();
//! let store = TaskStore::open(&config.database_path).await?;
//! let transport = Arc::new(HttpChunkTransport::new("https://api.example.com/v3", "token")?);
//!
//! let scheduler = UploadScheduler::start(config, store, transport).await?;
//! scheduler.rebuild_from_persisted_state().await?;
//!
//! let task_id = scheduler
//!     .enqueue(NewUpload {
//!         file_path: "/tmp/video.mov".into(),
//!         file_name: "video.mov".into(),
//!         parent_folder_id: 42,
//!         user_id: 1,
//!         drive_id: 7,
//!         queue: None,
//!     })
//!     .await?;
//! # let _ = task_id;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod free_space;
pub mod parallelism;
pub mod queue;
pub mod range;
pub mod reader;
pub mod task;
pub(crate) mod transfer;
pub mod transport;

pub use config::{ChunkPolicy, UploadConfig};
pub use db::TaskStore;
pub use error::UploadError;
pub use events::UploadEvent;
pub use parallelism::{ExecutionContext, SystemSignals, ThermalState};
pub use queue::{NewUpload, UploadScheduler};
pub use range::DataRange;
pub use task::{ChunkState, ChunkStatus, TaskStatus, UploadTask};
