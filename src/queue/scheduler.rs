//! Public handle driving the scheduler worker.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use super::worker::SchedulerWorker;
use crate::config::UploadConfig;
use crate::db::TaskStore;
use crate::error::UploadError;
use crate::events::{EventBus, UploadEvent};
use crate::parallelism::SystemSignals;
use crate::transfer::ChunkOutcome;
use crate::transport::{ChunkTransport, RemoteFile, TransportError};

/// A file handed over by the UI for upload.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub file_path: PathBuf,
    pub file_name: String,
    pub parent_folder_id: i64,
    pub user_id: i64,
    pub drive_id: i64,
    /// Sub-queue name; `None` selects the default queue.
    pub queue: Option<String>,
}

pub(crate) enum Command {
    Enqueue {
        request: NewUpload,
        respond: oneshot::Sender<Result<String, UploadError>>,
    },
    Retry {
        task_id: String,
        respond: oneshot::Sender<Result<(), UploadError>>,
    },
    RetryAll {
        parent_folder_id: i64,
        respond: oneshot::Sender<usize>,
    },
    Cancel {
        task_id: String,
        respond: oneshot::Sender<Result<(), UploadError>>,
    },
    CancelAll {
        parent_folder_id: i64,
        respond: oneshot::Sender<usize>,
    },
    SuspendAll,
    ResumeAll,
    RescheduleRunning,
    Rebuild {
        respond: oneshot::Sender<Result<usize, UploadError>>,
    },
    WaitForCompletion {
        respond: oneshot::Sender<()>,
    },
    SetQueueEnabled {
        queue: String,
        enabled: bool,
    },
    SignalsChanged(SystemSignals),
    MemoryPressureCritical,
    ChunkFinished {
        task_id: String,
        chunk_index: u64,
        outcome: ChunkOutcome,
    },
    FinalizeFinished {
        task_id: String,
        result: Result<RemoteFile, TransportError>,
    },
}

/// Entry point of the engine. Cheap to clone; all operations are forwarded
/// to a single worker task that owns every piece of mutable state, so
/// concurrently completing chunk transfers can never race on task records.
#[derive(Clone)]
pub struct UploadScheduler {
    tx: mpsc::Sender<Command>,
    events: EventBus,
}

impl UploadScheduler {
    /// Start the engine with default system signals. Purges stale terminal
    /// records before accepting work.
    pub async fn start(
        config: UploadConfig,
        store: TaskStore,
        transport: Arc<dyn ChunkTransport>,
    ) -> Result<Self, UploadError> {
        Self::start_with_signals(config, store, transport, SystemSignals::default()).await
    }

    pub async fn start_with_signals(
        config: UploadConfig,
        store: TaskStore,
        transport: Arc<dyn ChunkTransport>,
        signals: SystemSignals,
    ) -> Result<Self, UploadError> {
        store.cleanup_stale_tasks(config.stale_task_max_age).await?;

        let events = EventBus::new(config.event_capacity);
        let (tx, rx) = mpsc::channel(64);
        let worker = SchedulerWorker::new(
            config,
            store,
            transport,
            events.clone(),
            signals,
            tx.clone(),
            rx,
        );
        tokio::spawn(worker.run());

        Ok(Self { tx, events })
    }

    /// Subscribe to progress, status and failure events.
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    /// Validate and admit a file; returns the new task id. The upload
    /// itself proceeds in the background.
    pub async fn enqueue(&self, request: NewUpload) -> Result<String, UploadError> {
        let (respond, rx) = oneshot::channel();
        self.send(Command::Enqueue { request, respond }).await?;
        rx.await.map_err(|_| UploadError::QueueShutDown)?
    }

    /// Reset a failed task's failed chunks and re-enter scheduling.
    pub async fn retry(&self, task_id: &str) -> Result<(), UploadError> {
        let (respond, rx) = oneshot::channel();
        self.send(Command::Retry {
            task_id: task_id.to_string(),
            respond,
        })
        .await?;
        rx.await.map_err(|_| UploadError::QueueShutDown)?
    }

    /// Retry every failed task under a parent folder. Returns how many were
    /// re-entered.
    pub async fn retry_all(&self, parent_folder_id: i64) -> Result<usize, UploadError> {
        let (respond, rx) = oneshot::channel();
        self.send(Command::RetryAll {
            parent_folder_id,
            respond,
        })
        .await?;
        rx.await.map_err(|_| UploadError::QueueShutDown)
    }

    /// Cancel a task, discard its in-flight transfers and delete its record.
    pub async fn cancel(&self, task_id: &str) -> Result<(), UploadError> {
        let (respond, rx) = oneshot::channel();
        self.send(Command::Cancel {
            task_id: task_id.to_string(),
            respond,
        })
        .await?;
        rx.await.map_err(|_| UploadError::QueueShutDown)?
    }

    pub async fn cancel_all(&self, parent_folder_id: i64) -> Result<usize, UploadError> {
        let (respond, rx) = oneshot::channel();
        self.send(Command::CancelAll {
            parent_folder_id,
            respond,
        })
        .await?;
        rx.await.map_err(|_| UploadError::QueueShutDown)
    }

    /// Global pause: in-flight transfers are halted and reset so every task
    /// can be resumed later without re-uploading finished chunks.
    pub async fn suspend_all(&self) -> Result<(), UploadError> {
        self.send(Command::SuspendAll).await
    }

    pub async fn resume_all(&self) -> Result<(), UploadError> {
        self.send(Command::ResumeAll).await
    }

    /// Convert in-flight transfers back to not-started. Called when the host
    /// is about to lose execution time and wants a clean resumable state.
    pub async fn reschedule_running_operations(&self) -> Result<(), UploadError> {
        self.send(Command::RescheduleRunning).await
    }

    /// Restore persisted tasks after a process restart. Returns how many
    /// tasks were brought back.
    pub async fn rebuild_from_persisted_state(&self) -> Result<usize, UploadError> {
        let (respond, rx) = oneshot::channel();
        self.send(Command::Rebuild { respond }).await?;
        rx.await.map_err(|_| UploadError::QueueShutDown)?
    }

    /// Resolves once no sub-queue has work left.
    pub async fn wait_for_completion(&self) -> Result<(), UploadError> {
        let (respond, rx) = oneshot::channel();
        self.send(Command::WaitForCompletion { respond }).await?;
        rx.await.map_err(|_| UploadError::QueueShutDown)
    }

    pub async fn set_queue_enabled(&self, queue: &str, enabled: bool) -> Result<(), UploadError> {
        self.send(Command::SetQueueEnabled {
            queue: queue.to_string(),
            enabled,
        })
        .await
    }

    /// Feed a fresh snapshot of device conditions (thermal state, power
    /// mode, ...) into the parallelism heuristic.
    pub async fn system_signals_changed(&self, signals: SystemSignals) -> Result<(), UploadError> {
        self.send(Command::SignalsChanged(signals)).await
    }

    /// Critical memory pressure: tear down in-flight buffers, keep state
    /// resumable.
    pub async fn memory_pressure_critical(&self) -> Result<(), UploadError> {
        self.send(Command::MemoryPressureCritical).await
    }

    /// The host is about to be suspended by the OS.
    pub async fn app_entering_background(&self) -> Result<(), UploadError> {
        self.send(Command::RescheduleRunning).await
    }

    async fn send(&self, command: Command) -> Result<(), UploadError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| UploadError::QueueShutDown)
    }
}
