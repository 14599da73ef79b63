//! End-to-end scheduler tests against a scripted in-memory transport.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::timeout;

use updrive::config::{ChunkPolicy, UploadConfig};
use updrive::events::UploadEvent;
use updrive::range::file_byte_size;
use updrive::task::{ChunkState, ChunkStatus, TaskStatus, UploadTask};
use updrive::transport::{
    ChunkPayload, ChunkTransport, RemoteChunk, RemoteFile, TransportError,
};
use updrive::{DataRange, NewUpload, TaskStore, UploadError, UploadScheduler};

/// Transport that records traffic and plays back scripted failures.
#[derive(Default)]
struct MockTransport {
    delay: Option<Duration>,
    fail_plan: Mutex<HashMap<u64, VecDeque<TransportError>>>,
    sent: Mutex<Vec<u64>>,
    attempts: Mutex<HashMap<u64, u32>>,
    finalized: Mutex<Vec<String>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    fn script_failures(&self, chunk_index: u64, errors: Vec<TransportError>) {
        self.fail_plan
            .lock()
            .unwrap()
            .insert(chunk_index, errors.into());
    }

    fn sent_indices(&self) -> Vec<u64> {
        let mut indices = self.sent.lock().unwrap().clone();
        indices.sort_unstable();
        indices
    }

    fn attempts_for(&self, chunk_index: u64) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(&chunk_index)
            .copied()
            .unwrap_or(0)
    }

    fn finalized_sessions(&self) -> Vec<String> {
        self.finalized.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChunkTransport for MockTransport {
    async fn send_chunk(&self, payload: ChunkPayload) -> Result<RemoteChunk, TransportError> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        *self
            .attempts
            .lock()
            .unwrap()
            .entry(payload.chunk_index)
            .or_insert(0) += 1;

        if let Some(error) = self
            .fail_plan
            .lock()
            .unwrap()
            .get_mut(&payload.chunk_index)
            .and_then(|queue| queue.pop_front())
        {
            return Err(error);
        }

        self.sent.lock().unwrap().push(payload.chunk_index);
        Ok(RemoteChunk {
            remote_id: format!("remote-{}", payload.chunk_index),
        })
    }

    async fn finalize(
        &self,
        session_id: &str,
        _total_chunks: u64,
    ) -> Result<RemoteFile, TransportError> {
        self.finalized.lock().unwrap().push(session_id.to_string());
        Ok(RemoteFile {
            remote_id: format!("file-{session_id}"),
        })
    }
}

fn network(message: &str) -> TransportError {
    TransportError::Network(message.to_string())
}

/// Tiny chunks so a handful of bytes exercises real multi-chunk uploads.
fn test_config(dir: &Path) -> UploadConfig {
    UploadConfig {
        chunk_policy: ChunkPolicy {
            chunk_min_size: 4,
            chunk_max_size_client: 4,
            chunk_max_size_server: 1024,
            optimal_chunk_count: 2,
            max_total_chunks: 100,
        },
        max_chunk_retries: 0,
        retry_backoff_base: Duration::from_millis(1),
        chunk_timeout: Duration::from_secs(5),
        database_path: dir.join("uploads.db"),
        ..UploadConfig::default()
    }
}

async fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    tokio::fs::write(&path, bytes).await.unwrap();
    path
}

fn upload_request(path: &Path) -> NewUpload {
    NewUpload {
        file_path: path.to_path_buf(),
        file_name: path.file_name().unwrap().to_string_lossy().to_string(),
        parent_folder_id: 42,
        user_id: 1,
        drive_id: 7,
        queue: None,
    }
}

async fn start_engine(
    config: UploadConfig,
    transport: Arc<MockTransport>,
) -> UploadScheduler {
    let store = TaskStore::open(&config.database_path).await.unwrap();
    UploadScheduler::start(config, store, transport)
        .await
        .unwrap()
}

async fn wait_for_status(
    rx: &mut broadcast::Receiver<UploadEvent>,
    task_id: &str,
    status: TaskStatus,
) {
    timeout(Duration::from_secs(10), async {
        loop {
            if let UploadEvent::TaskStatusChanged(change) = rx.recv().await.unwrap() {
                if change.task_id == task_id && change.status == status {
                    return;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {status:?}"));
}

async fn wait_done(scheduler: &UploadScheduler) {
    timeout(Duration::from_secs(10), scheduler.wait_for_completion())
        .await
        .expect("queue did not drain")
        .unwrap();
}

#[tokio::test]
async fn uploads_a_file_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(dir.path(), "report.bin", &[7u8; 32]).await;
    let transport = MockTransport::new();
    let scheduler = start_engine(test_config(dir.path()), transport.clone()).await;
    let mut events = scheduler.subscribe();

    let task_id = scheduler.enqueue(upload_request(&file)).await.unwrap();
    wait_for_status(&mut events, &task_id, TaskStatus::Completed).await;
    wait_done(&scheduler).await;

    // 32 bytes at 4 bytes per chunk.
    assert_eq!(transport.sent_indices(), (0..8).collect::<Vec<u64>>());
    assert_eq!(transport.finalized_sessions(), vec![task_id]);

    // Terminal success clears the persisted record.
    let store = TaskStore::open(&dir.path().join("uploads.db")).await.unwrap();
    assert!(store.load_resumable_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn transient_network_errors_are_retried_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(dir.path(), "photo.jpg", &[1u8; 8]).await;
    let transport = MockTransport::new();
    transport.script_failures(1, vec![network("reset"), network("reset")]);

    let mut config = test_config(dir.path());
    config.max_chunk_retries = 3;
    let scheduler = start_engine(config, transport.clone()).await;
    let mut events = scheduler.subscribe();

    let task_id = scheduler.enqueue(upload_request(&file)).await.unwrap();
    wait_for_status(&mut events, &task_id, TaskStatus::Completed).await;

    // Two failures then success on the third attempt.
    assert_eq!(transport.attempts_for(1), 3);
    assert_eq!(transport.finalized_sessions().len(), 1);
}

#[tokio::test]
async fn exhausted_retries_fail_the_task_and_retry_recovers_it() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(dir.path(), "notes.txt", &[2u8; 8]).await;
    let transport = MockTransport::new();
    // max_chunk_retries is 0, one network error kills the chunk.
    transport.script_failures(0, vec![network("unreachable")]);

    let scheduler = start_engine(test_config(dir.path()), transport.clone()).await;
    let mut events = scheduler.subscribe();

    let task_id = scheduler.enqueue(upload_request(&file)).await.unwrap();
    wait_for_status(&mut events, &task_id, TaskStatus::Failed).await;
    wait_done(&scheduler).await;

    // The record survives for retry.
    let store = TaskStore::open(&dir.path().join("uploads.db")).await.unwrap();
    let persisted = store.load_resumable_tasks().await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].status, TaskStatus::Failed);
    drop(store);

    scheduler.retry(&task_id).await.unwrap();
    wait_for_status(&mut events, &task_id, TaskStatus::Completed).await;
    assert_eq!(transport.finalized_sessions(), vec![task_id]);
}

#[tokio::test]
async fn fatal_remote_errors_are_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(dir.path(), "big.mov", &[3u8; 8]).await;
    let transport = MockTransport::new();
    transport.script_failures(
        0,
        vec![TransportError::Fatal {
            status: 403,
            message: "quota exceeded".to_string(),
        }],
    );

    let mut config = test_config(dir.path());
    config.max_chunk_retries = 5;
    let scheduler = start_engine(config, transport.clone()).await;
    let mut events = scheduler.subscribe();

    let task_id = scheduler.enqueue(upload_request(&file)).await.unwrap();

    let failure = timeout(Duration::from_secs(10), async {
        loop {
            if let UploadEvent::UploadFailed(failure) = events.recv().await.unwrap() {
                return failure;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(failure.task_id, task_id);
    assert_eq!(failure.parent_folder_id, 42);
    assert!(failure.reason.contains("quota exceeded"));
    // A fatal rejection is never retried.
    assert_eq!(transport.attempts_for(0), 1);
}

#[tokio::test]
async fn enqueue_rejects_missing_files() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = start_engine(test_config(dir.path()), MockTransport::new()).await;

    let missing = dir.path().join("not-there.bin");
    assert!(matches!(
        scheduler.enqueue(upload_request(&missing)).await,
        Err(UploadError::UnableToReadFileAttributes(_))
    ));
}

#[tokio::test]
async fn enqueue_rejects_empty_files() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(dir.path(), "empty.bin", &[]).await;
    let scheduler = start_engine(test_config(dir.path()), MockTransport::new()).await;

    assert!(matches!(
        scheduler.enqueue(upload_request(&file)).await,
        Err(UploadError::FileTooSmall)
    ));
}

#[tokio::test]
async fn cancel_discards_the_task_and_its_record() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(dir.path(), "slow.bin", &[4u8; 16]).await;
    let transport = MockTransport::with_delay(Duration::from_secs(2));
    let scheduler = start_engine(test_config(dir.path()), transport.clone()).await;
    let mut events = scheduler.subscribe();

    let task_id = scheduler.enqueue(upload_request(&file)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    scheduler.cancel(&task_id).await.unwrap();

    wait_for_status(&mut events, &task_id, TaskStatus::Cancelled).await;
    wait_done(&scheduler).await;

    let store = TaskStore::open(&dir.path().join("uploads.db")).await.unwrap();
    assert!(store.load_resumable_tasks().await.unwrap().is_empty());
    assert!(transport.finalized_sessions().is_empty());

    assert!(matches!(
        scheduler.cancel(&task_id).await,
        Err(UploadError::TaskNotFound(_))
    ));
}

#[tokio::test]
async fn suspend_leaves_no_chunk_in_flight_and_resume_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(dir.path(), "paused.bin", &[5u8; 16]).await;
    let transport = MockTransport::with_delay(Duration::from_millis(300));
    let scheduler = start_engine(test_config(dir.path()), transport.clone()).await;
    let mut events = scheduler.subscribe();

    let task_id = scheduler.enqueue(upload_request(&file)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    scheduler.suspend_all().await.unwrap();
    wait_for_status(&mut events, &task_id, TaskStatus::Paused).await;

    // The persisted record must be resumable: nothing stuck in-flight.
    let store = TaskStore::open(&dir.path().join("uploads.db")).await.unwrap();
    let persisted = store.load_resumable_tasks().await.unwrap();
    assert_eq!(persisted[0].status, TaskStatus::Paused);
    for chunk in &persisted[0].chunks {
        assert_ne!(chunk.status, ChunkStatus::InFlight);
    }
    drop(store);

    scheduler.resume_all().await.unwrap();
    wait_for_status(&mut events, &task_id, TaskStatus::Completed).await;
    assert_eq!(transport.finalized_sessions(), vec![task_id]);
}

#[tokio::test]
async fn rebuild_resumes_only_the_missing_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("uploads.db");
    // 20 bytes at 4 bytes per chunk: 5 chunks, 3 already uploaded.
    let file = write_file(dir.path(), "resume.bin", &[6u8; 20]).await;
    let (file_size, file_mtime) = file_byte_size(&file).await.unwrap();

    let ranges: Vec<DataRange> = (0..5).map(|i| DataRange::new(i * 4, i * 4 + 3)).collect();
    let chunks: Vec<ChunkState> = ranges
        .iter()
        .enumerate()
        .map(|(index, range)| {
            let mut chunk = ChunkState::new(index as u64, *range);
            if index < 3 {
                chunk.status = ChunkStatus::Uploaded {
                    remote_id: format!("remote-{index}"),
                };
            }
            chunk
        })
        .collect();
    let task = UploadTask {
        id: "restored-task".to_string(),
        file_path: file.clone(),
        file_name: "resume.bin".to_string(),
        file_size,
        file_mtime,
        user_id: 1,
        drive_id: 7,
        parent_folder_id: 42,
        queue: "global".to_string(),
        status: TaskStatus::Uploading,
        last_error: None,
        ranges,
        chunks,
        created_at: 1_700_000_000,
        updated_at: 1_700_000_000,
    };

    {
        let store = TaskStore::open(&db_path).await.unwrap();
        store.upsert_task(&task).await.unwrap();
    }

    // "Restart": fresh store, fresh scheduler.
    let transport = MockTransport::new();
    let scheduler = start_engine(test_config(dir.path()), transport.clone()).await;
    let mut events = scheduler.subscribe();

    let restored = scheduler.rebuild_from_persisted_state().await.unwrap();
    assert_eq!(restored, 1);

    wait_for_status(&mut events, "restored-task", TaskStatus::Completed).await;
    // Chunks 0..2 were already uploaded; only 3 and 4 go over the wire.
    assert_eq!(transport.sent_indices(), vec![3, 4]);
    assert_eq!(transport.finalized_sessions(), vec!["restored-task"]);
}

#[tokio::test]
async fn rebuild_fails_tasks_whose_file_disappeared() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("uploads.db");
    let task = UploadTask {
        id: "orphan".to_string(),
        file_path: dir.path().join("deleted.bin"),
        file_name: "deleted.bin".to_string(),
        file_size: 8,
        file_mtime: 1,
        user_id: 1,
        drive_id: 7,
        parent_folder_id: 42,
        queue: "global".to_string(),
        status: TaskStatus::Uploading,
        last_error: None,
        ranges: vec![DataRange::new(0, 7)],
        chunks: vec![ChunkState::new(0, DataRange::new(0, 7))],
        created_at: 1_700_000_000,
        updated_at: 1_700_000_000,
    };
    {
        let store = TaskStore::open(&db_path).await.unwrap();
        store.upsert_task(&task).await.unwrap();
    }

    let transport = MockTransport::new();
    let scheduler = start_engine(test_config(dir.path()), transport.clone()).await;
    let mut events = scheduler.subscribe();

    scheduler.rebuild_from_persisted_state().await.unwrap();
    wait_for_status(&mut events, "orphan", TaskStatus::Failed).await;
    assert!(transport.sent_indices().is_empty());
}

#[tokio::test]
async fn concurrency_stays_within_the_budget() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(dir.path(), "wide.bin", &[8u8; 64]).await;
    let transport = MockTransport::with_delay(Duration::from_millis(50));

    let config = test_config(dir.path());
    let store = TaskStore::open(&config.database_path).await.unwrap();
    let signals = updrive::SystemSignals {
        thermal_state: updrive::ThermalState::Nominal,
        low_power_mode: false,
        execution_context: updrive::ExecutionContext::ForegroundApp,
        active_processor_count: 4,
    };
    let scheduler = UploadScheduler::start_with_signals(config, store, transport.clone(), signals)
        .await
        .unwrap();
    let mut events = scheduler.subscribe();

    // 16 chunks, budget 4.
    let task_id = scheduler.enqueue(upload_request(&file)).await.unwrap();
    wait_for_status(&mut events, &task_id, TaskStatus::Completed).await;

    assert!(transport.max_running.load(Ordering::SeqCst) <= 4);
}

#[tokio::test]
async fn reschedule_tears_down_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(dir.path(), "resched.bin", &[9u8; 16]).await;
    let transport = MockTransport::with_delay(Duration::from_millis(100));
    let scheduler = start_engine(test_config(dir.path()), transport.clone()).await;
    let mut events = scheduler.subscribe();

    let task_id = scheduler.enqueue(upload_request(&file)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    // Memory pressure tears units down but keeps the task uploading.
    scheduler.memory_pressure_critical().await.unwrap();

    wait_for_status(&mut events, &task_id, TaskStatus::Completed).await;
    assert_eq!(transport.finalized_sessions(), vec![task_id]);
}
