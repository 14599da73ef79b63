//! Scheduler worker: exclusive owner of all task and queue state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::scheduler::{Command, NewUpload};
use crate::config::UploadConfig;
use crate::db::TaskStore;
use crate::error::UploadError;
use crate::events::{ChunkProgress, EventBus, TaskStatusChanged, UploadEvent, UploadFailed};
use crate::free_space::{FreeSpaceGuard, SpaceCheck};
use crate::parallelism::{ParallelismHeuristic, SystemSignals, SERIAL};
use crate::range::{build_ranges, file_byte_size};
use crate::task::{ChunkErrorKind, ChunkStatus, TaskStatus, UploadTask};
use crate::transfer::{ChunkOutcome, ChunkTransferUnit, TransferSettings};
use crate::transport::{ChunkTransport, RemoteFile, TransportError};

struct SubQueue {
    enabled: bool,
}

/// Parallelism granted to each active sub-queue: the global budget split
/// evenly, never below serial.
fn per_queue_parallelism(budget: usize, active_queues: usize) -> usize {
    if active_queues == 0 {
        SERIAL
    } else {
        (budget / active_queues).max(SERIAL)
    }
}

pub(crate) struct SchedulerWorker {
    config: UploadConfig,
    settings: TransferSettings,
    store: TaskStore,
    transport: Arc<dyn ChunkTransport>,
    guard: Arc<FreeSpaceGuard>,
    events: EventBus,
    heuristic: ParallelismHeuristic,
    budget_rx: watch::Receiver<usize>,
    budget: usize,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: Option<mpsc::Receiver<Command>>,
    tasks: HashMap<String, UploadTask>,
    queues: BTreeMap<String, SubQueue>,
    /// Cancellation token per running transfer unit, keyed by (task, chunk).
    in_flight: HashMap<(String, u64), CancellationToken>,
    finalizing: HashSet<String>,
    started_at: HashMap<String, Instant>,
    waiters: Vec<tokio::sync::oneshot::Sender<()>>,
    empty_queues: HashSet<String>,
    suspended: bool,
}

impl SchedulerWorker {
    pub(crate) fn new(
        config: UploadConfig,
        store: TaskStore,
        transport: Arc<dyn ChunkTransport>,
        events: EventBus,
        signals: SystemSignals,
        cmd_tx: mpsc::Sender<Command>,
        cmd_rx: mpsc::Receiver<Command>,
    ) -> Self {
        let guard = Arc::new(FreeSpaceGuard::new(&config.chunk_policy));
        let (heuristic, budget_rx) = ParallelismHeuristic::new(signals);
        let budget = heuristic.current();
        let settings = TransferSettings::from(&config);
        let queues: BTreeMap<String, SubQueue> = config
            .queues
            .iter()
            .map(|name| (name.clone(), SubQueue { enabled: true }))
            .collect();
        let empty_queues = queues.keys().cloned().collect();

        Self {
            config,
            settings,
            store,
            transport,
            guard,
            events,
            heuristic,
            budget_rx,
            budget,
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            tasks: HashMap::new(),
            queues,
            in_flight: HashMap::new(),
            finalizing: HashSet::new(),
            started_at: HashMap::new(),
            waiters: Vec::new(),
            empty_queues,
            suspended: false,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("scheduler_started: budget={}", self.budget);
        let mut cmd_rx = self.cmd_rx.take().expect("worker started twice");
        let mut budget_rx = self.budget_rx.clone();
        loop {
            tokio::select! {
                maybe_command = cmd_rx.recv() => match maybe_command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                changed = budget_rx.changed() => {
                    if changed.is_ok() {
                        self.budget = *budget_rx.borrow();
                        info!("budget_applied: value={}", self.budget);
                        self.fill_slots().await;
                    }
                }
            }
        }
        debug!("scheduler_stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue { request, respond } => {
                let result = self.enqueue(request).await;
                let _ = respond.send(result);
            }
            Command::Retry { task_id, respond } => {
                let result = self.retry(&task_id).await;
                let _ = respond.send(result);
            }
            Command::RetryAll {
                parent_folder_id,
                respond,
            } => {
                let ids: Vec<String> = self
                    .tasks
                    .values()
                    .filter(|t| {
                        t.parent_folder_id == parent_folder_id && t.status == TaskStatus::Failed
                    })
                    .map(|t| t.id.clone())
                    .collect();
                let mut retried = 0;
                for task_id in ids {
                    if self.retry(&task_id).await.is_ok() {
                        retried += 1;
                    }
                }
                let _ = respond.send(retried);
            }
            Command::Cancel { task_id, respond } => {
                let result = self.cancel(&task_id).await;
                let _ = respond.send(result);
            }
            Command::CancelAll {
                parent_folder_id,
                respond,
            } => {
                let ids: Vec<String> = self
                    .tasks
                    .values()
                    .filter(|t| t.parent_folder_id == parent_folder_id)
                    .map(|t| t.id.clone())
                    .collect();
                let mut cancelled = 0;
                for task_id in ids {
                    if self.cancel(&task_id).await.is_ok() {
                        cancelled += 1;
                    }
                }
                let _ = respond.send(cancelled);
            }
            Command::SuspendAll => self.suspend_all().await,
            Command::ResumeAll => self.resume_all().await,
            Command::RescheduleRunning => self.reschedule_running().await,
            Command::MemoryPressureCritical => {
                error!("memory_pressure: critical, rescheduling running uploads");
                self.reschedule_running().await;
            }
            Command::Rebuild { respond } => {
                let result = self.rebuild().await;
                let _ = respond.send(result);
            }
            Command::WaitForCompletion { respond } => self.waiters.push(respond),
            Command::SetQueueEnabled { queue, enabled } => {
                if let Some(sub_queue) = self.queues.get_mut(&queue) {
                    sub_queue.enabled = enabled;
                    info!("queue_toggled: {} enabled={}", queue, enabled);
                } else {
                    warn!("queue_toggle_unknown: {}", queue);
                }
            }
            Command::SignalsChanged(signals) => {
                // The heuristic publishes over the watch channel; the select
                // loop applies the new budget on its next turn.
                self.heuristic.signals_changed(signals);
            }
            Command::ChunkFinished {
                task_id,
                chunk_index,
                outcome,
            } => self.chunk_finished(task_id, chunk_index, outcome).await,
            Command::FinalizeFinished { task_id, result } => {
                self.finalize_finished(task_id, result).await
            }
        }

        self.fill_slots().await;
        self.refresh_queue_state();
        self.check_idle();
    }

    // MARK: enqueue / split

    async fn enqueue(&mut self, request: NewUpload) -> Result<String, UploadError> {
        if let SpaceCheck::Exhausted { available, required } =
            self.guard.check(&request.file_path)
        {
            return Err(UploadError::NotEnoughLocalSpace {
                available,
                required,
            });
        }

        let (file_size, file_mtime) = file_byte_size(&request.file_path).await?;
        if file_size == 0 {
            return Err(UploadError::FileTooSmall);
        }

        let queue = self.resolve_queue(request.queue.as_deref());
        let now = chrono::Utc::now().timestamp();
        let mut task = UploadTask {
            id: uuid::Uuid::new_v4().to_string(),
            file_path: request.file_path,
            file_name: request.file_name,
            file_size,
            file_mtime,
            user_id: request.user_id,
            drive_id: request.drive_id,
            parent_folder_id: request.parent_folder_id,
            queue,
            status: TaskStatus::Pending,
            last_error: None,
            ranges: Vec::new(),
            chunks: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        self.store.upsert_task(&task).await?;
        info!(
            "enqueue: {} file={} size={} queue={}",
            task.id, task.file_name, task.file_size, task.queue
        );
        self.emit_status(&task);

        self.split(&mut task).await;
        let task_id = task.id.clone();
        self.tasks.insert(task_id.clone(), task);
        Ok(task_id)
    }

    fn resolve_queue(&self, requested: Option<&str>) -> String {
        match requested {
            Some(name) if self.queues.contains_key(name) => name.to_string(),
            Some(name) => {
                warn!("enqueue_unknown_queue: {} falling back to default", name);
                self.config.default_queue().to_string()
            }
            None => self.config.default_queue().to_string(),
        }
    }

    /// Compute ranges and move the task into uploading, or fail it.
    async fn split(&mut self, task: &mut UploadTask) {
        task.try_transition(TaskStatus::Splitting);
        self.emit_status(task);

        match build_ranges(task.file_size, &self.config.chunk_policy) {
            Ok(ranges) => {
                debug!("split: {} chunks={}", task.id, ranges.len());
                task.attach_ranges(ranges);
                task.try_transition(TaskStatus::Uploading);
                if let Err(e) = self.store.upsert_task(task).await {
                    warn!("split_persist_failed: {} error={}", task.id, e);
                }
                self.emit_status(task);
            }
            Err(error) => {
                let reason = error.to_string();
                task.try_transition(TaskStatus::Failed);
                task.last_error = Some(reason.clone());
                if let Err(e) = self.store.upsert_task(task).await {
                    warn!("split_persist_failed: {} error={}", task.id, e);
                }
                error!("split_failed: {} error={}", task.id, reason);
                self.emit_status(task);
                self.emit_failed(task, reason);
            }
        }
    }

    // MARK: slot filling

    fn queue_is_active(&self, name: &str) -> bool {
        let Some(sub_queue) = self.queues.get(name) else {
            return false;
        };
        if !sub_queue.enabled {
            return false;
        }
        let has_startable = self.tasks.values().any(|t| {
            t.queue == name && t.status == TaskStatus::Uploading && t.next_not_started().is_some()
        });
        has_startable || self.running_in_queue(name) > 0
    }

    fn running_in_queue(&self, name: &str) -> usize {
        self.in_flight
            .keys()
            .filter(|(task_id, _)| {
                self.tasks
                    .get(task_id)
                    .map(|t| t.queue == name)
                    .unwrap_or(false)
            })
            .count()
    }

    /// Start transfer units until every active queue sits at its share of
    /// the budget. Lowering the budget never interrupts running units; they
    /// simply are not replaced.
    async fn fill_slots(&mut self) {
        if self.suspended {
            return;
        }

        let active: Vec<String> = self
            .queues
            .keys()
            .filter(|name| self.queue_is_active(name))
            .cloned()
            .collect();
        if active.is_empty() {
            return;
        }

        let limit = per_queue_parallelism(self.budget, active.len());
        for queue in active {
            let mut running = self.running_in_queue(&queue);
            while running < limit {
                let Some((task_id, chunk_index)) = self.next_startable_chunk(&queue) else {
                    break;
                };
                self.start_unit(task_id, chunk_index).await;
                running += 1;
            }
        }
    }

    /// Oldest task first, chunks in index order. A chunk whose previous
    /// unit is still winding down after cancellation is skipped until that
    /// unit has reported back, so no chunk ever has two units.
    fn next_startable_chunk(&self, queue: &str) -> Option<(String, u64)> {
        let mut candidates: Vec<&UploadTask> = self
            .tasks
            .values()
            .filter(|t| t.queue == queue && t.status == TaskStatus::Uploading)
            .collect();
        candidates.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        for task in candidates {
            for chunk in &task.chunks {
                if chunk.status == ChunkStatus::NotStarted
                    && !self.in_flight.contains_key(&(task.id.clone(), chunk.index))
                {
                    return Some((task.id.clone(), chunk.index));
                }
            }
        }
        None
    }

    async fn start_unit(&mut self, task_id: String, chunk_index: u64) {
        let now = chrono::Utc::now().timestamp();
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        let file_path = task.file_path.clone();
        let total_chunks = task.total_chunks();
        let Some(chunk) = task.chunk_mut(chunk_index) else {
            return;
        };
        chunk.status = ChunkStatus::InFlight;
        chunk.last_attempt_at = Some(now);
        let chunk_snapshot = chunk.clone();

        let token = CancellationToken::new();
        self.in_flight
            .insert((task_id.clone(), chunk_index), token.clone());
        self.started_at
            .entry(task_id.clone())
            .or_insert_with(Instant::now);

        if let Err(e) = self.store.update_chunk_state(&task_id, &chunk_snapshot).await {
            warn!("chunk_persist_failed: {} chunk={} error={}", task_id, chunk_index, e);
        }

        debug!("unit_start: {} chunk={}", task_id, chunk_index);
        let unit = ChunkTransferUnit {
            task_id: task_id.clone(),
            chunk_index,
            range: chunk_snapshot.range,
            file_path,
            total_chunks,
        };
        let transport = self.transport.clone();
        let settings = self.settings;
        let guard = self.guard.clone();
        let events = self.events.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let outcome = unit.run(transport, settings, guard, events, token).await;
            let _ = cmd_tx
                .send(Command::ChunkFinished {
                    task_id,
                    chunk_index,
                    outcome,
                })
                .await;
        });
    }

    // MARK: chunk completion

    async fn chunk_finished(&mut self, task_id: String, chunk_index: u64, outcome: ChunkOutcome) {
        self.in_flight.remove(&(task_id.clone(), chunk_index));
        if !self.tasks.contains_key(&task_id) {
            // Task was cancelled and archived while the unit was running.
            return;
        }

        let now = chrono::Utc::now().timestamp();
        match outcome {
            ChunkOutcome::Uploaded { remote_id, retries } => {
                let (progress, finalize) = {
                    let task = self.tasks.get_mut(&task_id).expect("checked above");
                    if let Some(chunk) = task.chunk_mut(chunk_index) {
                        chunk.status = ChunkStatus::Uploaded { remote_id };
                        chunk.retry_count = retries;
                        chunk.last_attempt_at = Some(now);
                    }
                    let uploaded = task.uploaded_bytes();
                    let progress = ChunkProgress {
                        task_id: task_id.clone(),
                        chunk_index,
                        uploaded_bytes: uploaded,
                        total_bytes: task.file_size,
                        speed: 0.0,
                    };
                    (progress, task.can_finalize())
                };
                self.persist_chunk(&task_id, chunk_index).await;

                let elapsed = self
                    .started_at
                    .get(&task_id)
                    .map(|t| t.elapsed().as_secs_f64())
                    .unwrap_or_default();
                let mut progress = progress;
                if elapsed > 0.0 {
                    progress.speed = progress.uploaded_bytes as f64 / elapsed;
                }
                self.events.emit(UploadEvent::ChunkProgress(progress));

                if finalize {
                    self.start_finalize(&task_id).await;
                }
            }
            ChunkOutcome::NetworkFailed { retries, message } => {
                self.mark_chunk_failed(&task_id, chunk_index, ChunkErrorKind::Network, retries, now)
                    .await;
                self.fail_task(&task_id, message).await;
            }
            ChunkOutcome::Fatal { status, message } => {
                self.mark_chunk_failed(&task_id, chunk_index, ChunkErrorKind::Fatal, 0, now)
                    .await;
                self.fail_task(&task_id, format!("{status} {message}")).await;
            }
            ChunkOutcome::Io { message } => {
                self.mark_chunk_failed(&task_id, chunk_index, ChunkErrorKind::Io, 0, now)
                    .await;
                self.fail_task(&task_id, message).await;
            }
            ChunkOutcome::SpaceExhausted { available, required } => {
                warn!(
                    "task_paused_no_space: {} available={} required={}",
                    task_id, available, required
                );
                self.events
                    .emit(UploadEvent::LowLocalSpace { available });
                self.reset_chunk(&task_id, chunk_index).await;
                self.pause_task(&task_id).await;
            }
            ChunkOutcome::Cancelled => {
                self.reset_chunk(&task_id, chunk_index).await;
            }
        }
    }

    async fn mark_chunk_failed(
        &mut self,
        task_id: &str,
        chunk_index: u64,
        kind: ChunkErrorKind,
        retries: u32,
        now: i64,
    ) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            if let Some(chunk) = task.chunk_mut(chunk_index) {
                chunk.status = ChunkStatus::Failed { kind };
                chunk.retry_count = retries;
                chunk.last_attempt_at = Some(now);
            }
        }
        self.persist_chunk(task_id, chunk_index).await;
    }

    /// A cancelled or displaced unit must never leave its chunk in-flight.
    async fn reset_chunk(&mut self, task_id: &str, chunk_index: u64) {
        let mut changed = false;
        if let Some(task) = self.tasks.get_mut(task_id) {
            if let Some(chunk) = task.chunk_mut(chunk_index) {
                if chunk.status == ChunkStatus::InFlight {
                    chunk.status = ChunkStatus::NotStarted;
                    changed = true;
                }
            }
        }
        if changed {
            self.persist_chunk(task_id, chunk_index).await;
        }
    }

    async fn persist_chunk(&self, task_id: &str, chunk_index: u64) {
        let Some(chunk) = self
            .tasks
            .get(task_id)
            .and_then(|task| task.chunks.get(chunk_index as usize))
        else {
            return;
        };
        if let Err(e) = self.store.update_chunk_state(task_id, chunk).await {
            warn!(
                "chunk_persist_failed: {} chunk={} error={}",
                task_id, chunk_index, e
            );
        }
    }

    // MARK: task transitions

    async fn fail_task(&mut self, task_id: &str, reason: String) {
        self.cancel_units_of(task_id);
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        if task.status.is_terminal() {
            return;
        }
        task.try_transition(TaskStatus::Failed);
        task.last_error = Some(reason.clone());
        error!("task_failed: {} error={}", task_id, reason);

        if let Err(e) = self
            .store
            .update_task_status(task_id, TaskStatus::Failed, Some(&reason))
            .await
        {
            warn!("status_persist_failed: {} error={}", task_id, e);
        }
        self.started_at.remove(task_id);

        let task = self.tasks.get(task_id).expect("just updated");
        self.emit_status(task);
        let task = task.clone();
        self.emit_failed(&task, reason);
    }

    async fn pause_task(&mut self, task_id: &str) {
        self.cancel_units_of(task_id);
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        if task.status != TaskStatus::Uploading {
            return;
        }
        task.reset_in_flight();
        task.try_transition(TaskStatus::Paused);
        if let Err(e) = self.store.upsert_task(task).await {
            warn!("status_persist_failed: {} error={}", task_id, e);
        }
        let task = self.tasks.get(task_id).expect("just updated");
        self.emit_status(task);
    }

    fn cancel_units_of(&self, task_id: &str) {
        for ((unit_task, _), token) in &self.in_flight {
            if unit_task == task_id {
                token.cancel();
            }
        }
    }

    // MARK: finalize

    async fn start_finalize(&mut self, task_id: &str) {
        let Some(task) = self.tasks.get(task_id) else {
            return;
        };
        if !self.finalizing.insert(task_id.to_string()) {
            return;
        }
        info!("finalize_start: {} chunks={}", task_id, task.total_chunks());
        let total_chunks = task.total_chunks();
        let session_id = task.id.clone();
        let transport = self.transport.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = transport.finalize(&session_id, total_chunks).await;
            let _ = cmd_tx
                .send(Command::FinalizeFinished {
                    task_id: session_id,
                    result,
                })
                .await;
        });
    }

    async fn finalize_finished(
        &mut self,
        task_id: String,
        result: Result<RemoteFile, TransportError>,
    ) {
        self.finalizing.remove(&task_id);
        match result {
            Ok(remote_file) => {
                let Some(task) = self.tasks.get_mut(&task_id) else {
                    return;
                };
                task.try_transition(TaskStatus::Completed);
                info!(
                    "upload_complete: {} remote_id={} size={}",
                    task_id, remote_file.remote_id, task.file_size
                );
                let task = self.tasks.remove(&task_id).expect("present");
                self.started_at.remove(&task_id);
                // Terminal success: the persisted record has served its
                // purpose.
                if let Err(e) = self.store.delete_task(&task_id).await {
                    warn!("record_cleanup_failed: {} error={}", task_id, e);
                }
                self.emit_status(&task);
            }
            Err(error) => {
                let reason = format!("finalize failed: {error}");
                self.fail_task(&task_id, reason).await;
            }
        }
    }

    // MARK: global control

    async fn suspend_all(&mut self) {
        info!("suspend_all: in_flight={}", self.in_flight.len());
        self.suspended = true;
        for token in self.in_flight.values() {
            token.cancel();
        }
        let ids: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Uploading)
            .map(|t| t.id.clone())
            .collect();
        for task_id in ids {
            self.pause_task(&task_id).await;
        }
    }

    async fn resume_all(&mut self) {
        info!("resume_all");
        self.suspended = false;
        let ids: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Paused)
            .map(|t| t.id.clone())
            .collect();
        for task_id in ids {
            let Some(task) = self.tasks.get_mut(&task_id) else {
                continue;
            };
            task.try_transition(TaskStatus::Uploading);
            if let Err(e) = self
                .store
                .update_task_status(&task_id, TaskStatus::Uploading, None)
                .await
            {
                warn!("status_persist_failed: {} error={}", task_id, e);
            }
            let task = self.tasks.get(&task_id).expect("just updated");
            let finalize = task.can_finalize();
            self.emit_status(task);
            if finalize {
                // Everything was already uploaded when the pause hit.
                self.start_finalize(&task_id).await;
            }
        }
    }

    /// Tear down running units so no chunk is left ambiguously in-flight.
    /// Tasks stay in uploading; units are restarted on the next fill.
    async fn reschedule_running(&mut self) {
        info!("reschedule_running: in_flight={}", self.in_flight.len());
        for token in self.in_flight.values() {
            token.cancel();
        }
        let ids: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Uploading && t.in_flight_count() > 0)
            .map(|t| t.id.clone())
            .collect();
        for task_id in ids {
            let Some(task) = self.tasks.get_mut(&task_id) else {
                continue;
            };
            task.reset_in_flight();
            let task_snapshot = task.clone();
            if let Err(e) = self.store.upsert_task(&task_snapshot).await {
                warn!("status_persist_failed: {} error={}", task_id, e);
            }
        }
    }

    // MARK: retry / cancel

    async fn retry(&mut self, task_id: &str) -> Result<(), UploadError> {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return Err(UploadError::TaskNotFound(task_id.to_string()));
        };
        if task.status != TaskStatus::Failed {
            return Ok(());
        }

        info!("retry: {}", task_id);
        task.last_error = None;
        if task.ranges.is_empty() {
            // Failed before or during splitting; run the split again.
            let mut task = self.tasks.remove(task_id).expect("present");
            task.status = TaskStatus::Pending;
            self.split(&mut task).await;
            self.tasks.insert(task_id.to_string(), task);
            return Ok(());
        }

        task.reset_failed();
        task.try_transition(TaskStatus::Uploading);
        let snapshot = task.clone();
        let finalize = snapshot.can_finalize();
        if let Err(e) = self.store.upsert_task(&snapshot).await {
            warn!("status_persist_failed: {} error={}", task_id, e);
        }
        self.emit_status(&snapshot);
        if finalize {
            self.start_finalize(task_id).await;
        }
        Ok(())
    }

    async fn cancel(&mut self, task_id: &str) -> Result<(), UploadError> {
        if !self.tasks.contains_key(task_id) {
            return Err(UploadError::TaskNotFound(task_id.to_string()));
        }
        self.cancel_units_of(task_id);
        let mut task = self.tasks.remove(task_id).expect("checked above");
        task.try_transition(TaskStatus::Cancelled);
        info!("cancel: {}", task_id);
        self.started_at.remove(task_id);
        if let Err(e) = self.store.delete_task(task_id).await {
            warn!("record_cleanup_failed: {} error={}", task_id, e);
        }
        self.emit_status(&task);
        Ok(())
    }

    // MARK: rebuild

    /// Restore persisted tasks after a restart, re-uploading only chunks
    /// that never made it.
    async fn rebuild(&mut self) -> Result<usize, UploadError> {
        let loaded = self.store.load_resumable_tasks().await?;
        let mut restored = 0;
        for mut task in loaded {
            if self.tasks.contains_key(&task.id) {
                continue;
            }

            match file_byte_size(&task.file_path).await {
                Ok((size, mtime)) if size == task.file_size && mtime == task.file_mtime => {}
                Ok((size, mtime)) => {
                    // The file changed under us; uploaded chunks are stale.
                    info!(
                        "rebuild_file_changed: {} size={}->{} restarting",
                        task.id, task.file_size, size
                    );
                    task.file_size = size;
                    task.file_mtime = mtime;
                    task.ranges.clear();
                    task.chunks.clear();
                    task.status = TaskStatus::Pending;
                }
                Err(error) => {
                    let reason = format!("source file unavailable: {error}");
                    warn!("rebuild_file_missing: {} error={}", task.id, reason);
                    task.status = TaskStatus::Failed;
                    task.last_error = Some(reason.clone());
                    if let Err(e) = self
                        .store
                        .update_task_status(&task.id, TaskStatus::Failed, Some(&reason))
                        .await
                    {
                        warn!("status_persist_failed: {} error={}", task.id, e);
                    }
                    self.emit_status(&task);
                    self.emit_failed(&task, reason);
                    self.tasks.insert(task.id.clone(), task);
                    continue;
                }
            }

            if matches!(task.status, TaskStatus::Pending | TaskStatus::Splitting) {
                task.status = TaskStatus::Pending;
                self.split(&mut task).await;
            }

            debug!(
                "rebuild_task: {} status={} uploaded={}/{}",
                task.id,
                task.status,
                task.chunks.len() - task.chunks.iter().filter(|c| c.status == ChunkStatus::NotStarted).count(),
                task.chunks.len()
            );
            self.tasks.insert(task.id.clone(), task);
            restored += 1;
        }
        info!("rebuild: restored={}", restored);
        Ok(restored)
    }

    // MARK: events / idle tracking

    fn emit_status(&self, task: &UploadTask) {
        self.events
            .emit(UploadEvent::TaskStatusChanged(TaskStatusChanged {
                task_id: task.id.clone(),
                status: task.status,
                error: task.last_error.clone(),
            }));
    }

    fn emit_failed(&self, task: &UploadTask, reason: String) {
        self.events.emit(UploadEvent::UploadFailed(UploadFailed {
            task_id: task.id.clone(),
            file_name: task.file_name.clone(),
            parent_folder_id: task.parent_folder_id,
            reason,
        }));
    }

    fn queue_has_work(&self, name: &str) -> bool {
        self.tasks.values().any(|t| {
            t.queue == name
                && matches!(
                    t.status,
                    TaskStatus::Pending | TaskStatus::Splitting | TaskStatus::Uploading
                )
        }) || self.running_in_queue(name) > 0
    }

    fn refresh_queue_state(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            if self.queue_has_work(&name) {
                self.empty_queues.remove(&name);
            } else if self.empty_queues.insert(name.clone()) {
                self.events.emit(UploadEvent::QueueEmpty { queue: name });
            }
        }
    }

    fn active_work_exists(&self) -> bool {
        !self.in_flight.is_empty()
            || !self.finalizing.is_empty()
            || self.tasks.values().any(|t| {
                matches!(
                    t.status,
                    TaskStatus::Pending | TaskStatus::Splitting | TaskStatus::Uploading
                )
            })
    }

    fn check_idle(&mut self) {
        if self.active_work_exists() {
            return;
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::per_queue_parallelism;

    #[test]
    fn one_active_queue_takes_the_whole_budget() {
        assert_eq!(per_queue_parallelism(8, 1), 8);
    }

    #[test]
    fn two_active_queues_split_evenly() {
        assert_eq!(per_queue_parallelism(8, 2), 4);
        assert_eq!(per_queue_parallelism(8, 3), 2);
    }

    #[test]
    fn share_never_drops_below_serial() {
        assert_eq!(per_queue_parallelism(1, 2), 1);
        assert_eq!(per_queue_parallelism(0, 3), 1);
        assert_eq!(per_queue_parallelism(2, 0), 1);
    }
}
