use super::*;

/// How often the coordinator looks for timed-out checkpoints.
const EXPIRY_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Coordinator thread name, also used as the task label of its errors.
const COORDINATOR: &str = "checkpoint-coordinator";

#[derive(Debug, Default)]
struct CheckpointLog {
    completed: Vec<CheckpointId>,
    failed: Vec<CheckpointId>,
    final_checkpoint: Option<CheckpointId>,
    finished: bool,
}

/// Progress shared between the tasks, the coordinator and the job handle.
#[derive(Debug, Default)]
pub(crate) struct JobProgress {
    pub records_read: AtomicU64,
    pub records_written: AtomicU64,
    pub cancelled: AtomicBool,
    checkpoints: Mutex<CheckpointLog>,
    checkpoint_changed: Condvar,
    failed_task: Mutex<Option<TaskId>>,
}

impl JobProgress {
    pub fn is_final_checkpoint(&self, checkpoint_id: CheckpointId) -> bool {
        self.checkpoints
            .lock()
            .map(|log| log.final_checkpoint == Some(checkpoint_id))
            .unwrap_or(false)
    }

    /// The checkpoint after which the source ends the stream.
    pub(super) fn mark_final(&self, checkpoint_id: CheckpointId) -> Result<()> {
        self.update_log(|log| log.final_checkpoint = Some(checkpoint_id))
    }

    fn update_log(&self, f: impl FnOnce(&mut CheckpointLog)) -> Result<()> {
        let mut log = self
            .checkpoints
            .lock()
            .map_err(|_| anyhow!("checkpoint log lock poisoned"))?;
        f(&mut log);
        self.checkpoint_changed.notify_all();
        Ok(())
    }

    fn completed(&self) -> Vec<CheckpointId> {
        self.checkpoints
            .lock()
            .map(|log| log.completed.clone())
            .unwrap_or_default()
    }

    /// Remember the first task that failed. Failures caused by a
    /// cancellation are not recorded.
    fn record_task_failure(&self, task_id: TaskId) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(mut failed) = self.failed_task.lock() {
            failed.get_or_insert(task_id);
        }
    }

    fn failed_task(&self) -> Option<TaskId> {
        self.failed_task.lock().ok().and_then(|failed| *failed)
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Drives checkpoints for one job: triggers them on the policy interval,
/// collects task acks, persists completed checkpoints and tells the tasks
/// to commit.
struct CoordinatorLoop {
    job_name: String,
    coordinator: CheckpointCoordinator,
    policy: Option<CheckpointPolicy>,
    events: Receiver<CoordinatorEvent>,
    source_control: Sender<TaskControl>,
    operator_control: Sender<TaskControl>,
    progress: Arc<JobProgress>,
    running_tasks: HashSet<TaskId>,
    in_flight: Option<CheckpointId>,
    end_of_input: bool,
    final_checkpoint: Option<CheckpointId>,
    waiting_triggers: VecDeque<Sender<Result<CheckpointId, String>>>,
}

impl CoordinatorLoop {
    fn run(mut self) -> Result<(), PipelineError> {
        let (interval, expiry) = match &self.policy {
            Some(policy) => (tick(policy.interval()), tick(EXPIRY_CHECK_INTERVAL)),
            None => (never(), never()),
        };
        tracing::info!(
            job = %self.job_name,
            interval_ms = self.policy.as_ref().map(CheckpointPolicy::interval_ms),
            "checkpoint coordinator started"
        );

        let events = self.events.clone();
        loop {
            let flow = select! {
                recv(interval) -> _ => self.on_interval()?,
                recv(expiry) -> _ => self.abort_expired()?,
                recv(events) -> event => match event {
                    Ok(event) => self.on_event(event)?,
                    Err(_) => Flow::Stop,
                },
            };
            if let Flow::Stop = flow {
                return Ok(());
            }
        }
    }

    fn on_interval(&mut self) -> Result<Flow, PipelineError> {
        if let Some(checkpoint_id) = self.in_flight {
            tracing::debug!(checkpoint_id, "checkpoint still in flight; skipping tick");
        } else if !self.end_of_input {
            self.trigger(false)?;
        }
        Ok(Flow::Continue)
    }

    fn abort_expired(&mut self) -> Result<Flow, PipelineError> {
        let Some(policy) = &self.policy else {
            return Ok(Flow::Continue);
        };
        let expired = self
            .coordinator
            .abort_expired(policy.timeout)
            .map_err(coordinator_error)?;
        for checkpoint_id in expired {
            if self.in_flight == Some(checkpoint_id) {
                self.on_failed(checkpoint_id, "checkpoint timed out".to_string())?;
            }
        }
        Ok(Flow::Continue)
    }

    fn on_event(&mut self, event: CoordinatorEvent) -> Result<Flow, PipelineError> {
        match event {
            CoordinatorEvent::Checkpoint(TaskCheckpointEvent::Ack(ack)) => {
                let checkpoint_id = ack.checkpoint_id;
                let task_id = ack.task_id;
                if self.in_flight != Some(checkpoint_id) {
                    tracing::debug!(checkpoint_id, %task_id, "ignoring late checkpoint ack");
                    return Ok(Flow::Continue);
                }
                match self.coordinator.acknowledge_checkpoint(ack) {
                    Ok(true) => self.on_completed(checkpoint_id)?,
                    Ok(false) => {}
                    Err(err) => {
                        let reason = format!("{err:#}");
                        // Finalization failures already removed the checkpoint.
                        let aborted = self
                            .coordinator
                            .abort_checkpoint(checkpoint_id, task_id, &reason);
                        if let Err(abort_err) = aborted {
                            tracing::warn!(checkpoint_id, "failed to abort checkpoint: {abort_err:#}");
                        }
                        self.on_failed(checkpoint_id, reason)?;
                    }
                }
            }
            CoordinatorEvent::Checkpoint(TaskCheckpointEvent::Aborted(abort)) => {
                if self.in_flight == Some(abort.checkpoint_id) {
                    self.coordinator
                        .abort_checkpoint(abort.checkpoint_id, abort.task_id, &abort.reason)
                        .map_err(coordinator_error)?;
                    self.on_failed(abort.checkpoint_id, abort.reason)?;
                }
            }
            CoordinatorEvent::EndOfInput => {
                self.end_of_input = true;
                if self.in_flight.is_none() {
                    self.trigger(true)?;
                }
            }
            CoordinatorEvent::TriggerCheckpoint(reply) => self.on_manual_trigger(reply)?,
            CoordinatorEvent::TaskFinished(task_id) => {
                self.running_tasks.remove(&task_id);
                if self.running_tasks.is_empty() {
                    self.progress
                        .update_log(|log| log.finished = true)
                        .map_err(coordinator_error)?;
                    tracing::info!(job = %self.job_name, "all tasks finished");
                    return Ok(Flow::Stop);
                }
            }
            CoordinatorEvent::TaskFailed(task_id) => {
                tracing::error!(job = %self.job_name, %task_id, "task failed; cancelling job");
                self.cancel_tasks();
                return Ok(Flow::Stop);
            }
            CoordinatorEvent::Cancel => {
                tracing::info!(job = %self.job_name, "job cancelled");
                self.cancel_tasks();
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    fn on_manual_trigger(
        &mut self,
        reply: Sender<Result<CheckpointId, String>>,
    ) -> Result<(), PipelineError> {
        if self.policy.is_none() {
            let _ = reply.send(Err("checkpointing is not enabled".to_string()));
        } else if self.end_of_input {
            let _ = reply.send(Err("job reached end of input".to_string()));
        } else if self.in_flight.is_some() {
            self.waiting_triggers.push_back(reply);
        } else {
            let checkpoint_id = self.trigger(false)?;
            let _ = reply.send(Ok(checkpoint_id));
        }
        Ok(())
    }

    fn trigger(&mut self, is_final: bool) -> Result<CheckpointId, PipelineError> {
        let barrier = self
            .coordinator
            .trigger_checkpoint(wall_clock_millis(), vec![SOURCE_TASK, OPERATOR_TASK])
            .map_err(coordinator_error)?;
        let checkpoint_id = barrier.checkpoint_id;
        if is_final {
            self.final_checkpoint = Some(checkpoint_id);
            self.progress
                .mark_final(checkpoint_id)
                .map_err(coordinator_error)?;
        }
        self.in_flight = Some(checkpoint_id);
        tracing::debug!(checkpoint_id, is_final, "checkpoint triggered");
        if self
            .source_control
            .send(TaskControl::TriggerCheckpoint(barrier))
            .is_err()
        {
            // The task's exit event follows; the timeout covers the rest.
            tracing::warn!(checkpoint_id, "source task is gone; trigger not delivered");
        }
        Ok(checkpoint_id)
    }

    fn on_completed(&mut self, checkpoint_id: CheckpointId) -> Result<(), PipelineError> {
        self.in_flight = None;
        self.coordinator.record_success();
        for control in [&self.source_control, &self.operator_control] {
            let _ = control.send(TaskControl::CheckpointComplete(checkpoint_id));
        }
        self.progress
            .update_log(|log| log.completed.push(checkpoint_id))
            .map_err(coordinator_error)?;
        tracing::info!(job = %self.job_name, checkpoint_id, "checkpoint completed");
        self.after_checkpoint()
    }

    fn on_failed(&mut self, checkpoint_id: CheckpointId, reason: String) -> Result<(), PipelineError> {
        self.in_flight = None;
        self.progress
            .update_log(|log| log.failed.push(checkpoint_id))
            .map_err(coordinator_error)?;
        if self.final_checkpoint == Some(checkpoint_id) {
            self.fail_job();
            return Err(PipelineError::CheckpointFailure {
                checkpoint_id,
                reason,
            });
        }
        if let Err(err) = self.coordinator.record_failure(checkpoint_id, &reason) {
            self.fail_job();
            return Err(err);
        }
        self.after_checkpoint()
    }

    /// Start what waited for the in-flight checkpoint to finish.
    fn after_checkpoint(&mut self) -> Result<(), PipelineError> {
        if self.end_of_input {
            if self.final_checkpoint.is_none() {
                self.trigger(true)?;
            }
            for reply in self.waiting_triggers.drain(..) {
                let _ = reply.send(Err("job reached end of input".to_string()));
            }
        } else if let Some(reply) = self.waiting_triggers.pop_front() {
            let checkpoint_id = self.trigger(false)?;
            let _ = reply.send(Ok(checkpoint_id));
        }
        Ok(())
    }

    fn fail_job(&self) {
        tracing::error!(job = %self.job_name, "checkpointing failed; cancelling job");
        self.cancel_tasks();
    }

    fn cancel_tasks(&self) {
        self.progress.cancelled.store(true, Ordering::SeqCst);
        for control in [&self.source_control, &self.operator_control] {
            let _ = control.send(TaskControl::Cancel);
        }
        // Wake checkpoint waiters.
        let _ = self.progress.update_log(|_| {});
    }
}

fn coordinator_error(err: anyhow::Error) -> PipelineError {
    PipelineError::from_anyhow(COORDINATOR, err)
}

fn startup_error(err: anyhow::Error) -> PipelineError {
    match err.downcast::<PipelineError>() {
        Ok(typed) => typed,
        Err(other) => PipelineError::RuntimeStartup(other),
    }
}

fn wall_clock_millis() -> EventTime {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as EventTime)
        .unwrap_or_default()
}

/// Summary of a job that ran to completion or was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_name: String,
    pub records_read: u64,
    pub records_written: u64,
    pub completed_checkpoints: Vec<CheckpointId>,
    /// Checkpoint the job resumed from.
    pub restored_from: Option<CheckpointId>,
    pub cancelled: bool,
}

/// Handle to a running job.
pub struct JobHandle {
    job_name: String,
    events: Sender<CoordinatorEvent>,
    progress: Arc<JobProgress>,
    restored_from: Option<CheckpointId>,
    coordinator: JoinHandle<Result<(), PipelineError>>,
    tasks: Vec<(TaskId, JoinHandle<Result<()>>)>,
}

impl JobHandle {
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn restored_from(&self) -> Option<CheckpointId> {
        self.restored_from
    }

    /// Trigger a checkpoint now. If one is in flight, the new one starts
    /// after it finishes.
    pub fn trigger_checkpoint(&self) -> Result<CheckpointId> {
        let (reply_tx, reply_rx) = unbounded();
        self.events
            .send(CoordinatorEvent::TriggerCheckpoint(reply_tx))
            .map_err(|_| anyhow!("job {} is no longer running", self.job_name))?;
        reply_rx
            .recv()
            .map_err(|_| anyhow!("job {} stopped before the checkpoint started", self.job_name))?
            .map_err(|reason| anyhow!(reason))
    }

    /// Block until `checkpoint_id` completed. Returns `false` if it failed,
    /// the job finished without it or `timeout` elapsed.
    pub fn wait_for_checkpoint(&self, checkpoint_id: CheckpointId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(mut log) = self.progress.checkpoints.lock() else {
            return false;
        };
        loop {
            if log.completed.contains(&checkpoint_id) {
                return true;
            }
            if log.failed.contains(&checkpoint_id)
                || log.finished
                || self.progress.cancelled.load(Ordering::SeqCst)
            {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            log = match self.progress.checkpoint_changed.wait_timeout(log, deadline - now) {
                Ok((log, _)) => log,
                Err(_) => return false,
            };
        }
    }

    pub fn completed_checkpoints(&self) -> Vec<CheckpointId> {
        self.progress.completed()
    }

    pub fn records_read(&self) -> u64 {
        self.progress.records_read.load(Ordering::SeqCst)
    }

    pub fn records_written(&self) -> u64 {
        self.progress.records_written.load(Ordering::SeqCst)
    }

    /// Stop the job. Open transactions are aborted by the next run.
    pub fn cancel(&self) {
        let _ = self.events.send(CoordinatorEvent::Cancel);
    }

    /// Wait for the job to end.
    ///
    /// A checkpointing failure takes precedence; otherwise the error of the
    /// first task that failed is returned.
    pub fn join(self) -> Result<JobOutcome, PipelineError> {
        let coordinator_result = self.coordinator.join().unwrap_or_else(|_| {
            Err(PipelineError::TaskFailure {
                task: COORDINATOR.to_string(),
                source: anyhow!("coordinator thread panicked"),
            })
        });

        let mut task_errors = Vec::new();
        for (task_id, handle) in self.tasks {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(anyhow!("task thread panicked")));
            if let Err(err) = result {
                task_errors.push((task_id, err));
            }
        }

        coordinator_result?;
        if let Some(failed) = self.progress.failed_task() {
            if let Some(index) = task_errors.iter().position(|(task_id, _)| *task_id == failed) {
                let (task_id, err) = task_errors.swap_remove(index);
                return Err(PipelineError::from_anyhow(task_id.to_string(), err));
            }
        }

        let cancelled = self.progress.cancelled.load(Ordering::SeqCst);
        let outcome = JobOutcome {
            job_name: self.job_name,
            records_read: self.progress.records_read.load(Ordering::SeqCst),
            records_written: self.progress.records_written.load(Ordering::SeqCst),
            completed_checkpoints: self.progress.completed(),
            restored_from: self.restored_from,
            cancelled,
        };
        tracing::info!(
            job = %outcome.job_name,
            records_read = outcome.records_read,
            records_written = outcome.records_written,
            checkpoints = outcome.completed_checkpoints.len(),
            cancelled,
            "job finished"
        );
        Ok(outcome)
    }
}

/// Start a pipeline: initialize the state backend, restore the latest
/// completed checkpoint and spawn the source task, the operator task and the
/// checkpoint coordinator.
pub fn launch<IN, OUT>(graph: PipelineGraph<IN, OUT>) -> Result<JobHandle, PipelineError>
where
    IN: Send + 'static,
    OUT: Send + 'static,
{
    let PipelineGraph {
        job_name,
        mut source,
        mut transform,
        mut sink,
        backend,
        policy,
        channel_capacity,
    } = graph;

    if sink.guarantee() == DeliveryGuarantee::ExactlyOnce
        && policy.as_ref().map(CheckpointPolicy::mode) != Some(CheckpointingMode::ExactlyOnce)
    {
        return Err(PipelineError::RuntimeStartup(anyhow!(
            "exactly-once sink on {} requires exactly-once checkpointing",
            sink.topic()
        )));
    }

    backend
        .initialize()
        .map_err(|source| PipelineError::BackendConstruction {
            backend: backend.name(),
            source,
        })?;

    let mut coordinator = CheckpointCoordinator::new(Arc::clone(&backend));
    if let Some(policy) = &policy {
        coordinator = coordinator
            .with_retained_checkpoints(policy.retained_checkpoints)
            .with_tolerable_failures(policy.tolerable_failures);
    }

    let restored = coordinator.restore_latest().map_err(startup_error)?;
    let restored_from = match &restored {
        Some(checkpoint) => {
            source
                .restore_state(checkpoint.task_state(SOURCE_TASK).map_err(startup_error)?)
                .map_err(startup_error)?;
            let operator: OperatorSnapshot =
                bincode::deserialize(checkpoint.task_state(OPERATOR_TASK).map_err(startup_error)?)
                    .context("deserialize operator snapshot failed")
                    .map_err(startup_error)?;
            transform
                .restore_state(&operator.transform)
                .map_err(startup_error)?;
            sink.initialize(Some(&operator.sink)).map_err(startup_error)?;
            tracing::info!(
                job = %job_name,
                checkpoint_id = checkpoint.checkpoint_id(),
                backend = backend.name(),
                "restored from checkpoint"
            );
            Some(checkpoint.checkpoint_id())
        }
        None => {
            sink.initialize(None).map_err(startup_error)?;
            None
        }
    };

    let progress = Arc::new(JobProgress::default());
    let (events_tx, events_rx) = unbounded();
    let (source_control_tx, source_control_rx) = unbounded();
    let (operator_control_tx, operator_control_rx) = unbounded();
    let (data_tx, data_rx) = local_channel(channel_capacity.max(1));

    let mut source_task = SourceTask {
        source,
        output: data_tx,
        control: source_control_rx,
        events: events_tx.clone(),
        progress: Arc::clone(&progress),
        checkpointing: policy.is_some(),
    };
    let mut operator_task = OperatorTask {
        input: data_rx,
        transform,
        sink,
        control: operator_control_rx,
        events: events_tx.clone(),
        progress: Arc::clone(&progress),
        output_buffer: Vec::new(),
    };

    let coordinator_loop = CoordinatorLoop {
        job_name: job_name.clone(),
        coordinator,
        policy,
        events: events_rx,
        source_control: source_control_tx,
        operator_control: operator_control_tx,
        progress: Arc::clone(&progress),
        running_tasks: [SOURCE_TASK, OPERATOR_TASK].into_iter().collect(),
        in_flight: None,
        end_of_input: false,
        final_checkpoint: None,
        waiting_triggers: VecDeque::new(),
    };
    let coordinator = thread::Builder::new()
        .name(format!("{job_name}-coordinator"))
        .spawn(move || coordinator_loop.run())
        .context("spawn coordinator thread failed")
        .map_err(PipelineError::RuntimeStartup)?;

    let tasks = vec![
        (
            OPERATOR_TASK,
            spawn_task(
                format!("{job_name}-operator"),
                OPERATOR_TASK,
                events_tx.clone(),
                Arc::clone(&progress),
                move || operator_task.run(),
            )?,
        ),
        (
            SOURCE_TASK,
            spawn_task(
                format!("{job_name}-source"),
                SOURCE_TASK,
                events_tx.clone(),
                Arc::clone(&progress),
                move || source_task.run(),
            )?,
        ),
    ];

    tracing::info!(job = %job_name, restored_from, "job started");
    Ok(JobHandle {
        job_name,
        events: events_tx,
        progress,
        restored_from,
        coordinator,
        tasks,
    })
}

fn spawn_task<F>(
    name: String,
    task_id: TaskId,
    events: Sender<CoordinatorEvent>,
    progress: Arc<JobProgress>,
    body: F,
) -> Result<JoinHandle<Result<()>>, PipelineError>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(body))
                .unwrap_or_else(|_| Err(anyhow!("task {task_id} panicked")));
            let event = match &result {
                Ok(()) => {
                    tracing::debug!(%task_id, "task finished");
                    CoordinatorEvent::TaskFinished(task_id)
                }
                Err(err) => {
                    tracing::error!(%task_id, "task failed: {err:#}");
                    progress.record_task_failure(task_id);
                    CoordinatorEvent::TaskFailed(task_id)
                }
            };
            let _ = events.send(event);
            result
        })
        .context("spawn task thread failed")
        .map_err(PipelineError::RuntimeStartup)
}

#[cfg(test)]
#[path = "tests/executor_tests.rs"]
mod tests;
