//! Task execution model.
//!
//! A job runs two tasks, each on its own thread:
//!
//! ```text
//! source task:
//! loop {
//!     drain control            // trigger -> snapshot, ack, emit barrier
//!     batch = source.poll()    // records and watermark into the data channel
//! }
//!
//! operator task:
//! loop {
//!     drain control            // checkpoint complete -> commit sink
//!     match data.next() {
//!         Record    => transform.process() -> sink.write()
//!         Watermark => transform.on_watermark() -> sink.write()
//!         Barrier   => snapshot transform, pre-commit sink, ack
//!         End       => sink.finish(), wait for outstanding commits
//!     }
//! }
//! ```
//!
//! Barriers travel in-band, so the snapshot taken at barrier `n` covers
//! exactly the records emitted before it.

use super::*;

/// Unique identifier for a task instance.
///
/// Format: `vertex_{vertex_id}_{subtask_index}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub vertex_id: VertexId,
    pub subtask_index: usize,
}

impl TaskId {
    pub fn new(vertex_id: VertexId, subtask_index: usize) -> Self {
        Self {
            vertex_id,
            subtask_index,
        }
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vertex_{}_{}", self.vertex_id.0, self.subtask_index)
    }
}

/// Identifier of a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VertexId(pub u32);

impl VertexId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

/// The source stage.
pub const SOURCE_TASK: TaskId = TaskId {
    vertex_id: VertexId(1),
    subtask_index: 0,
};

/// The transform and sink stage.
pub const OPERATOR_TASK: TaskId = TaskId {
    vertex_id: VertexId(2),
    subtask_index: 0,
};

/// Coordinator -> task control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    /// Snapshot and inject the barrier. Source task only.
    TriggerCheckpoint(Barrier),
    CheckpointComplete(CheckpointId),
    Cancel,
}

/// Task -> coordinator event.
#[derive(Debug)]
pub(crate) enum CoordinatorEvent {
    Checkpoint(TaskCheckpointEvent),
    /// The source read its topic to the end.
    EndOfInput,
    TaskFinished(TaskId),
    TaskFailed(TaskId),
    /// Manual trigger; the reply carries the new checkpoint id.
    TriggerCheckpoint(Sender<Result<CheckpointId, String>>),
    Cancel,
}

/// Operator task state stored in a checkpoint.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct OperatorSnapshot {
    pub transform: Vec<u8>,
    pub sink: Vec<u8>,
}

enum Flow {
    Continue,
    Stop,
}

pub(crate) struct SourceTask<T> {
    pub source: BrokerSource<T>,
    pub output: LocalChannelSender<T>,
    pub control: Receiver<TaskControl>,
    pub events: Sender<CoordinatorEvent>,
    pub progress: Arc<JobProgress>,
    pub checkpointing: bool,
}

impl<T: Send + 'static> SourceTask<T> {
    pub fn run(&mut self) -> Result<()> {
        loop {
            while let Ok(control) = self.control.try_recv() {
                if let Flow::Stop = self.handle_control(control, false)? {
                    return Ok(());
                }
            }

            match self.source.poll_next()? {
                SourceBatch::Records { records, watermark } => {
                    let count = records.len() as u64;
                    for record in records {
                        self.output.send(StreamElement::Record(record))?;
                    }
                    self.progress.records_read.fetch_add(count, Ordering::SeqCst);
                    if let Some(watermark) = watermark {
                        self.output.send(StreamElement::Watermark(watermark))?;
                    }
                }
                SourceBatch::Idle => {}
                SourceBatch::Exhausted => return self.finish_input(),
            }
        }
    }

    /// Input is done. Without checkpointing the stream just ends; otherwise
    /// the final checkpoint's barrier goes out ahead of the end marker and
    /// the task stays until that checkpoint completes. A checkpoint already
    /// in flight at this point is served first.
    fn finish_input(&mut self) -> Result<()> {
        tracing::info!(
            topic = self.source.topic(),
            records = self.source.records_read(),
            "source reached end of input"
        );
        if !self.checkpointing {
            self.output.send(StreamElement::End)?;
            return Ok(());
        }
        self.events
            .send(CoordinatorEvent::EndOfInput)
            .map_err(|_| anyhow!("checkpoint coordinator is gone"))?;
        loop {
            let control = self
                .control
                .recv()
                .map_err(|_| anyhow!("control channel closed"))?;
            if let Flow::Stop = self.handle_control(control, true)? {
                return Ok(());
            }
        }
    }

    fn handle_control(&mut self, control: TaskControl, exhausted: bool) -> Result<Flow> {
        match control {
            TaskControl::TriggerCheckpoint(barrier) => {
                self.checkpoint(barrier)?;
                if exhausted && self.progress.is_final_checkpoint(barrier.checkpoint_id) {
                    self.output.send(StreamElement::End)?;
                }
            }
            TaskControl::CheckpointComplete(checkpoint_id) => {
                self.source.notify_checkpoint_complete(checkpoint_id);
                if exhausted && self.progress.is_final_checkpoint(checkpoint_id) {
                    return Ok(Flow::Stop);
                }
            }
            TaskControl::Cancel => return Ok(Flow::Stop),
        }
        Ok(Flow::Continue)
    }

    fn checkpoint(&mut self, barrier: Barrier) -> Result<()> {
        let event = match self.source.snapshot_state(barrier.checkpoint_id) {
            Ok(state) => TaskCheckpointEvent::Ack(TaskCheckpointAck {
                checkpoint_id: barrier.checkpoint_id,
                task_id: SOURCE_TASK,
                state,
            }),
            Err(err) => TaskCheckpointEvent::Aborted(TaskCheckpointAbort {
                checkpoint_id: barrier.checkpoint_id,
                task_id: SOURCE_TASK,
                reason: format!("source snapshot failed: {err:#}"),
            }),
        };
        let acked = matches!(event, TaskCheckpointEvent::Ack(_));
        self.events
            .send(CoordinatorEvent::Checkpoint(event))
            .map_err(|_| anyhow!("checkpoint coordinator is gone"))?;
        if acked {
            self.output
                .send(StreamElement::CheckpointBarrier(barrier))?;
        }
        Ok(())
    }
}

pub(crate) struct OperatorTask<IN, OUT> {
    pub input: LocalChannelReceiver<IN>,
    pub transform: Box<dyn Transform<IN, OUT>>,
    pub sink: BrokerSink<OUT>,
    pub control: Receiver<TaskControl>,
    pub events: Sender<CoordinatorEvent>,
    pub progress: Arc<JobProgress>,
    pub output_buffer: Vec<OUT>,
}

impl<IN: Send + 'static, OUT: Send + 'static> OperatorTask<IN, OUT> {
    /// Run until the stream ended and every pre-committed transaction was
    /// committed, or until cancelled. On failure the open transaction is
    /// aborted.
    pub fn run(&mut self) -> Result<()> {
        let result = self.run_loop();
        if result.is_err() {
            self.sink.abort_current();
        }
        result
    }

    fn run_loop(&mut self) -> Result<()> {
        let control = self.control.clone();
        let input = self.input.receiver.clone();
        let mut ended = false;
        loop {
            while let Ok(message) = control.try_recv() {
                if let Flow::Stop = self.handle_control(message)? {
                    return Ok(());
                }
            }

            if ended {
                if !self.sink.has_pending_commits() {
                    return Ok(());
                }
                let message = control
                    .recv()
                    .map_err(|_| anyhow!("control channel closed"))?;
                if let Flow::Stop = self.handle_control(message)? {
                    return Ok(());
                }
                continue;
            }

            select! {
                recv(control) -> message => {
                    let message = message.map_err(|_| anyhow!("control channel closed"))?;
                    if let Flow::Stop = self.handle_control(message)? {
                        return Ok(());
                    }
                }
                recv(input) -> element => {
                    let element = element
                        .map_err(|_| anyhow!("data channel closed before end of stream"))?;
                    ended = self.process_element(element)?;
                }
            }
        }
    }

    fn handle_control(&mut self, control: TaskControl) -> Result<Flow> {
        match control {
            TaskControl::CheckpointComplete(checkpoint_id) => {
                self.sink.notify_checkpoint_complete(checkpoint_id)?;
                Ok(Flow::Continue)
            }
            TaskControl::Cancel => Ok(Flow::Stop),
            TaskControl::TriggerCheckpoint(barrier) => {
                tracing::warn!(
                    checkpoint_id = barrier.checkpoint_id,
                    "operator task ignores checkpoint trigger; barriers arrive in-band"
                );
                Ok(Flow::Continue)
            }
        }
    }

    /// Returns `true` at end of stream.
    fn process_element(&mut self, element: StreamElement<IN>) -> Result<bool> {
        match element {
            StreamElement::Record(StreamRecord { value, timestamp }) => {
                self.output_buffer.clear();
                self.transform.process(value, &mut self.output_buffer)?;
                self.emit(timestamp)?;
            }
            StreamElement::Watermark(watermark) => {
                self.output_buffer.clear();
                self.transform
                    .on_watermark(watermark, &mut self.output_buffer)?;
                self.emit(Some(watermark.timestamp))?;
            }
            StreamElement::CheckpointBarrier(barrier) => self.checkpoint(barrier)?,
            StreamElement::End => {
                self.sink.finish()?;
                tracing::info!(
                    records_written = self.sink.records_written(),
                    "operator reached end of stream"
                );
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn emit(&mut self, timestamp: Option<EventTime>) -> Result<()> {
        let count = self.output_buffer.len() as u64;
        for value in self.output_buffer.drain(..) {
            self.sink.write(&StreamRecord { value, timestamp })?;
        }
        self.progress
            .records_written
            .fetch_add(count, Ordering::SeqCst);
        Ok(())
    }

    fn checkpoint(&mut self, barrier: Barrier) -> Result<()> {
        let checkpoint_id = barrier.checkpoint_id;
        let transform = match self.transform.snapshot_state() {
            Ok(state) => state,
            Err(err) => {
                // The open transaction rolls into the next epoch.
                return self.send_event(TaskCheckpointEvent::Aborted(TaskCheckpointAbort {
                    checkpoint_id,
                    task_id: OPERATOR_TASK,
                    reason: format!("transform snapshot failed: {err:#}"),
                }));
            }
        };
        let sink = self.sink.prepare_commit(checkpoint_id)?;
        let state = bincode::serialize(&OperatorSnapshot { transform, sink })
            .context("serialize operator snapshot failed")?;
        self.send_event(TaskCheckpointEvent::Ack(TaskCheckpointAck {
            checkpoint_id,
            task_id: OPERATOR_TASK,
            state,
        }))
    }

    fn send_event(&self, event: TaskCheckpointEvent) -> Result<()> {
        self.events
            .send(CoordinatorEvent::Checkpoint(event))
            .map_err(|_| anyhow!("checkpoint coordinator is gone"))
    }
}

#[cfg(test)]
#[path = "tests/task_tests.rs"]
mod tests;
