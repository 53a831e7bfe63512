//! Run lifecycle: per-thread serialization, the run registry, cancellation,
//! and finalization.
//!
//! A run holds an exclusive lease on its thread from admission until its
//! reply is persisted. Frames are produced by a spawned task and delivered
//! through a bounded channel; a departed client does not stop the run.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::error_taxonomy::{ErrorEnvelope, RuntimeError};
use crate::llm_client::SharedLlmClient;
use crate::models::{Message, Role, new_message_id};
use crate::stream_protocol::{Frame, StreamMode, StreamProtocolEncoder, mode_names};
use crate::thread_store::{SharedThreadStore, StoreError};
use crate::token_aggregator::{AggregateOutcome, AggregateResult, TokenAggregator};

pub type SharedRunCoordinator = Arc<RunCoordinator>;

/// Frames buffered per run before the producer waits on the client.
pub const FRAME_BUFFER: usize = 64;

const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(50);

/// What to do when a run targets a thread that already has one in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPolicy {
    /// Fail fast with a conflict.
    Reject,
    /// Wait for the active run to finish.
    #[default]
    Queue,
}

impl RunPolicy {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "reject" => Some(RunPolicy::Reject),
            "queue" => Some(RunPolicy::Queue),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RunPolicy::Reject => "reject",
            RunPolicy::Queue => "queue",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Streaming => "streaming",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Cancelled | RunStatus::Failed
        )
    }

    fn from_outcome(outcome: &AggregateOutcome) -> Self {
        match outcome {
            AggregateOutcome::Completed => RunStatus::Completed,
            AggregateOutcome::Cancelled => RunStatus::Cancelled,
            AggregateOutcome::Failed(_) => RunStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
}

impl CancelOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CancelOutcome::Cancelled => "cancelled",
            CancelOutcome::NotFound => "not_found",
        }
    }
}

/// Parameters for one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub thread_id: String,
    pub input: Vec<Message>,
    pub modes: Vec<StreamMode>,
    /// Create the thread when it does not exist yet.
    pub create_thread: bool,
}

#[derive(Debug)]
struct ActiveRun {
    thread_id: String,
    status: RunStatus,
    cancel: CancellationToken,
}

/// Coordinates runs across threads.
pub struct RunCoordinator {
    store: SharedThreadStore,
    llm: SharedLlmClient,
    policy: RunPolicy,
    runs: StdMutex<HashMap<String, ActiveRun>>,
    thread_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RunCoordinator {
    pub fn new(store: SharedThreadStore, llm: SharedLlmClient, policy: RunPolicy) -> Self {
        Self {
            store,
            llm,
            policy,
            runs: StdMutex::new(HashMap::new()),
            thread_locks: StdMutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn model(&self) -> &str {
        self.llm.model()
    }

    /// Admit a run and start producing its frames.
    ///
    /// Errors are returned before any frame exists: invalid input, an unknown
    /// thread, or a conflict under [`RunPolicy::Reject`]. Under
    /// [`RunPolicy::Queue`] this waits for the thread's active run to finish.
    pub async fn start(self: &Arc<Self>, request: RunRequest) -> Result<RunStream, RuntimeError> {
        let prepared = self.prepare(request).await?;
        Ok(self.spawn(prepared))
    }

    /// Request cancellation of a streaming run.
    pub fn cancel(&self, run_id: &str) -> CancelOutcome {
        let runs = self.runs();
        match runs.get(run_id) {
            Some(run) if run.status == RunStatus::Streaming && !run.cancel.is_cancelled() => {
                run.cancel.cancel();
                tracing::info!(run_id, thread_id = %run.thread_id, "run cancellation requested");
                CancelOutcome::Cancelled
            }
            _ => CancelOutcome::NotFound,
        }
    }

    #[cfg(test)]
    fn status(&self, run_id: &str) -> Option<RunStatus> {
        self.runs().get(run_id).map(|run| run.status)
    }

    #[must_use]
    pub fn is_thread_busy(&self, thread_id: &str) -> bool {
        self.runs()
            .values()
            .any(|run| run.thread_id == thread_id && !run.status.is_terminal())
    }

    #[must_use]
    pub fn active_run_count(&self) -> usize {
        self.runs()
            .values()
            .filter(|run| !run.status.is_terminal())
            .count()
    }

    // === Admission ===

    async fn prepare(self: &Arc<Self>, request: RunRequest) -> Result<PreparedRun, RuntimeError> {
        let RunRequest {
            thread_id,
            input,
            modes,
            create_thread,
        } = request;
        let thread_id = thread_id.trim().to_string();
        if thread_id.is_empty() {
            return Err(RuntimeError::validation("thread_id cannot be empty"));
        }
        validate_input(&input)?;

        if !create_thread && !self.store.exists(&thread_id).await? {
            return Err(RuntimeError::ThreadNotFound(thread_id));
        }

        let lease = self.acquire(&thread_id).await?;

        // The thread may have been deleted while this run waited for the lease.
        let existing = self.store.get(&thread_id).await?;
        if existing.is_none() && !create_thread {
            return Err(RuntimeError::ThreadNotFound(thread_id));
        }
        self.reject_reused_ids(&input).await?;
        let thread = match existing {
            Some(thread) => thread,
            None => self.store.create(&thread_id).await?,
        };

        let run_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let registration = self.register(&run_id, &thread_id, cancel.clone());

        let mut stored_input = Vec::with_capacity(input.len());
        let mut unsaved_input = Vec::new();
        for message in input {
            if !unsaved_input.is_empty() {
                unsaved_input.push(message);
                continue;
            }
            match self.store.append(&thread_id, message.clone()).await {
                Ok(stored) => stored_input.push(stored),
                // Another thread claimed the id after the admission check.
                Err(err @ StoreError::DuplicateMessage { .. }) => return Err(err.into()),
                Err(err) => {
                    tracing::warn!(
                        %run_id,
                        %thread_id,
                        error = %err,
                        "input not persisted at admission; retrying at finalization"
                    );
                    unsaved_input.push(message);
                }
            }
        }

        self.set_status(&run_id, RunStatus::Streaming);
        tracing::info!(
            %run_id,
            %thread_id,
            policy = self.policy.as_str(),
            modes = %mode_names(&modes),
            "run started"
        );

        Ok(PreparedRun {
            run_id,
            thread_id,
            cancel,
            lease,
            registration,
            history: thread.messages,
            stored_input,
            unsaved_input,
            modes,
        })
    }

    /// Message ids are unique across every thread, not just the target one.
    async fn reject_reused_ids(&self, input: &[Message]) -> Result<(), RuntimeError> {
        for message in input {
            if let Some(owner) = self.store.message_owner(&message.id).await? {
                return Err(RuntimeError::validation(format!(
                    "Message id {} already exists in thread {owner}",
                    message.id
                )));
            }
        }
        Ok(())
    }

    async fn acquire(self: &Arc<Self>, thread_id: &str) -> Result<ThreadLease, RuntimeError> {
        let lock = {
            let mut locks = self.locks();
            Arc::clone(locks.entry(thread_id.to_string()).or_default())
        };
        let guard = match self.policy {
            RunPolicy::Queue => lock.lock_owned().await,
            RunPolicy::Reject => lock.try_lock_owned().map_err(|_| RuntimeError::RunConflict {
                thread_id: thread_id.to_string(),
            })?,
        };
        Ok(ThreadLease {
            coordinator: Arc::clone(self),
            thread_id: thread_id.to_string(),
            guard: Some(guard),
        })
    }

    fn register(
        self: &Arc<Self>,
        run_id: &str,
        thread_id: &str,
        cancel: CancellationToken,
    ) -> Registration {
        self.runs().insert(
            run_id.to_string(),
            ActiveRun {
                thread_id: thread_id.to_string(),
                status: RunStatus::Pending,
                cancel,
            },
        );
        Registration {
            coordinator: Arc::clone(self),
            run_id: run_id.to_string(),
        }
    }

    fn set_status(&self, run_id: &str, status: RunStatus) {
        if let Some(run) = self.runs().get_mut(run_id) {
            run.status = status;
        }
    }

    /// Record the terminal status for `outcome`.
    ///
    /// A cancel accepted after the provider finished still wins, so a run never
    /// ends `Completed` once a caller was told it was cancelled.
    fn settle(&self, run_id: &str, outcome: &AggregateOutcome) -> RunStatus {
        let mut runs = self.runs();
        let mut status = RunStatus::from_outcome(outcome);
        if let Some(run) = runs.get_mut(run_id) {
            if status == RunStatus::Completed && run.cancel.is_cancelled() {
                status = RunStatus::Cancelled;
            }
            run.status = status;
        }
        status
    }

    // === Execution ===

    fn spawn(self: &Arc<Self>, run: PreparedRun) -> RunStream {
        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let run_id = run.run_id.clone();
        let thread_id = run.thread_id.clone();
        let span = tracing::info_span!("run", run_id = %run_id, thread_id = %thread_id);
        let coordinator = Arc::clone(self);
        tokio::spawn(coordinator.drive(run, tx).instrument(span));
        RunStream {
            run_id,
            thread_id,
            frames: ReceiverStream::new(rx),
            finished: false,
        }
    }

    async fn drive(self: Arc<Self>, run: PreparedRun, tx: mpsc::Sender<Frame>) {
        let PreparedRun {
            run_id,
            thread_id,
            cancel,
            lease,
            registration,
            history,
            stored_input,
            unsaved_input,
            modes,
        } = run;

        let mut sink = FrameSink::new(tx);
        let ai_message_id = new_message_id();
        let mut encoder = StreamProtocolEncoder::new(&run_id, &thread_id, modes, &ai_message_id);
        sink.emit(encoder.start()).await;

        // `conversation` only ever holds messages that are durably stored.
        let mut conversation = history;
        conversation.extend(stored_input);
        let mut prompt = conversation.clone();
        prompt.extend(unsaved_input.iter().cloned());

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            opened = self.llm.stream_completion(&prompt) => Some(opened),
        };
        let result = match opened {
            Some(Ok(deltas)) => {
                let mut aggregator = TokenAggregator::new(deltas, cancel.clone());
                while let Some(step) = aggregator.next().await {
                    let frames = encoder.on_delta(&step.delta, step.full_content);
                    sink.emit(frames).await;
                }
                aggregator.finish()
            }
            Some(Err(err)) => AggregateResult {
                content: String::new(),
                outcome: AggregateOutcome::Failed(err),
                accepted: 0,
            },
            None => AggregateResult {
                content: String::new(),
                outcome: AggregateOutcome::Cancelled,
                accepted: 0,
            },
        };

        let status = self.settle(&run_id, &result.outcome);
        match &result.outcome {
            AggregateOutcome::Failed(err) => {
                let envelope = ErrorEnvelope::from(err);
                tracing::warn!(code = %envelope.code, error = %err, deltas = result.accepted, "run failed");
            }
            outcome => {
                tracing::info!(
                    outcome = outcome.label(),
                    status = status.as_str(),
                    deltas = result.accepted,
                    "run finished"
                );
            }
        }

        for message in unsaved_input {
            if let Some(stored) = self.persist(&thread_id, message).await {
                conversation.push(stored);
            }
        }
        let reply = Message::with_id(ai_message_id, Role::Ai, result.content);
        let reply = match self.persist(&thread_id, reply.clone()).await {
            Some(stored) => {
                conversation.push(stored.clone());
                stored
            }
            None => reply,
        };

        drop(registration);
        drop(lease);

        let frames = match &result.outcome {
            AggregateOutcome::Failed(err) => encoder.fail(&err.to_string()),
            AggregateOutcome::Completed | AggregateOutcome::Cancelled => {
                encoder.finish(&conversation, &reply)
            }
        };
        sink.emit(frames).await;
    }

    /// Append with one retry. Returns the message as stored, or `None` when
    /// the thread does not hold it.
    async fn persist(&self, thread_id: &str, message: Message) -> Option<Message> {
        let mut retried = false;
        loop {
            match self.store.append(thread_id, message.clone()).await {
                Ok(stored) => return Some(stored),
                Err(StoreError::ThreadNotFound(_)) => {
                    tracing::warn!(message_id = %message.id, "thread deleted during run; message dropped");
                    return None;
                }
                Err(StoreError::DuplicateMessage { thread_id: owner, .. }) => {
                    if owner == thread_id {
                        return Some(message);
                    }
                    tracing::warn!(message_id = %message.id, %owner, "message id taken by another thread; message dropped");
                    return None;
                }
                Err(err) if !retried => {
                    tracing::warn!(message_id = %message.id, error = %err, "append failed; retrying once");
                    retried = true;
                    tokio::time::sleep(PERSIST_RETRY_DELAY).await;
                }
                Err(err) => {
                    tracing::error!(
                        message_id = %message.id,
                        error = %err,
                        "durability warning: message was streamed but not persisted"
                    );
                    return None;
                }
            }
        }
    }

    // === Bookkeeping ===

    fn runs(&self) -> MutexGuard<'_, HashMap<String, ActiveRun>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.thread_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn prune_thread_lock(&self, thread_id: &str) {
        let mut locks = self.locks();
        let idle = locks
            .get(thread_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(thread_id);
        }
    }
}

fn validate_input(input: &[Message]) -> Result<(), RuntimeError> {
    if input.is_empty() {
        return Err(RuntimeError::validation(
            "input.messages must contain at least one message",
        ));
    }
    if !input
        .iter()
        .any(|message| message.role == Role::Human && !message.content.is_blank())
    {
        return Err(RuntimeError::validation(
            "input.messages must include a non-empty human message",
        ));
    }
    let mut seen = HashSet::new();
    for message in input {
        if !seen.insert(message.id.as_str()) {
            return Err(RuntimeError::validation(format!(
                "Duplicate message id in input: {}",
                message.id
            )));
        }
    }
    Ok(())
}

// === Run handles ===

struct PreparedRun {
    run_id: String,
    thread_id: String,
    cancel: CancellationToken,
    lease: ThreadLease,
    registration: Registration,
    history: Vec<Message>,
    /// Input appended at admission.
    stored_input: Vec<Message>,
    /// Input whose admission append failed; retried at finalization.
    unsaved_input: Vec<Message>,
    modes: Vec<StreamMode>,
}

/// Exclusive hold on a thread. Dropping it releases the thread and prunes
/// the lock entry once nobody else references it.
struct ThreadLease {
    coordinator: Arc<RunCoordinator>,
    thread_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ThreadLease {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.coordinator.prune_thread_lock(&self.thread_id);
    }
}

/// Registry entry owned by a run; dropping it deregisters the run.
struct Registration {
    coordinator: Arc<RunCoordinator>,
    run_id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.coordinator.runs().remove(&self.run_id);
    }
}

/// Delivers frames to the client until it goes away.
struct FrameSink {
    tx: mpsc::Sender<Frame>,
    connected: bool,
}

impl FrameSink {
    fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self {
            tx,
            connected: true,
        }
    }

    async fn emit(&mut self, frames: Vec<Frame>) {
        for frame in frames {
            if !self.connected {
                return;
            }
            if self.tx.send(frame).await.is_err() {
                self.connected = false;
                tracing::debug!("client disconnected; run continues without a listener");
            }
        }
    }
}

/// The frame sequence of one admitted run. Ends after its terminal frame.
pub struct RunStream {
    pub run_id: String,
    pub thread_id: String,
    frames: ReceiverStream<Frame>,
    finished: bool,
}

impl Stream for RunStream {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        if self.finished {
            return Poll::Ready(None);
        }
        let polled = Pin::new(&mut self.frames).poll_next(cx);
        if let Poll::Ready(Some(frame)) = &polled
            && frame.is_terminal()
        {
            self.finished = true;
        }
        polled
    }
}
