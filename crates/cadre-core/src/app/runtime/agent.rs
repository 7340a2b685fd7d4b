use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::app::domain::checkpoint::{
    Checkpoint, CheckpointError, EVENT_LOG_STATE, sanitize_restored_events,
};
use crate::app::domain::event::{
    AgentEvent, EventPayload, HumanRequest, HumanResponse, InputStatus, ResetScope,
};
use crate::app::domain::event_log::{EventCursor, EventLog, ListenerError};
use crate::app::domain::slice::{SliceError, SliceKind, SliceRegistry};
use crate::app::domain::types::{AgentId, RequestId, Timestamp, current_timestamp};
use crate::config::AgentConfig;

use super::command::{CommandContext, CommandDispatcher, CommandError};
use super::orchestrator::OrchestratorHandle;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent {agent_id} is stopped")]
    Stopped { agent_id: String },

    #[error("Agent {agent_id} is busy")]
    Busy { agent_id: String },

    #[error("Agent {agent_id} is headless and cannot ask a human")]
    Headless { agent_id: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("No open human request with id {request_id}")]
    HumanRequestNotFound { request_id: String },

    #[error(transparent)]
    Slice(#[from] SliceError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AgentStatus {
    Initializing,
    Idle,
    Busy,
    Stopped,
}

/// Terminal outcome of one submitted input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputOutcome {
    pub status: InputStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub agent_type: String,
    pub name: String,
    pub description: String,
    pub status: AgentStatus,
    pub idle: bool,
    pub headless: bool,
    pub created_at: Timestamp,
    pub last_activity_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<AgentId>,
    pub event_count: usize,
}

pub(crate) struct QueuedInput {
    request_id: RequestId,
    message: String,
}

/// Receiving half of an agent's input queue, consumed by its command loop.
pub(crate) struct AgentInbox {
    rx: mpsc::UnboundedReceiver<QueuedInput>,
}

struct InFlight {
    request_id: RequestId,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
struct Activity {
    at: Instant,
    timestamp: Timestamp,
}

impl Activity {
    fn now() -> Self {
        Self {
            at: Instant::now(),
            timestamp: current_timestamp(),
        }
    }
}

struct AgentInner {
    id: AgentId,
    parent_id: Option<AgentId>,
    config: Arc<AgentConfig>,
    events: EventLog,
    slices: Mutex<SliceRegistry>,
    lifetime: CancellationToken,
    current_op: Mutex<Option<InFlight>>,
    status: watch::Sender<AgentStatus>,
    queue: mpsc::UnboundedSender<QueuedInput>,
    /// Inputs accepted but not yet handled, including the one in flight.
    pending: AtomicUsize,
    open_questions: Mutex<HashSet<RequestId>>,
    created_at: Instant,
    created_timestamp: Timestamp,
    activity: Arc<Mutex<Activity>>,
    stop_reason: Mutex<Option<String>>,
}

/// Long-lived actor owning one event log and one slice registry.
///
/// Cheap to clone; every clone addresses the same actor.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.inner.id)
            .field("type", &self.inner.config.agent_type)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub(crate) fn new(
        config: Arc<AgentConfig>,
        parent_id: Option<AgentId>,
        slices: SliceRegistry,
    ) -> (Self, AgentInbox) {
        let (queue, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(AgentStatus::Initializing);

        let activity = Arc::new(Mutex::new(Activity::now()));
        let events = EventLog::new();
        let touched = activity.clone();
        events.add_listener(Arc::new(move |_: &AgentEvent| -> Result<(), ListenerError> {
            *touched.lock().unwrap_or_else(PoisonError::into_inner) = Activity::now();
            Ok(())
        }));

        let created = Activity::now();
        let agent = Self {
            inner: Arc::new(AgentInner {
                id: AgentId::new(),
                parent_id,
                config,
                events,
                slices: Mutex::new(slices),
                lifetime: CancellationToken::new(),
                current_op: Mutex::new(None),
                status,
                queue,
                pending: AtomicUsize::new(0),
                open_questions: Mutex::new(HashSet::new()),
                created_at: created.at,
                created_timestamp: created.timestamp,
                activity,
                stop_reason: Mutex::new(None),
            }),
        };
        (agent, AgentInbox { rx })
    }

    pub fn id(&self) -> AgentId {
        self.inner.id
    }

    pub fn parent_id(&self) -> Option<AgentId> {
        self.inner.parent_id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn agent_type(&self) -> &str {
        &self.inner.config.agent_type
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn events(&self) -> &EventLog {
        &self.inner.events
    }

    pub fn status(&self) -> AgentStatus {
        *self.inner.status.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lifetime.is_cancelled()
    }

    /// Fires when the agent is shut down; parent of every per-request token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.lifetime.clone()
    }

    pub fn emit(&self, payload: EventPayload) -> usize {
        self.inner.events.append(AgentEvent::new(payload))
    }

    pub fn chat_output(&self, content: impl Into<String>) {
        self.emit(EventPayload::ChatOutput {
            content: content.into(),
        });
    }

    pub fn reasoning_output(&self, content: impl Into<String>) {
        self.emit(EventPayload::ReasoningOutput {
            content: content.into(),
        });
    }

    pub fn info_message(&self, message: impl Into<String>) {
        self.emit(EventPayload::InfoOutput {
            message: message.into(),
        });
    }

    pub fn warning_message(&self, message: impl Into<String>) {
        self.emit(EventPayload::WarningOutput {
            message: message.into(),
        });
    }

    pub fn error_message(&self, message: impl Into<String>) {
        self.emit(EventPayload::ErrorOutput {
            message: message.into(),
        });
    }

    pub fn artifact_output(
        &self,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        body: impl Into<String>,
    ) {
        self.emit(EventPayload::ArtifactOutput {
            name: name.into(),
            mime_type: mime_type.into(),
            body: body.into(),
        });
    }

    /// Records the input and queues it behind any earlier input. The
    /// returned id correlates the eventual `input.handled` event.
    pub fn handle_input(&self, message: impl Into<String>) -> Result<RequestId, AgentError> {
        if self.is_stopped() {
            return Err(self.stopped_error());
        }

        let message = message.into();
        let request_id = RequestId::new();
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        self.emit(EventPayload::InputReceived {
            request_id,
            message: message.clone(),
        });

        if self
            .inner
            .queue
            .send(QueuedInput {
                request_id,
                message,
            })
            .is_err()
        {
            self.complete(
                request_id,
                InputStatus::Cancelled,
                "Agent is no longer accepting input".to_string(),
            );
            self.input_settled();
            return Err(self.stopped_error());
        }

        tracing::debug!(agent_id = %self.id(), request_id = %request_id, "Queued input");
        Ok(request_id)
    }

    /// Asks the human interface a question and suspends until it is answered.
    ///
    /// Unwinds with [`AgentError::Cancelled`] when the in-flight request is
    /// aborted or the agent stops.
    pub async fn ask_human(&self, request: HumanRequest) -> Result<HumanResponse, AgentError> {
        if self.inner.config.headless {
            return Err(AgentError::Headless {
                agent_id: self.id().to_string(),
            });
        }
        if self.is_stopped() {
            return Err(self.stopped_error());
        }

        let cancel = self.current_cancel_token();
        let request_id = RequestId::new();
        let mut cursor = self.inner.events.create_cursor();

        self.open_questions().insert(request_id);
        self.emit(EventPayload::HumanRequest {
            request_id,
            request,
        });

        let response = self
            .inner
            .events
            .wait_for(&mut cursor, &cancel, |event| match &event.payload {
                EventPayload::HumanResponse {
                    request_id: answered,
                    response,
                } if *answered == request_id => Some(response.clone()),
                _ => None,
            })
            .await;

        response.ok_or_else(|| {
            self.open_questions().remove(&request_id);
            AgentError::Cancelled
        })
    }

    pub fn send_human_response(
        &self,
        request_id: RequestId,
        response: HumanResponse,
    ) -> Result<(), AgentError> {
        if !self.open_questions().remove(&request_id) {
            return Err(AgentError::HumanRequestNotFound {
                request_id: request_id.to_string(),
            });
        }
        self.emit(EventPayload::HumanResponse {
            request_id,
            response,
        });
        Ok(())
    }

    pub fn has_open_human_request(&self, request_id: RequestId) -> bool {
        self.open_questions().contains(&request_id)
    }

    /// Surfaces a question asked by a sub-agent so it can be answered here.
    pub(crate) fn relay_human_request(&self, request_id: RequestId, request: HumanRequest) {
        self.open_questions().insert(request_id);
        self.emit(EventPayload::HumanRequest {
            request_id,
            request,
        });
    }

    /// Closes a relayed question nobody will answer. Returns whether it was
    /// still open.
    pub(crate) fn withdraw_human_request(&self, request_id: RequestId) -> bool {
        let withdrawn = self.open_questions().remove(&request_id);
        if withdrawn {
            tracing::debug!(
                agent_id = %self.id(),
                request_id = %request_id,
                "Withdrew unanswered human request"
            );
        }
        withdrawn
    }

    /// Cancels the in-flight request, if any, and records an abort event.
    /// Returns whether there was work to cancel. The agent stays usable.
    pub fn request_abort(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let in_flight = self
            .lock_current_op()
            .as_ref()
            .map(|op| (op.request_id, op.cancel.clone()));

        self.emit(EventPayload::Abort {
            reason: reason.clone(),
        });

        if let Some((request_id, cancel)) = &in_flight {
            cancel.cancel();
            tracing::info!(
                agent_id = %self.id(),
                request_id = %request_id,
                reason = %reason,
                "Aborted in-flight request"
            );
        }
        in_flight.is_some()
    }

    pub fn reset(&self, scopes: &[ResetScope]) {
        self.lock_slices().reset(scopes);
        self.emit(EventPayload::Reset {
            scopes: scopes.to_vec(),
        });
        tracing::debug!(agent_id = %self.id(), ?scopes, "Reset agent state");
    }

    /// Runs `f` with exclusive access to slice `S`.
    ///
    /// Holds the agent's slice lock for the duration of `f`; calling back into
    /// this agent's state from `f` deadlocks.
    pub fn mutate_state<S: SliceKind, R>(
        &self,
        f: impl FnOnce(&mut S) -> R,
    ) -> Result<R, SliceError> {
        self.lock_slices().mutate_state(f)
    }

    pub fn get_state<S: SliceKind, R>(&self, f: impl FnOnce(&S) -> R) -> Result<R, SliceError> {
        self.lock_slices().get_state(f)
    }

    pub fn slice_names(&self) -> Vec<&'static str> {
        self.lock_slices().names()
    }

    pub fn show_state(&self) -> Vec<(&'static str, Vec<String>)> {
        self.lock_slices().show()
    }

    pub(crate) fn transferable_slice_names(&self) -> Vec<&'static str> {
        self.lock_slices().transferable_names()
    }

    pub fn generate_checkpoint(&self) -> Result<Checkpoint, AgentError> {
        let mut state = self.lock_slices().serialize()?;
        let events = serde_json::to_value(self.inner.events.snapshot())
            .map_err(|e| CheckpointError::protocol(format!("event log: {e}")))?;
        state.insert(EVENT_LOG_STATE.to_string(), events);

        Ok(Checkpoint {
            agent_id: self.id(),
            created_at: current_timestamp(),
            name: None,
            state,
        })
    }

    /// Replaces slices and event log with the checkpoint's. Slice keys this
    /// agent does not carry are reported as warnings.
    pub fn restore_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), AgentError> {
        if self.is_stopped() {
            return Err(self.stopped_error());
        }
        if self.status() == AgentStatus::Busy || self.has_pending_input() {
            return Err(AgentError::Busy {
                agent_id: self.id().to_string(),
            });
        }

        let source = checkpoint.agent_id;
        let (events, slices) = checkpoint.into_parts()?;
        let events = sanitize_restored_events(events);

        let mut missing = Vec::new();
        self.lock_slices()
            .deserialize(slices, |name| missing.push(name.to_string()))?;

        let restored = events.len();
        self.inner.events.replace(events);
        self.open_questions().clear();

        for name in &missing {
            self.warning_message(format!(
                "Checkpoint contains state for unknown slice '{name}'; it was ignored"
            ));
        }

        tracing::info!(
            agent_id = %self.id(),
            source_agent_id = %source,
            event_count = restored,
            unknown_slices = missing.len(),
            "Restored checkpoint"
        );
        Ok(())
    }

    /// Resolves once `request_id` has been handled.
    pub async fn wait_for_completion(
        &self,
        request_id: RequestId,
    ) -> Result<InputOutcome, AgentError> {
        let mut cursor = EventCursor::at(0);
        let never = CancellationToken::new();
        let found = self
            .inner
            .events
            .wait_for(&mut cursor, &never, |event| match &event.payload {
                EventPayload::InputHandled {
                    request_id: handled,
                    status,
                    message,
                } if *handled == request_id => Some(Some(InputOutcome {
                    status: *status,
                    message: message.clone(),
                })),
                EventPayload::AgentStopped { .. } => Some(None),
                _ => None,
            })
            .await;

        match found {
            Some(Some(outcome)) => Ok(outcome),
            Some(None) => Err(self.stopped_error()),
            None => Err(AgentError::Cancelled),
        }
    }

    /// Resolves once the agent is idle or stopped.
    pub async fn wait_until_idle(&self) -> AgentStatus {
        let mut rx = self.inner.status.subscribe();
        match rx
            .wait_for(|status| matches!(status, AgentStatus::Idle | AgentStatus::Stopped))
            .await
        {
            Ok(status) => *status,
            Err(_) => AgentStatus::Stopped,
        }
    }

    /// Fires the lifetime token and records the abort. The command loop
    /// finishes the transition to stopped. Repeated calls are no-ops.
    pub fn shutdown(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut stop_reason = self
                .inner
                .stop_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if stop_reason.is_some() {
                return;
            }
            *stop_reason = Some(reason.clone());
        }

        tracing::info!(agent_id = %self.id(), reason = %reason, "Stopping agent");
        self.emit(EventPayload::Abort { reason });
        self.inner.lifetime.cancel();
    }

    /// How long the agent has sat idle. Zero unless currently idle.
    pub fn idle_duration(&self, now: Instant) -> Duration {
        if self.status() != AgentStatus::Idle {
            return Duration::ZERO;
        }
        now.saturating_duration_since(self.last_activity().at)
    }

    pub fn run_duration(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inner.created_at)
    }

    /// Why the sweep should retire this agent, if it should.
    pub fn retirement_reason(&self, now: Instant) -> Option<String> {
        if self.is_stopped() {
            return Some("Agent already stopped".to_string());
        }
        let config = &self.inner.config;
        if let Some(limit) = config.max_run_time
            && self.run_duration(now) >= limit
        {
            return Some(format!(
                "Exceeded max run time of {}s",
                limit.as_secs_f64()
            ));
        }
        if let Some(limit) = config.idle_timeout
            && self.idle_duration(now) >= limit
        {
            return Some(format!("Idle for more than {}s", limit.as_secs_f64()));
        }
        None
    }

    pub fn descriptor(&self) -> AgentDescriptor {
        let config = &self.inner.config;
        let status = self.status();
        AgentDescriptor {
            id: self.id(),
            agent_type: config.agent_type.clone(),
            name: config.name.clone(),
            description: config.description.clone(),
            status,
            idle: status == AgentStatus::Idle,
            headless: config.headless,
            created_at: self.inner.created_timestamp,
            last_activity_at: self.last_activity().timestamp,
            parent_id: self.inner.parent_id,
            event_count: self.inner.events.len(),
        }
    }

    fn current_cancel_token(&self) -> CancellationToken {
        self.lock_current_op()
            .as_ref()
            .map_or_else(|| self.inner.lifetime.clone(), |op| op.cancel.clone())
    }

    fn last_activity(&self) -> Activity {
        *self
            .inner
            .activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether any accepted input has not been handled yet.
    pub fn has_pending_input(&self) -> bool {
        self.inner.pending.load(Ordering::SeqCst) > 0
    }

    fn input_settled(&self) {
        self.inner.pending.fetch_sub(1, Ordering::SeqCst);
    }

    fn set_status(&self, status: AgentStatus) {
        self.inner.status.send_replace(status);
    }

    fn complete(&self, request_id: RequestId, status: InputStatus, message: String) {
        tracing::debug!(
            agent_id = %self.id(),
            request_id = %request_id,
            status = %status,
            "Input handled"
        );
        self.emit(EventPayload::InputHandled {
            request_id,
            status,
            message,
        });
    }

    async fn execute(
        &self,
        input: QueuedInput,
        dispatcher: &dyn CommandDispatcher,
        orchestrator: &OrchestratorHandle,
    ) {
        let QueuedInput {
            request_id,
            message,
        } = input;
        let cancel = self.inner.lifetime.child_token();
        *self.lock_current_op() = Some(InFlight {
            request_id,
            cancel: cancel.clone(),
        });
        self.set_status(AgentStatus::Busy);

        let ctx = CommandContext {
            agent: self.clone(),
            orchestrator: orchestrator.clone(),
            request_id,
            cancel: cancel.clone(),
        };
        let result = AssertUnwindSafe(dispatcher.execute(ctx, message))
            .catch_unwind()
            .await;
        *self.lock_current_op() = None;

        let (status, text) = match result {
            Ok(Ok(response)) => (InputStatus::Success, response.unwrap_or_default()),
            Ok(Err(CommandError::Cancelled | CommandError::Agent(AgentError::Cancelled))) => (
                InputStatus::Cancelled,
                "Request was cancelled".to_string(),
            ),
            Ok(Err(e)) if cancel.is_cancelled() => (InputStatus::Cancelled, e.to_string()),
            Ok(Err(e)) => {
                tracing::warn!(
                    agent_id = %self.id(),
                    request_id = %request_id,
                    error = %e,
                    "Command failed"
                );
                let text = e.to_string();
                self.error_message(text.clone());
                (InputStatus::Error, text)
            }
            Err(panic) => {
                let text = format!("Command panicked: {}", panic_message(panic.as_ref()));
                tracing::error!(
                    agent_id = %self.id(),
                    request_id = %request_id,
                    "{text}"
                );
                self.error_message(text.clone());
                (InputStatus::Error, text)
            }
        };

        self.complete(request_id, status, text);
        if !self.is_stopped() {
            self.set_status(AgentStatus::Idle);
        }
    }

    fn finish_stop(&self) {
        let reason = self
            .inner
            .stop_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| "stopped".to_string());
        self.emit(EventPayload::AgentStopped { reason });
        self.set_status(AgentStatus::Stopped);
        tracing::info!(agent_id = %self.id(), "Agent stopped");
    }

    fn stopped_error(&self) -> AgentError {
        AgentError::Stopped {
            agent_id: self.id().to_string(),
        }
    }

    fn lock_slices(&self) -> MutexGuard<'_, SliceRegistry> {
        self.inner
            .slices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_current_op(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.inner
            .current_op
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn open_questions(&self) -> MutexGuard<'_, HashSet<RequestId>> {
        self.inner
            .open_questions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Executes queued inputs one at a time until the agent is shut down, then
/// cancels whatever is still queued and records `agent.stopped`.
pub(crate) async fn run_command_loop(
    agent: Agent,
    mut inbox: AgentInbox,
    dispatcher: Arc<dyn CommandDispatcher>,
    orchestrator: OrchestratorHandle,
) {
    let lifetime = agent.cancellation_token();
    agent.set_status(AgentStatus::Idle);
    tracing::debug!(agent_id = %agent.id(), "Command loop started");

    loop {
        let next = tokio::select! {
            biased;
            () = lifetime.cancelled() => None,
            next = inbox.rx.recv() => next,
        };
        let Some(input) = next else {
            break;
        };
        agent
            .execute(input, dispatcher.as_ref(), &orchestrator)
            .await;
        agent.input_settled();
    }

    inbox.rx.close();
    while let Ok(input) = inbox.rx.try_recv() {
        agent.complete(
            input.request_id,
            InputStatus::Cancelled,
            "Agent stopped before the input was handled".to_string(),
        );
        agent.input_settled();
    }
    agent.finish_stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::domain::slice::SliceData;
    use crate::app::domain::slices::{EnabledTools, SliceCatalog, Transcript};
    use crate::test_utils::ScriptedDispatcher;
    use serde_json::json;

    fn spawn_agent(config: AgentConfig) -> Agent {
        let registry = SliceCatalog::new().build_registry(&config).unwrap();
        let (agent, inbox) = Agent::new(Arc::new(config), None, registry);
        tokio::spawn(run_command_loop(
            agent.clone(),
            inbox,
            Arc::new(ScriptedDispatcher),
            OrchestratorHandle::detached(),
        ));
        agent
    }

    fn kinds(agent: &Agent) -> Vec<&'static str> {
        agent.events().snapshot().iter().map(AgentEvent::kind).collect()
    }

    #[tokio::test]
    async fn handled_input_reports_success() {
        let agent = spawn_agent(AgentConfig::new("solo", "Solo"));
        let request_id = agent.handle_input("echo hi").unwrap();

        let outcome = agent.wait_for_completion(request_id).await.unwrap();
        assert_eq!(outcome.status, InputStatus::Success);
        assert_eq!(outcome.message, "hi");
        assert_eq!(
            kinds(&agent),
            vec!["input.received", "output.chat", "input.handled"]
        );
    }

    #[tokio::test]
    async fn failing_command_becomes_error_event() {
        let agent = spawn_agent(AgentConfig::new("solo", "Solo"));
        let request_id = agent.handle_input("fail boom").unwrap();

        let outcome = agent.wait_for_completion(request_id).await.unwrap();
        assert_eq!(outcome.status, InputStatus::Error);
        assert!(outcome.message.contains("boom"));
        assert!(agent.events().any(|e| e.kind() == "output.error"));

        let next = agent.handle_input("echo still alive").unwrap();
        let outcome = agent.wait_for_completion(next).await.unwrap();
        assert_eq!(outcome.status, InputStatus::Success);
    }

    #[tokio::test]
    async fn panicking_command_does_not_kill_the_agent() {
        let agent = spawn_agent(AgentConfig::new("solo", "Solo"));
        let request_id = agent.handle_input("panic").unwrap();

        let outcome = agent.wait_for_completion(request_id).await.unwrap();
        assert_eq!(outcome.status, InputStatus::Error);
        assert!(outcome.message.contains("panicked"));

        let next = agent.handle_input("echo ok").unwrap();
        assert_eq!(
            agent.wait_for_completion(next).await.unwrap().status,
            InputStatus::Success
        );
    }

    #[tokio::test]
    async fn inputs_run_in_submission_order() {
        let agent = spawn_agent(AgentConfig::new("solo", "Solo"));
        let first = agent.handle_input("sleep 30").unwrap();
        let second = agent.handle_input("echo second").unwrap();

        agent.wait_for_completion(second).await.unwrap();
        let handled: Vec<_> = agent
            .events()
            .snapshot()
            .into_iter()
            .filter(|e| e.kind() == "input.handled")
            .filter_map(|e| e.request_id())
            .collect();
        assert_eq!(handled, vec![first, second]);
    }

    #[tokio::test]
    async fn abort_cancels_only_the_in_flight_request() {
        let agent = spawn_agent(AgentConfig::new("solo", "Solo"));
        let request_id = agent.handle_input("hang").unwrap();

        while agent.status() != AgentStatus::Busy {
            tokio::task::yield_now().await;
        }
        assert!(agent.request_abort("user pressed escape"));

        let outcome = agent.wait_for_completion(request_id).await.unwrap();
        assert_eq!(outcome.status, InputStatus::Cancelled);
        assert!(!agent.is_stopped());
        assert!(!agent.request_abort("nothing running"));

        let next = agent.handle_input("echo after abort").unwrap();
        assert_eq!(
            agent.wait_for_completion(next).await.unwrap().status,
            InputStatus::Success
        );
    }

    #[tokio::test]
    async fn ask_human_waits_for_matching_response() {
        let agent = spawn_agent(AgentConfig::new("solo", "Solo"));
        let request_id = agent.handle_input("ask Proceed?").unwrap();

        let mut cursor = EventCursor::at(0);
        let question = agent
            .events()
            .wait_for(&mut cursor, &CancellationToken::new(), |event| {
                match &event.payload {
                    EventPayload::HumanRequest { request_id, .. } => Some(*request_id),
                    _ => None,
                }
            })
            .await
            .unwrap();

        assert!(matches!(
            agent.send_human_response(
                RequestId::new(),
                HumanResponse::Text { text: "wrong".to_string() }
            ),
            Err(AgentError::HumanRequestNotFound { .. })
        ));
        agent
            .send_human_response(question, HumanResponse::Text { text: "yes".to_string() })
            .unwrap();

        let outcome = agent.wait_for_completion(request_id).await.unwrap();
        assert_eq!(outcome.message, "yes");
        assert!(!agent.has_open_human_request(question));
    }

    #[tokio::test]
    async fn headless_agent_cannot_ask() {
        let agent = spawn_agent(AgentConfig::new("worker", "Worker").headless(true));
        let err = agent
            .ask_human(HumanRequest::Text {
                question: "?".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Headless { .. }));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_cancels_queue() {
        let agent = spawn_agent(AgentConfig::new("solo", "Solo"));
        let running = agent.handle_input("hang").unwrap();
        let queued = agent.handle_input("echo never").unwrap();

        agent.shutdown("done");
        agent.shutdown("again");

        assert_eq!(
            agent.wait_for_completion(running).await.unwrap().status,
            InputStatus::Cancelled
        );
        assert_eq!(
            agent.wait_for_completion(queued).await.unwrap().status,
            InputStatus::Cancelled
        );
        assert_eq!(agent.wait_until_idle().await, AgentStatus::Stopped);
        assert!(matches!(
            agent.handle_input("echo late"),
            Err(AgentError::Stopped { .. })
        ));

        let stops = agent
            .events()
            .snapshot()
            .iter()
            .filter(|e| e.kind() == "agent.stopped")
            .count();
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn reset_clears_bound_slices_and_keeps_log() {
        let agent = spawn_agent(AgentConfig::new("solo", "Solo"));
        agent
            .mutate_state::<Transcript, _>(|t| t.push("user", "hello"))
            .unwrap();
        let before = agent.events().len();

        agent.reset(&[ResetScope::Chat]);

        assert_eq!(agent.get_state::<Transcript, _>(Transcript::len).unwrap(), 0);
        assert_eq!(agent.events().len(), before + 1);
        assert_eq!(kinds(&agent).last(), Some(&"reset"));
    }

    #[tokio::test]
    async fn checkpoint_restore_sanitizes_log_and_warns_on_unknown_slices() {
        let source = spawn_agent(AgentConfig::new("solo", "Solo"));
        source
            .mutate_state::<Transcript, _>(|t| t.push("user", "remember me"))
            .unwrap();
        let done = source.handle_input("echo kept").unwrap();
        source.wait_for_completion(done).await.unwrap();

        let mut checkpoint = source.generate_checkpoint().unwrap();
        let mut events: Vec<AgentEvent> =
            serde_json::from_value(checkpoint.state[EVENT_LOG_STATE].clone()).unwrap();
        events.push(AgentEvent::new(EventPayload::InputReceived {
            request_id: RequestId::new(),
            message: "orphan".to_string(),
        }));
        events.push(AgentEvent::new(EventPayload::AgentStopped {
            reason: "old shutdown".to_string(),
        }));
        checkpoint.state.insert(
            EVENT_LOG_STATE.to_string(),
            serde_json::to_value(&events).unwrap(),
        );
        checkpoint
            .state
            .insert("retired_slice".to_string(), json!({"x": 1}));

        let target = spawn_agent(AgentConfig::new("solo", "Solo"));
        target.wait_until_idle().await;
        target.restore_checkpoint(checkpoint).unwrap();

        assert_eq!(
            target.get_state::<Transcript, _>(Transcript::len).unwrap(),
            1
        );
        assert!(!target.events().any(|e| e.kind() == "agent.stopped"));
        assert!(!target.events().any(|e| matches!(
            &e.payload,
            EventPayload::InputReceived { message, .. } if message == "orphan"
        )));
        assert!(target.events().any(|e| e.request_id() == Some(done)));
        assert!(target.events().any(|e| matches!(
            &e.payload,
            EventPayload::WarningOutput { message } if message.contains("retired_slice")
        )));
    }

    #[tokio::test]
    async fn malformed_slice_payload_fails_restore() {
        let agent = spawn_agent(AgentConfig::new("solo", "Solo"));
        agent.wait_until_idle().await;

        let mut state = SliceData::new();
        state.insert(Transcript::NAME.to_string(), json!("not a list"));
        let checkpoint = Checkpoint {
            agent_id: AgentId::new(),
            created_at: current_timestamp(),
            name: None,
            state,
        };

        assert!(matches!(
            agent.restore_checkpoint(checkpoint),
            Err(AgentError::Slice(SliceError::Deserialize { .. }))
        ));
    }

    #[tokio::test]
    async fn failed_restore_keeps_prior_slices_and_log() {
        let agent = spawn_agent(AgentConfig::new("solo", "Solo").with_enabled_tools(["search"]));
        agent.wait_until_idle().await;
        let events_before = agent.events().snapshot();

        let mut state = SliceData::new();
        state.insert(EnabledTools::NAME.to_string(), json!(["rm_rf"]));
        state.insert(Transcript::NAME.to_string(), json!("not a list"));
        let checkpoint = Checkpoint {
            agent_id: AgentId::new(),
            created_at: current_timestamp(),
            name: None,
            state,
        };

        assert!(agent.restore_checkpoint(checkpoint).is_err());
        let (search, rm_rf) = agent
            .get_state::<EnabledTools, _>(|t| (t.is_enabled("search"), t.is_enabled("rm_rf")))
            .unwrap();
        assert!(search);
        assert!(!rm_rf);
        assert_eq!(agent.events().snapshot(), events_before);
    }

    #[tokio::test]
    async fn restore_is_rejected_while_input_is_queued() {
        let config = AgentConfig::new("solo", "Solo");
        let registry = SliceCatalog::new().build_registry(&config).unwrap();
        let (agent, _inbox) = Agent::new(Arc::new(config), None, registry);
        agent.handle_input("echo later").unwrap();
        assert_eq!(agent.status(), AgentStatus::Initializing);

        let checkpoint = agent.generate_checkpoint().unwrap();
        assert!(matches!(
            agent.restore_checkpoint(checkpoint),
            Err(AgentError::Busy { .. })
        ));
    }

    #[tokio::test]
    async fn idle_duration_only_counts_while_idle() {
        let agent = spawn_agent(
            AgentConfig::new("solo", "Solo").with_idle_timeout(Duration::from_millis(20)),
        );
        agent.wait_until_idle().await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let now = Instant::now();
        assert!(agent.idle_duration(now) >= Duration::from_millis(20));
        assert!(agent.retirement_reason(now).is_some());

        let descriptor = agent.descriptor();
        assert!(descriptor.idle);
        assert_eq!(descriptor.agent_type, "solo");
    }
}
