//! Runs a child agent on behalf of a parent and relays between the two logs.
//!
//! Two relay loops share one cancellation token: child→parent forwards output
//! and watches for the child's completion, parent→child forwards aborts and
//! human answers. Whichever finishes first, or the timeout, ends the run.
//! Every failure comes back as an error-status [`SubAgentResult`]; a sub-agent
//! run never fails its parent.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::app::domain::event::{AgentEvent, EventPayload, InputStatus};
use crate::app::domain::event_log::{EventCursor, EventLog};
use crate::app::domain::slices::SubAgentSettings;
use crate::app::domain::types::{AgentId, RequestId};
use crate::config::{SpawnOverrides, SubAgentOptions, SubAgentOverrides};
use crate::utils::truncate::truncate_middle;

use super::agent::{Agent, AgentStatus};
use super::orchestrator::OrchestratorHandle;

#[derive(Debug, Clone)]
pub struct SubAgentRequest {
    pub agent_type: String,
    pub message: String,
    /// Return as soon as the child has accepted the input.
    pub background: bool,
    /// Leave the child registered after the run.
    pub keep_alive: bool,
    pub options: SubAgentOverrides,
    pub spawn: SpawnOverrides,
}

impl SubAgentRequest {
    pub fn new(agent_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            message: message.into(),
            background: false,
            keep_alive: false,
            options: SubAgentOverrides::default(),
            spawn: SpawnOverrides::default(),
        }
    }

    pub fn in_background(mut self) -> Self {
        self.background = true;
        self
    }

    pub fn keep_alive(mut self) -> Self {
        self.keep_alive = true;
        self
    }

    pub fn with_options(mut self, options: SubAgentOverrides) -> Self {
        self.options = options;
        self
    }

    pub fn with_spawn_overrides(mut self, spawn: SpawnOverrides) -> Self {
        self.spawn = spawn;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAgentResult {
    pub status: InputStatus,
    pub response: String,
    pub child_id: Option<AgentId>,
}

impl SubAgentResult {
    fn failed(child_id: Option<AgentId>, response: impl Into<String>) -> Self {
        Self {
            status: InputStatus::Error,
            response: response.into(),
            child_id,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == InputStatus::Success
    }
}

#[derive(Debug)]
pub enum SubAgentOutcome {
    Completed(SubAgentResult),
    /// The child is running on its own; nothing is relayed and nothing is
    /// cleaned up.
    Background { child: Agent, request_id: RequestId },
}

impl SubAgentOutcome {
    pub fn result(&self) -> Option<&SubAgentResult> {
        match self {
            SubAgentOutcome::Completed(result) => Some(result),
            SubAgentOutcome::Background { .. } => None,
        }
    }
}

enum Relay {
    Completed { status: InputStatus, message: String },
    ChildEnded { reason: String },
    Cancelled,
    TimedOut,
}

pub async fn run_sub_agent(
    parent: &Agent,
    orchestrator: &OrchestratorHandle,
    request: SubAgentRequest,
    cancel: &CancellationToken,
) -> SubAgentOutcome {
    let agent_type = request.agent_type.clone();
    match AssertUnwindSafe(run(parent, orchestrator, request, cancel))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::error!(
                parent_id = %parent.id(),
                agent_type = %agent_type,
                "Sub-agent run panicked"
            );
            SubAgentOutcome::Completed(SubAgentResult::failed(
                None,
                format!("Sub-agent '{agent_type}' failed unexpectedly"),
            ))
        }
    }
}

async fn run(
    parent: &Agent,
    orchestrator: &OrchestratorHandle,
    request: SubAgentRequest,
    cancel: &CancellationToken,
) -> SubAgentOutcome {
    let SubAgentRequest {
        agent_type,
        message,
        background,
        keep_alive,
        options,
        spawn,
    } = request;

    if !parent.config().sub_agents.allows(&agent_type) {
        return SubAgentOutcome::Completed(SubAgentResult::failed(
            None,
            format!(
                "Agent type '{agent_type}' is not allowed as a sub-agent of '{}'",
                parent.agent_type()
            ),
        ));
    }
    let options = resolve_options(parent, &options);

    let mut parent_cursor = parent.events().create_cursor();
    let child = match orchestrator
        .spawn_sub_agent(parent, &agent_type, spawn)
        .await
    {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(parent_id = %parent.id(), agent_type = %agent_type, error = %e, "Failed to spawn sub-agent");
            return SubAgentOutcome::Completed(SubAgentResult::failed(
                None,
                format!("Failed to start sub-agent '{agent_type}': {e}"),
            ));
        }
    };
    let mut guard = CleanupOnDrop {
        orchestrator: orchestrator.clone(),
        parent: parent.clone(),
        child: Some(child.clone()),
        collected: Collected::default(),
    };
    child.wait_until_idle().await;

    let mut child_cursor = child.events().create_cursor();
    let request_id = match child.handle_input(message) {
        Ok(request_id) => request_id,
        Err(e) => {
            guard.disarm();
            cleanup(orchestrator, &child, "Sub-agent rejected its input").await;
            return SubAgentOutcome::Completed(SubAgentResult::failed(
                Some(child.id()),
                format!("Sub-agent rejected its input: {e}"),
            ));
        }
    };

    if background {
        tracing::info!(
            parent_id = %parent.id(),
            child_id = %child.id(),
            request_id = %request_id,
            "Sub-agent running in background"
        );
        guard.disarm();
        return SubAgentOutcome::Background { child, request_id };
    }

    let shared = cancel.child_token();
    let _cancel_on_exit = shared.clone().drop_guard();

    let relay = tokio::select! {
        biased;
        relay = child_to_parent(
            &child,
            parent,
            &mut child_cursor,
            request_id,
            &options,
            &shared,
            &mut guard.collected,
        ) => relay,
        () = parent_to_child(parent, &child, &mut parent_cursor, &shared) => Relay::Cancelled,
        () = tokio::time::sleep(options.timeout) => Relay::TimedOut,
    };
    shared.cancel();

    // Controls that landed on the parent while the loops were winding down.
    for event in parent.events().drain(&mut parent_cursor) {
        relay_control(&event, &child);
    }
    guard.withdraw_relayed_questions();
    let response = std::mem::take(&mut guard.collected.response);

    let (status, text) = match relay {
        Relay::Completed { status, message } => {
            let text = if status == InputStatus::Success && message.is_empty() {
                response
            } else {
                message
            };
            (status, text)
        }
        Relay::ChildEnded { reason } => (
            InputStatus::Error,
            format!("Sub-agent stopped before completing: {reason}"),
        ),
        Relay::Cancelled => {
            if child.status() == AgentStatus::Busy {
                child.request_abort("Sub-agent run cancelled");
            }
            (
                InputStatus::Cancelled,
                "Sub-agent run was cancelled".to_string(),
            )
        }
        Relay::TimedOut => {
            child.request_abort("Sub-agent timed out");
            (
                InputStatus::Cancelled,
                format!(
                    "Sub-agent timed out after {}s",
                    options.timeout.as_secs_f64()
                ),
            )
        }
    };

    tracing::info!(
        parent_id = %parent.id(),
        child_id = %child.id(),
        request_id = %request_id,
        status = %status,
        "Sub-agent run finished"
    );

    guard.disarm();
    if !keep_alive {
        cleanup(orchestrator, &child, "Sub-agent run finished").await;
    }

    SubAgentOutcome::Completed(SubAgentResult {
        status,
        response: truncate_middle(
            &text,
            options.max_response_length,
            options.min_context_length,
        ),
        child_id: Some(child.id()),
    })
}

fn resolve_options(parent: &Agent, overrides: &SubAgentOverrides) -> SubAgentOptions {
    let base = parent
        .get_state::<SubAgentSettings, _>(|settings| settings.current.clone())
        .unwrap_or_else(|_| parent.config().sub_agents.options.clone());
    overrides.apply(&base)
}

async fn child_to_parent(
    child: &Agent,
    parent: &Agent,
    cursor: &mut EventCursor,
    request_id: RequestId,
    options: &SubAgentOptions,
    shared: &CancellationToken,
    collected: &mut Collected,
) -> Relay {
    let mut subscription = child.events().subscribe(shared.clone());
    loop {
        for event in child.events().drain(cursor) {
            if let Some(relay) =
                forward_to_parent(&event, child, parent, request_id, options, collected)
            {
                return relay;
            }
        }
        if subscription.next().await.is_none() {
            return Relay::Cancelled;
        }
    }
}

fn forward_to_parent(
    event: &AgentEvent,
    child: &Agent,
    parent: &Agent,
    request_id: RequestId,
    options: &SubAgentOptions,
    collected: &mut Collected,
) -> Option<Relay> {
    match &event.payload {
        EventPayload::ChatOutput { content } => {
            let response = &mut collected.response;
            if !response.is_empty() {
                response.push('\n');
            }
            response.push_str(content);
            if options.forward_chat_output {
                parent.emit(event.payload.clone());
            }
        }
        EventPayload::ReasoningOutput { .. } if options.forward_reasoning => {
            parent.emit(event.payload.clone());
        }
        EventPayload::InfoOutput { .. } | EventPayload::WarningOutput { .. }
            if options.forward_system_output =>
        {
            parent.emit(event.payload.clone());
        }
        EventPayload::ErrorOutput { .. } => {
            parent.emit(event.payload.clone());
        }
        EventPayload::ArtifactOutput { .. } if options.forward_artifacts => {
            parent.emit(event.payload.clone());
        }
        EventPayload::HumanRequest {
            request_id: asked,
            request,
        } if options.forward_human_requests => {
            if !has_event(parent.events(), "human.request", *asked) {
                parent.relay_human_request(*asked, request.clone());
                collected.relayed_questions.push(*asked);
            }
        }
        EventPayload::Abort { reason } => {
            parent.warning_message(format!("Sub-agent '{}' aborted: {reason}", child.name()));
        }
        EventPayload::InputHandled {
            request_id: handled,
            status,
            message,
        } if *handled == request_id => {
            return Some(Relay::Completed {
                status: *status,
                message: message.clone(),
            });
        }
        EventPayload::AgentStopped { reason } => {
            return Some(Relay::ChildEnded {
                reason: reason.clone(),
            });
        }
        _ => {}
    }
    None
}

async fn parent_to_child(
    parent: &Agent,
    child: &Agent,
    cursor: &mut EventCursor,
    shared: &CancellationToken,
) {
    let mut subscription = parent.events().subscribe(shared.clone());
    loop {
        for event in parent.events().drain(cursor) {
            relay_control(&event, child);
        }
        if subscription.next().await.is_none() {
            return;
        }
    }
}

fn relay_control(event: &AgentEvent, child: &Agent) {
    match &event.payload {
        EventPayload::Abort { reason } => {
            child.request_abort(reason.clone());
        }
        EventPayload::HumanResponse {
            request_id,
            response,
        } => {
            if has_event(child.events(), "human.response", *request_id)
                || !child.has_open_human_request(*request_id)
            {
                return;
            }
            if let Err(e) = child.send_human_response(*request_id, response.clone()) {
                tracing::debug!(
                    child_id = %child.id(),
                    request_id = %request_id,
                    error = %e,
                    "Dropped human response for sub-agent"
                );
            }
        }
        _ => {}
    }
}

fn has_event(log: &EventLog, kind: &str, request_id: RequestId) -> bool {
    log.any(|event| event.kind() == kind && event.request_id() == Some(request_id))
}

/// What the child→parent loop gathers over a run.
#[derive(Debug, Default)]
struct Collected {
    /// Chat output joined by newlines.
    response: String,
    /// Child questions surfaced on the parent.
    relayed_questions: Vec<RequestId>,
}

/// Stops and deregisters the child when a run is dropped or unwinds before
/// reaching its own cleanup.
struct CleanupOnDrop {
    orchestrator: OrchestratorHandle,
    parent: Agent,
    child: Option<Agent>,
    collected: Collected,
}

impl CleanupOnDrop {
    fn disarm(&mut self) {
        self.child = None;
    }

    /// Nothing relays answers once the run is over, so relayed questions the
    /// parent has not answered are closed.
    fn withdraw_relayed_questions(&mut self) {
        for request_id in self.collected.relayed_questions.drain(..) {
            self.parent.withdraw_human_request(request_id);
        }
    }
}

impl Drop for CleanupOnDrop {
    fn drop(&mut self) {
        self.withdraw_relayed_questions();
        let Some(child) = self.child.take() else {
            return;
        };
        let reason = "Sub-agent run ended unexpectedly";
        child.shutdown(reason);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let orchestrator = self.orchestrator.clone();
            runtime.spawn(async move {
                let _ = orchestrator.delete_agent(child.id(), reason).await;
            });
        }
    }
}

async fn cleanup(orchestrator: &OrchestratorHandle, child: &Agent, reason: &str) {
    child.shutdown(reason);
    if let Err(e) = orchestrator.delete_agent(child.id(), reason).await {
        tracing::warn!(child_id = %child.id(), error = %e, "Failed to deregister sub-agent");
    }
}
