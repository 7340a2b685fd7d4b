use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::app::domain::types::{RequestId, Timestamp, current_timestamp};

/// One entry of an agent's event log. The wire shape is
/// `{"type": ..., "timestamp": ..., ...fields}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum EventPayload {
    #[serde(rename = "agent.created")]
    AgentCreated { message: String },

    #[serde(rename = "agent.stopped")]
    AgentStopped { reason: String },

    #[serde(rename = "output.chat")]
    ChatOutput { content: String },

    #[serde(rename = "output.reasoning")]
    ReasoningOutput { content: String },

    #[serde(rename = "output.info")]
    InfoOutput { message: String },

    #[serde(rename = "output.warning")]
    WarningOutput { message: String },

    #[serde(rename = "output.error")]
    ErrorOutput { message: String },

    #[serde(rename = "output.artifact")]
    ArtifactOutput {
        name: String,
        mime_type: String,
        body: String,
    },

    #[serde(rename = "input.received")]
    InputReceived {
        request_id: RequestId,
        message: String,
    },

    #[serde(rename = "input.handled")]
    InputHandled {
        request_id: RequestId,
        status: InputStatus,
        message: String,
    },

    #[serde(rename = "human.request")]
    HumanRequest {
        request_id: RequestId,
        request: HumanRequest,
    },

    #[serde(rename = "human.response")]
    HumanResponse {
        request_id: RequestId,
        response: HumanResponse,
    },

    #[serde(rename = "reset")]
    Reset { scopes: Vec<ResetScope> },

    #[serde(rename = "abort")]
    Abort { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InputStatus {
    Success,
    Error,
    Cancelled,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ResetScope {
    Chat,
    Memory,
    Settings,
    Costs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HumanRequest {
    Text {
        question: String,
    },
    Confirm {
        question: String,
        #[serde(default)]
        default: bool,
    },
    Choice {
        question: String,
        options: Vec<String>,
        #[serde(default)]
        multiple: bool,
    },
}

impl HumanRequest {
    pub fn question(&self) -> &str {
        match self {
            HumanRequest::Text { question }
            | HumanRequest::Confirm { question, .. }
            | HumanRequest::Choice { question, .. } => question,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HumanResponse {
    Text { text: String },
    Confirm { confirmed: bool },
    Choice { selected: Vec<String> },
}

impl AgentEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            timestamp: current_timestamp(),
            payload,
        }
    }

    /// The wire discriminator, e.g. `"input.handled"`.
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            EventPayload::AgentCreated { .. } => "agent.created",
            EventPayload::AgentStopped { .. } => "agent.stopped",
            EventPayload::ChatOutput { .. } => "output.chat",
            EventPayload::ReasoningOutput { .. } => "output.reasoning",
            EventPayload::InfoOutput { .. } => "output.info",
            EventPayload::WarningOutput { .. } => "output.warning",
            EventPayload::ErrorOutput { .. } => "output.error",
            EventPayload::ArtifactOutput { .. } => "output.artifact",
            EventPayload::InputReceived { .. } => "input.received",
            EventPayload::InputHandled { .. } => "input.handled",
            EventPayload::HumanRequest { .. } => "human.request",
            EventPayload::HumanResponse { .. } => "human.response",
            EventPayload::Reset { .. } => "reset",
            EventPayload::Abort { .. } => "abort",
        }
    }

    pub fn request_id(&self) -> Option<RequestId> {
        match &self.payload {
            EventPayload::InputReceived { request_id, .. }
            | EventPayload::InputHandled { request_id, .. }
            | EventPayload::HumanRequest { request_id, .. }
            | EventPayload::HumanResponse { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::ErrorOutput { .. }
                | EventPayload::InputHandled {
                    status: InputStatus::Error,
                    ..
                }
        )
    }
}

impl From<EventPayload> for AgentEvent {
    fn from(payload: EventPayload) -> Self {
        AgentEvent::new(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn input_handled_uses_flat_wire_shape() {
        let request_id = RequestId::new();
        let event = AgentEvent {
            timestamp: 42,
            payload: EventPayload::InputHandled {
                request_id,
                status: InputStatus::Success,
                message: "done".to_string(),
            },
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "input.handled",
                "timestamp": 42,
                "requestId": request_id.to_string(),
                "status": "success",
                "message": "done",
            })
        );
    }

    #[test]
    fn human_request_payload_parses_from_wire() {
        let request_id = RequestId::new();
        let value = json!({
            "type": "human.request",
            "timestamp": 7,
            "requestId": request_id.to_string(),
            "request": {
                "kind": "choice",
                "question": "Pick one",
                "options": ["a", "b"],
            },
        });

        let event: AgentEvent = serde_json::from_value(value).unwrap();
        assert_eq!(event.kind(), "human.request");
        assert_eq!(event.request_id(), Some(request_id));
        match event.payload {
            EventPayload::HumanRequest {
                request: HumanRequest::Choice { options, multiple, .. },
                ..
            } => {
                assert_eq!(options, vec!["a".to_string(), "b".to_string()]);
                assert!(!multiple);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn reset_scopes_serialize_lowercase() {
        let event = AgentEvent::new(EventPayload::Reset {
            scopes: vec![ResetScope::Chat, ResetScope::Costs],
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["scopes"], json!(["chat", "costs"]));
        assert_eq!("settings".parse::<ResetScope>().unwrap(), ResetScope::Settings);
    }
}
