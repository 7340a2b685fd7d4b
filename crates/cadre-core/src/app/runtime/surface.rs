//! Request/response operations exposed to transports.
//!
//! Each call addresses an agent by id and returns plain data, so an RPC
//! layer can map them one to one.

use serde::{Deserialize, Serialize};

use crate::app::domain::event::{AgentEvent, HumanResponse, ResetScope};
use crate::app::domain::types::{AgentId, RequestId};
use crate::config::AgentConfig;

use super::agent::AgentDescriptor;
use super::orchestrator::{OrchestratorError, OrchestratorHandle};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsPage {
    pub events: Vec<AgentEvent>,
    /// Position to pass on the next call to continue after this page.
    pub next_position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTypeInfo {
    #[serde(rename = "type")]
    pub agent_type: String,
    pub name: String,
    pub description: String,
    pub headless: bool,
}

impl From<&AgentConfig> for AgentTypeInfo {
    fn from(config: &AgentConfig) -> Self {
        Self {
            agent_type: config.agent_type.clone(),
            name: config.name.clone(),
            description: config.description.clone(),
            headless: config.headless,
        }
    }
}

impl OrchestratorHandle {
    pub async fn get_agent_descriptor(
        &self,
        agent_id: AgentId,
    ) -> Result<AgentDescriptor, OrchestratorError> {
        Ok(self.agent(agent_id).await?.descriptor())
    }

    /// Events from `position` onwards. A position past the end yields an
    /// empty page that points at the current end.
    pub async fn get_events_from_position(
        &self,
        agent_id: AgentId,
        position: usize,
    ) -> Result<EventsPage, OrchestratorError> {
        let agent = self.agent(agent_id).await?;
        let events = agent.events().events_from(position);
        let next_position = if events.is_empty() {
            agent.events().len().min(position)
        } else {
            position + events.len()
        };
        Ok(EventsPage {
            events,
            next_position,
        })
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentDescriptor>, OrchestratorError> {
        let mut descriptors: Vec<_> = self
            .agents()
            .await?
            .iter()
            .map(|agent| agent.descriptor())
            .collect();
        descriptors.sort_by_key(|d| d.created_at);
        Ok(descriptors)
    }

    pub async fn list_agent_types(&self) -> Result<Vec<AgentTypeInfo>, OrchestratorError> {
        let mut types: Vec<AgentTypeInfo> = self
            .agent_types()
            .await?
            .iter()
            .map(|config| AgentTypeInfo::from(config.as_ref()))
            .collect();
        types.sort_by(|a, b| a.agent_type.cmp(&b.agent_type));
        Ok(types)
    }

    pub async fn create_agent(&self, agent_type: &str) -> Result<AgentId, OrchestratorError> {
        Ok(self.spawn_agent(agent_type).await?.id())
    }

    pub async fn send_input(
        &self,
        agent_id: AgentId,
        message: impl Into<String>,
    ) -> Result<RequestId, OrchestratorError> {
        Ok(self.agent(agent_id).await?.handle_input(message)?)
    }

    pub async fn send_human_response(
        &self,
        agent_id: AgentId,
        request_id: RequestId,
        response: HumanResponse,
    ) -> Result<(), OrchestratorError> {
        Ok(self
            .agent(agent_id)
            .await?
            .send_human_response(request_id, response)?)
    }

    /// Returns whether a request was in flight.
    pub async fn request_abort(
        &self,
        agent_id: AgentId,
        reason: impl Into<String>,
    ) -> Result<bool, OrchestratorError> {
        Ok(self.agent(agent_id).await?.request_abort(reason))
    }

    pub async fn request_reset(
        &self,
        agent_id: AgentId,
        scopes: &[ResetScope],
    ) -> Result<(), OrchestratorError> {
        self.agent(agent_id).await?.reset(scopes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::domain::event::EventPayload;
    use crate::app::runtime::OrchestratorService;
    use crate::test_utils::ScriptedDispatcher;
    use std::sync::Arc;

    fn service() -> OrchestratorService {
        OrchestratorService::builder(Arc::new(ScriptedDispatcher))
            .with_agent_configs([
                AgentConfig::new("writer", "Writer").with_description("Writes things"),
                AgentConfig::new("critic", "Critic").headless(true),
            ])
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn lists_agent_types_sorted() {
        let service = service();
        let types = service.handle().list_agent_types().await.unwrap();

        let names: Vec<_> = types.iter().map(|t| t.agent_type.as_str()).collect();
        assert_eq!(names, vec!["critic", "writer"]);
        assert!(types[0].headless);
        assert_eq!(types[1].description, "Writes things");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn send_input_and_page_through_events() {
        let service = service();
        let handle = service.handle();

        let id = handle.create_agent("writer").await.unwrap();
        let request_id = handle.send_input(id, "echo hi").await.unwrap();
        let agent = handle.agent(id).await.unwrap();
        agent.wait_for_completion(request_id).await.unwrap();

        let page = handle.get_events_from_position(id, 0).await.unwrap();
        assert_eq!(page.next_position, page.events.len());
        assert!(page.events.iter().any(|e| matches!(
            &e.payload,
            EventPayload::ChatOutput { content } if content == "hi"
        )));

        let rest = handle
            .get_events_from_position(id, page.next_position + 10)
            .await
            .unwrap();
        assert!(rest.events.is_empty());
        assert_eq!(rest.next_position, page.next_position);

        let descriptor = handle.get_agent_descriptor(id).await.unwrap();
        assert_eq!(descriptor.agent_type, "writer");
        assert_eq!(descriptor.event_count, page.next_position);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_agent_is_not_found() {
        let service = service();
        let err = service
            .handle()
            .send_input(AgentId::new(), "echo hi")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::AgentNotFound { .. }));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn abort_and_reset_are_recorded() {
        let service = service();
        let handle = service.handle();
        let id = handle.create_agent("writer").await.unwrap();

        assert!(!handle.request_abort(id, "nothing running").await.unwrap());
        handle
            .request_reset(id, &[ResetScope::Chat])
            .await
            .unwrap();

        let kinds: Vec<_> = handle
            .get_events_from_position(id, 0)
            .await
            .unwrap()
            .events
            .iter()
            .map(AgentEvent::kind)
            .collect();
        assert!(kinds.contains(&"abort"));
        assert!(kinds.contains(&"reset"));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn list_agents_includes_created_agents() {
        let service = service();
        let handle = service.handle();
        let first = handle.create_agent("writer").await.unwrap();
        let second = handle.create_agent("critic").await.unwrap();

        let ids: Vec<_> = handle
            .list_agents()
            .await
            .unwrap()
            .iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first));
        assert!(ids.contains(&second));

        assert!(handle.delete_agent(first, "done").await.unwrap());
        assert_eq!(handle.list_agents().await.unwrap().len(), 1);
        service.shutdown().await;
    }
}
