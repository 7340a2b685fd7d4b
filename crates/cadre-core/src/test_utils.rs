//! Test utilities for cadre-core
//!
//! This module provides helpers for testing that need to be accessible
//! across crate boundaries.

use std::time::Duration;

use async_trait::async_trait;

use crate::app::domain::event::{EventPayload, HumanRequest, HumanResponse, InputStatus};
use crate::app::domain::slices::Transcript;
use crate::app::domain::types::RequestId;
use crate::app::runtime::bridge::{SubAgentOutcome, SubAgentRequest};
use crate::app::runtime::command::{CommandContext, CommandDispatcher, CommandError};

/// Dispatcher driven by a tiny command language, one verb per input:
///
/// - `echo <text>`: emits chat output and returns the text
/// - `chat <text>`: emits chat output only
/// - `reason <text>` / `info <text>`: emits reasoning or info output
/// - `fail <text>`: fails with an execution error
/// - `panic`: panics inside the handler
/// - `sleep <ms>`: sleeps, honoring cancellation
/// - `hang`: waits until cancelled
/// - `ask <question>`: asks the human and returns the answer
/// - `decoy <text>`: emits an unrelated `input.handled`, then echoes
/// - `note <text>`: records the text in the transcript slice
/// - `delegate <type> <message>`: runs a sub-agent and returns its response
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptedDispatcher;

#[async_trait]
impl CommandDispatcher for ScriptedDispatcher {
    async fn execute(
        &self,
        ctx: CommandContext,
        input: String,
    ) -> Result<Option<String>, CommandError> {
        let (verb, rest) = input
            .split_once(' ')
            .map_or((input.as_str(), ""), |(verb, rest)| (verb, rest));
        let agent = &ctx.agent;

        match verb {
            "echo" => {
                agent.chat_output(rest);
                Ok(Some(rest.to_string()))
            }
            "chat" => {
                agent.chat_output(rest);
                Ok(None)
            }
            "reason" => {
                agent.reasoning_output(rest);
                Ok(None)
            }
            "info" => {
                agent.info_message(rest);
                Ok(None)
            }
            "fail" => Err(CommandError::execution(rest)),
            #[expect(clippy::panic)]
            "panic" => panic!("scripted panic"),
            "sleep" => {
                let millis = rest
                    .parse()
                    .map_err(|_| CommandError::execution(format!("bad duration: {rest}")))?;
                tokio::select! {
                    () = ctx.cancel.cancelled() => Err(CommandError::Cancelled),
                    () = tokio::time::sleep(Duration::from_millis(millis)) => Ok(None),
                }
            }
            "hang" => {
                ctx.cancel.cancelled().await;
                Err(CommandError::Cancelled)
            }
            "ask" => {
                let response = agent
                    .ask_human(HumanRequest::Text {
                        question: rest.to_string(),
                    })
                    .await?;
                match response {
                    HumanResponse::Text { text } => Ok(Some(text)),
                    HumanResponse::Confirm { confirmed } => Ok(Some(confirmed.to_string())),
                    HumanResponse::Choice { selected } => Ok(Some(selected.join(","))),
                }
            }
            "decoy" => {
                agent.emit(EventPayload::InputHandled {
                    request_id: RequestId::new(),
                    status: InputStatus::Success,
                    message: "decoy".to_string(),
                });
                agent.chat_output(rest);
                Ok(Some(rest.to_string()))
            }
            "note" => {
                agent.mutate_state::<Transcript, _>(|t| t.push("user", rest))?;
                Ok(None)
            }
            "delegate" => {
                let (agent_type, message) = rest
                    .split_once(' ')
                    .ok_or_else(|| CommandError::execution("usage: delegate <type> <message>"))?;
                match ctx
                    .run_sub_agent(SubAgentRequest::new(agent_type, message))
                    .await
                {
                    SubAgentOutcome::Completed(result) if result.is_success() => {
                        Ok(Some(result.response))
                    }
                    SubAgentOutcome::Completed(result) => {
                        Err(CommandError::execution(result.response))
                    }
                    SubAgentOutcome::Background { child, .. } => Ok(Some(child.id().to_string())),
                }
            }
            other => Err(CommandError::UnknownCommand {
                command: other.to_string(),
            }),
        }
    }
}
