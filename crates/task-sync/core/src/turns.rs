//! Grouping of a flat conversation into display turns.
//!
//! An assistant message opens a run that absorbs everything up to the next
//! user, developer, or system message. Inside the run, tool calls become
//! [`ToolInteraction`]s, tool messages attach to the open call they answer,
//! and the last content-only assistant message is the turn's visible reply.

use serde::Serialize;

use crate::message::{Role, ToolCall, UnifiedMessage};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationTurn {
    Assistant(AssistantTurn),
    Message { role: Role, message: UnifiedMessage },
}

impl ConversationTurn {
    #[must_use]
    pub fn role(&self) -> Role {
        match self {
            Self::Assistant(_) => Role::Assistant,
            Self::Message { role, .. } => role.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssistantTurn {
    pub assistant_messages: Vec<UnifiedMessage>,
    pub tool_interactions: Vec<ToolInteraction>,
    pub orphan_tool_messages: Vec<UnifiedMessage>,
    pub final_content: Option<String>,
    pub final_reasoning: Option<String>,
}

impl AssistantTurn {
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.assistant_messages
            .iter()
            .any(|message| message.is_streaming)
    }

    /// Calls still waiting for a response.
    #[must_use]
    pub fn pending_tool_calls(&self) -> usize {
        self.tool_interactions
            .iter()
            .filter(|interaction| interaction.tool_response.is_none())
            .count()
    }

    fn attach_tool_message(&mut self, message: &UnifiedMessage) {
        let open_call = match message.tool_call_id.as_deref() {
            Some(call_id) => self.tool_interactions.iter_mut().find(|interaction| {
                interaction.tool_response.is_none() && interaction.tool_call.id == call_id
            }),
            None => None,
        };

        match open_call {
            Some(interaction) => interaction.tool_response = Some(message.clone()),
            None => self.orphan_tool_messages.push(message.clone()),
        }
    }
}

/// One tool call paired with its response, if it has arrived.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInteraction {
    pub reasoning: Option<String>,
    pub content_with_tool_calls: Option<String>,
    pub tool_call: ToolCall,
    pub tool_response: Option<UnifiedMessage>,
}

#[must_use]
pub fn group_turns(messages: &[UnifiedMessage]) -> Vec<ConversationTurn> {
    let mut turns = Vec::new();
    let mut cursor = 0;

    while let Some(message) = messages.get(cursor) {
        if message.role == Role::Assistant {
            let end = run_end(messages, cursor);
            turns.push(ConversationTurn::Assistant(assistant_turn(
                &messages[cursor..end],
            )));
            cursor = end;
        } else {
            turns.push(ConversationTurn::Message {
                role: message.role.clone(),
                message: message.clone(),
            });
            cursor += 1;
        }
    }

    turns
}

fn run_end(messages: &[UnifiedMessage], start: usize) -> usize {
    messages
        .iter()
        .enumerate()
        .skip(start + 1)
        .find(|(_, message)| message.role.ends_assistant_run())
        .map_or(messages.len(), |(position, _)| position)
}

fn assistant_turn(run: &[UnifiedMessage]) -> AssistantTurn {
    let mut turn = AssistantTurn::default();

    for message in run {
        match message.role {
            Role::Assistant => {
                turn.assistant_messages.push(message.clone());
                if message.has_tool_calls() {
                    for (position, tool_call) in message.tool_calls.iter().enumerate() {
                        let first = position == 0;
                        turn.tool_interactions.push(ToolInteraction {
                            reasoning: if first { message.reasoning_text() } else { None },
                            content_with_tool_calls: if first { message.text() } else { None },
                            tool_call: tool_call.clone(),
                            tool_response: None,
                        });
                    }
                } else if let Some(content) = message.text() {
                    turn.final_content = Some(content);
                    turn.final_reasoning = message.reasoning_text();
                }
            }
            Role::Tool => turn.attach_tool_message(message),
            _ => {}
        }
    }

    turn
}
