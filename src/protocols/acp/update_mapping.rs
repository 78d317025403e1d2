//! Maps raw `session/update` notification params to [`SessionUpdate`].
//!
//! The discriminator (`sessionUpdate`) is decoded into a closed
//! [`UpdateKind`] first, then each kind has its own parse rule that checks
//! the required fields. Unknown kinds and payloads missing required fields
//! are logged and dropped; nothing here returns an error.

use serde_json::Value;

use crate::api::types::{
    AvailableCommand, MessageRole, PlanEntry, PlanEntryStatus, SessionId, SessionUpdate, ToolCall,
    ToolCallContent, ToolCallLocation, ToolCallUpdate, UNKNOWN_TOOL_CALL_ID,
};

/// Discriminator values of `session/update`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateKind {
    UserMessageChunk,
    AgentMessageChunk,
    AgentThoughtChunk,
    ToolCall,
    ToolCallUpdate,
    Plan,
    CurrentModeUpdate,
    AvailableCommandsUpdate,
    Unknown(String),
}

impl UpdateKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "user_message_chunk" => Self::UserMessageChunk,
            "agent_message_chunk" => Self::AgentMessageChunk,
            "agent_thought_chunk" => Self::AgentThoughtChunk,
            "tool_call" => Self::ToolCall,
            "tool_call_update" => Self::ToolCallUpdate,
            "plan" => Self::Plan,
            "current_mode_update" => Self::CurrentModeUpdate,
            "available_commands_update" => Self::AvailableCommandsUpdate,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Parse `session/update` params into the session id and a typed update.
///
/// Returns `None` when the notification should be dropped.
pub fn parse_session_notification(params: &Value) -> Option<(Option<SessionId>, SessionUpdate)> {
    let session_id = str_field(params, "sessionId");
    let update = params.get("update").unwrap_or(params);

    let Some(raw_kind) = str_field(update, "sessionUpdate") else {
        log::debug!("Session update without discriminator dropped");
        return None;
    };

    let kind = UpdateKind::parse(&raw_kind);
    let mapped = match &kind {
        UpdateKind::UserMessageChunk => message_chunk(update, MessageRole::User),
        UpdateKind::AgentMessageChunk => message_chunk(update, MessageRole::Agent),
        UpdateKind::AgentThoughtChunk => update
            .get("content")
            .and_then(content_block_text)
            .map(|text| SessionUpdate::ThoughtChunk { text }),
        UpdateKind::ToolCall => tool_call(update),
        UpdateKind::ToolCallUpdate => Some(tool_call_update(update)),
        UpdateKind::Plan => plan(update),
        UpdateKind::CurrentModeUpdate => str_field(update, "currentModeId")
            .or_else(|| str_field(update, "modeId"))
            .map(|mode_id| SessionUpdate::ModeChanged { mode_id }),
        UpdateKind::AvailableCommandsUpdate => available_commands(update),
        UpdateKind::Unknown(raw) => {
            log::debug!("Unknown session update dropped: kind={raw}");
            return None;
        }
    };

    if mapped.is_none() {
        log::warn!("Session update missing required fields dropped: kind={raw_kind}");
    }
    mapped.map(|update| (session_id, update))
}

fn message_chunk(update: &Value, role: MessageRole) -> Option<SessionUpdate> {
    let text = update.get("content").and_then(content_block_text)?;
    Some(SessionUpdate::MessageChunk { role, text })
}

/// Text carried by an ACP content block; `None` for non-text blocks.
fn content_block_text(block: &Value) -> Option<String> {
    match block.get("type").and_then(Value::as_str)? {
        "text" => str_field(block, "text"),
        "resource_link" => str_field(block, "uri"),
        "resource" => {
            let resource = block.get("resource")?;
            str_field(resource, "text").or_else(|| str_field(resource, "uri"))
        }
        _ => None,
    }
}

fn tool_call(update: &Value) -> Option<SessionUpdate> {
    let tool_call_id = str_field(update, "toolCallId")?;

    Some(SessionUpdate::ToolCall(ToolCall {
        title: str_field(update, "title").unwrap_or_else(|| tool_call_id.clone()),
        tool_call_id,
        kind: str_field(update, "kind"),
        status: str_field(update, "status"),
        content: update
            .get("content")
            .map(tool_call_contents)
            .unwrap_or_default(),
        locations: update
            .get("locations")
            .map(tool_call_locations)
            .unwrap_or_default(),
        raw_input: update.get("rawInput").cloned(),
    }))
}

fn tool_call_update(update: &Value) -> SessionUpdate {
    let tool_call_id = str_field(update, "toolCallId").unwrap_or_else(|| {
        log::debug!("Tool call update without id, using sentinel");
        UNKNOWN_TOOL_CALL_ID.to_string()
    });

    SessionUpdate::ToolCallUpdate(ToolCallUpdate {
        tool_call_id,
        title: str_field(update, "title"),
        kind: str_field(update, "kind"),
        status: str_field(update, "status"),
        content: update.get("content").map(tool_call_contents),
        locations: update.get("locations").map(tool_call_locations),
        raw_output: update.get("rawOutput").cloned(),
    })
}

/// Convert content items one by one; unknown or malformed items are skipped.
fn tool_call_contents(items: &Value) -> Vec<ToolCallContent> {
    let Some(items) = items.as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let converted = match item.get("type").and_then(Value::as_str) {
                Some("content") => item
                    .get("content")
                    .and_then(content_block_text)
                    .map(|text| ToolCallContent::Text { text }),
                Some("diff") => str_field(item, "path").map(|path| ToolCallContent::Diff {
                    path,
                    old_text: str_field(item, "oldText"),
                    new_text: str_field(item, "newText").unwrap_or_default(),
                }),
                Some("terminal") => str_field(item, "terminalId")
                    .map(|terminal_id| ToolCallContent::Terminal { terminal_id }),
                _ => None,
            };
            if converted.is_none() {
                log::trace!("Skipped tool call content item: {item}");
            }
            converted
        })
        .collect()
}

fn tool_call_locations(items: &Value) -> Vec<ToolCallLocation> {
    let Some(items) = items.as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            Some(ToolCallLocation {
                path: str_field(item, "path")?,
                line: item
                    .get("line")
                    .and_then(Value::as_u64)
                    .and_then(|line| u32::try_from(line).ok()),
            })
        })
        .collect()
}

fn plan(update: &Value) -> Option<SessionUpdate> {
    let entries = update.get("entries")?.as_array()?;

    let entries = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| PlanEntry {
            id: str_field(entry, "id").unwrap_or_else(|| format!("plan-{index}")),
            title: str_field(entry, "content")
                .or_else(|| str_field(entry, "title"))
                .unwrap_or_default(),
            description: str_field(entry, "description"),
            status: PlanEntryStatus::normalize(
                entry.get("status").and_then(Value::as_str).unwrap_or(""),
            ),
        })
        .collect();

    Some(SessionUpdate::Plan { entries })
}

fn available_commands(update: &Value) -> Option<SessionUpdate> {
    let commands = update.get("availableCommands")?.as_array()?;

    let commands = commands
        .iter()
        .filter_map(|command| {
            Some(AvailableCommand {
                name: str_field(command, "name")?,
                description: str_field(command, "description").unwrap_or_default(),
                input_hint: command.get("input").and_then(|input| str_field(input, "hint")),
            })
        })
        .collect();

    Some(SessionUpdate::AvailableCommandsChanged { commands })
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(update: Value) -> Option<SessionUpdate> {
        parse_session_notification(&json!({"sessionId": "s-1", "update": update}))
            .map(|(session_id, update)| {
                assert_eq!(session_id.as_deref(), Some("s-1"));
                update
            })
    }

    #[test]
    fn test_agent_message_chunk() {
        let update = parse(json!({
            "sessionUpdate": "agent_message_chunk",
            "content": {"type": "text", "text": "Hello"}
        }));
        assert_eq!(
            update,
            Some(SessionUpdate::MessageChunk {
                role: MessageRole::Agent,
                text: "Hello".to_string()
            })
        );
    }

    #[test]
    fn test_unknown_kind_and_image_chunk_are_dropped() {
        assert_eq!(parse(json!({"sessionUpdate": "config_option_update"})), None);
        assert_eq!(
            parse(json!({
                "sessionUpdate": "user_message_chunk",
                "content": {"type": "image", "data": "..."}
            })),
            None
        );
        assert_eq!(parse(json!({"content": "no discriminator"})), None);
    }

    #[test]
    fn test_tool_call_skips_unknown_content_items() {
        let update = parse(json!({
            "sessionUpdate": "tool_call",
            "toolCallId": "call-1",
            "title": "Edit file",
            "kind": "edit",
            "status": "pending",
            "content": [
                {"type": "content", "content": {"type": "text", "text": "ok"}},
                {"type": "hologram"},
                {"type": "diff", "path": "a.md", "oldText": null, "newText": "new"},
                {"type": "terminal", "terminalId": "term-1"}
            ],
            "locations": [{"path": "a.md", "line": 3}]
        }));

        let Some(SessionUpdate::ToolCall(call)) = update else {
            panic!("Expected ToolCall");
        };
        assert_eq!(call.tool_call_id, "call-1");
        assert_eq!(
            call.content,
            vec![
                ToolCallContent::Text { text: "ok".to_string() },
                ToolCallContent::Diff {
                    path: "a.md".to_string(),
                    old_text: None,
                    new_text: "new".to_string()
                },
                ToolCallContent::Terminal {
                    terminal_id: "term-1".to_string()
                },
            ]
        );
        assert_eq!(call.locations[0].line, Some(3));
    }

    #[test]
    fn test_tool_call_requires_id() {
        assert_eq!(parse(json!({"sessionUpdate": "tool_call", "title": "x"})), None);
    }

    #[test]
    fn test_tool_call_update_defaults_missing_id() {
        let update = parse(json!({"sessionUpdate": "tool_call_update", "status": "completed"}));
        let Some(SessionUpdate::ToolCallUpdate(update)) = update else {
            panic!("Expected ToolCallUpdate");
        };
        assert_eq!(update.tool_call_id, UNKNOWN_TOOL_CALL_ID);
        assert_eq!(update.status.as_deref(), Some("completed"));
        assert_eq!(update.content, None);
    }

    #[test]
    fn test_plan_entries_are_normalized() {
        let update = parse(json!({
            "sessionUpdate": "plan",
            "entries": [
                {"content": "Read files", "priority": "high", "status": "in_progress"},
                {"content": "Write tests", "status": "whatever"}
            ]
        }));
        let Some(SessionUpdate::Plan { entries }) = update else {
            panic!("Expected Plan");
        };
        assert_eq!(entries[0].id, "plan-0");
        assert_eq!(entries[0].title, "Read files");
        assert_eq!(entries[0].status, PlanEntryStatus::Running);
        assert_eq!(entries[1].status, PlanEntryStatus::Pending);
    }

    #[test]
    fn test_mode_and_commands() {
        assert_eq!(
            parse(json!({"sessionUpdate": "current_mode_update", "currentModeId": "code"})),
            Some(SessionUpdate::ModeChanged {
                mode_id: "code".to_string()
            })
        );

        let update = parse(json!({
            "sessionUpdate": "available_commands_update",
            "availableCommands": [
                {"name": "web", "description": "Search", "input": {"hint": "query"}},
                {"description": "nameless"}
            ]
        }));
        let Some(SessionUpdate::AvailableCommandsChanged { commands }) = update else {
            panic!("Expected AvailableCommandsChanged");
        };
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].input_hint.as_deref(), Some("query"));
    }
}
