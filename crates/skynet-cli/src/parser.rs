//! Normalizes raw CLI NDJSON events into a small display vocabulary
//! (thinking / content / tool_start / subagent_start / error / complete) —
//! ported in behavior from `cli/parser.py`'s `CLIParser.parse_event`.

use serde_json::Value;

/// Outcome of the CLI process exiting, mirrored from the original's
/// `"success"` / `"failed"` exit-code check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Failed,
}

/// One normalized unit of display-worthy output extracted from a CLI event.
#[derive(Debug, Clone)]
pub enum ParsedCliEvent {
    Thinking { text: String },
    Content { text: String },
    ToolStart { tools: Vec<Value> },
    SubagentStart { tasks: Vec<String> },
    Error { message: String },
    Complete { status: CompletionStatus },
}

/// Parse one raw CLI event into zero or more [`ParsedCliEvent`]s.
pub fn parse_event(event: &Value) -> Vec<ParsedCliEvent> {
    let Some(obj) = event.as_object() else {
        return Vec::new();
    };
    let etype = obj.get("type").and_then(Value::as_str);

    let msg_obj = match etype {
        Some("assistant") => obj.get("message"),
        Some("result") => obj
            .get("result")
            .and_then(Value::as_object)
            .and_then(|res| res.get("message"))
            .or_else(|| obj.get("message")),
        _ => None,
    };

    if let Some(msg) = msg_obj.and_then(Value::as_object) {
        if let Some(results) = parse_message_content(msg) {
            if !results.is_empty() {
                return results;
            }
        }
    }

    if etype == Some("content_block_delta") {
        if let Some(delta) = obj.get("delta").and_then(Value::as_object) {
            match delta.get("type").and_then(Value::as_str) {
                Some("text_delta") => {
                    let text = delta.get("text").and_then(Value::as_str).unwrap_or("").to_string();
                    return vec![ParsedCliEvent::Content { text }];
                }
                Some("thinking_delta") => {
                    let text = delta
                        .get("thinking")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    return vec![ParsedCliEvent::Thinking { text }];
                }
                _ => {}
            }
        }
    }

    if etype == Some("content_block_start") {
        if let Some(block) = obj.get("content_block").and_then(Value::as_object) {
            if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                if block.get("name").and_then(Value::as_str) == Some("Task") {
                    let desc = block
                        .get("input")
                        .and_then(Value::as_object)
                        .and_then(|i| i.get("description"))
                        .and_then(Value::as_str)
                        .unwrap_or("Subagent")
                        .to_string();
                    return vec![ParsedCliEvent::SubagentStart { tasks: vec![desc] }];
                }
                return vec![ParsedCliEvent::ToolStart {
                    tools: vec![Value::Object(block.clone())],
                }];
            }
        }
    }

    if etype == Some("error") {
        let message = match obj.get("error") {
            Some(Value::Object(err)) => err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        return vec![ParsedCliEvent::Error { message }];
    }

    if etype == Some("exit") {
        let status = if obj.get("code").and_then(Value::as_i64) == Some(0) {
            CompletionStatus::Success
        } else {
            CompletionStatus::Failed
        };
        return vec![ParsedCliEvent::Complete { status }];
    }

    Vec::new()
}

fn parse_message_content(msg: &serde_json::Map<String, Value>) -> Option<Vec<ParsedCliEvent>> {
    let content = msg.get("content")?.as_array()?;

    let mut text_parts = Vec::new();
    let mut thinking_parts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in content {
        let Some(block_obj) = block.as_object() else { continue };
        match block_obj.get("type").and_then(Value::as_str) {
            Some("text") => {
                text_parts.push(block_obj.get("text").and_then(Value::as_str).unwrap_or("").to_string());
            }
            Some("thinking") => {
                thinking_parts.push(
                    block_obj
                        .get("thinking")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                );
            }
            Some("tool_use") => tool_calls.push(block.clone()),
            _ => {}
        }
    }

    let mut results = Vec::new();

    if !thinking_parts.is_empty() {
        results.push(ParsedCliEvent::Thinking {
            text: thinking_parts.join("\n"),
        });
    }

    if !tool_calls.is_empty() {
        let subagents: Vec<String> = tool_calls
            .iter()
            .filter(|t| t.get("name").and_then(Value::as_str) == Some("Task"))
            .map(|t| {
                t.get("input")
                    .and_then(Value::as_object)
                    .and_then(|i| i.get("description"))
                    .and_then(Value::as_str)
                    .unwrap_or("Subagent")
                    .to_string()
            })
            .collect();

        if !subagents.is_empty() {
            results.push(ParsedCliEvent::SubagentStart { tasks: subagents });
        } else {
            results.push(ParsedCliEvent::ToolStart { tools: tool_calls });
        }
    }

    if !text_parts.is_empty() {
        results.push(ParsedCliEvent::Content {
            text: text_parts.concat(),
        });
    }

    Some(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_assistant_text_content() {
        let event = json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "hello"}]},
        });
        let parsed = parse_event(&event);
        assert!(matches!(&parsed[0], ParsedCliEvent::Content { text } if text == "hello"));
    }

    #[test]
    fn thinking_is_ordered_before_tool_and_content() {
        let event = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "thinking", "thinking": "pondering"},
                {"type": "tool_use", "name": "Bash", "input": {}},
                {"type": "text", "text": "done"},
            ]},
        });
        let parsed = parse_event(&event);
        assert!(matches!(&parsed[0], ParsedCliEvent::Thinking { .. }));
        assert!(matches!(&parsed[1], ParsedCliEvent::ToolStart { .. }));
        assert!(matches!(&parsed[2], ParsedCliEvent::Content { .. }));
    }

    #[test]
    fn task_tool_becomes_subagent_start() {
        let event = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "tool_use", "name": "Task", "input": {"description": "refactor"}},
            ]},
        });
        let parsed = parse_event(&event);
        assert!(matches!(&parsed[0], ParsedCliEvent::SubagentStart { tasks } if tasks == &vec!["refactor".to_string()]));
    }

    #[test]
    fn content_block_delta_text() {
        let event = json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "x"}});
        let parsed = parse_event(&event);
        assert!(matches!(&parsed[0], ParsedCliEvent::Content { text } if text == "x"));
    }

    #[test]
    fn content_block_start_task_tool() {
        let event = json!({
            "type": "content_block_start",
            "content_block": {"type": "tool_use", "name": "Task", "input": {"description": "sub"}},
        });
        let parsed = parse_event(&event);
        assert!(matches!(&parsed[0], ParsedCliEvent::SubagentStart { tasks } if tasks == &vec!["sub".to_string()]));
    }

    #[test]
    fn error_event_extracts_message() {
        let event = json!({"type": "error", "error": {"message": "boom"}});
        let parsed = parse_event(&event);
        assert!(matches!(&parsed[0], ParsedCliEvent::Error { message } if message == "boom"));
    }

    #[test]
    fn exit_event_zero_code_is_success() {
        let event = json!({"type": "exit", "code": 0});
        let parsed = parse_event(&event);
        assert!(matches!(&parsed[0], ParsedCliEvent::Complete { status: CompletionStatus::Success }));
    }

    #[test]
    fn unrecognized_event_returns_empty() {
        let event = json!({"type": "ping"});
        assert!(parse_event(&event).is_empty());
    }
}
