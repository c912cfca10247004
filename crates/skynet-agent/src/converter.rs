//! Message converter (C8, §4.7, §4.8): bidirectional Anthropic <-> OpenAI
//! translation. The core direction is Anthropic -> OpenAI (outbound request
//! building); the reverse direction converts a non-streaming OpenAI response
//! back into Anthropic content blocks.

use serde_json::{json, Value};

use crate::anthropic::{ContentBlock, Message, MessageContent, Role, SystemPrompt, Tool, ToolResultContent};

/// Build the OpenAI `messages` array (plus any leading `system` message) from
/// an Anthropic request (§4.7).
pub fn convert_messages(system: &Option<SystemPrompt>, messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);

    if let Some(system_text) = flatten_system(system) {
        if !system_text.is_empty() {
            out.push(json!({ "role": "system", "content": system_text }));
        }
    }

    for m in messages {
        match m.role {
            Role::User => out.extend(convert_user_message(&m.content)),
            Role::Assistant => out.push(convert_assistant_message(&m.content)),
        }
    }

    out
}

fn flatten_system(system: &Option<SystemPrompt>) -> Option<String> {
    match system {
        None => None,
        Some(SystemPrompt::Text(s)) => Some(s.clone()),
        Some(SystemPrompt::Blocks(blocks)) => {
            let joined = blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            Some(joined)
        }
    }
}

/// A user message with a list of blocks: `tool_result`s become separate
/// `{role: tool, ...}` messages emitted *before* the batched user text.
fn convert_user_message(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text(s) => vec![json!({ "role": "user", "content": s })],
        MessageContent::Blocks(blocks) => {
            let mut tool_messages = Vec::new();
            let mut text_parts = Vec::new();

            for block in blocks {
                match block {
                    ContentBlock::Text { text } => text_parts.push(text.clone()),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => {
                        tool_messages.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": flatten_tool_result_content(content),
                        }));
                    }
                    _ => {}
                }
            }

            let mut out = tool_messages;
            if !text_parts.is_empty() {
                out.push(json!({ "role": "user", "content": text_parts.join("\n") }));
            }
            out
        }
    }
}

fn flatten_tool_result_content(content: &ToolResultContent) -> String {
    match content {
        ToolResultContent::Empty => String::new(),
        ToolResultContent::Text(s) => s.clone(),
        ToolResultContent::Json(v) => v.to_string(),
        ToolResultContent::Blocks(blocks) => blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// An assistant message: text/thinking concatenate into `content`, `tool_use`
/// blocks become OpenAI `tool_calls[]`. Content is never `""` when there are
/// no tool calls (some providers reject empty assistant content).
fn convert_assistant_message(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(s) => json!({ "role": "assistant", "content": s }),
        MessageContent::Blocks(blocks) => {
            let mut text = String::new();
            let mut tool_calls = Vec::new();

            for block in blocks {
                match block {
                    ContentBlock::Text { text: t } => text.push_str(t),
                    ContentBlock::Thinking { thinking } => {
                        text.push_str("<think>");
                        text.push_str(thinking);
                        text.push_str("</think>");
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_calls.push(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": serde_json::to_string(input).unwrap_or_default(),
                            }
                        }));
                    }
                    ContentBlock::ToolResult { .. } => {}
                }
            }

            let content_value = if text.is_empty() && tool_calls.is_empty() {
                Value::String(" ".to_string())
            } else if text.is_empty() {
                Value::Null
            } else {
                Value::String(text)
            };

            let mut msg = json!({ "role": "assistant", "content": content_value });
            if !tool_calls.is_empty() {
                msg["tool_calls"] = Value::Array(tool_calls);
            }
            msg
        }
    }
}

/// Each Anthropic tool becomes an OpenAI function tool (§4.7).
pub fn convert_tools(tools: &[Tool]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                }
            })
        })
        .collect()
}

/// Non-streaming OpenAI `choices[0].message` -> Anthropic content blocks (§4.8).
pub fn convert_openai_message_to_blocks(
    content: Option<&str>,
    reasoning_content: Option<&str>,
    tool_calls: &[(String, String, String)], // (id, name, arguments)
) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();

    if let Some(reasoning) = reasoning_content.filter(|s| !s.is_empty()) {
        blocks.push(ContentBlock::Thinking {
            thinking: reasoning.to_string(),
        });
        if let Some(text) = content.filter(|s| !s.is_empty()) {
            blocks.push(ContentBlock::Text {
                text: text.to_string(),
            });
        }
    } else if let Some(raw) = content {
        if let Some((thinking, rest)) = extract_think_tag(raw) {
            blocks.push(ContentBlock::Thinking { thinking });
            if !rest.is_empty() {
                blocks.push(ContentBlock::Text { text: rest });
            }
        } else if !raw.is_empty() {
            blocks.push(ContentBlock::Text {
                text: raw.to_string(),
            });
        }
    }

    if blocks.is_empty() && tool_calls.is_empty() {
        blocks.push(ContentBlock::Text {
            text: " ".to_string(),
        });
    }

    for (id, name, arguments) in tool_calls {
        let input = serde_json::from_str::<Value>(arguments)
            .unwrap_or_else(|_| Value::String(arguments.clone()));
        blocks.push(ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input,
        });
    }

    blocks
}

fn extract_think_tag(s: &str) -> Option<(String, String)> {
    let start = s.find("<think>")?;
    let end = s.find("</think>")?;
    if end < start {
        return None;
    }
    let thinking = s[start + "<think>".len()..end].to_string();
    let mut rest = String::with_capacity(s.len());
    rest.push_str(&s[..start]);
    rest.push_str(&s[end + "</think>".len()..]);
    Some((thinking, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anthropic::{Message, MessageContent, Role};

    #[test]
    fn system_string_becomes_leading_message() {
        let msgs = convert_messages(
            &Some(SystemPrompt::Text("be nice".into())),
            &[Message {
                role: Role::User,
                content: MessageContent::Text("hi".into()),
            }],
        );
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[0]["content"], "be nice");
        assert_eq!(msgs[1]["role"], "user");
    }

    #[test]
    fn empty_system_is_omitted() {
        let msgs = convert_messages(
            &Some(SystemPrompt::Text(String::new())),
            &[Message {
                role: Role::User,
                content: MessageContent::Text("hi".into()),
            }],
        );
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["role"], "user");
    }

    #[test]
    fn tool_result_precedes_batched_user_text() {
        let msgs = convert_messages(
            &None,
            &[Message {
                role: Role::User,
                content: MessageContent::Blocks(vec![
                    ContentBlock::ToolResult {
                        tool_use_id: "call_1".into(),
                        content: ToolResultContent::Text("42".into()),
                        is_error: false,
                    },
                    ContentBlock::Text {
                        text: "thanks".into(),
                    },
                ]),
            }],
        );
        assert_eq!(msgs[0]["role"], "tool");
        assert_eq!(msgs[0]["tool_call_id"], "call_1");
        assert_eq!(msgs[1]["role"], "user");
        assert_eq!(msgs[1]["content"], "thanks");
    }

    #[test]
    fn assistant_thinking_wraps_in_think_tags() {
        let msgs = convert_messages(
            &None,
            &[Message {
                role: Role::Assistant,
                content: MessageContent::Blocks(vec![
                    ContentBlock::Thinking {
                        thinking: "reasoning".into(),
                    },
                    ContentBlock::Text {
                        text: "answer".into(),
                    },
                ]),
            }],
        );
        assert_eq!(msgs[0]["content"], "<think>reasoning</think>answer");
    }

    #[test]
    fn assistant_tool_use_becomes_tool_calls_with_space_content() {
        let msgs = convert_messages(
            &None,
            &[Message {
                role: Role::Assistant,
                content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                    id: "call_1".into(),
                    name: "search".into(),
                    input: json!({"q": "x"}),
                }]),
            }],
        );
        assert_eq!(msgs[0]["content"], " ");
        assert_eq!(msgs[0]["tool_calls"][0]["function"]["name"], "search");
    }

    #[test]
    fn openai_response_extracts_think_tag_from_content() {
        let blocks =
            convert_openai_message_to_blocks(Some("<think>why</think>because"), None, &[]);
        assert_eq!(
            blocks,
            vec![
                ContentBlock::Thinking {
                    thinking: "why".into()
                },
                ContentBlock::Text {
                    text: "because".into()
                },
            ]
        );
    }

    #[test]
    fn empty_response_falls_back_to_single_space() {
        let blocks = convert_openai_message_to_blocks(Some(""), None, &[]);
        assert_eq!(blocks, vec![ContentBlock::Text { text: " ".into() }]);
    }
}
