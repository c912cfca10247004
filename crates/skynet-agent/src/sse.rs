//! SSE builder (C7, §4.6): serializes the Anthropic wire protocol exactly.

use serde_json::json;
use uuid::Uuid;

/// Render one SSE frame: `event: <type>\ndata: <json>\n\n`.
fn frame(event: &str, data: serde_json::Value) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

pub fn message_start(model: &str, input_tokens: u32) -> String {
    let id = format!("msg_{}", Uuid::new_v4().simple());
    frame(
        "message_start",
        json!({
            "type": "message_start",
            "message": {
                "id": id,
                "type": "message",
                "role": "assistant",
                "model": model,
                "content": [],
                "stop_reason": null,
                "stop_sequence": null,
                "usage": { "input_tokens": input_tokens, "output_tokens": 1 },
            }
        }),
    )
}

pub fn content_block_start_text(index: u32) -> String {
    frame(
        "content_block_start",
        json!({
            "type": "content_block_start",
            "index": index,
            "content_block": { "type": "text", "text": "" },
        }),
    )
}

pub fn content_block_start_thinking(index: u32) -> String {
    frame(
        "content_block_start",
        json!({
            "type": "content_block_start",
            "index": index,
            "content_block": { "type": "thinking", "thinking": "" },
        }),
    )
}

pub fn content_block_start_tool(index: u32, id: &str, name: &str) -> String {
    frame(
        "content_block_start",
        json!({
            "type": "content_block_start",
            "index": index,
            "content_block": { "type": "tool_use", "id": id, "name": name, "input": {} },
        }),
    )
}

pub fn text_delta(index: u32, text: &str) -> String {
    frame(
        "content_block_delta",
        json!({
            "type": "content_block_delta",
            "index": index,
            "delta": { "type": "text_delta", "text": text },
        }),
    )
}

pub fn thinking_delta(index: u32, text: &str) -> String {
    frame(
        "content_block_delta",
        json!({
            "type": "content_block_delta",
            "index": index,
            "delta": { "type": "thinking_delta", "thinking": text },
        }),
    )
}

pub fn input_json_delta(index: u32, partial_json: &str) -> String {
    frame(
        "content_block_delta",
        json!({
            "type": "content_block_delta",
            "index": index,
            "delta": { "type": "input_json_delta", "partial_json": partial_json },
        }),
    )
}

pub fn content_block_stop(index: u32) -> String {
    frame(
        "content_block_stop",
        json!({ "type": "content_block_stop", "index": index }),
    )
}

pub fn message_delta(stop_reason: &str, output_tokens: u32) -> String {
    frame(
        "message_delta",
        json!({
            "type": "message_delta",
            "delta": { "stop_reason": stop_reason, "stop_sequence": null },
            "usage": { "output_tokens": output_tokens },
        }),
    )
}

pub fn message_stop() -> String {
    frame("message_stop", json!({ "type": "message_stop" }))
}

pub const DONE: &str = "data: [DONE]\n\n";

/// Map an upstream OpenAI-style `finish_reason` to an Anthropic `stop_reason` (§4.6).
pub fn map_stop_reason(finish_reason: &str) -> &'static str {
    match finish_reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        _ => "end_turn",
    }
}

/// Estimate output tokens when the upstream doesn't report usage (§4.6):
/// `ceil(chars/4)` over accumulated text + reasoning, plus ~50 per tool block.
pub fn estimate_output_tokens(text_and_reasoning_chars: usize, tool_blocks: u32) -> u32 {
    let text_tokens = text_and_reasoning_chars.div_ceil(4) as u32;
    text_tokens + tool_blocks * 50
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_mapping() {
        assert_eq!(map_stop_reason("stop"), "end_turn");
        assert_eq!(map_stop_reason("length"), "max_tokens");
        assert_eq!(map_stop_reason("tool_calls"), "tool_use");
        assert_eq!(map_stop_reason("content_filter"), "end_turn");
        assert_eq!(map_stop_reason(""), "end_turn");
    }

    #[test]
    fn frame_has_event_and_data_lines() {
        let s = message_stop();
        assert!(s.starts_with("event: message_stop\n"));
        assert!(s.ends_with("\n\n"));
    }

    #[test]
    fn estimate_includes_tool_overhead() {
        assert_eq!(estimate_output_tokens(0, 1), 50);
        assert_eq!(estimate_output_tokens(8, 0), 2);
    }
}
