//! Upstream OpenAI-compatible HTTP client: outbound request building (§4.8)
//! and the raw streaming chunk shape C9 consumes.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ProviderError;

/// One upstream chat-completions request, already converted by C8.
pub struct OutboundRequest {
    pub model: String,
    pub messages: Vec<Value>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop: Option<Vec<String>>,
    pub tools: Vec<Value>,
    pub thinking_requested: bool,
}

/// Provider-default parameters applied only to keys the caller didn't set (§4.8).
const PROVIDER_DEFAULTS: &[(&str, f64)] = &[
    ("temperature", 0.7),
    ("top_p", 0.95),
    ("frequency_penalty", 0.0),
    ("presence_penalty", 0.0),
];

fn is_deepseek_family(model: &str) -> bool {
    model.to_ascii_lowercase().contains("deepseek")
}

/// Build the outbound JSON body for a (non-)streaming chat-completions call (§4.8).
pub fn build_request_body(req: &OutboundRequest, stream: bool) -> Value {
    let mut body = json!({
        "model": req.model,
        "messages": req.messages,
        "max_tokens": req.max_tokens,
        "stream": stream,
    });

    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = req.top_p {
        body["top_p"] = json!(p);
    }
    if let Some(stop) = &req.stop {
        if !stop.is_empty() {
            body["stop"] = json!(stop);
        }
    }
    if !req.tools.is_empty() {
        body["tools"] = json!(req.tools);
    }

    for (key, default) in PROVIDER_DEFAULTS {
        if body.get(*key).is_none() {
            body[*key] = json!(default);
        }
    }

    if req.thinking_requested {
        body["extra_body"] = json!({ "thinking": { "type": "enabled" }, "reasoning_split": true });
        if is_deepseek_family(&req.model) {
            body["chat_template_kwargs"] = json!({ "thinking": true });
        }
    }

    if stream {
        body["stream_options"] = json!({ "include_usage": true });
    }

    body
}

/// The single upstream OpenAI-compatible chat-completions provider (§1
/// Non-goals: one provider per process, not a router across many).
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(client: reqwest::Client, api_key: String, base_url: String) -> Self {
        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;
        check_status(&resp).await?;
        Ok(resp)
    }

    /// Non-streaming call; returns the raw JSON response body.
    pub async fn send(&self, body: &Value) -> Result<Value, ProviderError> {
        let resp = self.post(body).await?;
        resp.json().await.map_err(|e| ProviderError::Parse(e.to_string()))
    }

    /// Streaming call; returns the raw byte stream for the translator (C9) to frame.
    pub async fn send_stream(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        self.post(body).await
    }
}

async fn check_status(resp: &reqwest::Response) -> Result<(), ProviderError> {
    let status = resp.status().as_u16();
    if status < 400 {
        return Ok(());
    }
    debug!(status, "upstream returned error status");
    Err(ProviderError::from_status(status, ""))
}

/// A single parsed upstream SSE delta chunk (`data:` line, already JSON-decoded).
#[derive(Debug, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: StreamDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct StreamDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub reasoning_details: Option<Value>,
    #[serde(default)]
    pub tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
pub struct StreamToolCallDelta {
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize, Default)]
pub struct StreamFunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

/// Incrementally frames raw upstream bytes into complete SSE `data:` lines.
#[derive(Debug, Default)]
pub struct SseLineFramer {
    buf: String,
}

impl SseLineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly-arrived bytes and drain every complete `data: ...` payload.
    /// Returns `None` entries for `data: [DONE]` sentinels so the caller can
    /// stop, and skips blank lines / other SSE fields.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Option<String>> {
        let text = String::from_utf8_lossy(chunk);
        self.buf.push_str(&text);

        let mut out = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line = self.buf[..pos].trim_end_matches('\r').to_string();
            self.buf.drain(..=pos);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if data == "[DONE]" {
                    out.push(None);
                } else {
                    out.push(Some(data.to_string()));
                }
            }
        }
        out
    }
}

/// Non-streaming response shape (§4.8 reverse direction).
#[derive(Debug, Deserialize)]
pub struct ApiResponse {
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
pub struct ApiToolCall {
    pub id: String,
    pub function: ApiFunction,
}

#[derive(Debug, Deserialize)]
pub struct ApiFunction {
    pub name: String,
    pub arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thinking_mode_injects_extra_body() {
        let req = OutboundRequest {
            model: "deepseek-chat".into(),
            messages: vec![],
            max_tokens: 100,
            temperature: None,
            top_p: None,
            stop: None,
            tools: vec![],
            thinking_requested: true,
        };
        let body = build_request_body(&req, true);
        assert_eq!(body["extra_body"]["thinking"]["type"], "enabled");
        assert_eq!(body["extra_body"]["reasoning_split"], true);
        assert_eq!(body["chat_template_kwargs"]["thinking"], true);
    }

    #[test]
    fn provider_defaults_do_not_override_caller_values() {
        let req = OutboundRequest {
            model: "gpt-4o".into(),
            messages: vec![],
            max_tokens: 100,
            temperature: Some(0.1),
            top_p: None,
            stop: None,
            tools: vec![],
            thinking_requested: false,
        };
        let body = build_request_body(&req, false);
        assert_eq!(body["temperature"], 0.1);
        assert_eq!(body["top_p"], 0.95);
    }

    #[test]
    fn framer_handles_split_lines_and_done_sentinel() {
        let mut framer = SseLineFramer::new();
        let mut out = framer.feed(b"data: {\"a\":1}\nda");
        out.extend(framer.feed(b"ta: [DONE]\n"));
        assert_eq!(out, vec![Some("{\"a\":1}".to_string()), None]);
    }
}
