//! Heuristic tool parser (C5, §4.5): recovers tool-use calls emitted as plain
//! text by models without native tool calling, of the shape
//! `● <function=NAME><parameter=KEY>VAL</parameter>…`.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

/// One recovered tool call, ready to be emitted as an Anthropic `tool_use` block.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedTool {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// A unit of parser output, preserving emission order between plain text and
/// recovered tool calls within one `feed`/`flush` call.
#[derive(Debug, Clone, PartialEq)]
pub enum HeuristicEvent {
    Text(String),
    Tool(DetectedTool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Text,
    MatchingFunction,
    ParsingParameters,
}

fn function_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"●\s*<function=([^>]+)>").unwrap())
}

fn param_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^<parameter=([^>]+)>(.*?)</parameter>").unwrap())
}

fn control_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<\|[^|<>]*\|>").unwrap())
}

const MATCH_FUNCTION_GIVEUP_LEN: usize = 100;
const PARAM_TAG_PREFIX: &str = "<parameter=";

#[derive(Debug, Default)]
pub struct HeuristicToolParser {
    mode_buf: String,
    mode: ModeState,
    ctrl_buf: String,
}

#[derive(Debug)]
enum ModeState {
    Text,
    MatchingFunction,
    ParsingParameters {
        tool_id: String,
        tool_name: String,
        params: Vec<(String, String)>,
    },
}

impl Default for ModeState {
    fn default() -> Self {
        ModeState::Text
    }
}

impl ModeState {
    fn tag(&self) -> Mode {
        match self {
            ModeState::Text => Mode::Text,
            ModeState::MatchingFunction => Mode::MatchingFunction,
            ModeState::ParsingParameters { .. } => Mode::ParsingParameters,
        }
    }
}

impl HeuristicToolParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> Mode {
        self.mode.tag()
    }

    /// Strip complete `<|...|>` control tokens from `s`, holding back a
    /// trailing partial `<|` that might be split across chunk boundaries.
    fn filter_control_tokens(&mut self, s: &str) -> String {
        self.ctrl_buf.push_str(s);
        let mut out = String::new();
        loop {
            if let Some(m) = control_token_re().find(&self.ctrl_buf) {
                out.push_str(&self.ctrl_buf[..m.start()]);
                self.ctrl_buf = self.ctrl_buf[m.end()..].to_string();
            } else {
                break;
            }
        }
        if let Some(idx) = self.ctrl_buf.rfind("<|") {
            out.push_str(&self.ctrl_buf[..idx]);
            self.ctrl_buf = self.ctrl_buf[idx..].to_string();
        } else {
            out.push_str(&self.ctrl_buf);
            self.ctrl_buf.clear();
        }
        out
    }

    fn new_tool_id() -> String {
        let raw = uuid::Uuid::new_v4().simple().to_string();
        format!("toolu_heuristic_{}", &raw[..8])
    }

    fn build_input(params: &[(String, String)]) -> Value {
        let mut map = Map::new();
        for (k, v) in params {
            map.insert(k.clone(), Value::String(v.clone()));
        }
        Value::Object(map)
    }

    fn finalize_tool(&mut self) -> Option<DetectedTool> {
        match std::mem::replace(&mut self.mode, ModeState::Text) {
            ModeState::ParsingParameters {
                tool_id,
                tool_name,
                params,
            } => Some(DetectedTool {
                id: tool_id,
                name: tool_name,
                input: Self::build_input(&params),
            }),
            other => {
                self.mode = other;
                None
            }
        }
    }

    pub fn feed(&mut self, content: &str) -> Vec<HeuristicEvent> {
        self.mode_buf.push_str(content);
        let mut out = Vec::new();

        loop {
            match &mut self.mode {
                ModeState::Text => {
                    if let Some(idx) = self.mode_buf.find('●') {
                        let pre = self.mode_buf[..idx].to_string();
                        self.mode_buf.drain(..idx);
                        if !pre.is_empty() {
                            let filtered = self.filter_control_tokens(&pre);
                            if !filtered.is_empty() {
                                out.push(HeuristicEvent::Text(filtered));
                            }
                        }
                        self.mode = ModeState::MatchingFunction;
                        continue;
                    } else {
                        let text = std::mem::take(&mut self.mode_buf);
                        if !text.is_empty() {
                            let filtered = self.filter_control_tokens(&text);
                            if !filtered.is_empty() {
                                out.push(HeuristicEvent::Text(filtered));
                            }
                        }
                        break;
                    }
                }
                ModeState::MatchingFunction => {
                    if let Some(caps) = function_re().captures(&self.mode_buf) {
                        let whole = caps.get(0).unwrap();
                        let name = caps.get(1).unwrap().as_str().to_string();
                        let end = whole.end();
                        self.mode_buf.drain(..end);
                        self.mode = ModeState::ParsingParameters {
                            tool_id: Self::new_tool_id(),
                            tool_name: name,
                            params: Vec::new(),
                        };
                        continue;
                    } else if self.mode_buf.len() > MATCH_FUNCTION_GIVEUP_LEN {
                        // The '●' was spurious. Forward just the leading char as text and
                        // drop it so the next pass makes progress instead of re-finding
                        // the same '●' at index 0 and bouncing straight back here.
                        if let Some(ch) = self.mode_buf.chars().next() {
                            let prefix: String = self.mode_buf.drain(..ch.len_utf8()).collect();
                            let filtered = self.filter_control_tokens(&prefix);
                            if !filtered.is_empty() {
                                out.push(HeuristicEvent::Text(filtered));
                            }
                        }
                        self.mode = ModeState::Text;
                        continue;
                    } else {
                        break;
                    }
                }
                ModeState::ParsingParameters { params, .. } => {
                    if let Some(caps) = param_re().captures(&self.mode_buf) {
                        let whole = caps.get(0).unwrap();
                        let key = caps.get(1).unwrap().as_str().to_string();
                        let val = caps.get(2).unwrap().as_str().to_string();
                        let end = whole.end();
                        params.push((key, val));
                        self.mode_buf.drain(..end);
                        continue;
                    }

                    let trimmed = self.mode_buf.trim_start();
                    if trimmed.is_empty() {
                        break; // could still be leading whitespace before the next tag
                    }
                    if trimmed.starts_with('●') {
                        let skip = self.mode_buf.len() - trimmed.len();
                        self.mode_buf.drain(..skip);
                        if let Some(tool) = self.finalize_tool() {
                            out.push(HeuristicEvent::Tool(tool));
                        }
                        continue;
                    }
                    if trimmed.starts_with(PARAM_TAG_PREFIX)
                        || (trimmed.len() < PARAM_TAG_PREFIX.len()
                            && PARAM_TAG_PREFIX.starts_with(trimmed))
                    {
                        break; // a parameter tag is still arriving
                    }

                    // Non-whitespace, non-parameter text: the tool call is complete.
                    if let Some(tool) = self.finalize_tool() {
                        out.push(HeuristicEvent::Tool(tool));
                    }
                    continue;
                }
            }
        }

        out
    }

    /// Finalize any in-progress tool call and drain remaining buffers at stream end.
    pub fn flush(&mut self) -> Vec<HeuristicEvent> {
        let mut out = Vec::new();

        if let ModeState::ParsingParameters { params, .. } = &mut self.mode {
            loop {
                if let Some(caps) = param_re().captures(&self.mode_buf) {
                    let whole = caps.get(0).unwrap();
                    let key = caps.get(1).unwrap().as_str().to_string();
                    let val = caps.get(2).unwrap().as_str().to_string();
                    let end = whole.end();
                    params.push((key, val));
                    self.mode_buf.drain(..end);
                } else {
                    break;
                }
            }

            let trimmed = self.mode_buf.trim_start().to_string();
            if let Some(rest) = trimmed.strip_prefix(PARAM_TAG_PREFIX) {
                if let Some(gt) = rest.find('>') {
                    let key = rest[..gt].to_string();
                    let val = rest[gt + 1..].trim_end_matches("</parameter").to_string();
                    params.push((key, val));
                }
            }
            self.mode_buf.clear();
        }

        if let Some(tool) = self.finalize_tool() {
            out.push(HeuristicEvent::Tool(tool));
        }

        // Whatever is left over in Text/MatchingFunction mode is plain text.
        let leftover = std::mem::take(&mut self.mode_buf);
        let mut text = self.filter_control_tokens(&leftover);
        text.push_str(&std::mem::take(&mut self.ctrl_buf));
        if !text.is_empty() {
            out.push(HeuristicEvent::Text(text));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn only_tool(events: Vec<HeuristicEvent>) -> DetectedTool {
        let tools: Vec<_> = events
            .into_iter()
            .filter_map(|e| match e {
                HeuristicEvent::Tool(t) => Some(t),
                _ => None,
            })
            .collect();
        assert_eq!(tools.len(), 1, "expected exactly one tool");
        tools.into_iter().next().unwrap()
    }

    #[test]
    fn recovers_single_tool_call() {
        let mut p = HeuristicToolParser::new();
        let mut events = p.feed("● <function=Grep><parameter=pattern>hi</parameter>");
        events.extend(p.flush());
        let tool = only_tool(events);
        assert_eq!(tool.name, "Grep");
        assert_eq!(tool.input["pattern"], "hi");
        assert!(tool.id.starts_with("toolu_heuristic_"));
    }

    #[test]
    fn round_trips_every_split_position() {
        let s = "● <function=T><parameter=k>v</parameter>";
        for i in 0..=s.len() {
            if !s.is_char_boundary(i) {
                continue;
            }
            let mut p = HeuristicToolParser::new();
            let mut events = p.feed(&s[..i]);
            events.extend(p.feed(&s[i..]));
            events.extend(p.flush());
            let tool = only_tool(events);
            assert_eq!(tool.name, "T");
            assert_eq!(tool.input["k"], "v");
        }
    }

    #[test]
    fn text_before_and_after_tool_call_is_preserved() {
        let mut p = HeuristicToolParser::new();
        let mut events = p.feed("Let's try. ● <function=Grep><parameter=pattern>");
        events.extend(p.feed("hi</parameter> done"));
        events.extend(p.flush());

        let texts: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                HeuristicEvent::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(texts[0], "Let's try. ");
        assert!(texts.last().unwrap().contains("done"));

        let tool = events
            .iter()
            .find_map(|e| match e {
                HeuristicEvent::Tool(t) => Some(t.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(tool.name, "Grep");
        assert_eq!(tool.input["pattern"], "hi");
    }

    #[test]
    fn strips_control_tokens_whole_and_split() {
        let mut p = HeuristicToolParser::new();
        let mut events = p.feed("before <|tool_call");
        events.extend(p.feed("_end|> after"));
        events.extend(p.flush());
        let text: String = events
            .into_iter()
            .filter_map(|e| match e {
                HeuristicEvent::Text(t) => Some(t),
                _ => None,
            })
            .collect();
        assert!(!text.contains("<|tool_call_end|>"));
        assert_eq!(text, "before  after");
    }

    #[test]
    fn spurious_bullet_without_function_becomes_text() {
        let mut p = HeuristicToolParser::new();
        let filler = "x".repeat(MATCH_FUNCTION_GIVEUP_LEN + 5);
        let input = format!("● {filler}");
        let mut events = p.feed(&input);
        events.extend(p.flush());
        let text: String = events
            .into_iter()
            .filter_map(|e| match e {
                HeuristicEvent::Text(t) => Some(t),
                _ => None,
            })
            .collect();
        assert!(text.contains('●'));
        assert!(text.contains(&filler));
    }
}
