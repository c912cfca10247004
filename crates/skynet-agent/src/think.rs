/// A chunk of text produced by [`ThinkTagParser::feed`], tagged with whether
/// it came from inside or outside a `<think>` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentChunk {
    Text(String),
    Thinking(String),
}

/// Streaming parser that splits `<think>...</think>` reasoning out of a
/// model's text output.
///
/// Some OpenAI-compatible models (e.g. reasoning-tuned open models) interleave
/// their chain-of-thought directly in `content` using these tags instead of a
/// dedicated field. The parser buffers partial tags split across chunk
/// boundaries and strips orphan `</think>` closes some models leak into plain
/// content.
#[derive(Debug, Default)]
pub struct ThinkTagParser {
    buffer: String,
    in_think_tag: bool,
}

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

impl ThinkTagParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_think_mode(&self) -> bool {
        self.in_think_tag
    }

    /// Feed newly-arrived text and drain every chunk that can be resolved
    /// from the buffer so far.
    pub fn feed(&mut self, content: &str) -> Vec<ContentChunk> {
        self.buffer.push_str(content);

        let mut out = Vec::new();
        loop {
            let chunk = if self.in_think_tag {
                self.parse_inside_think()
            } else {
                self.parse_outside_think()
            };
            match chunk {
                Some(c) => out.push(c),
                None => break,
            }
        }
        out
    }

    fn parse_outside_think(&mut self) -> Option<ContentChunk> {
        let think_start = self.buffer.find(OPEN_TAG);
        let orphan_close = self.buffer.find(CLOSE_TAG);

        if let Some(orphan) = orphan_close {
            if think_start.is_none_or_after(orphan) {
                let pre_orphan = self.buffer[..orphan].to_string();
                self.buffer = self.buffer[orphan + CLOSE_TAG.len()..].to_string();
                if !pre_orphan.is_empty() {
                    return Some(ContentChunk::Text(pre_orphan));
                }
                return self.parse_outside_think();
            }
        }

        match think_start {
            None => {
                if let Some(last_bracket) = self.buffer.rfind('<') {
                    let potential_tag = &self.buffer[last_bracket..];
                    let tag_len = potential_tag.len();
                    let could_be_partial = (tag_len < OPEN_TAG.len()
                        && OPEN_TAG.starts_with(potential_tag))
                        || (tag_len < CLOSE_TAG.len() && CLOSE_TAG.starts_with(potential_tag));
                    if could_be_partial {
                        let emit = self.buffer[..last_bracket].to_string();
                        self.buffer = self.buffer[last_bracket..].to_string();
                        return if emit.is_empty() {
                            None
                        } else {
                            Some(ContentChunk::Text(emit))
                        };
                    }
                }

                let emit = std::mem::take(&mut self.buffer);
                if emit.is_empty() {
                    None
                } else {
                    Some(ContentChunk::Text(emit))
                }
            }
            Some(start) => {
                let pre_think = self.buffer[..start].to_string();
                self.buffer = self.buffer[start + OPEN_TAG.len()..].to_string();
                self.in_think_tag = true;
                if !pre_think.is_empty() {
                    Some(ContentChunk::Text(pre_think))
                } else {
                    self.parse_inside_think()
                }
            }
        }
    }

    fn parse_inside_think(&mut self) -> Option<ContentChunk> {
        match self.buffer.find(CLOSE_TAG) {
            None => {
                if let Some(last_bracket) = self.buffer.rfind('<') {
                    if self.buffer.len() - last_bracket < CLOSE_TAG.len() {
                        let potential_tag = &self.buffer[last_bracket..];
                        if CLOSE_TAG.starts_with(potential_tag) {
                            let emit = self.buffer[..last_bracket].to_string();
                            self.buffer = self.buffer[last_bracket..].to_string();
                            return if emit.is_empty() {
                                None
                            } else {
                                Some(ContentChunk::Thinking(emit))
                            };
                        }
                    }
                }

                let emit = std::mem::take(&mut self.buffer);
                if emit.is_empty() {
                    None
                } else {
                    Some(ContentChunk::Thinking(emit))
                }
            }
            Some(end) => {
                let thinking = self.buffer[..end].to_string();
                self.buffer = self.buffer[end + CLOSE_TAG.len()..].to_string();
                self.in_think_tag = false;
                if !thinking.is_empty() {
                    Some(ContentChunk::Thinking(thinking))
                } else {
                    self.parse_outside_think()
                }
            }
        }
    }

    /// Flush whatever remains buffered at stream end, tagged by whichever
    /// mode the parser was last in.
    pub fn flush(&mut self) -> Option<ContentChunk> {
        if self.buffer.is_empty() {
            return None;
        }
        let content = std::mem::take(&mut self.buffer);
        Some(if self.in_think_tag {
            ContentChunk::Thinking(content)
        } else {
            ContentChunk::Text(content)
        })
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.in_think_tag = false;
    }
}

/// Helper trait making the "no `<think>` found, or found only after the
/// orphan `</think>`" comparison read naturally at the call site above.
trait OptionIsNoneOrAfter {
    fn is_none_or_after(&self, other: usize) -> bool;
}

impl OptionIsNoneOrAfter for Option<usize> {
    fn is_none_or_after(&self, other: usize) -> bool {
        match self {
            None => true,
            Some(v) => other < *v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(chunks: &[ContentChunk]) -> Vec<&str> {
        chunks
            .iter()
            .map(|c| match c {
                ContentChunk::Text(s) => s.as_str(),
                ContentChunk::Thinking(s) => s.as_str(),
            })
            .collect()
    }

    #[test]
    fn plain_text_passes_through() {
        let mut p = ThinkTagParser::new();
        let chunks = p.feed("hello world");
        assert_eq!(chunks, vec![ContentChunk::Text("hello world".to_string())]);
    }

    #[test]
    fn extracts_thinking_block() {
        let mut p = ThinkTagParser::new();
        let chunks = p.feed("before <think>reasoning</think> after");
        assert_eq!(
            texts(&chunks),
            vec!["before ", "reasoning", " after"]
        );
        assert!(matches!(chunks[1], ContentChunk::Thinking(_)));
    }

    #[test]
    fn handles_tag_split_across_feeds() {
        let mut p = ThinkTagParser::new();
        let mut chunks = p.feed("pre <thi");
        chunks.extend(p.feed("nk>inner</think> post"));
        assert_eq!(texts(&chunks), vec!["pre ", "inner", " post"]);
    }

    #[test]
    fn strips_orphan_close_tag() {
        let mut p = ThinkTagParser::new();
        let chunks = p.feed("stray </think> close");
        assert_eq!(texts(&chunks), vec!["stray ", " close"]);
        assert!(chunks.iter().all(|c| matches!(c, ContentChunk::Text(_))));
    }

    #[test]
    fn flush_emits_dangling_buffer() {
        let mut p = ThinkTagParser::new();
        let _ = p.feed("partial <thi");
        let flushed = p.flush().unwrap();
        assert_eq!(flushed, ContentChunk::Text("partial <thi".to_string()));
    }
}
