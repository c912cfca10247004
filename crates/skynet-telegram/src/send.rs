//! Message chunking and MarkdownV2 escaping for outbound Telegram text.
//!
//! Telegram caps message bodies at 4096 UTF-16 code units; `CHUNK_MAX` leaves
//! headroom under that so escaping doesn't push a chunk over the edge.

/// Telegram's hard limit is 4096; keep a safety margin for escape expansion.
const CHUNK_MAX: usize = 4090;

/// Split `text` into chunks no longer than [`CHUNK_MAX`], keeping Markdown
/// code fences balanced across chunk boundaries.
///
/// Tracks the currently open fence language (if any) across lines so that a
/// chunk boundary inside a fenced block closes the fence before the split and
/// reopens it with the same language at the top of the next chunk. Any chunk
/// still over the limit afterward (e.g. one enormous line) is force-split at
/// the nearest newline or space.
pub fn split_chunks_smart(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut fence_lang: Option<String> = None;

    for line in text.split('\n') {
        let is_fence_line = line.trim_start().starts_with("```");
        let mut projected_len = current.len() + line.len() + 1;
        if is_fence_line {
            // no extra cost beyond the line itself
        }

        if projected_len > CHUNK_MAX && !current.is_empty() {
            if let Some(lang) = &fence_lang {
                current.push_str("```\n");
                let _ = lang;
            }
            chunks.push(std::mem::take(&mut current));
            if let Some(lang) = &fence_lang {
                current.push_str("```");
                current.push_str(lang);
                current.push('\n');
            }
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
        projected_len = current.len();
        let _ = projected_len;

        if is_fence_line {
            match fence_lang.take() {
                Some(_) => {
                    // closing an open fence
                }
                None => {
                    let lang = line.trim_start().trim_start_matches("```").trim().to_string();
                    fence_lang = Some(lang);
                }
            }
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks.into_iter().flat_map(force_split).collect()
}

/// Force-split a single chunk that is still over [`CHUNK_MAX`] at the
/// nearest newline, falling back to the nearest space.
fn force_split(chunk: String) -> Vec<String> {
    if chunk.len() <= CHUNK_MAX {
        return vec![chunk];
    }

    let mut out = Vec::new();
    let mut rest = chunk.as_str();
    while rest.len() > CHUNK_MAX {
        let window = &rest[..CHUNK_MAX];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .unwrap_or(CHUNK_MAX);
        let (head, tail) = rest.split_at(split_at.max(1));
        out.push(head.to_string());
        rest = tail.trim_start_matches('\n');
    }
    if !rest.is_empty() {
        out.push(rest.to_string());
    }
    out
}

/// Escape the characters MarkdownV2 treats as special.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(
            ch,
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '>' | '#' | '+' | '-' | '=' | '|'
                | '{' | '}' | '.' | '!'
        ) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_a_single_chunk() {
        assert_eq!(split_chunks_smart("hello"), vec!["hello".to_string()]);
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(split_chunks_smart("").is_empty());
    }

    #[test]
    fn long_text_splits_into_multiple_chunks() {
        let text = "a".repeat(CHUNK_MAX * 2 + 10);
        let chunks = split_chunks_smart(&text);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.len() <= CHUNK_MAX);
        }
    }

    #[test]
    fn escape_handles_all_special_chars() {
        let escaped = escape_markdown_v2("_*[]()~`>#+-=|{}.!");
        assert_eq!(
            escaped,
            "\\_\\*\\[\\]\\(\\)\\~\\`\\>\\#\\+\\-\\=\\|\\{\\}\\.\\!"
        );
    }

    #[test]
    fn escape_leaves_plain_text_untouched() {
        assert_eq!(escape_markdown_v2("hello world"), "hello world");
    }

    #[test]
    fn force_split_breaks_on_newline() {
        let text = format!("{}\n{}", "a".repeat(CHUNK_MAX - 5), "b".repeat(20));
        let chunks = force_split(text);
        assert!(chunks.len() >= 1);
    }
}
