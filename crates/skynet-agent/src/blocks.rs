//! Content-block manager (C6, §3, §4.6): tracks open Anthropic content-block
//! indices across one provider stream and the per-tool accumulators used to
//! rebuild the `Task` tool's arguments (§4.9 step 2.d).

use std::collections::HashMap;

/// Per-stream content-block bookkeeping. One instance lives for the duration
/// of a single translated response (C9).
#[derive(Debug, Default)]
pub struct BlockManager {
    thinking_index: Option<u32>,
    text_index: Option<u32>,
    /// Upstream tool-call stream index -> Anthropic block index.
    tool_indices: HashMap<u32, u32>,
    tool_names: HashMap<u32, String>,
    tool_started: HashMap<u32, bool>,
    tool_contents: HashMap<u32, String>,
    /// Buffered arguments for a `Task` tool until they parse as a JSON object (§4.9).
    task_arg_buffer: HashMap<u32, String>,
    task_args_emitted: HashMap<u32, bool>,
    next_block_index: u32,
    tool_blocks_emitted: u32,
}

/// Instruction returned by `ensure_*`/`start_tool_block` telling the SSE
/// builder (C7) which wire events to emit.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockAction {
    /// Block already open — just emit a delta.
    None,
    /// Close the other kind of block (if open) then start this one.
    Start { index: u32 },
    CloseThenStart { closed: u32, index: u32 },
}

impl BlockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_index(&mut self) -> u32 {
        let idx = self.next_block_index;
        self.next_block_index += 1;
        idx
    }

    pub fn thinking_index(&self) -> Option<u32> {
        self.thinking_index
    }

    pub fn text_index(&self) -> Option<u32> {
        self.text_index
    }

    pub fn tool_blocks_emitted(&self) -> u32 {
        self.tool_blocks_emitted
    }

    pub fn has_emitted_any_block(&self) -> bool {
        self.thinking_index.is_some() || self.text_index.is_some() || self.tool_blocks_emitted > 0
    }

    /// Ensure a thinking block is open, closing any open text block first.
    pub fn ensure_thinking_block(&mut self) -> BlockAction {
        if self.thinking_index.is_some() {
            return BlockAction::None;
        }
        let idx = self.allocate_index();
        self.thinking_index = Some(idx);
        if let Some(closed) = self.text_index.take() {
            BlockAction::CloseThenStart { closed, index: idx }
        } else {
            BlockAction::Start { index: idx }
        }
    }

    /// Ensure a text block is open, closing any open thinking block first.
    pub fn ensure_text_block(&mut self) -> BlockAction {
        if self.text_index.is_some() {
            return BlockAction::None;
        }
        let idx = self.allocate_index();
        self.text_index = Some(idx);
        if let Some(closed) = self.thinking_index.take() {
            BlockAction::CloseThenStart { closed, index: idx }
        } else {
            BlockAction::Start { index: idx }
        }
    }

    /// Close any open text/thinking block (called before starting a tool block).
    pub fn close_text_and_thinking(&mut self) -> Vec<u32> {
        let mut closed = Vec::new();
        if let Some(idx) = self.thinking_index.take() {
            closed.push(idx);
        }
        if let Some(idx) = self.text_index.take() {
            closed.push(idx);
        }
        closed
    }

    /// Allocate (or return the existing) Anthropic block index for an
    /// upstream tool-call stream index, marking the block as started.
    pub fn start_tool_block(&mut self, stream_index: u32, name: String) -> (u32, bool) {
        if let Some(&idx) = self.tool_indices.get(&stream_index) {
            return (idx, false);
        }
        let idx = self.allocate_index();
        self.tool_indices.insert(stream_index, idx);
        self.tool_names.insert(stream_index, name);
        self.tool_started.insert(stream_index, true);
        self.tool_contents.insert(stream_index, String::new());
        self.tool_blocks_emitted += 1;
        (idx, true)
    }

    /// Allocate a standalone tool block with no upstream stream index to key
    /// on — used for heuristically-recovered tool calls (C5), which complete
    /// in one shot rather than accumulating fragments.
    pub fn start_standalone_tool_block(&mut self) -> u32 {
        let idx = self.allocate_index();
        self.tool_blocks_emitted += 1;
        idx
    }

    pub fn tool_block_index(&self, stream_index: u32) -> Option<u32> {
        self.tool_indices.get(&stream_index).copied()
    }

    pub fn is_tool_started(&self, stream_index: u32) -> bool {
        self.tool_started.get(&stream_index).copied().unwrap_or(false)
    }

    pub fn tool_name(&self, stream_index: u32) -> Option<&str> {
        self.tool_names.get(&stream_index).map(|s| s.as_str())
    }

    pub fn append_tool_name_fragment(&mut self, stream_index: u32, fragment: &str) {
        self.tool_names
            .entry(stream_index)
            .or_default()
            .push_str(fragment);
    }

    pub fn accumulate_tool_content(&mut self, stream_index: u32, fragment: &str) {
        self.tool_contents
            .entry(stream_index)
            .or_default()
            .push_str(fragment);
    }

    pub fn tool_content(&self, stream_index: u32) -> &str {
        self.tool_contents
            .get(&stream_index)
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    pub fn is_task_tool(&self, stream_index: u32) -> bool {
        self.tool_names.get(&stream_index).map(|n| n.as_str()) == Some("Task")
    }

    pub fn task_args_emitted(&self, stream_index: u32) -> bool {
        self.task_args_emitted.get(&stream_index).copied().unwrap_or(false)
    }

    pub fn mark_task_args_emitted(&mut self, stream_index: u32) {
        self.task_args_emitted.insert(stream_index, true);
    }

    pub fn append_task_arg_fragment(&mut self, stream_index: u32, fragment: &str) {
        self.task_arg_buffer
            .entry(stream_index)
            .or_default()
            .push_str(fragment);
    }

    pub fn task_arg_buffer(&self, stream_index: u32) -> &str {
        self.task_arg_buffer
            .get(&stream_index)
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    /// Every buffered `Task` stream index that never reached parseability.
    pub fn pending_task_buffers(&self) -> Vec<u32> {
        self.task_arg_buffer
            .keys()
            .filter(|idx| !self.task_args_emitted(**idx))
            .copied()
            .collect()
    }

    pub fn stop_tool_block(&mut self, stream_index: u32) {
        self.tool_started.remove(&stream_index);
    }

    /// Close every block still open at end of stream, returning their indices.
    pub fn close_all_blocks(&mut self) -> Vec<u32> {
        let mut closed = self.close_text_and_thinking();
        let tool_indices: Vec<u32> = self
            .tool_started
            .keys()
            .filter_map(|k| self.tool_indices.get(k).copied())
            .collect();
        self.tool_started.clear();
        closed.extend(tool_indices);
        closed.sort_unstable();
        closed
    }
}

/// Force `input.run_in_background = false` on a `Task` tool's arguments (§4.9,
/// §8 "Task run_in_background override" — an explicit, non-negotiable product
/// decision per §9 Open Question (c)).
pub fn force_task_background_off(input: &mut serde_json::Value) {
    if let serde_json::Value::Object(map) = input {
        map.insert("run_in_background".to_string(), serde_json::Value::Bool(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_thinking_never_open_simultaneously() {
        let mut bm = BlockManager::new();
        let a = bm.ensure_thinking_block();
        assert_eq!(a, BlockAction::Start { index: 0 });
        let b = bm.ensure_text_block();
        assert_eq!(b, BlockAction::CloseThenStart { closed: 0, index: 1 });
        assert!(bm.thinking_index().is_none());
        assert_eq!(bm.text_index(), Some(1));
    }

    #[test]
    fn tool_block_index_stable_across_fragments() {
        let mut bm = BlockManager::new();
        let (idx1, started1) = bm.start_tool_block(0, "search".into());
        let (idx2, started2) = bm.start_tool_block(0, "search".into());
        assert_eq!(idx1, idx2);
        assert!(started1);
        assert!(!started2);
    }

    #[test]
    fn force_task_background_off_always_sets_false() {
        let mut v = serde_json::json!({"description": "x", "run_in_background": true});
        force_task_background_off(&mut v);
        assert_eq!(v["run_in_background"], false);

        let mut v2 = serde_json::json!({"description": "x"});
        force_task_background_off(&mut v2);
        assert_eq!(v2["run_in_background"], false);
    }
}
