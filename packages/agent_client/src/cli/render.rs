//! Incremental terminal rendering of a live session.
//!
//! Streamed blocks can still change at their tail: a half-received fence or
//! context marker, or whitespace that a fence will trim away. Only the part of
//! the open block that can no longer change is printed, so output is never
//! retracted.

use std::collections::HashMap;

use agent_convo::reassembler::{CODE_FENCE_CLOSE, CODE_FENCE_OPEN, CONTEXT_BEGIN};
use agent_convo::{Block, Change, Message, MessageRole, SessionView};

#[derive(Debug, Default, Clone, Copy)]
struct Cursor {
    block: usize,
    printed: usize,
    fence_open: bool,
}

#[derive(Debug, Default)]
pub struct StreamPrinter {
    show_history: bool,
    cursors: HashMap<String, Cursor>,
    exec_printed: usize,
}

impl StreamPrinter {
    pub fn new(show_history: bool) -> Self {
        Self {
            show_history,
            ..Default::default()
        }
    }

    /// Text to write after `change` was applied to `view`.
    pub fn render(&mut self, view: &SessionView, change: &Change) -> String {
        let mut out = String::new();
        match change {
            Change::Snapshot => {
                self.cursors.clear();
                self.exec_printed = view
                    .execution_log()
                    .last()
                    .map(|e| e.output.len())
                    .unwrap_or(0);
                if self.show_history {
                    for message in view.messages() {
                        out.push_str(&header(message));
                        let mut cursor = Cursor::default();
                        render_blocks(message, &mut cursor, &mut out);
                        self.cursors.insert(message.id.clone(), cursor);
                    }
                } else {
                    for message in view.messages() {
                        self.cursors.insert(
                            message.id.clone(),
                            Cursor {
                                block: message.blocks.len(),
                                ..Default::default()
                            },
                        );
                    }
                }
            }
            Change::MessageStarted(id) => {
                if let Some(message) = view.message(id) {
                    out.push_str(&header(message));
                    let mut cursor = Cursor::default();
                    render_blocks(message, &mut cursor, &mut out);
                    self.cursors.insert(id.clone(), cursor);
                }
            }
            Change::MessageUpdated(id) | Change::MessageFinished(id) => {
                if let Some(message) = view.message(id) {
                    let cursor = self.cursors.entry(id.clone()).or_default();
                    render_blocks(message, cursor, &mut out);
                }
            }
            Change::ExecutionStarted => {
                self.exec_printed = 0;
                if let Some(entry) = view.execution_log().last() {
                    out.push_str(&format!("$ {}\n", entry.command.join(" ")));
                }
            }
            Change::ExecutionOutput => {
                if let Some(entry) = view.execution_log().last() {
                    if let Some(fresh) = entry.output.get(self.exec_printed..) {
                        out.push_str(fresh);
                    }
                    self.exec_printed = entry.output.len();
                }
            }
            Change::ExecutionFinished => {
                if let Some(entry) = view.execution_log().last() {
                    if !entry.output.is_empty() && !entry.output.ends_with('\n') {
                        out.push('\n');
                    }
                    match entry.duration() {
                        Some(d) => out.push_str(&format!(
                            "[exit {} after {:.1}s]\n",
                            entry.exit_code,
                            d.num_milliseconds() as f64 / 1000.0
                        )),
                        None => out.push_str(&format!("[exit {}]\n", entry.exit_code)),
                    }
                }
            }
            _ => {}
        }
        out
    }
}

fn header(message: &Message) -> String {
    let role = match message.role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
        MessageRole::Other => "other",
    };
    match &message.tag {
        Some(tag) => format!("\n[{role}: {tag}]\n"),
        None => format!("\n[{role}]\n"),
    }
}

fn render_blocks(message: &Message, cursor: &mut Cursor, out: &mut String) {
    while let Some(block) = message.blocks.get(cursor.block) {
        let is_last = cursor.block + 1 == message.blocks.len();
        let closed = !is_last || message.finished;
        let content = block.content();
        let target = if closed {
            content.len()
        } else {
            stable_len(block)
        };

        if block.is_code() && !cursor.fence_open && (target > cursor.printed || closed) {
            out.push_str(CODE_FENCE_OPEN);
            out.push('\n');
            cursor.fence_open = true;
        }
        if let Some(fresh) = content.get(cursor.printed..target) {
            out.push_str(fresh);
            cursor.printed = target;
        }

        if !closed {
            return;
        }
        if cursor.fence_open {
            if !content.is_empty() && !content.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(CODE_FENCE_CLOSE);
            out.push('\n');
        } else if cursor.printed > 0 {
            out.push('\n');
        }
        *cursor = Cursor {
            block: cursor.block + 1,
            ..Default::default()
        };
    }
}

/// Length of the prefix of an open block that later deltas cannot change.
fn stable_len(block: &Block) -> usize {
    let content = block.content();
    let (end, markers): (usize, &[&str]) = match block {
        Block::Text { .. } => (
            content.find(CONTEXT_BEGIN).unwrap_or(content.len()),
            &[CONTEXT_BEGIN, CODE_FENCE_OPEN],
        ),
        Block::Code { .. } => (content.len(), &[CODE_FENCE_CLOSE]),
    };
    let head = &content[..end];
    let held = markers
        .iter()
        .map(|m| partial_marker_len(head, m))
        .max()
        .unwrap_or(0);
    head[..head.len() - held].trim_end().len()
}

/// Longest proper prefix of `marker` that `text` ends with.
fn partial_marker_len(text: &str, marker: &str) -> usize {
    (1..marker.len())
        .rev()
        .find(|&k| text.ends_with(&marker[..k]))
        .unwrap_or(0)
}
