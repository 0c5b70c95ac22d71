//! Incremental reconstruction of text/code blocks from streamed deltas.
//!
//! Deltas are appended to the last (open) block of a [`Message`]. After every
//! append the open block is rescanned until no marker remains, so a fence that
//! arrives split across several deltas, or several fences arriving in one
//! delta, produce the same blocks as the whole text delivered at once.

use crate::types::{Block, Message};

/// Start of an out-of-band context payload that is never shown.
pub const CONTEXT_BEGIN: &str = "BEGIN_CONTEXT: ";
/// End of an out-of-band context payload.
pub const CONTEXT_END: &str = "END_CONTEXT";
/// Fence that opens a code block.
pub const CODE_FENCE_OPEN: &str = "```python";
/// Fence that closes a code block.
pub const CODE_FENCE_CLOSE: &str = "```";

enum Split {
    /// The open text block had nothing before the fence; it becomes the code block.
    ConvertToCode(String),
    /// Close the open block and push a new one.
    Push(Block),
}

/// Append one streamed delta to `message` and split the open block on any
/// fence now visible. Never fails: an unclosed fence simply leaves the last
/// block open.
pub fn append_delta(message: &mut Message, delta: &str) {
    if delta.is_empty() {
        return;
    }

    let delta = if message.trim_leading {
        let trimmed = delta.trim_start();
        if trimmed.is_empty() {
            return;
        }
        trimmed
    } else {
        delta
    };

    if message.blocks.is_empty() {
        message.blocks.push(Block::text(""));
    }
    if let Some(Block::Text { content } | Block::Code { content, .. }) = message.blocks.last_mut()
    {
        content.push_str(delta);
    }
    message.trim_leading = false;

    while let Some(split) = next_split(message) {
        match split {
            Split::ConvertToCode(seed) => {
                if let Some(open) = message.blocks.last_mut() {
                    *open = Block::code(seed);
                }
            }
            Split::Push(block) => message.blocks.push(block),
        }
        message.trim_leading = message
            .blocks
            .last()
            .map(|b| b.content().is_empty())
            .unwrap_or(false);
    }
}

/// Find the first transition in the open block, closing it in place.
fn next_split(message: &mut Message) -> Option<Split> {
    match message.blocks.last_mut()? {
        Block::Text { content } => {
            strip_context(content);
            let fence = content.find(CODE_FENCE_OPEN)?;
            // A fence inside a context span whose end has not arrived yet may
            // still be stripped, so hold off until the span closes.
            if content.find(CONTEXT_BEGIN).is_some_and(|begin| begin < fence) {
                return None;
            }
            let (before, after) = content.split_at(fence);
            let after = &after[CODE_FENCE_OPEN.len()..];
            let before = before.trim_end().to_string();
            let seed = after.trim_start().to_string();
            if before.is_empty() {
                Some(Split::ConvertToCode(seed))
            } else {
                *content = before;
                Some(Split::Push(Block::code(seed)))
            }
        }
        Block::Code {
            content, completed, ..
        } => {
            if *completed {
                return None;
            }
            let (before, after) = content.split_once(CODE_FENCE_CLOSE)?;
            let before = before.trim_end().to_string();
            let seed = after.trim_start().to_string();
            *content = before;
            *completed = true;
            Some(Split::Push(Block::text(seed)))
        }
    }
}

/// Remove every complete `BEGIN_CONTEXT: ... END_CONTEXT` span, markers included.
/// An end marker that precedes the begin marker does not close it.
pub fn strip_context(content: &mut String) {
    while let Some(start) = content.find(CONTEXT_BEGIN) {
        let payload_start = start + CONTEXT_BEGIN.len();
        let Some(end) = content[payload_start..].find(CONTEXT_END) else {
            break;
        };
        content.replace_range(start..payload_start + end + CONTEXT_END.len(), "");
    }
}

/// Build a message from its complete text, as done when replaying history.
pub fn reassemble(message: &mut Message, full_text: &str) {
    append_delta(message, full_text);
}
