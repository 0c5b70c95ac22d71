//! Client-side view of one agent session, built from push events.

use std::collections::HashMap;

use crate::error::{ConvoError, Result};
use crate::execution::ExecutionLog;
use crate::protocol::ServerEvent;
use crate::reassembler::append_delta;
use crate::types::{
    AgentSession, CodeFile, HistoryItem, Message, MessageRole, OutputFile, UploadedFile,
    UsageTotals,
};

/// What a single applied event changed, for consumers that redraw selectively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// The snapshot was replaced and history replayed
    Snapshot,
    MessageStarted(String),
    MessageUpdated(String),
    MessageFinished(String),
    Usage,
    CodeFileAdded(usize),
    ExecutionStarted,
    ExecutionOutput,
    ExecutionFinished,
    OutputFiles,
    Error(String),
    /// Event type this client does not understand
    Ignored,
}

#[derive(Debug, Clone, Default)]
pub struct SessionView {
    session: Option<AgentSession>,
    messages: Vec<Message>,
    index: HashMap<String, usize>,
    code_files: Vec<CodeFile>,
    selected_program: Option<usize>,
    execution_log: ExecutionLog,
    output_files: Vec<OutputFile>,
    usage: UsageTotals,
    has_default_llm: bool,
    last_error: Option<String>,
}

impl SessionView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one push event in arrival order.
    pub fn apply(&mut self, event: ServerEvent) -> Result<Change> {
        match event {
            ServerEvent::State {
                state,
                has_default_llm,
            } => {
                self.has_default_llm = has_default_llm;
                self.load_snapshot(*state);
                Ok(Change::Snapshot)
            }
            ServerEvent::ResponseStart { id, role, tag } => {
                self.start_message(id.clone(), role, tag);
                Ok(Change::MessageStarted(id))
            }
            ServerEvent::ResponseChunk { id, text } => {
                let message = self.message_mut(&id)?;
                if message.finished {
                    return Err(ConvoError::MessageFinished(id));
                }
                append_delta(message, &text);
                Ok(Change::MessageUpdated(id))
            }
            ServerEvent::ResponseEnd { id } => {
                self.message_mut(&id)?.finished = true;
                Ok(Change::MessageFinished(id))
            }
            ServerEvent::Usage {
                prompt_tokens,
                completion_tokens,
                cost,
            } => {
                self.usage.add(prompt_tokens, completion_tokens, cost);
                Ok(Change::Usage)
            }
            ServerEvent::CodeFile { code_file } => {
                self.code_files.push(code_file);
                let index = self.code_files.len() - 1;
                self.selected_program = Some(index);
                Ok(Change::CodeFileAdded(index))
            }
            ServerEvent::ExecutionStart {
                command,
                tag,
                start_time,
            } => {
                self.execution_log.start(command, tag, start_time);
                Ok(Change::ExecutionStarted)
            }
            ServerEvent::ExecutionChunk { output } => {
                self.execution_log.append_output(&output)?;
                Ok(Change::ExecutionOutput)
            }
            ServerEvent::ExecutionEnd {
                exit_code,
                end_time,
            } => {
                self.execution_log.finish(exit_code, end_time)?;
                Ok(Change::ExecutionFinished)
            }
            ServerEvent::OutputFiles { files } => {
                self.output_files = files;
                Ok(Change::OutputFiles)
            }
            ServerEvent::Error { message } => {
                self.last_error = Some(message.clone());
                Ok(Change::Error(message))
            }
            ServerEvent::Unknown => Ok(Change::Ignored),
        }
    }

    /// Replace everything with a session snapshot and replay its history
    /// through the reassembler.
    pub fn load_snapshot(&mut self, session: AgentSession) {
        self.messages.clear();
        self.index.clear();
        self.code_files = session.code_files.clone();
        self.selected_program = self.code_files.len().checked_sub(1);
        self.execution_log = ExecutionLog::from_entries(session.execution_log.clone());
        self.output_files = session.output_files.clone();
        self.usage = UsageTotals {
            prompt_tokens: session.total_prompt_tokens,
            completion_tokens: session.total_completion_tokens,
            cost: session.total_cost,
        };
        self.last_error = session.error.clone();

        for item in &session.history {
            self.replay(item);
        }
        self.session = Some(session);
    }

    fn replay(&mut self, item: &HistoryItem) {
        self.start_message(item.id.clone(), item.role, item.tag.clone());
        if let Some(&idx) = self.index.get(&item.id) {
            let message = &mut self.messages[idx];
            append_delta(message, &item.content);
            message.finished = true;
        }
    }

    /// A repeated start for a known id restarts that message in place.
    fn start_message(&mut self, id: String, role: MessageRole, tag: Option<String>) {
        let message = Message::new(id.clone(), role, tag);
        match self.index.get(&id) {
            Some(&idx) => self.messages[idx] = message,
            None => {
                self.index.insert(id, self.messages.len());
                self.messages.push(message);
            }
        }
    }

    fn message_mut(&mut self, id: &str) -> Result<&mut Message> {
        let idx = *self
            .index
            .get(id)
            .ok_or_else(|| ConvoError::UnknownMessage(id.to_string()))?;
        Ok(&mut self.messages[idx])
    }

    pub fn session(&self) -> Option<&AgentSession> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.index.get(id).map(|&idx| &self.messages[idx])
    }

    pub fn code_files(&self) -> &[CodeFile] {
        &self.code_files
    }

    /// The program most recently produced (or loaded), if any.
    pub fn selected_program(&self) -> Option<&CodeFile> {
        self.selected_program.and_then(|i| self.code_files.get(i))
    }

    pub fn uploaded_files(&self) -> &[UploadedFile] {
        self.session
            .as_ref()
            .map(|s| s.uploaded_files.as_slice())
            .unwrap_or(&[])
    }

    pub fn execution_log(&self) -> &ExecutionLog {
        &self.execution_log
    }

    pub fn output_files(&self) -> &[OutputFile] {
        &self.output_files
    }

    pub fn usage(&self) -> UsageTotals {
        self.usage
    }

    pub fn has_default_llm(&self) -> bool {
        self.has_default_llm
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// True while an assistant message is still streaming.
    pub fn is_generating(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.role == MessageRole::Assistant && !m.finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Block;
    use serde_json::json;

    fn event(value: serde_json::Value) -> ServerEvent {
        serde_json::from_value(value).unwrap()
    }

    fn stream(view: &mut SessionView, id: &str, chunks: &[&str]) {
        view.apply(event(json!({"type": "response_start", "role": "assistant", "id": id})))
            .unwrap();
        for chunk in chunks {
            view.apply(event(json!({"type": "response_chunk", "id": id, "text": chunk})))
                .unwrap();
        }
        view.apply(event(json!({"type": "response_end", "id": id})))
            .unwrap();
    }

    #[test]
    fn test_live_stream_builds_blocks() {
        let mut view = SessionView::new();
        view.apply(event(json!({"type": "response_start", "role": "assistant", "id": "a1"})))
            .unwrap();
        assert!(view.is_generating());
        view.apply(event(
            json!({"type": "response_chunk", "id": "a1", "text": "intro ```python\nprint(1"}),
        ))
        .unwrap();
        view.apply(event(json!({"type": "response_chunk", "id": "a1", "text": ")\n``` outro"})))
            .unwrap();
        let change = view
            .apply(event(json!({"type": "response_end", "id": "a1"})))
            .unwrap();
        assert_eq!(change, Change::MessageFinished("a1".into()));
        assert!(!view.is_generating());

        let msg = view.message("a1").unwrap();
        assert_eq!(msg.blocks.len(), 3);
        assert_eq!(msg.blocks[1].content(), "print(1)");
        assert!(msg.blocks[1].is_completed());
    }

    #[test]
    fn test_interleaved_messages_do_not_mix() {
        let mut view = SessionView::new();
        view.apply(event(json!({"type": "response_start", "role": "user", "id": "u"})))
            .unwrap();
        view.apply(event(json!({"type": "response_start", "role": "assistant", "id": "a"})))
            .unwrap();
        view.apply(event(json!({"type": "response_chunk", "id": "u", "text": "question"})))
            .unwrap();
        view.apply(event(json!({"type": "response_chunk", "id": "a", "text": "answer"})))
            .unwrap();
        assert_eq!(view.message("u").unwrap().blocks, vec![Block::text("question")]);
        assert_eq!(view.message("a").unwrap().blocks, vec![Block::text("answer")]);
    }

    #[test]
    fn test_chunk_for_unknown_message_is_error() {
        let mut view = SessionView::new();
        let err = view
            .apply(event(json!({"type": "response_chunk", "id": "nope", "text": "x"})))
            .unwrap_err();
        assert_eq!(err, ConvoError::UnknownMessage("nope".into()));
    }

    #[test]
    fn test_snapshot_replay_matches_live_stream() {
        let content = "Loading ```python\nimport pandas as pd\ndf = pd.read_csv('x.csv')\n``` Saved to pred_results.";
        let mut live = SessionView::new();
        stream(&mut live, "a1", &["Loading ```py", "thon\nimport pandas as pd\ndf = pd.re", "ad_csv('x.csv')\n`", "`` Saved to pred_results."]);

        let mut replayed = SessionView::new();
        replayed
            .apply(event(json!({
                "type": "state",
                "has_default_llm": false,
                "state": {
                    "id": "s1",
                    "history": [
                        {"id": "u1", "role": "user", "content": "Do it BEGIN_CONTEXT: files END_CONTEXT now", "tag": "task"},
                        {"id": "a1", "role": "assistant", "content": content}
                    ],
                    "total_prompt_tokens": 10,
                    "total_completion_tokens": 5,
                    "total_cost": 0.5
                }
            })))
            .unwrap();

        assert_eq!(
            replayed.message("a1").unwrap().blocks,
            live.message("a1").unwrap().blocks
        );
        assert_eq!(
            replayed.message("u1").unwrap().blocks,
            vec![Block::text("Do it  now")]
        );
        assert_eq!(replayed.messages().len(), 2);
        assert_eq!(replayed.session_id(), Some("s1"));
        assert!(!replayed.has_default_llm());
        assert_eq!(replayed.usage().total_tokens(), 15);
    }

    #[test]
    fn test_snapshot_resets_previous_state() {
        let mut view = SessionView::new();
        stream(&mut view, "old", &["stale"]);
        view.apply(event(json!({"type": "state", "state": {"id": "s2"}})))
            .unwrap();
        assert!(view.messages().is_empty());
        assert!(view.message("old").is_none());
    }

    #[test]
    fn test_chunk_after_end_leaves_message_unchanged() {
        let mut view = SessionView::new();
        stream(&mut view, "a", &["done"]);
        let err = view
            .apply(event(json!({"type": "response_chunk", "id": "a", "text": " more"})))
            .unwrap_err();
        assert_eq!(err, ConvoError::MessageFinished("a".into()));
        assert_eq!(view.message("a").unwrap().blocks, vec![Block::text("done")]);

        stream(&mut view, "a", &["restarted"]);
        assert_eq!(view.message("a").unwrap().blocks, vec![Block::text("restarted")]);
    }

    #[test]
    fn test_restarted_message_replaces_in_place() {
        let mut view = SessionView::new();
        stream(&mut view, "a", &["first"]);
        stream(&mut view, "b", &["second"]);
        stream(&mut view, "a", &["again"]);
        assert_eq!(view.messages().len(), 2);
        assert_eq!(view.messages()[0].blocks, vec![Block::text("again")]);
    }

    #[test]
    fn test_execution_events() {
        let mut view = SessionView::new();
        view.apply(event(json!({"type": "execution_start", "command": ["python", "program-0.py"], "tag": null, "start_time": 100})))
            .unwrap();
        view.apply(event(json!({"type": "execution_chunk", "output": "hello\n", "tag": null})))
            .unwrap();
        assert!(view.execution_log().is_running());
        view.apply(event(json!({"type": "execution_end", "exit_code": 0, "end_time": 103})))
            .unwrap();
        let entry = view.execution_log().last().unwrap();
        assert_eq!(entry.output, "hello\n");
        assert_eq!(entry.exit_code, 0);
        assert_eq!(entry.command, vec!["python", "program-0.py"]);
    }

    #[test]
    fn test_code_files_output_files_usage_and_errors() {
        let mut view = SessionView::new();
        let change = view
            .apply(event(json!({"type": "code_file", "code_file": {
                "id": "c1", "filename": "program-0.py", "content": "x", "user_content": "x",
                "history_id": "a1", "block_index": 0, "is_gold": false
            }})))
            .unwrap();
        assert_eq!(change, Change::CodeFileAdded(0));
        assert_eq!(view.selected_program().unwrap().id, "c1");

        view.apply(event(json!({"type": "output_files", "files": [
            {"id": "o1", "hash": "h", "filename": "a.png", "size": 10, "mimetype": "image/png", "code_data_id": "c1", "object_name": "s/a.png"}
        ]})))
        .unwrap();
        view.apply(event(json!({"type": "output_files", "files": [
            {"id": "o2", "filename": "b.csv"}
        ]})))
        .unwrap();
        assert_eq!(view.output_files().len(), 1);
        assert_eq!(view.output_files()[0].filename, "b.csv");

        view.apply(event(json!({"type": "usage", "prompt_tokens": 100, "completion_tokens": 20, "cost": 0.25})))
            .unwrap();
        view.apply(event(json!({"type": "usage", "prompt_tokens": 1, "completion_tokens": 2, "cost": 0.25})))
            .unwrap();
        assert_eq!(view.usage().prompt_tokens, 101);
        assert_eq!(view.usage().cost, 0.5);

        view.apply(event(json!({"type": "error", "message": "boom"})))
            .unwrap();
        assert_eq!(view.last_error(), Some("boom"));

        assert_eq!(
            view.apply(event(json!({"type": "brand_new"}))).unwrap(),
            Change::Ignored
        );
    }
}
