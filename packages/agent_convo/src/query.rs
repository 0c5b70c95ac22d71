use crate::session::SessionView;
use crate::types::{Block, CodeFile, Message, MessageRole};

pub struct SessionQuery<'a> {
    view: &'a SessionView,
}

impl<'a> SessionQuery<'a> {
    pub fn new(view: &'a SessionView) -> Self {
        Self { view }
    }

    pub fn by_role(&self, role: MessageRole) -> Vec<&'a Message> {
        self.view
            .messages()
            .iter()
            .filter(|m| m.role == role)
            .collect()
    }

    pub fn by_tag(&self, tag: &str) -> Vec<&'a Message> {
        self.view
            .messages()
            .iter()
            .filter(|m| m.tag.as_deref() == Some(tag))
            .collect()
    }

    pub fn contains_text(&self, search: &str) -> Vec<&'a Message> {
        let search_lower = search.to_lowercase();
        self.view
            .messages()
            .iter()
            .filter(|m| {
                m.blocks
                    .iter()
                    .any(|b| b.content().to_lowercase().contains(&search_lower))
            })
            .collect()
    }

    /// Completed code blocks across all messages, oldest first.
    pub fn completed_code(&self) -> Vec<&'a str> {
        self.view
            .messages()
            .iter()
            .flat_map(|m| m.blocks.iter())
            .filter(|b| b.is_completed())
            .map(Block::content)
            .collect()
    }

    /// The last completed program written by the assistant.
    pub fn latest_program(&self) -> Option<&'a str> {
        self.view
            .messages()
            .iter()
            .rev()
            .filter(|m| m.role == MessageRole::Assistant)
            .flat_map(|m| m.blocks.iter().rev())
            .find(|b| b.is_completed())
            .map(Block::content)
    }

    /// Code files the backend extracted from the given message.
    pub fn code_files_for(&self, message_id: &str) -> Vec<&'a CodeFile> {
        self.view
            .code_files()
            .iter()
            .filter(|f| f.history_id == message_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerEvent;
    use serde_json::json;

    fn create_test_view() -> SessionView {
        let mut view = SessionView::new();
        let state: ServerEvent = serde_json::from_value(json!({
            "type": "state",
            "state": {
                "id": "s1",
                "history": [
                    {"id": "u1", "role": "user", "content": "Plot the Iris dataset", "tag": "task"},
                    {"id": "a1", "role": "assistant", "content": "Sure ```python\nplot(1)\n``` done"},
                    {"id": "u2", "role": "user", "content": "Now fix the error", "tag": "debug"},
                    {"id": "a2", "role": "assistant", "content": "Fixed ```python\nplot(2)\n```\nand ```python\nsave()\n``` ok"}
                ],
                "code_files": [
                    {"id": "c1", "filename": "program-0.py", "history_id": "a1"},
                    {"id": "c2", "filename": "program-1.py", "history_id": "a2"},
                    {"id": "c3", "filename": "program-2.py", "history_id": "a2", "block_index": 1}
                ]
            }
        }))
        .unwrap();
        view.apply(state).unwrap();
        view
    }

    #[test]
    fn test_query_by_role_and_tag() {
        let view = create_test_view();
        let query = SessionQuery::new(&view);

        assert_eq!(query.by_role(MessageRole::User).len(), 2);
        assert_eq!(query.by_role(MessageRole::Assistant).len(), 2);
        let debug = query.by_tag("debug");
        assert_eq!(debug.len(), 1);
        assert_eq!(debug[0].id, "u2");
    }

    #[test]
    fn test_query_contains_text() {
        let view = create_test_view();
        let query = SessionQuery::new(&view);

        let results = query.contains_text("iris");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "u1");

        let results = query.contains_text("PLOT(");
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_query_code() {
        let view = create_test_view();
        let query = SessionQuery::new(&view);

        assert_eq!(query.completed_code(), vec!["plot(1)", "plot(2)", "save()"]);
        assert_eq!(query.latest_program(), Some("save()"));
        assert_eq!(query.code_files_for("a2").len(), 2);
        assert!(query.code_files_for("u1").is_empty());
    }
}
