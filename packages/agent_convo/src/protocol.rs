//! Wire protocol between the client and the agent backend.
//!
//! Frames are JSON text messages. The client sends [`CommandFrame`]s; the
//! server pushes [`ServerEvent`]s tagged on `type`, and answers commands with
//! a frame echoing their `command_id`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{AgentSession, CodeFile, MessageRole, OutputFile};

/// Server-originated push events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Full session snapshot, sent once per connection
    State {
        state: Box<AgentSession>,
        #[serde(default)]
        has_default_llm: bool,
    },
    ResponseStart {
        id: String,
        #[serde(default)]
        role: MessageRole,
        #[serde(default)]
        tag: Option<String>,
    },
    ResponseChunk {
        id: String,
        text: String,
    },
    ResponseEnd {
        id: String,
    },
    Usage {
        #[serde(default)]
        prompt_tokens: u64,
        #[serde(default)]
        completion_tokens: u64,
        #[serde(default)]
        cost: f64,
    },
    CodeFile {
        code_file: CodeFile,
    },
    ExecutionStart {
        #[serde(default)]
        command: Vec<String>,
        #[serde(default)]
        tag: Option<String>,
        #[serde(default)]
        start_time: f64,
    },
    ExecutionChunk {
        output: String,
    },
    ExecutionEnd {
        exit_code: i32,
        #[serde(default)]
        end_time: f64,
    },
    OutputFiles {
        files: Vec<OutputFile>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    /// Catch-all for event types newer than this client
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// The `type` tag as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::State { .. } => "state",
            ServerEvent::ResponseStart { .. } => "response_start",
            ServerEvent::ResponseChunk { .. } => "response_chunk",
            ServerEvent::ResponseEnd { .. } => "response_end",
            ServerEvent::Usage { .. } => "usage",
            ServerEvent::CodeFile { .. } => "code_file",
            ServerEvent::ExecutionStart { .. } => "execution_start",
            ServerEvent::ExecutionChunk { .. } => "execution_chunk",
            ServerEvent::ExecutionEnd { .. } => "execution_end",
            ServerEvent::OutputFiles { .. } => "output_files",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Unknown => "unknown",
        }
    }
}

/// Client-to-server command: `{ command, command_id, ...args }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandFrame {
    pub command: String,
    pub command_id: u64,
    #[serde(flatten)]
    pub args: Map<String, Value>,
}

/// Returns the `command_id` a server frame answers, if any.
pub fn response_command_id(frame: &Value) -> Option<u64> {
    frame.get("command_id").and_then(Value::as_u64)
}

/// Returns the error message of an `{"type": "error"}` frame.
pub fn error_message(frame: &Value) -> Option<String> {
    if frame.get("type").and_then(Value::as_str) != Some("error") {
        return None;
    }
    Some(
        frame
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error")
            .to_string(),
    )
}

/// Optional LLM settings sent along with generation commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LlmOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_engine_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_base_url: Option<String>,
}

/// Commands understood by the agent backend.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum AgentCommand {
    SolveTask {
        use_self_debug: bool,
        #[serde(skip)]
        llm: LlmOverride,
    },
    FollowUp {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code_id: Option<String>,
        use_self_debug: bool,
        #[serde(skip)]
        llm: LlmOverride,
    },
    RunProgram {
        id: String,
    },
    UpdateProgram {
        id: String,
        user_content: String,
    },
    UpdateTaskInputs {
        task_instruction: String,
        domain_knowledge: String,
        description: String,
    },
    Cancel,
    Clear,
}

impl AgentCommand {
    /// Split into the command name and its argument object.
    pub fn into_parts(self) -> serde_json::Result<(String, Map<String, Value>)> {
        let llm = match &self {
            AgentCommand::SolveTask { llm, .. } | AgentCommand::FollowUp { llm, .. } => {
                Some(serde_json::to_value(llm)?)
            }
            _ => None,
        };
        let mut args = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Some(Value::Object(llm)) = llm {
            args.extend(llm);
        }
        let name = match args.remove("command") {
            Some(Value::String(name)) => name,
            _ => String::new(),
        };
        Ok((name, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_chunk_deserialize() {
        let ev: ServerEvent =
            serde_json::from_str(r#"{"type":"response_chunk","id":"abc","text":"hello"}"#)
                .unwrap();
        assert_eq!(
            ev,
            ServerEvent::ResponseChunk {
                id: "abc".into(),
                text: "hello".into()
            }
        );
        assert_eq!(ev.kind(), "response_chunk");
    }

    #[test]
    fn test_assistant_start_without_tag() {
        let ev: ServerEvent =
            serde_json::from_str(r#"{"type":"response_start","role":"assistant","id":"r1"}"#)
                .unwrap();
        match ev {
            ServerEvent::ResponseStart { id, role, tag } => {
                assert_eq!(id, "r1");
                assert_eq!(role, MessageRole::Assistant);
                assert!(tag.is_none());
            }
            _ => panic!("Expected ResponseStart"),
        }
    }

    #[test]
    fn test_unknown_type_falls_back() {
        let ev: ServerEvent =
            serde_json::from_str(r#"{"type":"heartbeat","at":1}"#).unwrap();
        assert_eq!(ev, ServerEvent::Unknown);
    }

    #[test]
    fn test_state_event() {
        let ev: ServerEvent = serde_json::from_value(json!({
            "type": "state",
            "has_default_llm": true,
            "state": {
                "id": "s1",
                "history": [{"id": "h1", "role": "user", "content": "hi", "tag": "task"}],
                "execution_log": [],
                "code_files": [],
                "output_files": []
            }
        }))
        .unwrap();
        match ev {
            ServerEvent::State {
                state,
                has_default_llm,
            } => {
                assert!(has_default_llm);
                assert_eq!(state.history.len(), 1);
                assert_eq!(state.history[0].tag.as_deref(), Some("task"));
            }
            _ => panic!("Expected State"),
        }
    }

    #[test]
    fn test_command_frame_flattens_args() {
        let mut args = Map::new();
        args.insert("id".into(), json!("code-1"));
        let frame = CommandFrame {
            command: "run_program".into(),
            command_id: 3,
            args,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({"command": "run_program", "command_id": 3, "id": "code-1"})
        );
    }

    #[test]
    fn test_response_helpers() {
        let ok = json!({"command_id": 4});
        assert_eq!(response_command_id(&ok), Some(4));
        assert_eq!(error_message(&ok), None);

        let err = json!({"type": "error", "message": "Command cancelled", "command_id": 5});
        assert_eq!(response_command_id(&err), Some(5));
        assert_eq!(error_message(&err).as_deref(), Some("Command cancelled"));

        let push = json!({"type": "usage", "cost": 0.1});
        assert_eq!(response_command_id(&push), None);
    }

    #[test]
    fn test_agent_command_parts() {
        let (name, args) = AgentCommand::SolveTask {
            use_self_debug: true,
            llm: LlmOverride {
                llm_engine_name: Some("gpt-4o".into()),
                ..Default::default()
            },
        }
        .into_parts()
        .unwrap();
        assert_eq!(name, "solve_task");
        assert_eq!(args.get("use_self_debug"), Some(&json!(true)));
        assert_eq!(args.get("llm_engine_name"), Some(&json!("gpt-4o")));
        assert!(!args.contains_key("llm_api_key"));

        let (name, args) = AgentCommand::Cancel.into_parts().unwrap();
        assert_eq!(name, "cancel");
        assert!(args.is_empty());
    }
}
