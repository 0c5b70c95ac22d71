use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Language name attached to code blocks opened by a ```` ```python ```` fence.
pub const CODE_LANGUAGE: &str = "Python";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    #[default]
    Assistant,
    System,
    /// Catch-all for roles this client does not know about
    #[serde(other)]
    Other,
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            _ => Err(format!("Invalid message role: {}", s)),
        }
    }
}

/// One piece of a reassembled message: prose or a fenced program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        content: String,
    },
    Code {
        content: String,
        language: String,
        #[serde(default)]
        completed: bool,
    },
}

impl Block {
    pub fn text(content: impl Into<String>) -> Self {
        Block::Text {
            content: content.into(),
        }
    }

    /// An open (not yet completed) code block.
    pub fn code(content: impl Into<String>) -> Self {
        Block::Code {
            content: content.into(),
            language: CODE_LANGUAGE.to_string(),
            completed: false,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Block::Text { content } | Block::Code { content, .. } => content,
        }
    }

    pub fn is_code(&self) -> bool {
        matches!(self, Block::Code { .. })
    }

    /// True for code blocks whose closing fence has been seen.
    pub fn is_completed(&self) -> bool {
        matches!(self, Block::Code { completed: true, .. })
    }
}

/// A conversation message reconstructed from `response_*` events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub blocks: Vec<Block>,
    /// Set once `response_end` arrives.
    #[serde(default)]
    pub finished: bool,

    /// The open block was seeded by a fence split and has no content yet;
    /// leading whitespace of the next delta is dropped.
    #[serde(skip)]
    pub(crate) trim_leading: bool,
}

impl Message {
    pub fn new(id: impl Into<String>, role: MessageRole, tag: Option<String>) -> Self {
        Self {
            id: id.into(),
            role,
            tag,
            blocks: Vec::new(),
            finished: false,
            trim_leading: false,
        }
    }

    /// The block currently receiving text, if any.
    pub fn open_block(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn code_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.is_code())
    }

    /// All block contents joined with blank lines, for search and display.
    pub fn plain_text(&self) -> String {
        self.blocks
            .iter()
            .map(Block::content)
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// A persisted conversation turn as stored in the session snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryItem {
    pub id: String,
    #[serde(default)]
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeFile {
    pub id: String,
    pub filename: String,
    /// Code as generated by the agent
    #[serde(default)]
    pub content: String,
    /// Code after user edits
    #[serde(default)]
    pub user_content: String,
    /// History item (assistant message) that produced this program
    #[serde(default)]
    pub history_id: String,
    #[serde(default)]
    pub block_index: usize,
    #[serde(default)]
    pub is_gold: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadedFile {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub object_name: String,
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputFile {
    pub id: String,
    #[serde(default)]
    pub hash: String,
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mimetype: String,
    /// Code file that produced this output
    #[serde(default)]
    pub code_data_id: String,
    #[serde(default)]
    pub object_name: String,
}

/// One subprocess run on the backend. `exit_code` is -1 while running.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionLogEntry {
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub end_time: f64,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl ExecutionLogEntry {
    pub const RUNNING: i32 = -1;

    pub fn is_running(&self) -> bool {
        self.exit_code == Self::RUNNING
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        timestamp(self.start_time)
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        if self.is_running() {
            None
        } else {
            timestamp(self.end_time)
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at(), self.ended_at()) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

fn timestamp(secs: f64) -> Option<DateTime<Utc>> {
    if secs <= 0.0 {
        return None;
    }
    DateTime::from_timestamp(secs.trunc() as i64, (secs.fract() * 1e9) as u32)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    Benchmark,
    #[default]
    User,
}

/// Benchmark task description (ScienceAgentBench schema). Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Task {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_inst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_knowledge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_folder_tree: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionMetadata {
    #[serde(default)]
    pub created_at: f64,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub source: SessionSource,
    #[serde(flatten)]
    pub task: Task,
}

impl SessionMetadata {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        timestamp(self.created_at)
    }
}

/// Full session snapshot as sent in the `state` event and by the task endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentSession {
    pub id: String,
    #[serde(default)]
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub task_instruction: String,
    #[serde(default)]
    pub domain_knowledge: String,
    #[serde(default)]
    pub history: Vec<HistoryItem>,
    #[serde(default)]
    pub total_prompt_tokens: u64,
    #[serde(default)]
    pub total_completion_tokens: u64,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub execution_log: Vec<ExecutionLogEntry>,
    #[serde(default)]
    pub code_files: Vec<CodeFile>,
    #[serde(default)]
    pub uploaded_files: Vec<UploadedFile>,
    #[serde(default)]
    pub output_files: Vec<OutputFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Running token and cost totals for a session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

impl UsageTotals {
    pub fn add(&mut self, prompt_tokens: u64, completion_tokens: u64, cost: f64) {
        self.prompt_tokens += prompt_tokens;
        self.completion_tokens += completion_tokens;
        self.cost += cost;
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}
