//! Execution log: one entry per backend subprocess run.
//!
//! The protocol carries no execution id, so `execution_chunk` and
//! `execution_end` always target the most recent entry.

use serde::{Deserialize, Serialize};

use crate::error::{ConvoError, Result};
use crate::types::ExecutionLogEntry;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ExecutionLog {
    entries: Vec<ExecutionLogEntry>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<ExecutionLogEntry>) -> Self {
        Self { entries }
    }

    pub fn start(&mut self, command: Vec<String>, tag: Option<String>, start_time: f64) {
        self.entries.push(ExecutionLogEntry {
            start_time,
            end_time: 0.0,
            command,
            output: String::new(),
            exit_code: ExecutionLogEntry::RUNNING,
            tag,
        });
    }

    pub fn append_output(&mut self, output: &str) -> Result<()> {
        let entry = self
            .entries
            .last_mut()
            .ok_or(ConvoError::NoActiveExecution)?;
        entry.output.push_str(output);
        Ok(())
    }

    pub fn finish(&mut self, exit_code: i32, end_time: f64) -> Result<()> {
        let entry = self
            .entries
            .last_mut()
            .ok_or(ConvoError::NoActiveExecution)?;
        entry.exit_code = exit_code;
        entry.end_time = end_time;
        Ok(())
    }

    pub fn entries(&self) -> &[ExecutionLogEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&ExecutionLogEntry> {
        self.entries.last()
    }

    /// True while the most recent run has not reported an exit code.
    pub fn is_running(&self) -> bool {
        self.last().map(ExecutionLogEntry::is_running).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_append_to_last_entry() {
        let mut log = ExecutionLog::new();
        log.start(vec!["pip".into(), "install".into()], None, 10.0);
        log.finish(0, 11.0).unwrap();

        log.start(
            vec!["python".into(), "program-0.py".into()],
            Some("run".into()),
            12.0,
        );
        assert!(log.is_running());
        log.append_output("loading\n").unwrap();
        log.append_output("done\n").unwrap();
        log.finish(1, 15.0).unwrap();

        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[0].output, "");
        let last = log.last().unwrap();
        assert_eq!(last.output, "loading\ndone\n");
        assert_eq!(last.exit_code, 1);
        assert_eq!(last.end_time, 15.0);
        assert!(!log.is_running());
    }

    #[test]
    fn test_chunk_without_start_is_rejected() {
        let mut log = ExecutionLog::new();
        assert_eq!(log.append_output("x"), Err(ConvoError::NoActiveExecution));
        assert_eq!(log.finish(0, 1.0), Err(ConvoError::NoActiveExecution));
        assert!(log.is_empty());
    }
}
