//! Locally remembered agent sessions.
//!
//! Persists the active session id and every id the user has opened, so the
//! CLI can resume a session across runs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSessions {
    #[serde(default)]
    pub current: Option<String>,
    /// Every session id opened from this machine, oldest first
    #[serde(default)]
    pub saved: Vec<String>,
}

impl SavedSessions {
    /// Make `id` current, remembering it if new.
    pub fn select(&mut self, id: &str) {
        if !self.saved.iter().any(|s| s == id) {
            self.saved.push(id.to_string());
        }
        self.current = Some(id.to_string());
    }

    /// Forget `id`; clears `current` when it pointed there.
    pub fn remove(&mut self, id: &str) {
        self.saved.retain(|s| s != id);
        if self.current.as_deref() == Some(id) {
            self.current = None;
        }
    }
}

/// JSON file backing [`SavedSessions`].
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty store.
    pub fn load(&self) -> Result<SavedSessions> {
        if !self.path.exists() {
            return Ok(SavedSessions::default());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {:?}", self.path))?;
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {:?}", self.path))
    }

    pub fn save(&self, sessions: &SavedSessions) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(sessions)?;
        // Write-then-rename so a crash never leaves a truncated file
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("Failed to write {:?}", tmp))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {:?}", self.path))?;
        debug!(path = %self.path.display(), "saved session list");
        Ok(())
    }

    pub fn current(&self) -> Result<Option<String>> {
        Ok(self.load()?.current)
    }

    pub fn select(&self, id: &str) -> Result<SavedSessions> {
        let mut sessions = self.load()?;
        sessions.select(id);
        self.save(&sessions)?;
        Ok(sessions)
    }

    pub fn remove(&self, id: &str) -> Result<SavedSessions> {
        let mut sessions = self.load()?;
        sessions.remove(id);
        self.save(&sessions)?;
        Ok(sessions)
    }
}
