//! Session module - Append-only conversation logs
//!
//! This module provides session storage for AGIdentity, including:
//! - Append-only per-session turn logs (one JSONL file per session)
//! - Canonical normalization of every persisted line on read
//! - Token-budget trimming of replayed history
//!
//! # Example
//!
//! ```
//! use agidentity::session::{SessionManager, Turn};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = SessionManager::new_memory();
//!
//!     manager.add_turn("telegram:chat123", Turn::user("Hello!")).await.unwrap();
//!     manager.add_turn("telegram:chat123", Turn::assistant("Hi there!")).await.unwrap();
//!
//!     let history = manager.get_messages("telegram:chat123").await.unwrap();
//!     assert_eq!(history.len(), 2);
//! }
//! ```

pub mod canonical;
pub mod types;

pub use canonical::{normalize, normalize_block, normalize_turn};
pub use types::{CanonicalContent, ContentBlock, Role, Session, Turn, FORMAT_VERSION};

use crate::config::{Config, DEFAULT_CHARS_PER_TOKEN, DEFAULT_TOKEN_BUDGET};
use crate::error::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Estimated token cost of one turn: characters divided by `chars_per_token`,
/// rounded up.
pub fn estimate_tokens(turn: &Turn, chars_per_token: usize) -> usize {
    turn.content.char_len().div_ceil(chars_per_token.max(1))
}

/// Trim history to fit `budget` estimated tokens.
///
/// The first turn is always kept. Turns are then dropped from the oldest end
/// of the remainder until the total fits or only two turns are left. The
/// newest turn is never dropped.
pub fn trim_to_budget(mut turns: Vec<Turn>, budget: usize, chars_per_token: usize) -> Vec<Turn> {
    let costs: Vec<usize> = turns
        .iter()
        .map(|t| estimate_tokens(t, chars_per_token))
        .collect();
    let mut total: usize = costs.iter().sum();
    if total <= budget {
        return turns;
    }

    let len = turns.len();
    let mut dropped = 0;
    while total > budget && len - dropped > 2 {
        total -= costs[1 + dropped];
        dropped += 1;
    }
    if dropped > 0 {
        debug!(dropped, remaining_tokens = total, "Trimmed session history");
        turns.drain(1..1 + dropped);
    }
    turns
}

/// Session manager for appending and replaying conversation turns.
///
/// Sessions are identified by unique keys (e.g., "telegram:chat123") and
/// only ever grow. Each session sits behind its own mutex, so appends to
/// one session never wait on another.
///
/// # Persistence
///
/// When created with `new()`, sessions are persisted to
/// `~/.agidentity/sessions/<key>.jsonl`, one canonical turn per line.
/// Use `new_memory()` for testing or when persistence is not needed.
pub struct SessionManager {
    /// In-memory cache of sessions
    sessions: Arc<RwLock<HashMap<String, Arc<Mutex<Session>>>>>,
    /// Optional directory for file-based persistence
    storage_path: Option<PathBuf>,
    /// Default replay budget in estimated tokens
    token_budget: usize,
    chars_per_token: usize,
}

impl SessionManager {
    /// Create a session manager persisting to `~/.agidentity/sessions/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the sessions directory cannot be created.
    pub fn new() -> Result<Self> {
        Self::with_path(Config::dir().join("sessions"))
    }

    /// Create an in-memory session manager without persistence.
    pub fn new_memory() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            storage_path: None,
            token_budget: DEFAULT_TOKEN_BUDGET,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }

    /// Create a session manager with a custom storage directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn with_path(path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path)?;
        Ok(Self {
            storage_path: Some(path),
            ..Self::new_memory()
        })
    }

    /// Override the replay budget.
    pub fn with_budget(mut self, token_budget: usize, chars_per_token: usize) -> Self {
        self.token_budget = token_budget;
        self.chars_per_token = chars_per_token.max(1);
        self
    }

    /// Apply the `session` section of a config.
    pub fn configured(self, config: &Config) -> Self {
        self.with_budget(config.session.token_budget, config.session.chars_per_token)
    }

    pub fn token_budget(&self) -> usize {
        self.token_budget
    }

    /// Append a turn to a session, creating the session on first use.
    ///
    /// Returns only after the line is flushed to disk (when persistent).
    /// Appends to the same session are applied in call order.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be loaded or the write fails.
    pub async fn add_turn(&self, key: &str, turn: Turn) -> Result<()> {
        let handle = self.handle(key).await?;
        let mut session = handle.lock().await;

        if let Some(ref storage_path) = self.storage_path {
            let mut line = serde_json::to_string(&turn)?;
            line.push('\n');
            let file_path = Self::file_path(storage_path, key);
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file_path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            file.sync_data().await?;
        }

        session.push(turn);
        Ok(())
    }

    /// Replay a session oldest-first, trimmed to the configured budget.
    ///
    /// A session that does not exist yields an empty list.
    pub async fn get_messages(&self, key: &str) -> Result<Vec<Turn>> {
        self.get_messages_with_budget(key, self.token_budget).await
    }

    /// Replay a session trimmed to an explicit budget.
    pub async fn get_messages_with_budget(&self, key: &str, budget: usize) -> Result<Vec<Turn>> {
        let turns = match self.get(key).await? {
            Some(session) => session.turns,
            None => return Ok(Vec::new()),
        };
        Ok(trim_to_budget(turns, budget, self.chars_per_token))
    }

    /// Get a snapshot of a session by key without creating it.
    ///
    /// # Errors
    ///
    /// Returns an error if loading from disk fails.
    pub async fn get(&self, key: &str) -> Result<Option<Session>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(key) {
                return Ok(Some(handle.lock().await.clone()));
            }
        }

        match self.load(key).await? {
            Some(session) => {
                let snapshot = session.clone();
                let mut sessions = self.sessions.write().await;
                sessions
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(session)));
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    /// Check if a session exists in memory or on disk.
    pub async fn exists(&self, key: &str) -> bool {
        {
            let sessions = self.sessions.read().await;
            if sessions.contains_key(key) {
                return true;
            }
        }

        if let Some(ref storage_path) = self.storage_path {
            return Self::file_path(storage_path, key).exists();
        }

        false
    }

    /// List all session keys from memory and disk, sorted.
    ///
    /// Keys read back from disk are in sanitized form.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();

        {
            let sessions = self.sessions.read().await;
            keys.extend(sessions.keys().cloned());
        }

        if let Some(ref storage_path) = self.storage_path {
            let mut dir_entries = tokio::fs::read_dir(storage_path).await?;
            while let Some(entry) = dir_entries.next_entry().await? {
                let path = entry.path();
                if path.extension().map(|e| e == "jsonl").unwrap_or(false) {
                    if let Some(stem) = path.file_stem() {
                        let key = stem.to_string_lossy().to_string();
                        if !keys.contains(&key) {
                            keys.push(key);
                        }
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    /// Clear all sessions from memory (does not affect disk).
    pub async fn clear_cache(&self) {
        let mut sessions = self.sessions.write().await;
        sessions.clear();
    }

    /// Get the number of sessions in memory.
    pub async fn cache_size(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }

    /// Get the cached handle for a session, loading or creating it.
    async fn handle(&self, key: &str) -> Result<Arc<Mutex<Session>>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(key) {
                return Ok(Arc::clone(handle));
            }
        }

        let loaded = self.load(key).await?;
        let mut sessions = self.sessions.write().await;
        let handle = sessions
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(loaded.unwrap_or_else(|| Session::new(key)))));
        Ok(Arc::clone(handle))
    }

    /// Read a session log from disk. Lines that are not JSON objects are skipped.
    async fn load(&self, key: &str) -> Result<Option<Session>> {
        let Some(ref storage_path) = self.storage_path else {
            return Ok(None);
        };
        let file_path = Self::file_path(storage_path, key);
        if !file_path.exists() {
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&file_path).await?;
        let mut session = Session::new(key);
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(line) {
                Ok(value) if value.is_object() => session.turns.push(normalize(&value)),
                Ok(_) => warn!(session = %key, line = line_no + 1, "Skipping non-object session line"),
                Err(e) => {
                    warn!(session = %key, line = line_no + 1, error = %e, "Skipping malformed session line")
                }
            }
        }

        if let Some(first) = session.turns.first() {
            session.created_at = first.timestamp;
        }
        if let Some(last) = session.turns.last() {
            session.last_activity_at = last.timestamp;
        }
        debug!(session = %key, turns = session.turns.len(), "Loaded session from disk");
        Ok(Some(session))
    }

    fn file_path(storage_path: &Path, key: &str) -> PathBuf {
        storage_path.join(format!("{}.jsonl", Self::sanitize_key(key)))
    }

    /// Sanitize a session key for use as a filename.
    ///
    /// Replaces characters that are invalid in filenames with underscores.
    fn sanitize_key(key: &str) -> String {
        key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_")
    }
}

impl Clone for SessionManager {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
            storage_path: self.storage_path.clone(),
            token_budget: self.token_budget,
            chars_per_token: self.chars_per_token,
        }
    }
}

impl Default for SessionManager {
    /// Creates an in-memory session manager.
    fn default() -> Self {
        Self::new_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn text_of_chars(n: usize) -> String {
        "x".repeat(n)
    }

    #[tokio::test]
    async fn test_add_and_get_messages() {
        let manager = SessionManager::new_memory();
        manager.add_turn("s", Turn::user("Hello")).await.unwrap();
        manager.add_turn("s", Turn::assistant("Hi")).await.unwrap();

        let turns = manager.get_messages("s").await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text(), "Hello");
        assert_eq!(turns[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_empty_session_returns_empty() {
        let manager = SessionManager::new_memory();
        let turns = manager.get_messages("nobody").await.unwrap();
        assert!(turns.is_empty());
        assert!(!manager.exists("nobody").await);
    }

    #[tokio::test]
    async fn test_session_get_nonexistent() {
        let manager = SessionManager::new_memory();
        let result = manager.get("nonexistent").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_last_added_turn_is_last() {
        let manager = SessionManager::new_memory().with_budget(50, 4);
        manager
            .add_turn("s", Turn::user(text_of_chars(400)))
            .await
            .unwrap();
        for i in 0..5 {
            manager
                .add_turn("s", Turn::assistant(format!("{} {}", i, text_of_chars(300))))
                .await
                .unwrap();
        }
        manager.add_turn("s", Turn::user("newest")).await.unwrap();

        let turns = manager.get_messages("s").await.unwrap();
        assert_eq!(turns.last().unwrap().text(), "newest");
        assert_eq!(turns[0].content.char_len(), 400);
    }

    #[test]
    fn test_trim_drops_middle_only() {
        // ~25 tokens, 9 x 10k-token middle turns, a 20k-token newest turn.
        let mut turns = vec![Turn::user(text_of_chars(100))];
        for i in 0..9 {
            turns.push(Turn::assistant(format!("{:0>40000}", i)));
        }
        turns.push(Turn::user(text_of_chars(80_000)));

        let trimmed = trim_to_budget(turns.clone(), 100_000, 4);
        assert_eq!(trimmed.len(), turns.len() - 2);
        assert_eq!(trimmed[0], turns[0]);
        assert_eq!(trimmed.last(), turns.last());
        assert_eq!(trimmed[1], turns[3]);

        let total: usize = trimmed.iter().map(|t| estimate_tokens(t, 4)).sum();
        assert!(total <= 100_000);
    }

    #[test]
    fn test_trim_keeps_first_and_newest_when_over_budget() {
        let turns = vec![
            Turn::user(text_of_chars(360_000)),
            Turn::assistant(text_of_chars(10)),
            Turn::user(text_of_chars(80_000)),
        ];
        let trimmed = trim_to_budget(turns.clone(), 100_000, 4);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[0], turns[0]);
        assert_eq!(trimmed[1], turns[2]);
    }

    #[test]
    fn test_trim_under_budget_unchanged() {
        let turns = vec![Turn::user("a"), Turn::assistant("b"), Turn::user("c")];
        assert_eq!(trim_to_budget(turns.clone(), 100, 4), turns);
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(&Turn::user("abcde"), 4), 2);
        assert_eq!(estimate_tokens(&Turn::user(""), 4), 0);
    }

    #[tokio::test]
    async fn test_session_list() {
        let manager = SessionManager::new_memory();
        manager.add_turn("session-a", Turn::user("1")).await.unwrap();
        manager.add_turn("session-b", Turn::user("2")).await.unwrap();
        manager.add_turn("session-c", Turn::user("3")).await.unwrap();

        let keys = manager.list().await.unwrap();
        assert_eq!(keys, vec!["session-a", "session-b", "session-c"]);
    }

    #[tokio::test]
    async fn test_session_manager_clone() {
        let manager1 = SessionManager::new_memory();
        let manager2 = manager1.clone();

        manager1.add_turn("shared", Turn::user("Test")).await.unwrap();

        let loaded = manager2.get("shared").await.unwrap();
        assert_eq!(loaded.unwrap().turns.len(), 1);
    }

    #[tokio::test]
    async fn test_session_clear_cache() {
        let manager = SessionManager::new_memory();
        manager.add_turn("session1", Turn::user("a")).await.unwrap();
        manager.add_turn("session2", Turn::user("b")).await.unwrap();

        assert_eq!(manager.cache_size().await, 2);

        manager.clear_cache().await;
        assert_eq!(manager.cache_size().await, 0);
    }

    #[tokio::test]
    async fn test_file_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let storage_path = temp_dir.path().to_path_buf();

        {
            let manager = SessionManager::with_path(storage_path.clone()).unwrap();
            manager
                .add_turn("persist-test", Turn::user("Persisted message"))
                .await
                .unwrap();
            manager
                .add_turn(
                    "persist-test",
                    Turn::assistant(vec![ContentBlock::tool_invocation(
                        "call_1",
                        "check_balance",
                        json!({}),
                    )]),
                )
                .await
                .unwrap();
        }

        let manager = SessionManager::with_path(storage_path.clone()).unwrap();
        let turns = manager.get_messages("persist-test").await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text(), "Persisted message");
        assert_eq!(turns[1].invocation_ids(), vec!["call_1"]);

        let raw = std::fs::read_to_string(storage_path.join("persist-test.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_malformed_lines_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let storage_path = temp_dir.path().to_path_buf();
        let lines = [
            r#"{"role":"user","content":"first"}"#,
            "{broken json",
            "[1,2]",
            "",
            r#"{"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":"ok"}]}"#,
        ];
        std::fs::write(storage_path.join("legacy.jsonl"), lines.join("\n")).unwrap();

        let manager = SessionManager::with_path(storage_path).unwrap();
        let turns = manager.get_messages("legacy").await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text(), "first");
        assert_eq!(turns[1].result_ids(), vec!["t1"]);
    }

    #[tokio::test]
    async fn test_append_after_reload_extends_file() {
        let temp_dir = TempDir::new().unwrap();
        let storage_path = temp_dir.path().to_path_buf();

        let manager = SessionManager::with_path(storage_path.clone()).unwrap();
        manager.add_turn("k", Turn::user("one")).await.unwrap();
        manager.clear_cache().await;
        manager.add_turn("k", Turn::user("two")).await.unwrap();

        let turns = manager.get_messages("k").await.unwrap();
        let texts: Vec<_> = turns.iter().map(Turn::text).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_file_persistence_list() {
        let temp_dir = TempDir::new().unwrap();
        let storage_path = temp_dir.path().to_path_buf();

        let manager = SessionManager::with_path(storage_path).unwrap();
        for name in ["alpha", "beta", "gamma"] {
            manager.add_turn(name, Turn::user(name)).await.unwrap();
        }

        manager.clear_cache().await;

        let keys = manager.list().await.unwrap();
        assert_eq!(keys, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(SessionManager::sanitize_key("simple"), "simple");
        assert_eq!(SessionManager::sanitize_key("telegram:chat123"), "telegram_chat123");
        assert_eq!(SessionManager::sanitize_key("path/to/session"), "path_to_session");
        assert_eq!(
            SessionManager::sanitize_key("a:b/c\\d*e?f\"g<h>i|j"),
            "a_b_c_d_e_f_g_h_i_j"
        );
    }

    #[tokio::test]
    async fn test_concurrent_appends_all_kept() {
        let manager = Arc::new(SessionManager::new_memory());
        let mut handles = Vec::new();

        for i in 0..10 {
            let manager_clone = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager_clone
                    .add_turn("concurrent", Turn::user(format!("Message {}", i)))
                    .await
                    .unwrap();
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        let session = manager.get("concurrent").await.unwrap().unwrap();
        assert_eq!(session.turns.len(), 10);
    }

    #[tokio::test]
    async fn test_session_default() {
        let manager = SessionManager::default();
        assert_eq!(manager.token_budget(), DEFAULT_TOKEN_BUDGET);
        assert!(manager.get_messages("test").await.unwrap().is_empty());
    }
}
