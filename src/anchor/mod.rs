//! Anchor module - Hash-chained audit log
//!
//! Every auditable event (message received, tool invoked, value moved,
//! message sent) becomes one [`AnchorEntry`]. Entries link to their
//! predecessor by hash:
//!
//! ```text
//! entry_hash = SHA256(previous_entry_hash ‖ sequence_number ‖ kind ‖ data_hash ‖ timestamp)
//! ```
//!
//! The genesis entry links to [`GENESIS_HASH`]. Only the hash of each
//! event's data is kept, never the data itself.
//!
//! The chain has a single writer: [`AnchorChain::add_anchor`] holds a mutex
//! from reading the tail until the new entry is stored, and never awaits
//! inside that section, so a dropped caller cannot leave a partial entry.

pub mod checkpoint;

pub use checkpoint::{
    Checkpoint, CheckpointSink, Checkpointer, MemoryCheckpointSink, SignedCheckpoint,
};

use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{AgidError, Result};

/// `previous_entry_hash` of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Type of auditable event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorKind {
    ToolUse,
    Payment,
    MemoryWrite,
    MessageReceived,
    MessageSent,
}

impl AnchorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorKind::ToolUse => "tool_use",
            AnchorKind::Payment => "payment",
            AnchorKind::MemoryWrite => "memory_write",
            AnchorKind::MessageReceived => "message_received",
            AnchorKind::MessageSent => "message_sent",
        }
    }
}

impl fmt::Display for AnchorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record in the audit chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorEntry {
    pub sequence_number: u64,
    pub kind: AnchorKind,
    pub summary: String,
    pub data_hash: String,
    pub previous_entry_hash: String,
    pub entry_hash: String,
    pub timestamp: DateTime<Utc>,
}

impl AnchorEntry {
    /// Recompute this entry's hash from its fields.
    pub fn compute_hash(&self) -> String {
        compute_entry_hash(
            &self.previous_entry_hash,
            self.sequence_number,
            self.kind,
            &self.data_hash,
            &self.timestamp,
        )
    }
}

/// Hex SHA-256 of arbitrary event data.
pub fn hash_data(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn compute_entry_hash(
    previous_entry_hash: &str,
    sequence_number: u64,
    kind: AnchorKind,
    data_hash: &str,
    timestamp: &DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous_entry_hash.as_bytes());
    hasher.update(sequence_number.to_be_bytes());
    hasher.update(kind.as_str().as_bytes());
    hasher.update(data_hash.as_bytes());
    hasher.update(
        timestamp
            .to_rfc3339_opts(SecondsFormat::Nanos, true)
            .as_bytes(),
    );
    hex::encode(hasher.finalize())
}

/// Current end of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTail {
    pub sequence_number: u64,
    pub entry_hash: String,
}

/// Result of verifying a sequence of entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    pub valid: bool,
    /// Entries verified before stopping
    pub checked: usize,
    /// Sequence number of the first bad entry
    pub failed_at: Option<u64>,
    pub reason: Option<String>,
}

impl ChainVerification {
    fn ok(checked: usize) -> Self {
        Self {
            valid: true,
            checked,
            failed_at: None,
            reason: None,
        }
    }

    fn failed(checked: usize, sequence_number: u64, reason: String) -> Self {
        Self {
            valid: false,
            checked,
            failed_at: Some(sequence_number),
            reason: Some(reason),
        }
    }
}

/// Verify hash linkage, sequence continuity and every entry hash.
///
/// Stops at the first mismatch and reports its sequence number. The slice
/// may start mid-chain (e.g. from `entries_since`); the first entry's link
/// is then trusted.
pub fn verify_chain(entries: &[AnchorEntry]) -> ChainVerification {
    for (i, entry) in entries.iter().enumerate() {
        if i == 0 {
            if entry.sequence_number == 0 && entry.previous_entry_hash != GENESIS_HASH {
                return ChainVerification::failed(
                    i,
                    entry.sequence_number,
                    "genesis entry does not link to the zero hash".into(),
                );
            }
        } else {
            let prev = &entries[i - 1];
            if entry.sequence_number != prev.sequence_number + 1 {
                return ChainVerification::failed(
                    i,
                    entry.sequence_number,
                    format!(
                        "sequence gap: expected {}, found {}",
                        prev.sequence_number + 1,
                        entry.sequence_number
                    ),
                );
            }
            if entry.previous_entry_hash != prev.entry_hash {
                return ChainVerification::failed(
                    i,
                    entry.sequence_number,
                    "previous_entry_hash does not match predecessor".into(),
                );
            }
        }

        if entry.compute_hash() != entry.entry_hash {
            return ChainVerification::failed(
                i,
                entry.sequence_number,
                "entry_hash does not match recomputed hash".into(),
            );
        }
    }
    ChainVerification::ok(entries.len())
}

/// Append-only, hash-linked audit log shared by all sessions of one identity.
pub struct AnchorChain {
    entries: Mutex<Vec<AnchorEntry>>,
    storage_path: Option<PathBuf>,
}

impl AnchorChain {
    /// In-memory chain.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            storage_path: None,
        }
    }

    /// Open (or create) a chain persisted as JSONL at `path`.
    ///
    /// # Errors
    ///
    /// Any unreadable or malformed line is a hard error: audit entries are
    /// never skipped.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries = Vec::new();
        if path.exists() {
            let file = std::fs::File::open(&path)?;
            for (line_no, line) in BufReader::new(file).lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: AnchorEntry = serde_json::from_str(&line).map_err(|e| {
                    AgidError::Anchor(format!(
                        "{} line {}: {}",
                        path.display(),
                        line_no + 1,
                        e
                    ))
                })?;
                entries.push(entry);
            }
        }
        debug!(path = %path.display(), entries = entries.len(), "Opened anchor chain");

        Ok(Self {
            entries: Mutex::new(entries),
            storage_path: Some(path),
        })
    }

    /// Append an event. Returns the stored entry.
    pub async fn add_anchor(
        &self,
        kind: AnchorKind,
        summary: impl Into<String>,
        data: &[u8],
    ) -> Result<AnchorEntry> {
        let data_hash = hash_data(data);
        let summary = summary.into();

        let mut entries = self.entries.lock().await;
        let (sequence_number, previous_entry_hash) = match entries.last() {
            Some(last) => (last.sequence_number + 1, last.entry_hash.clone()),
            None => (0, GENESIS_HASH.to_string()),
        };
        let timestamp = Utc::now();
        let entry_hash = compute_entry_hash(
            &previous_entry_hash,
            sequence_number,
            kind,
            &data_hash,
            &timestamp,
        );
        let entry = AnchorEntry {
            sequence_number,
            kind,
            summary,
            data_hash,
            previous_entry_hash,
            entry_hash,
            timestamp,
        };

        // Written synchronously: no await may sit between the disk write
        // and the push below, or a dropped caller would leave the file one
        // entry ahead of memory and the next append would fork the chain.
        if let Some(ref path) = self.storage_path {
            Self::persist(path, &entry)?;
        }
        entries.push(entry.clone());
        debug!(sequence = sequence_number, kind = %kind, "Anchor appended");
        Ok(entry)
    }

    fn persist(path: &Path, entry: &AnchorEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| AgidError::Anchor(format!("{}: {}", path.display(), e)))?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Verify the whole in-memory chain.
    pub async fn verify(&self) -> ChainVerification {
        let entries = self.entries.lock().await;
        let result = verify_chain(&entries);
        if let Some(seq) = result.failed_at {
            warn!(sequence = seq, reason = ?result.reason, "Anchor chain verification failed");
        }
        result
    }

    /// Last entry's sequence number and hash, or `None` for an empty chain.
    pub async fn tail(&self) -> Option<ChainTail> {
        let entries = self.entries.lock().await;
        entries.last().map(|e| ChainTail {
            sequence_number: e.sequence_number,
            entry_hash: e.entry_hash.clone(),
        })
    }

    /// Entries with `sequence_number > seq`, oldest first.
    pub async fn entries_since(&self, seq: Option<u64>) -> Vec<AnchorEntry> {
        let entries = self.entries.lock().await;
        let start = match seq {
            None => 0,
            Some(seq) => entries.partition_point(|e| e.sequence_number <= seq),
        };
        entries[start..].to_vec()
    }

    /// Snapshot of every entry.
    pub async fn entries(&self) -> Vec<AnchorEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl Default for AnchorChain {
    fn default() -> Self {
        Self::new()
    }
}
