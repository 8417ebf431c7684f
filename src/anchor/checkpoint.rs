//! Periodic checkpoints of the anchor chain
//!
//! A checkpoint commits to the chain tail. It is signed by the agent's
//! wallet (through the signing serializer) and handed to a
//! [`CheckpointSink`], which publishes it somewhere durable and independently
//! verifiable. Publishing itself lives outside this crate.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use super::AnchorChain;
use crate::config::AnchorConfig;
use crate::error::Result;
use crate::signing::{SigningSerializer, Wallet};

/// Protocol label used when signing checkpoints.
pub const CHECKPOINT_PROTOCOL: &str = "anchor checkpoint";

/// Commitment to the chain tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sequence_number: u64,
    pub entry_hash: String,
    pub entry_count: u64,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Bytes that get signed.
    pub fn signing_payload(&self) -> Vec<u8> {
        format!(
            "{}:{}:{}",
            self.sequence_number, self.entry_hash, self.entry_count
        )
        .into_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCheckpoint {
    pub checkpoint: Checkpoint,
    pub public_key: String,
    pub signature: String,
}

/// Destination for checkpoints.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn commit(&self, checkpoint: &SignedCheckpoint) -> Result<()>;
}

/// Keeps committed checkpoints in memory.
#[derive(Default)]
pub struct MemoryCheckpointSink {
    committed: Mutex<Vec<SignedCheckpoint>>,
}

impl MemoryCheckpointSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn committed(&self) -> Vec<SignedCheckpoint> {
        self.committed.lock().await.clone()
    }
}

#[async_trait]
impl CheckpointSink for MemoryCheckpointSink {
    async fn commit(&self, checkpoint: &SignedCheckpoint) -> Result<()> {
        self.committed.lock().await.push(checkpoint.clone());
        Ok(())
    }
}

/// Commits a checkpoint every `interval` appended entries.
pub struct Checkpointer {
    interval: u64,
    wallet: Arc<dyn Wallet>,
    sink: Arc<dyn CheckpointSink>,
    signing: SigningSerializer,
    /// Entry count covered by the last commit
    last_committed: Mutex<u64>,
}

impl Checkpointer {
    pub fn new(
        interval: u64,
        wallet: Arc<dyn Wallet>,
        sink: Arc<dyn CheckpointSink>,
        signing: SigningSerializer,
    ) -> Self {
        Self {
            interval: interval.max(1),
            wallet,
            sink,
            signing,
            last_committed: Mutex::new(0),
        }
    }

    /// Checkpointer using `anchor.checkpoint_interval` from the config.
    pub fn from_config(
        config: &AnchorConfig,
        wallet: Arc<dyn Wallet>,
        sink: Arc<dyn CheckpointSink>,
        signing: SigningSerializer,
    ) -> Self {
        Self::new(config.checkpoint_interval, wallet, sink, signing)
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Commit a checkpoint if at least `interval` entries arrived since the
    /// last one. Returns the committed checkpoint, if any.
    pub async fn maybe_checkpoint(&self, chain: &AnchorChain) -> Result<Option<SignedCheckpoint>> {
        let mut last_committed = self.last_committed.lock().await;
        let Some(tail) = chain.tail().await else {
            return Ok(None);
        };
        let entry_count = tail.sequence_number + 1;
        if entry_count < *last_committed + self.interval {
            return Ok(None);
        }

        let checkpoint = Checkpoint {
            sequence_number: tail.sequence_number,
            entry_hash: tail.entry_hash,
            entry_count,
            created_at: Utc::now(),
        };
        let payload = checkpoint.signing_payload();
        let (public_key, signature) = self
            .signing
            .run("checkpoint", async {
                let public_key = self.wallet.public_key().await?;
                let signature = self.wallet.sign(&payload, CHECKPOINT_PROTOCOL).await?;
                Ok::<_, crate::error::AgidError>((public_key, signature))
            })
            .await?;

        let signed = SignedCheckpoint {
            checkpoint,
            public_key,
            signature,
        };
        self.sink.commit(&signed).await?;
        *last_committed = entry_count;
        info!(
            sequence = signed.checkpoint.sequence_number,
            entry_count, "Anchor checkpoint committed"
        );
        Ok(Some(signed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::AnchorKind;
    use crate::signing::{verify_signature, LocalWallet};

    fn checkpointer(interval: u64, sink: Arc<MemoryCheckpointSink>) -> Checkpointer {
        let wallet = Arc::new(LocalWallet::from_seed([3u8; 32], 0).unwrap());
        Checkpointer::new(interval, wallet, sink, SigningSerializer::new())
    }

    #[tokio::test]
    async fn test_checkpoint_every_interval() {
        let chain = AnchorChain::new();
        let sink = Arc::new(MemoryCheckpointSink::new());
        let checkpointer = checkpointer(3, Arc::clone(&sink));

        assert!(checkpointer.maybe_checkpoint(&chain).await.unwrap().is_none());

        for i in 0..7u8 {
            chain.add_anchor(AnchorKind::ToolUse, "t", &[i]).await.unwrap();
            checkpointer.maybe_checkpoint(&chain).await.unwrap();
        }

        let committed = sink.committed().await;
        let counts: Vec<_> = committed.iter().map(|c| c.checkpoint.entry_count).collect();
        assert_eq!(counts, vec![3, 6]);
        let tail_hash = chain.entries().await[5].entry_hash.clone();
        assert_eq!(committed[1].checkpoint.entry_hash, tail_hash);
    }

    #[tokio::test]
    async fn test_from_config_uses_interval() {
        let wallet = Arc::new(LocalWallet::from_seed([3u8; 32], 0).unwrap());
        let sink = Arc::new(MemoryCheckpointSink::new());
        let config = AnchorConfig {
            checkpoint_interval: 2,
        };
        let checkpointer =
            Checkpointer::from_config(&config, wallet, sink.clone(), SigningSerializer::new());
        assert_eq!(checkpointer.interval(), 2);

        let chain = AnchorChain::new();
        chain.add_anchor(AnchorKind::ToolUse, "t", b"a").await.unwrap();
        assert!(checkpointer.maybe_checkpoint(&chain).await.unwrap().is_none());
        chain.add_anchor(AnchorKind::ToolUse, "t", b"b").await.unwrap();
        assert!(checkpointer.maybe_checkpoint(&chain).await.unwrap().is_some());
        assert_eq!(AnchorConfig::default().checkpoint_interval, 50);
    }

    #[tokio::test]
    async fn test_checkpoint_signature_verifies() {
        let chain = AnchorChain::new();
        chain.add_anchor(AnchorKind::MessageSent, "m", b"x").await.unwrap();
        let sink = Arc::new(MemoryCheckpointSink::new());
        let signed = checkpointer(1, sink)
            .maybe_checkpoint(&chain)
            .await
            .unwrap()
            .unwrap();

        assert!(verify_signature(
            &signed.public_key,
            &signed.checkpoint.signing_payload(),
            CHECKPOINT_PROTOCOL,
            &signed.signature,
        ));
    }
}
