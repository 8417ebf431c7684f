//! Signing module - Exclusive access to the signing resource
//!
//! The signing resource (an MPC wallet, HSM, or the in-process
//! [`LocalWallet`]) runs one ceremony at a time. Every call path that reaches
//! it goes through a [`SigningSerializer`]: exclusive-signing tools, response
//! signing, and checkpoint signing.
//!
//! The serializer is a plain FIFO mutex (`tokio::sync::Mutex` queues waiters
//! in arrival order). It is not a read/write lock.

mod local;

pub use local::{verify_signature, LocalWallet};

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

static GLOBAL_SERIALIZER: Lazy<SigningSerializer> = Lazy::new(SigningSerializer::new);

/// The shared signing resource.
///
/// Implementations do not need to be internally serialized; callers hold
/// the [`SigningSerializer`] lock around every call that touches key material.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Wallet: Send + Sync {
    /// Hex-encoded identity public key.
    async fn public_key(&self) -> Result<String>;

    /// Sign `payload` under a protocol label; returns a hex signature.
    async fn sign(&self, payload: &[u8], protocol: &str) -> Result<String>;

    async fn encrypt(&self, plaintext: &str, protocol: &str, key_id: &str) -> Result<String>;

    async fn decrypt(&self, ciphertext: &str, protocol: &str, key_id: &str) -> Result<String>;

    /// Spendable balance in satoshis.
    async fn balance(&self) -> Result<u64>;

    /// Transfer value; returns a transaction id.
    async fn send_payment(&self, recipient: &str, satoshis: u64) -> Result<String>;
}

/// FIFO mutual exclusion around the signing resource.
///
/// Clones share the same lock.
#[derive(Clone, Default)]
pub struct SigningSerializer {
    lock: Arc<Mutex<()>>,
    completed: Arc<AtomicU64>,
}

impl SigningSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide serializer. Every agent loop uses it unless given
    /// its own, so sessions on different loops still never overlap.
    pub fn global() -> Self {
        GLOBAL_SERIALIZER.clone()
    }

    /// Run `operation` while holding the lock.
    ///
    /// The lock is held exactly for the duration of `operation` and released
    /// when it returns, fails, or the returned future is dropped.
    pub async fn run<F, T>(&self, label: &str, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        let queued = Instant::now();
        let _guard = self.lock.lock().await;
        debug!(
            operation = %label,
            waited_ms = u64::try_from(queued.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Acquired signing lock"
        );
        let output = operation.await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        output
    }

    /// Whether some operation currently holds the lock.
    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Number of operations that ran to completion under this lock.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Whether two handles share one lock.
    pub fn same_lock(&self, other: &SigningSerializer) -> bool {
        Arc::ptr_eq(&self.lock, &other.lock)
    }
}
