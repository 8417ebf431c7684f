//! In-process wallet backend
//!
//! Ed25519 identity key (ring), XChaCha20-Poly1305 encryption with keys
//! derived per `(protocol, key_id)` from the seed, and an in-memory satoshi
//! balance. Suitable for development and tests; production deployments plug
//! a remote signing backend in behind the same [`Wallet`] trait.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use sha2::{Digest, Sha256};
use tracing::info;

use super::Wallet;
use crate::error::{AgidError, Result};

const NONCE_LEN: usize = 24;

/// Wallet holding its key material in process memory.
pub struct LocalWallet {
    seed: [u8; 32],
    keypair: Ed25519KeyPair,
    balance: AtomicU64,
    rng: SystemRandom,
}

impl LocalWallet {
    /// Build a wallet from a 32-byte seed with a starting balance.
    pub fn from_seed(seed: [u8; 32], balance: u64) -> Result<Self> {
        let keypair = Ed25519KeyPair::from_seed_unchecked(&seed)
            .map_err(|e| AgidError::Signing(format!("Invalid seed: {}", e)))?;
        Ok(Self {
            seed,
            keypair,
            balance: AtomicU64::new(balance),
            rng: SystemRandom::new(),
        })
    }

    /// Build a wallet from a fresh random seed.
    pub fn generate(balance: u64) -> Result<Self> {
        let mut seed = [0u8; 32];
        SystemRandom::new()
            .fill(&mut seed)
            .map_err(|_| AgidError::Signing("System randomness unavailable".into()))?;
        Self::from_seed(seed, balance)
    }

    fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.public_key().as_ref())
    }

    fn cipher(&self, protocol: &str, key_id: &str) -> Result<XChaCha20Poly1305> {
        let mut hasher = Sha256::new();
        hasher.update(self.seed);
        hasher.update(protocol.as_bytes());
        hasher.update([0u8]);
        hasher.update(key_id.as_bytes());
        let key = hasher.finalize();
        XChaCha20Poly1305::new_from_slice(key.as_slice())
            .map_err(|e| AgidError::Signing(format!("Key derivation failed: {}", e)))
    }

    fn protocol_payload(payload: &[u8], protocol: &str) -> Vec<u8> {
        let mut message = Vec::with_capacity(protocol.len() + 1 + payload.len());
        message.extend_from_slice(protocol.as_bytes());
        message.push(0);
        message.extend_from_slice(payload);
        message
    }
}

/// Check a hex signature produced by [`LocalWallet`] against its public key.
pub fn verify_signature(
    public_key_hex: &str,
    payload: &[u8],
    protocol: &str,
    signature_hex: &str,
) -> bool {
    let (Ok(public_key), Ok(signature)) = (hex::decode(public_key_hex), hex::decode(signature_hex))
    else {
        return false;
    };
    UnparsedPublicKey::new(&ED25519, public_key)
        .verify(&LocalWallet::protocol_payload(payload, protocol), &signature)
        .is_ok()
}

#[async_trait]
impl Wallet for LocalWallet {
    async fn public_key(&self) -> Result<String> {
        Ok(self.public_key_hex())
    }

    async fn sign(&self, payload: &[u8], protocol: &str) -> Result<String> {
        let signature = self
            .keypair
            .sign(&Self::protocol_payload(payload, protocol));
        Ok(hex::encode(signature.as_ref()))
    }

    async fn encrypt(&self, plaintext: &str, protocol: &str, key_id: &str) -> Result<String> {
        let cipher = self.cipher(protocol, key_id)?;
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| AgidError::Signing("System randomness unavailable".into()))?;
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| AgidError::Signing("Encryption failed".into()))?;

        let mut framed = nonce.to_vec();
        framed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(framed))
    }

    async fn decrypt(&self, ciphertext: &str, protocol: &str, key_id: &str) -> Result<String> {
        let framed = STANDARD
            .decode(ciphertext)
            .map_err(|e| AgidError::Signing(format!("Invalid ciphertext encoding: {}", e)))?;
        if framed.len() <= NONCE_LEN {
            return Err(AgidError::Signing("Ciphertext too short".into()));
        }
        let (nonce, body) = framed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher(protocol, key_id)?
            .decrypt(XNonce::from_slice(nonce), body)
            .map_err(|_| AgidError::Signing("Decryption failed: wrong key or tampered data".into()))?;
        String::from_utf8(plaintext)
            .map_err(|_| AgidError::Signing("Decrypted data is not UTF-8".into()))
    }

    async fn balance(&self) -> Result<u64> {
        Ok(self.balance.load(Ordering::SeqCst))
    }

    async fn send_payment(&self, recipient: &str, satoshis: u64) -> Result<String> {
        if satoshis == 0 {
            return Err(AgidError::Signing("Payment amount must be positive".into()));
        }
        self.balance
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_sub(satoshis)
            })
            .map_err(|available| {
                AgidError::Signing(format!(
                    "Insufficient funds: {} sats requested, {} available",
                    satoshis, available
                ))
            })?;

        let mut hasher = Sha256::new();
        hasher.update(self.public_key_hex().as_bytes());
        hasher.update(recipient.as_bytes());
        hasher.update(satoshis.to_be_bytes());
        hasher.update(chrono::Utc::now().to_rfc3339().as_bytes());
        let txid = hex::encode(hasher.finalize());
        info!(recipient = %recipient, satoshis, txid = %txid, "Payment sent");
        Ok(txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet() -> LocalWallet {
        LocalWallet::from_seed([7u8; 32], 10_000).unwrap()
    }

    #[tokio::test]
    async fn test_sign_and_verify() {
        let wallet = wallet();
        let pk = wallet.public_key().await.unwrap();
        let sig = wallet.sign(b"hello", "agent message").await.unwrap();

        assert!(verify_signature(&pk, b"hello", "agent message", &sig));
        assert!(!verify_signature(&pk, b"hello!", "agent message", &sig));
        assert!(!verify_signature(&pk, b"hello", "other protocol", &sig));
        assert!(!verify_signature("zz", b"hello", "agent message", &sig));
    }

    #[tokio::test]
    async fn test_deterministic_identity() {
        let a = wallet().public_key().await.unwrap();
        let b = wallet().public_key().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_encrypt_roundtrip_and_key_separation() {
        let wallet = wallet();
        let ct = wallet
            .encrypt("My secret memory", "agent memory", "default")
            .await
            .unwrap();
        assert_eq!(
            wallet.decrypt(&ct, "agent memory", "default").await.unwrap(),
            "My secret memory"
        );
        assert!(wallet.decrypt(&ct, "agent memory", "other").await.is_err());
        assert!(wallet.decrypt("not base64!", "agent memory", "default").await.is_err());
    }

    #[tokio::test]
    async fn test_payment_debits_balance() {
        let wallet = wallet();
        let txid = wallet.send_payment("1BoatSLRHtKNngkdXEeobR76b53LETtpyT", 2_500).await.unwrap();
        assert_eq!(txid.len(), 64);
        assert_eq!(wallet.balance().await.unwrap(), 7_500);
    }

    #[tokio::test]
    async fn test_payment_insufficient_funds() {
        let wallet = wallet();
        let err = wallet.send_payment("addr", 20_000).await.unwrap_err();
        assert!(err.to_string().contains("Insufficient funds"));
        assert_eq!(wallet.balance().await.unwrap(), 10_000);
        assert!(wallet.send_payment("addr", 0).await.is_err());
    }
}
