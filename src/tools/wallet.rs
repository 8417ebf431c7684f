//! Identity and wallet tools
//!
//! Thin adapters from the LLM tool interface to the [`Wallet`]. Tools that
//! touch key material or move value declare `requires_exclusive_signing`;
//! the agent loop then runs them under the signing serializer. The tools
//! never take the serializer lock themselves.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::anchor::AnchorKind;
use crate::error::{AgidError, Result};
use crate::signing::Wallet;

use super::{Tool, ToolContext, ToolRegistry};

const DEFAULT_SIGN_PROTOCOL: &str = "agent message";
const DEFAULT_MEMORY_PROTOCOL: &str = "agent memory";
const DEFAULT_KEY_ID: &str = "default";

fn required_str<'a>(args: &'a Value, field: &str) -> Result<&'a str> {
    args.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| AgidError::Tool(format!("Missing '{}' argument", field)))
}

fn optional_str<'a>(args: &'a Value, field: &str, default: &'a str) -> &'a str {
    args.get(field).and_then(Value::as_str).unwrap_or(default)
}

/// Register every wallet tool against one wallet.
pub fn register_wallet_tools(registry: &mut ToolRegistry, wallet: Arc<dyn Wallet>) {
    registry.register(Box::new(GetIdentityTool::new(Arc::clone(&wallet))));
    registry.register(Box::new(CheckBalanceTool::new(Arc::clone(&wallet))));
    registry.register(Box::new(SignMessageTool::new(Arc::clone(&wallet))));
    registry.register(Box::new(EncryptDataTool::new(Arc::clone(&wallet))));
    registry.register(Box::new(DecryptDataTool::new(Arc::clone(&wallet))));
    registry.register(Box::new(SendPaymentTool::new(wallet)));
}

/// Returns the agent's public identity key.
pub struct GetIdentityTool {
    wallet: Arc<dyn Wallet>,
}

impl GetIdentityTool {
    pub fn new(wallet: Arc<dyn Wallet>) -> Self {
        Self { wallet }
    }
}

#[async_trait]
impl Tool for GetIdentityTool {
    fn name(&self) -> &str {
        "get_identity"
    }

    fn description(&self) -> &str {
        "Get the agent's cryptographic identity (public key)"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<String> {
        let public_key = self.wallet.public_key().await?;
        Ok(json!({ "publicKey": public_key }).to_string())
    }
}

/// Reports the wallet balance.
pub struct CheckBalanceTool {
    wallet: Arc<dyn Wallet>,
}

impl CheckBalanceTool {
    pub fn new(wallet: Arc<dyn Wallet>) -> Self {
        Self { wallet }
    }
}

#[async_trait]
impl Tool for CheckBalanceTool {
    fn name(&self) -> &str {
        "check_balance"
    }

    fn description(&self) -> &str {
        "Check the wallet balance in satoshis"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<String> {
        let balance = self.wallet.balance().await?;
        Ok(json!({ "balance": balance, "unit": "satoshis" }).to_string())
    }
}

/// Signs a message with the identity key.
pub struct SignMessageTool {
    wallet: Arc<dyn Wallet>,
}

impl SignMessageTool {
    pub fn new(wallet: Arc<dyn Wallet>) -> Self {
        Self { wallet }
    }
}

#[async_trait]
impl Tool for SignMessageTool {
    fn name(&self) -> &str {
        "sign_message"
    }

    fn description(&self) -> &str {
        "Sign a message with the agent's private key"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {"type": "string", "description": "The message to sign"},
                "protocol": {"type": "string", "description": "Protocol label (default: agent message)"}
            },
            "required": ["message"]
        })
    }

    fn requires_exclusive_signing(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String> {
        let message = required_str(&args, "message")?;
        let protocol = optional_str(&args, "protocol", DEFAULT_SIGN_PROTOCOL);
        let signature = self.wallet.sign(message.as_bytes(), protocol).await?;
        Ok(json!({ "signature": signature, "protocol": protocol }).to_string())
    }
}

/// Encrypts data for storage under a derived key.
pub struct EncryptDataTool {
    wallet: Arc<dyn Wallet>,
}

impl EncryptDataTool {
    pub fn new(wallet: Arc<dyn Wallet>) -> Self {
        Self { wallet }
    }
}

#[async_trait]
impl Tool for EncryptDataTool {
    fn name(&self) -> &str {
        "encrypt_data"
    }

    fn description(&self) -> &str {
        "Encrypt data for secure storage"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "data": {"type": "string", "description": "Plaintext to encrypt"},
                "protocol": {"type": "string", "description": "Protocol label (default: agent memory)"},
                "key_id": {"type": "string", "description": "Key identifier (default: default)"}
            },
            "required": ["data"]
        })
    }

    fn requires_exclusive_signing(&self) -> bool {
        true
    }

    fn anchor_kind(&self) -> AnchorKind {
        AnchorKind::MemoryWrite
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String> {
        let data = required_str(&args, "data")?;
        let protocol = optional_str(&args, "protocol", DEFAULT_MEMORY_PROTOCOL);
        let key_id = optional_str(&args, "key_id", DEFAULT_KEY_ID);
        let ciphertext = self.wallet.encrypt(data, protocol, key_id).await?;
        Ok(json!({ "ciphertext": ciphertext, "key_id": key_id }).to_string())
    }
}

/// Decrypts data previously produced by `encrypt_data`.
pub struct DecryptDataTool {
    wallet: Arc<dyn Wallet>,
}

impl DecryptDataTool {
    pub fn new(wallet: Arc<dyn Wallet>) -> Self {
        Self { wallet }
    }
}

#[async_trait]
impl Tool for DecryptDataTool {
    fn name(&self) -> &str {
        "decrypt_data"
    }

    fn description(&self) -> &str {
        "Decrypt previously encrypted data"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "ciphertext": {"type": "string", "description": "Ciphertext from encrypt_data"},
                "protocol": {"type": "string", "description": "Protocol label (default: agent memory)"},
                "key_id": {"type": "string", "description": "Key identifier (default: default)"}
            },
            "required": ["ciphertext"]
        })
    }

    fn requires_exclusive_signing(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String> {
        let ciphertext = required_str(&args, "ciphertext")?;
        let protocol = optional_str(&args, "protocol", DEFAULT_MEMORY_PROTOCOL);
        let key_id = optional_str(&args, "key_id", DEFAULT_KEY_ID);
        let plaintext = self.wallet.decrypt(ciphertext, protocol, key_id).await?;
        Ok(json!({ "plaintext": plaintext }).to_string())
    }
}

/// Sends satoshis to a recipient.
pub struct SendPaymentTool {
    wallet: Arc<dyn Wallet>,
}

impl SendPaymentTool {
    pub fn new(wallet: Arc<dyn Wallet>) -> Self {
        Self { wallet }
    }
}

#[async_trait]
impl Tool for SendPaymentTool {
    fn name(&self) -> &str {
        "send_payment"
    }

    fn description(&self) -> &str {
        "Send a payment in satoshis to a recipient address or identity key"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "recipient": {"type": "string", "description": "Recipient address or public key"},
                "satoshis": {"type": "integer", "description": "Amount to send"}
            },
            "required": ["recipient", "satoshis"]
        })
    }

    fn requires_exclusive_signing(&self) -> bool {
        true
    }

    fn anchor_kind(&self) -> AnchorKind {
        AnchorKind::Payment
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String> {
        let recipient = required_str(&args, "recipient")?;
        let satoshis = args
            .get("satoshis")
            .and_then(Value::as_u64)
            .ok_or_else(|| AgidError::Tool("Missing or invalid 'satoshis' argument".into()))?;
        let txid = self.wallet.send_payment(recipient, satoshis).await?;
        Ok(json!({ "txid": txid, "satoshis": satoshis, "recipient": recipient }).to_string())
    }
}
