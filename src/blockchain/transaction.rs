use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::amount::Amount;
use super::crypto::{verify_signature, Address, CryptoError, DigitalSignature, Hash, KeyPair};

/// Size every transaction is accounted at when filling a block
pub const TRANSACTION_SIZE: usize = 250_000;

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Transaction not signed")]
    NotSigned,

    #[error("Hash mismatch: expected {expected}, got {got}")]
    HashMismatch { expected: Hash, got: Hash },

    #[error("Coinbase transaction must not carry a fee")]
    CoinbaseWithFee,

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// The transfer a transaction describes, before it is signed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    /// Unique id, so identical transfers or rewards never share a hash
    pub id: Uuid,

    /// Sender's address; `None` marks a newly minted reward
    pub from_address: Option<Address>,

    /// Recipient's address
    pub to_address: Address,

    /// Amount being transferred
    pub amount: Amount,

    /// Transaction fee paid to the miner of the including block
    pub fee: Amount,

    /// Timestamp when the transaction was created
    pub timestamp: DateTime<Utc>,
}

impl TransactionInput {
    /// A transfer from `from` to `to`, stamped with the current time
    pub fn transfer(from: Address, to: Address, amount: Amount, fee: Amount) -> Self {
        TransactionInput {
            id: Uuid::new_v4(),
            from_address: Some(from),
            to_address: to,
            amount,
            fee,
            timestamp: Utc::now(),
        }
    }

    /// A reward paying `amount` to `to` with no sender and no fee
    pub fn coinbase(to: Address, amount: Amount) -> Self {
        TransactionInput {
            id: Uuid::new_v4(),
            from_address: None,
            to_address: to,
            amount,
            fee: Amount::ZERO,
            timestamp: Utc::now(),
        }
    }

    /// Canonical bytes that are signed and hashed
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransactionError> {
        let data = serde_json::json!({
            "id": self.id.to_string(),
            "from_address": self.from_address.as_ref().map(|a| a.0.as_str()),
            "to_address": self.to_address.0,
            "amount": self.amount.units(),
            "fee": self.fee.units(),
            "timestamp": self.timestamp.timestamp_millis(),
        });

        Ok(serde_json::to_vec(&data)?)
    }
}

/// Represents a transaction in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub input: TransactionInput,

    /// Signature over the input; absent on node-minted coinbase rewards
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<DigitalSignature>,

    /// Digest of input and signature
    pub hash: Hash,
}

impl Transaction {
    /// Assembles a transaction and computes its hash
    pub fn new(
        input: TransactionInput,
        signature: Option<DigitalSignature>,
    ) -> Result<Self, TransactionError> {
        let hash = Self::calculate_hash(&input, signature.as_ref())?;
        Ok(Transaction {
            input,
            signature,
            hash,
        })
    }

    /// Signs `input` with `keys` and assembles the transaction
    pub fn signed(input: TransactionInput, keys: &KeyPair) -> Result<Self, TransactionError> {
        let signature = keys.sign(&input.to_bytes()?)?;
        Self::new(input, Some(signature))
    }

    /// Creates an unsigned coinbase transaction (mining reward)
    pub fn new_coinbase(recipient: Address, amount: Amount) -> Result<Self, TransactionError> {
        Self::new(TransactionInput::coinbase(recipient, amount), None)
    }

    /// SHA-256 over the canonical input followed by the signature
    pub fn calculate_hash(
        input: &TransactionInput,
        signature: Option<&DigitalSignature>,
    ) -> Result<Hash, TransactionError> {
        let mut data = input.to_bytes()?;
        data.push(b'-');
        if let Some(signature) = signature {
            data.extend_from_slice(signature.0.as_bytes());
        }
        Ok(Hash::digest(&data))
    }

    /// Checks if the transaction is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.input.from_address.is_none()
    }

    /// Gets the total amount debited from the sender (amount + fee)
    pub fn total_amount(&self) -> Amount {
        self.input.amount + self.input.fee
    }

    pub fn fee(&self) -> Amount {
        self.input.fee
    }

    pub fn size(&self) -> usize {
        TRANSACTION_SIZE
    }

    /// Verifies the signature against the sender's address
    pub fn verify_signature(&self) -> Result<bool, TransactionError> {
        let signature = self.signature.as_ref().ok_or(TransactionError::NotSigned)?;

        // Coinbase rewards may be signed by whoever minted them; nothing to check against
        let Some(sender) = &self.input.from_address else {
            return Ok(true);
        };

        let public_key = sender.to_public_key()?;
        let message = self.input.to_bytes()?;
        Ok(verify_signature(&message, signature, &public_key)?)
    }

    /// Full structural check: hash integrity, coinbase shape, and sender signature
    pub fn verify(&self) -> Result<(), TransactionError> {
        let expected = Self::calculate_hash(&self.input, self.signature.as_ref())?;
        if expected != self.hash {
            return Err(TransactionError::HashMismatch {
                expected,
                got: self.hash.clone(),
            });
        }

        if self.is_coinbase() {
            if !self.input.fee.is_zero() {
                return Err(TransactionError::CoinbaseWithFee);
            }
            return Ok(());
        }

        if self.verify_signature()? {
            Ok(())
        } else {
            Err(TransactionError::InvalidSignature)
        }
    }
}
