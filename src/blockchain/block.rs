use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::amount::Amount;
use super::crypto::Hash;
use super::transaction::Transaction;

/// Linkage and proof-of-work fields of a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Hash of the chain tip this block extends
    pub previous_block_hash: Hash,

    /// Timestamp when mining of this block started
    pub timestamp: DateTime<Utc>,

    /// Proof of work (nonce)
    pub nonce: u64,

    /// Number of leading zero hex characters the block hash must have
    pub difficulty_target: u32,
}

impl BlockHeader {
    /// Creates an unsealed header with a zero nonce
    pub fn new(previous_block_hash: Hash, difficulty_target: u32) -> Self {
        BlockHeader {
            previous_block_hash,
            timestamp: Utc::now(),
            nonce: 0,
            difficulty_target,
        }
    }

    /// Hashes the header at `nonce` together with the serialized
    /// transaction hashes produced by [`transactions_payload`].
    pub fn hash_with_nonce(&self, nonce: u64, transactions_payload: &str) -> Hash {
        let data = format!(
            "{}{}{}{}{}",
            self.previous_block_hash,
            self.timestamp.timestamp_millis(),
            nonce,
            self.difficulty_target,
            transactions_payload
        );
        Hash::digest(data.as_bytes())
    }
}

/// Canonical serialization of the transaction hashes committed to by a block
pub fn transactions_payload(transactions: &[Transaction]) -> Result<String, serde_json::Error> {
    let hashes: Vec<&str> = transactions.iter().map(|tx| tx.hash.as_str()).collect();
    serde_json::to_string(&hashes)
}

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,

    /// Ordered transactions; the first one is always the coinbase
    pub transactions: Vec<Transaction>,

    /// Hash over header and transactions
    pub hash: Hash,
}

impl Block {
    /// Seals a mined header, its transactions and the winning hash into a block
    pub fn seal(header: BlockHeader, transactions: Vec<Transaction>, hash: Hash) -> Self {
        Block {
            header,
            transactions,
            hash,
        }
    }

    /// Recomputes the hash from the header and transactions
    pub fn calculate_hash(&self) -> Result<Hash, serde_json::Error> {
        let payload = transactions_payload(&self.transactions)?;
        Ok(self.header.hash_with_nonce(self.header.nonce, &payload))
    }

    /// Whether the stored hash satisfies the header's difficulty target
    pub fn has_valid_proof(&self) -> bool {
        self.hash.meets_difficulty(self.header.difficulty_target)
    }

    /// The reward transaction at index 0, if the block has one
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    /// Sum of the fees of every transaction in the block
    pub fn total_fees(&self) -> Amount {
        self.transactions.iter().map(Transaction::fee).sum()
    }

    pub fn contains_transaction(&self, hash: &Hash) -> bool {
        self.transactions.iter().any(|tx| &tx.hash == hash)
    }

    pub fn size(&self) -> usize {
        self.transactions.iter().map(Transaction::size).sum()
    }
}
