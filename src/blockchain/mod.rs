// Blockchain module
//
// This module contains the ledger engine:
// - Amounts and balances
// - Hashes, addresses and signatures
// - Transactions and wallets
// - Blocks and the proof-of-work search
// - The shared ledger (chain, node registry, voting, economics)
// - Mining nodes

pub mod amount;
pub mod block;
pub mod chain;
pub mod crypto;
pub mod node;
pub mod peer;
pub mod pow;
pub mod transaction;
pub mod wallet;

// Re-export main components for easier access
pub use amount::{Amount, Balance};
pub use block::{Block, BlockHeader};
pub use chain::{Ledger, LedgerEvent, VoteOutcome};
pub use crypto::{Address, Hash};
pub use node::Node;
pub use transaction::Transaction;
pub use wallet::Wallet;
