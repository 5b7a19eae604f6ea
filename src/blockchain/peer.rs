use super::block::Block;
use super::transaction::Transaction;

/// The messages the ledger delivers to a registered node.
///
/// Kept message-shaped so a transport could sit between the ledger and a
/// node without the node's logic changing.
pub trait Peer: Send + Sync {
    /// Stable identifier used for registration and vote exclusion
    fn id(&self) -> &str;

    /// A transaction was broadcast to the network
    fn receive_transaction(&self, transaction: Transaction);

    /// Vote on a candidate block
    fn validate_block(&self, block: &Block) -> bool;
}
