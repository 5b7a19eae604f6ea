use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use thiserror::Error;
use tokio::sync::broadcast;

use super::block::{Block, BlockHeader};
use super::chain::{Ledger, LedgerError, VoteOutcome};
use super::crypto::{Address, Hash};
use super::peer::Peer;
use super::pow::{PowJob, PowWorker, WorkerError};
use super::transaction::{Transaction, TransactionError, TRANSACTION_SIZE};

/// Errors that can occur during a mining attempt
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Worker error: {0}")]
    WorkerError(#[from] WorkerError),

    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),
}

/// Why a node voted against a candidate block
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockRejection {
    #[error("a committed block already extends {0}")]
    SlotTaken(Hash),

    #[error("transaction {0} is already committed")]
    AlreadyCommitted(Hash),

    #[error("transaction {0} appears twice in the block")]
    DuplicateTransaction(Hash),

    #[error("hash has {leading} leading zeros, {required} required")]
    InsufficientWork { required: u32, leading: u32 },

    #[error("stored hash does not match block contents")]
    HashMismatch,

    #[error("block extends {got}, tip is {expected}")]
    NotOnTip { expected: Hash, got: Hash },

    #[error("bad coinbase: {0}")]
    BadCoinbase(String),

    #[error("invalid transaction {hash}: {reason}")]
    InvalidTransaction { hash: Hash, reason: String },
}

/// A mining and validating participant.
///
/// Each node keeps its own pending pool, builds candidate blocks from it,
/// searches for a nonce on a [`PowWorker`], and votes on other nodes' blocks.
#[derive(Debug)]
pub struct Node {
    id: String,
    payout_address: Address,
    cpu_power: f64,
    pending_pool: Mutex<Vec<Transaction>>,
    ledger: Arc<Ledger>,
}

impl Node {
    /// Creates a node and registers it with the ledger. Fails if a live node
    /// already uses `id`.
    pub fn join(
        ledger: Arc<Ledger>,
        id: impl Into<String>,
        payout_address: Address,
        cpu_power: f64,
    ) -> Result<Arc<Self>, NodeError> {
        let node = Arc::new(Node {
            id: id.into(),
            payout_address,
            cpu_power: cpu_power.max(f64::EPSILON),
            pending_pool: Mutex::new(Vec::new()),
            ledger,
        });

        node.ledger.register_node(&node)?;
        info!(
            "Node {} joined, paying out to {} (cpu power {:.1})",
            node.id, node.payout_address, node.cpu_power
        );
        Ok(node)
    }

    /// A random simulated CPU power in `1.0..1000.0`
    pub fn random_cpu_power() -> f64 {
        rand::thread_rng().gen_range(1.0..1000.0)
    }

    /// Unregisters this node from the ledger
    pub fn leave(&self) {
        self.ledger.remove_node(&self.id);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payout_address(&self) -> &Address {
        &self.payout_address
    }

    fn pool(&self) -> MutexGuard<'_, Vec<Transaction>> {
        self.pending_pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the pending pool in arrival order
    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.pool().clone()
    }

    /// Adds a transaction to the pending pool, ignoring repeats
    pub fn receive_transaction(&self, transaction: Transaction) {
        let mut pool = self.pool();
        if pool.iter().any(|tx| tx.hash == transaction.hash) {
            return;
        }
        debug!("Node {} received tx {}", self.id, transaction.hash);
        pool.push(transaction);
    }

    /// Checks a pooled transaction before it is offered in a block
    pub fn validate_transaction(&self, transaction: &Transaction) -> Result<(), TransactionError> {
        transaction.verify()
    }

    /// Builds the transaction list of the next candidate block.
    ///
    /// Already-committed and invalid transactions are purged from the pool.
    /// The rest are taken highest fee first (ties keep pool order) until the
    /// block's byte budget is used up, behind a coinbase paying this node.
    pub fn select_block_transactions(&self) -> Result<Vec<Transaction>, NodeError> {
        let committed = self.ledger.committed_transaction_hashes();
        let candidates = {
            let mut pool = self.pool();
            pool.retain(|tx| !committed.contains(&tx.hash));
            pool.retain(|tx| {
                if tx.is_coinbase() {
                    warn!("Node {} dropping pooled coinbase {}", self.id, tx.hash);
                    return false;
                }
                match self.validate_transaction(tx) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!("Node {} dropping invalid tx {}: {}", self.id, tx.hash, err);
                        false
                    }
                }
            });
            pool.clone()
        };

        let mut by_fee = candidates;
        by_fee.sort_by(|a, b| b.fee().cmp(&a.fee()));

        let budget = self
            .ledger
            .config()
            .block_size_limit
            .saturating_sub(TRANSACTION_SIZE);
        let mut used = 0;
        let mut selected = Vec::new();
        for tx in by_fee {
            if used + tx.size() > budget {
                continue;
            }
            used += tx.size();
            selected.push(tx);
        }

        let coinbase =
            Transaction::new_coinbase(self.payout_address.clone(), self.ledger.block_reward())?;

        let mut transactions = Vec::with_capacity(selected.len() + 1);
        transactions.push(coinbase);
        transactions.extend(selected);
        Ok(transactions)
    }

    /// Header for a candidate extending the current tip
    pub fn create_block_header(&self) -> BlockHeader {
        BlockHeader::new(self.ledger.tip_hash(), self.ledger.difficulty_target())
    }

    /// Runs one mining attempt: select, search for a nonce off this task,
    /// then put the block to a vote. Returns `None` if another block took the
    /// slot while the search ran.
    pub async fn mine_block(&self) -> Result<Option<VoteOutcome>, NodeError> {
        info!("Node {} is mining...", self.id);

        let mut header = self.create_block_header();
        let transactions = self.select_block_transactions()?;
        let difficulty_target = header.difficulty_target;

        let worker = PowWorker::spawn(PowJob {
            header: header.clone(),
            transactions: transactions.clone(),
            difficulty_target,
        });
        let solution = worker.result().await?;
        header.nonce = solution.nonce;

        if self.ledger.is_previous_hash_used(&header.previous_block_hash) {
            info!(
                "Node {} found nonce {} but the slot after {} is taken",
                self.id, solution.nonce, header.previous_block_hash
            );
            return Ok(None);
        }

        let block = Block::seal(header, transactions, solution.hash);
        Ok(Some(self.broadcast_block(block)?))
    }

    /// Hands a mined block to the ledger for voting
    pub fn broadcast_block(&self, block: Block) -> Result<VoteOutcome, NodeError> {
        info!(
            "Node {} broadcasting block {} with {} transactions",
            self.id,
            block.hash,
            block.transactions.len()
        );
        Ok(self.ledger.broadcast_block_for_validation(&self.id, block)?)
    }

    /// Runs every block rule against the committed chain, in order
    pub fn check_block(&self, block: &Block) -> Result<(), BlockRejection> {
        let previous = &block.header.previous_block_hash;
        if self.ledger.is_previous_hash_used(previous) {
            return Err(BlockRejection::SlotTaken(previous.clone()));
        }

        let committed = self.ledger.committed_transaction_hashes();
        let mut seen = HashSet::new();
        for tx in &block.transactions {
            if committed.contains(&tx.hash) {
                return Err(BlockRejection::AlreadyCommitted(tx.hash.clone()));
            }
            if !seen.insert(&tx.hash) {
                return Err(BlockRejection::DuplicateTransaction(tx.hash.clone()));
            }
        }

        let required = block
            .header
            .difficulty_target
            .max(self.ledger.difficulty_target());
        if !block.hash.meets_difficulty(required) {
            return Err(BlockRejection::InsufficientWork {
                required,
                leading: block.hash.leading_zeros(),
            });
        }

        match block.calculate_hash() {
            Ok(hash) if hash == block.hash => {}
            _ => return Err(BlockRejection::HashMismatch),
        }

        let tip = self.ledger.tip_hash();
        if previous != &tip {
            return Err(BlockRejection::NotOnTip {
                expected: tip,
                got: previous.clone(),
            });
        }

        self.check_coinbase(block)?;

        for tx in block.transactions.iter().skip(1) {
            self.validate_transaction(tx)
                .map_err(|err| BlockRejection::InvalidTransaction {
                    hash: tx.hash.clone(),
                    reason: err.to_string(),
                })?;
        }

        Ok(())
    }

    fn check_coinbase(&self, block: &Block) -> Result<(), BlockRejection> {
        let coinbase = block
            .coinbase()
            .ok_or_else(|| BlockRejection::BadCoinbase("first transaction is not a coinbase".to_string()))?;

        let reward = self.ledger.block_reward();
        if coinbase.input.amount != reward {
            return Err(BlockRejection::BadCoinbase(format!(
                "pays {}, reward is {}",
                coinbase.input.amount, reward
            )));
        }

        if let Err(err) = coinbase.verify() {
            return Err(BlockRejection::BadCoinbase(err.to_string()));
        }

        if block.transactions.iter().skip(1).any(Transaction::is_coinbase) {
            return Err(BlockRejection::BadCoinbase("more than one coinbase".to_string()));
        }

        Ok(())
    }

    /// Votes on a candidate block
    pub fn validate_block(&self, block: &Block) -> bool {
        match self.check_block(block) {
            Ok(()) => {
                debug!("Node {} accepts block {}", self.id, block.hash);
                true
            }
            Err(reason) => {
                debug!("Node {} rejects block {}: {}", self.id, block.hash, reason);
                false
            }
        }
    }

    /// Wait between attempts; slower machines wait longer
    pub fn mining_delay(&self, delay_scale: f64) -> Duration {
        Duration::from_secs_f64((60.0 / self.cpu_power * delay_scale).max(0.0))
    }

    /// Mines until `shutdown` fires: wait, attempt, reschedule. A failed
    /// attempt is logged and the next one starts on schedule.
    pub async fn run(self: Arc<Self>, delay_scale: f64, mut shutdown: broadcast::Receiver<()>) {
        let delay = self.mining_delay(delay_scale);
        schedule(&self.id, delay, &mut shutdown, || self.attempt()).await;
        info!("Node {} stopped mining", self.id);
    }

    async fn attempt(&self) -> Result<(), NodeError> {
        match self.mine_block().await? {
            Some(VoteOutcome::Committed { height, .. }) => {
                info!("Node {} mined block at height {}", self.id, height);
            }
            Some(VoteOutcome::Rejected { votes, eligible }) => {
                info!("Node {} had its block rejected ({}/{} votes)", self.id, votes, eligible);
            }
            None => {}
        }
        Ok(())
    }
}

/// Runs `attempt` after every `delay` until `shutdown` fires. Failures are
/// logged and never stop the loop.
async fn schedule<F, Fut, E>(
    id: &str,
    delay: Duration,
    shutdown: &mut broadcast::Receiver<()>,
    mut attempt: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: fmt::Display,
{
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        tokio::select! {
            _ = shutdown.recv() => break,
            result = attempt() => {
                if let Err(err) = result {
                    warn!("Node {} mining attempt failed: {}", id, err);
                }
            }
        }
    }
}

impl Peer for Node {
    fn id(&self) -> &str {
        &self.id
    }

    fn receive_transaction(&self, transaction: Transaction) {
        Node::receive_transaction(self, transaction)
    }

    fn validate_block(&self, block: &Block) -> bool {
        Node::validate_block(self, block)
    }
}
