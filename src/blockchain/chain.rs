use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::{LedgerConfig, QuorumPolicy};

use super::amount::{Amount, Balance};
use super::block::Block;
use super::crypto::{Address, Hash};
use super::peer::Peer;
use super::transaction::Transaction;

/// Errors that can occur during ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Block {hash} does not extend the tip: expected {expected}, got {got}")]
    NotOnTip { hash: Hash, expected: Hash, got: Hash },

    #[error("A live node is already registered as {0}")]
    DuplicateNode(String),
}

/// Observable outcomes of ledger activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    NodeRegistered { id: String },
    NodeRemoved { id: String },
    BlockCommitted {
        height: u64,
        hash: Hash,
        miner: Option<Address>,
        votes: usize,
        eligible: usize,
    },
    BlockRejected {
        hash: Hash,
        proposer: String,
        votes: usize,
        eligible: usize,
    },
    RewardHalved { height: u64, reward: Amount },
    RewardExhausted { height: u64, total_supply: Amount },
    DifficultyRetargeted { height: u64, from: u32, to: u32 },
}

/// Result of putting a candidate block to a vote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Committed { height: u64, votes: usize, eligible: usize },
    Rejected { votes: usize, eligible: usize },
}

impl VoteOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, VoteOutcome::Committed { .. })
    }
}

/// Strict majority: `votes` must be more than half of `eligible`
pub fn has_majority(votes: usize, eligible: usize) -> bool {
    votes * 2 > eligible
}

/// Mutable chain state guarded by one lock
#[derive(Debug)]
struct ChainState {
    chain: Vec<Block>,
    difficulty_target: u32,
    block_reward: Amount,
}

/// The shared ledger every node and wallet holds a handle to.
///
/// Chain mutation goes through a single commit lock so that voting on a
/// candidate and appending it happen as one step. Nodes are held weakly; the
/// ledger never keeps a node alive.
pub struct Ledger {
    config: LedgerConfig,
    state: RwLock<ChainState>,
    nodes: DashMap<String, Weak<dyn Peer>>,
    commit_lock: Mutex<()>,
    events: broadcast::Sender<LedgerEvent>,
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read_state();
        f.debug_struct("Ledger")
            .field("height", &state.chain.len())
            .field("difficulty_target", &state.difficulty_target)
            .field("block_reward", &state.block_reward)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl Ledger {
    /// Creates an empty ledger. The first block links to [`Hash::zero`].
    pub fn new(config: LedgerConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let state = ChainState {
            chain: Vec::new(),
            difficulty_target: config.initial_difficulty,
            block_reward: capped_reward(Amount::ZERO, config.initial_block_reward, config.total_supply),
        };

        Arc::new(Ledger {
            config,
            state: RwLock::new(state),
            nodes: DashMap::new(),
            commit_lock: Mutex::new(()),
            events,
        })
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ChainState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ChainState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: LedgerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Subscribes to ledger events
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    /// Adds a node to the broadcast list. Ids are unique among live nodes; a
    /// dropped node's id may be taken over.
    pub fn register_node<P: Peer + 'static>(&self, node: &Arc<P>) -> Result<(), LedgerError> {
        let weak: Weak<dyn Peer> = Arc::downgrade(node) as Weak<dyn Peer>;
        let id = node.id().to_string();
        match self.nodes.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().upgrade().is_some() {
                    return Err(LedgerError::DuplicateNode(id));
                }
                entry.insert(weak);
            }
            Entry::Vacant(entry) => {
                entry.insert(weak);
            }
        }
        info!("Node {} registered ({} nodes)", id, self.node_count());
        self.emit(LedgerEvent::NodeRegistered { id });
        Ok(())
    }

    /// Removes a node from the broadcast list
    pub fn remove_node(&self, id: &str) {
        if self.nodes.remove(id).is_some() {
            info!("Node {} removed", id);
            self.emit(LedgerEvent::NodeRemoved { id: id.to_string() });
        }
    }

    /// Live registered nodes. Entries whose node has been dropped are pruned.
    fn live_nodes(&self) -> Vec<Arc<dyn Peer>> {
        let mut live = Vec::new();
        let mut dead = Vec::new();

        for entry in self.nodes.iter() {
            match entry.value().upgrade() {
                Some(node) => live.push(node),
                None => dead.push(entry.key().clone()),
            }
        }

        for id in dead {
            debug!("Pruning dropped node {}", id);
            self.nodes.remove_if(&id, |_, node| node.upgrade().is_none());
        }

        live
    }

    pub fn node_count(&self) -> usize {
        self.live_nodes().len()
    }

    /// Delivers a transaction to every registered node's pool
    pub fn broadcast_transaction(&self, transaction: &Transaction) {
        let nodes = self.live_nodes();
        debug!("Broadcasting tx {} to {} nodes", transaction.hash, nodes.len());
        for node in nodes {
            node.receive_transaction(transaction.clone());
        }
    }

    /// Asks every other node to validate `block` and commits it on a strict
    /// majority. Rejected candidates are dropped.
    pub fn broadcast_block_for_validation(
        &self,
        proposer: &str,
        block: Block,
    ) -> Result<VoteOutcome, LedgerError> {
        let _commit = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let nodes = self.live_nodes();
        let voters: Vec<&Arc<dyn Peer>> = nodes.iter().filter(|n| n.id() != proposer).collect();
        let votes = voters.iter().filter(|n| n.validate_block(&block)).count();
        let eligible = match self.config.quorum {
            QuorumPolicy::ExcludeProposer => voters.len(),
            QuorumPolicy::AllNodes => nodes.len(),
        };

        if !has_majority(votes, eligible) {
            info!(
                "Block {} from {} rejected ({}/{} votes)",
                block.hash, proposer, votes, eligible
            );
            self.emit(LedgerEvent::BlockRejected {
                hash: block.hash.clone(),
                proposer: proposer.to_string(),
                votes,
                eligible,
            });
            return Ok(VoteOutcome::Rejected { votes, eligible });
        }

        let hash = block.hash.clone();
        let miner = block.coinbase().map(|tx| tx.input.to_address.clone());
        let height = self.append_block(block)?;

        info!(
            "Block {} from {} committed at height {} ({}/{} votes)",
            hash, proposer, height, votes, eligible
        );
        self.emit(LedgerEvent::BlockCommitted {
            height,
            hash,
            miner,
            votes,
            eligible,
        });

        Ok(VoteOutcome::Committed {
            height,
            votes,
            eligible,
        })
    }

    /// Appends a block to the chain and applies the reward and difficulty
    /// schedules. Returns the new height.
    fn append_block(&self, block: Block) -> Result<u64, LedgerError> {
        let mut state = self.write_state();

        let tip = state.chain.last().map(|b| b.hash.clone()).unwrap_or_else(Hash::zero);
        if block.header.previous_block_hash != tip {
            return Err(LedgerError::NotOnTip {
                hash: block.hash,
                expected: tip,
                got: block.header.previous_block_hash,
            });
        }

        state.chain.push(block);
        let height = state.chain.len() as u64;

        self.apply_halving(&mut state, height);
        self.apply_retarget(&mut state, height);

        Ok(height)
    }

    fn apply_halving(&self, state: &mut ChainState, height: u64) {
        if self.config.halving_interval > 0 && height % self.config.halving_interval == 0 {
            state.block_reward = state.block_reward.halved();
            info!("Block reward halved to {} at height {}", state.block_reward, height);
            self.emit(LedgerEvent::RewardHalved {
                height,
                reward: state.block_reward,
            });
        }

        let supply = current_supply(&state.chain);
        let reward = capped_reward(supply, state.block_reward, self.config.total_supply);
        if reward != state.block_reward {
            warn!(
                "Next reward {} would exceed total supply {}; reward is now zero",
                state.block_reward, self.config.total_supply
            );
            state.block_reward = reward;
            self.emit(LedgerEvent::RewardExhausted {
                height,
                total_supply: self.config.total_supply,
            });
        }
    }

    fn apply_retarget(&self, state: &mut ChainState, height: u64) {
        let interval = self.config.difficulty_retarget_interval;
        if interval == 0 || height % interval != 0 {
            return;
        }

        // Measured from the last block before the window, so the span covers
        // `interval` block times. The first window has no such block.
        let start = state.chain.len().saturating_sub(interval as usize + 1);
        let span = &state.chain[start..];
        let gaps = span.len().saturating_sub(1) as i64;
        let (Some(first), Some(last)) = (span.first(), span.last()) else {
            return;
        };
        if gaps == 0 {
            return;
        }

        let elapsed_ms = (last.header.timestamp - first.header.timestamp).num_milliseconds();
        let average_ms = elapsed_ms / gaps;
        let target_ms = self.config.target_block_time_ms as i64;

        let previous = state.difficulty_target;
        state.difficulty_target = if average_ms < target_ms {
            previous.saturating_add(1)
        } else if average_ms > target_ms {
            previous.saturating_sub(1)
        } else {
            previous
        };

        info!(
            "Difficulty retarget at height {}: average block time {} ms (target {} ms), difficulty {} -> {}",
            height, average_ms, target_ms, previous, state.difficulty_target
        );
        if previous != state.difficulty_target {
            self.emit(LedgerEvent::DifficultyRetargeted {
                height,
                from: previous,
                to: state.difficulty_target,
            });
        }
    }

    pub fn height(&self) -> u64 {
        self.read_state().chain.len() as u64
    }

    /// Hash of the last committed block, or the zero hash for an empty chain
    pub fn tip_hash(&self) -> Hash {
        self.read_state()
            .chain
            .last()
            .map(|b| b.hash.clone())
            .unwrap_or_else(Hash::zero)
    }

    pub fn last_block(&self) -> Option<Block> {
        self.read_state().chain.last().cloned()
    }

    /// Snapshot of the whole chain
    pub fn chain(&self) -> Vec<Block> {
        self.read_state().chain.clone()
    }

    pub fn difficulty_target(&self) -> u32 {
        self.read_state().difficulty_target
    }

    pub fn block_reward(&self) -> Amount {
        self.read_state().block_reward
    }

    /// Whether some committed block already extends `previous_hash`
    pub fn is_previous_hash_used(&self, previous_hash: &Hash) -> bool {
        self.read_state()
            .chain
            .iter()
            .any(|b| &b.header.previous_block_hash == previous_hash)
    }

    pub fn is_transaction_committed(&self, hash: &Hash) -> bool {
        self.read_state()
            .chain
            .iter()
            .any(|b| b.contains_transaction(hash))
    }

    /// Hashes of every committed transaction
    pub fn committed_transaction_hashes(&self) -> HashSet<Hash> {
        self.read_state()
            .chain
            .iter()
            .flat_map(|b| b.transactions.iter().map(|tx| tx.hash.clone()))
            .collect()
    }

    /// Total minted so far: the coinbase amount of every committed block
    pub fn get_current_supply(&self) -> Amount {
        current_supply(&self.read_state().chain)
    }

    /// Balance of `address` over the committed chain. Senders pay amount and
    /// fee, recipients receive the amount, and each block's coinbase payee
    /// also collects that block's fees.
    pub fn get_balance(&self, address: &Address) -> Balance {
        let state = self.read_state();
        let mut balance = Balance::ZERO;

        for block in &state.chain {
            for tx in &block.transactions {
                if tx.input.from_address.as_ref() == Some(address) {
                    balance.debit(tx.total_amount());
                }
                if &tx.input.to_address == address {
                    balance.credit(tx.input.amount);
                }
            }

            if block.coinbase().map(|cb| &cb.input.to_address) == Some(address) {
                balance.credit(block.total_fees());
            }
        }

        balance
    }

    /// Walks the chain checking links, digests and proof of work
    pub fn is_valid(&self) -> bool {
        let state = self.read_state();
        let mut previous = Hash::zero();

        for block in &state.chain {
            if block.header.previous_block_hash != previous {
                return false;
            }
            match block.calculate_hash() {
                Ok(hash) if hash == block.hash => {}
                _ => return false,
            }
            if !block.has_valid_proof() {
                return false;
            }
            previous = block.hash.clone();
        }

        true
    }
}

/// `reward`, or zero once paying it would take `supply` past `total_supply`
fn capped_reward(supply: Amount, reward: Amount, total_supply: Amount) -> Amount {
    match supply.checked_add(reward) {
        Some(next) if next <= total_supply => reward,
        _ => Amount::ZERO,
    }
}

fn current_supply(chain: &[Block]) -> Amount {
    chain
        .iter()
        .filter_map(|b| b.coinbase())
        .map(|cb| cb.input.amount)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::BlockHeader;
    use crate::blockchain::crypto::KeyPair;
    use crate::blockchain::pow::proof_of_work;
    use crate::blockchain::transaction::TransactionInput;
    use chrono::{DateTime, Duration, Utc};
    use std::sync::atomic::AtomicBool;

    /// Mines a block on the current tip paying the current reward to `miner`
    fn mine_on_tip(
        ledger: &Ledger,
        miner: &Address,
        extra: Vec<Transaction>,
        timestamp: DateTime<Utc>,
    ) -> Block {
        let mut header = BlockHeader::new(ledger.tip_hash(), ledger.difficulty_target());
        header.timestamp = timestamp;

        let mut transactions =
            vec![Transaction::new_coinbase(miner.clone(), ledger.block_reward()).unwrap()];
        transactions.extend(extra);

        let solution = proof_of_work(
            &header,
            &transactions,
            header.difficulty_target,
            &AtomicBool::new(false),
        )
        .unwrap()
        .unwrap();
        header.nonce = solution.nonce;
        Block::seal(header, transactions, solution.hash)
    }

    fn config() -> LedgerConfig {
        LedgerConfig {
            initial_difficulty: 0,
            ..LedgerConfig::default()
        }
    }

    struct Voter {
        id: String,
        vote: bool,
        received: Mutex<Vec<Transaction>>,
    }

    impl Voter {
        fn new(id: &str, vote: bool) -> Arc<Self> {
            Arc::new(Voter {
                id: id.to_string(),
                vote,
                received: Mutex::new(Vec::new()),
            })
        }
    }

    impl Peer for Voter {
        fn id(&self) -> &str {
            &self.id
        }

        fn receive_transaction(&self, transaction: Transaction) {
            self.received.lock().unwrap().push(transaction);
        }

        fn validate_block(&self, _block: &Block) -> bool {
            self.vote
        }
    }

    #[test]
    fn test_majority_boundary() {
        assert!(!has_majority(0, 0));
        assert!(!has_majority(1, 2));
        assert!(has_majority(2, 3));
        assert!(!has_majority(2, 4));
        assert!(has_majority(3, 4));
        assert!(has_majority(1, 1));
    }

    #[test]
    fn test_new_ledger_is_empty() {
        let ledger = Ledger::new(LedgerConfig::default());
        assert_eq!(ledger.height(), 0);
        assert_eq!(ledger.tip_hash(), Hash::zero());
        assert_eq!(ledger.block_reward(), Amount::coins(50));
        assert_eq!(ledger.difficulty_target(), 1);
        assert_eq!(ledger.get_current_supply(), Amount::ZERO);
        assert!(ledger.is_valid());
    }

    #[test]
    fn test_half_the_votes_is_not_enough() {
        let ledger = Ledger::new(config());
        let miner = KeyPair::generate();
        let proposer = Voter::new("proposer", true);
        let voters = vec![
            Voter::new("a", true),
            Voter::new("b", true),
            Voter::new("c", false),
            Voter::new("d", false),
        ];
        ledger.register_node(&proposer).unwrap();
        for voter in &voters {
            ledger.register_node(voter).unwrap();
        }

        let block = mine_on_tip(&ledger, miner.address(), Vec::new(), Utc::now());
        let outcome = ledger.broadcast_block_for_validation("proposer", block).unwrap();

        assert_eq!(outcome, VoteOutcome::Rejected { votes: 2, eligible: 4 });
        assert_eq!(ledger.height(), 0);
    }

    #[test]
    fn test_strict_majority_commits() {
        let ledger = Ledger::new(config());
        let mut events = ledger.subscribe();
        let miner = KeyPair::generate();
        let nodes = vec![
            Voter::new("proposer", true),
            Voter::new("a", true),
            Voter::new("b", true),
            Voter::new("c", false),
        ];
        for node in &nodes {
            ledger.register_node(node).unwrap();
        }

        let block = mine_on_tip(&ledger, miner.address(), Vec::new(), Utc::now());
        let hash = block.hash.clone();
        let outcome = ledger.broadcast_block_for_validation("proposer", block).unwrap();

        assert_eq!(
            outcome,
            VoteOutcome::Committed { height: 1, votes: 2, eligible: 3 }
        );
        assert_eq!(ledger.tip_hash(), hash);
        assert!(ledger.is_valid());

        let committed = std::iter::from_fn(|| events.try_recv().ok())
            .any(|e| matches!(e, LedgerEvent::BlockCommitted { height: 1, .. }));
        assert!(committed);
    }

    #[test]
    fn test_all_nodes_quorum_counts_proposer() {
        let ledger = Ledger::new(LedgerConfig {
            quorum: QuorumPolicy::AllNodes,
            ..config()
        });
        let miner = KeyPair::generate();
        let nodes = vec![Voter::new("proposer", true), Voter::new("a", true)];
        for node in &nodes {
            ledger.register_node(node).unwrap();
        }

        let block = mine_on_tip(&ledger, miner.address(), Vec::new(), Utc::now());
        let outcome = ledger.broadcast_block_for_validation("proposer", block).unwrap();

        // One vote out of two registered nodes is exactly half
        assert_eq!(outcome, VoteOutcome::Rejected { votes: 1, eligible: 2 });
    }

    #[test]
    fn test_lone_proposer_cannot_commit() {
        let ledger = Ledger::new(config());
        let miner = KeyPair::generate();
        let proposer = Voter::new("proposer", true);
        ledger.register_node(&proposer).unwrap();

        let block = mine_on_tip(&ledger, miner.address(), Vec::new(), Utc::now());
        let outcome = ledger.broadcast_block_for_validation("proposer", block).unwrap();
        assert!(!outcome.is_committed());
    }

    #[test]
    fn test_broadcast_transaction_reaches_every_node() {
        let ledger = Ledger::new(config());
        let a = Voter::new("a", true);
        let b = Voter::new("b", true);
        ledger.register_node(&a).unwrap();
        ledger.register_node(&b).unwrap();

        let keys = KeyPair::generate();
        let tx = Transaction::signed(
            TransactionInput::transfer(
                keys.address().clone(),
                keys.address().clone(),
                Amount::coins(1),
                Amount::ZERO,
            ),
            &keys,
        )
        .unwrap();
        ledger.broadcast_transaction(&tx);

        assert_eq!(a.received.lock().unwrap().as_slice(), &[tx.clone()]);
        assert_eq!(b.received.lock().unwrap().as_slice(), &[tx]);
    }

    #[test]
    fn test_dropped_and_removed_nodes_leave_registry() {
        let ledger = Ledger::new(config());
        let a = Voter::new("a", true);
        let b = Voter::new("b", true);
        ledger.register_node(&a).unwrap();
        ledger.register_node(&b).unwrap();
        assert_eq!(ledger.node_count(), 2);

        drop(b);
        assert_eq!(ledger.node_count(), 1);

        ledger.remove_node("a");
        assert_eq!(ledger.node_count(), 0);
    }

    #[test]
    fn test_live_node_id_cannot_be_registered_twice() {
        let ledger = Ledger::new(config());
        let first = Voter::new("10.0.0.1", true);
        let second = Voter::new("10.0.0.1", true);
        ledger.register_node(&first).unwrap();

        assert!(matches!(
            ledger.register_node(&second),
            Err(LedgerError::DuplicateNode(id)) if id == "10.0.0.1"
        ));
        assert_eq!(ledger.node_count(), 1);

        // The first node still receives broadcasts
        let keys = KeyPair::generate();
        let tx = Transaction::signed(
            TransactionInput::transfer(
                keys.address().clone(),
                keys.address().clone(),
                Amount::coins(1),
                Amount::ZERO,
            ),
            &keys,
        )
        .unwrap();
        ledger.broadcast_transaction(&tx);
        assert_eq!(first.received.lock().unwrap().len(), 1);
        assert!(second.received.lock().unwrap().is_empty());

        // Once the holder is gone the id is free again
        drop(first);
        ledger.register_node(&second).unwrap();
        assert_eq!(ledger.node_count(), 1);
    }

    #[test]
    fn test_append_rejects_block_off_tip() {
        let ledger = Ledger::new(config());
        let miner = KeyPair::generate();
        let first = mine_on_tip(&ledger, miner.address(), Vec::new(), Utc::now());
        let stale = first.clone();
        ledger.append_block(first).unwrap();

        assert!(matches!(
            ledger.append_block(stale),
            Err(LedgerError::NotOnTip { .. })
        ));
        assert_eq!(ledger.height(), 1);
    }

    #[test]
    fn test_reward_halves_every_interval() {
        let ledger = Ledger::new(LedgerConfig {
            halving_interval: 2,
            ..config()
        });
        let miner = KeyPair::generate();

        for expected in [50, 50] {
            assert_eq!(ledger.block_reward(), Amount::coins(expected));
            let block = mine_on_tip(&ledger, miner.address(), Vec::new(), Utc::now());
            ledger.append_block(block).unwrap();
        }
        assert_eq!(ledger.block_reward(), Amount::coins(25));

        for _ in 0..2 {
            let block = mine_on_tip(&ledger, miner.address(), Vec::new(), Utc::now());
            ledger.append_block(block).unwrap();
        }
        assert_eq!(ledger.block_reward(), "12.5".parse().unwrap());
        assert_eq!(ledger.get_current_supply(), Amount::coins(150));
    }

    #[test]
    fn test_reward_drops_to_zero_at_supply_cap() {
        let ledger = Ledger::new(LedgerConfig {
            total_supply: Amount::coins(120),
            ..config()
        });
        let miner = KeyPair::generate();

        for _ in 0..4 {
            let block = mine_on_tip(&ledger, miner.address(), Vec::new(), Utc::now());
            ledger.append_block(block).unwrap();
            assert!(ledger.get_current_supply() <= Amount::coins(120));
        }

        assert_eq!(ledger.get_current_supply(), Amount::coins(100));
        assert_eq!(ledger.block_reward(), Amount::ZERO);
    }

    #[test]
    fn test_reward_above_total_supply_is_never_paid() {
        let ledger = Ledger::new(LedgerConfig {
            total_supply: Amount::coins(10),
            ..config()
        });
        assert_eq!(ledger.block_reward(), Amount::ZERO);

        let miner = KeyPair::generate();
        let nodes = vec![Voter::new("proposer", true), Voter::new("a", true)];
        for node in &nodes {
            ledger.register_node(node).unwrap();
        }

        let block = mine_on_tip(&ledger, miner.address(), Vec::new(), Utc::now());
        let outcome = ledger.broadcast_block_for_validation("proposer", block).unwrap();
        assert!(outcome.is_committed());
        assert_eq!(ledger.get_current_supply(), Amount::ZERO);
        assert!(ledger.get_current_supply() <= ledger.config().total_supply);
    }

    #[test]
    fn test_supply_cap_emits_exhausted_not_halved() {
        let ledger = Ledger::new(LedgerConfig {
            total_supply: Amount::coins(60),
            ..config()
        });
        let mut events = ledger.subscribe();
        let miner = KeyPair::generate();

        let block = mine_on_tip(&ledger, miner.address(), Vec::new(), Utc::now());
        ledger.append_block(block).unwrap();
        assert_eq!(ledger.block_reward(), Amount::ZERO);

        let events: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert!(events.contains(&LedgerEvent::RewardExhausted {
            height: 1,
            total_supply: Amount::coins(60),
        }));
        assert!(!events.iter().any(|e| matches!(e, LedgerEvent::RewardHalved { .. })));
    }

    #[test]
    fn test_difficulty_retargets_both_ways() {
        let ledger = Ledger::new(LedgerConfig {
            initial_difficulty: 1,
            difficulty_retarget_interval: 2,
            target_block_time_ms: 10_000,
            ..LedgerConfig::default()
        });
        let miner = KeyPair::generate();
        let start = Utc::now();

        // The first window has one gap of 2 s, faster than the 10 s target
        for offset in [0, 2] {
            let block = mine_on_tip(&ledger, miner.address(), Vec::new(), start + Duration::seconds(offset));
            ledger.append_block(block).unwrap();
        }
        assert_eq!(ledger.difficulty_target(), 2);

        // Later windows count from the block before them: 198 s over 2 gaps is slower
        for offset in [100, 200] {
            let block = mine_on_tip(&ledger, miner.address(), Vec::new(), start + Duration::seconds(offset));
            ledger.append_block(block).unwrap();
        }
        assert_eq!(ledger.difficulty_target(), 1);

        // 20 s over 2 gaps averages exactly the target
        for offset in [210, 220] {
            let block = mine_on_tip(&ledger, miner.address(), Vec::new(), start + Duration::seconds(offset));
            ledger.append_block(block).unwrap();
        }
        assert_eq!(ledger.difficulty_target(), 1);
        assert!(ledger.is_valid());
    }

    #[test]
    fn test_retarget_every_block_uses_previous_block() {
        let ledger = Ledger::new(LedgerConfig {
            initial_difficulty: 1,
            difficulty_retarget_interval: 1,
            target_block_time_ms: 10_000,
            ..LedgerConfig::default()
        });
        let miner = KeyPair::generate();
        let start = Utc::now();

        // Nothing to measure against yet
        let block = mine_on_tip(&ledger, miner.address(), Vec::new(), start);
        ledger.append_block(block).unwrap();
        assert_eq!(ledger.difficulty_target(), 1);

        let block = mine_on_tip(&ledger, miner.address(), Vec::new(), start + Duration::seconds(20));
        ledger.append_block(block).unwrap();
        assert_eq!(ledger.difficulty_target(), 0);

        let block = mine_on_tip(&ledger, miner.address(), Vec::new(), start + Duration::seconds(21));
        ledger.append_block(block).unwrap();
        assert_eq!(ledger.difficulty_target(), 1);
    }

    #[test]
    fn test_balances_follow_committed_transfers() {
        let ledger = Ledger::new(config());
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let miner = KeyPair::generate();

        let block = mine_on_tip(&ledger, alice.address(), Vec::new(), Utc::now());
        ledger.append_block(block).unwrap();

        let payment = Transaction::signed(
            TransactionInput::transfer(
                alice.address().clone(),
                bob.address().clone(),
                Amount::coins(10),
                "0.1".parse().unwrap(),
            ),
            &alice,
        )
        .unwrap();
        assert!(!ledger.is_transaction_committed(&payment.hash));

        let block = mine_on_tip(&ledger, miner.address(), vec![payment.clone()], Utc::now());
        ledger.append_block(block).unwrap();

        assert!(ledger.is_transaction_committed(&payment.hash));
        assert!(ledger.committed_transaction_hashes().contains(&payment.hash));
        assert_eq!(ledger.get_balance(alice.address()), Balance::from("39.9".parse::<Amount>().unwrap()));
        assert_eq!(ledger.get_balance(bob.address()), Balance::from(Amount::coins(10)));
        assert_eq!(ledger.get_balance(miner.address()), Balance::from("50.1".parse::<Amount>().unwrap()));
        assert_eq!(ledger.get_current_supply(), Amount::coins(100));
    }

    #[test]
    fn test_tampered_chain_is_invalid() {
        let ledger = Ledger::new(config());
        let miner = KeyPair::generate();
        let block = mine_on_tip(&ledger, miner.address(), Vec::new(), Utc::now());
        ledger.append_block(block).unwrap();
        assert!(ledger.is_valid());

        ledger.write_state().chain[0].header.nonce += 1;
        assert!(!ledger.is_valid());
    }
}
