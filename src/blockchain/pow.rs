//! Proof-of-work search.
//!
//! The search is a plain loop over nonces. [`PowWorker`] runs one search on
//! tokio's blocking pool so a node keeps answering transaction broadcasts and
//! validation requests while its miner grinds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error};
use thiserror::Error;
use tokio::task::JoinHandle;

use super::block::{transactions_payload, BlockHeader};
use super::crypto::Hash;
use super::transaction::Transaction;

/// Errors that can occur while running a proof-of-work worker
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to serialize block transactions: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Worker was shut down before finding a solution")]
    Shutdown,

    #[error("Worker crashed: {0}")]
    Crashed(String),
}

/// Everything a worker needs to search for a nonce
#[derive(Debug, Clone)]
pub struct PowJob {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub difficulty_target: u32,
}

/// A winning nonce and the hash it produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowSolution {
    pub nonce: u64,
    pub hash: Hash,
}

/// Searches nonces upward from the header's nonce until the hash has at least `difficulty_target`
/// leading zeros. Returns `Ok(None)` only if `shutdown` is raised first.
pub fn proof_of_work(
    header: &BlockHeader,
    transactions: &[Transaction],
    difficulty_target: u32,
    shutdown: &AtomicBool,
) -> Result<Option<PowSolution>, WorkerError> {
    let payload = transactions_payload(transactions)?;
    let mut nonce = header.nonce;

    loop {
        let hash = header.hash_with_nonce(nonce, &payload);
        if hash.meets_difficulty(difficulty_target) {
            return Ok(Some(PowSolution { nonce, hash }));
        }

        if shutdown.load(Ordering::Relaxed) {
            return Ok(None);
        }

        nonce = nonce.wrapping_add(1);
    }
}

/// A single proof-of-work attempt running off the caller's task
#[derive(Debug)]
pub struct PowWorker {
    handle: JoinHandle<Result<Option<PowSolution>, WorkerError>>,
    shutdown: Arc<AtomicBool>,
}

impl PowWorker {
    /// Spawns the search for `job` on the blocking pool
    pub fn spawn(job: PowJob) -> Self {
        Self::spawn_search(move |shutdown| {
            proof_of_work(&job.header, &job.transactions, job.difficulty_target, shutdown)
        })
    }

    /// Spawns any search that honours the shutdown flag
    pub(crate) fn spawn_search<F>(search: F) -> Self
    where
        F: FnOnce(&AtomicBool) -> Result<Option<PowSolution>, WorkerError> + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = tokio::task::spawn_blocking(move || search(&flag));

        PowWorker { handle, shutdown }
    }

    /// Asks the worker to stop searching
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Waits for the search to finish, then shuts the worker down.
    /// A failed worker is torn down and reported, never retried.
    pub async fn result(mut self) -> Result<PowSolution, WorkerError> {
        let outcome = (&mut self.handle).await;
        self.shutdown();

        match outcome {
            Ok(Ok(Some(solution))) => {
                debug!("Worker found nonce {} -> {}", solution.nonce, solution.hash);
                Ok(solution)
            }
            Ok(Ok(None)) => Err(WorkerError::Shutdown),
            Ok(Err(err)) => {
                error!("Worker error: {}", err);
                Err(err)
            }
            Err(join_err) => {
                error!("Worker error: {}", join_err);
                Err(WorkerError::Crashed(join_err.to_string()))
            }
        }
    }
}

impl Drop for PowWorker {
    // A dropped attempt must not keep grinding on the blocking pool
    fn drop(&mut self) {
        self.shutdown();
    }
}
