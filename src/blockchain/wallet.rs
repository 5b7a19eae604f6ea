use std::sync::Arc;

use log::info;
use thiserror::Error;

use super::amount::{Amount, Balance};
use super::chain::Ledger;
use super::crypto::{Address, CryptoError, KeyPair};
use super::transaction::{Transaction, TransactionError, TransactionInput};

/// Errors that can occur during wallet operations
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// A keypair bound to the shared ledger.
///
/// Wallets do no balance checks of their own; whether a spend is acceptable
/// is decided when a block containing it is validated.
#[derive(Debug, Clone)]
pub struct Wallet {
    keys: KeyPair,
    ledger: Arc<Ledger>,
}

impl Wallet {
    /// Creates a new wallet with a random keypair
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Wallet {
            keys: KeyPair::generate(),
            ledger,
        }
    }

    /// Creates a wallet from an existing secret key
    pub fn from_secret_key(ledger: Arc<Ledger>, secret_key: &[u8]) -> Result<Self, WalletError> {
        Ok(Wallet {
            keys: KeyPair::from_secret_key(secret_key)?,
            ledger,
        })
    }

    pub fn address(&self) -> &Address {
        self.keys.address()
    }

    pub fn export_secret_key(&self) -> Vec<u8> {
        self.keys.export_secret_key()
    }

    /// Signs a payment to `to` and broadcasts it to every registered node
    pub fn make_transaction(
        &self,
        to: &Address,
        amount: Amount,
        fee: Amount,
    ) -> Result<Transaction, WalletError> {
        let input = TransactionInput::transfer(self.address().clone(), to.clone(), amount, fee);
        let transaction = Transaction::signed(input, &self.keys)?;

        info!(
            "Wallet {} sending {} (fee {}) to {} in tx {}",
            self.address(),
            amount,
            fee,
            to,
            transaction.hash
        );
        self.ledger.broadcast_transaction(&transaction);

        Ok(transaction)
    }

    /// Builds a signed reward transaction for the ledger's current block reward.
    /// Nothing is broadcast; the caller decides which block it goes in.
    pub fn create_coinbase_transaction(&self, to: &Address) -> Result<Transaction, WalletError> {
        let input = TransactionInput::coinbase(to.clone(), self.ledger.block_reward());
        Ok(Transaction::signed(input, &self.keys)?)
    }

    /// Balance of this wallet as seen by the committed chain
    pub fn balance(&self) -> Balance {
        self.ledger.get_balance(self.address())
    }
}
