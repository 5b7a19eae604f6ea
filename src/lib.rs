// Proof-of-work ledger simulation
//
// Wallets sign transfers, nodes pool them and mine candidate blocks, and a
// block joins the shared chain once a strict majority of the other nodes
// accept it.

pub mod blockchain;
pub mod config;
