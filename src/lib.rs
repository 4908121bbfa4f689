//! An append-only ledger of hash-linked blocks secured by proof-of-work.
//!
//! [`blockchain::ProofOfWork`] searches for and checks nonces,
//! [`blockchain::Chain`] links sealed blocks from a fixed genesis block, and
//! [`blockchain::BlockStore`] is the seam for persisting them.

pub mod blockchain;
pub mod config;
