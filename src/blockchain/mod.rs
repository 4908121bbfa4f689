// Blockchain module
//
// This module contains the ledger implementation:
// - Digest glue and block hashes
// - Proof-of-work engine
// - Block structure (unsealed template and sealed block)
// - Chain structure
// - Storage boundary for persisting sealed blocks

pub mod block;
pub mod chain;
pub mod hash;
pub mod pow;
pub mod storage;

// Re-export main components for easier access
pub use block::{Block, BlockError, BlockTemplate, SealedBlock};
pub use chain::{Chain, ChainError, IntegrityFault};
pub use hash::BlockHash;
pub use pow::{CancellationToken, MineOptions, PowError, ProofOfWork, Solution, Target};
pub use storage::{BlockStore, MemoryStore, SledStore, StorageError};
