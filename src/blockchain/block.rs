use serde::{Deserialize, Serialize};
use sha2::Digest;
use thiserror::Error;

use super::hash::BlockHash;
use super::pow::{MineOptions, PowError, ProofOfWork, Solution};

/// Payload of the first block in every chain
pub const GENESIS_DATA: &[u8] = b"Genesis";

/// Errors that can occur while sealing a block
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Block is already sealed")]
    AlreadySealed,

    #[error("Proof-of-work error: {0}")]
    Pow(#[from] PowError),
}

/// A block that has not been mined yet.
///
/// Holds only the payload and the link to its predecessor. Sealing consumes
/// the template, so a template can be sealed at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTemplate {
    data: Vec<u8>,
    prev_hash: BlockHash,
}

impl BlockTemplate {
    /// Creates an unmined block
    ///
    /// # Arguments
    ///
    /// * `data` - The payload of the block
    /// * `prev_hash` - The hash of the previous block
    pub fn new(data: impl Into<Vec<u8>>, prev_hash: BlockHash) -> Self {
        BlockTemplate {
            data: data.into(),
            prev_hash,
        }
    }

    /// The fixed genesis template: "Genesis" with no predecessor
    pub fn genesis() -> Self {
        Self::new(GENESIS_DATA, BlockHash::empty())
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn prev_hash(&self) -> &BlockHash {
        &self.prev_hash
    }

    /// Proof-of-work engine bound to this template's contents
    pub fn proof_of_work<D: Digest>(&self, difficulty: u32) -> Result<ProofOfWork<'_, D>, PowError> {
        ProofOfWork::new(&self.prev_hash, &self.data, difficulty)
    }

    /// Mines the template and turns it into an immutable sealed block
    ///
    /// # Arguments
    ///
    /// * `difficulty` - Required number of leading zero bits
    /// * `options` - Iteration cap, cancellation, workers and progress
    ///
    /// # Returns
    ///
    /// The sealed block, or the mining error that stopped the search
    pub fn seal<D: Digest>(self, difficulty: u32, options: &MineOptions<'_>) -> Result<SealedBlock, BlockError> {
        let solution = self.mine::<D>(difficulty, options)?;
        Ok(SealedBlock::from_solution(self, solution, difficulty))
    }

    fn mine<D: Digest>(&self, difficulty: u32, options: &MineOptions<'_>) -> Result<Solution, PowError> {
        self.proof_of_work::<D>(difficulty)?.mine_with(options)
    }
}

/// A mined block.
///
/// Fields are private and only readable, so the hash and nonce stay consistent
/// with the payload for the lifetime of the value. This is also the record
/// handed to storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBlock {
    data: Vec<u8>,
    prev_hash: BlockHash,
    hash: BlockHash,
    nonce: u64,
    difficulty: u32,
}

impl SealedBlock {
    /// Mines and seals the genesis block
    ///
    /// # Arguments
    ///
    /// * `difficulty` - Required number of leading zero bits
    /// * `options` - Iteration cap, cancellation, workers and progress
    pub fn genesis<D: Digest>(difficulty: u32, options: &MineOptions<'_>) -> Result<Self, BlockError> {
        BlockTemplate::genesis().seal::<D>(difficulty, options)
    }

    fn from_solution(template: BlockTemplate, solution: Solution, difficulty: u32) -> Self {
        SealedBlock {
            data: template.data,
            prev_hash: template.prev_hash,
            hash: solution.hash,
            nonce: solution.nonce,
            difficulty,
        }
    }

    /// Assembles a block from raw parts without mining. Used to exercise
    /// validation against tampered records.
    #[cfg(test)]
    pub(crate) fn from_parts(
        data: Vec<u8>,
        prev_hash: BlockHash,
        hash: BlockHash,
        nonce: u64,
        difficulty: u32,
    ) -> Self {
        SealedBlock {
            data,
            prev_hash,
            hash,
            nonce,
            difficulty,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn prev_hash(&self) -> &BlockHash {
        &self.prev_hash
    }

    pub fn hash(&self) -> &BlockHash {
        &self.hash
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_empty()
    }

    /// Proof-of-work engine bound to this block's contents and difficulty
    pub fn proof_of_work<D: Digest>(&self) -> Result<ProofOfWork<'_, D>, PowError> {
        ProofOfWork::new(&self.prev_hash, &self.data, self.difficulty)
    }

    /// Checks the sealed state independently of how it was produced: the
    /// stored nonce must meet the target and re-hashing must reproduce the
    /// stored hash
    ///
    /// # Returns
    ///
    /// `false` for any tampered field or a difficulty the digest cannot carry
    pub fn validate<D: Digest>(&self) -> bool {
        match self.proof_of_work::<D>() {
            Ok(pow) => {
                let recomputed = pow.hash_nonce(self.nonce);
                recomputed == self.hash && pow.target().is_met_by(recomputed.as_bytes())
            }
            Err(_) => false,
        }
    }
}

/// A block in either of its two states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Unsealed(BlockTemplate),
    Sealed(SealedBlock),
}

impl Block {
    pub fn new(data: impl Into<Vec<u8>>, prev_hash: BlockHash) -> Self {
        Block::Unsealed(BlockTemplate::new(data, prev_hash))
    }

    pub fn genesis() -> Self {
        Block::Unsealed(BlockTemplate::genesis())
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self, Block::Sealed(_))
    }

    pub fn as_sealed(&self) -> Option<&SealedBlock> {
        match self {
            Block::Sealed(block) => Some(block),
            Block::Unsealed(_) => None,
        }
    }

    pub fn into_sealed(self) -> Option<SealedBlock> {
        match self {
            Block::Sealed(block) => Some(block),
            Block::Unsealed(_) => None,
        }
    }

    /// Mines and seals the block in place.
    ///
    /// Sealing twice fails with `AlreadySealed`. A failed mining run leaves
    /// the block unsealed.
    pub fn seal<D: Digest>(&mut self, difficulty: u32, options: &MineOptions<'_>) -> Result<(), BlockError> {
        let template = match self {
            Block::Sealed(_) => return Err(BlockError::AlreadySealed),
            Block::Unsealed(template) => template,
        };

        let solution = template.mine::<D>(difficulty, options)?;
        let sealed = SealedBlock::from_solution(template.clone(), solution, difficulty);
        *self = Block::Sealed(sealed);

        Ok(())
    }
}

impl From<SealedBlock> for Block {
    fn from(block: SealedBlock) -> Self {
        Block::Sealed(block)
    }
}
