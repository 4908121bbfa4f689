use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::block::{BlockError, BlockTemplate, SealedBlock, GENESIS_DATA};
use super::hash;
use super::pow::{CancellationToken, PowError, Target};
use super::storage::{BlockStore, StorageError};
use crate::config::MiningConfig;

/// What is wrong with a block that fails chain validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegrityFault {
    #[error("missing genesis block")]
    MissingGenesis,

    /// The first block is not the fixed genesis block
    #[error("invalid genesis block")]
    InvalidGenesis,

    #[error("previous hash does not match")]
    BrokenLink,

    /// The stored nonce or hash does not satisfy proof-of-work
    #[error("invalid proof of work")]
    InvalidProof,

    /// The block was mined at a different difficulty than the chain uses
    #[error("difficulty {found} (expected {expected})")]
    DifficultyMismatch { expected: u32, found: u32 },
}

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Proof-of-work error: {0}")]
    Pow(#[from] PowError),

    #[error("Block error: {0}")]
    Block(BlockError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Chain integrity error at block {index}: {fault}")]
    ChainIntegrity { index: usize, fault: IntegrityFault },
}

impl From<BlockError> for ChainError {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::Pow(err) => ChainError::Pow(err),
            other => ChainError::Block(other),
        }
    }
}

/// An append-only sequence of sealed blocks starting at genesis.
///
/// Appends are serialized by a dedicated lock held across mining and
/// persisting, so every block is linked to the tail it was mined against.
/// The block list itself is only locked briefly, so readers are not held up
/// by a running search.
pub struct Chain<D = Sha256> {
    /// The chain of blocks
    blocks: Mutex<Vec<SealedBlock>>,

    /// Held by the single writer for the whole append
    append_lock: Mutex<()>,

    /// Difficulty, iteration cap and worker count
    config: MiningConfig,

    /// Where appended blocks are persisted
    store: Option<Arc<dyn BlockStore>>,

    _digest: PhantomData<fn() -> D>,
}

impl<D: Digest> Chain<D> {
    /// Creates an in-memory chain and mines its genesis block
    ///
    /// # Errors
    ///
    /// `Pow(InvalidDifficulty)` when the configured difficulty does not fit
    /// the digest, or any failure mining genesis
    pub fn new(config: MiningConfig) -> Result<Self, ChainError> {
        Self::check_difficulty(&config)?;

        let genesis = SealedBlock::genesis::<D>(config.difficulty, &config.mine_options())?;
        info!("Mined genesis block {}", genesis.hash());

        Ok(Self::from_parts(vec![genesis], config, None))
    }

    /// Opens a chain backed by `store`.
    ///
    /// Persisted blocks are loaded and validated; a tampered or inconsistent
    /// store is rejected. An empty store gets a freshly mined genesis block.
    ///
    /// # Arguments
    ///
    /// * `config` - Mining parameters; must match the difficulty of the stored blocks
    /// * `store` - Where blocks are loaded from and appended to
    pub fn open(config: MiningConfig, store: Arc<dyn BlockStore>) -> Result<Self, ChainError> {
        Self::check_difficulty(&config)?;

        let blocks = store.load_blocks()?;

        if blocks.is_empty() {
            info!("No existing chain found in storage, creating genesis block");

            let genesis = SealedBlock::genesis::<D>(config.difficulty, &config.mine_options())?;
            Self::persist(store.as_ref(), 0, &genesis)?;

            return Ok(Self::from_parts(vec![genesis], config, Some(store)));
        }

        if let Err(err) = validate_blocks::<D>(&blocks, config.difficulty) {
            warn!("Rejecting stored chain: {}", err);
            return Err(err);
        }

        info!("Loaded {} blocks from storage", blocks.len());
        Ok(Self::from_parts(blocks, config, Some(store)))
    }

    fn from_parts(blocks: Vec<SealedBlock>, config: MiningConfig, store: Option<Arc<dyn BlockStore>>) -> Self {
        Chain {
            blocks: Mutex::new(blocks),
            append_lock: Mutex::new(()),
            config,
            store,
            _digest: PhantomData,
        }
    }

    fn check_difficulty(config: &MiningConfig) -> Result<(), PowError> {
        Target::from_difficulty(config.difficulty, hash::hash_bits::<D>()).map(|_| ())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SealedBlock>> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mines a block carrying `data` on top of the current tail and appends it
    ///
    /// # Arguments
    ///
    /// * `data` - The payload of the new block
    ///
    /// # Returns
    ///
    /// The sealed block as appended to the chain
    pub fn append(&self, data: impl Into<Vec<u8>>) -> Result<SealedBlock, ChainError> {
        self.append_with(data, None)
    }

    /// Like `append`, but mining stops with `Cancelled` once `cancel` is set.
    ///
    /// On any failure the chain and its store are left unchanged: a block
    /// whose write cannot be flushed is rolled back out of the store.
    ///
    /// # Arguments
    ///
    /// * `data` - The payload of the new block
    /// * `cancel` - Optional token that aborts the search
    ///
    /// # Returns
    ///
    /// The sealed block as appended to the chain
    pub fn append_with(
        &self,
        data: impl Into<Vec<u8>>,
        cancel: Option<CancellationToken>,
    ) -> Result<SealedBlock, ChainError> {
        let _writer = self.append_lock.lock().unwrap_or_else(PoisonError::into_inner);

        // Only appenders change the block list and we hold the append lock,
        // so the tail and height read here stay current until the push.
        let (prev_hash, height) = {
            let blocks = self.lock();
            match blocks.last() {
                Some(tail) => (tail.hash().clone(), blocks.len()),
                None => {
                    return Err(ChainError::ChainIntegrity {
                        index: 0,
                        fault: IntegrityFault::MissingGenesis,
                    })
                }
            }
        };

        let mut options = self.config.mine_options();
        options.cancel = cancel;

        let block = BlockTemplate::new(data, prev_hash).seal::<D>(self.config.difficulty, &options)?;

        if let Some(store) = &self.store {
            Self::persist(store.as_ref(), height as u64, &block)?;
            debug!("Saved block {} to storage", height);
        }

        self.lock().push(block.clone());
        info!("Appended block {} with hash {} (nonce {})", height, block.hash(), block.nonce());

        Ok(block)
    }

    // Writes and flushes `block`, removing it again if the flush fails
    fn persist(store: &dyn BlockStore, height: u64, block: &SealedBlock) -> Result<(), ChainError> {
        store.save_block(height, block)?;

        if let Err(err) = store.flush() {
            warn!("Failed to flush block {}, rolling back: {}", height, err);
            if let Err(rollback) = store.truncate(height) {
                error!("Failed to roll back block {}: {}", height, rollback);
            }
            return Err(err.into());
        }

        Ok(())
    }

    /// Checks linkage and proof-of-work for every block, reporting the first
    /// offending index
    pub fn validate(&self) -> Result<(), ChainError> {
        validate_blocks::<D>(&self.lock(), self.config.difficulty)
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Snapshot of all blocks
    ///
    /// # Returns
    ///
    /// A copy of the blocks in chain order, genesis first
    pub fn blocks(&self) -> Vec<SealedBlock> {
        self.lock().clone()
    }

    /// # Returns
    ///
    /// The block at `index`, or `None` past the tail
    pub fn get(&self, index: usize) -> Option<SealedBlock> {
        self.lock().get(index).cloned()
    }

    /// The last block in the chain
    pub fn tail(&self) -> Option<SealedBlock> {
        self.lock().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn difficulty(&self) -> u32 {
        self.config.difficulty
    }

    #[cfg(test)]
    fn replace_block(&self, index: usize, block: SealedBlock) {
        self.lock()[index] = block;
    }
}

/// Validates a block sequence mined at `difficulty`
///
/// # Arguments
///
/// * `blocks` - The sequence to check, genesis first
/// * `difficulty` - The difficulty every block must have been mined at
///
/// # Returns
///
/// `ChainIntegrity` naming the first offending index and what is wrong with it
pub fn validate_blocks<D: Digest>(blocks: &[SealedBlock], difficulty: u32) -> Result<(), ChainError> {
    let fail = |index: usize, fault: IntegrityFault| -> Result<(), ChainError> {
        Err(ChainError::ChainIntegrity { index, fault })
    };

    let genesis = match blocks.first() {
        Some(genesis) => genesis,
        None => return fail(0, IntegrityFault::MissingGenesis),
    };

    if !genesis.is_genesis() || genesis.data() != GENESIS_DATA {
        return fail(0, IntegrityFault::InvalidGenesis);
    }

    for (index, block) in blocks.iter().enumerate() {
        if index > 0 && block.prev_hash() != blocks[index - 1].hash() {
            return fail(index, IntegrityFault::BrokenLink);
        }

        if block.difficulty() != difficulty {
            return fail(
                index,
                IntegrityFault::DifficultyMismatch {
                    expected: difficulty,
                    found: block.difficulty(),
                },
            );
        }

        if !block.validate::<D>() {
            return fail(index, IntegrityFault::InvalidProof);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::hash::BlockHash;
    use crate::blockchain::pow::MineOptions;
    use crate::blockchain::storage::{MemoryStore, SledStore};
    use sha2::Sha512;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    const DIFFICULTY: u32 = 6;

    fn config() -> MiningConfig {
        MiningConfig::with_difficulty(DIFFICULTY)
    }

    fn chain_with(n: usize) -> Chain {
        let chain = Chain::new(config()).unwrap();
        for i in 0..n {
            chain.append(format!("block {}", i)).unwrap();
        }
        chain
    }

    fn with_prev_hash(block: &SealedBlock, prev_hash: BlockHash) -> SealedBlock {
        SealedBlock::from_parts(
            block.data().to_vec(),
            prev_hash,
            block.hash().clone(),
            block.nonce(),
            block.difficulty(),
        )
    }

    // Memory store whose next flush can be made to fail
    #[derive(Default)]
    struct FailingFlushStore {
        inner: MemoryStore,
        fail_next_flush: AtomicBool,
    }

    impl BlockStore for FailingFlushStore {
        fn save_block(&self, height: u64, block: &SealedBlock) -> Result<(), StorageError> {
            self.inner.save_block(height, block)
        }

        fn load_blocks(&self) -> Result<Vec<SealedBlock>, StorageError> {
            self.inner.load_blocks()
        }

        fn height(&self) -> Result<u64, StorageError> {
            self.inner.height()
        }

        fn truncate(&self, height: u64) -> Result<(), StorageError> {
            self.inner.truncate(height)
        }

        fn flush(&self) -> Result<(), StorageError> {
            if self.fail_next_flush.swap(false, Ordering::SeqCst) {
                let err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
                return Err(StorageError::DatabaseError(sled::Error::Io(err)));
            }
            self.inner.flush()
        }
    }

    #[test]
    fn test_new_chain() {
        let chain: Chain = Chain::new(config()).unwrap();

        assert_eq!(chain.len(), 1);

        let genesis = chain.get(0).unwrap();
        assert!(genesis.prev_hash().is_empty());
        assert_eq!(genesis.data(), GENESIS_DATA);
        assert!(genesis.validate::<Sha256>());
        assert!(chain.is_valid());
    }

    #[test]
    fn test_invalid_difficulty() {
        let result = Chain::<Sha256>::new(MiningConfig::with_difficulty(256));

        assert!(matches!(
            result,
            Err(ChainError::Pow(PowError::InvalidDifficulty { difficulty: 256, hash_bits: 256 }))
        ));
    }

    #[test]
    fn test_append_links_to_tail() {
        let chain = chain_with(0);
        let genesis = chain.tail().unwrap();

        let block = chain.append("hello").unwrap();

        assert_eq!(block.prev_hash(), genesis.hash());
        assert_eq!(block.data(), b"hello");
        assert_eq!(chain.tail(), Some(block));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_chain_validates() {
        let chain = chain_with(5);

        assert_eq!(chain.len(), 6);
        assert!(chain.validate().is_ok());

        let blocks = chain.blocks();
        for i in 1..blocks.len() {
            assert_eq!(blocks[i].prev_hash(), blocks[i - 1].hash());
        }
    }

    #[test]
    fn test_corrupted_link_reports_index() {
        let n = 5;

        for k in 1..=n {
            let chain = chain_with(n);
            let block = chain.get(k).unwrap();
            chain.replace_block(k, with_prev_hash(&block, BlockHash::from_bytes(vec![0xee; 32])));

            match chain.validate() {
                Err(ChainError::ChainIntegrity { index, fault }) => {
                    assert_eq!(index, k);
                    assert_eq!(fault, IntegrityFault::BrokenLink);
                }
                other => panic!("expected integrity error, got {:?}", other),
            }
            assert!(!chain.is_valid());
        }
    }

    #[test]
    fn test_tampered_data_fails_proof() {
        let chain = chain_with(3);
        let block = chain.get(2).unwrap();
        let tampered = SealedBlock::from_parts(
            b"forged".to_vec(),
            block.prev_hash().clone(),
            block.hash().clone(),
            block.nonce(),
            block.difficulty(),
        );
        chain.replace_block(2, tampered);

        assert!(matches!(
            chain.validate(),
            Err(ChainError::ChainIntegrity { index: 2, fault: IntegrityFault::InvalidProof })
        ));
    }

    #[test]
    fn test_tampered_genesis() {
        let chain = chain_with(1);
        let genesis = chain.get(0).unwrap();
        chain.replace_block(0, with_prev_hash(&genesis, BlockHash::from_bytes(vec![1])));

        assert!(matches!(
            chain.validate(),
            Err(ChainError::ChainIntegrity { index: 0, fault: IntegrityFault::InvalidGenesis })
        ));
    }

    #[test]
    fn test_validate_empty_sequence() {
        assert!(matches!(
            validate_blocks::<Sha256>(&[], DIFFICULTY),
            Err(ChainError::ChainIntegrity { index: 0, fault: IntegrityFault::MissingGenesis })
        ));
    }

    #[test]
    fn test_zero_difficulty_chain() {
        let chain: Chain = Chain::new(MiningConfig::with_difficulty(0)).unwrap();
        chain.append("a").unwrap();
        chain.append("b").unwrap();

        assert!(chain.blocks().iter().all(|block| block.nonce() == 0));
        assert!(chain.is_valid());
    }

    #[test]
    fn test_cancelled_append_leaves_chain_unchanged() {
        let chain = chain_with(1);
        let before = chain.blocks();
        let token = CancellationToken::new();
        token.cancel();

        let result = chain.append_with("never", Some(token));

        assert!(matches!(result, Err(ChainError::Pow(PowError::Cancelled))));
        assert_eq!(chain.blocks(), before);
        assert!(chain.is_valid());
    }

    #[test]
    fn test_failed_flush_rolls_back_store() {
        let store = Arc::new(FailingFlushStore::default());
        let chain: Chain = Chain::open(config(), store.clone()).unwrap();

        store.fail_next_flush.store(true, Ordering::SeqCst);
        let result = chain.append("lost");

        assert!(matches!(result, Err(ChainError::Storage(_))));
        assert_eq!(chain.len(), 1);
        assert_eq!(store.height().unwrap(), 1);

        // The next append reuses the height the failed one gave back
        let kept = chain.append("kept").unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(store.height().unwrap(), 2);
        assert_eq!(kept.data(), b"kept");

        let reopened: Chain = Chain::open(config(), store.clone()).unwrap();
        assert_eq!(reopened.blocks(), chain.blocks());
    }

    #[test]
    fn test_reads_do_not_wait_for_mining() {
        let genesis = SealedBlock::genesis::<Sha256>(DIFFICULTY, &MineOptions::new()).unwrap();
        let chain: Chain = Chain::from_parts(vec![genesis.clone()], MiningConfig::with_difficulty(40), None);
        let token = CancellationToken::new();

        thread::scope(|scope| {
            let writer = scope.spawn(|| chain.append_with("slow", Some(token.clone())));

            // Wait until the writer owns the append lock
            while chain.append_lock.try_lock().is_ok() {
                thread::yield_now();
            }

            assert_eq!(chain.len(), 1);
            assert_eq!(chain.tail(), Some(genesis.clone()));
            assert_eq!(chain.blocks(), vec![genesis.clone()]);

            token.cancel();
            let result = writer.join().unwrap();
            assert!(matches!(result, Err(ChainError::Pow(PowError::Cancelled))));
        });

        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_integrity_error_message() {
        let err = ChainError::ChainIntegrity {
            index: 3,
            fault: IntegrityFault::DifficultyMismatch { expected: 6, found: 7 },
        };
        assert_eq!(err.to_string(), "Chain integrity error at block 3: difficulty 7 (expected 6)");

        let err = ChainError::ChainIntegrity { index: 1, fault: IntegrityFault::BrokenLink };
        assert_eq!(err.to_string(), "Chain integrity error at block 1: previous hash does not match");
    }

    #[test]
    fn test_exhausted_append_leaves_chain_unchanged() {
        let difficulty = 8;
        let mine = |template: &BlockTemplate| {
            template.proof_of_work::<Sha256>(difficulty).unwrap().mine().unwrap().nonce
        };

        // Cap the search just above what genesis needs
        let genesis_nonce = mine(&BlockTemplate::genesis());
        let config = MiningConfig {
            difficulty,
            max_iterations: Some(genesis_nonce + 1),
            workers: 1,
        };
        let chain: Chain = Chain::new(config).unwrap();
        let tail = chain.tail().unwrap();

        let data = (0..)
            .map(|i| format!("payload {}", i))
            .find(|data| mine(&BlockTemplate::new(data.as_str(), tail.hash().clone())) > genesis_nonce)
            .unwrap();

        let result = chain.append(data);

        assert!(matches!(
            result,
            Err(ChainError::Pow(PowError::ExhaustedSearchSpace { .. }))
        ));
        assert_eq!(chain.blocks(), vec![tail]);
    }

    #[test]
    fn test_iteration_cap_applies_to_genesis() {
        let strict = MiningConfig {
            difficulty: 40,
            max_iterations: Some(1),
            workers: 1,
        };

        assert!(matches!(
            Chain::<Sha256>::new(strict),
            Err(ChainError::Pow(PowError::ExhaustedSearchSpace { attempts: 1 }))
        ));
    }

    #[test]
    fn test_parallel_chain_matches_sequential() {
        let sequential = chain_with(3);

        let mut parallel_config = config();
        parallel_config.workers = 4;
        let parallel: Chain = Chain::new(parallel_config).unwrap();
        for i in 0..3 {
            parallel.append(format!("block {}", i)).unwrap();
        }

        assert_eq!(sequential.blocks(), parallel.blocks());
    }

    #[test]
    fn test_concurrent_appends_are_serialized() {
        let chain = Arc::new(chain_with(0));

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let chain = Arc::clone(&chain);
                thread::spawn(move || {
                    for i in 0..2 {
                        chain.append(format!("worker {} block {}", worker, i)).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(chain.len(), 9);
        assert!(chain.validate().is_ok());
    }

    #[test]
    fn test_sha512_chain() {
        let chain: Chain<Sha512> = Chain::new(config()).unwrap();
        let block = chain.append("wide").unwrap();

        assert_eq!(block.hash().len(), 64);
        assert!(chain.is_valid());
        assert!(matches!(
            Chain::<Sha512>::new(MiningConfig::with_difficulty(512)),
            Err(ChainError::Pow(PowError::InvalidDifficulty { difficulty: 512, hash_bits: 512 }))
        ));
    }

    #[test]
    fn test_open_empty_store_creates_genesis() {
        let store = Arc::new(MemoryStore::new());

        let chain: Chain = Chain::open(config(), store.clone()).unwrap();

        assert_eq!(chain.len(), 1);
        assert_eq!(store.height().unwrap(), 1);
        assert_eq!(store.load_blocks().unwrap(), chain.blocks());
    }

    #[test]
    fn test_reopen_resumes_from_tail() {
        let store = Arc::new(MemoryStore::new());

        let chain: Chain = Chain::open(config(), store.clone()).unwrap();
        chain.append("first").unwrap();
        let tail = chain.append("second").unwrap();
        drop(chain);

        let reopened: Chain = Chain::open(config(), store.clone()).unwrap();
        assert_eq!(reopened.len(), 3);
        assert_eq!(reopened.tail(), Some(tail.clone()));

        let next = reopened.append("third").unwrap();
        assert_eq!(next.prev_hash(), tail.hash());
        assert_eq!(store.height().unwrap(), 4);
    }

    #[test]
    fn test_open_rejects_tampered_store() {
        let store = Arc::new(MemoryStore::new());
        let chain: Chain = Chain::open(config(), store.clone()).unwrap();
        chain.append("first").unwrap();
        chain.append("second").unwrap();

        let block = chain.get(2).unwrap();
        store.overwrite(2, with_prev_hash(&block, BlockHash::from_bytes(vec![0; 32])));

        let result = Chain::<Sha256>::open(config(), store);
        assert!(matches!(
            result,
            Err(ChainError::ChainIntegrity { index: 2, fault: IntegrityFault::BrokenLink })
        ));
    }

    #[test]
    fn test_open_rejects_other_difficulty() {
        let store = Arc::new(MemoryStore::new());
        let _chain: Chain = Chain::open(config(), store.clone()).unwrap();

        let result = Chain::<Sha256>::open(MiningConfig::with_difficulty(DIFFICULTY + 1), store);
        assert!(matches!(
            result,
            Err(ChainError::ChainIntegrity {
                index: 0,
                fault: IntegrityFault::DifficultyMismatch { expected: 7, found: 6 }
            })
        ));
    }

    #[test]
    fn test_sled_backed_chain() {
        let store = Arc::new(SledStore::temporary().unwrap());

        let chain: Chain = Chain::open(config(), store.clone()).unwrap();
        chain.append("persisted").unwrap();
        let expected = chain.blocks();
        drop(chain);

        assert_eq!(store.tail_hash().unwrap(), Some(expected[1].hash().clone()));

        let reopened: Chain = Chain::open(config(), store.clone()).unwrap();
        assert_eq!(reopened.blocks(), expected);

        let forged = SealedBlock::from_parts(
            b"rewritten".to_vec(),
            expected[1].prev_hash().clone(),
            expected[1].hash().clone(),
            expected[1].nonce(),
            expected[1].difficulty(),
        );
        store.put_raw(1, &forged).unwrap();

        assert!(matches!(
            Chain::<Sha256>::open(config(), store),
            Err(ChainError::ChainIntegrity { index: 1, fault: IntegrityFault::InvalidProof })
        ));
    }
}
