use std::path::Path;
use std::sync::{Mutex, PoisonError};

use log::{debug, warn};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use thiserror::Error;

use super::block::SealedBlock;
use super::hash::BlockHash;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Out of order write: expected height {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },
}

/// Persistence boundary for sealed blocks.
///
/// The chain hands every block it appends to `save_block` together with its
/// height, and asks for the persisted blocks in height order on startup.
pub trait BlockStore: Send + Sync {
    /// Persists `block` at `height`. Heights are written contiguously from 0.
    fn save_block(&self, height: u64, block: &SealedBlock) -> Result<(), StorageError>;

    /// All persisted blocks ordered by height
    fn load_blocks(&self) -> Result<Vec<SealedBlock>, StorageError>;

    /// Number of persisted blocks
    fn height(&self) -> Result<u64, StorageError>;

    /// Removes every block at or above `height`
    ///
    /// Used to undo a write that could not be made durable.
    fn truncate(&self, height: u64) -> Result<(), StorageError>;

    /// Makes previous writes durable
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Keeps blocks in memory. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: Mutex<Vec<SealedBlock>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the block at `height`, bypassing the ordering check
    #[cfg(test)]
    pub(crate) fn overwrite(&self, height: usize, block: SealedBlock) {
        let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        blocks[height] = block;
    }
}

impl BlockStore for MemoryStore {
    fn save_block(&self, height: u64, block: &SealedBlock) -> Result<(), StorageError> {
        let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        let expected = blocks.len() as u64;

        if height != expected {
            return Err(StorageError::OutOfOrder { expected, got: height });
        }

        blocks.push(block.clone());
        Ok(())
    }

    fn load_blocks(&self) -> Result<Vec<SealedBlock>, StorageError> {
        Ok(self.blocks.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn height(&self) -> Result<u64, StorageError> {
        Ok(self.blocks.lock().unwrap_or_else(PoisonError::into_inner).len() as u64)
    }

    fn truncate(&self, height: u64) -> Result<(), StorageError> {
        let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        blocks.truncate(height as usize);
        Ok(())
    }
}

/// Blocks persisted in a sled database
pub struct SledStore {
    /// The database instance
    db: Db,

    /// Blocks keyed by big-endian height so iteration follows chain order
    blocks: Tree,

    /// Hash of the last block
    metadata: Tree,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").finish()
    }
}

const TAIL_HASH_KEY: &str = "tail_hash";

impl SledStore {
    /// Opens (or creates) the database at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the database directory
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// A database that is removed when dropped
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let blocks = db.open_tree("blocks")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self { db, blocks, metadata })
    }

    /// Hash of the last persisted block, if any
    ///
    /// # Returns
    ///
    /// `None` for an empty store
    pub fn tail_hash(&self) -> Result<Option<BlockHash>, StorageError> {
        match self.metadata.get(TAIL_HASH_KEY)? {
            Some(value) => Ok(Some(BlockHash::from_bytes(value.to_vec()))),
            None => Ok(None),
        }
    }

    /// Raw access for tests that tamper with persisted records
    #[cfg(test)]
    pub(crate) fn put_raw(&self, height: u64, block: &SealedBlock) -> Result<(), StorageError> {
        let value = bincode::serialize(block)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        self.blocks.insert(&height.to_be_bytes()[..], value)?;
        Ok(())
    }
}

fn decode_height(key: &[u8]) -> Result<u64, StorageError> {
    let bytes = <[u8; 8]>::try_from(key)
        .map_err(|e| StorageError::DeserializationError(format!("block key: {}", e)))?;
    Ok(u64::from_be_bytes(bytes))
}

fn transaction_error(err: TransactionError<StorageError>) -> StorageError {
    match err {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => StorageError::DatabaseError(err),
    }
}

impl BlockStore for SledStore {
    fn save_block(&self, height: u64, block: &SealedBlock) -> Result<(), StorageError> {
        let expected = self.height()?;
        if height != expected {
            return Err(StorageError::OutOfOrder { expected, got: height });
        }

        let key = height.to_be_bytes();
        let value = bincode::serialize(block)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        // The block and the tail hash are written together or not at all
        (&self.blocks, &self.metadata)
            .transaction(|(blocks, metadata)| {
                if blocks.get(&key[..])?.is_some() {
                    return Err(ConflictableTransactionError::Abort(StorageError::OutOfOrder {
                        expected,
                        got: height,
                    }));
                }

                blocks.insert(&key[..], value.as_slice())?;
                metadata.insert(TAIL_HASH_KEY, block.hash().as_bytes())?;
                Ok(())
            })
            .map_err(transaction_error)
    }

    fn load_blocks(&self) -> Result<Vec<SealedBlock>, StorageError> {
        let mut blocks = Vec::new();

        for result in self.blocks.iter() {
            let (key, value) = result?;
            let block = bincode::deserialize::<SealedBlock>(&value).map_err(|e| {
                let height = <[u8; 8]>::try_from(key.as_ref()).map(u64::from_be_bytes);
                warn!("Failed to deserialize block at height {:?}: {}", height, e);
                StorageError::DeserializationError(format!("block {:?}: {}", height, e))
            })?;
            blocks.push(block);
        }

        Ok(blocks)
    }

    fn height(&self) -> Result<u64, StorageError> {
        match self.blocks.last()? {
            Some((key, _)) => Ok(decode_height(&key)? + 1),
            None => Ok(0), // Empty store
        }
    }

    fn truncate(&self, height: u64) -> Result<(), StorageError> {
        let mut stale = Vec::new();
        for result in self.blocks.range(&height.to_be_bytes()[..]..) {
            let (key, _) = result?;
            stale.push(key);
        }

        let tail = match height.checked_sub(1) {
            Some(last) => match self.blocks.get(&last.to_be_bytes()[..])? {
                Some(value) => {
                    let block = bincode::deserialize::<SealedBlock>(&value)
                        .map_err(|e| StorageError::DeserializationError(e.to_string()))?;
                    Some(block.hash().clone())
                }
                None => None,
            },
            None => None,
        };

        (&self.blocks, &self.metadata)
            .transaction(|(blocks, metadata)| {
                for key in &stale {
                    blocks.remove(key.clone())?;
                }
                match &tail {
                    Some(hash) => metadata.insert(TAIL_HASH_KEY, hash.as_bytes())?,
                    None => metadata.remove(TAIL_HASH_KEY)?,
                };
                Ok::<_, ConflictableTransactionError<StorageError>>(())
            })
            .map_err(transaction_error)?;

        debug!("Truncated {} block(s) from height {}", stale.len(), height);
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
