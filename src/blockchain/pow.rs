use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, info, trace};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::hash::{self, BlockHash};

/// How many nonces a worker tries between cancellation checks
pub const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Errors that can occur while mining or configuring proof-of-work
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PowError {
    #[error("Invalid difficulty: {difficulty} (must be below {hash_bits})")]
    InvalidDifficulty { difficulty: u32, hash_bits: u32 },

    #[error("Search space exhausted after {attempts} nonces")]
    ExhaustedSearchSpace { attempts: u64 },

    #[error("Mining cancelled")]
    Cancelled,
}

/// The threshold a block hash must fall strictly below.
///
/// Derived as `1 << (HASH_BITS - difficulty)`. At difficulty zero the target
/// is `1 << HASH_BITS`, which does not fit in the digest width, so it is kept
/// as an unbounded marker that every hash satisfies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Big-endian threshold, `None` when every hash qualifies
    threshold: Option<Vec<u8>>,
}

impl Target {
    /// Derives the target for `difficulty` leading zero bits
    ///
    /// # Arguments
    ///
    /// * `difficulty` - Required number of leading zero bits
    /// * `hash_bits` - Bit width of the digest
    ///
    /// # Returns
    ///
    /// `InvalidDifficulty` unless `difficulty < hash_bits`
    pub fn from_difficulty(difficulty: u32, hash_bits: u32) -> Result<Self, PowError> {
        if difficulty >= hash_bits {
            return Err(PowError::InvalidDifficulty { difficulty, hash_bits });
        }

        if difficulty == 0 {
            return Ok(Target { threshold: None });
        }

        let width = (hash_bits / 8) as usize;
        let shift = hash_bits - difficulty;
        let mut threshold = vec![0u8; width];
        threshold[width - 1 - (shift / 8) as usize] = 1 << (shift % 8);

        Ok(Target {
            threshold: Some(threshold),
        })
    }

    /// Whether `hash`, read as a big-endian unsigned integer, is strictly
    /// below the target
    ///
    /// # Arguments
    ///
    /// * `hash` - Digest bytes of the same width the target was derived for
    pub fn is_met_by(&self, hash: &[u8]) -> bool {
        match &self.threshold {
            None => true,
            // Equal-length big-endian byte strings order the same as the
            // integers they encode.
            Some(threshold) => hash.len() == threshold.len() && hash < threshold.as_slice(),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.threshold.is_none()
    }

    pub fn to_hex(&self) -> String {
        match &self.threshold {
            Some(threshold) => hex::encode(threshold),
            None => "unbounded".to_string(),
        }
    }
}

/// A shared flag that stops an in-flight mining search
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Callback invoked with every nonce tried and the hash it produced
pub type ProgressFn<'a> = &'a (dyn Fn(u64, &BlockHash) + Sync);

/// Knobs for a single mining run
#[derive(Clone, Default)]
pub struct MineOptions<'a> {
    /// Size of the nonce range `[0, max_iterations)` to search
    pub max_iterations: Option<u64>,

    /// Number of threads sharing the nonce range; zero and one both mean a
    /// single sequential search
    pub workers: usize,

    pub cancel: Option<CancellationToken>,

    pub progress: Option<ProgressFn<'a>>,
}

impl<'a> MineOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: Option<u64>) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn<'a>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, CancellationToken::is_cancelled)
    }

    fn report(&self, nonce: u64, hash: &BlockHash) {
        if let Some(progress) = self.progress {
            progress(nonce, hash);
        }
    }
}

/// A winning nonce and the hash it produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    pub nonce: u64,
    pub hash: BlockHash,
}

/// Proof-of-work over one block's contents.
///
/// Borrows the block's predecessor hash and payload for the duration of a
/// mining or validation call. The digest algorithm is a type parameter so any
/// fixed-width `Digest` can be substituted.
pub struct ProofOfWork<'a, D = Sha256> {
    prev_hash: &'a BlockHash,
    data: &'a [u8],
    difficulty: u32,
    target: Target,
    _digest: PhantomData<fn() -> D>,
}

impl<'a, D: Digest> ProofOfWork<'a, D> {
    /// Binds the engine to a block's contents at the given difficulty
    ///
    /// # Errors
    ///
    /// `InvalidDifficulty` if `difficulty` is not below the digest's bit width
    pub fn new(prev_hash: &'a BlockHash, data: &'a [u8], difficulty: u32) -> Result<Self, PowError> {
        let target = Target::from_difficulty(difficulty, hash::hash_bits::<D>())?;

        Ok(ProofOfWork {
            prev_hash,
            data,
            difficulty,
            target,
            _digest: PhantomData,
        })
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Serializes the block contents with `nonce` for hashing.
    ///
    /// Layout: `prev_hash || data || nonce (u64 BE) || difficulty (u64 BE)`.
    /// The two trailing fields occupy separate 8-byte slots.
    pub fn compute_candidate(&self, nonce: u64) -> Vec<u8> {
        let mut candidate = Vec::with_capacity(self.prev_hash.len() + self.data.len() + 16);
        candidate.extend_from_slice(self.prev_hash.as_bytes());
        candidate.extend_from_slice(self.data);
        candidate.extend_from_slice(&nonce.to_be_bytes());
        candidate.extend_from_slice(&u64::from(self.difficulty).to_be_bytes());
        candidate
    }

    /// Digest of the candidate for `nonce`
    pub fn hash_nonce(&self, nonce: u64) -> BlockHash {
        hash::digest::<D>(&self.compute_candidate(nonce))
    }

    /// Searches for the lowest nonce whose hash meets the target
    pub fn mine(&self) -> Result<Solution, PowError> {
        self.mine_with(&MineOptions::default())
    }

    /// Searches for the lowest nonce whose hash meets the target, honouring
    /// the iteration cap, cancellation token, worker count and progress
    /// callback in `options`
    ///
    /// # Arguments
    ///
    /// * `options` - Knobs for this run
    ///
    /// # Returns
    ///
    /// The winning nonce and its hash, `ExhaustedSearchSpace` when the cap or
    /// the nonce space runs out first, or `Cancelled`
    pub fn mine_with(&self, options: &MineOptions<'_>) -> Result<Solution, PowError> {
        let workers = options.workers.max(1);

        debug!(
            "Mining at difficulty {} (target {}) with {} worker(s)",
            self.difficulty,
            self.target.to_hex(),
            workers
        );

        let solution = if workers == 1 {
            self.mine_sequential(options)?
        } else {
            self.mine_parallel(options, workers)?
        };

        info!(
            "Found nonce {} with hash {} at difficulty {}",
            solution.nonce, solution.hash, self.difficulty
        );

        Ok(solution)
    }

    /// Whether `nonce` produces a hash below the target. Never mines.
    ///
    /// # Arguments
    ///
    /// * `nonce` - The nonce to check
    pub fn validate(&self, nonce: u64) -> bool {
        self.target.is_met_by(self.hash_nonce(nonce).as_bytes())
    }

    fn mine_sequential(&self, options: &MineOptions<'_>) -> Result<Solution, PowError> {
        let mut nonce: u64 = 0;

        loop {
            if let Some(max) = options.max_iterations {
                if nonce >= max {
                    return Err(PowError::ExhaustedSearchSpace { attempts: max });
                }
            }

            if nonce % CANCEL_CHECK_INTERVAL == 0 && options.is_cancelled() {
                debug!("Mining cancelled at nonce {}", nonce);
                return Err(PowError::Cancelled);
            }

            let hash = self.hash_nonce(nonce);
            options.report(nonce, &hash);

            if self.target.is_met_by(hash.as_bytes()) {
                return Ok(Solution { nonce, hash });
            }

            nonce = match nonce.checked_add(1) {
                Some(next) => next,
                None => return Err(PowError::ExhaustedSearchSpace { attempts: u64::MAX }),
            };
        }
    }

    /// Shards the nonce range by stride across scoped threads.
    ///
    /// Worker `w` tries `w, w + W, w + 2W, ...`. Finds are folded into an
    /// atomic minimum and a worker keeps going until its next nonce passes the
    /// current best, so every nonce below the winner has been ruled out and
    /// the result matches the sequential search.
    fn mine_parallel(&self, options: &MineOptions<'_>, workers: usize) -> Result<Solution, PowError> {
        let limit = options.max_iterations.unwrap_or(u64::MAX);
        let best = AtomicU64::new(u64::MAX);
        let cancelled = AtomicBool::new(false);
        let stride = workers as u64;

        thread::scope(|scope| {
            for worker in 0..stride {
                let best = &best;
                let cancelled = &cancelled;
                scope.spawn(move || {
                    self.search_stride(worker, stride, limit, options, best, cancelled)
                });
            }
        });

        if cancelled.into_inner() {
            return Err(PowError::Cancelled);
        }

        match best.into_inner() {
            u64::MAX => Err(PowError::ExhaustedSearchSpace { attempts: limit }),
            nonce => Ok(Solution {
                nonce,
                hash: self.hash_nonce(nonce),
            }),
        }
    }

    fn search_stride(
        &self,
        start: u64,
        stride: u64,
        limit: u64,
        options: &MineOptions<'_>,
        best: &AtomicU64,
        cancelled: &AtomicBool,
    ) {
        let mut nonce = start;
        let mut tried: u64 = 0;

        while nonce < limit && nonce < best.load(Ordering::Relaxed) {
            if tried % CANCEL_CHECK_INTERVAL == 0 && options.is_cancelled() {
                cancelled.store(true, Ordering::Relaxed);
                return;
            }

            let hash = self.hash_nonce(nonce);
            options.report(nonce, &hash);

            if self.target.is_met_by(hash.as_bytes()) {
                trace!("Worker {} found nonce {}", start, nonce);
                best.fetch_min(nonce, Ordering::Relaxed);
                return;
            }

            tried += 1;
            nonce = match nonce.checked_add(stride) {
                Some(next) => next,
                None => return,
            };
        }
    }
}
