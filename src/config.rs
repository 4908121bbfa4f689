// Configuration
//
// Settings are read from the process environment, with `.env` files picked
// up through dotenvy. Parsing works over any variable lookup so it can be
// exercised without touching the real environment.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blockchain::pow::MineOptions;

pub const DIFFICULTY_VAR: &str = "POWCHAIN_DIFFICULTY";
pub const MAX_ITERATIONS_VAR: &str = "POWCHAIN_MAX_ITERATIONS";
pub const WORKERS_VAR: &str = "POWCHAIN_WORKERS";
pub const DATA_DIR_VAR: &str = "POWCHAIN_DATA_DIR";

/// Difficulty used when none is configured
pub const DEFAULT_DIFFICULTY: u32 = 10;

/// Errors that can occur while loading configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Parameters for mining blocks on a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiningConfig {
    /// Required number of leading zero bits in every block hash
    pub difficulty: u32,

    /// Upper bound on nonces tried per block
    pub max_iterations: Option<u64>,

    /// Threads sharing the nonce search
    pub workers: usize,
}

impl Default for MiningConfig {
    fn default() -> Self {
        MiningConfig {
            difficulty: DEFAULT_DIFFICULTY,
            max_iterations: None,
            workers: 1,
        }
    }
}

impl MiningConfig {
    pub fn with_difficulty(difficulty: u32) -> Self {
        MiningConfig {
            difficulty,
            ..Self::default()
        }
    }

    /// Mining options carrying this config's cap and worker count
    pub fn mine_options(&self) -> MineOptions<'static> {
        MineOptions::new()
            .with_max_iterations(self.max_iterations)
            .with_workers(self.workers)
    }
}

/// Top-level configuration for the binary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub mining: MiningConfig,

    /// Directory for the sled database; in-memory when absent
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Loads `.env` (if present) and reads the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds a config from `lookup`, falling back to defaults for unset
    /// variables. Set but malformed values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = MiningConfig::default();

        let difficulty = parse_var(&lookup, DIFFICULTY_VAR)?.unwrap_or(defaults.difficulty);
        let max_iterations = parse_var(&lookup, MAX_ITERATIONS_VAR)?;
        let workers = parse_var::<usize, _>(&lookup, WORKERS_VAR)?.unwrap_or(defaults.workers);

        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                var: WORKERS_VAR,
                value: "0".to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }

        let data_dir = lookup(DATA_DIR_VAR)
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        Ok(Config {
            mining: MiningConfig {
                difficulty,
                max_iterations,
                workers,
            },
            data_dir,
        })
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => match value.trim().parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => Err(ConfigError::InvalidValue {
                var,
                value,
                reason: e.to_string(),
            }),
        },
    }
}
