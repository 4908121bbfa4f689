use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};
use serde::Serialize;

use powchain::blockchain::{Chain, SealedBlock, SledStore};
use powchain::config::Config;

/// Printable view of a sealed block
#[derive(Serialize)]
struct BlockSummary {
    index: usize,
    data: String,
    prev_hash: String,
    hash: String,
    nonce: u64,
    difficulty: u32,
}

impl BlockSummary {
    fn new(index: usize, block: &SealedBlock) -> Self {
        BlockSummary {
            index,
            data: String::from_utf8_lossy(block.data()).into_owned(),
            prev_hash: block.prev_hash().to_hex(),
            hash: block.hash().to_hex(),
            nonce: block.nonce(),
            difficulty: block.difficulty(),
        }
    }
}

// Open the chain from storage when a data directory is configured, falling
// back to an in-memory chain
fn initialize_chain(config: &Config) -> anyhow::Result<Chain> {
    let data_dir = match &config.data_dir {
        Some(data_dir) => data_dir,
        None => return Ok(Chain::new(config.mining.clone())?),
    };

    std::fs::create_dir_all(data_dir).unwrap_or_else(|e| {
        warn!("Failed to create data directory: {}", e);
    });

    match SledStore::open(data_dir) {
        Ok(store) => {
            let chain = Chain::open(config.mining.clone(), Arc::new(store))
                .with_context(|| format!("loading chain from {}", data_dir.display()))?;
            info!("Opened chain at {} with {} blocks", data_dir.display(), chain.len());
            Ok(chain)
        }
        Err(err) => {
            warn!("Failed to open storage: {}", err);
            warn!("Creating in-memory chain instead");
            Ok(Chain::new(config.mining.clone())?)
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Config::from_env().context("reading configuration")?;
    info!(
        "Starting with difficulty {} and {} worker(s)",
        config.mining.difficulty, config.mining.workers
    );

    let chain = initialize_chain(&config)?;

    for data in std::env::args().skip(1) {
        chain
            .append(data.as_bytes())
            .with_context(|| format!("appending {:?}", data))?;
    }

    for (index, block) in chain.blocks().iter().enumerate() {
        println!("{}", serde_json::to_string(&BlockSummary::new(index, block))?);
    }

    chain.validate().context("validating chain")?;
    info!("Chain of {} blocks is valid", chain.len());

    Ok(())
}
