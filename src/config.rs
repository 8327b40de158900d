pub use config::Config;
use std::error::Error;
use std::path::{Path, PathBuf};

use crate::types::{BlockStoragePolicy, ChainKind};

/// Typed view of the settings the core needs
#[derive(Clone, Debug)]
pub struct CoreConfig {
    pub datadir: PathBuf,
    pub chain: ChainKind,
    /// Dotted-quad seed node; empty disables outbound connections
    pub seed_node: String,
    pub target_peer_count: usize,
    pub block_policy: BlockStoragePolicy,
}

impl CoreConfig {
    /// Read a config file from disk and extract the core settings
    pub fn load(path: &Path) -> Result<CoreConfig, Box<dyn Error>> {
        let config = Config::builder()
            .add_source(config::File::from(path))
            .build()?;
        CoreConfig::from_config(&config)
    }

    pub fn from_config(config: &Config) -> Result<CoreConfig, Box<dyn Error>> {
        let datadir = config
            .get_string("paths.datadir")
            .map_err(|e| format!("Missing paths.datadir in config: {}", e))?;

        let chain_name = config
            .get_string("node.chain")
            .unwrap_or_else(|_| "bitcoin".to_string());
        let chain = parse_chain(&chain_name)
            .ok_or_else(|| format!("Unknown chain in config: {}", chain_name))?;

        let seed_node = config.get_string("node.seed_node").unwrap_or_default();

        let target_peer_count = config
            .get_int("node.target_peer_count")
            .unwrap_or(2)
            .max(0) as usize;

        let policy_name = config
            .get_string("node.block_storage")
            .unwrap_or_else(|_| "cache".to_string());
        let block_policy = parse_block_policy(&policy_name)
            .ok_or_else(|| format!("Unknown block storage policy: {}", policy_name))?;

        Ok(CoreConfig {
            datadir: PathBuf::from(datadir),
            chain,
            seed_node,
            target_peer_count,
            block_policy,
        })
    }
}

pub fn parse_chain(name: &str) -> Option<ChainKind> {
    match name {
        "bitcoin" | "mainnet" => Some(ChainKind::Bitcoin),
        "bitcoin-testnet3" | "testnet3" => Some(ChainKind::BitcoinTestnet3),
        "bitcoincash" | "bch" => Some(ChainKind::BitcoinCash),
        "bitcoincash-testnet3" | "bch-testnet3" => Some(ChainKind::BitcoinCashTestnet3),
        "unittest" | "regtest" => Some(ChainKind::UnitTest),
        _ => None,
    }
}

pub fn parse_block_policy(name: &str) -> Option<BlockStoragePolicy> {
    match name {
        "none" => Some(BlockStoragePolicy::None),
        "cache" => Some(BlockStoragePolicy::Cache),
        "all" => Some(BlockStoragePolicy::All),
        _ => None,
    }
}
