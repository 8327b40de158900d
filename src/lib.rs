pub mod address_book;
pub mod block_oracle;
pub mod blockstore;
pub mod chainwork;
pub mod config;
pub mod constants;
pub mod database;
pub mod filter_db;
pub mod filter_sync;
pub mod gcs;
pub mod header_db;
pub mod header_oracle;
pub mod header_update;
pub mod messages;
pub mod node;
pub mod peer;
pub mod peer_manager;
pub mod reorg;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod wire;


pub use crate::config::CoreConfig;
pub use crate::database::{Database, DatabaseConfig};
pub use crate::header_oracle::HeaderOracle;
pub use crate::node::Node;
pub use crate::types::{BlockHash, BlockHeader, ChainKind, Hash, Height, Position};
