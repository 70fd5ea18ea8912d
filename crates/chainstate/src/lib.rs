//! Block storage and state engine: the block-info index, segmented
//! block/undo logs, coin (UTXO) database, and active-chain manager.

pub mod blockindex;
pub mod chain;
pub mod coindb;
pub mod config;
pub mod flatfiles;
pub mod undo;
pub mod validation;

pub use chain::{genesis_block, Blockchain, ChainError, MAX_UNSAFE_HASHES};
pub use config::Config;
