//! Core block/transaction types and canonical serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod transaction;

pub use block::{merkle_root, Block, Header};
pub use hash::{hash_from_hex, hash_to_hex, sha256, Hash256, ZERO_HASH};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
