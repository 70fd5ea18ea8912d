use crate::hash::Hash256;

/// Identifies a single transaction output: the transaction that created it
/// and the output's position within that transaction.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct OutPoint {
    pub txid: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }
}
