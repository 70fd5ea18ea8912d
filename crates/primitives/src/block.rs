use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::{sha256, Hash256, ZERO_HASH};
use crate::transaction::Transaction;

/// Block header. The block's hash is the hash of the header's canonical
/// encoding; the header commits to the transactions through the Merkle
/// root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Header {
    pub version: u32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub difficulty_target: Vec<u8>,
    pub nonce: u32,
    pub timestamp: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Header {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32(1, self.version);
        encoder.write_hash(2, &self.prev_hash);
        encoder.write_hash(3, &self.merkle_root);
        encoder.write_bytes(4, &self.difficulty_target);
        encoder.write_u32(5, self.nonce);
        encoder.write_u32(6, self.timestamp);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let mut version = 0;
        let mut prev_hash = ZERO_HASH;
        let mut merkle_root = ZERO_HASH;
        let mut difficulty_target = Vec::new();
        let mut nonce = 0;
        let mut timestamp = 0;
        while let Some((field, value)) = decoder.next_field()? {
            match field {
                1 => version = value.as_u32()?,
                2 => prev_hash = value.as_hash()?,
                3 => merkle_root = value.as_hash()?,
                4 => difficulty_target = value.as_bytes()?.to_vec(),
                5 => nonce = value.as_u32()?,
                6 => timestamp = value.as_u32()?,
                _ => return Err(DecodeError::Misaligned("unknown header field")),
            }
        }
        Ok(Self {
            version,
            prev_hash,
            merkle_root,
            difficulty_target,
            nonce,
            timestamp,
        })
    }

    pub fn hash(&self) -> Hash256 {
        sha256(&self.encode())
    }
}

impl Block {
    /// Builds a block over `transactions`, committing to them through the
    /// Merkle root.
    pub fn new(prev_hash: Hash256, transactions: Vec<Transaction>, difficulty_target: Vec<u8>) -> Self {
        let root = merkle_root(&transactions);
        Self {
            header: Header {
                version: 0,
                prev_hash,
                merkle_root: root,
                difficulty_target,
                nonce: 0,
                timestamp: 0,
            },
            transactions,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_element(1, &self.header.encode());
        for tx in &self.transactions {
            encoder.write_element(2, &tx.encode());
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let mut header = None;
        let mut transactions = Vec::new();
        while let Some((field, value)) = decoder.next_field()? {
            match field {
                1 => header = Some(Header::decode(value.as_bytes()?)?),
                2 => transactions.push(Transaction::decode(value.as_bytes()?)?),
                _ => return Err(DecodeError::Misaligned("unknown block field")),
            }
        }
        Ok(Self {
            header: header.ok_or(DecodeError::Misaligned("block missing header"))?,
            transactions,
        })
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn size(&self) -> u32 {
        self.encode().len() as u32
    }
}

/// Merkle root over the transactions' txids, duplicating the last entry of
/// every odd level. A single-transaction block's root is that
/// transaction's txid.
pub fn merkle_root(transactions: &[Transaction]) -> Hash256 {
    let mut hashes: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
    if hashes.is_empty() {
        return ZERO_HASH;
    }
    while hashes.len() > 1 {
        if hashes.len() % 2 != 0 {
            let last = hashes[hashes.len() - 1];
            hashes.push(last);
        }
        let mut next = Vec::with_capacity(hashes.len() / 2);
        for pair in hashes.chunks_exact(2) {
            let mut concat = [0u8; 64];
            concat[..32].copy_from_slice(&pair[0]);
            concat[32..].copy_from_slice(&pair[1]);
            next.push(sha256(&concat));
        }
        hashes = next;
    }
    hashes[0]
}
