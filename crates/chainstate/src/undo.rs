//! Undo records: the coins a block spent, captured so the UTXO set can be
//! restored when that block is disconnected during a reorganization.

use coind_primitives::encoding::{DecodeError, Decoder, Encoder};
use coind_primitives::Hash256;

/// Parallel vectors, one slot per input of the recorded block: the
/// referenced transaction, the output index, and the output's value and
/// locking script at the time it was spent.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UndoRecord {
    pub prev_txids: Vec<Hash256>,
    pub output_indices: Vec<u32>,
    pub amounts: Vec<u32>,
    pub locking_scripts: Vec<Vec<u8>>,
}

impl UndoRecord {
    pub fn push(&mut self, prev_txid: Hash256, output_index: u32, amount: u32, locking_script: Vec<u8>) {
        self.prev_txids.push(prev_txid);
        self.output_indices.push(output_index);
        self.amounts.push(amount);
        self.locking_scripts.push(locking_script);
    }

    pub fn len(&self) -> usize {
        self.prev_txids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prev_txids.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        for txid in &self.prev_txids {
            encoder.write_element(1, txid);
        }
        encoder.write_packed_u32(2, &self.output_indices);
        encoder.write_packed_u32(3, &self.amounts);
        for script in &self.locking_scripts {
            encoder.write_element(4, script);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let mut record = UndoRecord::default();
        while let Some((field, value)) = decoder.next_field()? {
            match field {
                1 => record.prev_txids.push(value.as_hash()?),
                2 => record.output_indices = value.as_packed_u32()?,
                3 => record.amounts = value.as_packed_u32()?,
                4 => record.locking_scripts.push(value.as_bytes()?.to_vec()),
                _ => return Err(DecodeError::Misaligned("unknown undo record field")),
            }
        }
        let len = record.prev_txids.len();
        if record.output_indices.len() != len
            || record.amounts.len() != len
            || record.locking_scripts.len() != len
        {
            return Err(DecodeError::Misaligned("undo record arrays disagree"));
        }
        Ok(record)
    }
}
