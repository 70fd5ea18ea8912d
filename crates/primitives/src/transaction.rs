use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::{sha256, Hash256, ZERO_HASH};

/// Spends a previously created output and carries the proof of authority
/// to do so.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prev_txid: Hash256,
    pub output_index: u32,
    pub unlocking_script: Vec<u8>,
}

/// An unconditional claim of `amount`, redeemable by whoever can satisfy
/// the locking script.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub amount: u32,
    pub locking_script: Vec<u8>,
}

/// A transaction with no inputs is a coinbase: the block reward, and the
/// only way new coins enter circulation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl TxIn {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_hash(1, &self.prev_txid);
        encoder.write_u32(2, self.output_index);
        encoder.write_bytes(3, &self.unlocking_script);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let mut prev_txid = ZERO_HASH;
        let mut output_index = 0;
        let mut unlocking_script = Vec::new();
        while let Some((field, value)) = decoder.next_field()? {
            match field {
                1 => prev_txid = value.as_hash()?,
                2 => output_index = value.as_u32()?,
                3 => unlocking_script = value.as_bytes()?.to_vec(),
                _ => return Err(DecodeError::Misaligned("unknown input field")),
            }
        }
        Ok(Self {
            prev_txid,
            output_index,
            unlocking_script,
        })
    }
}

impl TxOut {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32(1, self.amount);
        encoder.write_bytes(2, &self.locking_script);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let mut amount = 0;
        let mut locking_script = Vec::new();
        while let Some((field, value)) = decoder.next_field()? {
            match field {
                1 => amount = value.as_u32()?,
                2 => locking_script = value.as_bytes()?.to_vec(),
                _ => return Err(DecodeError::Misaligned("unknown output field")),
            }
        }
        Ok(Self {
            amount,
            locking_script,
        })
    }
}

impl Transaction {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32(1, self.version);
        for input in &self.inputs {
            encoder.write_element(2, &input.encode());
        }
        for output in &self.outputs {
            encoder.write_element(3, &output.encode());
        }
        encoder.write_u32(4, self.lock_time);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let mut version = 0;
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let mut lock_time = 0;
        while let Some((field, value)) = decoder.next_field()? {
            match field {
                1 => version = value.as_u32()?,
                2 => inputs.push(TxIn::decode(value.as_bytes()?)?),
                3 => outputs.push(TxOut::decode(value.as_bytes()?)?),
                4 => lock_time = value.as_u32()?,
                _ => return Err(DecodeError::Misaligned("unknown transaction field")),
            }
        }
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    /// Hash over the canonical encoding.
    pub fn txid(&self) -> Hash256 {
        sha256(&self.encode())
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn sum_outputs(&self) -> u32 {
        self.outputs
            .iter()
            .fold(0u32, |sum, output| sum.saturating_add(output.amount))
    }

    pub fn size(&self) -> u32 {
        self.encode().len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prev_txid: [0x11; 32],
                output_index: 3,
                unlocking_script: b"sig".to_vec(),
            }],
            outputs: vec![
                TxOut {
                    amount: 40,
                    locking_script: b"alice".to_vec(),
                },
                TxOut {
                    amount: 9,
                    locking_script: b"bob".to_vec(),
                },
            ],
            lock_time: 0,
        }
    }

    #[test]
    fn transaction_round_trip() {
        let tx = sample_tx();
        let decoded = Transaction::decode(&tx.encode()).expect("decode");
        assert_eq!(decoded, tx);
    }

    #[test]
    fn coinbase_round_trip_and_flags() {
        let coinbase = Transaction {
            version: 0,
            inputs: Vec::new(),
            outputs: vec![TxOut {
                amount: 50,
                locking_script: b"PK".to_vec(),
            }],
            lock_time: 0,
        };
        assert!(coinbase.is_coinbase());
        assert_eq!(coinbase.sum_outputs(), 50);
        let decoded = Transaction::decode(&coinbase.encode()).expect("decode");
        assert_eq!(decoded, coinbase);
        assert!(!sample_tx().is_coinbase());
    }

    #[test]
    fn txid_is_stable_across_round_trip() {
        let tx = sample_tx();
        let decoded = Transaction::decode(&tx.encode()).expect("decode");
        assert_eq!(decoded.txid(), tx.txid());
    }

    #[test]
    fn empty_output_script_round_trips() {
        let tx = Transaction {
            version: 0,
            inputs: Vec::new(),
            outputs: vec![TxOut {
                amount: 1,
                locking_script: Vec::new(),
            }],
            lock_time: 0,
        };
        let decoded = Transaction::decode(&tx.encode()).expect("decode");
        assert_eq!(decoded, tx);
    }
}
