//! Coin (UTXO) database: an in-memory write-back cache layered over
//! persistent per-transaction coin records.
//!
//! Unspent coins live in the cache from the moment their block is stored;
//! the on-disk record written alongside them is the authoritative copy from
//! which spent entries are later pruned. A spent coin stays cached with its
//! spent marker until a flush materializes the removal.

use std::collections::HashMap;
use std::fmt;

use coind_primitives::encoding::{DecodeError, Decoder, Encoder};
use coind_primitives::{hash_to_hex, Block, Hash256, OutPoint, Transaction, TxOut};
use coind_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use tracing::{debug, warn};

use crate::undo::UndoRecord;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coin {
    pub output: TxOut,
    pub is_spent: bool,
}

/// Per-transaction record of outputs that are still unspent on disk.
/// Parallel vectors aligned by position; an empty record is removed from
/// the database entirely.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CoinRecord {
    pub version: u32,
    pub output_indices: Vec<u32>,
    pub amounts: Vec<u32>,
    pub locking_scripts: Vec<Vec<u8>>,
}

impl CoinRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32(1, self.version);
        encoder.write_packed_u32(2, &self.output_indices);
        encoder.write_packed_u32(3, &self.amounts);
        for script in &self.locking_scripts {
            encoder.write_element(4, script);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let mut record = CoinRecord::default();
        while let Some((field, value)) = decoder.next_field()? {
            match field {
                1 => record.version = value.as_u32()?,
                2 => record.output_indices = value.as_packed_u32()?,
                3 => record.amounts = value.as_packed_u32()?,
                4 => record.locking_scripts.push(value.as_bytes()?.to_vec()),
                _ => return Err(DecodeError::Misaligned("unknown coin record field")),
            }
        }
        let len = record.output_indices.len();
        if record.amounts.len() != len || record.locking_scripts.len() != len {
            return Err(DecodeError::Misaligned("coin record arrays disagree"));
        }
        Ok(record)
    }

    pub fn is_empty(&self) -> bool {
        self.output_indices.is_empty()
    }

    fn position_of(&self, output_index: u32) -> Option<usize> {
        self.output_indices
            .iter()
            .position(|index| *index == output_index)
    }

    fn push(&mut self, output_index: u32, amount: u32, locking_script: Vec<u8>) {
        self.output_indices.push(output_index);
        self.amounts.push(amount);
        self.locking_scripts.push(locking_script);
    }

    fn remove(&mut self, output_index: u32) {
        let Some(position) = self.position_of(output_index) else {
            return;
        };
        self.output_indices.remove(position);
        self.amounts.remove(position);
        self.locking_scripts.remove(position);
    }
}

#[derive(Debug)]
pub enum CoinDbError {
    AlreadySpent(OutPoint),
    MissingRecord(Hash256),
    MissingOutput(OutPoint),
    Store(StoreError),
}

impl fmt::Display for CoinDbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoinDbError::AlreadySpent(outpoint) => write!(
                f,
                "coin already spent: {}:{}",
                hash_to_hex(&outpoint.txid),
                outpoint.index
            ),
            CoinDbError::MissingRecord(txid) => {
                write!(f, "no coin record for transaction {}", hash_to_hex(txid))
            }
            CoinDbError::MissingOutput(outpoint) => write!(
                f,
                "coin record has no output {}:{}",
                hash_to_hex(&outpoint.txid),
                outpoint.index
            ),
            CoinDbError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for CoinDbError {}

impl From<StoreError> for CoinDbError {
    fn from(err: StoreError) -> Self {
        CoinDbError::Store(err)
    }
}

pub struct CoinDatabase<S> {
    store: S,
    main_cache: HashMap<OutPoint, Coin>,
    main_cache_size: u32,
    main_cache_capacity: u32,
}

impl<S: KeyValueStore> CoinDatabase<S> {
    pub fn new(store: S, main_cache_capacity: u32) -> Self {
        Self {
            store,
            main_cache: HashMap::new(),
            main_cache_size: 0,
            main_cache_capacity,
        }
    }

    /// Whether every input of every transaction resolves to a live coin.
    /// Validation failures are reported as `false`; storage failures
    /// propagate.
    pub fn validate_block(&self, transactions: &[Transaction]) -> Result<bool, StoreError> {
        for tx in transactions {
            if let Err(err) = self.validate_transaction(tx) {
                match err {
                    CoinDbError::Store(err) => return Err(err),
                    other => {
                        debug!(error = %other, "block failed coin validation");
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Checks a single transaction's inputs against the cache and the
    /// persistent records, reporting the first failure.
    pub fn validate_transaction(&self, tx: &Transaction) -> Result<(), CoinDbError> {
        for input in &tx.inputs {
            let outpoint = OutPoint::new(input.prev_txid, input.output_index);
            if let Some(coin) = self.main_cache.get(&outpoint) {
                if coin.is_spent {
                    return Err(CoinDbError::AlreadySpent(outpoint));
                }
                continue;
            }
            let record = self
                .record(&input.prev_txid)?
                .ok_or(CoinDbError::MissingRecord(input.prev_txid))?;
            if record.position_of(input.output_index).is_none() {
                return Err(CoinDbError::MissingOutput(outpoint));
            }
        }
        Ok(())
    }

    /// Applies an accepted block: marks its inputs spent, caches its new
    /// outputs, and persists a coin record per transaction.
    pub fn store_block(&mut self, transactions: &[Transaction]) -> Result<(), StoreError> {
        self.update_spent_coins(transactions)?;
        self.store_outputs_in_main_cache(transactions)?;
        self.store_records(transactions)
    }

    fn update_spent_coins(&mut self, transactions: &[Transaction]) -> Result<(), StoreError> {
        for tx in transactions {
            for input in &tx.inputs {
                let outpoint = OutPoint::new(input.prev_txid, input.output_index);
                if let Some(coin) = self.main_cache.get_mut(&outpoint) {
                    coin.is_spent = true;
                } else {
                    // not cached, so the record slot is the only copy left
                    self.remove_coin_from_record(&input.prev_txid, input.output_index)?;
                }
            }
        }
        Ok(())
    }

    fn remove_coin_from_record(&self, txid: &Hash256, output_index: u32) -> Result<(), StoreError> {
        let Some(mut record) = self.record(txid)? else {
            return Ok(());
        };
        if record.amounts.len() <= 1 {
            return self.store.delete(Column::Coins, txid);
        }
        record.remove(output_index);
        self.store.put(Column::Coins, txid, &record.encode())
    }

    fn store_outputs_in_main_cache(&mut self, transactions: &[Transaction]) -> Result<(), StoreError> {
        for tx in transactions {
            let txid = tx.txid();
            let created = tx.outputs.len() as u32;
            for (index, output) in tx.outputs.iter().enumerate() {
                if self.main_cache_size + created >= self.main_cache_capacity {
                    self.flush_main_cache()?;
                }
                let outpoint = OutPoint::new(txid, index as u32);
                let coin = Coin {
                    output: output.clone(),
                    is_spent: false,
                };
                if self.main_cache.insert(outpoint, coin).is_none() {
                    self.main_cache_size += 1;
                }
            }
        }
        Ok(())
    }

    fn store_records(&self, transactions: &[Transaction]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        for tx in transactions {
            let mut record = CoinRecord::default();
            for (index, output) in tx.outputs.iter().enumerate() {
                record.push(index as u32, output.amount, output.locking_script.clone());
            }
            batch.put(Column::Coins, tx.txid(), record.encode());
        }
        self.store.write_batch(&batch)
    }

    /// Persists pending spend decisions and evicts the spent entries.
    /// Unspent entries stay authoritative in the cache, so the size counter
    /// keeps counting them.
    pub fn flush_main_cache(&mut self) -> Result<(), StoreError> {
        let spent: Vec<OutPoint> = self
            .main_cache
            .iter()
            .filter(|(_, coin)| coin.is_spent)
            .map(|(outpoint, _)| *outpoint)
            .collect();
        // coalesce per transaction so several spends against one record
        // read it once
        let mut updated: HashMap<Hash256, CoinRecord> = HashMap::new();
        for outpoint in spent {
            let mut record = match updated.remove(&outpoint.txid) {
                Some(record) => record,
                None => match self.record(&outpoint.txid)? {
                    Some(record) => record,
                    None => {
                        debug!(
                            txid = %hash_to_hex(&outpoint.txid),
                            "spent coin has no persistent record"
                        );
                        CoinRecord::default()
                    }
                },
            };
            record.remove(outpoint.index);
            updated.insert(outpoint.txid, record);
            self.main_cache.remove(&outpoint);
        }
        self.main_cache_size = self.main_cache.len() as u32;
        let mut batch = WriteBatch::new();
        for (txid, record) in updated {
            if record.is_empty() {
                batch.delete(Column::Coins, txid);
            } else {
                batch.put(Column::Coins, txid, record.encode());
            }
        }
        if !batch.is_empty() {
            self.store.write_batch(&batch)?;
        }
        Ok(())
    }

    /// Reverts block/undo pairs, given tip-first: erases the coins and
    /// records each block created, then re-establishes the coins its undo
    /// record captured.
    pub fn undo_coins(
        &mut self,
        blocks: &[Block],
        undo_records: &[UndoRecord],
    ) -> Result<(), StoreError> {
        for (block, undo) in blocks.iter().zip(undo_records) {
            for tx in &block.transactions {
                let txid = tx.txid();
                for index in 0..tx.outputs.len() as u32 {
                    if self
                        .main_cache
                        .remove(&OutPoint::new(txid, index))
                        .is_some()
                    {
                        self.main_cache_size = self.main_cache_size.saturating_sub(1);
                    }
                }
                self.store.delete(Column::Coins, &txid)?;
            }
            for slot in 0..undo.len() {
                let txid = undo.prev_txids[slot];
                let outpoint = OutPoint::new(txid, undo.output_indices[slot]);
                if let Some(coin) = self.main_cache.get_mut(&outpoint) {
                    coin.is_spent = false;
                }
                let record = match self.record(&txid)? {
                    Some(mut record) => {
                        // the slot is still present when the spend never
                        // flushed; only re-add what the flush pruned
                        if record.position_of(undo.output_indices[slot]).is_none() {
                            record.push(
                                undo.output_indices[slot],
                                undo.amounts[slot],
                                undo.locking_scripts[slot].clone(),
                            );
                        }
                        record
                    }
                    None => CoinRecord {
                        version: 0,
                        output_indices: undo.output_indices.clone(),
                        amounts: undo.amounts.clone(),
                        locking_scripts: undo.locking_scripts.clone(),
                    },
                };
                self.store.put(Column::Coins, &txid, &record.encode())?;
            }
        }
        Ok(())
    }

    /// Cache first, then the persistent record. A record that exists but
    /// lacks the output index means the coin is gone.
    pub fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        if let Some(coin) = self.main_cache.get(outpoint) {
            return Ok(Some(coin.clone()));
        }
        let Some(record) = self.record(&outpoint.txid)? else {
            return Ok(None);
        };
        let Some(position) = record.position_of(outpoint.index) else {
            return Ok(None);
        };
        Ok(Some(Coin {
            output: TxOut {
                amount: record.amounts[position],
                locking_script: record.locking_scripts[position].clone(),
            },
            is_spent: false,
        }))
    }

    /// Sums every persisted coin locked to `public_key`. Forces a flush so
    /// pending spends are settled before the scan.
    pub fn get_balance(&mut self, public_key: &[u8]) -> Result<u32, StoreError> {
        self.flush_main_cache()?;
        let mut balance = 0u32;
        let mut visitor = |key: &[u8], value: &[u8]| -> Result<(), StoreError> {
            let record = match CoinRecord::decode(value) {
                Ok(record) => record,
                Err(err) => {
                    warn!(
                        txid = %hex::encode(key),
                        error = %err,
                        "skipping corrupt coin record in balance scan"
                    );
                    return Ok(());
                }
            };
            for (position, script) in record.locking_scripts.iter().enumerate() {
                if script.as_slice() == public_key {
                    balance = balance.saturating_add(record.amounts[position]);
                }
            }
            Ok(())
        };
        self.store.for_each_prefix(Column::Coins, &[], &mut visitor)?;
        Ok(balance)
    }

    pub fn close(&mut self) -> Result<(), StoreError> {
        self.flush_main_cache()?;
        self.store.sync()
    }

    fn record(&self, txid: &Hash256) -> Result<Option<CoinRecord>, StoreError> {
        let Some(bytes) = self.store.get(Column::Coins, txid)? else {
            return Ok(None);
        };
        match CoinRecord::decode(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                // conservative default: a record this engine cannot read is
                // treated as absent
                warn!(txid = %hash_to_hex(txid), error = %err, "corrupt coin record");
                Ok(None)
            }
        }
    }
}
