//! Active-chain management: block acceptance, fork detection, and
//! reorganization over the block index, the flat-file logs, and the coin
//! database.

use std::sync::{Mutex, MutexGuard};

use coind_primitives::{hash_to_hex, Block, Hash256, Header, OutPoint, Transaction, TxOut, ZERO_HASH};
use coind_storage::fjall::FjallStore;
use coind_storage::{KeyValueStore, StoreError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::blockindex::{BlockInfoDatabase, BlockRecord};
use crate::coindb::{CoinDatabase, CoinDbError};
use crate::config::Config;
use crate::flatfiles::{FlatFileError, FlatFileStore};
use crate::undo::UndoRecord;
use crate::validation;

/// Depth of the reversible window: only forks rejoining the active chain
/// within this many blocks of the tip can trigger a reorganization.
pub const MAX_UNSAFE_HASHES: usize = 6;

#[derive(Debug)]
pub enum ChainError {
    Store(StoreError),
    FlatFile(FlatFileError),
    Corrupt(&'static str),
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Store(err) => write!(f, "{err}"),
            ChainError::FlatFile(err) => write!(f, "{err}"),
            ChainError::Corrupt(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Store(err)
    }
}

impl From<FlatFileError> for ChainError {
    fn from(err: FlatFileError) -> Self {
        ChainError::FlatFile(err)
    }
}

/// Everything `handle_block` mutates, guarded as one unit so acceptance is
/// a single atomic critical section and every coin-database call is
/// serialized behind the same lock.
struct ChainInner<S> {
    length: u32,
    last_block: Block,
    last_hash: Hash256,
    unsafe_hashes: Vec<Hash256>,
    coin_db: CoinDatabase<S>,
}

pub struct Blockchain<S> {
    max_block_size: u32,
    block_info_db: BlockInfoDatabase<S>,
    files: FlatFileStore,
    confirm_tx: Sender<Block>,
    confirm_rx: Receiver<Block>,
    inner: Mutex<ChainInner<S>>,
}

/// Builds the deterministic genesis block from the configured subsidy and
/// public key. Its header is all defaults; its single transaction is the
/// founding coinbase.
pub fn genesis_block(config: &Config) -> Block {
    let coinbase = Transaction {
        version: 0,
        inputs: Vec::new(),
        outputs: vec![TxOut {
            amount: config.initial_subsidy,
            locking_script: config.genesis_public_key.clone(),
        }],
        lock_time: 0,
    };
    Block {
        header: Header {
            version: 0,
            prev_hash: ZERO_HASH,
            merkle_root: ZERO_HASH,
            difficulty_target: Vec::new(),
            nonce: 0,
            timestamp: 0,
        },
        transactions: vec![coinbase],
    }
}

impl Blockchain<FjallStore> {
    /// Opens the production engine: one LSM keyspace per database at the
    /// configured paths.
    pub fn open(config: &Config) -> Result<Self, ChainError> {
        let block_info_store = FjallStore::open(&config.block_info_db_path)?;
        let coin_store = FjallStore::open(&config.coin_db_path)?;
        Self::new(config, block_info_store, coin_store)
    }
}

impl<S: KeyValueStore> Blockchain<S> {
    /// Builds the chain over the given stores and founds it with the
    /// genesis block: coins stored, body written, record indexed at
    /// height 1.
    pub fn new(config: &Config, block_info_store: S, coin_store: S) -> Result<Self, ChainError> {
        let files = FlatFileStore::open(config)?;
        let block_info_db = BlockInfoDatabase::new(block_info_store);
        let mut coin_db = CoinDatabase::new(coin_store, config.main_cache_capacity);

        let genesis = genesis_block(config);
        let genesis_hash = genesis.hash();
        // found the chain exactly once: reopening an already-founded data
        // directory keeps the persisted genesis (and whatever has happened
        // to its coins since) instead of appending a duplicate body and
        // re-pointing the index at it
        if block_info_db.get(&genesis_hash)?.is_none() {
            coin_db.store_block(&genesis.transactions)?;
            let location = files.write_block(&genesis.encode())?;
            block_info_db.put(
                &genesis_hash,
                &BlockRecord {
                    header: genesis.header.clone(),
                    height: 1,
                    tx_count: genesis.transactions.len() as u32,
                    block: location,
                    // genesis spends nothing, so there is nothing to undo
                    undo: None,
                },
            )?;
        }

        let (confirm_tx, confirm_rx) = unbounded();
        Ok(Self {
            max_block_size: config.max_block_size,
            block_info_db,
            files,
            confirm_tx,
            confirm_rx,
            inner: Mutex::new(ChainInner {
                length: 1,
                last_hash: genesis_hash,
                last_block: genesis,
                unsafe_hashes: vec![genesis_hash],
                coin_db,
            }),
        })
    }

    /// Accepts a block: validates it against the UTXO set when it extends
    /// the tip, persists its body, undo record, and index entry, then
    /// either appends it, retains it off-chain, or reorganizes onto its
    /// fork.
    pub fn handle_block(&self, block: Block) -> Result<(), ChainError> {
        let mut inner = self.lock();
        let block_hash = block.hash();
        let appends = inner.last_hash == block.header.prev_hash;

        if appends && !inner.coin_db.validate_block(&block.transactions)? {
            debug!(hash = %hash_to_hex(&block_hash), "dropping invalid block");
            return Ok(());
        }

        let Some(undo) = make_undo_record(&inner.coin_db, &block.transactions)? else {
            // a block spending coins this chain has never seen cannot sit
            // on any viable fork, so it never reaches the index
            debug!(
                hash = %hash_to_hex(&block_hash),
                "dropping block with unresolvable inputs"
            );
            return Ok(());
        };

        let Some(previous) = self.block_info_db.get(&block.header.prev_hash)? else {
            debug!(hash = %hash_to_hex(&block_hash), "dropping block with unknown parent");
            return Ok(());
        };
        let height = previous.height + 1;

        let location = self.files.write_block(&block.encode())?;
        let undo_location = if undo.is_empty() {
            None
        } else {
            Some(self.files.write_undo(&undo.encode())?)
        };
        self.block_info_db.put(
            &block_hash,
            &BlockRecord {
                header: block.header.clone(),
                height,
                tx_count: block.transactions.len() as u32,
                block: location,
                undo: undo_location,
            },
        )?;

        if appends {
            inner.coin_db.store_block(&block.transactions)?;
            inner.length += 1;
            inner.last_hash = block_hash;
            if inner.unsafe_hashes.len() >= MAX_UNSAFE_HASHES {
                inner.unsafe_hashes.remove(0);
            }
            inner.unsafe_hashes.push(block_hash);
            inner.last_block = block.clone();
            let _ = self.confirm_tx.send(block);
        } else if height > inner.length {
            self.reorganize(&mut inner, block, block_hash, height)?;
        } else {
            debug!(
                hash = %hash_to_hex(&block_hash),
                height,
                "retained block off the active chain"
            );
        }
        Ok(())
    }

    /// Switches the active chain onto the fork ending at `block`. The coin
    /// database is rewound to the fork ancestor and the fork blocks are
    /// replayed one at a time; if any of them fails validation, the
    /// previous tip is restored and the chain fields are left untouched.
    fn reorganize(
        &self,
        inner: &mut ChainInner<S>,
        block: Block,
        block_hash: Hash256,
        height: u32,
    ) -> Result<(), ChainError> {
        let Some(ancestor_hash) = self.find_fork_ancestor(&inner.unsafe_hashes, &block_hash)?
        else {
            debug!(
                hash = %hash_to_hex(&block_hash),
                "fork rejoins beyond the reversible window"
            );
            return Ok(());
        };
        let ancestor = self
            .block_info_db
            .get(&ancestor_hash)?
            .ok_or(ChainError::Corrupt("fork ancestor missing from block index"))?;
        // disconnect exactly the active blocks above the ancestor, leaving
        // the UTXO set at the ancestor state
        let revert_count = inner.length - ancestor.height;

        let (active_blocks, active_undos) = self.collect_from_tip(revert_count, inner.last_hash)?;
        let (fork_blocks, fork_undos) = self.collect_fork(&block_hash, &ancestor_hash)?;

        inner.coin_db.undo_coins(&active_blocks, &active_undos)?;

        let mut applied_blocks: Vec<Block> = Vec::new();
        let mut applied_undos: Vec<UndoRecord> = Vec::new();
        for (fork_block, fork_undo) in fork_blocks.iter().rev().zip(fork_undos.iter().rev()) {
            if !inner.coin_db.validate_block(&fork_block.transactions)? {
                warn!(
                    hash = %hash_to_hex(&fork_block.hash()),
                    "fork block failed validation; restoring previous tip"
                );
                applied_blocks.reverse();
                applied_undos.reverse();
                inner.coin_db.undo_coins(&applied_blocks, &applied_undos)?;
                for active in active_blocks.iter().rev() {
                    inner.coin_db.store_block(&active.transactions)?;
                }
                return Ok(());
            }
            inner.coin_db.store_block(&fork_block.transactions)?;
            applied_blocks.push(fork_block.clone());
            applied_undos.push(fork_undo.clone());
        }

        // the fork is the active chain now; rewrite the reversible window
        while let Some(last) = inner.unsafe_hashes.last() {
            if *last == ancestor_hash {
                break;
            }
            inner.unsafe_hashes.pop();
        }
        for fork_block in fork_blocks.iter().rev() {
            if inner.unsafe_hashes.len() >= MAX_UNSAFE_HASHES {
                inner.unsafe_hashes.remove(0);
            }
            inner.unsafe_hashes.push(fork_block.hash());
        }
        inner.length = height;
        inner.last_hash = block_hash;
        inner.last_block = block.clone();
        let _ = self.confirm_tx.send(block);
        Ok(())
    }

    /// Walks `start`'s parent chain looking for a hash inside the
    /// reversible window. Forks that rejoin deeper than the window are not
    /// eligible for reorganization.
    fn find_fork_ancestor(
        &self,
        unsafe_hashes: &[Hash256],
        start: &Hash256,
    ) -> Result<Option<Hash256>, ChainError> {
        let mut next = *start;
        for _ in 0..=unsafe_hashes.len() {
            if unsafe_hashes.contains(&next) {
                return Ok(Some(next));
            }
            let Some(record) = self.block_info_db.get(&next)? else {
                return Ok(None);
            };
            next = record.header.prev_hash;
        }
        Ok(None)
    }

    /// Gathers `count` block bodies and undo records walking parent-wards
    /// from `from`, tip-first.
    fn collect_from_tip(
        &self,
        count: u32,
        from: Hash256,
    ) -> Result<(Vec<Block>, Vec<UndoRecord>), ChainError> {
        let mut blocks = Vec::new();
        let mut undos = Vec::new();
        let mut next = from;
        for _ in 0..count {
            let record = self
                .block_info_db
                .get(&next)?
                .ok_or(ChainError::Corrupt("active block missing from block index"))?;
            blocks.push(self.read_block(&record)?);
            undos.push(self.read_undo(&record)?);
            next = record.header.prev_hash;
        }
        Ok((blocks, undos))
    }

    /// Gathers the fork's blocks from `from` down to `ancestor`
    /// (exclusive), tip-first.
    fn collect_fork(
        &self,
        from: &Hash256,
        ancestor: &Hash256,
    ) -> Result<(Vec<Block>, Vec<UndoRecord>), ChainError> {
        let mut blocks = Vec::new();
        let mut undos = Vec::new();
        let mut next = *from;
        while next != *ancestor {
            let record = self
                .block_info_db
                .get(&next)?
                .ok_or(ChainError::Corrupt("fork block missing from block index"))?;
            blocks.push(self.read_block(&record)?);
            undos.push(self.read_undo(&record)?);
            next = record.header.prev_hash;
        }
        Ok((blocks, undos))
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        let Some(record) = self.block_info_db.get(hash)? else {
            return Ok(None);
        };
        self.read_block(&record).map(Some)
    }

    pub fn block_info(&self, hash: &Hash256) -> Result<Option<BlockRecord>, ChainError> {
        Ok(self.block_info_db.get(hash)?)
    }

    /// Active-chain blocks with height in `[start, end]`, in height order.
    pub fn get_blocks(&self, start: u32, end: u32) -> Result<Vec<Block>, ChainError> {
        let inner = self.lock();
        if start < 1 || end < start || end > inner.length {
            debug!(start, end, length = inner.length, "rejecting block range");
            return Ok(Vec::new());
        }
        let mut blocks = Vec::new();
        let mut next = inner.last_hash;
        let mut current_height = inner.length;
        while current_height >= start {
            let record = self
                .block_info_db
                .get(&next)?
                .ok_or(ChainError::Corrupt("active block missing from block index"))?;
            if current_height <= end {
                blocks.push(self.read_block(&record)?);
            }
            next = record.header.prev_hash;
            current_height -= 1;
        }
        blocks.reverse();
        Ok(blocks)
    }

    /// Active-chain block hashes with height in `[start, end]`, in height
    /// order.
    pub fn get_hashes(&self, start: u32, end: u32) -> Result<Vec<Hash256>, ChainError> {
        let inner = self.lock();
        if start < 1 || end < start || end > inner.length {
            debug!(start, end, length = inner.length, "rejecting hash range");
            return Ok(Vec::new());
        }
        let mut hashes = Vec::new();
        let mut next = inner.last_hash;
        let mut current_height = inner.length;
        while current_height >= start {
            let record = self
                .block_info_db
                .get(&next)?
                .ok_or(ChainError::Corrupt("active block missing from block index"))?;
            if current_height <= end {
                hashes.push(next);
            }
            next = record.header.prev_hash;
            current_height -= 1;
        }
        hashes.reverse();
        Ok(hashes)
    }

    /// Per-transaction totals of the coins each transaction's inputs
    /// reference; missing coins contribute zero.
    pub fn get_input_sums(&self, transactions: &[Transaction]) -> Result<Vec<u32>, ChainError> {
        let inner = self.lock();
        let mut sums = Vec::with_capacity(transactions.len());
        for tx in transactions {
            sums.push(input_sum(&inner.coin_db, tx)?);
        }
        Ok(sums)
    }

    pub fn get_balance(&self, public_key: &[u8]) -> Result<u32, ChainError> {
        let mut inner = self.lock();
        Ok(inner.coin_db.get_balance(public_key)?)
    }

    /// Full gate for an inbound block: pure checks plus the UTXO check.
    pub fn check_block(&self, block: &Block) -> Result<bool, ChainError> {
        if !(validation::check_block_syntax(block)
            && validation::check_block_semantics(block)
            && validation::check_block_configuration(block, self.max_block_size))
        {
            return Ok(false);
        }
        let inner = self.lock();
        Ok(inner.coin_db.validate_block(&block.transactions)?)
    }

    /// Full gate for an inbound transaction: pure checks, the input/output
    /// balance check, and the UTXO check.
    pub fn check_transaction(&self, tx: &Transaction) -> Result<bool, ChainError> {
        if !(validation::check_transaction_syntax(tx)
            && validation::check_transaction_configuration(tx, self.max_block_size))
        {
            return Ok(false);
        }
        let inner = self.lock();
        let sum = input_sum(&inner.coin_db, tx)?;
        if !validation::check_transaction_semantics(tx, sum) {
            return Ok(false);
        }
        match inner.coin_db.validate_transaction(tx) {
            Ok(()) => Ok(true),
            Err(CoinDbError::Store(err)) => Err(err.into()),
            Err(err) => {
                debug!(error = %err, "transaction failed coin validation");
                Ok(false)
            }
        }
    }

    pub fn last_hash(&self) -> Hash256 {
        self.lock().last_hash
    }

    pub fn last_block(&self) -> Block {
        self.lock().last_block.clone()
    }

    pub fn length(&self) -> u32 {
        self.lock().length
    }

    pub fn difficulty_target(&self) -> Vec<u8> {
        self.lock().last_block.header.difficulty_target.clone()
    }

    /// Receiver side of the admission channel: every block that reaches
    /// the active chain (by append or reorganization) is delivered here.
    pub fn confirmations(&self) -> Receiver<Block> {
        self.confirm_rx.clone()
    }

    /// Flushes the coin cache and syncs both key-value stores.
    pub fn close(&self) -> Result<(), ChainError> {
        let mut inner = self.lock();
        inner.coin_db.close()?;
        self.block_info_db.close()?;
        Ok(())
    }

    fn read_block(&self, record: &BlockRecord) -> Result<Block, ChainError> {
        let bytes = self.files.read_block(record.block)?;
        Block::decode(&bytes).map_err(|_| ChainError::Corrupt("unreadable block body"))
    }

    fn read_undo(&self, record: &BlockRecord) -> Result<UndoRecord, ChainError> {
        match record.undo {
            Some(location) => {
                let bytes = self.files.read_undo(location)?;
                UndoRecord::decode(&bytes).map_err(|_| ChainError::Corrupt("unreadable undo record"))
            }
            // a block without an undo locator spent nothing
            None => Ok(UndoRecord::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChainInner<S>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Captures the coins a block's inputs consume. `None` means some input
/// does not resolve to any coin this chain knows, so the block cannot be
/// part of a viable fork.
fn make_undo_record<S: KeyValueStore>(
    coin_db: &CoinDatabase<S>,
    transactions: &[Transaction],
) -> Result<Option<UndoRecord>, ChainError> {
    let mut undo = UndoRecord::default();
    for tx in transactions {
        for input in &tx.inputs {
            let outpoint = OutPoint::new(input.prev_txid, input.output_index);
            let Some(coin) = coin_db.get_coin(&outpoint)? else {
                return Ok(None);
            };
            undo.push(
                input.prev_txid,
                input.output_index,
                coin.output.amount,
                coin.output.locking_script,
            );
        }
    }
    Ok(Some(undo))
}

fn input_sum<S: KeyValueStore>(
    coin_db: &CoinDatabase<S>,
    tx: &Transaction,
) -> Result<u32, ChainError> {
    let mut sum = 0u32;
    for input in &tx.inputs {
        match coin_db.get_coin(&OutPoint::new(input.prev_txid, input.output_index))? {
            Some(coin) => sum = sum.saturating_add(coin.output.amount),
            None => debug!(
                txid = %hash_to_hex(&input.prev_txid),
                index = input.output_index,
                "input references an unknown coin"
            ),
        }
    }
    Ok(sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use coind_primitives::TxIn;
    use coind_storage::memory::MemoryStore;
    use std::sync::Arc;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            chain_writer_path: dir.join("chain"),
            genesis_public_key: b"PK".to_vec(),
            initial_subsidy: 50,
            ..Config::default()
        }
    }

    fn new_chain(config: &Config) -> Blockchain<MemoryStore> {
        Blockchain::new(config, MemoryStore::new(), MemoryStore::new()).expect("chain")
    }

    fn target() -> Vec<u8> {
        vec![0xff; 32]
    }

    // the tag keeps otherwise-identical coinbases distinct
    fn coinbase(amount: u32, key: &[u8], tag: u32) -> Transaction {
        Transaction {
            version: 0,
            inputs: Vec::new(),
            outputs: vec![TxOut {
                amount,
                locking_script: key.to_vec(),
            }],
            lock_time: tag,
        }
    }

    fn spend_of(prev_txid: Hash256, output_index: u32, amount: u32, key: &[u8]) -> Transaction {
        Transaction {
            version: 0,
            inputs: vec![TxIn {
                prev_txid,
                output_index,
                unlocking_script: b"sig".to_vec(),
            }],
            outputs: vec![TxOut {
                amount,
                locking_script: key.to_vec(),
            }],
            lock_time: 0,
        }
    }

    fn append_coinbase(chain: &Blockchain<MemoryStore>, amount: u32, key: &[u8], tag: u32) -> Block {
        let block = Block::new(chain.last_hash(), vec![coinbase(amount, key, tag)], target());
        chain.handle_block(block.clone()).expect("handle");
        block
    }

    #[test]
    fn genesis_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chain = new_chain(&test_config(dir.path()));

        assert_eq!(chain.length(), 1);
        assert_eq!(chain.get_balance(b"PK").expect("balance"), 50);

        let blocks = chain.get_blocks(1, 1).expect("blocks");
        assert_eq!(blocks.len(), 1);
        let genesis_tx = &blocks[0].transactions[0];
        assert!(genesis_tx.inputs.is_empty());
        assert_eq!(genesis_tx.outputs.len(), 1);
        assert_eq!(genesis_tx.outputs[0].amount, 50);
        assert_eq!(genesis_tx.outputs[0].locking_script, b"PK");
    }

    #[test]
    fn refounding_an_existing_directory_keeps_the_persisted_genesis() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let block_info = Arc::new(MemoryStore::new());
        let coins = Arc::new(MemoryStore::new());

        let genesis_location = {
            let chain = Blockchain::new(&config, Arc::clone(&block_info), Arc::clone(&coins))
                .expect("chain");
            let hash = chain.last_hash();
            chain
                .block_info(&hash)
                .expect("info")
                .expect("present")
                .block
        };

        // a second construction over the same stores and directory must not
        // append another genesis body or move the index entry
        let chain =
            Blockchain::new(&config, Arc::clone(&block_info), Arc::clone(&coins)).expect("chain");
        let hash = chain.last_hash();
        let info = chain.block_info(&hash).expect("info").expect("present");
        assert_eq!(info.block, genesis_location);
        assert_eq!(chain.get_balance(b"PK").expect("balance"), 50);
    }

    #[test]
    fn linear_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chain = new_chain(&test_config(dir.path()));

        let block = append_coinbase(&chain, 50, b"PK", 1);
        assert_eq!(chain.length(), 2);
        assert_eq!(chain.last_hash(), block.hash());
        assert_eq!(chain.last_block().hash(), block.hash());
        assert_eq!(chain.difficulty_target(), target());
        assert_eq!(chain.get_balance(b"PK").expect("balance"), 100);

        let info = chain
            .block_info(&block.hash())
            .expect("info")
            .expect("present");
        assert_eq!(info.height, 2);
        assert_eq!(info.tx_count, 1);
        assert_eq!(info.header, block.header);
        // a coinbase-only block spends nothing and gets no undo locator
        assert_eq!(info.undo, None);

        // the persisted body is bit-identical to what was submitted
        let stored = chain.get_block(&block.hash()).expect("get").expect("present");
        assert_eq!(stored, block);
        assert_eq!(stored.encode(), block.encode());

        // admission was delivered on the confirmation channel
        let confirmed = chain.confirmations().try_recv().expect("confirmation");
        assert_eq!(confirmed.hash(), block.hash());
    }

    #[test]
    fn spending_moves_balances_and_consumes_the_coin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chain = new_chain(&test_config(dir.path()));
        append_coinbase(&chain, 50, b"PK", 1);

        let genesis_txid = chain.get_blocks(1, 1).expect("blocks")[0].transactions[0].txid();
        let spender = Block::new(
            chain.last_hash(),
            vec![spend_of(genesis_txid, 0, 50, b"PK2")],
            target(),
        );
        chain.handle_block(spender.clone()).expect("handle");

        assert_eq!(chain.length(), 3);
        assert_eq!(chain.get_balance(b"PK").expect("balance"), 50);
        assert_eq!(chain.get_balance(b"PK2").expect("balance"), 50);

        // a spending block gets an undo locator pointing at its spent coin
        let info = chain
            .block_info(&spender.hash())
            .expect("info")
            .expect("present");
        assert!(info.undo.is_some());
        let inner = chain.lock();
        let gone = inner
            .coin_db
            .get_coin(&OutPoint::new(genesis_txid, 0))
            .expect("get");
        assert!(gone.is_none());
    }

    #[test]
    fn shorter_fork_is_retained_without_moving_the_tip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chain = new_chain(&test_config(dir.path()));
        let genesis_hash = chain.last_hash();

        let active = append_coinbase(&chain, 50, b"PK", 1);
        let sibling = Block::new(genesis_hash, vec![coinbase(40, b"PKX", 7)], target());
        chain.handle_block(sibling.clone()).expect("handle");

        assert_eq!(chain.length(), 2);
        assert_eq!(chain.last_hash(), active.hash());
        let retained = chain
            .get_block(&sibling.hash())
            .expect("get")
            .expect("present");
        assert_eq!(retained, sibling);
    }

    #[test]
    fn longer_fork_reorganizes_the_active_chain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chain = new_chain(&test_config(dir.path()));
        let genesis_hash = chain.last_hash();

        append_coinbase(&chain, 50, b"PK", 1);
        append_coinbase(&chain, 50, b"PK", 2);
        assert_eq!(chain.length(), 3);

        let fork1 = Block::new(genesis_hash, vec![coinbase(10, b"PKF", 3)], target());
        chain.handle_block(fork1.clone()).expect("handle");
        let fork2 = Block::new(fork1.hash(), vec![coinbase(20, b"PKF", 4)], target());
        chain.handle_block(fork2.clone()).expect("handle");
        assert_eq!(chain.length(), 3);

        let fork3 = Block::new(fork2.hash(), vec![coinbase(30, b"PKF", 5)], target());
        chain.handle_block(fork3.clone()).expect("handle");

        assert_eq!(chain.length(), 4);
        assert_eq!(chain.last_hash(), fork3.hash());
        assert_eq!(chain.get_balance(b"PKF").expect("balance"), 60);
        // the replaced chain's coinbases are gone; genesis survives
        assert_eq!(chain.get_balance(b"PK").expect("balance"), 50);

        let hashes = chain.get_hashes(1, 4).expect("hashes");
        assert_eq!(
            hashes,
            vec![genesis_hash, fork1.hash(), fork2.hash(), fork3.hash()]
        );
    }

    #[test]
    fn cache_flush_under_capacity_keeps_every_coin_reachable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(dir.path());
        config.main_cache_capacity = 2;
        let chain = new_chain(&config);

        let first = append_coinbase(&chain, 10, b"PK", 1);
        let second = append_coinbase(&chain, 20, b"PK", 2);

        let inner = chain.lock();
        for block in [&first, &second] {
            let coin = inner
                .coin_db
                .get_coin(&OutPoint::new(block.transactions[0].txid(), 0))
                .expect("get")
                .expect("present");
            assert!(!coin.is_spent);
        }
        drop(inner);
        assert_eq!(chain.get_balance(b"PK").expect("balance"), 80);
    }

    #[test]
    fn unsafe_window_is_capped_and_drops_the_oldest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chain = new_chain(&test_config(dir.path()));
        let mut appended = Vec::new();
        for tag in 1..=7 {
            appended.push(append_coinbase(&chain, 5, b"PK", tag));
        }
        let inner = chain.lock();
        assert_eq!(inner.unsafe_hashes.len(), MAX_UNSAFE_HASHES);
        // heights 3..=8 survive; genesis and the first append aged out
        assert_eq!(inner.unsafe_hashes[0], appended[1].hash());
        assert_eq!(*inner.unsafe_hashes.last().expect("tip"), appended[6].hash());
    }

    #[test]
    fn fork_beyond_the_reversible_window_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chain = new_chain(&test_config(dir.path()));
        let genesis_hash = chain.last_hash();
        for tag in 1..=7 {
            append_coinbase(&chain, 5, b"PK", tag);
        }
        let tip = chain.last_hash();
        assert_eq!(chain.length(), 8);

        // fork rooted at genesis, which has aged out of the window
        let mut prev = genesis_hash;
        for tag in 10..=18 {
            let fork = Block::new(prev, vec![coinbase(1, b"PKF", tag)], target());
            chain.handle_block(fork.clone()).expect("handle");
            prev = fork.hash();
        }

        assert_eq!(chain.length(), 8);
        assert_eq!(chain.last_hash(), tip);
        assert_eq!(chain.get_balance(b"PKF").expect("balance"), 0);
    }

    #[test]
    fn block_spending_unknown_coins_is_not_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chain = new_chain(&test_config(dir.path()));
        append_coinbase(&chain, 50, b"PK", 1);

        let phantom = Block::new(
            chain.last_hash(),
            vec![spend_of([0x77; 32], 0, 1, b"PK2")],
            target(),
        );
        chain.handle_block(phantom.clone()).expect("handle");

        assert_eq!(chain.length(), 2);
        assert!(chain.get_block(&phantom.hash()).expect("get").is_none());
    }

    #[test]
    fn failed_fork_validation_restores_the_previous_tip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chain = new_chain(&test_config(dir.path()));
        let genesis_hash = chain.last_hash();
        let genesis_txid = chain.get_blocks(1, 1).expect("blocks")[0].transactions[0].txid();

        // the active chain spends the genesis coin at height 2
        let spender = Block::new(
            chain.last_hash(),
            vec![spend_of(genesis_txid, 0, 50, b"PK2")],
            target(),
        );
        chain.handle_block(spender.clone()).expect("handle");
        let tip = append_coinbase(&chain, 5, b"PK", 2);
        assert_eq!(chain.length(), 3);

        // fork off the spender; its second block double-spends the genesis
        // coin, which is unspendable on every chain that includes the
        // spender
        let fork1 = Block::new(spender.hash(), vec![coinbase(5, b"PKC", 3)], target());
        chain.handle_block(fork1.clone()).expect("handle");
        let fork2 = Block::new(
            fork1.hash(),
            vec![spend_of(genesis_txid, 0, 50, b"PK3")],
            target(),
        );
        chain.handle_block(fork2).expect("handle");

        assert_eq!(chain.length(), 3);
        assert_eq!(chain.last_hash(), tip.hash());
        assert_eq!(chain.get_balance(b"PK2").expect("balance"), 50);
        assert_eq!(chain.get_balance(b"PKC").expect("balance"), 0);
        assert_eq!(chain.get_balance(b"PK3").expect("balance"), 0);
        let inner = chain.lock();
        assert_eq!(
            inner.unsafe_hashes,
            vec![genesis_hash, spender.hash(), tip.hash()]
        );
    }

    #[test]
    fn input_sums_report_zero_for_unknown_coins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chain = new_chain(&test_config(dir.path()));
        let genesis_txid = chain.get_blocks(1, 1).expect("blocks")[0].transactions[0].txid();

        let known = spend_of(genesis_txid, 0, 30, b"PK2");
        let unknown = spend_of([0x13; 32], 0, 1, b"PK2");
        let sums = chain.get_input_sums(&[known, unknown]).expect("sums");
        assert_eq!(sums, vec![50, 0]);
    }

    #[test]
    fn range_queries_cover_the_active_chain_in_height_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chain = new_chain(&test_config(dir.path()));
        let b2 = append_coinbase(&chain, 5, b"PK", 1);
        let b3 = append_coinbase(&chain, 6, b"PK", 2);
        let b4 = append_coinbase(&chain, 7, b"PK", 3);

        let blocks = chain.get_blocks(2, 3).expect("blocks");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], b2);
        assert_eq!(blocks[1], b3);

        let hashes = chain.get_hashes(3, 4).expect("hashes");
        assert_eq!(hashes, vec![b3.hash(), b4.hash()]);

        // out-of-range queries are refused without touching the walk
        assert!(chain.get_blocks(0, 2).expect("blocks").is_empty());
        assert!(chain.get_blocks(3, 2).expect("blocks").is_empty());
        assert!(chain.get_blocks(2, 9).expect("blocks").is_empty());
    }

    #[test]
    fn check_block_and_check_transaction_gate_on_all_checks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chain = new_chain(&test_config(dir.path()));
        let genesis_txid = chain.get_blocks(1, 1).expect("blocks")[0].transactions[0].txid();

        let good = Block::new(chain.last_hash(), vec![coinbase(5, b"PK", 1)], target());
        assert!(chain.check_block(&good).expect("check"));

        // no coinbase up front
        let headless = Block::new(
            chain.last_hash(),
            vec![spend_of(genesis_txid, 0, 10, b"PK2")],
            target(),
        );
        assert!(!chain.check_block(&headless).expect("check"));

        // an empty difficulty target can never be beaten
        let untargeted = Block::new(chain.last_hash(), vec![coinbase(5, b"PK", 2)], Vec::new());
        assert!(!chain.check_block(&untargeted).expect("check"));

        let paying = spend_of(genesis_txid, 0, 30, b"PK2");
        assert!(chain.check_transaction(&paying).expect("check"));
        let overdrawn = spend_of(genesis_txid, 0, 50, b"PK2");
        assert!(!chain.check_transaction(&overdrawn).expect("check"));
        let phantom = spend_of([0x99; 32], 0, 1, b"PK2");
        assert!(!chain.check_transaction(&phantom).expect("check"));
    }

    #[test]
    fn close_flushes_and_syncs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let chain = new_chain(&test_config(dir.path()));
        append_coinbase(&chain, 50, b"PK", 1);
        chain.close().expect("close");
        assert_eq!(chain.get_balance(b"PK").expect("balance"), 100);
    }
}
