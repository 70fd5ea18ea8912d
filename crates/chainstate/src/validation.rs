//! Pure syntactic, semantic, and configuration checks run against blocks
//! and transactions before any acceptance.

use coind_primitives::{Block, Transaction};

/// Transactions non-empty, coinbase first, and the coinbase pays out a
/// positive amount.
pub fn check_block_syntax(block: &Block) -> bool {
    let Some(first) = block.transactions.first() else {
        return false;
    };
    first.is_coinbase() && first.sum_outputs() > 0
}

/// Proof of work: the block hash must compare strictly below the
/// difficulty target, byte-string-wise.
pub fn check_block_semantics(block: &Block) -> bool {
    block.hash().as_slice() < block.header.difficulty_target.as_slice()
}

pub fn check_block_configuration(block: &Block, max_block_size: u32) -> bool {
    block.size() <= max_block_size
}

/// Inputs and outputs non-empty, every output amount positive.
pub fn check_transaction_syntax(tx: &Transaction) -> bool {
    !tx.inputs.is_empty()
        && !tx.outputs.is_empty()
        && tx.outputs.iter().all(|output| output.amount > 0)
}

/// The referenced coins must be worth more than the created outputs; the
/// caller supplies the input total from the coin database.
pub fn check_transaction_semantics(tx: &Transaction, input_sum: u32) -> bool {
    input_sum > tx.sum_outputs()
}

pub fn check_transaction_configuration(tx: &Transaction, max_block_size: u32) -> bool {
    tx.size() <= max_block_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use coind_primitives::{TxIn, TxOut};

    fn coinbase(amount: u32) -> Transaction {
        Transaction {
            version: 0,
            inputs: Vec::new(),
            outputs: vec![TxOut {
                amount,
                locking_script: b"PK".to_vec(),
            }],
            lock_time: 0,
        }
    }

    fn spend(amount: u32) -> Transaction {
        Transaction {
            version: 0,
            inputs: vec![TxIn {
                prev_txid: [0x31; 32],
                output_index: 0,
                unlocking_script: b"sig".to_vec(),
            }],
            outputs: vec![TxOut {
                amount,
                locking_script: b"PK2".to_vec(),
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn block_syntax_requires_a_paying_coinbase_first() {
        let good = Block::new([0u8; 32], vec![coinbase(50), spend(10)], vec![0xff; 32]);
        assert!(check_block_syntax(&good));

        let empty = Block::new([0u8; 32], Vec::new(), vec![0xff; 32]);
        assert!(!check_block_syntax(&empty));

        let spend_first = Block::new([0u8; 32], vec![spend(10)], vec![0xff; 32]);
        assert!(!check_block_syntax(&spend_first));

        let worthless = Block::new([0u8; 32], vec![coinbase(0)], vec![0xff; 32]);
        assert!(!check_block_syntax(&worthless));
    }

    #[test]
    fn block_semantics_compare_hash_against_target() {
        let beatable = Block::new([0u8; 32], vec![coinbase(50)], vec![0xff; 32]);
        assert!(check_block_semantics(&beatable));

        let impossible = Block::new([0u8; 32], vec![coinbase(50)], vec![0x00; 32]);
        assert!(!check_block_semantics(&impossible));
    }

    #[test]
    fn size_ceilings_bind_blocks_and_transactions() {
        let block = Block::new([0u8; 32], vec![coinbase(50)], vec![0xff; 32]);
        assert!(check_block_configuration(&block, 10_000));
        assert!(!check_block_configuration(&block, 4));

        let tx = spend(10);
        assert!(check_transaction_configuration(&tx, 10_000));
        assert!(!check_transaction_configuration(&tx, 4));
    }

    #[test]
    fn transaction_syntax_and_semantics() {
        assert!(check_transaction_syntax(&spend(10)));
        assert!(!check_transaction_syntax(&coinbase(50)));
        assert!(!check_transaction_syntax(&spend(0)));

        assert!(check_transaction_semantics(&spend(10), 11));
        assert!(!check_transaction_semantics(&spend(10), 10));
    }
}
