//! Persistent block-hash -> block-record index.

use coind_primitives::encoding::{DecodeError, Decoder, Encoder};
use coind_primitives::{Hash256, Header};
use coind_storage::{Column, KeyValueStore, StoreError};

use crate::flatfiles::FileLocation;

/// Everything the chain needs to know about a block without touching its
/// body: the header, its height, and where the body and undo record live
/// in the segmented logs. Blocks that spent nothing carry no undo locator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockRecord {
    pub header: Header,
    pub height: u32,
    pub tx_count: u32,
    pub block: FileLocation,
    pub undo: Option<FileLocation>,
}

impl BlockRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_element(1, &self.header.encode());
        encoder.write_u32(2, self.height);
        encoder.write_u32(3, self.tx_count);
        encoder.write_u32(4, self.block.file_id);
        encoder.write_u32(5, self.block.start);
        encoder.write_u32(6, self.block.end);
        if let Some(undo) = self.undo {
            encoder.write_u32(7, undo.file_id);
            encoder.write_u32(8, undo.start);
            encoder.write_u32(9, undo.end);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let mut header = None;
        let mut height = 0;
        let mut tx_count = 0;
        let mut block = FileLocation {
            file_id: 0,
            start: 0,
            end: 0,
        };
        let mut undo = FileLocation {
            file_id: 0,
            start: 0,
            end: 0,
        };
        while let Some((field, value)) = decoder.next_field()? {
            match field {
                1 => header = Some(Header::decode(value.as_bytes()?)?),
                2 => height = value.as_u32()?,
                3 => tx_count = value.as_u32()?,
                4 => block.file_id = value.as_u32()?,
                5 => block.start = value.as_u32()?,
                6 => block.end = value.as_u32()?,
                7 => undo.file_id = value.as_u32()?,
                8 => undo.start = value.as_u32()?,
                9 => undo.end = value.as_u32()?,
                _ => return Err(DecodeError::Misaligned("unknown block record field")),
            }
        }
        Ok(Self {
            header: header.ok_or(DecodeError::Misaligned("block record missing header"))?,
            height,
            tx_count,
            block,
            // an absent undo locator encodes as an empty range
            undo: (!undo.is_empty()).then_some(undo),
        })
    }
}

/// Point-lookup map from block hash to [`BlockRecord`], backed by its own
/// key-value store.
pub struct BlockInfoDatabase<S> {
    store: S,
}

impl<S: KeyValueStore> BlockInfoDatabase<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn put(&self, hash: &Hash256, record: &BlockRecord) -> Result<(), StoreError> {
        self.store.put(Column::BlockInfo, hash, &record.encode())
    }

    pub fn get(&self, hash: &Hash256) -> Result<Option<BlockRecord>, StoreError> {
        match self.store.get(Column::BlockInfo, hash)? {
            Some(bytes) => BlockRecord::decode(&bytes)
                .map(Some)
                .map_err(|err| StoreError::Backend(err.to_string())),
            None => Ok(None),
        }
    }

    pub fn close(&self) -> Result<(), StoreError> {
        self.store.sync()
    }
}
