//! Content fingerprints used to deduplicate blocks.
//!
//! The fingerprint is an in-memory key only; it is never persisted. The
//! descriptor is packed little-endian, fields in declared order with no
//! padding, so the same block always hashes the same way within and across
//! writer runs.

use byteorder::{ByteOrder, LittleEndian};
use sha2::{Digest, Sha256};

use crate::types::ExecutedBlock;

const PACKED_BLOCK_LEN: usize = 11;

/// Digest identifying a block's descriptor and instruction bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Fingerprint([u8; 32]);

pub(crate) fn fingerprint(block: &ExecutedBlock, instruction_data: &[u8]) -> Fingerprint {
    let mut packed = [0u8; PACKED_BLOCK_LEN];
    LittleEndian::write_u64(&mut packed[0..8], block.pc);
    LittleEndian::write_u16(&mut packed[8..10], block.instruction_count);
    packed[10] = block.mode.as_raw();

    let mut hasher = Sha256::new();
    hasher.update(packed);
    hasher.update(instruction_data);
    Fingerprint(hasher.finalize().into())
}

/// Per-fingerprint bookkeeping of the writer's dedup map: the assigned rowid,
/// how many instruction offsets are already persisted, and the descriptor
/// kept around for collision detection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MappedBlock {
    pub id: i64,
    pub executed_instructions: usize,
    pub block: ExecutedBlock,
}
