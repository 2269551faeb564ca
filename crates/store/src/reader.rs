//! Reader for basic-block execution traces.
//!
//! Opening validates the metadata header (resource type and format version)
//! and the reserved interrupt block before any query runs. Fetched blocks
//! are kept in a cache owned by the reader; queries go through the
//! connection's prepared-statement cache, so repeated point lookups reuse
//! their statements.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::Deref;
use std::path::Path;
use std::rc::Rc;

use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::debug;

use crate::error::{Result, TraceError};
use crate::metadata::{Metadata, ResourceType, Version, FORMAT_VERSION};
use crate::types::{
    BlockExecutionEvent, BlockHandle, BlockInstructions, InstructionBlock, Interrupt,
    INTERRUPT_DATA, MAX_INSTRUCTION_LEN,
};

const SELECT_EXECUTION_AFTER: &str = "\
SELECT transition_id, block_id FROM execution \
WHERE transition_id > ?1 \
ORDER BY transition_id ASC \
LIMIT 1";

const SELECT_EXECUTION_BEFORE: &str = "\
SELECT transition_id FROM execution \
WHERE transition_id <= ?1 \
ORDER BY transition_id DESC \
LIMIT 1";

const SELECT_NON_INSTRUCTION_AFTER: &str = "\
SELECT transition_id FROM execution \
WHERE block_id = 1 AND transition_id > ?1 \
ORDER BY transition_id ASC \
LIMIT 1";

const SELECT_BLOCK: &str = "\
SELECT pc, instruction_data, instruction_count, mode \
FROM blocks WHERE rowid = ?1";

const SELECT_INSTRUCTION_INDICES: &str = "\
SELECT instruction_index \
FROM instruction_indices WHERE block_id = ?1 \
ORDER BY instruction_id ASC";

const SELECT_INTERRUPT_AT: &str = "\
SELECT pc, mode, number, is_hw, related_instruction_block_id \
FROM interrupts WHERE transition_id = ?1";

/// Reads a trace of executed blocks from a database produced by
/// [`Writer`](crate::writer::Writer).
#[derive(Debug)]
pub struct Reader {
    conn: Connection,
    metadata: Metadata,
    cache: RefCell<HashMap<i64, Rc<InstructionBlock>>>,
}

impl Reader {
    /// Attempt to open the trace database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open_with_flags(path.as_ref(), OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|err| TraceError::OpenFailed(err.to_string()))?;
        Self::from_connection(conn)
    }

    /// Attempt to open a trace over an existing connection, e.g. one
    /// recovered from [`Writer::take`](crate::writer::Writer::take).
    pub fn from_connection(conn: Connection) -> Result<Self> {
        let metadata = Metadata::read(&conn)?;
        if let Some(relation) = metadata.format_version.relation_to(&FORMAT_VERSION) {
            return Err(TraceError::IncompatibleVersion {
                found: metadata.format_version,
                relation,
            });
        }

        let reader = Reader {
            conn,
            metadata,
            cache: RefCell::new(HashMap::new()),
        };

        let sentinel = reader
            .block(BlockHandle::interrupt())
            .map_err(|err| TraceError::MissingInterruptBlock(err.to_string()))?;
        if sentinel.instruction_data != INTERRUPT_DATA {
            return Err(TraceError::MissingInterruptBlock(
                "first block is not a valid interrupt block".to_owned(),
            ));
        }

        debug!(version = %reader.metadata.format_version, "opened block trace database");
        Ok(reader)
    }

    /// The metadata header the trace was written with.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Retrieve a block of instructions from its handle.
    ///
    /// The returned block is shared with the reader's cache, so requesting
    /// the same block twice does not read from the database again. Fails
    /// with [`TraceError::UnknownBlockHandle`] if the handle does not refer
    /// to a stored block, which can happen when a handle obtained from a
    /// different reader is passed in.
    pub fn block(&self, handle: BlockHandle) -> Result<Rc<InstructionBlock>> {
        if let Some(block) = self.cache.borrow().get(&handle.0) {
            return Ok(Rc::clone(block));
        }
        let block = Rc::new(self.fetch_block(handle)?);
        self.cache.borrow_mut().insert(handle.0, Rc::clone(&block));
        Ok(block)
    }

    /// Retrieve a block together with the offsets of its observed
    /// instructions.
    ///
    /// `instruction_indices` is an arbitrary vector whose backing storage is
    /// reused for the result, sparing an allocation when it already has
    /// enough capacity; recover it afterwards with
    /// [`BlockInstructions::into_indices`].
    pub fn block_with_instructions(
        &self,
        handle: BlockHandle,
        mut instruction_indices: Vec<u32>,
    ) -> Result<BlockInstructions> {
        let block = self.block(handle)?;
        instruction_indices.clear();
        if block.instruction_count == 0 {
            return Ok(BlockInstructions::new(block, instruction_indices));
        }

        instruction_indices.reserve(block.instruction_count as usize);
        let mut stmt = self.conn.prepare_cached(SELECT_INSTRUCTION_INDICES)?;
        let mut rows = stmt.query([handle.0])?;
        while let Some(row) = rows.next()? {
            instruction_indices.push(row.get(0)?);
        }
        Ok(BlockInstructions::new(block, instruction_indices))
    }

    /// Obtain the execution event containing the given transition, or
    /// `None` when the transition lies past the end of the trace.
    pub fn event_at(&self, transition_id: u64) -> Result<Option<BlockExecutionEvent>> {
        let Some((end_transition_id, block_handle)) = self.execution_row_after(transition_id)?
        else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare_cached(SELECT_EXECUTION_BEFORE)?;
        let begin: Option<i64> = stmt
            .query_row([transition_id as i64], |row| row.get(0))
            .optional()?;

        Ok(Some(BlockExecutionEvent {
            begin_transition_id: begin.unwrap_or(0) as u64,
            end_transition_id,
            block_handle,
        }))
    }

    /// Obtain the interrupt occurring at the given transition, or `None`
    /// when that transition is an instruction or past the end of the trace.
    pub fn interrupt_at(&self, transition_id: u64) -> Result<Option<Interrupt>> {
        let mut stmt = self.conn.prepare_cached(SELECT_INTERRUPT_AT)?;
        Ok(stmt
            .query_row([transition_id as i64], |row| {
                let pc: i64 = row.get(0)?;
                Ok(Interrupt {
                    pc: pc as u64,
                    mode: row.get(1)?,
                    number: row.get(2)?,
                    is_hw: row.get(3)?,
                    related: BlockHandle(row.get(4)?),
                })
            })
            .optional()?)
    }

    /// The data of the instruction the interrupt is tied to, or `None` when
    /// there is no related instruction or its offset was never observed.
    pub fn related_instruction_data(
        &self,
        interrupt: &Interrupt,
    ) -> Result<Option<RelatedInstructionData>> {
        if !interrupt.has_related_instruction() {
            return Ok(None);
        }

        let block = self.block(interrupt.related)?;
        let interrupt_offset = interrupt.pc.wrapping_sub(block.first_pc);
        let data_len = block.instruction_data.len() as u64;

        let mut begin: u64 = 0;
        {
            let mut stmt = self.conn.prepare_cached(SELECT_INSTRUCTION_INDICES)?;
            let mut rows = stmt.query([interrupt.related.0])?;
            while let Some(row) = rows.next()? {
                let end = u64::from(row.get::<_, u32>(0)?);
                if begin == interrupt_offset {
                    let end = end.min(begin + MAX_INSTRUCTION_LEN as u64).min(data_len);
                    return Ok(Some(RelatedInstructionData {
                        block,
                        begin: begin as usize,
                        end: end as usize,
                    }));
                }
                begin = end;
            }
        }

        // Past the last recorded offset. The end of this instruction is
        // unknown for a partially observed block, so the data is cut at the
        // architectural maximum of MAX_INSTRUCTION_LEN bytes.
        if begin == interrupt_offset && begin < data_len {
            let end = data_len.min(begin + MAX_INSTRUCTION_LEN as u64);
            return Ok(Some(RelatedInstructionData {
                block,
                begin: begin as usize,
                end: end as usize,
            }));
        }

        Ok(None)
    }

    /// Iterate over the execution events of the trace, in timeline order.
    ///
    /// Non-instruction ranges carry the interrupt block as their handle;
    /// use [`BlockExecutionEvent::has_instructions`] to filter them out.
    pub fn query_events(&self) -> EventQuery<'_> {
        EventQuery {
            reader: self,
            previous_transition_id: 0,
            done: false,
        }
    }

    /// Iterate over the transition ids of the non-instructions in the
    /// trace, in timeline order.
    pub fn query_non_instructions(&self) -> NonInstructionQuery<'_> {
        NonInstructionQuery {
            reader: self,
            cursor: 0,
            done: false,
        }
    }

    /// Clear the block cache, releasing the reader's copy of every fetched
    /// block. Blocks handed out earlier stay valid; they simply no longer
    /// share storage with future fetches.
    pub fn clear_cache(&self) {
        *self.cache.borrow_mut() = HashMap::new();
    }

    /// Number of blocks currently held by the cache.
    pub fn cache_size(&self) -> usize {
        self.cache.borrow().len()
    }

    /// Resource type tagged onto databases this reader understands.
    pub fn resource_type() -> ResourceType {
        ResourceType::Block
    }

    /// Format version this reader understands.
    pub fn resource_version() -> Version {
        FORMAT_VERSION
    }

    fn fetch_block(&self, handle: BlockHandle) -> Result<InstructionBlock> {
        let mut stmt = self.conn.prepare_cached(SELECT_BLOCK)?;
        let block = stmt
            .query_row([handle.0], |row| {
                let pc: i64 = row.get(0)?;
                Ok(InstructionBlock {
                    first_pc: pc as u64,
                    instruction_data: row.get(1)?,
                    instruction_count: row.get(2)?,
                    mode: row.get(3)?,
                })
            })
            .optional()?;
        block.ok_or(TraceError::UnknownBlockHandle(handle.0))
    }

    fn execution_row_after(&self, transition_id: u64) -> Result<Option<(u64, BlockHandle)>> {
        let mut stmt = self.conn.prepare_cached(SELECT_EXECUTION_AFTER)?;
        Ok(stmt
            .query_row([transition_id as i64], |row| {
                let transition: i64 = row.get(0)?;
                let block_id: i64 = row.get(1)?;
                Ok((transition as u64, BlockHandle(block_id)))
            })
            .optional()?)
    }

    fn non_instruction_row_after(&self, transition_id: u64) -> Result<Option<u64>> {
        let mut stmt = self.conn.prepare_cached(SELECT_NON_INSTRUCTION_AFTER)?;
        Ok(stmt
            .query_row([transition_id as i64], |row| {
                let transition: i64 = row.get(0)?;
                Ok(transition as u64)
            })
            .optional()?)
    }
}

/// Bytes of the instruction related to an interrupt.
///
/// The backing block is shared with the reader's cache, so the view stays
/// valid independently of later cache operations.
#[derive(Debug, Clone)]
pub struct RelatedInstructionData {
    block: Rc<InstructionBlock>,
    begin: usize,
    end: usize,
}

impl RelatedInstructionData {
    pub fn bytes(&self) -> &[u8] {
        &self.block.instruction_data[self.begin..self.end]
    }
}

impl Deref for RelatedInstructionData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes()
    }
}

/// Streaming iterator over the execution events of a trace.
///
/// Each step seeks the first execution row past the previous one through
/// the reader's indexed statements, so iteration keeps O(1) memory no
/// matter the trace length.
pub struct EventQuery<'r> {
    reader: &'r Reader,
    previous_transition_id: u64,
    done: bool,
}

impl Iterator for EventQuery<'_> {
    type Item = Result<BlockExecutionEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.execution_row_after(self.previous_transition_id) {
            Ok(Some((end_transition_id, block_handle))) => {
                let event = BlockExecutionEvent {
                    begin_transition_id: self.previous_transition_id,
                    end_transition_id,
                    block_handle,
                };
                self.previous_transition_id = end_transition_id;
                Some(Ok(event))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Streaming iterator over the non-instruction transitions of a trace.
pub struct NonInstructionQuery<'r> {
    reader: &'r Reader,
    cursor: u64,
    done: bool,
}

impl Iterator for NonInstructionQuery<'_> {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.non_instruction_row_after(self.cursor) {
            Ok(Some(end_transition_id)) => {
                self.cursor = end_transition_id;
                // The execution row marks the exclusive end of the
                // single-transition interrupt range.
                Some(Ok(end_transition_id.saturating_sub(1)))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
