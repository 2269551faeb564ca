//! Writer for basic-block execution traces.
//!
//! The writer keeps the most recently reported block pending instead of
//! persisting it immediately. Consecutive reports of the same block at the
//! same transition boundary collapse into a single execution event, which is
//! what keeps tight loops from flooding the execution table. The pending
//! block is flushed when the transition boundary advances, when an interrupt
//! is reported and when the trace is finalized.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{params, Connection};
use tracing::debug;

use crate::error::{Result, TraceError};
use crate::fingerprint::{fingerprint, Fingerprint, MappedBlock};
use crate::metadata::{Metadata, ResourceType, Version, FORMAT_VERSION, WRITER_VERSION};
use crate::types::{ExecutedBlock, ExecutionMode, INTERRUPT_DATA};

/// Number of writes grouped into one database transaction.
const TRANSACTION_COUNT: u32 = 10_000;

const ERR_TAKEN: &str = "writer used after take";

const CREATE_TRACE_TABLES: &str = "\
CREATE TABLE blocks(
    pc INT8 NOT NULL,
    instruction_data BLOB NOT NULL,
    instruction_count INT2 NOT NULL,
    mode INT1 NOT NULL
);
CREATE TABLE execution(
    transition_id INT8 PRIMARY KEY NOT NULL,
    block_id INT4 NOT NULL
) WITHOUT ROWID;
CREATE TABLE instruction_indices(
    block_id INTEGER NOT NULL,
    instruction_id INTEGER NOT NULL,
    instruction_index INTEGER NOT NULL,
    PRIMARY KEY (block_id, instruction_id)
) WITHOUT ROWID;
CREATE TABLE interrupts(
    transition_id INT8 PRIMARY KEY NOT NULL,
    pc INT8 NOT NULL,
    mode INT1 NOT NULL,
    number INTEGER NOT NULL,
    is_hw BOOL NOT NULL,
    related_instruction_block_id INTEGER NOT NULL
) WITHOUT ROWID;
PRAGMA synchronous=off;
PRAGMA journal_mode=memory;
PRAGMA temp_store=memory;
";

/// Descriptor of the reserved block standing in for non-instruction
/// transitions.
fn interrupt_block() -> ExecutedBlock {
    ExecutedBlock {
        pc: 0,
        instruction_count: 0,
        mode: ExecutionMode::X86_64,
    }
}

/// A non-instruction event as reported by the instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptEvent {
    /// Address of the instruction at which the interrupt occurred.
    pub pc: u64,
    /// Execution mode at the time of the interrupt.
    pub mode: ExecutionMode,
    /// Architecture-dependent interrupt number.
    pub number: u32,
    /// Whether the interrupt is a hardware or software interrupt.
    pub is_hw: bool,
    /// Whether the interrupt occurred while an instruction was in flight.
    pub has_related_instruction: bool,
}

/// Records the trace of executed blocks into a new database.
pub struct Writer {
    // Some until take(); take() consumes the writer, so every method sees
    // the connection present.
    conn: Option<Connection>,

    // Known blocks, keyed by content fingerprint.
    block_map: HashMap<Fingerprint, MappedBlock>,

    // The pending block: the last block reported through add_block, not yet
    // persisted so that repeated executions can be merged.
    last_hash: Option<Fingerprint>,
    last_block: ExecutedBlock,
    last_instruction_data: Vec<u8>,
    last_id: i64,
    last_transition_id: u64,
    last_block_instruction_indices: Vec<u32>,

    // 0 when no transaction is open, otherwise the number of writes done in
    // the current one.
    transaction_items: u32,
}

/// Runs one write inside the batching transaction envelope.
fn step_transaction<T>(
    conn: &Connection,
    transaction_items: &mut u32,
    op: impl FnOnce(&Connection) -> rusqlite::Result<T>,
) -> Result<T> {
    if *transaction_items == 0 {
        conn.execute_batch("BEGIN")?;
    }
    *transaction_items += 1;
    if *transaction_items > TRANSACTION_COUNT {
        *transaction_items = 0;
        conn.execute_batch("COMMIT")?;
    }
    Ok(op(conn)?)
}

fn insert_block_row(
    conn: &Connection,
    transaction_items: &mut u32,
    block: &ExecutedBlock,
    instruction_data: &[u8],
) -> Result<i64> {
    step_transaction(conn, transaction_items, |conn| {
        let mut stmt = conn.prepare_cached("INSERT INTO blocks VALUES (?1, ?2, ?3, ?4)")?;
        stmt.execute(params![
            block.pc as i64,
            instruction_data,
            block.instruction_count,
            block.mode.as_raw(),
        ])?;
        Ok(conn.last_insert_rowid())
    })
}

impl Writer {
    /// Create a new trace database at `path`, tagged with the producing
    /// tool's name, version and free-form info string.
    pub fn create<P: AsRef<Path>>(
        path: P,
        tool_name: &str,
        tool_version: &str,
        tool_info: &str,
    ) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|err| TraceError::OpenFailed(err.to_string()))?;
        Self::from_connection(conn, tool_name, tool_version, tool_info)
    }

    /// Create a new trace database on an existing connection.
    pub fn from_connection(
        conn: Connection,
        tool_name: &str,
        tool_version: &str,
        tool_info: &str,
    ) -> Result<Self> {
        let tool_version: Version = tool_version.parse()?;
        conn.execute_batch(CREATE_TRACE_TABLES)?;

        let metadata = Metadata {
            resource_type: ResourceType::Block,
            format_version: FORMAT_VERSION,
            writer_version: WRITER_VERSION,
            tool_name: tool_name.to_owned(),
            tool_version,
            tool_info: format!("{tool_info} - using bbtrace-store {WRITER_VERSION}"),
        };
        metadata.write(&conn)?;

        let mut writer = Writer {
            conn: Some(conn),
            block_map: HashMap::new(),
            last_hash: None,
            last_block: interrupt_block(),
            last_instruction_data: Vec::new(),
            last_id: 0,
            last_transition_id: 0,
            last_block_instruction_indices: Vec::new(),
            transaction_items: 0,
        };

        // Seed the reserved interrupt block so it always sits at rowid 1 and
        // so any block with identical content dedups against it.
        let block = interrupt_block();
        let digest = fingerprint(&block, INTERRUPT_DATA);
        let conn = writer.conn.as_ref().ok_or(TraceError::Logic(ERR_TAKEN))?;
        let id = insert_block_row(conn, &mut writer.transaction_items, &block, INTERRUPT_DATA)?;
        writer.block_map.insert(
            digest,
            MappedBlock {
                id,
                executed_instructions: 0,
                block,
            },
        );

        debug!(tool = tool_name, "created block trace database");
        Ok(writer)
    }

    /// Report the execution of a block.
    ///
    /// `current_transition` is the transition id of the first instruction
    /// executed in the block, and `instruction_data` its concatenated
    /// instruction bytes. Reporting the same block again at the same
    /// transition id is merged into one execution event, so callers must not
    /// rely on every call producing a row.
    pub fn add_block(
        &mut self,
        current_transition: u64,
        block: ExecutedBlock,
        instruction_data: &[u8],
    ) -> Result<()> {
        self.add_block_inner(current_transition, block, instruction_data, false)
    }

    /// Report the execution of an instruction at `rip` in the pending block.
    ///
    /// This is how the offsets of the individual instructions inside the
    /// block become known. The first instruction's offset is implicit and
    /// ignored.
    pub fn add_block_instruction(&mut self, rip: u64) -> Result<()> {
        if self.last_hash.is_none() {
            return Err(TraceError::Logic(
                "add_block_instruction called before any add_block",
            ));
        }
        let index = rip.wrapping_sub(self.last_block.pc) as u32;
        if index == 0 {
            return Ok(());
        }
        self.last_block_instruction_indices.push(index);
        Ok(())
    }

    /// Report the execution of a non-instruction.
    ///
    /// The pending block is flushed even when `current_transition` equals
    /// its boundary, so the interrupt and the instruction it landed on each
    /// keep their own row. When the interrupt is tied to an in-flight
    /// instruction, the row references the block that was pending on entry.
    pub fn add_interrupt(&mut self, current_transition: u64, interrupt: InterruptEvent) -> Result<()> {
        self.add_block_inner(current_transition, interrupt_block(), INTERRUPT_DATA, true)?;
        self.insert_interrupt(current_transition, &interrupt)
    }

    /// Indicate that the last block finished executing.
    ///
    /// The final block is not necessarily executed fully; this supplies the
    /// closing transition id of the trace and flushes the pending block.
    pub fn finalize_execution(&mut self, last_transition_id: u64) -> Result<()> {
        if self.last_hash.is_some() && last_transition_id != self.last_transition_id {
            self.insert_last_block()?;
            self.insert_block_execution(last_transition_id)?;
        }
        Ok(())
    }

    /// Commit any open transaction and recover the underlying connection.
    pub fn take(mut self) -> Result<Connection> {
        self.commit_open_batch()?;
        debug!("block trace writer finished");
        self.conn.take().ok_or(TraceError::Logic(ERR_TAKEN))
    }

    fn add_block_inner(
        &mut self,
        current_transition: u64,
        block: ExecutedBlock,
        instruction_data: &[u8],
        force_last_block_insertion: bool,
    ) -> Result<()> {
        let digest = fingerprint(&block, instruction_data);

        if self.last_hash.is_none() {
            self.reset_last_block(block, digest, instruction_data);
            return Ok(());
        }

        if current_transition != self.last_transition_id {
            self.insert_last_block()?;
            self.insert_block_execution(current_transition)?;
        } else if force_last_block_insertion {
            self.insert_last_block()?;
        }

        self.reset_last_block(block, digest, instruction_data);
        Ok(())
    }

    fn reset_last_block(
        &mut self,
        block: ExecutedBlock,
        digest: Fingerprint,
        instruction_data: &[u8],
    ) {
        self.last_instruction_data.clear();
        self.last_instruction_data.extend_from_slice(instruction_data);
        self.last_block = block;
        self.last_hash = Some(digest);
        self.last_block_instruction_indices.clear();
        // last_id is left untouched: add_interrupt reads the previous
        // block's id after the flush.
    }

    /// Flush the pending block: insert it if its fingerprint is new, adopt
    /// the stored rowid otherwise, and persist any instruction offsets not
    /// seen in earlier executions.
    fn insert_last_block(&mut self) -> Result<()> {
        let digest = self
            .last_hash
            .ok_or(TraceError::Logic("no pending block to insert"))?;

        let known = self
            .block_map
            .get(&digest)
            .map(|mapped| (mapped.id, mapped.block, mapped.executed_instructions));
        let (id, already_inserted) = match known {
            Some((id, block, executed_instructions)) => {
                if block != self.last_block {
                    return Err(TraceError::Collision);
                }
                if id == 0 {
                    return Err(TraceError::Logic("last_id == 0 for a known block"));
                }
                (id, executed_instructions)
            }
            None => {
                let conn = self.conn.as_ref().ok_or(TraceError::Logic(ERR_TAKEN))?;
                let id = insert_block_row(
                    conn,
                    &mut self.transaction_items,
                    &self.last_block,
                    &self.last_instruction_data,
                )?;
                if id == 0 {
                    return Err(TraceError::Logic("last_id == 0 after block insert"));
                }
                self.block_map.insert(
                    digest,
                    MappedBlock {
                        id,
                        executed_instructions: 0,
                        block: self.last_block,
                    },
                );
                (id, 0)
            }
        };
        self.last_id = id;

        if already_inserted < self.last_block_instruction_indices.len() {
            self.insert_executed_instructions(already_inserted)?;
            if let Some(mapped) = self.block_map.get_mut(&digest) {
                mapped.executed_instructions = self.last_block_instruction_indices.len();
            }
        }
        Ok(())
    }

    fn insert_executed_instructions(&mut self, already_inserted: usize) -> Result<()> {
        if self.last_id == 0 {
            return Err(TraceError::Logic(
                "attempting to insert instruction indices with last_id == 0",
            ));
        }
        let block_id = self.last_id;
        let conn = self.conn.as_ref().ok_or(TraceError::Logic(ERR_TAKEN))?;
        for (instruction_id, &instruction_index) in self
            .last_block_instruction_indices
            .iter()
            .enumerate()
            .skip(already_inserted)
        {
            step_transaction(conn, &mut self.transaction_items, |conn| {
                let mut stmt =
                    conn.prepare_cached("INSERT INTO instruction_indices VALUES (?1, ?2, ?3)")?;
                stmt.execute(params![
                    block_id,
                    instruction_id as i64,
                    i64::from(instruction_index)
                ])?;
                Ok(())
            })?;
        }
        Ok(())
    }

    fn insert_block_execution(&mut self, transition_id: u64) -> Result<()> {
        if self.last_id == 0 {
            return Err(TraceError::Logic(
                "attempting to insert an execution row with last_id == 0",
            ));
        }
        let block_id = self.last_id;
        let conn = self.conn.as_ref().ok_or(TraceError::Logic(ERR_TAKEN))?;
        step_transaction(conn, &mut self.transaction_items, |conn| {
            let mut stmt = conn.prepare_cached("INSERT INTO execution VALUES (?1, ?2)")?;
            stmt.execute(params![transition_id as i64, block_id])?;
            Ok(())
        })?;
        self.last_transition_id = transition_id;
        Ok(())
    }

    fn insert_interrupt(&mut self, transition_id: u64, interrupt: &InterruptEvent) -> Result<()> {
        let related_block_id = if interrupt.has_related_instruction {
            self.last_id
        } else {
            0
        };
        let pc = interrupt.pc;
        let mode = interrupt.mode.as_raw();
        let number = interrupt.number;
        let is_hw = interrupt.is_hw;

        let conn = self.conn.as_ref().ok_or(TraceError::Logic(ERR_TAKEN))?;
        step_transaction(conn, &mut self.transaction_items, |conn| {
            let mut stmt =
                conn.prepare_cached("INSERT INTO interrupts VALUES (?1, ?2, ?3, ?4, ?5, ?6)")?;
            stmt.execute(params![
                transition_id as i64,
                pc as i64,
                mode,
                number,
                is_hw,
                related_block_id
            ])?;
            Ok(())
        })
    }

    fn commit_open_batch(&mut self) -> Result<()> {
        if self.transaction_items != 0 {
            let conn = self.conn.as_ref().ok_or(TraceError::Logic(ERR_TAKEN))?;
            conn.execute_batch("COMMIT")?;
            self.transaction_items = 0;
        }
        Ok(())
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        let _ = self.commit_open_batch();
    }
}
