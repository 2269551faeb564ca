//! Trace data model: executed blocks, execution events and interrupts.

use std::rc::Rc;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};

/// Maximal number of bytes an x86 instruction can occupy.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Contents of the reserved interrupt block (rowid 1).
pub(crate) const INTERRUPT_DATA: &[u8] = b"interrupt";

/// Mode in which a block was executed.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    X86_64 = 0,
    X86_32 = 1,
    X86_16 = 2,
}

impl ExecutionMode {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(ExecutionMode::X86_64),
            1 => Some(ExecutionMode::X86_32),
            2 => Some(ExecutionMode::X86_16),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u8 {
        self as u8
    }
}

impl FromSql for ExecutionMode {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = u8::column_result(value)?;
        ExecutionMode::from_raw(raw).ok_or(FromSqlError::OutOfRange(i64::from(raw)))
    }
}

/// Identifies an executed block by its first program counter, instruction
/// count and execution mode. This is the writer-side descriptor used as the
/// deduplication key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutedBlock {
    /// Address of the first instruction executed in the block.
    pub pc: u64,
    /// Number of instructions in the block.
    pub instruction_count: u16,
    /// Mode in which the block was executed.
    pub mode: ExecutionMode,
}

/// A block of instructions as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionBlock {
    /// Concatenated bytes of the instructions executed in this block.
    /// Instruction boundaries are not encoded here.
    pub instruction_data: Vec<u8>,
    /// Address of the first instruction executed in the block.
    pub first_pc: u64,
    /// Number of instructions in the block.
    pub instruction_count: u16,
    /// Mode in which the block was executed.
    pub mode: ExecutionMode,
}

/// An opaque handle to a block of instructions in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle(pub(crate) i64);

impl BlockHandle {
    /// Handle of the reserved block standing in for a single non-instruction
    /// transition. Its `pc` and `mode` are meaningless and its
    /// `instruction_count` is always 0.
    pub fn interrupt() -> Self {
        BlockHandle(1)
    }

    /// Numeric value of the handle (rowid of the block), for debugging.
    pub fn handle(self) -> i64 {
        self.0
    }
}

/// A range of transitions during which one block was executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockExecutionEvent {
    /// Id of the first transition executed in the referenced block.
    pub begin_transition_id: u64,
    /// Id of the first transition executed after the referenced block.
    pub end_transition_id: u64,
    /// Handle to the executed block.
    pub block_handle: BlockHandle,
}

impl BlockExecutionEvent {
    /// Number of executed transitions in this event.
    ///
    /// Less than the block's instruction count means the execution was
    /// interrupted by a fault; equal means it completed; greater only occurs
    /// for non-instruction ranges.
    pub fn execution_count(&self) -> u64 {
        self.end_transition_id - self.begin_transition_id
    }

    /// Whether the range of executed transitions contains instructions.
    pub fn has_instructions(&self) -> bool {
        self.block_handle != BlockHandle::interrupt()
    }
}

/// A single executed non-instruction (interrupt, page fault, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupt {
    /// Address of the instruction at which the interrupt occurred.
    pub pc: u64,
    /// Execution mode of the instruction at which the interrupt occurred.
    pub mode: ExecutionMode,
    /// Architecture-dependent interrupt number. For x86, the index in the
    /// interrupt table.
    pub number: u32,
    /// Whether the interrupt is a hardware or software interrupt.
    pub is_hw: bool,
    // 0 when the interrupt is not tied to an in-flight instruction.
    pub(crate) related: BlockHandle,
}

impl Interrupt {
    /// Whether the interrupt occurred while executing an instruction.
    pub fn has_related_instruction(&self) -> bool {
        self.related.0 != 0
    }
}

/// The pc and data of a single instruction inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub pc: u64,
    pub data: &'a [u8],
}

/// A fetched block bundled with the byte offsets of its observed
/// instructions, giving access to individual instructions.
#[derive(Debug, Clone)]
pub struct BlockInstructions {
    block: Rc<InstructionBlock>,
    instruction_indices: Vec<u32>,
}

impl BlockInstructions {
    pub(crate) fn new(block: Rc<InstructionBlock>, instruction_indices: Vec<u32>) -> Self {
        Self {
            block,
            instruction_indices,
        }
    }

    /// The underlying block.
    pub fn block(&self) -> &InstructionBlock {
        &self.block
    }

    /// The number of instructions executed at least once in this block.
    ///
    /// This can be smaller than the block's `instruction_count` field if the
    /// block was never fully executed.
    pub fn instruction_count(&self) -> u32 {
        if self.block.instruction_count == 0 {
            0
        } else {
            self.instruction_indices.len() as u32 + 1
        }
    }

    /// The instruction at `index`, or `None` past `instruction_count()`.
    ///
    /// If the block was never fully executed the end of the last observed
    /// instruction is unknown; without a disassembler the data is cut at
    /// [`MAX_INSTRUCTION_LEN`] bytes.
    pub fn instruction(&self, index: u32) -> Option<Instruction<'_>> {
        if index >= self.instruction_count() {
            return None;
        }

        let data = &self.block.instruction_data;
        let begin = if index == 0 {
            0
        } else {
            self.instruction_indices[index as usize - 1] as usize
        };
        let end = self
            .instruction_indices
            .get(index as usize)
            .map(|&offset| offset as usize)
            .unwrap_or(data.len());

        let end = end.min(data.len());
        let begin = begin.min(end);
        let len = (end - begin).min(MAX_INSTRUCTION_LEN);

        Some(Instruction {
            pc: self.block.first_pc + begin as u64,
            data: &data[begin..begin + len],
        })
    }

    /// Recover the backing offset vector so it can be reused for the next
    /// lookup instead of allocating a fresh one.
    pub fn into_indices(self) -> Vec<u32> {
        self.instruction_indices
    }
}
