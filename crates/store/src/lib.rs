//! Recording and replay of basic-block execution traces.
//!
//! A producer streams executed blocks, per-instruction program counters and
//! interrupts into a [`Writer`]; block content is deduplicated by fingerprint
//! and consecutive executions of the same block at the same transition
//! boundary collapse into a single execution event. A [`Reader`] later
//! iterates the timeline over the same database, resolves the instructions
//! inside each block and inspects interrupts with their related instruction
//! data.

pub mod error;
mod fingerprint;
pub mod fixtures;
pub mod metadata;
pub mod reader;
pub mod types;
pub mod writer;

pub use error::{Result, TraceError, VersionRelation};
pub use metadata::{Metadata, ResourceType, Version, FORMAT_VERSION, WRITER_VERSION};
pub use reader::{EventQuery, NonInstructionQuery, Reader, RelatedInstructionData};
pub use types::{
    BlockExecutionEvent, BlockHandle, BlockInstructions, ExecutedBlock, ExecutionMode, Instruction,
    InstructionBlock, Interrupt, MAX_INSTRUCTION_LEN,
};
pub use writer::{InterruptEvent, Writer};
