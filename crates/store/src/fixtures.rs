//! Canned trace databases for tests and demos.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::types::{ExecutedBlock, ExecutionMode};
use crate::writer::{InterruptEvent, Writer};

/// Write a small trace to `blocks.sqlite` inside `dir` and return its path.
///
/// The trace runs a three-instruction block, a two-instruction block ending
/// in a page fault with a related instruction, and a final pass through the
/// first block:
///
/// - `[0, 3)` block at 0x1000, fully observed
/// - `[3, 4)` block at 0x2000
/// - `[4, 5)` non-instruction (interrupt 14 at 0x2002)
/// - `[5, 8)` block at 0x1000 again
pub fn generate_sample_trace(dir: &Path) -> Result<PathBuf> {
    let path = dir.join("blocks.sqlite");
    let mut writer = Writer::create(&path, "bbtrace-fixtures", "1.0.0", "sample trace")?;

    let block1 = ExecutedBlock {
        pc: 0x1000,
        instruction_count: 3,
        mode: ExecutionMode::X86_64,
    };
    // push rbp; mov rbp, rsp; ret
    let block1_data = [0x55, 0x48, 0x89, 0xe5, 0xc3];

    let block2 = ExecutedBlock {
        pc: 0x2000,
        instruction_count: 2,
        mode: ExecutionMode::X86_64,
    };
    // xor eax, eax; ret
    let block2_data = [0x31, 0xc0, 0xc3];

    writer.add_block(0, block1, &block1_data)?;
    for rip in [0x1000, 0x1001, 0x1004] {
        writer.add_block_instruction(rip)?;
    }

    writer.add_block(3, block2, &block2_data)?;
    for rip in [0x2000, 0x2002] {
        writer.add_block_instruction(rip)?;
    }

    writer.add_interrupt(
        4,
        InterruptEvent {
            pc: 0x2002,
            mode: ExecutionMode::X86_64,
            number: 14,
            is_hw: false,
            has_related_instruction: true,
        },
    )?;

    writer.add_block(5, block1, &block1_data)?;
    writer.finalize_execution(8)?;

    drop(writer.take()?);
    Ok(path)
}
