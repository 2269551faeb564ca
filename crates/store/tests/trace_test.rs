use bbtrace_store::{
    BlockHandle, ExecutedBlock, ExecutionMode, InterruptEvent, Reader, TraceError, VersionRelation,
    Writer, MAX_INSTRUCTION_LEN,
};
use rusqlite::Connection;
use tempfile::tempdir;

const DATA: &[u8] = &[0, 1, 2, 3, 4, 5];

fn block(pc: u64, instruction_count: u16) -> ExecutedBlock {
    ExecutedBlock {
        pc,
        instruction_count,
        mode: ExecutionMode::X86_64,
    }
}

fn memory_writer() -> Writer {
    let conn = Connection::open_in_memory().unwrap();
    Writer::from_connection(conn, "tester", "1.0.0", "integration test").unwrap()
}

fn into_reader(writer: Writer) -> Reader {
    Reader::from_connection(writer.take().unwrap()).unwrap()
}

#[test]
fn test_three_sequential_blocks() {
    let mut writer = memory_writer();
    writer.add_block(0, block(0, 5), DATA).unwrap();
    writer.add_block(5, block(1, 7), DATA).unwrap();
    writer.add_block(12, block(2, 2), DATA).unwrap();
    writer.finalize_execution(14).unwrap();
    let reader = into_reader(writer);

    let event = reader.event_at(5).unwrap().unwrap();
    assert_eq!(event.begin_transition_id, 5);
    assert_eq!(event.end_transition_id, 12);
    let executed = reader.block(event.block_handle).unwrap();
    assert_eq!(executed.first_pc, 1);
    assert_eq!(executed.instruction_count, 7);

    let event = reader.event_at(0).unwrap().unwrap();
    assert_eq!(event.begin_transition_id, 0);
    assert_eq!(event.end_transition_id, 5);
    let executed = reader.block(event.block_handle).unwrap();
    assert_eq!(executed.first_pc, 0);
    assert_eq!(executed.instruction_count, 5);

    // Past the final transition there is no event.
    assert!(reader.event_at(14).unwrap().is_none());
}

#[test]
fn test_instruction_indices_of_partial_blocks() {
    let block1_data: &[u8] = &[0, 1, 2, 3, 4, 42];

    let mut writer = memory_writer();
    writer.add_block(0, block(0, 5), block1_data).unwrap();
    for rip in [0, 2, 3, 4, 5] {
        writer.add_block_instruction(rip).unwrap();
    }
    writer.add_block(5, block(200, 2), DATA).unwrap();
    for rip in [200, 205] {
        writer.add_block_instruction(rip).unwrap();
    }
    writer.finalize_execution(7).unwrap();
    let reader = into_reader(writer);

    let event = reader.event_at(6).unwrap().unwrap();
    assert_eq!(event.begin_transition_id, 5);
    assert_eq!(event.end_transition_id, 7);
    let instructions = reader
        .block_with_instructions(event.block_handle, Vec::new())
        .unwrap();
    assert_eq!(instructions.block().first_pc, 200);
    assert_eq!(instructions.instruction_count(), 2);
    assert_eq!(instructions.instruction(1).unwrap().pc, 205);

    // Reuse the offset vector for the next lookup.
    let indices = instructions.into_indices();

    let event = reader.event_at(3).unwrap().unwrap();
    assert_eq!(event.begin_transition_id, 0);
    assert_eq!(event.end_transition_id, 5);
    let instructions = reader
        .block_with_instructions(event.block_handle, indices)
        .unwrap();
    assert_eq!(instructions.block().first_pc, 0);
    assert_eq!(instructions.instruction_count(), 5);
    assert_eq!(instructions.instruction(0).unwrap().pc, 0);
    assert_eq!(instructions.instruction(1).unwrap().pc, 2);
    let last = instructions.instruction(4).unwrap();
    assert_eq!(last.pc, 5);
    assert_eq!(last.data[0], 42);
}

#[test]
fn test_interrupts() {
    // A five-instruction block whose last instruction was never bounded,
    // interrupted by a page fault mid-block.
    let mut block1_data = vec![0u8, 1, 2, 3, 4, 42];
    block1_data.extend(std::iter::repeat(23).take(72));

    let mut writer = memory_writer();
    writer.add_block(0, block(0, 5), &block1_data).unwrap();
    for rip in [0, 2, 3, 4] {
        writer.add_block_instruction(rip).unwrap();
    }
    writer
        .add_interrupt(
            3,
            InterruptEvent {
                pc: 4,
                mode: ExecutionMode::X86_64,
                number: 14,
                is_hw: false,
                has_related_instruction: true,
            },
        )
        .unwrap();

    writer.add_block(4, block(200, 2), DATA).unwrap();
    writer.add_block(6, block(200, 2), DATA).unwrap();
    writer
        .add_interrupt(
            9,
            InterruptEvent {
                pc: 200,
                mode: ExecutionMode::X86_32,
                number: 209,
                is_hw: true,
                has_related_instruction: false,
            },
        )
        .unwrap();
    writer.finalize_execution(10).unwrap();
    let reader = into_reader(writer);

    // The fault tied to the in-flight instruction of the first block.
    let interrupt = reader.interrupt_at(3).unwrap().unwrap();
    assert!(!interrupt.is_hw);
    assert!(interrupt.has_related_instruction());
    assert_eq!(interrupt.mode, ExecutionMode::X86_64);
    assert_eq!(interrupt.number, 14);
    assert_eq!(interrupt.pc, 4);

    // The faulting instruction's end is unknown, so its data is cut at the
    // architectural maximum.
    let data = reader
        .related_instruction_data(&interrupt)
        .unwrap()
        .unwrap();
    assert_eq!(data.bytes().len(), MAX_INSTRUCTION_LEN);
    assert_eq!(data.bytes()[0], 4);
    assert_eq!(data.bytes()[1], 42);
    assert!(data.bytes()[2..].iter().all(|&byte| byte == 23));

    // The hardware interrupt with no related instruction.
    let interrupt = reader.interrupt_at(9).unwrap().unwrap();
    assert!(interrupt.is_hw);
    assert!(!interrupt.has_related_instruction());
    assert_eq!(interrupt.mode, ExecutionMode::X86_32);
    assert_eq!(interrupt.number, 209);
    assert!(reader
        .related_instruction_data(&interrupt)
        .unwrap()
        .is_none());

    // An instruction transition has no interrupt.
    assert!(reader.interrupt_at(5).unwrap().is_none());

    let non_instructions: Vec<u64> = reader
        .query_non_instructions()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(non_instructions, vec![3, 9]);
}

#[test]
fn test_same_transition_executions_collapse() {
    let mut writer = memory_writer();
    writer.add_block(0, block(0x1000, 3), DATA).unwrap();
    writer.add_block(0, block(0x1000, 3), DATA).unwrap();
    writer.finalize_execution(1).unwrap();
    let reader = into_reader(writer);

    let events: Vec<_> = reader.query_events().collect::<Result<_, _>>().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].begin_transition_id, 0);
    assert_eq!(events[0].end_transition_id, 1);

    let event = reader.event_at(0).unwrap().unwrap();
    assert_eq!(event.begin_transition_id, 0);
    assert_eq!(event.end_transition_id, 1);
    assert_eq!(
        reader.block(event.block_handle).unwrap().first_pc,
        0x1000
    );
}

#[test]
fn test_version_gate() {
    let dir = tempdir().unwrap();

    for (stored, relation) in [
        ("2.0.0", VersionRelation::Future),
        ("0.9.0", VersionRelation::Past),
    ] {
        let path = dir.path().join(format!("blocks-{stored}.sqlite"));
        {
            let mut writer = Writer::create(&path, "tester", "1.0.0", "version gate").unwrap();
            writer.add_block(0, block(0, 1), DATA).unwrap();
            writer.finalize_execution(1).unwrap();
        }
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(
                "UPDATE metadata SET value = ?1 WHERE key = 'format_version'",
                [stored],
            )
            .unwrap();
        }

        match Reader::open(&path) {
            Err(TraceError::IncompatibleVersion { found, relation: r }) => {
                assert_eq!(found.to_string(), stored);
                assert_eq!(r, relation);
            }
            other => panic!("expected a version error, got {other:?}"),
        }
    }
}

#[test]
fn test_blocks_are_deduplicated() {
    let mut writer = memory_writer();
    for transition in [0, 4, 8] {
        writer.add_block(transition, block(0x1000, 4), DATA).unwrap();
    }
    writer.finalize_execution(12).unwrap();
    let conn = writer.take().unwrap();

    let blocks: i64 = conn
        .query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))
        .unwrap();
    // The reserved interrupt block plus a single deduplicated block.
    assert_eq!(blocks, 2);

    let executions: i64 = conn
        .query_row("SELECT COUNT(*) FROM execution", [], |row| row.get(0))
        .unwrap();
    assert_eq!(executions, 3);
}

#[test]
fn test_events_cover_the_timeline() {
    let mut writer = memory_writer();
    writer.add_block(0, block(0, 5), DATA).unwrap();
    writer.add_block(5, block(1, 7), DATA).unwrap();
    writer
        .add_interrupt(
            12,
            InterruptEvent {
                pc: 1,
                mode: ExecutionMode::X86_64,
                number: 32,
                is_hw: true,
                has_related_instruction: false,
            },
        )
        .unwrap();
    writer.add_block(13, block(2, 2), DATA).unwrap();
    writer.finalize_execution(15).unwrap();
    let reader = into_reader(writer);

    let events: Vec<_> = reader.query_events().collect::<Result<_, _>>().unwrap();
    assert!(!events.is_empty());

    // Contiguous, non-overlapping coverage of [0, final_transition).
    let mut previous_end = 0;
    for event in &events {
        assert_eq!(event.begin_transition_id, previous_end);
        assert!(event.end_transition_id > event.begin_transition_id);
        previous_end = event.end_transition_id;
    }
    assert_eq!(previous_end, 15);

    // The interrupt range spans exactly one transition.
    let interrupt_event = events.iter().find(|e| !e.has_instructions()).unwrap();
    assert_eq!(interrupt_event.execution_count(), 1);

    // event_at agrees with the event list for every covered transition.
    for event in &events {
        for transition in event.begin_transition_id..event.end_transition_id {
            assert_eq!(reader.event_at(transition).unwrap().unwrap(), *event);
        }
    }

    // Real blocks never span more transitions than they have instructions.
    for event in events.iter().filter(|e| e.has_instructions()) {
        let executed = reader.block(event.block_handle).unwrap();
        assert!(event.execution_count() <= u64::from(executed.instruction_count));
    }
}

#[test]
fn test_instruction_count_grows_with_observation() {
    let mut writer = memory_writer();

    // First execution observes two instructions, the second all three.
    writer.add_block(0, block(0x1000, 3), DATA).unwrap();
    for rip in [0x1000, 0x1002] {
        writer.add_block_instruction(rip).unwrap();
    }
    writer.add_block(2, block(0x1000, 3), DATA).unwrap();
    for rip in [0x1000, 0x1002, 0x1004] {
        writer.add_block_instruction(rip).unwrap();
    }
    writer.finalize_execution(5).unwrap();
    let reader = into_reader(writer);

    let event = reader.event_at(0).unwrap().unwrap();
    let instructions = reader
        .block_with_instructions(event.block_handle, Vec::new())
        .unwrap();
    assert_eq!(instructions.instruction_count(), 3);
    assert_eq!(instructions.instruction(2).unwrap().pc, 0x1004);
}

#[test]
fn test_block_cache() {
    let mut writer = memory_writer();
    writer.add_block(0, block(0x1000, 3), DATA).unwrap();
    writer.finalize_execution(3).unwrap();
    let reader = into_reader(writer);

    // Opening verified the interrupt block, which populates the cache.
    assert_eq!(reader.cache_size(), 1);

    let handle = reader.event_at(0).unwrap().unwrap().block_handle;
    let first = reader.block(handle).unwrap();
    let second = reader.block(handle).unwrap();
    assert!(std::rc::Rc::ptr_eq(&first, &second));
    assert_eq!(reader.cache_size(), 2);

    reader.clear_cache();
    assert_eq!(reader.cache_size(), 0);

    // Earlier results stay usable and a refetch works.
    assert_eq!(first.first_pc, 0x1000);
    assert_eq!(reader.block(handle).unwrap().first_pc, 0x1000);
    assert_eq!(reader.cache_size(), 1);
}

#[test]
fn test_unknown_block_handle_does_not_populate_cache() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("blocks.sqlite");
    {
        let mut writer = Writer::create(&path, "tester", "1.0.0", "cache test").unwrap();
        writer.add_block(0, block(0x1000, 3), DATA).unwrap();
        writer.finalize_execution(3).unwrap();
    }
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute("DELETE FROM blocks WHERE rowid = 2", []).unwrap();
    }

    let reader = Reader::open(&path).unwrap();
    let handle = reader.event_at(0).unwrap().unwrap().block_handle;
    let cached = reader.cache_size();
    assert!(matches!(
        reader.block(handle),
        Err(TraceError::UnknownBlockHandle(_))
    ));
    assert_eq!(reader.cache_size(), cached);
}

#[test]
fn test_corrupt_interrupt_block_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("blocks.sqlite");
    {
        let mut writer = Writer::create(&path, "tester", "1.0.0", "sentinel test").unwrap();
        writer.add_block(0, block(0x1000, 3), DATA).unwrap();
        writer.finalize_execution(3).unwrap();
    }
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "UPDATE blocks SET instruction_data = x'6e6f7065' WHERE rowid = 1",
            [],
        )
        .unwrap();
    }

    assert!(matches!(
        Reader::open(&path),
        Err(TraceError::MissingInterruptBlock(_))
    ));
}

#[test]
fn test_metadata_header() {
    let mut writer = memory_writer();
    writer.add_block(0, block(0x1000, 3), DATA).unwrap();
    writer.finalize_execution(3).unwrap();
    let reader = into_reader(writer);

    let metadata = reader.metadata();
    assert_eq!(metadata.tool_name, "tester");
    assert_eq!(metadata.format_version, Reader::resource_version());
    assert_eq!(metadata.resource_type, Reader::resource_type());
    assert!(metadata.tool_info.ends_with("using bbtrace-store 1.0.0"));
}

#[test]
fn test_terminal_event_after_interrupt_is_filtered_by_has_instructions() {
    let mut writer = memory_writer();
    writer.add_block(0, block(0x1000, 3), DATA).unwrap();
    writer
        .add_interrupt(
            3,
            InterruptEvent {
                pc: 0x1002,
                mode: ExecutionMode::X86_64,
                number: 3,
                is_hw: false,
                has_related_instruction: true,
            },
        )
        .unwrap();
    writer.finalize_execution(4).unwrap();
    let reader = into_reader(writer);

    let events: Vec<_> = reader.query_events().collect::<Result<_, _>>().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].block_handle, BlockHandle::interrupt());
    assert!(!events[1].has_instructions());

    let instruction_events: Vec<_> = events
        .iter()
        .filter(|event| event.has_instructions())
        .collect();
    assert_eq!(instruction_events.len(), 1);
}
