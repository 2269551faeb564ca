use std::path::Path;

use anyhow::Context;
use bbtrace_store::Reader;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};

pub fn run(filename: &Path) -> anyhow::Result<()> {
    let reader = Reader::open(filename)
        .with_context(|| format!("cannot read trace {}", filename.display()))?;

    println!("\nNon-instruction transitions\n");
    for transition in reader.query_non_instructions() {
        println!("{}", transition?);
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Transitions", "Kind", "First pc", "Instructions", "Partial"]);

    for event in reader.query_events() {
        let event = event?;
        let range = format!(
            "[{}-{})",
            event.begin_transition_id, event.end_transition_id
        );
        if event.has_instructions() {
            let block = reader.block(event.block_handle)?;
            let partial = u64::from(block.instruction_count) > event.execution_count();
            table.add_row(vec![
                range,
                "block".to_owned(),
                format!("{:#x}", block.first_pc),
                block.instruction_count.to_string(),
                partial.to_string(),
            ]);
        } else {
            table.add_row(vec![range, "non-instruction".to_owned()]);
        }
    }

    println!("\nExecution trace\n");
    println!("{table}\n");
    Ok(())
}
