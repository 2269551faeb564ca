use std::path::PathBuf;

use bbtrace_cli::commands::show;
use clap::Parser;

/// Reads the contents of a blocks database.
#[derive(Parser)]
#[command(name = "bbtrace", version)]
struct Cli {
    /// Path to the blocks database.
    #[arg(default_value = "blocks.sqlite")]
    filename: PathBuf,
}

fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Err(err) = show::run(&cli.filename) {
        eprintln!("ERROR: {err:#}");
        std::process::exit(1);
    }
}
