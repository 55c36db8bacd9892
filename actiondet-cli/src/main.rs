//! actiondet: command-line driver for action detector training runs.

use actiondet_cli::{Cli, UnlinkedBackend};
use clap::Parser;

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    actiondet_cli::run(cli, &UnlinkedBackend)
}
