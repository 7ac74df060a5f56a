use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

fn main() -> Result<ExitCode> {
    let cli = data_agent_cli::Cli::parse();
    data_agent_cli::init_tracing(cli.verbose);
    data_agent_cli::run_cli(cli)
}
