use clap::Parser;
use std::process::ExitCode;

use rolegate::cli::args::{Cli, Commands};
use rolegate::cli::{provision, status};
use rolegate::error::exit_codes;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = run(cli).await;

    match result {
        Ok(()) => ExitCode::from(exit_codes::SUCCESS as u8),
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(cli: Cli) -> rolegate::Result<()> {
    match cli.command {
        Commands::Provision { name, host, port } => {
            provision::provision(&host, port, &name).await
        }
        Commands::Status { system, pid_dir } => status::status(&pid_dir, &system),
        Commands::Stop { system, pid_dir } => status::stop(&pid_dir, &system),
    }
}
