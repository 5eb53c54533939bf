//! groupsync - operator CLI for the membership synchronization engine
//!
//! Checks configuration files and previews what a reconciliation sweep
//! would change against an exported directory snapshot.

use clap::{Parser, Subcommand};

mod commands;
mod error;
mod logging;

use error::CliResult;

#[derive(Parser)]
#[command(name = "groupsync")]
#[command(author, version, about = "Cross-directory membership synchronization", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true, env = "GROUPSYNC_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate(commands::validate::ValidateArgs),

    /// Preview the corrections a sweep would make against a snapshot
    Plan(commands::plan::PlanArgs),
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    logging::init_logging(cli.log_json);

    if let Err(e) = run(cli).await {
        e.print();
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    match cli.command {
        Commands::Validate(args) => commands::validate::execute(args),
        Commands::Plan(args) => commands::plan::execute(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_plan_arguments() {
        let cli = Cli::try_parse_from([
            "groupsync",
            "--log-json",
            "plan",
            "-f",
            "sync.yaml",
            "-s",
            "snapshot.yaml",
            "--json",
        ])
        .unwrap();
        assert!(cli.log_json);
        match cli.command {
            Commands::Plan(args) => {
                assert_eq!(args.file.to_str(), Some("sync.yaml"));
                assert_eq!(args.snapshot.to_str(), Some("snapshot.yaml"));
                assert!(args.json);
                assert!(args.output.is_none());
            }
            Commands::Validate(_) => panic!("expected plan"),
        }
    }
}
