pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "returndesk",
    about = "Returndesk operator CLI",
    long_about = "Prepare the order store, inspect configuration, check readiness, and try the assistant from a terminal.",
    after_help = "Examples:\n  returndesk seed\n  returndesk doctor --json\n  returndesk ask \"Where is order e481f51cbdc54678b7cc49136f2d6af7?\""
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Apply migrations and load the deterministic demo orders")]
    Seed,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, policy document, completion client, and order store")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Run one chat turn against the configured services")]
    Ask {
        #[arg(help = "Customer message")]
        message: String,
        #[arg(long, help = "Continue an existing thread (sqlite session backend)")]
        thread_id: Option<String>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Ask { message, thread_id } => commands::ask::run(&message, thread_id),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
