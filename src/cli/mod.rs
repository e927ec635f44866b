//! CLI module; subcommands live here.

use clap::{CommandFactory, Parser, Subcommand};

use crate::Result;

pub mod catchup;

#[derive(Debug, Clone)]
pub enum Command {
    Catchup(catchup::CatchupArgs),
    None,
}

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub command: Command,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            command: Command::None,
        }
    }
}

pub fn dispatch(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Catchup(c) => catchup::execute(c),
        Command::None => Ok(()),
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "pgcatchup",
    version,
    about = "Sync a running PostgreSQL cluster onto a local replica directory"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Subcommands>,
}

#[derive(Subcommand, Debug)]
enum Subcommands {
    /// Catch a destination data directory up to a running source instance,
    /// copying everything or only the blocks that changed since the
    /// destination's last checkpoint.
    Catchup(catchup::CatchupArgs),
}

/// Parse CLI arguments into internal representation.
pub fn parse_args<I, S>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv: Vec<String> = args.into_iter().map(Into::into).collect();
    let cli = Cli::parse_from(argv);
    let command = match cli.command {
        Some(Subcommands::Catchup(args)) => Command::Catchup(args),
        None => Command::None,
    };

    Ok(CliArgs { command })
}

/// Build the underlying clap `Command` (useful for help/usage contract tests).
pub fn clap_command() -> clap::Command {
    Cli::command()
}
