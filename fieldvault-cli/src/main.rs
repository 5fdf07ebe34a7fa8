//! FieldVault CLI - field-level encryption for a shared document store

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::{backup, keys, logs, lookup, migrate, status};
use fieldvault_core::services::LogEvent;

/// FieldVault - encrypted sensitive fields, searchable by hash
#[derive(Parser)]
#[command(name = "fv", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage key material
    Keys {
        #[command(subcommand)]
        command: keys::KeysCommands,
    },

    /// Show field migration state per collection
    Status {
        /// Only this collection
        #[arg(long, short)]
        collection: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Encrypt and hash sensitive fields in place
    Migrate {
        /// Collection to migrate
        #[arg(long, short, default_value = "patients")]
        collection: String,
        /// Count what would change without writing
        #[arg(long)]
        dry_run: bool,
        /// Documents per batch (defaults to settings)
        #[arg(long)]
        batch_size: Option<usize>,
        /// Stop after this many documents
        #[arg(long)]
        limit: Option<u64>,
        /// Only verify already migrated values
        #[arg(long)]
        verify_only: bool,
        /// Take an automatic backup first
        #[arg(long)]
        backup: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Find records by an identifier through its search hash
    Lookup {
        /// Sensitive field, e.g. nhs_number
        field: String,
        /// Identifier value; spacing and (for some fields) case are ignored
        value: String,
        #[arg(long, short, default_value = "patients")]
        collection: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage encrypted backups
    Backup {
        #[command(subcommand)]
        command: backup::BackupCommands,
    },

    /// View and manage the event log
    Logs {
        #[command(subcommand)]
        command: Option<logs::LogsCommands>,
    },
}

impl Commands {
    /// Name recorded in the event log
    fn name(&self) -> &'static str {
        match self {
            Commands::Keys { .. } => "keys",
            Commands::Status { .. } => "status",
            Commands::Migrate { .. } => "migrate",
            Commands::Lookup { .. } => "lookup",
            Commands::Backup { .. } => "backup",
            Commands::Logs { .. } => "logs",
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("FIELDVAULT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let command_name = cli.command.name();
    // the log database is closed again before the command runs; `logs` opens it itself
    commands::log_event(
        &commands::get_logger(),
        LogEvent::new("command_executed").with_command(command_name),
    );

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            commands::log_event(
                &commands::get_logger(),
                LogEvent::new("command_failed")
                    .with_command(command_name)
                    .with_error(e.to_string()),
            );
            output::error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Keys { command } => keys::run(command),
        Commands::Status { collection, json } => status::run(collection, json),
        Commands::Migrate {
            collection,
            dry_run,
            batch_size,
            limit,
            verify_only,
            backup,
            json,
        } => migrate::run(migrate::MigrateArgs {
            collection,
            dry_run,
            batch_size,
            limit,
            verify_only,
            backup,
            json,
        }),
        Commands::Lookup { field, value, collection, json } => lookup::run(&collection, &field, &value, json),
        Commands::Backup { command } => backup::run(command),
        Commands::Logs { command } => logs::run(command),
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
    fn test_migrate_defaults_to_patients() {
        let cli = Cli::try_parse_from(["fv", "migrate", "--dry-run"]).unwrap();
        match cli.command {
            Commands::Migrate { collection, dry_run, .. } => {
                assert_eq!(collection, "patients");
                assert!(dry_run);
            }
            _ => panic!("expected migrate"),
        }
    }

    #[test]
    fn test_backup_show_takes_a_name() {
        let cli = Cli::try_parse_from(["fv", "backup", "show", "2025-01-15_10-30-00_000001"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Backup {
                command: backup::BackupCommands::Show { ref name, json: false }
            } if name == "2025-01-15_10-30-00_000001"
        ));
        assert!(Cli::try_parse_from(["fv", "backup", "show"]).is_err());
    }
}
