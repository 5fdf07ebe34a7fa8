//! Backup command - encrypted snapshots of the document store

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Subcommand;
use colored::Colorize;

use super::{confirm, get_context};
use crate::output::{self, format_size};
use fieldvault_core::domain::BackupKind;
use fieldvault_core::services::BackupOptions;

#[derive(Subcommand)]
pub enum BackupCommands {
    /// Create a new backup
    Create {
        /// Mark as manual; manual backups are never pruned
        #[arg(long)]
        manual: bool,
        /// Free-text note stored in the manifest
        #[arg(long)]
        note: Option<String>,
        /// Leave the snapshot as a plain directory
        #[arg(long)]
        no_encrypt: bool,
        /// Automatic backups to keep afterwards (defaults to settings)
        #[arg(long)]
        keep: Option<usize>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List available backups
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Backup count, total size, free disk space and the latest backup
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the full manifest of one backup
    Show {
        /// Backup name
        name: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check an artifact against its checksum file
    Verify {
        /// Backup name or artifact path
        name: String,
    },
    /// Decrypt an artifact into a directory
    Decrypt {
        /// Backup name or artifact path
        name: String,
        /// Directory to extract into
        #[arg(long = "output", short = 'o', default_value = ".")]
        output_dir: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Replace the store content with a backup
    Restore {
        /// Backup name to restore
        name: String,
        /// Skip confirmation prompt
        #[arg(long)]
        confirm: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete one backup
    Delete {
        name: String,
        /// Skip confirmation prompt
        #[arg(long, short = 'f')]
        force: bool,
    },
    /// Delete old automatic backups
    Prune {
        /// Automatic backups to keep (defaults to settings)
        #[arg(long)]
        keep: Option<usize>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

pub fn run(command: BackupCommands) -> Result<()> {
    let ctx = get_context()?;
    let service = ctx.backup_service();

    match command {
        BackupCommands::Create {
            manual,
            note,
            no_encrypt,
            keep,
            json,
        } => {
            let kind = if manual { BackupKind::Manual } else { BackupKind::Automatic };
            let created = service.create_backup(&BackupOptions {
                kind,
                note,
                encrypt: !no_encrypt,
            })?;
            let pruned = if kind == BackupKind::Automatic {
                service.apply_retention(keep.unwrap_or(ctx.config.keep_automatic))?
            } else {
                Vec::new()
            };

            if json {
                return output::json(&serde_json::json!({
                    "backup": created,
                    "pruned": pruned,
                }));
            }
            output::success("Backup created");
            println!("  Name: {}", created.name);
            println!("  Path: {}", created.path.display());
            println!("  Documents: {}", created.manifest.total_documents);
            if let Some(checksum) = &created.checksum {
                println!("  SHA-256: {}", checksum);
            }
            if !created.manifest.encrypted {
                output::warning("Backup is not encrypted; protect it like the live store");
            }
            if !pruned.is_empty() {
                println!("  Pruned: {}", pruned.join(", "));
            }
        }
        BackupCommands::List { json } => {
            let backups = service.list()?;

            if json {
                return output::json(&backups);
            }
            if backups.is_empty() {
                println!("No backups found.");
                return Ok(());
            }

            let mut table = output::create_table();
            table.set_header(vec!["Name", "Created", "Type", "Encrypted", "Documents", "Size", "Note"]);
            for backup in &backups {
                let kind = if backup.complete {
                    backup.kind.as_str().to_string()
                } else {
                    format!("{} (incomplete)", backup.kind.as_str())
                };
                table.add_row(vec![
                    backup.name.clone(),
                    backup.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    kind,
                    if backup.encrypted { "yes" } else { "no" }.to_string(),
                    backup.total_documents.to_string(),
                    backup.size_display(),
                    backup.note.clone().unwrap_or_default(),
                ]);
            }
            println!("{}", table);
        }
        BackupCommands::Status { json } => {
            let status = service.status()?;
            if json {
                return output::json(&status);
            }
            println!("{}", "Backup Status".bold());
            println!("  Directory: {}", status.backup_dir.display());
            println!("  Backups: {} ({} incomplete)", status.count, status.incomplete);
            println!("  Total size: {}", format_size(status.total_size_bytes));
            match status.free_bytes {
                Some(free) if status.low_disk_space => {
                    println!("  Free space: {}", format_size(free).yellow())
                }
                Some(free) => println!("  Free space: {}", format_size(free)),
                None => println!("  Free space: unknown (directory not created yet)"),
            }
            match &status.latest {
                Some(latest) => println!(
                    "  Latest: {} ({}, {})",
                    latest.name,
                    latest.kind.as_str(),
                    latest.created_at.format("%Y-%m-%d %H:%M:%S")
                ),
                None => println!("  Latest: none"),
            }
        }
        BackupCommands::Show { name, json } => {
            let manifest = service.details(&name)?;
            if json {
                return output::json(&manifest);
            }
            println!("{}", name.bold());
            println!("  Created: {}", manifest.timestamp.format("%Y-%m-%d %H:%M:%S"));
            println!("  Type: {}", manifest.backup_type.as_str());
            println!("  Database: {}", manifest.database);
            println!("  Encrypted: {}", if manifest.encrypted { "yes" } else { "no" });
            println!("  Payload: {}", format_size(manifest.payload_size_bytes));
            if let Some(artifact) = manifest.artifact_size_bytes {
                println!("  Artifact: {}", format_size(artifact));
            }
            if let Some(note) = &manifest.note {
                println!("  Note: {}", note);
            }

            let mut table = output::create_table();
            table.set_header(vec!["Collection", "Documents"]);
            for (collection, count) in &manifest.collections {
                table.add_row(vec![collection.clone(), count.to_string()]);
            }
            table.add_row(vec!["total".to_string(), manifest.total_documents.to_string()]);
            println!("{}", table);
        }
        BackupCommands::Verify { name } => {
            if service.verify_checksum(&name)? {
                output::success(&format!("Checksum matches: {}", name));
            } else {
                bail!("Checksum mismatch for {}; the artifact was modified or truncated", name);
            }
        }
        BackupCommands::Decrypt { name, output_dir, json } => {
            let decrypted = service.decrypt_backup(&name, &output_dir)?;
            if json {
                return output::json(&decrypted);
            }
            output::success("Backup decrypted");
            println!("  Directory: {}", decrypted.dir.display());
            println!("  Documents: {}", decrypted.manifest.total_documents);
        }
        BackupCommands::Restore { name, confirm: confirmed, json } => {
            let confirmed = confirmed
                || (!json
                    && confirm(&format!(
                        "Replace the whole store with backup '{}'? A safety backup is taken first.",
                        name
                    ))?);
            if !confirmed {
                println!("Cancelled. Pass --confirm to restore without a prompt.");
                return Ok(());
            }

            let report = service.restore(&name, true)?;
            if json {
                return output::json(&report);
            }
            output::success(&format!("Store restored from backup: {}", report.name));
            println!("  Safety backup: {}", report.safety_backup);
            for (collection, count) in &report.collections {
                println!("  {}: {} documents", collection, count);
            }
        }
        BackupCommands::Delete { name, force } => {
            if !force && !confirm(&format!("Delete backup '{}'?", name))? {
                println!("Cancelled.");
                return Ok(());
            }
            let removed = service.delete(&name)?;
            println!("Deleted backup {}", removed.name);
        }
        BackupCommands::Prune { keep, json } => {
            let removed = service.apply_retention(keep.unwrap_or(ctx.config.keep_automatic))?;
            if json {
                return output::json(&serde_json::json!({ "deleted": removed }));
            }
            if removed.is_empty() {
                println!("Nothing to prune.");
            } else {
                println!("Deleted {} automatic backup(s)", removed.len().to_string().bold());
            }
        }
    }

    Ok(())
}
