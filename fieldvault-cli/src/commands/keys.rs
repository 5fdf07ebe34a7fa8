//! Keys command - create and inspect key material

use anyhow::{bail, Result};
use clap::Subcommand;
use colored::Colorize;

use super::get_config;
use crate::output;
use fieldvault_core::domain::KdfParams;
use fieldvault_core::services::KeyManager;

#[derive(Subcommand)]
pub enum KeysCommands {
    /// Generate key material if none exists
    Init {
        /// Derive with Argon2id instead of PBKDF2
        #[arg(long)]
        argon2: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show which key files are present
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

pub fn run(command: KeysCommands) -> Result<()> {
    let config = get_config()?;
    let manager = KeyManager::new(&config.key_dir);

    match command {
        KeysCommands::Init { argon2, json } => {
            let before = manager.status()?;
            if before.is_inconsistent() {
                bail!(
                    "Key material is incomplete in {}; restore the missing file instead of regenerating",
                    manager.key_dir().display()
                );
            }

            let params = if argon2 { KdfParams::argon2id() } else { KdfParams::new_now() };
            let material = manager.load_or_create_with(params)?;
            let created = !before.is_ready();

            if json {
                return output::json(&serde_json::json!({
                    "created": created,
                    "algorithm": material.params().algorithm.label(),
                    "key_dir": manager.key_dir(),
                }));
            }
            if created {
                output::success("Key material created");
                output::warning("Back up the key directory separately; lost keys make sealed data unreadable");
            } else {
                output::info("Key material already exists; nothing generated");
            }
            println!("  Directory: {}", manager.key_dir().display());
            println!("  Algorithm: {}", material.params().algorithm.label());
        }
        KeysCommands::Status { json } => {
            let status = manager.status()?;
            if json {
                return output::json(&status);
            }

            let state = if status.is_ready() {
                "ready".green()
            } else if status.is_inconsistent() {
                "inconsistent".red()
            } else {
                "not initialized".yellow()
            };
            println!("{} {}", "Keys:".bold(), state);
            println!("  Secret: {} ({})", status.secret_path.display(), present(status.secret_present));
            println!("  Salt:   {} ({})", status.salt_path.display(), present(status.salt_present));
            if let Some(algorithm) = &status.algorithm {
                println!("  Algorithm: {}", algorithm);
            }
            if let Some(created) = status.created_at {
                println!("  Created: {}", created.format("%Y-%m-%d %H:%M:%S"));
            }
        }
    }

    Ok(())
}

fn present(flag: bool) -> &'static str {
    if flag {
        "present"
    } else {
        "missing"
    }
}
