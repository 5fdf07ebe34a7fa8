//! Migrate command - seal sensitive fields of one collection in place

use anyhow::{bail, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use super::{get_context, get_logger, log_event};
use crate::output;
use fieldvault_core::domain::BackupKind;
use fieldvault_core::services::{BackupOptions, LogEvent, MigrationReport, VerificationReport};

pub struct MigrateArgs {
    pub collection: String,
    pub dry_run: bool,
    pub batch_size: Option<usize>,
    pub limit: Option<u64>,
    pub verify_only: bool,
    pub backup: bool,
    pub json: bool,
}

fn progress_bar(show: bool) -> Result<Option<ProgressBar>> {
    if !show || !atty::is(atty::Stream::Stderr) {
        return Ok(None);
    }
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} documents ({msg})")?
            .progress_chars("=> "),
    );
    Ok(Some(bar))
}

pub fn run(args: MigrateArgs) -> Result<()> {
    let ctx = get_context()?;
    let runner = ctx.migration_runner(&args.collection);
    let mut options = ctx.migration_options();

    if args.verify_only {
        let report = runner.verify(&args.collection, options.verify_sample)?;
        if args.json {
            output::json(&report)?;
        } else {
            print_verification(&report);
        }
        report.into_result()?;
        return Ok(());
    }

    if let Some(size) = args.batch_size {
        options.batch_size = size;
    }
    options.dry_run = args.dry_run;
    options.max_documents = args.limit;

    if args.backup && !args.dry_run {
        let backups = ctx.backup_service();
        let created = backups.create_backup(&BackupOptions {
            kind: BackupKind::Automatic,
            note: Some(format!("before migrating {}", args.collection)),
            encrypt: true,
        })?;
        backups.apply_retention(ctx.config.keep_automatic)?;
        if !args.json {
            output::info(&format!("Backup created: {}", created.name));
        }
    }

    if !args.dry_run {
        log_event(
            &get_logger(),
            LogEvent::new("migrate_started")
                .with_command("migrate")
                .with_collection(&args.collection),
        );
    }

    let bar = progress_bar(!args.json)?;
    let report = runner.run(&args.collection, &options, |p| {
        if let Some(bar) = &bar {
            bar.set_length(p.pending);
            bar.set_position(p.processed);
            bar.set_message(format!("batch {}, {} errors", p.batch, p.errors));
        }
    })?;
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    if !report.dry_run {
        let event = LogEvent::new("migrate_completed")
            .with_command("migrate")
            .with_collection(&report.collection);
        let event = if report.errors > 0 {
            event.with_error(format!("{} document(s) failed", report.errors))
        } else {
            event
        };
        log_event(&get_logger(), event);
    }

    if args.json {
        output::json(&report)?;
    } else {
        print_report(&report);
    }

    if report.errors > 0 {
        bail!(
            "{} document(s) in '{}' could not be migrated; rerun to retry them",
            report.errors,
            report.collection
        );
    }
    if let Some(verification) = report.verification {
        verification.into_result()?;
    }
    Ok(())
}

fn print_report(report: &MigrationReport) {
    let title = if report.dry_run {
        format!("Dry run for '{}'", report.collection)
    } else {
        format!("Migrated '{}'", report.collection)
    };
    println!("{}", title.bold());

    let verb = if report.dry_run { "Would migrate" } else { "Migrated" };
    println!("  Selected:  {}", report.scanned);
    println!("  {}: {}", verb, report.migrated);
    println!("  Unchanged: {}", report.unchanged);
    if report.errors > 0 {
        println!("  {} {}", "Errors:".red(), report.errors);
        for id in &report.failed_ids {
            println!("    {}", id);
        }
    }
    if report.interrupted {
        output::warning("Stopped before the end of the collection; run again to continue");
    }
    if let Some(verification) = &report.verification {
        print_verification(verification);
    }
}

fn print_verification(report: &VerificationReport) {
    if report.is_ok() {
        output::success(&format!("Verified {} sampled value(s)", report.checked));
    } else {
        output::error(&format!(
            "{} of {} sampled value(s) failed verification",
            report.failures.len(),
            report.checked
        ));
        for failure in &report.failures {
            println!("  {} {}: {}", failure.id, failure.field, failure.reason);
        }
    }
    if !report.fields_without_samples.is_empty() {
        println!("  No encrypted values to sample for: {}", report.fields_without_samples.join(", "));
    }
}
