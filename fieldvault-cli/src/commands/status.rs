//! Status command - migration state of each configured collection

use anyhow::Result;
use colored::Colorize;

use super::get_context;
use crate::output;

pub fn run(collection: Option<String>, json: bool) -> Result<()> {
    let ctx = get_context()?;
    let collections: Vec<String> = match collection {
        Some(c) => vec![c],
        None => ctx.config.sensitive_fields.keys().cloned().collect(),
    };

    let mut analyses = Vec::with_capacity(collections.len());
    for name in &collections {
        analyses.push(ctx.migration_runner(name).analyze(name)?);
    }

    if json {
        return output::json(&analyses);
    }

    println!("{}", "Field Migration Status".bold());
    for analysis in &analyses {
        println!();
        let summary = format!(
            "{}: {} documents, {} pending",
            analysis.collection, analysis.total_documents, analysis.pending_documents
        );
        if analysis.pending_documents == 0 {
            println!("{}", summary.green());
        } else {
            println!("{}", summary.yellow());
        }

        let mut table = output::create_table();
        table.set_header(vec!["Field", "Absent", "Plaintext", "Encrypted, no hash", "Encrypted + hash"]);
        for field in &analysis.fields {
            table.add_row(vec![
                field.field.clone(),
                field.absent.to_string(),
                field.plaintext.to_string(),
                field.encrypted_no_hash.to_string(),
                field.encrypted_with_hash.to_string(),
            ]);
        }
        println!("{}", table);
    }

    Ok(())
}
