//! Lookup command - find records by identifier

use anyhow::{anyhow, Result};
use colored::Colorize;
use serde_json::Value;

use super::get_context;
use crate::output;
use fieldvault_core::domain::{HASH_SUFFIX, ID_FIELD};

pub fn run(collection: &str, field: &str, value: &str, json: bool) -> Result<()> {
    let ctx = get_context()?;
    let result = ctx.lookup_service(collection).lookup(collection, field, value);

    if json {
        return output::json(&result);
    }

    let records = match (result.success, result.data) {
        (true, Some(records)) => records,
        _ => return Err(anyhow!(result.error.unwrap_or_else(|| "Lookup failed".to_string()))),
    };
    if records.is_empty() {
        println!("No records found.");
        return Ok(());
    }

    println!("{}", format!("{} record(s)", records.len()).bold());
    for record in records {
        println!();
        let id = record.id().unwrap_or_default();
        println!("{}", id.cyan());
        for (key, value) in record.as_map() {
            // search hashes mean nothing to a reader
            if key == ID_FIELD || key.ends_with(HASH_SUFFIX) {
                continue;
            }
            println!("  {}: {}", key, display_value(value));
        }
    }
    Ok(())
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
