//! Concurrent access tests
//!
//! Writers and the migration runner share one store; every write is a single
//! atomic document replacement, so a migration racing with writers must
//! never leave a half-sealed document.
//!
//! Run with: cargo test --test concurrent_access_test -- --nocapture

use std::sync::{Arc, Barrier};
use std::thread;

use serde_json::json;
use tempfile::TempDir;

use fieldvault_core::adapters::duckdb::DuckDbDocumentStore;
use fieldvault_core::config::Config;
use fieldvault_core::domain::{Document, Filter, Page, PATIENTS_COLLECTION};
use fieldvault_core::ports::DocumentStore;
use fieldvault_core::services::{DataEncryptionKey, KeyRing, MigrationOptions};
use fieldvault_core::VaultContext;

const THREAD_COUNT: usize = 6;
const DOCS_PER_THREAD: usize = 20;

fn create_context(temp_dir: &TempDir) -> VaultContext {
    let config = Config::load_file(temp_dir.path()).unwrap();
    let store = Arc::new(DuckDbDocumentStore::open(&config.database_path).unwrap());
    let keys = Arc::new(KeyRing::derive(&DataEncryptionKey::from_bytes([4; 32])).unwrap());
    VaultContext::with_parts(config, store, keys)
}

fn patient(thread_id: usize, n: usize) -> Document {
    Document::from_value(json!({
        "_id": format!("t{thread_id}-{n:03}"),
        "nhs_number": format!("{:010}", thread_id * 1000 + n),
        "mrn": format!("M{thread_id}{n}"),
    }))
    .unwrap()
}

#[test]
fn test_concurrent_writers_share_one_store() {
    let temp = TempDir::new().unwrap();
    let ctx = Arc::new(create_context(&temp));
    let barrier = Arc::new(Barrier::new(THREAD_COUNT));

    let handles: Vec<_> = (0..THREAD_COUNT)
        .map(|thread_id| {
            let ctx = Arc::clone(&ctx);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let transform = ctx.transform_for(PATIENTS_COLLECTION);
                for n in 0..DOCS_PER_THREAD {
                    let sealed = transform.seal_document(&patient(thread_id, n)).unwrap();
                    ctx.store.put(PATIENTS_COLLECTION, &sealed).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(
        ctx.store.count(PATIENTS_COLLECTION, &Filter::All).unwrap(),
        (THREAD_COUNT * DOCS_PER_THREAD) as u64
    );
    let runner = ctx.migration_runner(PATIENTS_COLLECTION);
    assert_eq!(runner.analyze(PATIENTS_COLLECTION).unwrap().pending_documents, 0);
}

#[test]
fn test_migration_racing_with_plaintext_writers() {
    let temp = TempDir::new().unwrap();
    let ctx = Arc::new(create_context(&temp));
    for n in 0..DOCS_PER_THREAD {
        ctx.store.put(PATIENTS_COLLECTION, &patient(0, n)).unwrap();
    }

    let barrier = Arc::new(Barrier::new(2));
    let writer = {
        let ctx = Arc::clone(&ctx);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for n in 0..DOCS_PER_THREAD {
                ctx.store.put(PATIENTS_COLLECTION, &patient(1, n)).unwrap();
            }
        })
    };
    let migrator = {
        let ctx = Arc::clone(&ctx);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            let options = MigrationOptions {
                batch_size: 5,
                ..MigrationOptions::default()
            };
            ctx.migration_runner(PATIENTS_COLLECTION)
                .run(PATIENTS_COLLECTION, &options, |_| {})
                .unwrap()
        })
    };
    writer.join().unwrap();
    let first = migrator.join().unwrap();
    assert_eq!(first.errors, 0);

    // whatever the first pass missed, a second pass finishes
    ctx.migration_runner(PATIENTS_COLLECTION)
        .run(PATIENTS_COLLECTION, &MigrationOptions::default(), |_| {})
        .unwrap();

    let runner = ctx.migration_runner(PATIENTS_COLLECTION);
    assert_eq!(runner.analyze(PATIENTS_COLLECTION).unwrap().pending_documents, 0);

    let transform = ctx.transform_for(PATIENTS_COLLECTION);
    for doc in ctx.store.find(PATIENTS_COLLECTION, &Filter::All, &Page::default()).unwrap() {
        let plain = transform.decrypt_document(&doc).unwrap();
        assert_eq!(plain.as_map()["nhs_number"].as_str().unwrap().len(), 10);
    }
}
