//! `sessdex sync` - bring the index up to date with the session logs on disk.

use crate::process_lock::acquire_ingest_guard;
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use sessdex_core::catalog::{CatalogRoot, FileCatalog};
use sessdex_core::format::shorten_path;
use sessdex_core::ingest::parsers::parser_for;
use sessdex_core::{
    CacheStore, CachedFingerprint, ChangeDetector, ChangeEvent, Config, IndexService,
    RefreshSummary, Scope,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(clap::Args)]
pub struct SyncArgs {
    /// Verbose output (-v lists parsed files and parse failures)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Dry run - catalog and classify files but parse nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Watch mode - keep the index current until interrupted
    #[arg(short, long)]
    pub watch: bool,
}

pub fn run(config: &Config, args: &SyncArgs) -> Result<()> {
    if args.dry_run {
        return run_dry_run(config);
    }

    let db_path = config.store_path();
    let _ingest_guard = acquire_ingest_guard(&db_path).context("failed to acquire process lock")?;
    println!("Store: {}", db_path.display());

    crate::runtime()?.block_on(async {
        let service = IndexService::start(config).context("failed to start index")?;
        let result = run_single_sync(&service, args.verbose).await;
        let result = match result {
            Ok(()) if args.watch => run_watch_mode(&service, args.verbose).await,
            other => other,
        };
        service.shutdown().await.context("failed to stop index")?;
        result
    })
}

/// One full refresh with a spinner.
async fn run_single_sync(service: &IndexService, verbose: u8) -> Result<()> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message("Cataloging...");

    let failures = Arc::new(Mutex::new(Vec::new()));
    let written = Arc::new(AtomicUsize::new(0));
    let subscription = {
        let pb = pb.clone();
        let failures = Arc::clone(&failures);
        let written = Arc::clone(&written);
        service.subscribe(move |event| match event {
            ChangeEvent::Inserted {
                session_id,
                parse_error,
            }
            | ChangeEvent::Updated {
                session_id,
                parse_error,
            } => {
                if let Some(err) = parse_error {
                    failures
                        .lock()
                        .unwrap()
                        .push((session_id.clone(), err.clone()));
                }
                let n = written.fetch_add(1, Ordering::Relaxed) + 1;
                pb.set_message(format!("{n} session(s) written"));
            }
            ChangeEvent::RootState { root, state } => {
                pb.set_message(format!("{}: {}", shorten_path(root), state.as_str()));
            }
            _ => {}
        })
    };

    let summary = service.refresh(Scope::All).await;
    service.unsubscribe(subscription);
    pb.finish_and_clear();
    let summary = summary.context("sync failed")?;

    let failures = failures.lock().unwrap().clone();
    print_sync_result(&summary, &failures, verbose);

    tracing::info!(
        parsed = summary.parsed,
        deleted = summary.deleted,
        written = summary.records_written,
        "sessdex sync complete"
    );

    if summary.store_failed {
        anyhow::bail!(
            "some writes could not be committed; run sync again (see {})",
            sessdex_core::logging::log_file_for(chrono::Utc::now().date_naive()).display()
        );
    }
    Ok(())
}

/// Watch the roots until Ctrl+C.
async fn run_watch_mode(service: &IndexService, verbose: u8) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    service.watch().context("failed to start file watcher")?;

    println!("Watch mode active. Press Ctrl+C to stop.");
    println!();

    let subscription = service.subscribe(move |event| {
        let timestamp = chrono::Local::now().format("%H:%M:%S");
        match event {
            ChangeEvent::Inserted {
                session_id,
                parse_error,
            } => {
                println!("[{timestamp}] New session: {session_id}");
                if let (Some(err), true) = (parse_error, verbose >= 1) {
                    println!("  Parse error: {err}");
                }
            }
            ChangeEvent::Updated {
                session_id,
                parse_error,
            } => {
                println!("[{timestamp}] Updated: {session_id}");
                if let (Some(err), true) = (parse_error, verbose >= 1) {
                    println!("  Parse error: {err}");
                }
            }
            ChangeEvent::Deleted { session_id } => {
                println!("[{timestamp}] Removed: {session_id}");
            }
            ChangeEvent::StoreFailed {
                message, retry_in, ..
            } => {
                eprintln!(
                    "[{timestamp}] Store write failed: {message} (retrying in {}ms)",
                    retry_in.as_millis()
                );
            }
            _ => {}
        }
    });

    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    service.unsubscribe(subscription);
    service.stop_watching();
    println!("Watch mode stopped.");
    tracing::info!("sessdex sync watch mode stopped");

    Ok(())
}

/// Catalog every root and classify against the store without parsing.
fn run_dry_run(config: &Config) -> Result<()> {
    config.validate()?;
    let roots = config.enabled_roots();
    let catalog = FileCatalog::new(
        roots
            .iter()
            .map(|root| CatalogRoot {
                path: root.resolved_path(),
                patterns: parser_for(root.source)
                    .source_patterns()
                    .into_iter()
                    .map(|p| p.pattern)
                    .collect(),
            })
            .collect(),
    );

    let db_path = config.store_path();
    let cached: Vec<CachedFingerprint> = if db_path.exists() {
        CacheStore::open(&db_path)
            .context("failed to open store")?
            .load_fingerprints()?
    } else {
        Vec::new()
    };

    println!("Configured {} root(s):", roots.len());
    let mut entries = Vec::new();
    let mut present: Vec<PathBuf> = Vec::new();
    for (idx, root) in roots.iter().enumerate() {
        let path = root.resolved_path();
        if !path.is_dir() {
            println!(
                "  - {}: not found at {}",
                root.source.display_name(),
                shorten_path(&path)
            );
            continue;
        }
        let mut enumeration = catalog.enumerate_root(idx);
        let found: Vec<_> = enumeration.by_ref().collect();
        println!(
            "  - {}: {} file(s) at {}",
            root.source.display_name(),
            found.len(),
            shorten_path(&path)
        );
        if enumeration.skipped() > 0 {
            println!("    {} unreadable entries skipped", enumeration.skipped());
        }
        entries.extend(found);
        present.push(path);
    }

    // Rows under a missing root are left alone by a real sync too
    let responsible: HashMap<PathBuf, CachedFingerprint> = cached
        .into_iter()
        .filter(|c| present.iter().any(|root| c.path.starts_with(root)))
        .map(|c| (c.path.clone(), c))
        .collect();
    let classification = ChangeDetector::new().classify(entries, &responsible);

    println!("\nDry run - nothing parsed or written:");
    println!("  New:       {}", classification.new.len());
    println!("  Modified:  {}", classification.modified.len());
    println!("  Unchanged: {}", classification.unchanged.len());
    println!("  Deleted:   {}", classification.deleted.len());
    tracing::info!("Dry run complete");

    Ok(())
}

fn print_sync_result(summary: &RefreshSummary, failures: &[(String, String)], verbose: u8) {
    println!("\nSync complete:");
    println!("  Files scanned:    {}", summary.scanned);
    println!("  New:              {}", summary.new);
    println!("  Modified:         {}", summary.modified);
    println!("  Unchanged:        {}", summary.unchanged);
    println!("  Deleted:          {}", summary.deleted);
    println!("  Parsed:           {}", summary.parsed);
    println!("  Parse failures:   {}", summary.parse_failures);
    println!("  Sessions written: {}", summary.records_written);
    if summary.skipped_entries > 0 {
        println!("  Unreadable:       {}", summary.skipped_entries);
    }

    if verbose >= 1 && !summary.parsed_paths.is_empty() {
        println!("\nFiles parsed:");
        for path in &summary.parsed_paths {
            println!("  {}", shorten_path(path));
        }
    }

    if !failures.is_empty() {
        println!("\nErrors ({}):", failures.len());
        for (session_id, err) in failures {
            println!("  {}: {}", session_id, err);
        }
    }
}
