//! Batch error derivation script
//!
//! Walks every topic batch of a cleaned conversation file in order, appending
//! derived failure statements to the findings CSV. Re-run with a later start
//! batch to resume after an interruption.
//!
//! Usage: cargo run --bin batch_errors --release -- <input.csv> [store.csv] [start_batch]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use agent_assist_lib::deriver::{self, BatchDeriver, DeriveConfig};
use agent_assist_lib::llm_client::ChatClient;
use agent_assist_lib::logging;
use agent_assist_lib::records;
use agent_assist_lib::settings;
use agent_assist_lib::table::Table;

const DEFAULT_STORE: &str = "llm_findings.csv";
const BATCH_PAUSE: Duration = Duration::from_secs(5);

struct Args {
    input: PathBuf,
    store: PathBuf,
    start_batch: usize,
}

#[tokio::main]
async fn main() {
    let _log_guard = logging::init_logging(logging::Verbosity::Normal);

    println!("==============================================");
    println!("  Batch Error Derivation");
    println!("==============================================");
    println!();

    let args = match parse_args() {
        Some(a) => a,
        None => {
            eprintln!("Usage: batch_errors <input.csv> [store.csv] [start_batch]");
            std::process::exit(2);
        }
    };

    settings::init(settings::default_dir());
    let s = settings::get();

    let client = match ChatClient::from_settings(&s, settings::get_api_key()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[Batch] ERROR: {}", e);
            std::process::exit(1);
        }
    };
    println!("[Batch] Model: {} ({})", client.model(), s.llm_base_url);

    let conversations = match Table::read_csv(&args.input)
        .and_then(|t| records::conversations_from_table(&t))
    {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[Batch] ERROR: Failed to load {:?}: {}", args.input, e);
            std::process::exit(1);
        }
    };

    let config = DeriveConfig::from_settings(&s);
    let groups = deriver::partition_by_topic(&conversations);
    let total_batches = deriver::batch_count(groups.len(), config.topic_batch_size);
    println!("[Batch] {} conversations, {} topics, {} batches of {}",
        conversations.len(), groups.len(), total_batches, config.topic_batch_size);
    println!("[Batch] Appending findings to {:?}", args.store);
    if args.start_batch > 0 {
        println!("[Batch] Resuming at batch {}", args.start_batch);
    }
    println!();

    let start_time = Instant::now();
    let mut totals = deriver::BatchReport::default();
    let mut failed_batches: Vec<usize> = Vec::new();
    let mut deriver = BatchDeriver::new(&client, config);

    for batch in args.start_batch..total_batches {
        println!("----------------------------------------------");
        println!("[{}/{}] Batch {}", batch + 1, total_batches, batch);
        println!("----------------------------------------------");

        let batch_start = Instant::now();
        match deriver.run_batch(&groups, batch, &args.store).await {
            Ok(report) => {
                totals.processed += report.processed;
                totals.skipped += report.skipped;
                totals.failed += report.failed;
                totals.statements += report.statements;
                println!("[{}/{}] DONE: {} topics, {} skipped, {} failed, {} statements ({:.1}s)",
                    batch + 1, total_batches,
                    report.processed, report.skipped, report.failed, report.statements,
                    batch_start.elapsed().as_secs_f64());
            }
            Err(e) => {
                eprintln!("[{}/{}] FAILED: {}", batch + 1, total_batches, e);
                failed_batches.push(batch);
            }
        }
        println!();

        if batch + 1 < total_batches {
            println!("[Batch] Waiting {} seconds before next batch...", BATCH_PAUSE.as_secs());
            tokio::time::sleep(BATCH_PAUSE).await;
        }
    }

    let total_elapsed = start_time.elapsed();
    if let Err(e) = settings::add_derivation_time(total_elapsed.as_secs_f64()) {
        eprintln!("[Batch] WARNING: Could not record run time: {}", e);
    }
    if let Err(e) = settings::flush_llm_usage() {
        eprintln!("[Batch] WARNING: Could not record LLM usage: {}", e);
    }

    println!("==============================================");
    println!("  BATCH DERIVATION COMPLETE");
    println!("==============================================");
    println!();
    println!("Total time: {:.1} minutes", total_elapsed.as_secs_f64() / 60.0);
    println!("Topics processed: {}", totals.processed);
    println!("Topics skipped: {}", totals.skipped);
    println!("Topics failed: {}", totals.failed);
    println!("Statements written: {}", totals.statements);

    if !failed_batches.is_empty() {
        println!();
        println!("Failed batches ({}), resume with:", failed_batches.len());
        for b in &failed_batches {
            println!("  batch_errors {} {} {}", args.input.display(), args.store.display(), b);
        }
    }

    println!();
}

fn parse_args() -> Option<Args> {
    let mut argv = std::env::args().skip(1);
    let input = PathBuf::from(argv.next()?);
    let store = argv.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_STORE));
    let start_batch = match argv.next() {
        Some(s) => match s.parse() {
            Ok(n) => n,
            Err(_) => {
                eprintln!("[Batch] WARNING: Ignoring invalid start batch '{}'", s);
                0
            }
        },
        None => 0,
    };
    Some(Args { input, store, start_batch })
}
