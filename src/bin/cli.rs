//! Agent Assist CLI - run each pipeline stage from the command line
//!
//! Usage: agent-assist-cli [OPTIONS] <COMMAND>
//!
//! Stages read and write CSV/JSONL files, so they can be run one at a time
//! and resumed. `--json` prints machine-readable reports.

use agent_assist_lib::{
    cleaning, deriver, labeling_pass, logging, organizer, records, settings,
    embeddings::LocalEmbedder,
    labeler::TaxonomyLabeler,
    llm_client::{ChatClient, LlmClient, RetryPolicy, Retrying},
    table::Table,
    taxonomy::{MatchOn, ParentTopicMap, Taxonomy},
};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

// ============================================================================
// Main CLI Structure
// ============================================================================

#[derive(Parser)]
#[command(name = "agent-assist-cli")]
#[command(version, about = "HR agent-assist error taxonomy pipeline", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Output reports as JSON for scripting
    #[arg(long, global = true)]
    json: bool,

    /// Only warnings and errors
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge every CSV export in a folder into the canonical schema
    Merge {
        /// Folder of raw CSV exports
        dir: PathBuf,
        #[arg(long, short, default_value = "data/processed/cleaned_feedback.csv")]
        output: PathBuf,
    },
    /// Strip noise, add time/length features, shorten summaries
    Clean {
        input: PathBuf,
        #[arg(long, short, default_value = "data/processed/final_cleaned_feedback.csv")]
        output: PathBuf,
        /// Drop rows whose summary classifies as noise before cleaning
        #[arg(long)]
        drop_noise: bool,
    },
    /// Most common n-grams in a column, classified for review
    Phrases {
        input: PathBuf,
        #[arg(long, default_value = "Knowledge_Answer")]
        column: String,
        #[arg(long, default_value = "2")]
        min_n: usize,
        #[arg(long, default_value = "4")]
        max_n: usize,
        #[arg(long, default_value = "20")]
        min_df: usize,
        #[arg(long, default_value = "300")]
        top: usize,
        #[arg(long, short, default_value = "classified_phrases.csv")]
        output: PathBuf,
    },
    /// Derive failure statements for one batch of topics (resumable)
    Derive {
        /// CSV with Knowledge_Answer, Feedback and topic_label columns
        input: PathBuf,
        /// Topics per batch (default: settings)
        #[arg(long)]
        batch_size: Option<usize>,
        /// Batch index to process
        #[arg(long, default_value = "0")]
        start_batch: usize,
        /// Keep going through every batch after start_batch
        #[arg(long)]
        all: bool,
        #[arg(long, default_value = "llm_findings.csv")]
        store: PathBuf,
    },
    /// Derive structured analyses for every topic concurrently
    DeriveParallel {
        input: PathBuf,
        /// Concurrent LLM calls (default: settings)
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long, default_value = "llm_responses.jsonl")]
        store: PathBuf,
        /// Also export the responses to this CSV when done
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Ask the model to propose failure categories from a fixed sample
    Survey {
        input: PathBuf,
        /// Append responses to this JSONL file
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// Convert a JSONL store of analyses into error-analysis rows
    Organize {
        jsonl: PathBuf,
        #[arg(long, short, default_value = "data/processed/error_analysis.csv")]
        output: PathBuf,
        /// Skip the LLM repair stage for malformed JSON
        #[arg(long)]
        no_repair_prompt: bool,
    },
    /// Fill the Parent Label column from the sub-topic map
    Parents {
        input: PathBuf,
        #[arg(long, short, default_value = "my_findings.csv")]
        output: PathBuf,
    },
    /// Label every conversation with an error cause and a category
    Label {
        input: PathBuf,
        #[arg(long, short, default_value = "final_labeled.csv")]
        output: PathBuf,
        #[arg(long)]
        error_threshold: Option<f32>,
        #[arg(long)]
        category_threshold: Option<f32>,
        /// Match error causes on their definitions instead of their labels
        #[arg(long)]
        match_definitions: bool,
    },
    /// Settings
    Config {
        #[command(subcommand)]
        cmd: ConfigCommands,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print current settings (API key masked)
    Show,
    /// Store the LLM API key (empty string clears it)
    SetKey {
        key: String,
    },
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() {
    // Ignore SIGPIPE so piping through head/tail doesn't kill the process.
    #[cfg(unix)]
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN); }

    // println! panics on a closed pipe even with SIGPIPE ignored
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe") {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let verbosity = logging::Verbosity::from_flags(cli.quiet, cli.verbose);
    let log_guard = logging::init_logging(verbosity);
    if let (Some(guard), true) = (&log_guard, cli.verbose) {
        eprintln!("Logging to: {}", guard.log_dir().display());
    }

    if let Err(e) = run_cli(cli).await {
        error!("{}", e);
        eprintln!("Error: {}", e);
        // exit skips destructors; flush the file log first
        drop(log_guard);
        std::process::exit(1);
    }
}

async fn run_cli(cli: Cli) -> Result<(), String> {
    settings::init(settings::default_dir());

    if let Commands::Completions { shell } = &cli.command {
        generate(*shell, &mut Cli::command(), "agent-assist-cli", &mut std::io::stdout());
        return Ok(());
    }

    let json = cli.json;
    let result = match cli.command {
        Commands::Merge { dir, output } => handle_merge(&dir, &output, json),
        Commands::Clean { input, output, drop_noise } => handle_clean(&input, &output, drop_noise),
        Commands::Phrases { input, column, min_n, max_n, min_df, top, output } => {
            handle_phrases(&input, &column, (min_n, max_n), min_df, top, &output, json)
        }
        Commands::Derive { input, batch_size, start_batch, all, store } => {
            handle_derive(&input, batch_size, start_batch, all, &store, json).await
        }
        Commands::DeriveParallel { input, workers, store, export } => {
            handle_derive_parallel(&input, workers, &store, export.as_deref(), json).await
        }
        Commands::Survey { input, store } => handle_survey(&input, store.as_deref(), json).await,
        Commands::Organize { jsonl, output, no_repair_prompt } => {
            handle_organize(&jsonl, &output, no_repair_prompt, json).await
        }
        Commands::Parents { input, output } => {
            let n = organizer::label_sub_topics(&input, &output, &ParentTopicMap::builtin())
                .map_err(|e| e.to_string())?;
            print_report(json, &serde_json::json!({ "rows": n, "output": output }), || {
                println!("Wrote {} rows to {}", n, output.display())
            })
        }
        Commands::Label { input, output, error_threshold, category_threshold, match_definitions } => {
            handle_label(&input, &output, error_threshold, category_threshold, match_definitions, json)
        }
        Commands::Config { cmd } => handle_config(cmd, json),
        Commands::Completions { .. } => Ok(()),
    };

    if let Err(e) = settings::flush_llm_usage() {
        warn!("Could not record LLM usage: {}", e);
    }
    result
}

// ============================================================================
// Helpers
// ============================================================================

fn print_report<T: Serialize, F: FnOnce()>(json: bool, report: &T, human: F) -> Result<(), String> {
    if json {
        let out = serde_json::to_string_pretty(report).map_err(|e| e.to_string())?;
        println!("{}", out);
    } else {
        human();
    }
    Ok(())
}

fn load_conversations(input: &Path) -> Result<Vec<records::Conversation>, String> {
    let table = Table::read_csv(input).map_err(|e| format!("Failed to read {:?}: {}", input, e))?;
    records::conversations_from_table(&table).map_err(|e| e.to_string())
}

fn chat_client(s: &settings::Settings) -> Result<ChatClient, String> {
    let client = ChatClient::from_settings(s, settings::get_api_key()).map_err(|e| e.to_string())?;
    info!("Using model {} at {}", client.model(), s.llm_base_url);
    Ok(client)
}

/// Chat client for one-off calls that have no retry loop of their own.
fn retrying_client(s: &settings::Settings) -> Result<Retrying<ChatClient>, String> {
    Ok(Retrying::new(chat_client(s)?, RetryPolicy::from_settings(s)))
}

fn print_batch_report(report: &deriver::BatchReport) {
    println!(
        "Processed {} topics, skipped {}, failed {} ({} statements)",
        report.processed, report.skipped, report.failed, report.statements
    );
}

// ============================================================================
// Handlers
// ============================================================================

fn handle_merge(dir: &Path, output: &Path, json: bool) -> Result<(), String> {
    let report = cleaning::merge_folder(dir).map_err(|e| e.to_string())?;
    report.table.write_csv(output).map_err(|e| e.to_string())?;
    let summary = serde_json::json!({
        "files": report.files,
        "skipped": report.skipped,
        "rows": report.table.len(),
        "duplicates": report.duplicates,
        "output": output,
    });
    print_report(json, &summary, || {
        println!(
            "Merged {} files into {} rows ({} duplicates removed) -> {}",
            report.files,
            report.table.len(),
            report.duplicates,
            output.display()
        );
        for skipped in &report.skipped {
            println!("  skipped: {}", skipped.display());
        }
    })
}

fn handle_clean(input: &Path, output: &Path, drop_noise: bool) -> Result<(), String> {
    let mut table = Table::read_csv(input).map_err(|e| e.to_string())?;
    if drop_noise {
        let keep = [cleaning::PhraseClass::Useful, cleaning::PhraseClass::Gray];
        let removed = cleaning::filter_by_phrase_class(&mut table, &keep).map_err(|e| e.to_string())?;
        info!("Dropped {} noise rows", removed);
    }
    let table = cleaning::finalize(table).map_err(|e| e.to_string())?;
    table.write_csv(output).map_err(|e| e.to_string())?;
    println!("Cleaned {} rows -> {}", table.len(), output.display());
    Ok(())
}

fn handle_phrases(
    input: &Path,
    column: &str,
    ngram_range: (usize, usize),
    min_df: usize,
    top: usize,
    output: &Path,
    json: bool,
) -> Result<(), String> {
    let table = Table::read_csv(input).map_err(|e| e.to_string())?;
    table.require_column(column).map_err(|e| e.to_string())?;
    let phrases = cleaning::common_phrases(&table.column_values(column), ngram_range, min_df, top);
    cleaning::write_phrases(output, &phrases).map_err(|e| e.to_string())?;
    print_report(json, &phrases, || {
        for p in phrases.iter().take(50) {
            println!("{:>6}  {:<7} {}", p.count, p.category.as_str(), p.phrase);
        }
        println!("Wrote {} phrases to {}", phrases.len(), output.display());
    })
}

async fn handle_derive(
    input: &Path,
    batch_size: Option<usize>,
    start_batch: usize,
    all: bool,
    store: &Path,
    json: bool,
) -> Result<(), String> {
    let s = settings::get();
    let client = chat_client(&s)?;
    let mut config = deriver::DeriveConfig::from_settings(&s);
    if let Some(size) = batch_size {
        config.topic_batch_size = size.max(1);
    }

    let conversations = load_conversations(input)?;
    let groups = deriver::partition_by_topic(&conversations);
    let total_batches = deriver::batch_count(groups.len(), config.topic_batch_size);
    info!("{} topics in {} batches", groups.len(), total_batches);

    let last = if all { total_batches.max(start_batch + 1) } else { start_batch + 1 };
    let started = Instant::now();
    let mut reports = Vec::new();
    let mut runner = deriver::BatchDeriver::new(&client, config);
    for batch in start_batch..last {
        let report = runner.run_batch(&groups, batch, store).await.map_err(|e| e.to_string())?;
        reports.push(report);
    }
    let _ = settings::add_derivation_time(started.elapsed().as_secs_f64());

    print_report(json, &reports, || {
        for (i, report) in reports.iter().enumerate() {
            print!("Batch {}: ", start_batch + i);
            print_batch_report(report);
        }
        println!("Findings appended to {}", store.display());
    })
}

async fn handle_derive_parallel(
    input: &Path,
    workers: Option<usize>,
    store: &Path,
    export: Option<&Path>,
    json: bool,
) -> Result<(), String> {
    let s = settings::get();
    let client = chat_client(&s)?;
    let mut config = deriver::DeriveConfig::from_settings(&s);
    if let Some(w) = workers {
        config.workers = w.max(1);
    }

    let conversations = load_conversations(input)?;
    let groups = deriver::partition_by_topic(&conversations);

    let started = Instant::now();
    let report = deriver::derive_parallel(&client, &groups, &config, store)
        .await
        .map_err(|e| e.to_string())?;
    let _ = settings::add_derivation_time(started.elapsed().as_secs_f64());

    let exported = match export {
        Some(out) => {
            info!("Exporting {:?} to {:?}", store, out);
            let repair = retrying_client(&s)?;
            let repair: &dyn LlmClient = &repair;
            Some(
                organizer::export_jsonl_to_csv(store, out, Some(repair))
                    .await
                    .map_err(|e| e.to_string())?,
            )
        }
        None => None,
    };

    let summary = serde_json::json!({ "derive": report, "export": exported });
    print_report(json, &summary, || {
        print_batch_report(&report);
        if let Some(e) = &exported {
            println!("Exported {} rows from {} responses ({} unusable)", e.rows, e.lines, e.empty);
        }
    })
}

async fn handle_survey(input: &Path, store: Option<&Path>, json: bool) -> Result<(), String> {
    let s = settings::get();
    let client = chat_client(&s)?;
    let conversations = load_conversations(input)?;
    let responses = deriver::survey_error_taxonomy(&client, &conversations, &RetryPolicy::from_settings(&s), store)
        .await
        .map_err(|e| e.to_string())?;

    print_report(json, &responses, || {
        for (i, r) in responses.iter().enumerate() {
            println!("=== Survey batch {} ===\n{}\n", i + 1, r);
        }
    })
}

async fn handle_organize(jsonl: &Path, output: &Path, no_repair_prompt: bool, json: bool) -> Result<(), String> {
    let s = settings::get();
    let client = if no_repair_prompt { None } else { retrying_client(&s).ok() };
    if client.is_none() && !no_repair_prompt {
        info!("No LLM API key; malformed responses will not be re-prompted");
    }
    let client_ref: Option<&dyn LlmClient> = client.as_ref().map(|c| c as &dyn LlmClient);

    let report = organizer::export_jsonl_to_csv(jsonl, output, client_ref)
        .await
        .map_err(|e| e.to_string())?;
    print_report(json, &report, || {
        println!(
            "Exported {} rows from {} responses ({} unusable) -> {}",
            report.rows,
            report.lines,
            report.empty,
            output.display()
        );
    })
}

fn handle_label(
    input: &Path,
    output: &Path,
    error_threshold: Option<f32>,
    category_threshold: Option<f32>,
    match_definitions: bool,
    json: bool,
) -> Result<(), String> {
    let s = settings::get();
    let mut config = labeling_pass::LabelingConfig::from_settings(&s);
    if let Some(t) = error_threshold {
        config.error_threshold = t;
    }
    if let Some(t) = category_threshold {
        config.category_threshold = t;
    }

    let embedder = LocalEmbedder::load(&s.embedding_model).map_err(|e| e.to_string())?;
    info!("Labeling with embedding model {}", embedder.model_id());
    let errors = if match_definitions {
        Taxonomy::error_causes().with_match_on(MatchOn::Definition)
    } else {
        Taxonomy::error_causes()
    };
    let error_labeler = TaxonomyLabeler::new(errors, &embedder).map_err(|e| e.to_string())?;
    let category_labeler = TaxonomyLabeler::new(Taxonomy::categories(), &embedder).map_err(|e| e.to_string())?;

    let report = labeling_pass::run_labeling_pass(input, output, &error_labeler, &category_labeler, config)
        .map_err(|e| e.to_string())?;

    print_report(json, &report, || {
        println!("{}", report.error.render());
        println!("{}", report.category.render());
        println!("Saved to {}", output.display());
    })
}

fn handle_config(cmd: ConfigCommands, json: bool) -> Result<(), String> {
    match cmd {
        ConfigCommands::Show => {
            let mut s = settings::get();
            s.llm_api_key = settings::get_masked_api_key();
            let path = settings::config_path();
            print_report(json, &s, || {
                if let Some(p) = &path {
                    println!("Settings file: {}", p.display());
                }
                println!("API key:            {}", s.llm_api_key.as_deref().unwrap_or("(not set)"));
                println!("Base URL:           {}", s.llm_base_url);
                println!("Model:              {}", s.llm_model);
                println!("Max attempts:       {}", s.llm_max_attempts);
                println!("Retry wait:         {}s", s.llm_wait_secs);
                println!("Request timeout:    {}s", s.llm_request_timeout_secs);
                println!("Pacing delay:       {}s", s.pacing_delay_secs);
                println!("Calls per minute:   {}", s.calls_per_minute);
                println!("Max prompt chars:   {}", s.max_prompt_chars);
                println!("Topic batch size:   {}", s.topic_batch_size);
                println!("Parallel workers:   {}", s.parallel_workers);
                println!("Error threshold:    {}", s.error_threshold);
                println!("Category threshold: {}", s.category_threshold);
                println!("Embedding model:    {}", s.embedding_model);
                let stats = &s.processing_stats;
                println!(
                    "Usage: {} LLM calls, {} prompt / {} completion tokens, {} derivation runs ({:.1}s total)",
                    stats.llm_calls,
                    stats.prompt_tokens,
                    stats.completion_tokens,
                    stats.derivation_runs,
                    stats.total_derivation_secs
                );
            })
        }
        ConfigCommands::SetKey { key } => {
            let clearing = key.is_empty();
            settings::set_api_key(key).map_err(|e| e.to_string())?;
            println!("{}", if clearing { "API key cleared" } else { "API key saved" });
            Ok(())
        }
    }
}
