//! CLI command definitions for sentiment-forge.
//!
//! `run` scores every comment and writes results back; `fetch` only pages the
//! records out and writes them as JSON Lines.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::metrics::{export_metrics, init_metrics, MemoryCounter, ProcessMonitor};
use crate::model::ResponseMode;
use crate::pipeline::{PipelineConfig, PipelineOrchestrator, RunReport, UpsertMode};
use crate::source::{PagedSource, PostgrestPages, Record, RecordSource};
use crate::storage::{InMemoryRowStore, PostgrestClient, ResultReconciler, TableSchema};
use crate::utils::{bytes_to_mb, format_duration};

/// Batch sentiment enrichment for stored comments.
#[derive(Parser)]
#[command(name = "sentiment-forge")]
#[command(about = "Score stored comments through a sentiment model endpoint and write the results back")]
#[command(version)]
#[command(
    long_about = "sentiment-forge pages comments out of a PostgREST/Supabase table, sends them to a model endpoint in batches, and upserts sentiment, emotion and topic fields back by id.\n\nConfiguration is read from the environment (MODEL_ENDPOINT_URL, SUPABASE_URL, SUPABASE_API_KEY, ...); flags override it.\n\nExample usage:\n  sentiment-forge run --batch-size 50 --json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Fetch, score and write back every comment.
    Run(RunArgs),

    /// Page comments out of storage without scoring them.
    Fetch(FetchArgs),
}

/// Arguments for `sentiment-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Records per model request (overrides BATCH_SIZE).
    #[arg(short = 'b', long)]
    pub batch_size: Option<usize>,

    /// Stop after this many records (overrides MAX_RECORDS).
    #[arg(short = 'n', long)]
    pub max_records: Option<usize>,

    /// How to read model responses: auto, unary or stream.
    #[arg(long)]
    pub response_mode: Option<ResponseMode>,

    /// When to write results: per_batch or end_of_run.
    #[arg(long)]
    pub upsert_mode: Option<UpsertMode>,

    /// Only score rows that have no sentiment yet.
    #[arg(long)]
    pub only_pending: bool,

    /// Score everything but keep results in memory instead of writing them.
    #[arg(long)]
    pub dry_run: bool,

    /// Print the run report as JSON.
    #[arg(long)]
    pub json: bool,

    /// Write Prometheus metrics to this file when the run ends.
    #[arg(long, env = "METRICS_OUT")]
    pub metrics_out: Option<PathBuf>,
}

/// Arguments for `sentiment-forge fetch`.
#[derive(Parser, Debug)]
pub struct FetchArgs {
    /// Output file (JSON Lines). Defaults to stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Stop after this many records.
    #[arg(short = 'n', long)]
    pub max_records: Option<usize>,

    /// Only fetch rows that have no sentiment yet.
    #[arg(long)]
    pub only_pending: bool,
}

/// Parse CLI arguments without running any command.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    let cli = parse_cli();
    run_with_cli(cli).await
}

/// Run the CLI with pre-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_score_command(args).await,
        Commands::Fetch(args) => run_fetch_command(args).await,
    }
}

fn apply_run_overrides(mut config: PipelineConfig, args: &RunArgs) -> PipelineConfig {
    if let Some(size) = args.batch_size {
        config = config.with_batch_size(size);
    }
    if args.max_records.is_some() {
        config = config.with_max_records(args.max_records);
    }
    if let Some(mode) = args.response_mode {
        config = config.with_response_mode(mode);
    }
    if let Some(mode) = args.upsert_mode {
        config = config.with_upsert_mode(mode);
    }
    if args.only_pending {
        config = config.with_only_pending(true);
    }
    config
}

async fn run_score_command(args: RunArgs) -> anyhow::Result<()> {
    let config = apply_run_overrides(PipelineConfig::from_env()?, &args);
    config.validate()?;

    if args.metrics_out.is_some() {
        init_metrics().context("Failed to initialize metrics")?;
    }

    let mut orchestrator = PipelineOrchestrator::from_config(&config)?;
    if args.dry_run {
        warn!("Dry run: results are kept in memory and not written to storage");
        orchestrator = orchestrator.with_reconciler(ResultReconciler::new(
            Arc::new(InMemoryRowStore::new()),
            TableSchema::comments().with_table(&config.table),
        ));
    }

    let counter = MemoryCounter::new();
    let monitor = ProcessMonitor::start(counter.clone(), config.memory_sample_interval);
    let orchestrator = orchestrator.with_memory_counter(counter);

    let result = orchestrator.run().await;
    monitor.stop().await;

    if let Some(path) = &args.metrics_out {
        fs::write(path, export_metrics())
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
        info!(path = %path.display(), "Metrics written");
    }

    let report = result?;

    if args.json {
        let json_output = serde_json::to_string_pretty(&report)
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{}", json_output);
    } else {
        print_summary(&report, args.dry_run);
    }

    Ok(())
}

fn print_summary(report: &RunReport, dry_run: bool) {
    let total = Duration::from_secs_f64(report.timing.total);
    println!("✓ Run {} ({})", report.status, report.run_id);
    if let Some(message) = &report.message {
        println!("  {}", message);
    }
    println!(
        "  Comments: {} read, {} {}",
        report.number_of_comments,
        report.number_updated,
        if dry_run { "would be updated" } else { "updated" }
    );
    println!(
        "  Batches: {}/{} (size {})",
        report.batch_info.batches_completed,
        report.batch_info.number_of_batches,
        report.batch_info.batch_size
    );
    println!(
        "  Timing: fetch {}, dispatch {}, reconcile {}, total {}",
        format_duration(Duration::from_secs_f64(report.timing.fetch)),
        format_duration(Duration::from_secs_f64(report.timing.dispatch)),
        format_duration(Duration::from_secs_f64(report.timing.reconcile)),
        format_duration(total)
    );
    if let Some(sent) = report.model_metrics.get("request_bytes") {
        println!("  Sent: {:.2} MB", bytes_to_mb(*sent as usize));
    }
    if let Some(peak) = report.model_metrics.get("process_peak_memory_mb") {
        println!("  Peak memory: {:.1} MB", peak);
    }
    if report.reconcile_failures > 0 || report.malformed_results > 0 || report.unmatched_results > 0
    {
        println!(
            "  Problems: {} failed upserts, {} malformed results, {} unmatched results",
            report.reconcile_failures, report.malformed_results, report.unmatched_results
        );
    }
}

async fn run_fetch_command(args: FetchArgs) -> anyhow::Result<()> {
    let config = PipelineConfig::from_env()?
        .with_max_records(args.max_records)
        .with_only_pending(args.only_pending);
    config.validate()?;

    let client = PostgrestClient::new(
        &config.storage_url,
        &config.storage_api_key,
        config.request_timeout,
    )?;
    let source = PagedSource::new(
        PostgrestPages::new(client, &config.table).with_only_pending(config.only_pending),
        config.page_size,
    )
    .with_max_records(config.max_records);

    let outcome = source.fetch_all().await?;
    if let Some(truncated) = &outcome.truncated {
        warn!(error = %truncated, "Record fetch was truncated");
    }

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(io::BufWriter::new(
            fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => Box::new(io::BufWriter::new(io::stdout().lock())),
    };
    write_jsonl(&mut out, &outcome.records)?;

    info!(
        records = outcome.records.len(),
        pages = outcome.pages_fetched,
        partial = outcome.is_partial(),
        "Fetch complete"
    );
    if let Some(path) = &args.output {
        eprintln!(
            "✓ Wrote {} records to {}",
            outcome.records.len(),
            path.display()
        );
    }

    Ok(())
}

/// One JSON object per line, flushed at the end.
fn write_jsonl<W: Write>(out: &mut W, records: &[Record]) -> anyhow::Result<()> {
    for record in records {
        serde_json::to_writer(&mut *out, record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_args() {
        let cli = Cli::try_parse_from([
            "sentiment-forge",
            "run",
            "--batch-size",
            "25",
            "--response-mode",
            "stream",
            "--upsert-mode",
            "end_of_run",
            "--dry-run",
            "--json",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.batch_size, Some(25));
        assert_eq!(args.response_mode, Some(ResponseMode::Stream));
        assert_eq!(args.upsert_mode, Some(UpsertMode::EndOfRun));
        assert!(args.dry_run);
        assert!(args.json);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_parse_rejects_unknown_mode() {
        let result = Cli::try_parse_from(["sentiment-forge", "run", "--response-mode", "grpc"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_run_overrides() {
        let args = RunArgs {
            batch_size: Some(10),
            max_records: Some(40),
            response_mode: Some(ResponseMode::Unary),
            upsert_mode: None,
            only_pending: true,
            dry_run: false,
            json: false,
            metrics_out: None,
        };
        let config = apply_run_overrides(PipelineConfig::new(), &args);

        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_records, Some(40));
        assert_eq!(config.response_mode, ResponseMode::Unary);
        assert_eq!(config.upsert_mode, UpsertMode::PerBatch);
        assert!(config.only_pending);
    }

    #[test]
    fn test_parse_fetch_args() {
        let cli = Cli::try_parse_from([
            "sentiment-forge",
            "fetch",
            "--output",
            "comments.jsonl",
            "-n",
            "100",
            "--log-level",
            "debug",
        ])
        .unwrap();

        let Commands::Fetch(args) = cli.command else {
            panic!("expected fetch command");
        };
        assert_eq!(args.output, Some(PathBuf::from("comments.jsonl")));
        assert_eq!(args.max_records, Some(100));
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_write_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("comments.jsonl");
        let records = vec![Record::new("a", "first"), Record::new(7u64, "")];

        let mut file = fs::File::create(&path).unwrap();
        write_jsonl(&mut file, &records).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"id":"a","body":"first"}"#);
        let back: Record = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(back, records[1]);
    }
}
