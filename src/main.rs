use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use sub_probe_rs::config::{Config, OutputFormat, Source, SourceFormat};
use sub_probe_rs::logging;
use sub_probe_rs::pipeline::Pipeline;
use sub_probe_rs::types::{RunReport, RunSummary};
use tokio_util::sync::CancellationToken;

/// sub-probe-rs: fetch proxy/IPTV subscriptions, probe every endpoint under a bounded pool, keep the best.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "sub-probe-rs",
    version,
    about = "Fetch proxy/IPTV subscriptions, dedupe, probe endpoints concurrently and write the ranked top-K.",
    long_about = None
)]
struct Cli {
    /// TOML configuration file. CLI flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Source URL or local path (repeatable).
    #[arg(long = "source", action = ArgAction::Append)]
    sources: Vec<String>,

    /// Format hint applied to every --source.
    #[arg(long, value_enum, default_value_t = SourceFormat::Auto)]
    format: SourceFormat,

    /// File with one source locator (and optional format hint) per line.
    #[arg(long = "sources-file")]
    sources_file: Option<PathBuf>,

    /// Max concurrently running probes.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Per-probe timeout in milliseconds.
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Total run timeout in seconds.
    #[arg(long = "run-timeout-secs")]
    run_timeout_secs: Option<u64>,

    /// Number of best candidates to keep.
    #[arg(long = "top-k")]
    top_k: Option<usize>,

    /// Protocol allow-list (repeatable).
    #[arg(long = "protocol", action = ArgAction::Append)]
    protocols: Vec<String>,

    /// Keep only candidates whose name contains this keyword (repeatable).
    #[arg(long = "include", action = ArgAction::Append)]
    includes: Vec<String>,

    /// Exclude candidates whose name or host contains this keyword (repeatable).
    #[arg(long = "exclude", action = ArgAction::Append)]
    excludes: Vec<String>,

    /// Subscription output path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Ranked report output path.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Subscription output format.
    #[arg(long = "output-format", value_enum)]
    output_format: Option<OutputFormat>,

    /// Write the run summary as pretty JSON to this path.
    #[arg(long = "summary-json")]
    summary_json: Option<PathBuf>,

    /// Log level filter (overridden by RUST_LOG).
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    /// Also append log events to this file.
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, cfg: &mut Config) {
        cfg.sources.extend(
            self.sources
                .iter()
                .map(|s| Source::new(s.clone(), self.format)),
        );
        if let Some(p) = &self.sources_file {
            cfg.sources_file = Some(p.clone());
        }
        if let Some(v) = self.concurrency {
            cfg.concurrency = v;
        }
        if let Some(v) = self.timeout_ms {
            cfg.probe_timeout_ms = v;
        }
        if let Some(v) = self.run_timeout_secs {
            cfg.run_timeout_secs = v;
        }
        if let Some(v) = self.top_k {
            cfg.top_k = v;
        }
        if !self.protocols.is_empty() {
            cfg.filter.protocols = self.protocols.clone();
        }
        cfg.filter.include_keywords.extend(self.includes.iter().cloned());
        cfg.filter.exclude_keywords.extend(self.excludes.iter().cloned());
        if let Some(p) = &self.output {
            cfg.output.subscription = p.clone();
        }
        if let Some(p) = &self.report {
            cfg.output.report = p.clone();
        }
        if let Some(f) = self.output_format {
            cfg.output.format = f;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.log_file.as_deref())?;

    let mut cfg = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply(&mut cfg);

    let pipeline = Pipeline::new(cfg).context("invalid configuration")?;
    print_config(pipeline.config());

    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_ctrlc.cancel();
    });

    let report = pipeline.run(cancel).await.context("run failed")?;
    print_results_table(&report);
    print_summary(&report.summary);

    if let Some(path) = cli.summary_json.as_deref() {
        if let Err(e) = write_summary_json(path, &report.summary) {
            eprintln!("Failed to write summary JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote summary JSON to {}", path.display());
        }
    }
    Ok(())
}

fn print_config(cfg: &Config) {
    println!("sub-probe-rs configuration:");
    println!("  sources      : {}", cfg.sources.len());
    println!(
        "  sources_file : {}",
        cfg.sources_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );
    println!("  concurrency  : {}", cfg.concurrency);
    println!("  timeout_ms   : {}", cfg.probe_timeout_ms);
    println!("  run_timeout  : {}s", cfg.run_timeout_secs);
    println!("  top_k        : {}", cfg.top_k);
    println!(
        "  weights      : latency {:.2} / throughput {:.2}",
        cfg.scoring.latency, cfg.scoring.throughput
    );
    println!("  output       : {}", cfg.output.subscription.display());
    println!("  report       : {}", cfg.output.report.display());
}

fn print_results_table(report: &RunReport) {
    let mut name_w = "name".len();
    for e in &report.entries {
        name_w = name_w.max(e.candidate.display_name.chars().count().min(40));
    }
    let rank_w = 4usize;
    let lat_w = "latency_ms".len();
    let tp_w = "kib_s".len().max(10);

    println!("\nTop {} candidates:", report.entries.len());
    println!(
        "{:>rank_w$}  {:<name_w$}  {:>lat_w$}  {:>tp_w$}  {:>6}",
        "rank",
        "name",
        "latency_ms",
        "kib_s",
        "score",
        rank_w = rank_w,
        name_w = name_w,
        lat_w = lat_w,
        tp_w = tp_w
    );
    println!(
        "{:-<rank_w$}  {:-<name_w$}  {:-<lat_w$}  {:-<tp_w$}  {:-<6}",
        "",
        "",
        "",
        "",
        "",
        rank_w = rank_w,
        name_w = name_w,
        lat_w = lat_w,
        tp_w = tp_w
    );
    for (i, e) in report.entries.iter().enumerate() {
        let name: String = e
            .candidate
            .display_name
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .take(40)
            .collect();
        let tp = e
            .throughput_bps
            .map(|t| format!("{:.1}", t / 1024.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>rank_w$}  {:<name_w$}  {:>lat_w$.1}  {:>tp_w$}  {:>6.4}",
            i + 1,
            name,
            e.latency_ms,
            tp,
            e.score,
            rank_w = rank_w,
            name_w = name_w,
            lat_w = lat_w,
            tp_w = tp_w
        );
    }
}

fn print_summary(s: &RunSummary) {
    println!("\nSummary:");
    println!("  sources loaded     : {}/{}", s.sources_loaded, s.sources_total);
    println!("  candidates (dedup) : {}", s.candidates_unique);
    println!("  probes attempted   : {}", s.probes_attempted);
    println!("  probes succeeded   : {}", s.probes_succeeded);
    println!(
        "  rejected           : {} unsupported, {} missing fields",
        s.rejected_unsupported, s.rejected_missing_fields
    );
    println!(
        "  failed             : {} timeout, {} error, {} cancelled",
        s.timed_out, s.errored, s.cancelled
    );
    println!("  top-K written      : {}", s.written);
}

fn write_summary_json(path: &std::path::Path, summary: &RunSummary) -> anyhow::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, summary)?;
    Ok(())
}
