//! Fetch → parse → filter → dedupe → probe → score → write.
//!
//! Every stage before and after the probe pool runs sequentially; the pool
//! is the only concurrency boundary.

use std::sync::atomic::Ordering;
use std::time::Duration;

use ::time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::dedupe::{dedupe, CandidateFilter};
use crate::dispatcher::{dispatch_with_shared, SharedProgress};
use crate::error::PipelineError;
use crate::fetch::Fetcher;
use crate::parse::parse_document;
use crate::probe::ProbeRegistry;
use crate::report;
use crate::score::score_results;
use crate::types::{Candidate, RunReport, RunSummary};

const PROGRESS_EVERY: Duration = Duration::from_secs(5);

/// Deduplicated candidates ready for probing, with the counters so far.
#[derive(Debug)]
pub struct CandidateSet {
    pub candidates: Vec<Candidate>,
    pub summary: RunSummary,
}

pub struct Pipeline {
    config: Config,
    registry: ProbeRegistry,
    fetcher: Fetcher,
}

impl Pipeline {
    /// Validate `config` and build the default probe registry.
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        let registry = ProbeRegistry::from_settings(&config.probe)
            .map_err(|e| PipelineError::Setup(e.to_string()))?;
        Self::with_registry(config, registry)
    }

    pub fn with_registry(mut config: Config, registry: ProbeRegistry) -> Result<Self, PipelineError> {
        config.validate()?;
        let fetcher =
            Fetcher::new(config.fetch.clone()).map_err(|e| PipelineError::Setup(e.to_string()))?;
        Ok(Self {
            config,
            registry,
            fetcher,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Fetch and parse every source, filter, and dedupe.
    pub async fn collect(&self) -> Result<CandidateSet, PipelineError> {
        let sources = self.config.resolved_sources()?;
        let mut summary = RunSummary {
            sources_total: sources.len() as u64,
            ..RunSummary::default()
        };

        let fetched = self.fetcher.fetch_all(&sources).await;
        summary.sources_failed = fetched.failures.len() as u64;

        let filter = CandidateFilter::new(&self.config.filter);
        let mut kept: Vec<Candidate> = Vec::new();
        for doc in &fetched.documents {
            let mut entries = match parse_document(&doc.body, doc.source.format) {
                Ok(e) => e,
                Err(e) => {
                    warn!(source = %doc.source.locator, error = %e, "unparseable source, skipping");
                    summary.sources_failed += 1;
                    continue;
                }
            };
            summary.sources_loaded += 1;
            let before = kept.len();
            let mut parsed = 0u64;
            for candidate in entries.by_ref() {
                parsed += 1;
                if let Some(c) = filter.apply(candidate) {
                    kept.push(c);
                }
            }
            summary.candidates_parsed += parsed;
            summary.candidates_filtered += parsed - (kept.len() - before) as u64;
            info!(
                source = %doc.source.locator,
                parsed,
                skipped = entries.skipped(),
                "source parsed"
            );
        }

        let candidates = dedupe(kept);
        summary.candidates_unique = candidates.len() as u64;
        info!(unique = candidates.len(), "candidates after dedupe");
        Ok(CandidateSet {
            candidates,
            summary,
        })
    }

    /// Run the whole pipeline and write the outputs. Only write failures
    /// (and bad configuration) are errors; zero survivors is a valid run.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport, PipelineError> {
        let run_cancel = cancel.child_token();
        let deadline = {
            let token = run_cancel.clone();
            let limit = self.config.run_timeout();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => {
                        warn!(?limit, "run timeout reached, cancelling outstanding probes");
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        };

        let set = match self.collect().await {
            Ok(set) => set,
            Err(e) => {
                deadline.abort();
                return Err(e);
            }
        };
        let mut summary = set.summary;

        let progress = SharedProgress::new();
        let ticker = {
            let progress = progress.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(PROGRESS_EVERY);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    info!(
                        done = progress.completed.load(Ordering::Relaxed),
                        total = progress.total.load(Ordering::Relaxed),
                        ok = progress.succeeded.load(Ordering::Relaxed),
                        "probing"
                    );
                }
            })
        };

        let results = dispatch_with_shared(
            set.candidates,
            &self.registry,
            self.config.concurrency,
            self.config.probe_timeout(),
            run_cancel.clone(),
            progress,
        )
        .await;
        ticker.abort();
        deadline.abort();

        summary.record_results(&results);
        let scored = score_results(&results, &self.config.scoring);
        let report = report::build_report(
            scored,
            self.config.top_k,
            self.config.output.format,
            summary,
            OffsetDateTime::now_utc(),
        );
        report::write_outputs(&report, &self.config.output)?;

        let s = &report.summary;
        info!(
            sources_loaded = s.sources_loaded,
            candidates = s.candidates_unique,
            attempted = s.probes_attempted,
            succeeded = s.probes_succeeded,
            written = s.written,
            "run complete"
        );
        Ok(report)
    }
}
