use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::MAX_CONCURRENCY;
use crate::probe::{Probe, ProbeRegistry};
use crate::types::{Candidate, FailureReason, ProbeOutcome, ProbeResult};

/// Probe every candidate under a bounded pool and return one result per
/// candidate, in input order.
///
/// - Candidates with no registered probe, or missing fields the probe
///   requires, are rejected up front and never take a pool slot.
/// - At most `concurrency` probes run at once; the rest wait in FIFO order
///   on a `Semaphore`.
/// - Each probe is bounded by `timeout`. On expiry its future is dropped,
///   which kills any helper process and removes its temp files.
/// - A probe error or a panicking probe task only fails that candidate.
pub async fn dispatch(
    candidates: Vec<Candidate>,
    registry: &ProbeRegistry,
    concurrency: usize,
    timeout: Duration,
) -> Vec<ProbeResult> {
    dispatch_internal(candidates, registry, concurrency, timeout, None, None).await
}

/// Variant that accepts a `CancellationToken` to stop the run early.
/// Candidates not finished at cancellation are recorded as cancelled.
pub async fn dispatch_with_cancel(
    candidates: Vec<Candidate>,
    registry: &ProbeRegistry,
    concurrency: usize,
    timeout: Duration,
    cancel: CancellationToken,
) -> Vec<ProbeResult> {
    dispatch_internal(candidates, registry, concurrency, timeout, Some(cancel), None).await
}

/// Live counters, readable while a dispatch is running.
#[derive(Clone, Debug)]
pub struct SharedProgress {
    pub total: Arc<AtomicU64>,
    pub submitted: Arc<AtomicU64>,
    pub completed: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self {
            total: Arc::new(AtomicU64::new(0)),
            submitted: Arc::new(AtomicU64::new(0)),
            completed: Arc::new(AtomicU64::new(0)),
            succeeded: Arc::new(AtomicU64::new(0)),
        }
    }

    fn record(&self, outcome: &ProbeOutcome) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if matches!(outcome, ProbeOutcome::Success(_)) {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for SharedProgress {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn dispatch_with_shared(
    candidates: Vec<Candidate>,
    registry: &ProbeRegistry,
    concurrency: usize,
    timeout: Duration,
    cancel: CancellationToken,
    shared: SharedProgress,
) -> Vec<ProbeResult> {
    dispatch_internal(
        candidates,
        registry,
        concurrency,
        timeout,
        Some(cancel),
        Some(shared),
    )
    .await
}

async fn dispatch_internal(
    candidates: Vec<Candidate>,
    registry: &ProbeRegistry,
    concurrency: usize,
    timeout: Duration,
    cancel_opt: Option<CancellationToken>,
    shared_opt: Option<SharedProgress>,
) -> Vec<ProbeResult> {
    let progress = shared_opt.unwrap_or_default();
    let cancel = cancel_opt.unwrap_or_default();
    let candidates: Vec<Arc<Candidate>> = candidates.into_iter().map(Arc::new).collect();
    progress
        .total
        .store(candidates.len() as u64, Ordering::Relaxed);

    let mut slots: Vec<Option<ProbeResult>> = vec![None; candidates.len()];
    let mut queue: Vec<(usize, Arc<dyn Probe>)> = Vec::with_capacity(candidates.len());

    // Reject what cannot be probed before anything touches the pool.
    for (idx, candidate) in candidates.iter().enumerate() {
        let reason = match registry.get(candidate.protocol()) {
            None => Some(FailureReason::UnsupportedProtocol(
                candidate.protocol().to_string(),
            )),
            Some(probe) => {
                let missing = probe.missing_fields(candidate);
                if missing.is_empty() {
                    queue.push((idx, probe));
                    None
                } else {
                    Some(FailureReason::MissingFields(missing))
                }
            }
        };
        if let Some(reason) = reason {
            debug!(key = %candidate.key, %reason, "rejected before probing");
            let result = ProbeResult::failure(candidate.clone(), reason);
            progress.record(&result.outcome);
            slots[idx] = Some(result);
        }
    }

    let sem = Arc::new(Semaphore::new(concurrency.clamp(1, MAX_CONCURRENCY)));
    let mut set = JoinSet::new();

    for (idx, probe) in queue {
        let candidate = candidates[idx].clone();
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = sem.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            let result = ProbeResult::failure(candidate, FailureReason::Cancelled);
            progress.record(&result.outcome);
            slots[idx] = Some(result);
            continue;
        };

        progress.submitted.fetch_add(1, Ordering::Relaxed);
        let cancel = cancel.clone();
        let progress = progress.clone();
        set.spawn(async move {
            let _permit = permit; // keep permit until task completes

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => ProbeOutcome::Failure(FailureReason::Cancelled),
                res = time::timeout(timeout, probe.probe(&candidate)) => match res {
                    Ok(Ok(m)) => ProbeOutcome::Success(m),
                    Ok(Err(e)) => ProbeOutcome::Failure(FailureReason::ProbeError(e.to_string())),
                    Err(_) => ProbeOutcome::Failure(FailureReason::Timeout),
                },
            };
            match &outcome {
                ProbeOutcome::Success(m) => {
                    debug!(key = %candidate.key, latency_ms = m.latency_ms, "probe ok")
                }
                ProbeOutcome::Failure(reason) => {
                    debug!(key = %candidate.key, %reason, "probe failed")
                }
            }
            progress.record(&outcome);
            (idx, ProbeResult { candidate, outcome })
        });
    }

    while let Some(res) = set.join_next().await {
        match res {
            Ok((idx, result)) => slots[idx] = Some(result),
            Err(e) => warn!(error = %e, "probe task did not complete"),
        }
    }

    slots
        .into_iter()
        .zip(candidates)
        .map(|(slot, candidate)| {
            slot.unwrap_or_else(|| {
                let result = ProbeResult::failure(
                    candidate,
                    FailureReason::ProbeError("probe task panicked".into()),
                );
                progress.record(&result.outcome);
                result
            })
        })
        .collect()
}
