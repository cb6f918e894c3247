use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_yaml::Mapping;

/// Deduplication key of a candidate: protocol, host and port, case-normalized.
///
/// Stream entries (playlist/text sources) also carry the URI path+query in
/// `resource`, so distinct channels served from one host:port stay distinct.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

impl IdentityKey {
    pub fn new(protocol: &str, host: &str, port: u16) -> Self {
        Self {
            protocol: protocol.trim().to_ascii_lowercase(),
            host: normalize_host(host),
            port,
            resource: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        let r = resource.into();
        self.resource = if r.is_empty() { None } else { Some(r) };
        self
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.protocol, self.host, self.port)?;
        } else {
            write!(f, "{}://{}:{}", self.protocol, self.host, self.port)?;
        }
        if let Some(r) = &self.resource {
            write!(f, "{r}")?;
        }
        Ok(())
    }
}

fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_matches(|c| c == '[' || c == ']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// A normalized endpoint description pending a health probe.
///
/// `fields` is the source's raw mapping, passed through unmodified to the
/// probe and to the output writer.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub key: IdentityKey,
    pub display_name: String,
    pub fields: Mapping,
}

impl Candidate {
    pub fn protocol(&self) -> &str {
        &self.key.protocol
    }

    /// String view of a raw field; numbers and booleans are stringified.
    pub fn field_str(&self, name: &str) -> Option<String> {
        match self.fields.get(name)? {
            serde_yaml::Value::String(s) => Some(s.clone()),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            serde_yaml::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn field_bool(&self, name: &str) -> Option<bool> {
        match self.fields.get(name)? {
            serde_yaml::Value::Bool(b) => Some(*b),
            serde_yaml::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            serde_yaml::Value::Number(n) => n.as_i64().map(|v| v != 0),
            _ => None,
        }
    }

    pub fn has_field(&self, name: &str) -> bool {
        match self.fields.get(name) {
            None | Some(serde_yaml::Value::Null) => false,
            Some(serde_yaml::Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        }
    }
}

/// Successful probe measurement.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub latency_ms: f64,
    pub throughput_bps: Option<f64>,
}

/// Why a candidate did not produce a measurement.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FailureReason {
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("missing fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),
    #[error("timed out")]
    Timeout,
    #[error("probe error: {0}")]
    ProbeError(String),
    #[error("cancelled before completion")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Success(Measurement),
    Failure(FailureReason),
}

/// Exactly one per dispatched candidate.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub candidate: Arc<Candidate>,
    pub outcome: ProbeOutcome,
}

impl ProbeResult {
    pub fn failure(candidate: Arc<Candidate>, reason: FailureReason) -> Self {
        Self {
            candidate,
            outcome: ProbeOutcome::Failure(reason),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Success(_))
    }
}

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: Arc<Candidate>,
    pub latency_ms: f64,
    pub throughput_bps: Option<f64>,
    pub score: f64,
}

/// Aggregate counters for one run.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub sources_total: u64,
    pub sources_loaded: u64,
    pub sources_failed: u64,
    pub candidates_parsed: u64,
    pub candidates_filtered: u64,
    pub candidates_unique: u64,
    pub probes_attempted: u64,
    pub probes_succeeded: u64,
    pub rejected_unsupported: u64,
    pub rejected_missing_fields: u64,
    pub timed_out: u64,
    pub errored: u64,
    pub cancelled: u64,
    pub written: u64,
}

impl RunSummary {
    /// Fold probe outcomes into the counters.
    pub fn record_results(&mut self, results: &[ProbeResult]) {
        for r in results {
            match &r.outcome {
                ProbeOutcome::Success(_) => {
                    self.probes_attempted += 1;
                    self.probes_succeeded += 1;
                }
                ProbeOutcome::Failure(FailureReason::UnsupportedProtocol(_)) => {
                    self.rejected_unsupported += 1
                }
                ProbeOutcome::Failure(FailureReason::MissingFields(_)) => {
                    self.rejected_missing_fields += 1
                }
                ProbeOutcome::Failure(FailureReason::Timeout) => {
                    self.probes_attempted += 1;
                    self.timed_out += 1;
                }
                ProbeOutcome::Failure(FailureReason::ProbeError(_)) => {
                    self.probes_attempted += 1;
                    self.errored += 1;
                }
                ProbeOutcome::Failure(FailureReason::Cancelled) => self.cancelled += 1,
            }
        }
    }
}

/// Ranked top-K plus metadata, produced once at the end of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub generated_at: String,
    pub summary: RunSummary,
    pub entries: Vec<ScoredCandidate>,
}
