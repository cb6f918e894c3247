use std::collections::HashSet;
use std::net::IpAddr;

use tracing::debug;

use crate::config::FilterConfig;
use crate::parse::STREAM_PROTOCOL;
use crate::types::{Candidate, IdentityKey};

/// Keep the first candidate for each identity key, preserving order.
pub fn dedupe<I>(candidates: I) -> Vec<Candidate>
where
    I: IntoIterator<Item = Candidate>,
{
    let mut seen: HashSet<IdentityKey> = HashSet::new();
    let mut out = Vec::new();
    for c in candidates {
        if seen.insert(c.key.clone()) {
            out.push(c);
        }
    }
    out
}

/// Allow-list, keyword and network filtering applied before deduplication.
#[derive(Debug, Clone, Default)]
pub struct CandidateFilter {
    protocols: Vec<String>,
    include: Vec<String>,
    exclude: Vec<String>,
    keep: Vec<String>,
    networks: Vec<ipnet::IpNet>,
    strip_tokens: Vec<String>,
}

impl CandidateFilter {
    pub fn new(cfg: &FilterConfig) -> Self {
        let lower = |v: &[String]| {
            v.iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        };
        Self {
            protocols: lower(&cfg.protocols),
            include: lower(&cfg.include_keywords),
            exclude: lower(&cfg.exclude_keywords),
            keep: lower(&cfg.keep_keywords),
            networks: cfg.exclude_networks.clone(),
            strip_tokens: cfg
                .strip_name_tokens
                .iter()
                .filter(|s| !s.is_empty())
                .cloned()
                .collect(),
        }
    }

    /// `None` when the candidate is filtered out; otherwise the candidate,
    /// with stream display names cleaned.
    pub fn apply(&self, mut candidate: Candidate) -> Option<Candidate> {
        if !self.protocols.is_empty() && !self.protocols.iter().any(|p| p == candidate.protocol()) {
            debug!(key = %candidate.key, "protocol not allowed");
            return None;
        }
        if let Ok(ip) = candidate.key.host.parse::<IpAddr>() {
            if self.networks.iter().any(|n| n.contains(&ip)) {
                debug!(key = %candidate.key, "host in excluded network");
                return None;
            }
        }

        let name = candidate.display_name.to_lowercase();
        if !self.include.is_empty() && !self.include.iter().any(|k| name.contains(k.as_str())) {
            debug!(name = %candidate.display_name, "not in include list");
            return None;
        }
        if self
            .exclude
            .iter()
            .any(|k| name.contains(k.as_str()) || candidate.key.host.contains(k.as_str()))
        {
            debug!(name = %candidate.display_name, "excluded by keyword");
            return None;
        }

        // keep keywords only protect the name from token stripping
        let kept = self.keep.iter().any(|k| name.contains(k.as_str()));

        if candidate.protocol() == STREAM_PROTOCOL && !kept && !self.strip_tokens.is_empty() {
            let mut cleaned = candidate.display_name.clone();
            for token in &self.strip_tokens {
                cleaned = cleaned.replace(token.as_str(), "");
            }
            let cleaned = cleaned.trim().to_string();
            if !cleaned.is_empty() && cleaned != candidate.display_name {
                candidate.fields.insert("name".into(), cleaned.clone().into());
                candidate.display_name = cleaned;
            }
        }
        Some(candidate)
    }
}
