use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{ProbeOutcome, ProbeResult, ScoredCandidate};

/// What to do with the throughput weight when a probe reported no throughput.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingThroughput {
    /// Score on latency alone, with the full weight.
    #[default]
    Redistribute,
    /// Keep the weights; the throughput term counts as 0.
    Zero,
}

/// Scoring policy. Weights are normalised to sum to 1 by [`ScoreWeights::normalized`].
///
/// Latency maps to `ceiling / (ceiling + latency)`: 1 at 0 ms, 0.5 at the
/// ceiling, strictly decreasing. Throughput maps to
/// `clamp(throughput / ceiling, 0, 1)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ScoreWeights {
    pub latency: f64,
    pub throughput: f64,
    pub latency_ceiling_ms: f64,
    pub throughput_ceiling_bps: f64,
    pub missing_throughput: MissingThroughput,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            latency: 0.3,
            throughput: 0.7,
            latency_ceiling_ms: 1000.0,
            throughput_ceiling_bps: 1024.0 * 1024.0,
            missing_throughput: MissingThroughput::Redistribute,
        }
    }
}

impl ScoreWeights {
    pub fn normalized(self) -> Result<Self, ConfigError> {
        let finite_pos = |v: f64| v.is_finite() && v > 0.0;
        if !(self.latency.is_finite() && self.throughput.is_finite())
            || self.latency < 0.0
            || self.throughput < 0.0
        {
            return Err(ConfigError::Invalid(
                "scoring weights must be finite and non-negative".into(),
            ));
        }
        if self.latency == 0.0 {
            return Err(ConfigError::Invalid("latency weight must be positive".into()));
        }
        if !finite_pos(self.latency_ceiling_ms) || !finite_pos(self.throughput_ceiling_bps) {
            return Err(ConfigError::Invalid("scoring ceilings must be positive".into()));
        }
        let sum = self.latency + self.throughput;
        Ok(Self {
            latency: self.latency / sum,
            throughput: self.throughput / sum,
            ..self
        })
    }

    pub fn score(&self, latency_ms: f64, throughput_bps: Option<f64>) -> f64 {
        let latency = if latency_ms.is_nan() { f64::INFINITY } else { latency_ms.max(0.0) };
        let latency_term = if latency.is_infinite() {
            0.0
        } else {
            self.latency_ceiling_ms / (self.latency_ceiling_ms + latency)
        };

        match throughput_bps {
            Some(t) => {
                let t = if t.is_nan() { 0.0 } else { t };
                let throughput_term = (t / self.throughput_ceiling_bps).clamp(0.0, 1.0);
                self.latency * latency_term + self.throughput * throughput_term
            }
            None => match self.missing_throughput {
                MissingThroughput::Redistribute => (self.latency + self.throughput) * latency_term,
                MissingThroughput::Zero => self.latency * latency_term,
            },
        }
    }
}

/// Score every successful result, preserving input order. Failures are dropped.
pub fn score_results(results: &[ProbeResult], weights: &ScoreWeights) -> Vec<ScoredCandidate> {
    results
        .iter()
        .filter_map(|r| match &r.outcome {
            ProbeOutcome::Success(m) => Some(ScoredCandidate {
                candidate: r.candidate.clone(),
                latency_ms: m.latency_ms,
                throughput_bps: m.throughput_bps,
                score: weights.score(m.latency_ms, m.throughput_bps),
            }),
            ProbeOutcome::Failure(_) => None,
        })
        .collect()
}
