use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::score::ScoreWeights;
use crate::sources;

/// Upper bound for the probe pool, whatever the configuration says.
pub const MAX_CONCURRENCY: usize = 512;

/// Declared document format of a source.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// Sniff the body: playlist tags, then a `proxies` mapping, then text lines.
    #[default]
    Auto,
    /// Structured list with a top-level `proxies` sequence.
    Clash,
    /// Extended-tag playlist (`#EXTINF` + URI lines).
    M3u,
    /// `name,url` or `name url` lines.
    Text,
}

impl std::str::FromStr for SourceFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "clash" | "yaml" | "yml" => Ok(Self::Clash),
            "m3u" | "m3u8" => Ok(Self::M3u),
            "text" | "txt" => Ok(Self::Text),
            other => Err(format!("unknown source format: {other}")),
        }
    }
}

/// One source locator: an http(s) URL, a `file://` URL or a local path.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(from = "SourceRepr")]
pub struct Source {
    pub locator: String,
    pub format: SourceFormat,
}

impl Source {
    pub fn new(locator: impl Into<String>, format: SourceFormat) -> Self {
        Self {
            locator: locator.into(),
            format,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SourceRepr {
    Plain(String),
    Detailed {
        url: String,
        #[serde(default)]
        format: SourceFormat,
    },
}

impl From<SourceRepr> for Source {
    fn from(r: SourceRepr) -> Self {
        match r {
            SourceRepr::Plain(url) => Source::new(url, SourceFormat::Auto),
            SourceRepr::Detailed { url, format } => Source::new(url, format),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// `proxies:` list of raw fields.
    #[default]
    Yaml,
    /// `#EXTM3U` playlist of candidates that carry a `url` field.
    M3u,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FetchSettings {
    pub timeout_ms: u64,
    pub attempts: u32,
    pub backoff_ms: u64,
    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            attempts: 3,
            backoff_ms: 500,
            user_agent: "clash.meta".into(),
        }
    }
}

impl FetchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ProbeSettings {
    /// Low-cost endpoint returning a fixed, tiny response.
    pub test_url: String,
    /// Optional download used for throughput; `None` disables it.
    pub speed_test_url: Option<String>,
    /// Byte cap for the throughput download and for stream sampling.
    pub speed_test_bytes: u64,
    pub xray_bin: PathBuf,
    pub hysteria_bin: PathBuf,
    pub helper_ready_timeout_ms: u64,
    /// Protocols probed with a plain TCP connect instead of their default probe.
    pub tcp_connect_protocols: Vec<String>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            test_url: "https://www.gstatic.com/generate_204".into(),
            speed_test_url: Some("https://speed.cloudflare.com/__down?bytes=1000000".into()),
            speed_test_bytes: 1_000_000,
            xray_bin: PathBuf::from("xray"),
            hysteria_bin: PathBuf::from("hysteria"),
            helper_ready_timeout_ms: 5_000,
            tcp_connect_protocols: Vec::new(),
        }
    }
}

impl ProbeSettings {
    pub fn helper_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.helper_ready_timeout_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    /// Protocol allow-list; empty allows every protocol.
    pub protocols: Vec<String>,
    /// Display-name substrings a candidate must contain; empty keeps all.
    pub include_keywords: Vec<String>,
    /// Case-insensitive substrings matched against display name and host.
    pub exclude_keywords: Vec<String>,
    /// Display-name substrings whose candidates keep their name unstripped.
    pub keep_keywords: Vec<String>,
    /// Candidates whose host is an IP literal inside one of these are dropped.
    pub exclude_networks: Vec<IpNet>,
    /// Tokens removed from stream display names (e.g. "HD").
    pub strip_name_tokens: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub subscription: PathBuf,
    pub report: PathBuf,
    pub format: OutputFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            subscription: PathBuf::from("output/nodes.yml"),
            report: PathBuf::from("output/speed.txt"),
            format: OutputFormat::Yaml,
        }
    }
}

/// Full run configuration. Every field has a default.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub sources: Vec<Source>,
    pub sources_file: Option<PathBuf>,
    pub concurrency: usize,
    pub probe_timeout_ms: u64,
    pub run_timeout_secs: u64,
    pub top_k: usize,
    pub scoring: ScoreWeights,
    pub filter: FilterConfig,
    pub fetch: FetchSettings,
    pub probe: ProbeSettings,
    pub output: OutputConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            sources_file: None,
            concurrency: 20,
            probe_timeout_ms: 20_000,
            run_timeout_secs: 600,
            top_k: 50,
            scoring: ScoreWeights::default(),
            filter: FilterConfig::default(),
            fetch: FetchSettings::default(),
            probe: ProbeSettings::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Config {
    /// Layer an optional TOML file and `SUB_PROBE__*` environment variables
    /// over the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(p) = path {
            builder = builder.add_source(config::File::from(p));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SUB_PROBE")
                .separator("__")
                .try_parsing(true),
        );
        let cfg: Config = builder.build()?.try_deserialize()?;
        Ok(cfg)
    }

    /// Check ranges and normalise the scoring weights.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        self.concurrency = self.concurrency.min(MAX_CONCURRENCY);
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid("probe_timeout_ms must be positive".into()));
        }
        if self.run_timeout_secs == 0 {
            return Err(ConfigError::Invalid("run_timeout_secs must be positive".into()));
        }
        if self.top_k == 0 {
            return Err(ConfigError::Invalid("top_k must be at least 1".into()));
        }
        if self.fetch.attempts == 0 {
            return Err(ConfigError::Invalid("fetch.attempts must be at least 1".into()));
        }
        self.scoring = self.scoring.clone().normalized()?;
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    /// Inline sources followed by the sources file, first occurrence wins.
    pub fn resolved_sources(&self) -> Result<Vec<Source>, ConfigError> {
        let mut out = self.sources.clone();
        if let Some(path) = &self.sources_file {
            out.extend(sources::load_sources_from_path(path)?);
        }
        let mut seen = std::collections::HashSet::new();
        out.retain(|s| seen.insert(s.locator.clone()));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let mut cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.concurrency, 20);
        assert_eq!(cfg.top_k, 50);
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut cfg = Config {
            concurrency: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn concurrency_is_clamped() {
        let mut cfg = Config {
            concurrency: 100_000,
            ..Config::default()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.concurrency, MAX_CONCURRENCY);
    }

    #[test]
    fn source_format_from_str() {
        assert_eq!("YAML".parse::<SourceFormat>().unwrap(), SourceFormat::Clash);
        assert_eq!("m3u8".parse::<SourceFormat>().unwrap(), SourceFormat::M3u);
        assert!("xml".parse::<SourceFormat>().is_err());
    }
}
