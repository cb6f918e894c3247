use std::path::PathBuf;

/// Failure to retrieve one source. Non-fatal: the source is skipped.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP error fetching {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A whole document could not be parsed. Individual malformed entries are
/// skipped with a warning instead.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid YAML document: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("document has no `proxies` sequence")]
    MissingProxies,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read sources file {}: {source}", path.display())]
    SourcesFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sources file line {line}: {reason}")]
    SourcesLine { line: usize, reason: String },
}

/// Output could not be produced. Fatal to the run.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize subscription: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("setup failed: {0}")]
    Setup(String),
}
