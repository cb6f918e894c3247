use std::path::PathBuf;

use reqwest::Client;
use tokio::time;
use tracing::{info, warn};

use crate::config::{FetchSettings, Source};
use crate::error::FetchError;

/// Raw body of a source that was retrieved successfully.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub source: Source,
    pub body: String,
}

/// Per-source results of a fetch pass. Failures never abort the pass.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub documents: Vec<FetchedDocument>,
    pub failures: Vec<(Source, FetchError)>,
}

impl FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Http { .. } => true,
            FetchError::Status { status, .. } => *status >= 500 || *status == 429,
            FetchError::Io { .. } => false,
        }
    }
}

/// Retrieves subscription documents with a per-attempt timeout and a small
/// retry budget.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    settings: FetchSettings,
}

impl Fetcher {
    pub fn new(settings: FetchSettings) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(settings.timeout())
            .user_agent(settings.user_agent.clone())
            .build()?;
        Ok(Self { client, settings })
    }

    /// Fetch every source in order. A failing source is logged and skipped.
    pub async fn fetch_all(&self, sources: &[Source]) -> FetchReport {
        let mut report = FetchReport::default();
        for source in sources {
            match self.fetch_one(source).await {
                Ok(body) => {
                    info!(source = %source.locator, bytes = body.len(), "source loaded");
                    report.documents.push(FetchedDocument {
                        source: source.clone(),
                        body,
                    });
                }
                Err(e) => {
                    warn!(source = %source.locator, error = %e, "source failed, skipping");
                    report.failures.push((source.clone(), e));
                }
            }
        }
        report
    }

    pub async fn fetch_one(&self, source: &Source) -> Result<String, FetchError> {
        let attempts = self.settings.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.fetch_once(&source.locator).await {
                Ok(body) => return Ok(body),
                Err(e) if attempt < attempts && e.is_retryable() => {
                    warn!(source = %source.locator, attempt, error = %e, "fetch attempt failed, retrying");
                    time::sleep(self.settings.backoff() * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(&self, locator: &str) -> Result<String, FetchError> {
        let Some(url) = remote_url(locator) else {
            let path = local_path(locator);
            return tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| FetchError::Io { path, source });
        };

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Http {
                url: locator.to_string(),
                source,
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: locator.to_string(),
                status: status.as_u16(),
            });
        }
        resp.text().await.map_err(|source| FetchError::Http {
            url: locator.to_string(),
            source,
        })
    }
}

fn remote_url(locator: &str) -> Option<url::Url> {
    let url = url::Url::parse(locator).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

fn local_path(locator: &str) -> PathBuf {
    url::Url::parse(locator)
        .ok()
        .filter(|u| u.scheme() == "file")
        .and_then(|u| u.to_file_path().ok())
        .unwrap_or_else(|| PathBuf::from(locator))
}
