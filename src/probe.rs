//! Protocol-specific probes and the registry the dispatcher looks them up in.

pub mod direct;
pub mod helper;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Proxy};
use tokio::time::Instant;
use tracing::debug;

use crate::config::ProbeSettings;
use crate::parse::STREAM_PROTOCOL;
use crate::types::{Candidate, Measurement};

pub use direct::{ProxyProbe, StreamProbe, TcpConnectProbe};
pub use helper::{HelperKind, HelperProbe};

/// Connect budget for the HTTP client used inside probes, as `curl --connect-timeout 10`.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Fault inside a single probe. Recorded as a failure for that candidate only.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("helper: {0}")]
    Helper(String),
    #[error("invalid candidate: {0}")]
    Invalid(String),
}

/// One way of checking whether a candidate works.
///
/// Implementations must own every resource they create (temp files, child
/// processes) so that dropping the returned future releases them.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Raw fields that must be present for this probe to run.
    fn required_fields(&self) -> &[&'static str] {
        &[]
    }

    fn missing_fields(&self, candidate: &Candidate) -> Vec<String> {
        self.required_fields()
            .iter()
            .filter(|f| !candidate.has_field(f))
            .map(|f| f.to_string())
            .collect()
    }

    async fn probe(&self, candidate: &Candidate) -> Result<Measurement, ProbeError>;
}

/// Probes keyed by lower-case protocol name.
#[derive(Clone, Default)]
pub struct ProbeRegistry {
    probes: HashMap<String, Arc<dyn Probe>>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, protocol: &str, probe: Arc<dyn Probe>) -> &mut Self {
        self.probes.insert(protocol.to_ascii_lowercase(), probe);
        self
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn Probe>> {
        self.probes.get(protocol).cloned()
    }

    pub fn protocols(&self) -> Vec<&str> {
        let mut v: Vec<&str> = self.probes.keys().map(String::as_str).collect();
        v.sort_unstable();
        v
    }

    /// Default registry: socks5/http measured through the proxy, ss/vmess/
    /// vless/trojan through an xray helper, hysteria2 through a hysteria
    /// helper, playlist streams fetched directly. Protocols listed in
    /// `tcp_connect_protocols` fall back to a plain TCP connect.
    pub fn from_settings(settings: &ProbeSettings) -> Result<Self, ProbeError> {
        let settings = Arc::new(settings.clone());
        let mut reg = Self::new();
        reg.register("socks5", Arc::new(ProxyProbe::socks5(settings.clone())));
        reg.register("http", Arc::new(ProxyProbe::http(settings.clone())));
        for proto in ["ss", "vmess", "vless", "trojan"] {
            reg.register(proto, Arc::new(HelperProbe::new(HelperKind::Xray, settings.clone())));
        }
        reg.register(
            "hysteria2",
            Arc::new(HelperProbe::new(HelperKind::Hysteria, settings.clone())),
        );
        reg.register(STREAM_PROTOCOL, Arc::new(StreamProbe::new(settings.clone())?));
        for proto in &settings.tcp_connect_protocols {
            reg.register(proto, Arc::new(TcpConnectProbe));
        }
        Ok(reg)
    }
}

/// Client that sends everything through `proxy_url`.
pub(crate) fn proxied_client(proxy_url: &str) -> Result<Client, ProbeError> {
    Ok(Client::builder()
        .proxy(Proxy::all(proxy_url)?)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()?)
}

pub(crate) fn direct_client() -> Result<Client, ProbeError> {
    Ok(Client::builder()
        .no_proxy()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()?)
}

/// `host:port`, bracketing IPv6 literals.
pub(crate) fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Latency of the test URL through `client`, plus throughput of the
/// speed-test download when one is configured. A failed speed test leaves
/// throughput unset.
pub(crate) async fn measure_http(
    client: &Client,
    settings: &ProbeSettings,
) -> Result<Measurement, ProbeError> {
    let start = Instant::now();
    let resp = client.get(&settings.test_url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(ProbeError::Status(status.as_u16()));
    }
    resp.bytes().await?;
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

    let throughput_bps = match &settings.speed_test_url {
        Some(url) => match download_rate(client, url, settings.speed_test_bytes).await {
            Ok(rate) => Some(rate),
            Err(e) => {
                debug!(error = %e, "speed test failed");
                None
            }
        },
        None => None,
    };
    Ok(Measurement {
        latency_ms,
        throughput_bps,
    })
}

/// Bytes per second over a GET of `url`, reading at most `cap` bytes.
pub(crate) async fn download_rate(client: &Client, url: &str, cap: u64) -> Result<f64, ProbeError> {
    let start = Instant::now();
    let resp = client.get(url).send().await?;
    read_rate(resp, cap, start).await
}

pub(crate) async fn read_rate(
    mut resp: reqwest::Response,
    cap: u64,
    start: Instant,
) -> Result<f64, ProbeError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(ProbeError::Status(status.as_u16()));
    }
    let mut total: u64 = 0;
    while let Some(chunk) = resp.chunk().await? {
        total += chunk.len() as u64;
        if total >= cap {
            break;
        }
    }
    if total == 0 {
        return Err(ProbeError::Invalid("empty response body".into()));
    }
    let secs = start.elapsed().as_secs_f64().max(1e-3);
    Ok(total as f64 / secs)
}
