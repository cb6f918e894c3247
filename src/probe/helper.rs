//! Probes that go through an external client binary (xray, hysteria).
//!
//! Each probe run gets its own ephemeral local SOCKS port and its own temp
//! config file; both the child process and the file live inside
//! [`HelperProcess`], so every exit path (success, error, timeout-driven
//! drop) kills the child and removes the file.

use std::ffi::OsString;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value as Json};
use serde_yaml::Value as Yaml;
use tempfile::NamedTempFile;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{self, Instant};
use tracing::debug;

use super::{authority, measure_http, proxied_client, Probe, ProbeError};
use crate::config::ProbeSettings;
use crate::types::{Candidate, Measurement};

const READY_POLL: Duration = Duration::from_millis(50);

/// Ask the OS for a free loopback port.
pub fn ephemeral_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// A running helper client plus its config file.
#[derive(Debug)]
pub struct HelperProcess {
    child: Child,
    port: u16,
    _config: NamedTempFile,
}

impl HelperProcess {
    /// Write `config` to a temp file and start `bin` with the arguments
    /// produced by `args` for that file's path.
    pub fn start<F>(
        bin: &Path,
        config: &str,
        suffix: &str,
        port: u16,
        args: F,
    ) -> Result<Self, ProbeError>
    where
        F: FnOnce(&Path) -> Vec<OsString>,
    {
        let mut file = tempfile::Builder::new()
            .prefix("sub-probe-")
            .suffix(suffix)
            .tempfile()?;
        file.write_all(config.as_bytes())?;
        file.flush()?;

        let child = Command::new(bin)
            .args(args(file.path()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProbeError::Helper(format!("failed to spawn {}: {e}", bin.display())))?;

        Ok(Self {
            child,
            port,
            _config: file,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn config_path(&self) -> &Path {
        self._config.path()
    }

    /// Poll the local port until it accepts connections, the helper exits,
    /// or `timeout` elapses.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<(), ProbeError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Err(ProbeError::Helper(format!("exited early with {status}")));
            }
            if TcpStream::connect(("127.0.0.1", self.port)).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ProbeError::Helper(format!(
                    "port {} not ready after {:?}",
                    self.port, timeout
                )));
            }
            time::sleep(READY_POLL).await;
        }
    }
}

impl Drop for HelperProcess {
    fn drop(&mut self) {
        // SIGKILL is sent synchronously; tokio reaps the child afterwards.
        let _ = self.child.start_kill();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperKind {
    Xray,
    Hysteria,
}

/// Starts a helper exposing a local SOCKS5 port and measures through it.
#[derive(Debug, Clone)]
pub struct HelperProbe {
    kind: HelperKind,
    settings: Arc<ProbeSettings>,
}

impl HelperProbe {
    pub fn new(kind: HelperKind, settings: Arc<ProbeSettings>) -> Self {
        Self { kind, settings }
    }

    fn launch(&self, candidate: &Candidate, port: u16) -> Result<HelperProcess, ProbeError> {
        match self.kind {
            HelperKind::Xray => {
                let config = xray_config(candidate, port)?;
                HelperProcess::start(
                    &self.settings.xray_bin,
                    &config.to_string(),
                    ".json",
                    port,
                    |path| vec!["run".into(), "-c".into(), path.as_os_str().to_owned()],
                )
            }
            HelperKind::Hysteria => {
                let config = hysteria_config(candidate, port)?;
                HelperProcess::start(
                    &self.settings.hysteria_bin,
                    &config.to_string(),
                    ".json",
                    port,
                    |path| vec!["client".into(), "-c".into(), path.as_os_str().to_owned()],
                )
            }
        }
    }
}

#[async_trait]
impl Probe for HelperProbe {
    fn missing_fields(&self, candidate: &Candidate) -> Vec<String> {
        let needed: &[&str] = match (self.kind, candidate.protocol()) {
            (HelperKind::Hysteria, _) => {
                if candidate.has_field("auth_str") || candidate.has_field("password") {
                    &[]
                } else {
                    return vec!["auth_str|password".into()];
                }
            }
            (HelperKind::Xray, "ss") => &["cipher", "password"],
            (HelperKind::Xray, "vmess") | (HelperKind::Xray, "vless") => &["uuid"],
            (HelperKind::Xray, "trojan") => &["password"],
            (HelperKind::Xray, _) => &[],
        };
        needed
            .iter()
            .filter(|f| !candidate.has_field(f))
            .map(|f| f.to_string())
            .collect()
    }

    async fn probe(&self, candidate: &Candidate) -> Result<Measurement, ProbeError> {
        let port = ephemeral_port()?;
        let mut helper = self.launch(candidate, port)?;
        debug!(key = %candidate.key, port, pid = ?helper.pid(), "helper started");
        helper.wait_ready(self.settings.helper_ready_timeout()).await?;

        let client = proxied_client(&format!("socks5h://127.0.0.1:{}", helper.port()))?;
        let result = measure_http(&client, &self.settings).await;
        drop(helper);
        result
    }
}

fn required(candidate: &Candidate, field: &str) -> Result<String, ProbeError> {
    candidate
        .field_str(field)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ProbeError::Invalid(format!("missing {field}")))
}

fn yaml_to_json(v: &Yaml) -> Json {
    serde_json::to_value(v).unwrap_or(Json::Null)
}

fn nested<'a>(candidate: &'a Candidate, outer: &str, inner: &str) -> Option<&'a Yaml> {
    candidate.fields.get(outer)?.get(inner)
}

fn nested_str(candidate: &Candidate, outer: &str, inner: &str) -> Option<String> {
    match nested(candidate, outer, inner)? {
        Yaml::String(s) => Some(s.clone()),
        Yaml::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// xray `streamSettings` from clash-style transport fields, or the
/// candidate's own `streamSettings` mapping when it carries one.
fn stream_settings(candidate: &Candidate) -> Json {
    if let Some(raw) = candidate.fields.get("streamSettings") {
        return yaml_to_json(raw);
    }

    let network = candidate
        .field_str("network")
        .unwrap_or_else(|| "tcp".into())
        .to_ascii_lowercase();
    let mut out = Map::new();
    out.insert("network".into(), json!(network));

    let server_name = candidate
        .field_str("servername")
        .or_else(|| candidate.field_str("sni"));
    let insecure = candidate.field_bool("skip-cert-verify").unwrap_or(false);

    if candidate.fields.get("reality-opts").is_some() {
        out.insert("security".into(), json!("reality"));
        out.insert(
            "realitySettings".into(),
            json!({
                "serverName": server_name,
                "publicKey": nested_str(candidate, "reality-opts", "public-key"),
                "shortId": nested_str(candidate, "reality-opts", "short-id").unwrap_or_default(),
                "fingerprint": candidate.field_str("client-fingerprint").unwrap_or_else(|| "chrome".into()),
            }),
        );
    } else if candidate.field_bool("tls").unwrap_or(false) || candidate.protocol() == "trojan" {
        out.insert("security".into(), json!("tls"));
        out.insert(
            "tlsSettings".into(),
            json!({ "serverName": server_name, "allowInsecure": insecure }),
        );
    }

    match network.as_str() {
        "ws" => {
            let path = nested_str(candidate, "ws-opts", "path").unwrap_or_else(|| "/".into());
            let headers = nested(candidate, "ws-opts", "headers")
                .map(yaml_to_json)
                .unwrap_or_else(|| json!({}));
            out.insert("wsSettings".into(), json!({ "path": path, "headers": headers }));
        }
        "grpc" => {
            let service = nested_str(candidate, "grpc-opts", "grpc-service-name").unwrap_or_default();
            out.insert("grpcSettings".into(), json!({ "serviceName": service }));
        }
        _ => {}
    }
    Json::Object(out)
}

/// xray config with a SOCKS inbound on `port` and one outbound for `candidate`.
pub fn xray_config(candidate: &Candidate, port: u16) -> Result<Json, ProbeError> {
    let address = candidate.key.host.clone();
    let server_port = candidate.key.port;
    let outbound = match candidate.protocol() {
        "ss" => json!({
            "protocol": "shadowsocks",
            "settings": { "servers": [{
                "address": address,
                "port": server_port,
                "method": required(candidate, "cipher")?,
                "password": required(candidate, "password")?,
            }]},
        }),
        "vmess" => json!({
            "protocol": "vmess",
            "settings": { "vnext": [{
                "address": address,
                "port": server_port,
                "users": [{
                    "id": required(candidate, "uuid")?,
                    "alterId": candidate.field_str("alterId").and_then(|s| s.parse::<u32>().ok()).unwrap_or(0),
                    "security": candidate.field_str("cipher").unwrap_or_else(|| "auto".into()),
                }],
            }]},
            "streamSettings": stream_settings(candidate),
        }),
        "vless" => {
            let mut user = Map::new();
            user.insert("id".into(), json!(required(candidate, "uuid")?));
            user.insert("encryption".into(), json!("none"));
            if let Some(flow) = candidate.field_str("flow").filter(|f| !f.is_empty()) {
                user.insert("flow".into(), json!(flow));
            }
            json!({
                "protocol": "vless",
                "settings": { "vnext": [{
                    "address": address,
                    "port": server_port,
                    "users": [Json::Object(user)],
                }]},
                "streamSettings": stream_settings(candidate),
            })
        }
        "trojan" => json!({
            "protocol": "trojan",
            "settings": { "servers": [{
                "address": address,
                "port": server_port,
                "password": required(candidate, "password")?,
            }]},
            "streamSettings": stream_settings(candidate),
        }),
        other => {
            return Err(ProbeError::Invalid(format!(
                "xray helper does not handle {other}"
            )))
        }
    };

    Ok(json!({
        "log": { "loglevel": "warning" },
        "inbounds": [{
            "listen": "127.0.0.1",
            "port": port,
            "protocol": "socks",
            "settings": { "auth": "noauth", "udp": false },
        }],
        "outbounds": [outbound],
    }))
}

/// hysteria (v2) client config with a SOCKS5 listener on `port`.
pub fn hysteria_config(candidate: &Candidate, port: u16) -> Result<Json, ProbeError> {
    let auth = candidate
        .field_str("auth_str")
        .or_else(|| candidate.field_str("password"))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProbeError::Invalid("missing auth_str".into()))?;
    let insecure = candidate
        .field_bool("skip-cert-verify")
        .or_else(|| candidate.field_bool("insecure"))
        .unwrap_or(false);

    let mut tls = Map::new();
    tls.insert("insecure".into(), json!(insecure));
    if let Some(sni) = candidate.field_str("sni") {
        tls.insert("sni".into(), json!(sni));
    }

    let mut config = Map::new();
    config.insert(
        "server".into(),
        json!(authority(&candidate.key.host, candidate.key.port)),
    );
    config.insert("auth".into(), json!(auth));
    config.insert("tls".into(), Json::Object(tls));
    if candidate.field_str("obfs").as_deref() == Some("salamander") {
        config.insert(
            "obfs".into(),
            json!({
                "type": "salamander",
                "salamander": { "password": candidate.field_str("obfs-password").unwrap_or_default() },
            }),
        );
    }
    config.insert(
        "socks5".into(),
        json!({ "listen": format!("127.0.0.1:{port}") }),
    );
    Ok(Json::Object(config))
}
