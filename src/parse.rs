//! Normalizes subscription documents into [`Candidate`] records.
//!
//! Parsing is tolerant: an entry that cannot be turned into a candidate is
//! logged and skipped, only a document that is unreadable as a whole is an
//! error.

use serde_yaml::{Mapping, Value};
use tracing::warn;
use url::Url;

use crate::config::SourceFormat;
use crate::error::ParseError;
use crate::types::{Candidate, IdentityKey};

/// Protocol name given to playlist and text-list entries.
pub const STREAM_PROTOCOL: &str = "stream";

/// Guess the format of a document declared as [`SourceFormat::Auto`].
pub fn detect_format(body: &str) -> SourceFormat {
    let head = body.trim_start_matches('\u{feff}').trim_start();
    if head.starts_with("#EXTM3U") || body.contains("#EXTINF") {
        SourceFormat::M3u
    } else if body
        .lines()
        .any(|l| l.starts_with("proxies:") || l.trim_start().starts_with("\"proxies\":"))
    {
        SourceFormat::Clash
    } else if proxies_sequence(body).is_ok() {
        // flow-style or single-line JSON documents
        SourceFormat::Clash
    } else {
        SourceFormat::Text
    }
}

/// Parse `body` according to `format` into a one-pass sequence of candidates.
pub fn parse_document(body: &str, format: SourceFormat) -> Result<Entries<'_>, ParseError> {
    let format = match format {
        SourceFormat::Auto => detect_format(body),
        f => f,
    };
    let inner = match format {
        SourceFormat::Clash => Inner::Clash(proxies_sequence(body)?.into_iter()),
        SourceFormat::M3u => Inner::Playlist {
            lines: body.lines(),
            pending: None,
        },
        SourceFormat::Text | SourceFormat::Auto => Inner::Text {
            lines: body.lines(),
            group: None,
        },
    };
    Ok(Entries { inner, skipped: 0 })
}

fn proxies_sequence(body: &str) -> Result<Vec<Value>, ParseError> {
    let doc: Value = serde_yaml::from_str(body)?;
    let Value::Mapping(mut map) = doc else {
        return Err(ParseError::MissingProxies);
    };
    match map.remove("proxies") {
        Some(Value::Sequence(seq)) => Ok(seq),
        // `proxies:` with nothing under it
        Some(Value::Null) => Ok(Vec::new()),
        _ => Err(ParseError::MissingProxies),
    }
}

/// Lazy, finite sequence of candidates from one document.
pub struct Entries<'a> {
    inner: Inner<'a>,
    skipped: usize,
}

enum Inner<'a> {
    Clash(std::vec::IntoIter<Value>),
    Playlist {
        lines: std::str::Lines<'a>,
        pending: Option<ExtInf>,
    },
    Text {
        lines: std::str::Lines<'a>,
        group: Option<String>,
    },
}

impl Entries<'_> {
    /// Number of malformed entries dropped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for Entries<'_> {
    type Item = Candidate;

    fn next(&mut self) -> Option<Candidate> {
        loop {
            let parsed = match &mut self.inner {
                Inner::Clash(values) => {
                    let value = values.next()?;
                    proxy_candidate(value)
                }
                Inner::Playlist { lines, pending } => {
                    let Some(line) = lines.next() else {
                        if pending.take().is_some() {
                            self.skipped += 1;
                        }
                        return None;
                    };
                    let line = line.trim();
                    if line.is_empty() || line.starts_with("#EXTM3U") {
                        continue;
                    }
                    if let Some(info) = line.strip_prefix("#EXTINF:") {
                        if pending.is_some() {
                            warn!("playlist info line without location, dropping previous entry");
                            self.skipped += 1;
                        }
                        *pending = Some(parse_extinf(info));
                        continue;
                    }
                    if line.starts_with('#') {
                        continue;
                    }
                    let info = pending.take().unwrap_or_default();
                    stream_candidate(line, info.name, info.group, info.attrs)
                }
                Inner::Text { lines, group } => {
                    let line = lines.next()?.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    let (name, location) = split_text_line(line);
                    if location.eq_ignore_ascii_case("#genre#") {
                        *group = name.map(str::to_string);
                        continue;
                    }
                    stream_candidate(location, name.map(str::to_string), group.clone(), Vec::new())
                }
            };
            match parsed {
                Ok(c) => return Some(c),
                Err(reason) => {
                    warn!(%reason, "skipping malformed entry");
                    self.skipped += 1;
                }
            }
        }
    }
}

fn proxy_candidate(value: Value) -> Result<Candidate, String> {
    let Value::Mapping(fields) = value else {
        return Err("entry is not a mapping".into());
    };
    let protocol = scalar(&fields, "type").ok_or("missing `type`")?;
    let server = scalar(&fields, "server").ok_or("missing `server`")?;
    let port = fields
        .get("port")
        .and_then(port_value)
        .ok_or_else(|| format!("bad or missing `port` for {server}"))?;
    let display_name = scalar(&fields, "name").unwrap_or_else(|| format!("{server}:{port}"));
    Ok(Candidate {
        key: IdentityKey::new(&protocol, &server, port),
        display_name,
        fields,
    })
}

fn scalar(map: &Mapping, key: &str) -> Option<String> {
    let s = match map.get(key)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn port_value(v: &Value) -> Option<u16> {
    let n = match v {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    u16::try_from(n).ok().filter(|p| *p != 0)
}

#[derive(Debug, Default, PartialEq)]
struct ExtInf {
    name: Option<String>,
    group: Option<String>,
    attrs: Vec<(String, String)>,
}

/// `-1 tvg-id="x" group-title="News",Channel Name`
fn parse_extinf(info: &str) -> ExtInf {
    let mut in_quote = false;
    let mut split_at = None;
    for (i, c) in info.char_indices() {
        match c {
            '"' => in_quote = !in_quote,
            ',' if !in_quote => {
                split_at = Some(i);
                break;
            }
            _ => {}
        }
    }
    let (head, name) = match split_at {
        Some(i) => (&info[..i], info[i + 1..].trim()),
        None => (info, ""),
    };

    let mut attrs = Vec::new();
    let mut rest = head.trim_start();
    // duration
    rest = rest
        .find(char::is_whitespace)
        .map(|i| &rest[i..])
        .unwrap_or("");
    while let Some(eq) = rest.find("=\"") {
        let key = rest[..eq].trim();
        let after = &rest[eq + 2..];
        let Some(end) = after.find('"') else { break };
        if !key.is_empty() {
            attrs.push((key.to_string(), after[..end].to_string()));
        }
        rest = &after[end + 1..];
    }

    let group = attrs
        .iter()
        .find(|(k, _)| k == "group-title")
        .map(|(_, v)| v.clone())
        .filter(|v| !v.is_empty());
    attrs.retain(|(k, _)| k != "group-title");
    ExtInf {
        name: (!name.is_empty()).then(|| name.to_string()),
        group,
        attrs,
    }
}

fn split_text_line(line: &str) -> (Option<&str>, &str) {
    let split = line
        .split_once(',')
        .or_else(|| line.split_once(char::is_whitespace));
    match split {
        Some((name, location)) if !location.trim().is_empty() => {
            let name = name.trim();
            ((!name.is_empty()).then_some(name), location.trim())
        }
        _ => (None, line),
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "rtmp" => Some(1935),
        "rtsp" => Some(554),
        "mms" => Some(1755),
        _ => None,
    }
}

fn stream_candidate(
    location: &str,
    name: Option<String>,
    group: Option<String>,
    attrs: Vec<(String, String)>,
) -> Result<Candidate, String> {
    let url = Url::parse(location).map_err(|e| format!("bad location {location:?}: {e}"))?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| format!("location without host: {location}"))?;
    let port = url
        .port_or_known_default()
        .or_else(|| default_port(url.scheme()))
        .ok_or_else(|| format!("location without port: {location}"))?;
    let mut resource = url.path().to_string();
    if let Some(q) = url.query() {
        resource.push('?');
        resource.push_str(q);
    }

    let display_name = name.unwrap_or_else(|| location.to_string());
    let mut fields = Mapping::new();
    fields.insert("name".into(), display_name.clone().into());
    fields.insert("type".into(), STREAM_PROTOCOL.into());
    fields.insert("url".into(), location.into());
    if let Some(g) = group {
        fields.insert("group".into(), g.into());
    }
    for (k, v) in attrs {
        fields.insert(k.into(), v.into());
    }

    Ok(Candidate {
        key: IdentityKey::new(STREAM_PROTOCOL, host, port).with_resource(resource),
        display_name,
        fields,
    })
}
