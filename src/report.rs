use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;

use ::time::{format_description::well_known, OffsetDateTime};
use serde::Serialize;
use serde_yaml::Mapping;

use crate::config::{OutputConfig, OutputFormat};
use crate::error::WriteError;
use crate::types::{RunReport, RunSummary, ScoredCandidate};

/// Sort by score, highest first, and keep the first `top_k`.
///
/// The sort is stable, so equal scores keep discovery order.
pub fn rank(mut scored: Vec<ScoredCandidate>, top_k: usize) -> Vec<ScoredCandidate> {
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(top_k);
    scored
}

/// `summary.written` counts the entries the subscription in `format` will
/// actually contain.
pub fn build_report(
    scored: Vec<ScoredCandidate>,
    top_k: usize,
    format: OutputFormat,
    mut summary: RunSummary,
    generated_at: OffsetDateTime,
) -> RunReport {
    let entries = rank(scored, top_k);
    summary.written = entries.iter().filter(|e| is_emitted(e, format)).count() as u64;
    RunReport {
        generated_at: rfc3339(generated_at),
        summary,
        entries,
    }
}

pub fn rfc3339(t: OffsetDateTime) -> String {
    t.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

fn is_emitted(entry: &ScoredCandidate, format: OutputFormat) -> bool {
    match format {
        OutputFormat::Yaml => true,
        OutputFormat::M3u => entry.candidate.field_str("url").is_some(),
    }
}

/// Display name folded onto one line, so input data cannot add rows.
fn single_line(name: &str) -> String {
    name.replace('\n', "\\n").replace('\r', "\\r")
}

#[derive(Serialize)]
struct SubscriptionDoc<'a> {
    proxies: Vec<&'a Mapping>,
}

/// Subscription document for the ranked entries. Always valid, even when empty.
pub fn render_subscription(
    entries: &[ScoredCandidate],
    format: OutputFormat,
) -> Result<String, WriteError> {
    match format {
        OutputFormat::Yaml => {
            let doc = SubscriptionDoc {
                proxies: entries.iter().map(|e| &e.candidate.fields).collect(),
            };
            Ok(serde_yaml::to_string(&doc)?)
        }
        OutputFormat::M3u => {
            let mut out = String::from("#EXTM3U\n");
            for e in entries {
                let Some(url) = e.candidate.field_str("url") else {
                    continue;
                };
                let mut attrs = String::new();
                for (k, v) in &e.candidate.fields {
                    if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                        if k.starts_with("tvg-") {
                            let _ = write!(attrs, " {k}=\"{}\"", single_line(v));
                        }
                    }
                }
                if let Some(group) = e.candidate.field_str("group") {
                    let _ = write!(attrs, " group-title=\"{}\"", single_line(&group));
                }
                let _ = writeln!(
                    out,
                    "#EXTINF:-1{attrs},{}",
                    single_line(&e.candidate.display_name)
                );
                let _ = writeln!(out, "{}", single_line(&url));
            }
            Ok(out)
        }
    }
}

/// Human-readable ranking. The first line holds the timestamp and nothing
/// else depends on the clock.
pub fn render_report(report: &RunReport) -> String {
    let s = &report.summary;
    let mut out = String::new();
    let _ = writeln!(out, "# generated: {}", report.generated_at);
    let _ = writeln!(
        out,
        "# sources {}/{} | unique {} | probed {} | ok {} | written {}",
        s.sources_loaded,
        s.sources_total,
        s.candidates_unique,
        s.probes_attempted,
        s.probes_succeeded,
        s.written
    );
    let _ = writeln!(out, "rank | name | latency_ms | throughput_kib_s | score");
    let _ = writeln!(out, "{}", "-".repeat(80));
    for (i, e) in report.entries.iter().enumerate() {
        let throughput = e
            .throughput_bps
            .map(|t| format!("{:.2}", t / 1024.0))
            .unwrap_or_else(|| "-".into());
        let _ = writeln!(
            out,
            "{:>4}. {} | {:>9.2} | {:>12} | {:.4}",
            i + 1,
            single_line(&e.candidate.display_name).replace('|', "/"),
            e.latency_ms,
            throughput,
            e.score
        );
    }
    out
}

/// Write the subscription and the report. Any failure here is fatal to the run.
pub fn write_outputs(report: &RunReport, output: &OutputConfig) -> Result<(), WriteError> {
    let subscription = render_subscription(&report.entries, output.format)?;
    write_atomic(&output.subscription, subscription.as_bytes())?;
    write_atomic(&output.report, render_report(report).as_bytes())?;
    Ok(())
}

/// Temp file in the target directory, then rename over the destination.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), WriteError> {
    let io_err = |source| WriteError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(contents).map_err(io_err)?;
    tmp.flush().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Candidate, IdentityKey};
    use std::sync::Arc;

    fn scored(name: &str, score: f64) -> ScoredCandidate {
        let mut fields = Mapping::new();
        fields.insert("name".into(), name.into());
        fields.insert("type".into(), "ss".into());
        ScoredCandidate {
            candidate: Arc::new(Candidate {
                key: IdentityKey::new("ss", name, 1),
                display_name: name.into(),
                fields,
            }),
            latency_ms: 100.0,
            throughput_bps: None,
            score,
        }
    }

    fn names(v: &[ScoredCandidate]) -> Vec<&str> {
        v.iter().map(|e| e.candidate.display_name.as_str()).collect()
    }

    #[test]
    fn top_k_keeps_best_in_order() {
        let input = vec![scored("a", 0.9), scored("b", 0.5), scored("c", 0.7), scored("d", 0.1)];
        assert_eq!(names(&rank(input, 2)), vec!["a", "c"]);
    }

    #[test]
    fn ties_keep_discovery_order() {
        let input = vec![scored("a", 0.5), scored("b", 0.8), scored("c", 0.5), scored("d", 0.5)];
        assert_eq!(names(&rank(input, 10)), vec!["b", "a", "c", "d"]);
    }

    #[test]
    fn empty_outputs_are_valid() {
        let yaml = render_subscription(&[], OutputFormat::Yaml).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(doc["proxies"].as_sequence().map(Vec::len), Some(0));
        assert_eq!(render_subscription(&[], OutputFormat::M3u).unwrap(), "#EXTM3U\n");
    }

    #[test]
    fn m3u_output_carries_group_and_url() {
        let mut e = scored("CCTV1", 0.5);
        let c = Arc::make_mut(&mut e.candidate);
        c.fields.insert("url".into(), "http://tv.example/1".into());
        c.fields.insert("group".into(), "News".into());
        c.fields.insert("tvg-id".into(), "c1".into());
        let out = render_subscription(&[e, scored("no-url", 0.1)], OutputFormat::M3u).unwrap();
        assert_eq!(
            out,
            "#EXTM3U\n#EXTINF:-1 tvg-id=\"c1\" group-title=\"News\",CCTV1\nhttp://tv.example/1\n"
        );
    }

    #[test]
    fn report_lists_rank_and_throughput() {
        let mut best = scored("fast", 0.8);
        best.throughput_bps = Some(2048.0);
        let report = build_report(
            vec![scored("slow", 0.2), best],
            5,
            OutputFormat::Yaml,
            RunSummary::default(),
            OffsetDateTime::UNIX_EPOCH,
        );
        let text = render_report(&report);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "# generated: 1970-01-01T00:00:00Z");
        assert!(lines[1].ends_with("written 2"));
        assert_eq!(lines[4], "   1. fast |    100.00 |         2.00 | 0.8000");
        assert_eq!(lines[5], "   2. slow |    100.00 |            - | 0.2000");
    }

    #[test]
    fn names_cannot_break_report_rows() {
        let report = build_report(
            vec![
                scored("evil\n   2. fake | 0.00 | - | 1.0000", 0.9),
                scored("ok\r\nname", 0.5),
            ],
            5,
            OutputFormat::Yaml,
            RunSummary::default(),
            OffsetDateTime::UNIX_EPOCH,
        );
        let text = render_report(&report);
        let rows: Vec<_> = text.lines().skip(4).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("   1. evil\\n   2. fake / 0.00 / - / 1.0000 |"));
        assert!(rows[1].starts_with("   2. ok\\r\\nname |"));

        let mut e = scored("a\nb", 0.5);
        Arc::make_mut(&mut e.candidate)
            .fields
            .insert("url".into(), "http://tv.example/1".into());
        let m3u = render_subscription(&[e], OutputFormat::M3u).unwrap();
        assert_eq!(m3u.lines().count(), 3);
        assert!(m3u.contains("#EXTINF:-1,a\\nb\n"));
    }

    #[test]
    fn written_counts_only_emitted_playlist_entries() {
        let mut with_url = scored("CCTV1", 0.9);
        Arc::make_mut(&mut with_url.candidate)
            .fields
            .insert("url".into(), "http://tv.example/1".into());
        let entries = vec![with_url, scored("proxy", 0.5)];
        let m3u = build_report(
            entries.clone(),
            5,
            OutputFormat::M3u,
            RunSummary::default(),
            OffsetDateTime::UNIX_EPOCH,
        );
        assert_eq!(m3u.summary.written, 1);
        let yaml = build_report(
            entries,
            5,
            OutputFormat::Yaml,
            RunSummary::default(),
            OffsetDateTime::UNIX_EPOCH,
        );
        assert_eq!(yaml.summary.written, 2);
    }
}
