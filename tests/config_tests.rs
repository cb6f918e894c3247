use std::io::Write;

use sub_probe_rs::config::{Config, OutputFormat, SourceFormat};
use sub_probe_rs::score::MissingThroughput;

#[test]
fn loads_toml_over_defaults() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    write!(
        file,
        r#"
concurrency = 8
top_k = 5
sources = [
  "https://example.com/a.yaml",
  {{ url = "https://example.com/live.m3u", format = "m3u" }},
]

[scoring]
latency = 1.0
throughput = 3.0
missing_throughput = "zero"

[filter]
exclude_networks = ["10.0.0.0/8"]
include_keywords = ["CCTV", "卫视"]

[output]
format = "m3u"
"#
    )
    .unwrap();

    let mut cfg = Config::load(Some(file.path())).expect("config loads");
    cfg.validate().expect("config valid");

    assert_eq!(cfg.concurrency, 8);
    assert_eq!(cfg.top_k, 5);
    // untouched values keep their defaults
    assert_eq!(cfg.probe_timeout_ms, 20_000);
    assert_eq!(cfg.sources.len(), 2);
    assert_eq!(cfg.sources[0].format, SourceFormat::Auto);
    assert_eq!(cfg.sources[1].format, SourceFormat::M3u);
    assert!((cfg.scoring.latency - 0.25).abs() < 1e-9);
    assert!((cfg.scoring.throughput - 0.75).abs() < 1e-9);
    assert_eq!(cfg.scoring.missing_throughput, MissingThroughput::Zero);
    assert_eq!(cfg.filter.exclude_networks.len(), 1);
    assert_eq!(cfg.filter.include_keywords, vec!["CCTV", "卫视"]);
    assert_eq!(cfg.output.format, OutputFormat::M3u);
}

#[test]
fn sources_file_is_merged_after_inline_sources() {
    let mut list = tempfile::NamedTempFile::new().unwrap();
    writeln!(list, "https://example.com/a.yaml\nhttps://example.com/b.txt text").unwrap();

    let cfg = Config {
        sources: vec![sub_probe_rs::config::Source::new(
            "https://example.com/a.yaml",
            SourceFormat::Clash,
        )],
        sources_file: Some(list.path().to_path_buf()),
        ..Config::default()
    };
    let sources = cfg.resolved_sources().unwrap();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0].format, SourceFormat::Clash);
    assert_eq!(sources[1].format, SourceFormat::Text);
}

#[test]
fn negative_weight_is_invalid() {
    let mut cfg = Config::default();
    cfg.scoring.throughput = -1.0;
    assert!(cfg.validate().is_err());
}
