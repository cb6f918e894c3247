use std::io::Write;

use sub_probe_rs::config::{FetchSettings, Source, SourceFormat};
use sub_probe_rs::error::FetchError;
use sub_probe_rs::fetch::Fetcher;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher(attempts: u32) -> Fetcher {
    Fetcher::new(FetchSettings {
        attempts,
        backoff_ms: 10,
        timeout_ms: 2_000,
        ..FetchSettings::default()
    })
    .expect("client builds")
}

#[tokio::test]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sub"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sub"))
        .and(header("user-agent", "clash.meta"))
        .respond_with(ResponseTemplate::new(200).set_body_string("proxies: []\n"))
        .mount(&server)
        .await;

    let src = Source::new(format!("{}/sub", server.uri()), SourceFormat::Clash);
    let body = fetcher(3).fetch_one(&src).await.expect("second attempt succeeds");
    assert_eq!(body, "proxies: []\n");
}

#[tokio::test]
async fn not_found_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let src = Source::new(format!("{}/gone", server.uri()), SourceFormat::Auto);
    let err = fetcher(3).fetch_one(&src).await.unwrap_err();
    assert!(matches!(err, FetchError::Status { status: 404, .. }));
}

#[tokio::test]
async fn local_files_and_file_urls_are_read() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "CCTV1,http://tv.example/1").unwrap();
    let path = file.path().to_path_buf();

    let f = fetcher(1);
    let plain = f
        .fetch_one(&Source::new(path.display().to_string(), SourceFormat::Text))
        .await
        .unwrap();
    let url = url::Url::from_file_path(&path).unwrap();
    let via_url = f
        .fetch_one(&Source::new(url.to_string(), SourceFormat::Text))
        .await
        .unwrap();
    assert_eq!(plain, "CCTV1,http://tv.example/1\n");
    assert_eq!(plain, via_url);
}

#[tokio::test]
async fn fetch_all_keeps_going_after_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_string("a,http://x.example/a"))
        .mount(&server)
        .await;

    let sources = vec![
        Source::new("/definitely/not/here.txt", SourceFormat::Text),
        Source::new(format!("{}/ok", server.uri()), SourceFormat::Text),
    ];
    let report = fetcher(1).fetch_all(&sources).await;
    assert_eq!(report.documents.len(), 1);
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(report.failures[0].1, FetchError::Io { .. }));
}
