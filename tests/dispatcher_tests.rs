use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_yaml::Mapping;
use sub_probe_rs::dispatcher::{dispatch, dispatch_with_cancel};
use sub_probe_rs::probe::{Probe, ProbeError, ProbeRegistry};
use sub_probe_rs::types::{Candidate, FailureReason, IdentityKey, Measurement, ProbeOutcome};
use tokio_util::sync::CancellationToken;

fn candidate(protocol: &str, host: &str, port: u16, extra: &[(&str, &str)]) -> Candidate {
    let mut fields = Mapping::new();
    fields.insert("name".into(), host.into());
    fields.insert("type".into(), protocol.into());
    fields.insert("server".into(), host.into());
    fields.insert("port".into(), u64::from(port).into());
    for (k, v) in extra {
        fields.insert((*k).into(), (*v).into());
    }
    Candidate {
        key: IdentityKey::new(protocol, host, port),
        display_name: host.to_string(),
        fields,
    }
}

/// Sleeps for `delay`, tracking how many calls are in flight.
struct SleepProbe {
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SleepProbe {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Probe for SleepProbe {
    fn required_fields(&self) -> &[&'static str] {
        &["password"]
    }

    async fn probe(&self, _candidate: &Candidate) -> Result<Measurement, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Measurement {
            latency_ms: self.delay.as_secs_f64() * 1000.0,
            throughput_bps: None,
        })
    }
}

struct FailingProbe;

#[async_trait]
impl Probe for FailingProbe {
    async fn probe(&self, _candidate: &Candidate) -> Result<Measurement, ProbeError> {
        Err(ProbeError::Status(503))
    }
}

struct PanickingProbe;

#[async_trait]
impl Probe for PanickingProbe {
    async fn probe(&self, _candidate: &Candidate) -> Result<Measurement, ProbeError> {
        panic!("probe blew up");
    }
}

fn reason(outcome: &ProbeOutcome) -> Option<&FailureReason> {
    match outcome {
        ProbeOutcome::Failure(r) => Some(r),
        ProbeOutcome::Success(_) => None,
    }
}

#[tokio::test]
async fn every_candidate_gets_exactly_one_result_in_order() {
    let sleeper = SleepProbe::new(Duration::from_millis(5));
    let mut reg = ProbeRegistry::new();
    reg.register("ss", sleeper.clone())
        .register("http", Arc::new(FailingProbe));

    let input = vec![
        candidate("ss", "a.example", 1, &[("password", "x")]),
        candidate("http", "b.example", 2, &[]),
        candidate("wireguard", "c.example", 3, &[]),
        candidate("ss", "d.example", 4, &[]),
        candidate("ss", "e.example", 5, &[("password", "y")]),
    ];
    let keys: Vec<_> = input.iter().map(|c| c.key.clone()).collect();

    let results = dispatch(input, &reg, 3, Duration::from_secs(5)).await;
    assert_eq!(results.len(), 5);
    let got: Vec<_> = results.iter().map(|r| r.candidate.key.clone()).collect();
    assert_eq!(got, keys);

    assert!(results[0].is_success());
    assert_eq!(
        reason(&results[1].outcome),
        Some(&FailureReason::ProbeError("unexpected HTTP status 503".into()))
    );
    assert_eq!(
        reason(&results[2].outcome),
        Some(&FailureReason::UnsupportedProtocol("wireguard".into()))
    );
    assert_eq!(
        reason(&results[3].outcome),
        Some(&FailureReason::MissingFields(vec!["password".into()]))
    );
    assert!(results[4].is_success());
    // Rejected candidates never reach the probe.
    assert_eq!(sleeper.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn empty_input_yields_empty_output() {
    let reg = ProbeRegistry::new();
    let results = dispatch(Vec::new(), &reg, 4, Duration::from_secs(1)).await;
    assert!(results.is_empty());
}

#[tokio::test]
async fn slow_probe_times_out_promptly() {
    let mut reg = ProbeRegistry::new();
    reg.register("ss", SleepProbe::new(Duration::from_secs(30)));
    let started = std::time::Instant::now();
    let results = dispatch(
        vec![candidate("ss", "slow.example", 1, &[("password", "x")])],
        &reg,
        1,
        Duration::from_millis(200),
    )
    .await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(reason(&results[0].outcome), Some(&FailureReason::Timeout));
}

#[tokio::test]
async fn panicking_probe_only_fails_its_candidate() {
    let mut reg = ProbeRegistry::new();
    reg.register("trojan", Arc::new(PanickingProbe))
        .register("ss", SleepProbe::new(Duration::from_millis(1)));
    let results = dispatch(
        vec![
            candidate("trojan", "boom.example", 1, &[]),
            candidate("ss", "fine.example", 2, &[("password", "x")]),
        ],
        &reg,
        2,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(results.len(), 2);
    assert!(matches!(
        reason(&results[0].outcome),
        Some(FailureReason::ProbeError(_))
    ));
    assert!(results[1].is_success());
}

#[tokio::test(start_paused = true)]
async fn pool_bounds_concurrency_and_wall_time() {
    let sleeper = SleepProbe::new(Duration::from_secs(1));
    let mut reg = ProbeRegistry::new();
    reg.register("ss", sleeper.clone());
    let input: Vec<_> = (1..=5)
        .map(|i| candidate("ss", &format!("n{i}.example"), i, &[("password", "x")]))
        .collect();

    let started = tokio::time::Instant::now();
    let results = dispatch(input, &reg, 2, Duration::from_secs(5)).await;
    let elapsed = started.elapsed();

    assert!(results.iter().all(|r| r.is_success()));
    assert_eq!(sleeper.peak.load(Ordering::SeqCst), 2);
    // ceil(5 / 2) rounds of one second each.
    assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(3500), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn cancellation_marks_unfinished_candidates() {
    let mut reg = ProbeRegistry::new();
    reg.register("ss", SleepProbe::new(Duration::from_secs(10)));
    let input: Vec<_> = (1..=4)
        .map(|i| candidate("ss", &format!("c{i}.example"), i, &[("password", "x")]))
        .collect();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let results = dispatch_with_cancel(input, &reg, 2, Duration::from_secs(60), cancel).await;
    assert_eq!(results.len(), 4);
    for r in &results {
        assert_eq!(reason(&r.outcome), Some(&FailureReason::Cancelled));
    }
}

#[cfg(target_os = "linux")]
mod helper_cleanup {
    use super::*;
    use sub_probe_rs::probe::helper::{ephemeral_port, HelperProcess};

    /// Process state from /proc; `None` once the pid is fully reaped.
    fn proc_state(pid: u32) -> Option<char> {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let after = stat.rsplit_once(')')?.1;
        after.trim_start().chars().next()
    }

    /// Starts `sleep` as a never-ready helper and waits on it forever.
    struct StuckHelperProbe {
        pid: Arc<std::sync::Mutex<Option<u32>>>,
        config: Arc<std::sync::Mutex<Option<std::path::PathBuf>>>,
    }

    #[async_trait]
    impl Probe for StuckHelperProbe {
        async fn probe(&self, _candidate: &Candidate) -> Result<Measurement, ProbeError> {
            let port = ephemeral_port()?;
            let mut helper = HelperProcess::start(
                std::path::Path::new("sleep"),
                "{}",
                ".json",
                port,
                |_| vec!["30".into()],
            )?;
            *self.pid.lock().unwrap() = helper.pid();
            *self.config.lock().unwrap() = Some(helper.config_path().to_path_buf());
            helper.wait_ready(Duration::from_secs(60)).await?;
            Err(ProbeError::Helper("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn timed_out_helper_is_killed_and_config_removed() {
        let pid = Arc::new(std::sync::Mutex::new(None));
        let config = Arc::new(std::sync::Mutex::new(None));
        let mut reg = ProbeRegistry::new();
        reg.register(
            "vless",
            Arc::new(StuckHelperProbe {
                pid: pid.clone(),
                config: config.clone(),
            }),
        );

        let results = dispatch(
            vec![candidate("vless", "stuck.example", 443, &[])],
            &reg,
            1,
            Duration::from_millis(300),
        )
        .await;
        assert_eq!(reason(&results[0].outcome), Some(&FailureReason::Timeout));

        let pid = pid.lock().unwrap().expect("helper started");
        let config = config.lock().unwrap().clone().expect("config written");
        assert!(!config.exists());

        // SIGKILL is delivered at drop; allow a moment for the state change.
        let mut alive = true;
        for _ in 0..50 {
            match proc_state(pid) {
                None | Some('Z') | Some('X') => {
                    alive = false;
                    break;
                }
                Some(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        assert!(!alive, "helper {pid} still running");
    }
}
