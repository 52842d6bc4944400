//! End-to-end engine scenarios against the in-memory session: operation
//! accounting, rate pacing, mid-run stop, SLO breach, populate reset, and
//! the in-flight ceiling.

use std::sync::Arc;
use std::time::Duration;

use cqlstress::config::{PopulateOpt, RunConfig};
use cqlstress::driver::{MemorySession, Session};
use cqlstress::engine::run_stress;
use cqlstress::engine::termination::StopReason;
use cqlstress::metrics::MetricsBundle;
use cqlstress::{RunState, Terminator};

fn config(workload: &str) -> RunConfig {
    RunConfig::builder()
        .workload(workload)
        .rate(0)
        .threads(4)
        .partition_count(5_000)
        .queue_depth(16)
        .build()
}

struct Run {
    session: Arc<MemorySession>,
    metrics: Arc<MetricsBundle>,
    terminator: Arc<Terminator>,
}

impl Run {
    fn new(session: MemorySession) -> Self {
        Self {
            session: Arc::new(session),
            metrics: Arc::new(MetricsBundle::new()),
            terminator: Arc::new(Terminator::new()),
        }
    }

    async fn execute(&self, config: RunConfig) -> cqlstress::RunOutcome {
        run_stress(
            config,
            Arc::clone(&self.session) as Arc<dyn Session>,
            Arc::clone(&self.metrics),
            Vec::new(),
            Arc::clone(&self.terminator),
        )
        .await
        .expect("run failed to start")
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fixed_count_run_accounts_for_every_operation() {
    let run = Run::new(MemorySession::builder().build());
    let mut config = config("KeyValue");
    config.iterations = Some(20_000);
    config.read_rate = Some(0.5);

    let outcome = run.execute(config).await;

    let metrics = outcome.metrics;
    assert_eq!(
        metrics.selects.count + metrics.mutations.count + metrics.errors.count,
        20_000
    );
    assert_eq!(metrics.deletions.count, 0);
    assert_eq!(metrics.populate.count, 0);
    // every metered op maps to exactly one driver submission
    assert_eq!(run.session.submissions(), 20_000);
    assert_eq!(outcome.reason, Some(StopReason::CountReached));
    // both kinds actually happened at a 0.5 mix
    assert!(metrics.selects.count > 5_000);
    assert!(metrics.mutations.count > 5_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failures_land_in_the_error_meter_not_the_timers() {
    let run = Run::new(MemorySession::builder().fail_every(Some(5)).build());
    let mut config = config("KeyValue");
    config.iterations = Some(10_000);
    config.read_rate = Some(0.0);

    let outcome = run.execute(config).await;

    let metrics = outcome.metrics;
    assert_eq!(metrics.errors.count, 2_000);
    assert_eq!(metrics.mutations.count, 8_000);
    assert_eq!(metrics.mutations.count + metrics.errors.count, 10_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_limiter_paces_the_run() {
    let run = Run::new(MemorySession::builder().build());
    let mut config = config("KeyValue");
    config.threads = 2;
    config.rate = 1_000;
    config.iterations = Some(300);

    let started = std::time::Instant::now();
    let outcome = run.execute(config).await;
    let elapsed = started.elapsed();

    assert_eq!(outcome.metrics.total_ops(), 300);
    // the bucket starts empty and refills at 100 tokens per 100ms tick
    assert!(elapsed >= Duration::from_millis(250), "finished too fast: {elapsed:?}");
    let observed = 300.0 / elapsed.as_secs_f64();
    assert!(observed <= 1_000.0 * 1.05, "observed {observed:.0} ops/s");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn external_stop_drains_and_freezes_the_counts() {
    let run = Run::new(MemorySession::builder().latency(Duration::from_millis(1)).build());
    let mut config = config("KeyValue");
    config.iterations = Some(1_000_000_000);
    config.rate = 500;

    let handle = {
        let session = Arc::clone(&run.session) as Arc<dyn Session>;
        let metrics = Arc::clone(&run.metrics);
        let terminator = Arc::clone(&run.terminator);
        let config = config.clone();
        tokio::spawn(run_stress(config, session, metrics, Vec::new(), terminator))
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    run.terminator.signal(StopReason::ExternalStop);
    run.terminator.await_stopped().await;
    assert_eq!(run.terminator.state(), RunState::Stopped);

    // in-flight drained before Stopped: counts must not move afterwards
    let frozen = run.metrics.snapshot();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let later = run.metrics.snapshot();
    assert_eq!(frozen.total_ops(), later.total_ops());

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.reason, Some(StopReason::ExternalStop));
    assert!(outcome.metrics.total_ops() < 1_000_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slo_breach_fails_the_run() {
    // the third submission stalls well past the read ceiling
    let run = Run::new(
        MemorySession::builder().slow_op(Some((3, Duration::from_millis(120)))).build(),
    );
    let mut config = config("KeyValue");
    config.threads = 1;
    config.queue_depth = 1;
    config.iterations = Some(1_000_000);
    config.read_rate = Some(1.0);
    config.max_read_latency_ms = Some(50);

    let outcome = run.execute(config).await;

    assert!(outcome.failed());
    match outcome.reason {
        Some(StopReason::SloBreach { latency_ms, .. }) => assert!(latency_ms >= 100),
        other => panic!("expected SLO breach, got {other:?}"),
    }
    assert!(outcome.metrics.total_ops() >= 1);
    assert!(outcome.metrics.total_ops() < 1_000_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn populate_runs_first_and_resets_the_metrics() {
    let run = Run::new(MemorySession::builder().build());
    let mut config = config("KeyValue");
    config.partition_count = 500;
    config.populate = PopulateOpt::Standard;
    config.iterations = Some(2_000);
    config.read_rate = Some(0.5);

    let outcome = run.execute(config).await;

    let metrics = outcome.metrics;
    // populate samples were wiped by the reset between phases
    assert_eq!(metrics.populate.count, 0);
    assert_eq!(
        metrics.selects.count + metrics.mutations.count + metrics.errors.count,
        2_000
    );
    // 500 populate submissions plus the measured phase
    assert_eq!(run.session.submissions(), 2_500);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_never_exceeds_queue_depth_times_threads() {
    let run = Run::new(MemorySession::builder().latency(Duration::from_millis(2)).build());
    let mut config = config("KeyValue");
    config.threads = 2;
    config.queue_depth = 4;
    config.iterations = Some(500);

    run.execute(config).await;

    assert!(
        run.session.peak_in_flight() <= 8,
        "peak in-flight {} exceeded queue_depth * threads",
        run.session.peak_in_flight()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_run_stops_on_the_duration() {
    let run = Run::new(MemorySession::builder().build());
    let mut config = config("KeyValue");
    config.threads = 2;
    config.rate = 500;
    config.duration_secs = Some(1);

    let started = std::time::Instant::now();
    let outcome = run.execute(config).await;
    let elapsed = started.elapsed();

    assert_eq!(outcome.reason, Some(StopReason::DurationElapsed));
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(3), "drain took too long: {elapsed:?}");
    assert!(outcome.metrics.total_ops() > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paginated_reads_walk_every_page_inside_one_submission() {
    let run = Run::new(MemorySession::builder().pages_per_read(3).build());
    let mut config = config("KeyValue");
    config.threads = 2;
    config.iterations = Some(1_000);
    config.read_rate = Some(1.0);
    config.paginate = true;
    config.paging = Some(100);

    let outcome = run.execute(config).await;

    assert_eq!(outcome.metrics.selects.count, 1_000);
    // page fetches do not count as extra submissions
    assert_eq!(run.session.submissions(), 1_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequential_keys_cover_the_space_without_gaps() {
    let run = Run::new(MemorySession::builder().build());
    let mut config = config("KeyValue");
    config.threads = 4;
    config.partition_count = 10_000;
    config.key_generator = cqlstress::KeyDistribution::Sequence;
    config.iterations = Some(10_000);
    config.read_rate = Some(0.0);

    let outcome = run.execute(config).await;
    assert_eq!(outcome.metrics.mutations.count + outcome.metrics.errors.count, 10_000);
}

#[tokio::test]
async fn configuration_errors_surface_before_any_worker_starts() {
    let run = Run::new(MemorySession::builder().build());

    let mut bad_rates = config("KeyValue");
    bad_rates.read_rate = Some(0.9);
    bad_rates.delete_rate = 0.5;
    let err = run_stress(
        bad_rates,
        Arc::clone(&run.session) as Arc<dyn Session>,
        Arc::clone(&run.metrics),
        Vec::new(),
        Arc::clone(&run.terminator),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("read rate"));
    assert_eq!(run.session.submissions(), 0);

    let mut unknown_param = config("BasicTimeSeries");
    unknown_param.iterations = Some(10);
    unknown_param.workload_parameters.insert("wat".into(), "1".into());
    let err = run_stress(
        unknown_param,
        Arc::clone(&run.session) as Arc<dyn Session>,
        Arc::clone(&run.metrics),
        Vec::new(),
        Arc::new(Terminator::new()),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("wat"));
    assert_eq!(run.session.submissions(), 0);
}
