//! The remote-control surface.
//!
//! A line-oriented JSON transport over TCP: one request object per line,
//! one response per line, plus out-of-band heartbeat frames at a fixed
//! cadence. All commands route through [`StressTestManager`], which
//! enforces single-run exclusivity with a compare-and-set on its running
//! flag and keeps terminal-state metadata until the next run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

use crate::config::{ConfigError, RunConfig};
use crate::driver::{DriverError, Session};
use crate::engine::termination::{StopReason, Terminator};
use crate::engine::{self, RunOutcome};
use crate::fields::GENERATORS;
use crate::metrics::MetricsBundle;
use crate::workload::{self, ParamKind};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("a run is already in progress")]
    Busy,
    #[error("no run in progress")]
    NotRunning,
    #[error("unknown tool {0:?}")]
    UnknownTool(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// One request line: a tool name plus its parameters.
#[derive(Debug, Deserialize)]
pub struct Request {
    pub tool: String,
    #[serde(default)]
    pub params: Value,
}

/// Where the managed run currently stands. Terminal variants persist until
/// the next `run`.
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Stopped,
    Failed(String),
}

impl RunStatus {
    fn label(&self) -> String {
        match self {
            Self::Idle => "idle".to_string(),
            Self::Running => "running".to_string(),
            Self::Completed => "completed".to_string(),
            Self::Stopped => "stopped".to_string(),
            Self::Failed(message) => format!("failed: {message}"),
        }
    }
}

/// Builds the session for each managed run; injected so tests drive the
/// manager against fault-configured in-memory sessions.
pub type SessionFactory =
    Arc<dyn Fn() -> Result<Arc<dyn Session>, DriverError> + Send + Sync>;

#[derive(Default)]
struct ManagerState {
    status: Option<RunStatus>,
    config: Option<RunConfig>,
    job_id: Option<String>,
    last_run_time: Option<u64>,
    terminator: Option<Arc<Terminator>>,
    metrics: Option<Arc<MetricsBundle>>,
}

pub struct StressTestManager {
    running: AtomicBool,
    job_counter: AtomicU64,
    state: Mutex<ManagerState>,
    factory: SessionFactory,
}

impl StressTestManager {
    pub fn new(factory: SessionFactory) -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(false),
            job_counter: AtomicU64::new(0),
            state: Mutex::new(ManagerState::default()),
            factory,
        })
    }

    /// Acquires the running lock and spawns the run in the background.
    /// Returns the zero-padded job id.
    pub fn start_run(self: &Arc<Self>, config: RunConfig) -> Result<String, ControlError> {
        config.validate()?;
        workload::get(&config.workload)?;
        if self.running.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err()
        {
            return Err(ControlError::Busy);
        }

        let job_id = format!("{:03}", self.job_counter.fetch_add(1, Ordering::SeqCst) + 1);
        let terminator = Arc::new(Terminator::new());
        let metrics = Arc::new(MetricsBundle::new());
        {
            let mut state = self.state.lock();
            state.status = Some(RunStatus::Running);
            state.config = Some(config.clone());
            state.job_id = Some(job_id.clone());
            state.terminator = Some(Arc::clone(&terminator));
            state.metrics = Some(Arc::clone(&metrics));
        }
        tracing::info!(job_id = %job_id, workload = %config.workload, "run accepted");

        let manager = Arc::clone(self);
        let factory = Arc::clone(&self.factory);
        tokio::spawn(async move {
            let result = match (factory)() {
                Ok(session) => {
                    engine::run_stress(config, session, metrics, Vec::new(), terminator)
                        .await
                        .map_err(|err| err.to_string())
                }
                Err(err) => Err(err.to_string()),
            };
            manager.finish(result);
        });
        Ok(job_id)
    }

    fn finish(&self, result: Result<RunOutcome, String>) {
        let status = match result {
            Ok(outcome) => match outcome.reason {
                Some(reason) if reason.is_failure() => RunStatus::Failed(reason.describe()),
                Some(StopReason::ExternalStop) => RunStatus::Stopped,
                _ => RunStatus::Completed,
            },
            Err(message) => RunStatus::Failed(message),
        };
        tracing::info!(status = %status.label(), "run finished");
        let mut state = self.state.lock();
        state.status = Some(status);
        state.last_run_time = Some(unix_now());
        state.terminator = None;
        state.metrics = None;
        drop(state);
        self.running.store(false, Ordering::SeqCst);
    }

    /// Signals termination of the managed run.
    pub fn stop(&self) -> Result<(), ControlError> {
        match self.current_terminator() {
            Some(terminator) => {
                terminator.signal(StopReason::ExternalStop);
                Ok(())
            }
            None => Err(ControlError::NotRunning),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Terminator of the in-flight run, if any.
    pub fn current_terminator(&self) -> Option<Arc<Terminator>> {
        self.state.lock().terminator.clone()
    }

    /// Configuration echo plus a live metrics snapshot while running;
    /// otherwise the last terminal status and run time.
    pub fn status(&self) -> Value {
        let state = self.state.lock();
        if self.is_running() {
            let metrics = state.metrics.as_ref().map(|m| m.snapshot());
            return json!({
                "status": "running",
                "job_id": state.job_id,
                "config": state.config,
                "metrics": metrics,
            });
        }
        json!({
            "status": state.status.as_ref().unwrap_or(&RunStatus::Idle).label(),
            "job_id": state.job_id,
            "last_run_time": state.last_run_time,
        })
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

fn kind_json(kind: ParamKind) -> Value {
    match kind {
        ParamKind::I64 => json!({"kind": "integer"}),
        ParamKind::F64 => json!({"kind": "float"}),
        ParamKind::Bool => json!({"kind": "boolean"}),
        ParamKind::Str => json!({"kind": "string"}),
        ParamKind::Enum(variants) => json!({"kind": "enum", "variants": variants}),
    }
}

/// Dispatches one request to its handler and wraps the result in the
/// response envelope. Errors carry `isError: true` and a readable message.
pub fn handle(manager: &Arc<StressTestManager>, request: Request) -> Value {
    let result = dispatch(manager, &request);
    match result {
        Ok(value) => json!({"result": value, "isError": false}),
        Err(err) => json!({"error": err.to_string(), "isError": true}),
    }
}

fn dispatch(manager: &Arc<StressTestManager>, request: &Request) -> Result<Value, ControlError> {
    match request.tool.as_str() {
        "list_workloads" => {
            let workloads: Vec<Value> =
                workload::REGISTRY.iter().map(|def| json!({"name": def.name})).collect();
            Ok(json!({"workloads": workloads, "count": workloads.len()}))
        }
        "info" => {
            let name = request
                .params
                .get("workload")
                .and_then(Value::as_str)
                .ok_or_else(|| ControlError::BadRequest("missing workload".to_string()))?;
            let def = workload::get(name)?;
            let profile = def.instantiate();
            let parameters: Vec<Value> = profile
                .parameters()
                .iter()
                .map(|p| {
                    let mut entry = json!({"name": p.name, "description": p.description});
                    if let Value::Object(kind) = kind_json(p.kind)
                        && let Value::Object(target) = &mut entry
                    {
                        target.extend(kind);
                    }
                    entry
                })
                .collect();
            let gates: Vec<String> = def.gates.iter().map(|g| g.label()).collect();
            Ok(json!({
                "name": def.name,
                "class": def.class,
                "schema": profile.schema(),
                "defaultReadRate": profile.default_read_rate(),
                "parameters": parameters,
                "gates": gates,
            }))
        }
        "fields" => {
            let generators: Vec<Value> = GENERATORS
                .iter()
                .map(|g| json!({"name": g.name, "description": g.description}))
                .collect();
            Ok(json!({"generators": generators, "count": generators.len()}))
        }
        "run" => {
            let config: RunConfig = serde_json::from_value(request.params.clone())
                .map_err(|err| ControlError::BadRequest(err.to_string()))?;
            let job_id = manager.start_run(config)?;
            Ok(json!({"job_id": job_id}))
        }
        "status" => Ok(manager.status()),
        "stop" => {
            manager.stop()?;
            Ok(json!({"stopping": true}))
        }
        other => Err(ControlError::UnknownTool(other.to_string())),
    }
}

/// Binds the control listener and serves connections until the task is
/// dropped.
pub async fn serve(manager: Arc<StressTestManager>, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let local = listener.local_addr()?;
    tracing::info!(%local, "control server listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::debug!(%peer, "control connection open");
        tokio::spawn(serve_connection(Arc::clone(&manager), stream));
    }
}

async fn serve_connection(manager: Arc<StressTestManager>, stream: TcpStream) {
    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(write_half));

    let heartbeat = tokio::spawn({
        let writer = Arc::clone(&writer);
        async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let frame = json!({"heartbeat": unix_now()});
                if write_line(&writer, &frame).await.is_err() {
                    break;
                }
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle(&manager, request),
            Err(err) => json!({"error": format!("bad request: {err}"), "isError": true}),
        };
        if write_line(&writer, &response).await.is_err() {
            break;
        }
    }
    heartbeat.abort();
    tracing::debug!("control connection closed");
}

async fn write_line(
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    value: &Value,
) -> std::io::Result<()> {
    let mut bytes = serde_json::to_vec(value)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    bytes.push(b'\n');
    let mut writer = writer.lock().await;
    writer.write_all(&bytes).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemorySession;

    fn memory_manager() -> Arc<StressTestManager> {
        StressTestManager::new(Arc::new(|| {
            Ok(Arc::new(MemorySession::builder().build()) as Arc<dyn Session>)
        }))
    }

    // rate 500 keeps long-lived runs parked on the limiter instead of
    // spinning, while 10-op runs still finish within the first tick
    fn quick_config(iterations: u64) -> RunConfig {
        let mut config = RunConfig::builder()
            .workload("KeyValue")
            .rate(500)
            .threads(2)
            .partition_count(100)
            .queue_depth(8)
            .build();
        config.iterations = Some(iterations);
        config
    }

    async fn wait_for_terminal(manager: &Arc<StressTestManager>) -> String {
        for _ in 0..500 {
            let status = manager.status();
            let label = status["status"].as_str().unwrap_or_default().to_string();
            if label != "running" && label != "idle" {
                return label;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run never reached a terminal status");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_is_exclusive_until_finished() {
        let manager = memory_manager();
        let job = manager.start_run(quick_config(1_000_000_000)).unwrap();
        assert_eq!(job, "001");
        assert!(matches!(
            manager.start_run(quick_config(10)),
            Err(ControlError::Busy)
        ));

        manager.stop().unwrap();
        assert_eq!(wait_for_terminal(&manager).await, "stopped");
        assert!(!manager.is_running());
        assert!(matches!(manager.stop(), Err(ControlError::NotRunning)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn job_ids_are_zero_padded_and_monotonic() {
        let manager = memory_manager();
        assert_eq!(manager.start_run(quick_config(10)).unwrap(), "001");
        assert_eq!(wait_for_terminal(&manager).await, "completed");
        assert_eq!(manager.start_run(quick_config(10)).unwrap(), "002");
        assert_eq!(wait_for_terminal(&manager).await, "completed");
    }

    #[tokio::test]
    async fn status_starts_idle_and_persists_terminal_metadata() {
        let manager = memory_manager();
        let status = manager.status();
        assert_eq!(status["status"], "idle");
        assert!(status["last_run_time"].is_null());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn running_status_echoes_config_and_metrics() {
        let manager = memory_manager();
        manager.start_run(quick_config(1_000_000_000)).unwrap();
        let status = manager.status();
        assert_eq!(status["status"], "running");
        assert_eq!(status["config"]["workload"], "KeyValue");
        assert!(status["metrics"]["selects"]["count"].is_u64());
        manager.stop().unwrap();
        wait_for_terminal(&manager).await;
    }

    #[tokio::test]
    async fn unknown_tools_return_the_error_envelope() {
        let manager = memory_manager();
        let response =
            handle(&manager, Request { tool: "explode".to_string(), params: Value::Null });
        assert_eq!(response["isError"], true);
        assert!(response["error"].as_str().unwrap().contains("explode"));
    }

    #[tokio::test]
    async fn list_and_info_and_fields_report_the_registries() {
        let manager = memory_manager();

        let response =
            handle(&manager, Request { tool: "list_workloads".to_string(), params: Value::Null });
        assert_eq!(response["isError"], false);
        assert_eq!(response["result"]["count"], 3);

        let response = handle(
            &manager,
            Request { tool: "info".to_string(), params: json!({"workload": "KeyValue"}) },
        );
        assert_eq!(response["result"]["name"], "KeyValue");
        assert!(response["result"]["schema"][0].as_str().unwrap().contains("CREATE TABLE"));
        assert_eq!(response["result"]["defaultReadRate"], 0.5);

        let response =
            handle(&manager, Request { tool: "fields".to_string(), params: Value::Null });
        assert_eq!(response["result"]["count"], GENERATORS.len());
    }

    #[tokio::test]
    async fn bad_run_config_is_rejected_in_the_envelope() {
        let manager = memory_manager();
        let response = handle(
            &manager,
            Request {
                tool: "run".to_string(),
                params: json!({"workload": "NoSuchWorkload"}),
            },
        );
        assert_eq!(response["isError"], true);
        assert!(!manager.is_running());
    }
}
