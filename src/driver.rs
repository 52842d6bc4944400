//! The session seam.
//!
//! The engine talks to the cluster through [`Session`]: prepare once, bind
//! per operation, submit asynchronously, optionally page through results.
//! A real cluster driver plugs in behind this trait; [`MemorySession`] is
//! the in-process implementation used by tests and offline runs, with
//! configurable latency, failure injection and page synthesis.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use typed_builder::TypedBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsistencyLevel {
    Any,
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    LocalOne,
    Serial,
    LocalSerial,
}

impl std::str::FromStr for ConsistencyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ANY" => Ok(Self::Any),
            "ONE" => Ok(Self::One),
            "TWO" => Ok(Self::Two),
            "THREE" => Ok(Self::Three),
            "QUORUM" => Ok(Self::Quorum),
            "ALL" => Ok(Self::All),
            "LOCAL_QUORUM" => Ok(Self::LocalQuorum),
            "EACH_QUORUM" => Ok(Self::EachQuorum),
            "LOCAL_ONE" => Ok(Self::LocalOne),
            "SERIAL" => Ok(Self::Serial),
            "LOCAL_SERIAL" => Ok(Self::LocalSerial),
            other => Err(format!("unknown consistency level {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CqlValue {
    Text(String),
    BigInt(i64),
    Double(f64),
    Boolean(bool),
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("prepare failed: {0}")]
    Prepare(String),
    #[error("request timed out")]
    Timeout,
    #[error("coordinator overloaded")]
    Overloaded,
    #[error("server error: {0}")]
    Server(String),
}

impl DriverError {
    /// Exception-family name recorded in the raw event log.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Connect(_) => "ConnectError",
            Self::Prepare(_) => "PrepareError",
            Self::Timeout => "TimeoutError",
            Self::Overloaded => "OverloadedError",
            Self::Server(_) => "ServerError",
        }
    }
}

/// A statement prepared once against the session.
#[derive(Debug)]
pub struct Prepared {
    pub cql: String,
    id: u64,
}

impl Prepared {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Binds parameter values with driver defaults; callers layer
    /// consistency and paging on top.
    pub fn bind(self: &Arc<Self>, values: Vec<CqlValue>) -> Bound {
        Bound {
            prepared: Arc::clone(self),
            values,
            consistency: ConsistencyLevel::LocalQuorum,
            serial_consistency: None,
            page_size: None,
            coordinator_only: false,
        }
    }
}

/// A prepared statement with its parameters filled in for submission.
#[derive(Debug, Clone)]
pub struct Bound {
    pub prepared: Arc<Prepared>,
    pub values: Vec<CqlValue>,
    pub consistency: ConsistencyLevel,
    pub serial_consistency: Option<ConsistencyLevel>,
    pub page_size: Option<u32>,
    pub coordinator_only: bool,
}

impl Bound {
    pub fn with_consistency(
        mut self,
        cl: ConsistencyLevel,
        serial: Option<ConsistencyLevel>,
    ) -> Self {
        self.consistency = cl;
        self.serial_consistency = serial;
        self
    }

    pub fn with_page_size(mut self, page_size: Option<u32>) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn pinned_to_coordinator(mut self, pinned: bool) -> Self {
        self.coordinator_only = pinned;
        self
    }
}

/// Opaque cursor for fetching the next page of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingState(pub u64);

/// One page of results. The engine only needs cardinality and the cursor.
#[derive(Debug, Clone)]
pub struct ResultPage {
    pub rows: u64,
    pub more: Option<PagingState>,
}

#[async_trait]
pub trait Session: Send + Sync {
    async fn prepare(&self, cql: &str) -> Result<Arc<Prepared>, DriverError>;

    /// Submits a bound statement and resolves with the first result page.
    async fn execute(&self, bound: &Bound) -> Result<ResultPage, DriverError>;

    /// Fetches the page after `state` for a previously executed read.
    async fn fetch_more(&self, bound: &Bound, state: PagingState)
    -> Result<ResultPage, DriverError>;

    async fn close(&self);
}

/// Contact-point options. Username and password travel together or not at
/// all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 9042, username: None, password: None }
    }
}

/// Opens a session against the contact point. This is the boundary where a
/// real cluster driver is wired in; the current build hands back the
/// in-memory reference session.
pub async fn connect(options: &ConnectionOptions) -> Result<Arc<dyn Session>, DriverError> {
    tracing::info!(host = %options.host, port = options.port, "opening session");
    Ok(Arc::new(MemorySession::builder().build()))
}

/// In-memory [`Session`]: every statement succeeds after an optional
/// artificial latency, except where the fault plan says otherwise.
#[derive(TypedBuilder)]
pub struct MemorySession {
    /// Added to every operation before it completes.
    #[builder(default = Duration::ZERO)]
    pub latency: Duration,
    /// Fail every Nth submission (1-based) with an overload error.
    #[builder(default)]
    pub fail_every: Option<u64>,
    /// Make the Nth submission (1-based) take this long instead.
    #[builder(default)]
    pub slow_op: Option<(u64, Duration)>,
    /// Pages synthesized per read when the statement carries a page size.
    #[builder(default = 1)]
    pub pages_per_read: u32,
    /// Rows reported per page.
    #[builder(default = 10)]
    pub rows_per_page: u64,
    #[builder(default = AtomicU64::new(0), setter(skip))]
    submissions: AtomicU64,
    #[builder(default = AtomicU64::new(0), setter(skip))]
    prepared_ids: AtomicU64,
    #[builder(default = AtomicU64::new(0), setter(skip))]
    in_flight: AtomicU64,
    #[builder(default = AtomicU64::new(0), setter(skip))]
    peak_in_flight: AtomicU64,
}

impl MemorySession {
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }

    /// Highest number of concurrently outstanding submissions observed.
    pub fn peak_in_flight(&self) -> u64 {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    async fn simulate(&self, seq: u64) -> Result<(), DriverError> {
        let delay = match self.slow_op {
            Some((nth, slow)) if nth == seq => slow,
            _ => self.latency,
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(n) = self.fail_every
            && seq % n == 0
        {
            return Err(DriverError::Overloaded);
        }
        Ok(())
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn prepare(&self, cql: &str) -> Result<Arc<Prepared>, DriverError> {
        let id = self.prepared_ids.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(id, cql, "prepared statement");
        Ok(Arc::new(Prepared { cql: cql.to_string(), id }))
    }

    async fn execute(&self, bound: &Bound) -> Result<ResultPage, DriverError> {
        let seq = self.submissions.fetch_add(1, Ordering::Relaxed) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let outcome = self.simulate(seq).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome?;
        let more = (bound.page_size.is_some() && self.pages_per_read > 1)
            .then_some(PagingState(1));
        Ok(ResultPage { rows: self.rows_per_page, more })
    }

    async fn fetch_more(
        &self,
        _bound: &Bound,
        state: PagingState,
    ) -> Result<ResultPage, DriverError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let next = state.0 + 1;
        let more = (next < self.pages_per_read as u64).then_some(PagingState(next));
        Ok(ResultPage { rows: self.rows_per_page, more })
    }

    async fn close(&self) {
        tracing::debug!("memory session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_names_parse_case_insensitively() {
        assert_eq!("local_quorum".parse::<ConsistencyLevel>().unwrap(), ConsistencyLevel::LocalQuorum);
        assert_eq!("QUORUM".parse::<ConsistencyLevel>().unwrap(), ConsistencyLevel::Quorum);
        assert!("QUORUMS".parse::<ConsistencyLevel>().is_err());
    }

    #[tokio::test]
    async fn memory_session_counts_submissions_and_fails_on_schedule() {
        let session = MemorySession::builder().fail_every(Some(3)).build();
        let prepared = session.prepare("SELECT * FROM t WHERE key = ?").await.unwrap();
        let bound = prepared.bind(vec![CqlValue::Text("k1".into())]);

        let mut failures = 0;
        for _ in 0..9 {
            if session.execute(&bound).await.is_err() {
                failures += 1;
            }
        }
        assert_eq!(failures, 3);
        assert_eq!(session.submissions(), 9);
    }

    #[tokio::test]
    async fn paged_reads_walk_to_exhaustion() {
        let session = MemorySession::builder().pages_per_read(3).build();
        let prepared = session.prepare("SELECT * FROM t WHERE key = ?").await.unwrap();
        let bound = prepared.bind(vec![]).with_page_size(Some(100));

        let mut page = session.execute(&bound).await.unwrap();
        let mut pages = 1;
        while let Some(state) = page.more {
            page = session.fetch_more(&bound, state).await.unwrap();
            pages += 1;
        }
        assert_eq!(pages, 3);
    }

    #[tokio::test]
    async fn unpaged_reads_resolve_in_one_page() {
        let session = MemorySession::builder().pages_per_read(3).build();
        let prepared = session.prepare("SELECT * FROM t WHERE key = ?").await.unwrap();
        let bound = prepared.bind(vec![]);
        let page = session.execute(&bound).await.unwrap();
        assert!(page.more.is_none());
    }
}
