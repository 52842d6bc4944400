//! Collectors: sinks invoked on every operation completion.
//!
//! The chain runs on the completion path, so `record` must not block;
//! anything expensive hands off to its own thread. Metrics come first so
//! the bundle is current before exports see the sample.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use std::sync::Arc;

use crate::metrics::{MetricsBundle, OpKind};

/// Everything a collector learns about one completed operation. Times are
/// wall-clock nanoseconds since the epoch.
#[derive(Debug, Clone)]
pub struct OpSample {
    pub kind: OpKind,
    pub key: String,
    pub success: bool,
    pub error_class: Option<&'static str>,
    pub start_ns: u64,
    pub end_ns: u64,
    /// Index of the submitting worker; used to stripe histogram updates.
    pub worker: usize,
}

impl OpSample {
    pub fn latency_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }
}

pub trait Collector: Send + Sync {
    fn record(&self, sample: &OpSample);

    /// Called once after every worker has drained.
    fn flush(&self) {}
}

/// Forwards to an ordered list.
#[derive(Default)]
pub struct CompositeCollector {
    chain: Vec<Box<dyn Collector>>,
}

impl CompositeCollector {
    pub fn new(chain: Vec<Box<dyn Collector>>) -> Self {
        Self { chain }
    }

    pub fn push(&mut self, collector: Box<dyn Collector>) {
        self.chain.push(collector);
    }
}

impl Collector for CompositeCollector {
    fn record(&self, sample: &OpSample) {
        for collector in &self.chain {
            collector.record(sample);
        }
    }

    fn flush(&self) {
        for collector in &self.chain {
            collector.flush();
        }
    }
}

/// Feeds the metrics bundle: successful samples land in the kind's timer,
/// failures only bump the error meter.
pub struct MetricsCollector {
    bundle: Arc<MetricsBundle>,
}

impl MetricsCollector {
    pub fn new(bundle: Arc<MetricsBundle>) -> Self {
        Self { bundle }
    }
}

impl Collector for MetricsCollector {
    fn record(&self, sample: &OpSample) {
        if sample.success {
            self.bundle.timer(sample.kind).record_nanos(sample.latency_ns(), sample.worker);
        } else {
            self.bundle.errors.mark();
        }
    }
}

/// Raw event log: one row per completed operation, streamed to a dedicated
/// writer thread so file I/O never touches the completion path.
pub struct RawLogCollector {
    tx: Mutex<Option<mpsc::Sender<OpSample>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    path: PathBuf,
}

/// A directory target gets the default file name; an existing file is
/// overwritten.
pub fn resolve_rawlog_path(target: &Path) -> PathBuf {
    if target.is_dir() { target.join("rawlog.csv") } else { target.to_path_buf() }
}

impl RawLogCollector {
    pub fn create(target: &Path) -> std::io::Result<Self> {
        let path = resolve_rawlog_path(target);
        let file = File::create(&path)?;
        let (tx, rx) = mpsc::channel::<OpSample>();
        let writer = std::thread::spawn(move || write_rows(file, rx));
        tracing::info!(path = %path.display(), "raw event log open");
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_rows(file: File, rx: mpsc::Receiver<OpSample>) {
    let mut out = BufWriter::new(file);
    let _ = writeln!(out, "start_ns,end_ns,latency_ns,op,success,error_class,partition_key");
    for sample in rx {
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{}",
            sample.start_ns,
            sample.end_ns,
            sample.latency_ns(),
            sample.kind.name(),
            sample.success,
            sample.error_class.unwrap_or(""),
            sample.key,
        );
    }
    if let Err(err) = out.flush() {
        tracing::warn!(%err, "raw event log flush failed");
    }
}

impl Collector for RawLogCollector {
    fn record(&self, sample: &OpSample) {
        if let Some(tx) = self.tx.lock().as_ref() {
            // the writer thread hanging up just means the log is closed
            let _ = tx.send(sample.clone());
        }
    }

    fn flush(&self) {
        // closing the channel lets the writer drain and exit
        self.tx.lock().take();
        if let Some(handle) = self.writer.lock().take()
            && handle.join().is_err()
        {
            tracing::warn!("raw event log writer panicked");
        }
    }
}
