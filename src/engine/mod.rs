//! The stress execution engine.
//!
//! The controller builds one [`StressContext`] per run (session, rate
//! limiter, metrics, collector chain, termination coordinator), optionally
//! runs the populate phase, resets metrics, launches the measured phase
//! across `threads` workers, and tears everything down on every exit path:
//! collectors are flushed and the session closed only after all workers
//! have joined and the coordinator reports Stopped.

pub mod rate;
pub mod runner;
pub mod termination;
pub(crate) mod worker;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::time::Instant;

use crate::collector::{Collector, CompositeCollector, MetricsCollector, RawLogCollector};
use crate::config::{ConfigError, PopulateOpt, RunConfig, TerminalBound};
use crate::driver::{DriverError, Session};
use crate::fields::FieldMap;
use crate::keys::{KeyDistribution, KeyStream};
use crate::metrics::{MetricsBundle, MetricsSnapshot};
use crate::workload::{self, PopulatePolicy, StressWorkload};
use self::rate::{DEFAULT_TICK, RateLimiter};
use self::runner::StatementOptions;
use self::termination::{StopReason, Terminator};
use self::worker::{OpMix, Phase, WorkerPlan, run_worker};

#[derive(Debug, Error)]
pub enum StressError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("raw event log: {0}")]
    RawLog(#[from] std::io::Error),
}

/// Shared run state. Built once per run and borrowed by every worker for
/// its lifetime.
pub struct StressContext {
    pub config: RunConfig,
    pub session: Arc<dyn Session>,
    pub metrics: Arc<MetricsBundle>,
    pub limiter: RateLimiter,
    pub collectors: CompositeCollector,
    pub terminator: Arc<Terminator>,
}

/// What the controller hands back when the run is over.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub reason: Option<StopReason>,
    pub elapsed: Duration,
    pub metrics: MetricsSnapshot,
}

impl RunOutcome {
    pub fn failed(&self) -> bool {
        self.reason.is_some_and(|reason| reason.is_failure())
    }
}

/// Runs a workload to completion: populate phase (if requested), measured
/// phase, teardown. The terminator and metrics bundle are shared so an
/// external controller can stop the run, await Stopped, and read live
/// snapshots while it is in flight.
pub async fn run_stress(
    config: RunConfig,
    session: Arc<dyn Session>,
    metrics: Arc<MetricsBundle>,
    extra_collectors: Vec<Box<dyn Collector>>,
    terminator: Arc<Terminator>,
) -> Result<RunOutcome, StressError> {
    config.validate()?;
    let bound = config.terminal_bound()?;

    let definition = workload::get(&config.workload)?;
    let mut profile = definition.instantiate();
    workload::bind_parameters(profile.as_mut(), &config)?;

    let mut fields = FieldMap::from_defaults(profile.field_defaults());
    fields.apply_overrides(&config.fields)?;

    profile.prepare(session.as_ref()).await?;

    let mut chain: Vec<Box<dyn Collector>> =
        vec![Box::new(MetricsCollector::new(Arc::clone(&metrics)))];
    if let Some(target) = &config.rawlog {
        chain.push(Box::new(RawLogCollector::create(target)?));
    }
    chain.extend(extra_collectors);

    let mix = OpMix {
        read: config.effective_read_rate(profile.default_read_rate()),
        delete: config.delete_rate,
    };
    let options = StatementOptions {
        consistency: config.consistency_level,
        serial_consistency: config.serial_consistency_level,
        page_size: config.paging,
        paginate: config.paginate,
        coordinator_only: config.coordinator_only,
    };

    let ctx = Arc::new(StressContext {
        limiter: RateLimiter::start(config.rate, DEFAULT_TICK),
        session: Arc::clone(&session),
        metrics: Arc::clone(&metrics),
        collectors: CompositeCollector::new(chain),
        terminator: Arc::clone(&terminator),
        config,
    });
    let max_id = ctx.config.partition_count - 1;

    if let Some((rows, deletes)) = populate_shape(&ctx.config, profile.as_ref())
        && !terminator.is_cancelled()
    {
        tracing::info!(rows, workload = %ctx.config.workload, "populate phase starting");
        let keys = Arc::new(KeyStream::new(
            KeyDistribution::Sequence,
            &ctx.config.key_prefix,
            max_id,
            Some(rows),
        ));
        run_phase(&ctx, profile.as_ref(), options, &fields, keys, Phase::Populate { deletes }, Some(rows), mix)
            .await?;
        ctx.metrics.reset();
        tracing::info!("populate phase complete, metrics reset");
    }

    let started = Instant::now();
    let (total, wall) = match bound {
        TerminalBound::Count(n) => (Some(n), None),
        TerminalBound::Wall(d) => (None, Some(d)),
    };
    let duration_timer = wall.map(|wall| {
        let terminator = Arc::clone(&terminator);
        tokio::spawn(async move {
            tokio::time::sleep(wall).await;
            terminator.signal(StopReason::DurationElapsed);
        })
    });

    if !terminator.is_cancelled() {
        tracing::info!(
            workload = %ctx.config.workload,
            threads = ctx.config.threads,
            rate = ctx.config.rate,
            "measured phase starting"
        );
        let keys = Arc::new(KeyStream::new(
            ctx.config.key_generator,
            &ctx.config.key_prefix,
            max_id,
            total,
        ));
        run_phase(&ctx, profile.as_ref(), options, &fields, keys, Phase::Measured, total, mix)
            .await?;
    }
    if let Some(timer) = duration_timer {
        timer.abort();
    }

    ctx.limiter.shutdown();
    if terminator.reason().is_none() {
        terminator.signal(StopReason::CountReached);
    }
    ctx.collectors.flush();
    terminator.mark_stopped();
    let outcome = RunOutcome {
        reason: terminator.reason(),
        elapsed: started.elapsed(),
        metrics: ctx.metrics.snapshot(),
    };
    session.close().await;
    tracing::info!(elapsed = ?outcome.elapsed, total = outcome.metrics.total_ops(), "run finished");
    Ok(outcome)
}

/// Spawns the phase's workers and joins them all. A panicked worker is
/// logged and absorbed so the rest of the run can drain cleanly.
#[allow(clippy::too_many_arguments)]
async fn run_phase(
    ctx: &Arc<StressContext>,
    profile: &dyn StressWorkload,
    options: StatementOptions,
    fields: &FieldMap,
    keys: Arc<KeyStream>,
    phase: Phase,
    total: Option<u64>,
    mix: OpMix,
) -> Result<u64, StressError> {
    let threads = ctx.config.threads;
    let shares: Vec<Option<u64>> = match total {
        Some(total) => split_shares(total, threads).into_iter().map(Some).collect(),
        None => vec![None; threads],
    };

    let mut handles = Vec::with_capacity(threads);
    for (index, share) in shares.into_iter().enumerate() {
        let runner = profile.runner(options, fields)?;
        let plan = WorkerPlan { index, share, keys: Arc::clone(&keys), mix, phase };
        handles.push(tokio::spawn(run_worker(Arc::clone(ctx), runner, plan)));
    }

    let mut produced = 0;
    for joined in join_all(handles).await {
        match joined {
            Ok(count) => produced += count,
            Err(err) => tracing::error!(%err, "worker panicked; absorbing and draining the rest"),
        }
    }
    Ok(produced)
}

/// Splits the operation count evenly; the remainder goes to the
/// lowest-indexed workers.
fn split_shares(total: u64, threads: usize) -> Vec<u64> {
    let threads_u64 = threads as u64;
    let base = total / threads_u64;
    let remainder = total % threads_u64;
    (0..threads_u64).map(|i| base + u64::from(i < remainder)).collect()
}

/// Resolves the populate option against the profile's policy into
/// `(rows, deletes_during_populate)`.
fn populate_shape(config: &RunConfig, profile: &dyn StressWorkload) -> Option<(u64, bool)> {
    let policy = profile.populate_policy(config.partition_count);
    match config.populate {
        PopulateOpt::None => None,
        PopulateOpt::Standard => match policy {
            PopulatePolicy::Standard => Some((config.partition_count, false)),
            PopulatePolicy::Custom { rows, deletes_during_populate } => {
                (rows > 0).then_some((rows, deletes_during_populate))
            }
        },
        PopulateOpt::Custom { rows } => {
            let deletes = matches!(
                policy,
                PopulatePolicy::Custom { deletes_during_populate: true, .. }
            );
            (rows > 0).then_some((rows, deletes))
        }
    }
}
