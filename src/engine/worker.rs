//! The per-worker dispatch loop and the async completion path.
//!
//! Each worker owns a runner and an in-flight window. The loop polls
//! cancellation, pulls a key, picks an operation kind, waits for a rate
//! token and an in-flight permit, then submits asynchronously; a spawned
//! completion task classifies the outcome, fans out to the collector
//! chain, checks the latency SLO, and releases the window slot by dropping
//! its permit. A failed operation never terminates the worker.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::driver::{Bound, DriverError};
use crate::collector::{Collector, OpSample};
use crate::engine::StressContext;
use crate::engine::runner::{Operation, StressRunner};
use crate::engine::termination::StopReason;
use crate::keys::{KeyStream, PartitionKey};
use crate::metrics::OpKind;

/// Fractions for the operation-kind draw; mutation takes the remainder.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpMix {
    pub read: f64,
    pub delete: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Phase {
    Measured,
    Populate { deletes: bool },
}

pub(crate) struct WorkerPlan {
    pub index: usize,
    /// This worker's slice of the operation count; `None` when the run is
    /// duration-bound.
    pub share: Option<u64>,
    pub keys: Arc<KeyStream>,
    pub mix: OpMix,
    pub phase: Phase,
}

/// Runs one worker to completion and returns how many operations it
/// submitted.
pub(crate) async fn run_worker(
    ctx: Arc<StressContext>,
    mut runner: Box<dyn StressRunner>,
    plan: WorkerPlan,
) -> u64 {
    let queue_depth = ctx.config.queue_depth as u32;
    let inflight = Arc::new(Semaphore::new(queue_depth as usize));
    let mut rng = SmallRng::from_rng(&mut rand::rng());
    let mut produced: u64 = 0;
    tracing::debug!(worker = plan.index, "worker started");

    loop {
        if ctx.terminator.is_cancelled() {
            break;
        }
        if plan.share.is_some_and(|share| produced >= share) {
            break;
        }
        let Some(key) = plan.keys.next() else {
            ctx.terminator.signal(StopReason::Exhausted);
            break;
        };
        let operation = next_operation(runner.as_mut(), &plan, &mut rng, &key);
        let (Some(kind), Some(bound)) = (sample_kind(plan.phase, &operation), operation.bound().cloned())
        else {
            ctx.terminator.signal(StopReason::Exhausted);
            break;
        };

        ctx.limiter.acquire().await;
        if ctx.terminator.is_cancelled() {
            break;
        }
        let Ok(permit) = Arc::clone(&inflight).acquire_owned().await else {
            break;
        };
        if ctx.terminator.is_cancelled() {
            break;
        }

        produced += 1;
        let started = Instant::now();
        let start_ns = epoch_nanos();
        let key_text = key.text();
        let paginate = ctx.config.paginate && kind == OpKind::Select;
        let measured = plan.phase == Phase::Measured;
        let worker = plan.index;
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let _slot = permit;
            let outcome = execute(&ctx, &bound, paginate).await;
            complete(&ctx, kind, key_text, worker, measured, started, start_ns, outcome);
        });
    }

    // let outstanding async work finish before reporting drained
    let _drained = Arc::clone(&inflight).acquire_many_owned(queue_depth).await;
    tracing::debug!(worker = plan.index, produced, "worker drained");
    produced
}

fn next_operation(
    runner: &mut dyn StressRunner,
    plan: &WorkerPlan,
    rng: &mut SmallRng,
    key: &PartitionKey,
) -> Operation {
    match plan.phase {
        Phase::Populate { deletes } => {
            if deletes && rng.random::<f64>() < plan.mix.delete {
                runner.next_delete(key)
            } else {
                runner.next_populate(key)
            }
        }
        Phase::Measured => {
            let u: f64 = rng.random();
            if u < plan.mix.read {
                runner.next_select(key)
            } else if u < plan.mix.read + plan.mix.delete {
                runner.next_delete(key)
            } else {
                runner.next_mutation(key)
            }
        }
    }
}

/// Timer kind for the sample: populate-phase operations land in the
/// populate timer whatever their variant; `Stop` has no kind.
fn sample_kind(phase: Phase, operation: &Operation) -> Option<OpKind> {
    match phase {
        Phase::Populate { .. } => operation.kind().map(|_| OpKind::Populate),
        Phase::Measured => operation.kind(),
    }
}

/// Submits the statement; for paginated reads the page walk stays inside
/// the timed span.
async fn execute(ctx: &StressContext, bound: &Bound, paginate: bool) -> Result<(), DriverError> {
    let mut page = ctx.session.execute(bound).await?;
    if paginate {
        while let Some(state) = page.more {
            page = ctx.session.fetch_more(bound, state).await?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn complete(
    ctx: &StressContext,
    kind: OpKind,
    key: String,
    worker: usize,
    measured: bool,
    started: Instant,
    start_ns: u64,
    outcome: Result<(), DriverError>,
) {
    let latency_ns = started.elapsed().as_nanos() as u64;
    let (success, error_class) = match &outcome {
        Ok(()) => (true, None),
        Err(err) => {
            tracing::debug!(worker, %err, "operation failed");
            (false, Some(err.class()))
        }
    };
    let sample = OpSample {
        kind,
        key,
        success,
        error_class,
        start_ns,
        end_ns: start_ns.saturating_add(latency_ns),
        worker,
    };
    ctx.collectors.record(&sample);

    if success
        && measured
        && let Some(max_ms) = slo_ceiling(ctx, kind)
    {
        let latency_ms = latency_ns / 1_000_000;
        if latency_ms > max_ms {
            ctx.terminator.signal(StopReason::SloBreach { kind, latency_ms });
        }
    }
}

fn slo_ceiling(ctx: &StressContext, kind: OpKind) -> Option<u64> {
    match kind {
        OpKind::Select => ctx.config.max_read_latency_ms,
        OpKind::Mutation => ctx.config.max_write_latency_ms,
        OpKind::Delete | OpKind::Populate => None,
    }
}

fn epoch_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ConsistencyLevel, MemorySession};
    use crate::engine::runner::StatementOptions;
    use crate::fields::FieldMap;
    use crate::keys::KeyDistribution;
    use crate::workload;

    async fn key_value_runner() -> Box<dyn StressRunner> {
        let session = MemorySession::builder().build();
        let mut workload = workload::get("KeyValue").unwrap().instantiate();
        workload.prepare(&session).await.unwrap();
        let fields = FieldMap::from_defaults(workload.field_defaults());
        let options = StatementOptions {
            consistency: ConsistencyLevel::LocalQuorum,
            serial_consistency: None,
            page_size: None,
            paginate: false,
            coordinator_only: false,
        };
        workload.runner(options, &fields).unwrap()
    }

    #[tokio::test]
    async fn pure_read_mix_only_selects() {
        let mut runner = key_value_runner().await;
        let keys = Arc::new(KeyStream::new(KeyDistribution::Random, "k", 99, None));
        let plan = WorkerPlan {
            index: 0,
            share: None,
            keys: Arc::clone(&keys),
            mix: OpMix { read: 1.0, delete: 0.0 },
            phase: Phase::Measured,
        };
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..200 {
            let key = keys.next().unwrap();
            let operation = next_operation(runner.as_mut(), &plan, &mut rng, &key);
            assert_eq!(sample_kind(plan.phase, &operation), Some(OpKind::Select));
        }
    }

    #[tokio::test]
    async fn populate_phase_always_records_as_populate() {
        let mut runner = key_value_runner().await;
        let keys = Arc::new(KeyStream::new(KeyDistribution::Sequence, "k", 99, None));
        let plan = WorkerPlan {
            index: 0,
            share: None,
            keys: Arc::clone(&keys),
            mix: OpMix { read: 0.0, delete: 0.5 },
            phase: Phase::Populate { deletes: true },
        };
        let mut rng = SmallRng::seed_from_u64(7);
        let mut deletes_drawn = 0;
        for _ in 0..200 {
            let key = keys.next().unwrap();
            let operation = next_operation(runner.as_mut(), &plan, &mut rng, &key);
            if matches!(operation, Operation::Delete { .. }) {
                deletes_drawn += 1;
            }
            assert_eq!(sample_kind(plan.phase, &operation), Some(OpKind::Populate));
        }
        // deletes are interleaved at the configured rate yet still land in
        // the populate timer
        assert!(deletes_drawn > 0);
    }

    #[tokio::test]
    async fn mix_draw_covers_all_three_kinds() {
        let mut runner = key_value_runner().await;
        let keys = Arc::new(KeyStream::new(KeyDistribution::Random, "k", 99, None));
        let plan = WorkerPlan {
            index: 0,
            share: None,
            keys: Arc::clone(&keys),
            mix: OpMix { read: 0.4, delete: 0.2 },
            phase: Phase::Measured,
        };
        let mut rng = SmallRng::seed_from_u64(11);
        let mut counts = [0u32; 3];
        for _ in 0..3_000 {
            let key = keys.next().unwrap();
            let operation = next_operation(runner.as_mut(), &plan, &mut rng, &key);
            match sample_kind(plan.phase, &operation) {
                Some(OpKind::Select) => counts[0] += 1,
                Some(OpKind::Delete) => counts[1] += 1,
                Some(OpKind::Mutation) => counts[2] += 1,
                other => panic!("unexpected kind {other:?} in measured phase"),
            }
        }
        // loose bounds; 3000 draws keep each fraction well inside them
        assert!((900..=1_500).contains(&counts[0]), "selects {counts:?}");
        assert!((350..=900).contains(&counts[1]), "deletes {counts:?}");
        assert!((900..=1_600).contains(&counts[2]), "mutations {counts:?}");
    }
}
