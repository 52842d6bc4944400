//! CLI entry point: subcommand dispatch, dynamic `--workload.<name>`
//! parameter extraction, tracing init, and exit codes (non-zero on
//! configuration or startup failure).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cqlstress::compaction::CompactionOptions;
use cqlstress::config::{PopulateOpt, RunConfig, parse_duration_secs, parse_iterations};
use cqlstress::driver::{self, ConnectionOptions, ConsistencyLevel, MemorySession, Session};
use cqlstress::engine::termination::{StopReason, Terminator};
use cqlstress::engine::run_stress;
use cqlstress::fields::GENERATORS;
use cqlstress::keys::KeyDistribution;
use cqlstress::metrics::MetricsBundle;
use cqlstress::server::{self, StressTestManager};
use cqlstress::workload;

#[derive(Parser)]
#[command(name = "cqlstress", version, about = "Workload-centric stress tool for wide-column clusters")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a workload against the cluster
    Run(RunArgs),
    /// Show a workload's schema, parameters and defaults
    Info { workload: String },
    /// List available workloads
    List,
    /// List available field-value generators
    Fields,
    /// Serve the remote-control surface
    Server {
        #[arg(short, long, default_value_t = 9142)]
        port: u16,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Workload profile name (see `list`)
    workload: String,

    /// Contact point
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(long = "cql-port", default_value_t = 9042)]
    cql_port: u16,
    #[arg(short = 'U', long)]
    username: Option<String>,
    #[arg(short = 'P', long)]
    password: Option<String>,

    /// Wall-clock bound, e.g. `1h30m`, `45s`, `1d2h3m`
    #[arg(short = 'd', long, conflicts_with = "iterations")]
    duration: Option<String>,
    /// Operation-count bound; `k`/`m`/`b` suffixes accepted
    #[arg(short = 'i', long)]
    iterations: Option<String>,
    /// Worker count
    #[arg(short = 't', long, default_value_t = num_cpus::get())]
    threads: usize,
    /// Ops/second cap; 0 runs flat-out
    #[arg(short = 'r', long, default_value_t = 5_000)]
    rate: u64,
    /// Key-space size
    #[arg(short = 'p', long = "partitions", default_value_t = 1_000_000)]
    partitions: u64,
    /// Key distribution: random, sequence, or normal
    #[arg(long = "partition-key-generator", default_value = "random")]
    partition_key_generator: String,

    /// Fraction of reads in [0,1]; profile default when omitted
    #[arg(long = "read-rate")]
    read_rate: Option<f64>,
    #[arg(long = "delete-rate", default_value_t = 0.0)]
    delete_rate: f64,
    /// Per-thread in-flight cap
    #[arg(long = "queue-depth", default_value_t = 128)]
    queue_depth: usize,
    /// Rows to populate before measuring, or `standard`/`none`
    #[arg(long)]
    populate: Option<String>,

    /// `<table>.<column>=<fn>(args)` generator override; repeatable
    #[arg(long = "field")]
    field: Vec<String>,

    #[arg(long = "cl", default_value = "LOCAL_QUORUM")]
    cl: String,
    #[arg(long = "serial-cl")]
    serial_cl: Option<String>,

    /// Latency SLOs in milliseconds; a breach ends the run as failed
    #[arg(long = "max-read-latency")]
    max_read_latency: Option<u64>,
    #[arg(long = "max-write-latency")]
    max_write_latency: Option<u64>,

    /// Driver page size
    #[arg(long)]
    paging: Option<u32>,
    /// Walk every page of read results inside the timed span
    #[arg(long)]
    paginate: bool,
    /// Pin all requests to the contact point
    #[arg(long = "coordinator-only")]
    coordinator_only: bool,

    /// Schema-builder options, validated here and passed through
    #[arg(long)]
    ttl: Option<u64>,
    #[arg(long)]
    compaction: Option<String>,
    #[arg(long)]
    compression: Option<String>,
    #[arg(long)]
    replication: Option<String>,

    /// 0 disables the exporter
    #[arg(long = "prometheus-port", default_value_t = 0)]
    prometheus_port: u16,
    /// Raw event log target: a file, or a directory for `rawlog.csv`
    #[arg(long)]
    rawlog: Option<PathBuf>,

    /// Print the final summary as JSON
    #[arg(long)]
    json: bool,
}

/// Pulls `--workload.<name>=<value>` tokens out of argv before clap sees
/// them; clap cannot declare dynamically named flags.
fn split_dynamic_args(
    argv: impl Iterator<Item = String>,
) -> anyhow::Result<(Vec<String>, BTreeMap<String, String>)> {
    let mut passthrough = Vec::new();
    let mut params = BTreeMap::new();
    for arg in argv {
        match arg.strip_prefix("--workload.") {
            Some(rest) => match rest.split_once('=') {
                Some((name, value)) if !name.is_empty() => {
                    params.insert(name.to_string(), value.to_string());
                }
                _ => bail!("bad workload parameter {arg:?}: expected --workload.<name>=<value>"),
            },
            None => passthrough.push(arg),
        }
    }
    Ok((passthrough, params))
}

fn build_run_config(
    args: &RunArgs,
    workload_parameters: BTreeMap<String, String>,
) -> anyhow::Result<RunConfig> {
    let iterations = args.iterations.as_deref().map(parse_iterations).transpose()?;
    let duration_secs = args.duration.as_deref().map(parse_duration_secs).transpose()?;
    let key_generator: KeyDistribution =
        args.partition_key_generator.parse().map_err(|err: String| anyhow::anyhow!(err))?;
    let consistency_level: ConsistencyLevel =
        args.cl.parse().map_err(|err: String| anyhow::anyhow!(err))?;
    let serial_consistency_level = args
        .serial_cl
        .as_deref()
        .map(|cl| cl.parse::<ConsistencyLevel>())
        .transpose()
        .map_err(|err: String| anyhow::anyhow!(err))?;
    let populate = match args.populate.as_deref() {
        Some(raw) => PopulateOpt::parse(raw)?,
        None => PopulateOpt::None,
    };
    let compaction = args
        .compaction
        .as_deref()
        .map(|raw| CompactionOptions::parse(raw).map(|options| options.to_cql()))
        .transpose()?;

    let mut fields = BTreeMap::new();
    for entry in &args.field {
        let (target, call) = entry
            .split_once('=')
            .with_context(|| format!("bad field override {entry:?}: expected <t>.<c>=<fn>(args)"))?;
        fields.insert(target.to_string(), call.to_string());
    }

    let mut config = RunConfig::builder()
        .workload(args.workload.clone())
        .rate(args.rate)
        .threads(args.threads)
        .partition_count(args.partitions)
        .key_generator(key_generator)
        .delete_rate(args.delete_rate)
        .queue_depth(args.queue_depth)
        .populate(populate)
        .consistency_level(consistency_level)
        .paginate(args.paginate)
        .coordinator_only(args.coordinator_only)
        .prometheus_port(args.prometheus_port)
        .build();
    config.iterations = iterations;
    config.duration_secs = duration_secs;
    config.read_rate = args.read_rate;
    config.serial_consistency_level = serial_consistency_level;
    config.max_read_latency_ms = args.max_read_latency;
    config.max_write_latency_ms = args.max_write_latency;
    config.paging = args.paging;
    config.ttl = args.ttl;
    config.compaction = compaction;
    config.compression = args.compression.clone();
    config.replication = args.replication.clone();
    config.fields = fields;
    config.workload_parameters = workload_parameters;
    config.rawlog = args.rawlog.clone();
    config.validate()?;
    Ok(config)
}

async fn run(args: &RunArgs, params: BTreeMap<String, String>) -> anyhow::Result<()> {
    let config = build_run_config(args, params)?;
    let connection = ConnectionOptions {
        host: args.host.clone(),
        port: args.cql_port,
        username: args.username.clone(),
        password: args.password.clone(),
    };
    let session = driver::connect(&connection).await.context("session connect failed")?;

    let terminator = Arc::new(Terminator::new());
    let metrics = Arc::new(MetricsBundle::new());
    tokio::spawn({
        let terminator = Arc::clone(&terminator);
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                terminator.signal(StopReason::ExternalStop);
            }
        }
    });

    let outcome = run_stress(config, session, metrics, Vec::new(), terminator).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome.metrics)?);
    } else {
        println!("{}", outcome.metrics);
        println!(
            "elapsed {:.1?}, {} total ops",
            outcome.elapsed,
            outcome.metrics.total_ops()
        );
    }
    if let Some(reason) = outcome.reason {
        if reason.is_failure() {
            bail!("failed: {}", reason.describe());
        }
        println!("finished: {}", reason.describe());
    }
    Ok(())
}

fn info(workload: &str) -> anyhow::Result<()> {
    let def = workload::get(workload)?;
    let profile = def.instantiate();
    println!("{} ({})", def.name, def.class);
    println!("  {}", def.description);
    for gate in def.gates {
        println!("  gate: {}", gate.label());
    }
    println!("  default read rate: {}", profile.default_read_rate());
    println!("  schema:");
    for ddl in profile.schema() {
        println!("    {ddl};");
    }
    if !profile.parameters().is_empty() {
        println!("  parameters (set with --workload.<name>=<value>):");
        for parameter in profile.parameters() {
            println!("    {:<12} {}", parameter.name, parameter.description);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (argv, workload_parameters) = split_dynamic_args(std::env::args())?;
    let cli = Cli::parse_from(argv);

    match cli.command {
        Command::Run(args) => run(&args, workload_parameters).await,
        Command::Info { workload } => info(&workload),
        Command::List => {
            for def in workload::REGISTRY {
                println!("{:<24} {}", def.name, def.description);
            }
            Ok(())
        }
        Command::Fields => {
            for generator in GENERATORS {
                println!("{:<10} {}", generator.name, generator.description);
            }
            Ok(())
        }
        Command::Server { port } => {
            let manager = StressTestManager::new(Arc::new(|| {
                Ok(Arc::new(MemorySession::builder().build()) as Arc<dyn Session>)
            }));
            server::serve(manager, port).await.context("control server failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> std::vec::IntoIter<String> {
        parts.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn dynamic_workload_params_are_extracted() {
        let (passthrough, params) = split_dynamic_args(argv(&[
            "cqlstress",
            "run",
            "KeyValue",
            "--workload.limit=200",
            "--rate",
            "100",
            "--workload.access=partition",
        ]))
        .unwrap();
        assert_eq!(passthrough, vec!["cqlstress", "run", "KeyValue", "--rate", "100"]);
        assert_eq!(params.get("limit").unwrap(), "200");
        assert_eq!(params.get("access").unwrap(), "partition");
    }

    #[test]
    fn dynamic_params_require_a_value() {
        assert!(split_dynamic_args(argv(&["cqlstress", "--workload.limit"])).is_err());
    }

    #[test]
    fn run_config_resolves_suffixes_and_grammars() {
        let cli = Cli::parse_from([
            "cqlstress",
            "run",
            "KeyValue",
            "-i",
            "500k",
            "-r",
            "10000",
            "-t",
            "4",
            "-p",
            "5000",
            "--read-rate",
            "0.5",
            "--compaction",
            "stcs,4,32",
        ]);
        let Command::Run(args) = cli.command else { panic!("expected run") };
        let config = build_run_config(&args, BTreeMap::new()).unwrap();
        assert_eq!(config.iterations, Some(500_000));
        assert_eq!(config.rate, 10_000);
        assert_eq!(config.partition_count, 5_000);
        assert!(config.compaction.unwrap().contains("SizeTieredCompactionStrategy"));
    }

    #[test]
    fn conflicting_bounds_are_rejected() {
        // clap already refuses -i with -d
        assert!(
            Cli::try_parse_from(["cqlstress", "run", "KeyValue", "-i", "10", "-d", "10s"])
                .is_err()
        );
    }

    #[test]
    fn bad_duration_is_a_config_error() {
        let cli = Cli::parse_from(["cqlstress", "run", "KeyValue", "-d", "BLAh"]);
        let Command::Run(args) = cli.command else { panic!("expected run") };
        assert!(build_run_config(&args, BTreeMap::new()).is_err());
    }
}
