//! Resolved run configuration and the small parsers the CLI and control
//! surface share: the duration grammar, iteration-count suffixes, and the
//! populate option.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::driver::ConsistencyLevel;
use crate::keys::KeyDistribution;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown workload {0:?}")]
    UnknownWorkload(String),
    #[error("unknown workload parameter {0:?}")]
    UnknownParameter(String),
    #[error("invalid value {value:?} for parameter {name:?}: {reason}")]
    InvalidParameter { name: String, value: String, reason: String },
    #[error("invalid duration {input:?}: {reason}")]
    InvalidDuration { input: String, reason: String },
    #[error("invalid iteration count {0:?}")]
    InvalidIterations(String),
    #[error("both iterations and duration supplied; exactly one may bound the run")]
    AmbiguousBound,
    #[error("read rate {read} + delete rate {delete} must stay within [0, 1]")]
    RateOutOfRange { read: f64, delete: f64 },
    #[error("{0} must be at least 1")]
    ZeroSized(&'static str),
    #[error("invalid field override {input:?}: {reason}")]
    InvalidFieldOverride { input: String, reason: String },
    #[error("unknown field generator {0:?}")]
    UnknownFieldGenerator(String),
    #[error("invalid populate option {0:?}")]
    InvalidPopulate(String),
    #[error("unknown consistency level {0:?}")]
    UnknownConsistency(String),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

/// What ends the measured phase. Exactly one bound is authoritative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TerminalBound {
    Count(u64),
    Wall(Duration),
}

/// Populate behaviour requested for the run.
///
/// `Standard` loads every partition once through the profile's mutation;
/// `Custom` pins the row count and may interleave deletes when the profile
/// allows them during populate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopulateOpt {
    None,
    Standard,
    Custom { rows: u64 },
}

impl PopulateOpt {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "none" => Ok(Self::None),
            "standard" => Ok(Self::Standard),
            other => parse_iterations(other)
                .map(|rows| Self::Custom { rows })
                .map_err(|_| ConfigError::InvalidPopulate(other.to_string())),
        }
    }
}

/// Fully resolved options handed to the engine. The control surface echoes
/// this verbatim in `status`, so it round-trips through JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase", default)]
#[builder(field_defaults(default))]
pub struct RunConfig {
    #[builder(!default, setter(into))]
    pub workload: String,
    pub iterations: Option<u64>,
    pub duration_secs: Option<u64>,
    /// Ops/second token-bucket capacity. 0 disables the limiter.
    #[builder(default = 5_000)]
    pub rate: u64,
    #[builder(default = num_cpus::get())]
    pub threads: usize,
    /// Key-space size: ids are drawn from `[0, partition_count)`.
    #[builder(default = 1_000_000)]
    pub partition_count: u64,
    #[builder(default = KeyDistribution::Random)]
    pub key_generator: KeyDistribution,
    #[builder(default = String::from("key"), setter(into))]
    pub key_prefix: String,
    /// Fraction of ops that are reads; profile default when absent.
    pub read_rate: Option<f64>,
    #[builder(default = 0.0)]
    pub delete_rate: f64,
    /// Per-thread in-flight cap.
    #[builder(default = 128)]
    pub queue_depth: usize,
    #[builder(default = PopulateOpt::None)]
    pub populate: PopulateOpt,
    #[builder(default = ConsistencyLevel::LocalQuorum)]
    pub consistency_level: ConsistencyLevel,
    pub serial_consistency_level: Option<ConsistencyLevel>,
    /// Latency SLOs in milliseconds; a single breach ends the run.
    pub max_read_latency_ms: Option<u64>,
    pub max_write_latency_ms: Option<u64>,
    /// Driver page size; `None` leaves the driver default.
    pub paging: Option<u32>,
    /// Walk every page of read results inside the timed span.
    pub paginate: bool,
    /// Pin all requests to the contact point.
    pub coordinator_only: bool,
    pub ttl: Option<u64>,
    pub compaction: Option<String>,
    pub compression: Option<String>,
    pub replication: Option<String>,
    /// `<table>.<column> -> <fn>(args)` generator overrides.
    pub fields: BTreeMap<String, String>,
    /// Dynamic `--workload.<name>=<value>` tunables.
    pub workload_parameters: BTreeMap<String, String>,
    /// 0 disables the exporter.
    pub prometheus_port: u16,
    /// Raw event log target (file, or directory for `rawlog.csv`).
    pub rawlog: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig::builder().workload("").build()
    }
}

impl RunConfig {
    /// Validates cross-field constraints and resolves the terminal bound.
    /// Neither bound supplied falls back to one million operations.
    pub fn terminal_bound(&self) -> Result<TerminalBound, ConfigError> {
        match (self.iterations, self.duration_secs) {
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousBound),
            (Some(n), None) => Ok(TerminalBound::Count(n)),
            (None, Some(secs)) => Ok(TerminalBound::Wall(Duration::from_secs(secs))),
            (None, None) => Ok(TerminalBound::Count(1_000_000)),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.terminal_bound()?;
        if self.threads == 0 {
            return Err(ConfigError::ZeroSized("threads"));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::ZeroSized("queue depth"));
        }
        if self.partition_count == 0 {
            return Err(ConfigError::ZeroSized("partition count"));
        }
        let read = self.read_rate.unwrap_or(0.0);
        if !(0.0..=1.0).contains(&read)
            || !(0.0..=1.0).contains(&self.delete_rate)
            || read + self.delete_rate > 1.0
        {
            return Err(ConfigError::RateOutOfRange { read, delete: self.delete_rate });
        }
        Ok(())
    }

    /// Read fraction with the profile's suggestion filled in.
    pub fn effective_read_rate(&self, profile_default: f64) -> f64 {
        self.read_rate.unwrap_or(profile_default)
    }
}

/// Parses the duration grammar: one or more `<int><unit>` tokens with
/// `unit` in `{d, h, m, s}`, in any order, optionally whitespace-separated.
/// Repeated units accumulate. Returns total seconds.
pub fn parse_duration_secs(input: &str) -> Result<u64, ConfigError> {
    let err = |reason: &str| ConfigError::InvalidDuration {
        input: input.to_string(),
        reason: reason.to_string(),
    };
    let mut total: u64 = 0;
    let mut digits = String::new();
    let mut seen_token = false;
    for ch in input.chars() {
        match ch {
            '0'..='9' => digits.push(ch),
            'd' | 'h' | 'm' | 's' => {
                if digits.is_empty() {
                    return Err(err("unit without a count"));
                }
                let n: u64 = digits.parse().map_err(|_| err("count out of range"))?;
                let scale = match ch {
                    'd' => 86_400,
                    'h' => 3_600,
                    'm' => 60,
                    _ => 1,
                };
                total = n
                    .checked_mul(scale)
                    .and_then(|v| total.checked_add(v))
                    .ok_or_else(|| err("duration overflows"))?;
                digits.clear();
                seen_token = true;
            }
            c if c.is_whitespace() => {
                if !digits.is_empty() {
                    return Err(err("count without a unit"));
                }
            }
            _ => return Err(err("unrecognised token")),
        }
    }
    if !digits.is_empty() {
        return Err(err("count without a unit"));
    }
    if !seen_token {
        return Err(err("empty duration"));
    }
    Ok(total)
}

/// Parses an integer with optional `k`/`m`/`b` suffix (case-insensitive).
pub fn parse_iterations(input: &str) -> Result<u64, ConfigError> {
    let trimmed = input.trim();
    let (digits, scale) = match trimmed.chars().last() {
        Some('k') | Some('K') => (&trimmed[..trimmed.len() - 1], 1_000),
        Some('m') | Some('M') => (&trimmed[..trimmed.len() - 1], 1_000_000),
        Some('b') | Some('B') => (&trimmed[..trimmed.len() - 1], 1_000_000_000),
        _ => (trimmed, 1),
    };
    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .filter(|n| *n > 0)
        .ok_or_else(|| ConfigError::InvalidIterations(input.to_string()))
}
