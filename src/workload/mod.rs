//! Workload profiles and their registry.
//!
//! A profile bundles schema DDL, prepared statements, an operation pattern,
//! tunable parameters, and field-generator defaults. Profiles register in
//! the static table at the bottom of this module; the controller looks them
//! up by name, binds user parameters, prepares statements once, and builds
//! one runner per worker.

pub mod key_value;
pub mod random_access;
pub mod time_series;

use async_trait::async_trait;

use crate::config::{ConfigError, RunConfig};
use crate::driver::{DriverError, Session};
use crate::engine::runner::{StatementOptions, StressRunner};
use crate::fields::{Field, FieldMap, GeneratorCall};

/// Declared type of a tunable parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamKind {
    I64,
    F64,
    Bool,
    Str,
    Enum(&'static [&'static str]),
}

/// Reflective description of one tunable, exposed by `info` and used to
/// parse the user's string map.
#[derive(Debug, Clone, Copy)]
pub struct ParamDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: ParamKind,
}

/// A parsed parameter value, matching the descriptor's declared kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    I64(i64),
    F64(f64),
    Bool(bool),
    Str(String),
    Enum(&'static str),
}

/// Parses a raw string against the descriptor's kind.
pub fn parse_param(descriptor: &ParamDescriptor, raw: &str) -> Result<ParamValue, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidParameter {
        name: descriptor.name.to_string(),
        value: raw.to_string(),
        reason: reason.to_string(),
    };
    match descriptor.kind {
        ParamKind::I64 => raw.parse().map(ParamValue::I64).map_err(|_| invalid("expected integer")),
        ParamKind::F64 => raw.parse().map(ParamValue::F64).map_err(|_| invalid("expected number")),
        ParamKind::Bool => {
            raw.parse().map(ParamValue::Bool).map_err(|_| invalid("expected true or false"))
        }
        ParamKind::Str => Ok(ParamValue::Str(raw.to_string())),
        ParamKind::Enum(variants) => variants
            .iter()
            .find(|v| v.eq_ignore_ascii_case(raw))
            .map(|v| ParamValue::Enum(*v))
            .ok_or_else(|| invalid(&format!("expected one of {variants:?}"))),
    }
}

/// Version/feature gates a profile may carry. Filtering on them is the
/// harness's concern; the registry only exposes the annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    MinimumVersion(&'static str),
    RequireAccord,
    RequireDse,
}

impl Gate {
    pub fn label(&self) -> String {
        match self {
            Self::MinimumVersion(v) => format!("minimum_version={v}"),
            Self::RequireAccord => "require_accord".to_string(),
            Self::RequireDse => "require_dse".to_string(),
        }
    }
}

/// How the profile wants its populate phase shaped when the operator asks
/// for `standard`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PopulatePolicy {
    /// One mutation per partition, sequential over the key space.
    Standard,
    /// Pinned row count; deletes may be interleaved at the configured
    /// delete rate while loading.
    Custom { rows: u64, deletes_during_populate: bool },
}

#[async_trait]
pub trait StressWorkload: Send + Sync {
    /// DDL applied by the (external) schema builder, in order.
    fn schema(&self) -> Vec<String>;

    /// Suggested read fraction when the operator does not pick one.
    fn default_read_rate(&self) -> f64;

    fn populate_policy(&self, partitions: u64) -> PopulatePolicy {
        let _ = partitions;
        PopulatePolicy::Standard
    }

    fn parameters(&self) -> &'static [ParamDescriptor] {
        &[]
    }

    /// Assigns a parsed parameter. Called only with names from
    /// [`Self::parameters`].
    fn set_parameter(&mut self, name: &str, value: ParamValue) -> Result<(), ConfigError>;

    /// Generator defaults for every column this profile writes.
    fn field_defaults(&self) -> Vec<(Field, GeneratorCall)>;

    /// Prepares the profile's statements against the session.
    async fn prepare(&mut self, session: &dyn Session) -> Result<(), DriverError>;

    /// Builds the per-worker runner. `prepare` has completed by the time
    /// this is called.
    fn runner(
        &self,
        options: StatementOptions,
        fields: &FieldMap,
    ) -> Result<Box<dyn StressRunner>, ConfigError>;
}

/// Walks the user parameter map, parses each value against its descriptor,
/// and assigns it. Unknown names fail before any thread starts.
pub fn bind_parameters(
    workload: &mut dyn StressWorkload,
    config: &RunConfig,
) -> Result<(), ConfigError> {
    for (name, raw) in &config.workload_parameters {
        let descriptor = workload
            .parameters()
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| ConfigError::UnknownParameter(name.clone()))?;
        let value = parse_param(descriptor, raw)?;
        workload.set_parameter(name, value)?;
    }
    Ok(())
}

/// One registry row: identity, factory, and gate annotations.
pub struct WorkloadDef {
    pub name: &'static str,
    /// Concrete type path, reported by `info`.
    pub class: &'static str,
    pub description: &'static str,
    pub gates: &'static [Gate],
    factory: fn() -> Box<dyn StressWorkload>,
}

impl WorkloadDef {
    pub fn instantiate(&self) -> Box<dyn StressWorkload> {
        (self.factory)()
    }
}

/// Every profile available in this build.
pub static REGISTRY: &[WorkloadDef] = &[
    WorkloadDef {
        name: "KeyValue",
        class: "cqlstress::workload::key_value::KeyValue",
        description: "single-row reads and writes over a flat key space",
        gates: &[],
        factory: || Box::new(key_value::KeyValue::default()),
    },
    WorkloadDef {
        name: "BasicTimeSeries",
        class: "cqlstress::workload::time_series::BasicTimeSeries",
        description: "append-heavy clustered rows, reads fetch the newest slice",
        gates: &[],
        factory: || Box::new(time_series::BasicTimeSeries::default()),
    },
    WorkloadDef {
        name: "RandomPartitionAccess",
        class: "cqlstress::workload::random_access::RandomPartitionAccess",
        description: "row or whole-partition access within wide partitions",
        gates: &[Gate::MinimumVersion("3.0")],
        factory: || Box::new(random_access::RandomPartitionAccess::default()),
    },
];

pub fn get(name: &str) -> Result<&'static WorkloadDef, ConfigError> {
    REGISTRY
        .iter()
        .find(|def| def.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| ConfigError::UnknownWorkload(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_by_name() {
        assert_eq!(get("KeyValue").unwrap().name, "KeyValue");
        assert_eq!(get("keyvalue").unwrap().name, "KeyValue");
        assert!(matches!(get("NoSuch"), Err(ConfigError::UnknownWorkload(_))));
    }

    #[test]
    fn unknown_parameter_is_rejected_before_start() {
        let mut workload = get("BasicTimeSeries").unwrap().instantiate();
        let mut config = RunConfig::builder().workload("BasicTimeSeries").build();
        config.workload_parameters.insert("nope".into(), "1".into());
        assert!(matches!(
            bind_parameters(workload.as_mut(), &config),
            Err(ConfigError::UnknownParameter(_))
        ));
    }

    #[test]
    fn parameters_bind_by_declared_kind() {
        let mut workload = get("BasicTimeSeries").unwrap().instantiate();
        let mut config = RunConfig::builder().workload("BasicTimeSeries").build();
        config.workload_parameters.insert("limit".into(), "200".into());
        bind_parameters(workload.as_mut(), &config).unwrap();

        config.workload_parameters.insert("limit".into(), "two hundred".into());
        assert!(matches!(
            bind_parameters(workload.as_mut(), &config),
            Err(ConfigError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn enum_parameters_match_declared_variants() {
        let descriptor = ParamDescriptor {
            name: "access",
            description: "",
            kind: ParamKind::Enum(&["row", "partition"]),
        };
        assert_eq!(parse_param(&descriptor, "Partition").unwrap(), ParamValue::Enum("partition"));
        assert!(parse_param(&descriptor, "table").is_err());
    }

    #[test]
    fn gates_are_exposed_as_data() {
        let def = get("RandomPartitionAccess").unwrap();
        assert_eq!(def.gates, &[Gate::MinimumVersion("3.0")][..]);
        assert_eq!(def.gates[0].label(), "minimum_version=3.0");
    }
}
