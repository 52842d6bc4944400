//! The `BasicTimeSeries` profile: appends clustered rows per sensor and
//! reads back the newest slice.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::config::ConfigError;
use crate::driver::{CqlValue, DriverError, Prepared, Session};
use crate::engine::runner::{Operation, StatementOptions, StressRunner};
use crate::fields::{Field, FieldGenerator, FieldMap, GeneratorCall};
use crate::workload::{ParamDescriptor, ParamKind, ParamValue, StressWorkload};

const TABLE: &str = "sensor_data";

const PARAMETERS: &[ParamDescriptor] = &[ParamDescriptor {
    name: "limit",
    description: "rows fetched per read, newest first",
    kind: ParamKind::I64,
}];

pub struct BasicTimeSeries {
    limit: i64,
    statements: Option<Statements>,
}

impl Default for BasicTimeSeries {
    fn default() -> Self {
        Self { limit: 500, statements: None }
    }
}

struct Statements {
    select: Arc<Prepared>,
    insert: Arc<Prepared>,
    delete: Arc<Prepared>,
}

#[async_trait]
impl StressWorkload for BasicTimeSeries {
    fn schema(&self) -> Vec<String> {
        vec![format!(
            "CREATE TABLE IF NOT EXISTS {TABLE} (sensor_id text, timestamp bigint, data text, \
             PRIMARY KEY (sensor_id, timestamp)) WITH CLUSTERING ORDER BY (timestamp DESC)"
        )]
    }

    fn default_read_rate(&self) -> f64 {
        0.1
    }

    fn parameters(&self) -> &'static [ParamDescriptor] {
        PARAMETERS
    }

    fn set_parameter(&mut self, name: &str, value: ParamValue) -> Result<(), ConfigError> {
        match (name, value) {
            ("limit", ParamValue::I64(limit)) if limit > 0 => {
                self.limit = limit;
                Ok(())
            }
            ("limit", other) => Err(ConfigError::InvalidParameter {
                name: name.to_string(),
                value: format!("{other:?}"),
                reason: "limit must be a positive integer".to_string(),
            }),
            (other, _) => Err(ConfigError::UnknownParameter(other.to_string())),
        }
    }

    fn field_defaults(&self) -> Vec<(Field, GeneratorCall)> {
        vec![(Field::new(TABLE, "data"), GeneratorCall::new("random", &[100, 200]))]
    }

    async fn prepare(&mut self, session: &dyn Session) -> Result<(), DriverError> {
        // the slice size is fixed per run, so it is baked into the text
        self.statements = Some(Statements {
            select: session
                .prepare(&format!(
                    "SELECT * FROM {TABLE} WHERE sensor_id = ? LIMIT {}",
                    self.limit
                ))
                .await?,
            insert: session
                .prepare(&format!(
                    "INSERT INTO {TABLE} (sensor_id, timestamp, data) VALUES (?, ?, ?)"
                ))
                .await?,
            delete: session.prepare(&format!("DELETE FROM {TABLE} WHERE sensor_id = ?")).await?,
        });
        Ok(())
    }

    fn runner(
        &self,
        options: StatementOptions,
        fields: &FieldMap,
    ) -> Result<Box<dyn StressRunner>, ConfigError> {
        let statements =
            self.statements.as_ref().ok_or(ConfigError::Internal("runner before prepare"))?;
        Ok(Box::new(TimeSeriesRunner {
            select: Arc::clone(&statements.select),
            insert: Arc::clone(&statements.insert),
            delete: Arc::clone(&statements.delete),
            data: fields.instantiate(&Field::new(TABLE, "data"))?,
            clock_skew: 0,
            options,
        }))
    }
}

struct TimeSeriesRunner {
    select: Arc<Prepared>,
    insert: Arc<Prepared>,
    delete: Arc<Prepared>,
    data: Box<dyn FieldGenerator>,
    /// Keeps timestamps strictly increasing within one runner even when the
    /// wall clock reads the same microsecond twice.
    clock_skew: i64,
    options: StatementOptions,
}

impl TimeSeriesRunner {
    fn next_timestamp(&mut self) -> i64 {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        self.clock_skew += 1;
        micros.wrapping_add(self.clock_skew)
    }
}

impl StressRunner for TimeSeriesRunner {
    fn next_select(&mut self, key: &crate::keys::PartitionKey) -> Operation {
        let bound = self.select.bind(vec![CqlValue::Text(key.text())]);
        Operation::Select { bound: self.options.apply(bound) }
    }

    fn next_mutation(&mut self, key: &crate::keys::PartitionKey) -> Operation {
        let ts = self.next_timestamp();
        let bound = self.insert.bind(vec![
            CqlValue::Text(key.text()),
            CqlValue::BigInt(ts),
            self.data.generate(),
        ]);
        Operation::Mutation { bound: self.options.apply(bound) }
    }

    fn next_delete(&mut self, key: &crate::keys::PartitionKey) -> Operation {
        let bound = self.delete.bind(vec![CqlValue::Text(key.text())]);
        Operation::Delete { bound: self.options.apply(bound) }
    }
}
