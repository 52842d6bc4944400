//! The `RandomPartitionAccess` profile: wide partitions, hitting either one
//! random row or the whole partition per operation.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::config::ConfigError;
use crate::driver::{CqlValue, DriverError, Prepared, Session};
use crate::engine::runner::{Operation, StatementOptions, StressRunner};
use crate::fields::{Field, FieldGenerator, FieldMap, GeneratorCall};
use crate::workload::{ParamDescriptor, ParamKind, ParamValue, PopulatePolicy, StressWorkload};

const TABLE: &str = "random_access";

const PARAMETERS: &[ParamDescriptor] = &[
    ParamDescriptor {
        name: "rows",
        description: "rows per partition",
        kind: ParamKind::I64,
    },
    ParamDescriptor {
        name: "access",
        description: "whether reads and deletes address one row or the whole partition",
        kind: ParamKind::Enum(&["row", "partition"]),
    },
];

#[derive(Debug, Clone, Copy, PartialEq)]
enum AccessMode {
    Row,
    Partition,
}

pub struct RandomPartitionAccess {
    rows: i64,
    access: AccessMode,
    statements: Option<Statements>,
}

impl Default for RandomPartitionAccess {
    fn default() -> Self {
        Self { rows: 100, access: AccessMode::Row, statements: None }
    }
}

struct Statements {
    select_row: Arc<Prepared>,
    select_partition: Arc<Prepared>,
    insert: Arc<Prepared>,
    delete_row: Arc<Prepared>,
    delete_partition: Arc<Prepared>,
}

#[async_trait]
impl StressWorkload for RandomPartitionAccess {
    fn schema(&self) -> Vec<String> {
        vec![format!(
            "CREATE TABLE IF NOT EXISTS {TABLE} (partition_id text, row_id bigint, value text, \
             PRIMARY KEY (partition_id, row_id))"
        )]
    }

    fn default_read_rate(&self) -> f64 {
        0.5
    }

    /// A full populate writes every row of every partition; sequential key
    /// wrap-around revisits each partition once per row.
    fn populate_policy(&self, partitions: u64) -> PopulatePolicy {
        PopulatePolicy::Custom {
            rows: partitions.saturating_mul(self.rows as u64),
            deletes_during_populate: false,
        }
    }

    fn parameters(&self) -> &'static [ParamDescriptor] {
        PARAMETERS
    }

    fn set_parameter(&mut self, name: &str, value: ParamValue) -> Result<(), ConfigError> {
        match (name, value) {
            ("rows", ParamValue::I64(rows)) if rows > 0 => {
                self.rows = rows;
                Ok(())
            }
            ("rows", other) => Err(ConfigError::InvalidParameter {
                name: name.to_string(),
                value: format!("{other:?}"),
                reason: "rows must be a positive integer".to_string(),
            }),
            ("access", ParamValue::Enum("row")) => {
                self.access = AccessMode::Row;
                Ok(())
            }
            ("access", ParamValue::Enum("partition")) => {
                self.access = AccessMode::Partition;
                Ok(())
            }
            (other, _) => Err(ConfigError::UnknownParameter(other.to_string())),
        }
    }

    fn field_defaults(&self) -> Vec<(Field, GeneratorCall)> {
        vec![(Field::new(TABLE, "value"), GeneratorCall::new("random", &[100, 200]))]
    }

    async fn prepare(&mut self, session: &dyn Session) -> Result<(), DriverError> {
        self.statements = Some(Statements {
            select_row: session
                .prepare(&format!(
                    "SELECT * FROM {TABLE} WHERE partition_id = ? AND row_id = ?"
                ))
                .await?,
            select_partition: session
                .prepare(&format!("SELECT * FROM {TABLE} WHERE partition_id = ?"))
                .await?,
            insert: session
                .prepare(&format!(
                    "INSERT INTO {TABLE} (partition_id, row_id, value) VALUES (?, ?, ?)"
                ))
                .await?,
            delete_row: session
                .prepare(&format!(
                    "DELETE FROM {TABLE} WHERE partition_id = ? AND row_id = ?"
                ))
                .await?,
            delete_partition: session
                .prepare(&format!("DELETE FROM {TABLE} WHERE partition_id = ?"))
                .await?,
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
        Ok(Box::new(RandomAccessRunner {
            select_row: Arc::clone(&statements.select_row),
            select_partition: Arc::clone(&statements.select_partition),
            insert: Arc::clone(&statements.insert),
            delete_row: Arc::clone(&statements.delete_row),
            delete_partition: Arc::clone(&statements.delete_partition),
            value: fields.instantiate(&Field::new(TABLE, "value"))?,
            rows: self.rows,
            access: self.access,
            rng: SmallRng::from_rng(&mut rand::rng()),
            populate_cursor: 0,
            options,
        }))
    }
}

struct RandomAccessRunner {
    select_row: Arc<Prepared>,
    select_partition: Arc<Prepared>,
    insert: Arc<Prepared>,
    delete_row: Arc<Prepared>,
    delete_partition: Arc<Prepared>,
    value: Box<dyn FieldGenerator>,
    rows: i64,
    access: AccessMode,
    rng: SmallRng,
    populate_cursor: i64,
    options: StatementOptions,
}

impl RandomAccessRunner {
    fn random_row(&mut self) -> i64 {
        self.rng.random_range(0..self.rows)
    }
}

impl StressRunner for RandomAccessRunner {
    fn next_select(&mut self, key: &crate::keys::PartitionKey) -> Operation {
        let bound = match self.access {
            AccessMode::Row => {
                let row = self.random_row();
                self.select_row.bind(vec![CqlValue::Text(key.text()), CqlValue::BigInt(row)])
            }
            AccessMode::Partition => {
                self.select_partition.bind(vec![CqlValue::Text(key.text())])
            }
        };
        Operation::Select { bound: self.options.apply(bound) }
    }

    fn next_mutation(&mut self, key: &crate::keys::PartitionKey) -> Operation {
        let row = self.random_row();
        let bound = self.insert.bind(vec![
            CqlValue::Text(key.text()),
            CqlValue::BigInt(row),
            self.value.generate(),
        ]);
        Operation::Mutation { bound: self.options.apply(bound) }
    }

    fn next_delete(&mut self, key: &crate::keys::PartitionKey) -> Operation {
        let bound = match self.access {
            AccessMode::Row => {
                let row = self.random_row();
                self.delete_row.bind(vec![CqlValue::Text(key.text()), CqlValue::BigInt(row)])
            }
            AccessMode::Partition => {
                self.delete_partition.bind(vec![CqlValue::Text(key.text())])
            }
        };
        Operation::Delete { bound: self.options.apply(bound) }
    }

    /// Populate walks row ids round-robin so repeated visits to a partition
    /// fill distinct rows.
    fn next_populate(&mut self, key: &crate::keys::PartitionKey) -> Operation {
        let row = self.populate_cursor % self.rows;
        self.populate_cursor = self.populate_cursor.wrapping_add(1);
        let bound = self.insert.bind(vec![
            CqlValue::Text(key.text()),
            CqlValue::BigInt(row),
            self.value.generate(),
        ]);
        Operation::Mutation { bound: self.options.apply(bound) }
    }
}
