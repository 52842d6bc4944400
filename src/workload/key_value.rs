//! The `KeyValue` profile: one row per partition, point reads and writes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConfigError;
use crate::driver::{CqlValue, DriverError, Prepared, Session};
use crate::engine::runner::{Operation, StatementOptions, StressRunner};
use crate::fields::{Field, FieldGenerator, FieldMap, GeneratorCall};
use crate::workload::{ParamValue, StressWorkload};

const TABLE: &str = "keyvalue";

#[derive(Default)]
pub struct KeyValue {
    statements: Option<Statements>,
}

struct Statements {
    select: Arc<Prepared>,
    insert: Arc<Prepared>,
    delete: Arc<Prepared>,
}

#[async_trait]
impl StressWorkload for KeyValue {
    fn schema(&self) -> Vec<String> {
        vec![format!(
            "CREATE TABLE IF NOT EXISTS {TABLE} (key text PRIMARY KEY, value text)"
        )]
    }

    fn default_read_rate(&self) -> f64 {
        0.5
    }

    fn set_parameter(&mut self, name: &str, _value: ParamValue) -> Result<(), ConfigError> {
        Err(ConfigError::UnknownParameter(name.to_string()))
    }

    fn field_defaults(&self) -> Vec<(Field, GeneratorCall)> {
        vec![(Field::new(TABLE, "value"), GeneratorCall::new("random", &[100, 200]))]
    }

    async fn prepare(&mut self, session: &dyn Session) -> Result<(), DriverError> {
        self.statements = Some(Statements {
            select: session.prepare(&format!("SELECT * FROM {TABLE} WHERE key = ?")).await?,
            insert: session
                .prepare(&format!("INSERT INTO {TABLE} (key, value) VALUES (?, ?)"))
                .await?,
            delete: session.prepare(&format!("DELETE FROM {TABLE} WHERE key = ?")).await?,
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
        Ok(Box::new(KeyValueRunner {
            select: Arc::clone(&statements.select),
            insert: Arc::clone(&statements.insert),
            delete: Arc::clone(&statements.delete),
            value: fields.instantiate(&Field::new(TABLE, "value"))?,
            options,
        }))
    }
}

struct KeyValueRunner {
    select: Arc<Prepared>,
    insert: Arc<Prepared>,
    delete: Arc<Prepared>,
    value: Box<dyn FieldGenerator>,
    options: StatementOptions,
}

impl StressRunner for KeyValueRunner {
    fn next_select(&mut self, key: &crate::keys::PartitionKey) -> Operation {
        let bound = self.select.bind(vec![CqlValue::Text(key.text())]);
        Operation::Select { bound: self.options.apply(bound) }
    }

    fn next_mutation(&mut self, key: &crate::keys::PartitionKey) -> Operation {
        let bound = self.insert.bind(vec![CqlValue::Text(key.text()), self.value.generate()]);
        Operation::Mutation { bound: self.options.apply(bound) }
    }

    fn next_delete(&mut self, key: &crate::keys::PartitionKey) -> Operation {
        let bound = self.delete.bind(vec![CqlValue::Text(key.text())]);
        Operation::Delete { bound: self.options.apply(bound) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ConsistencyLevel, MemorySession};
    use crate::keys::PartitionKey;

    fn options() -> StatementOptions {
        StatementOptions {
            consistency: ConsistencyLevel::LocalQuorum,
            serial_consistency: None,
            page_size: None,
            paginate: false,
            coordinator_only: false,
        }
    }

    #[tokio::test]
    async fn runner_binds_the_key_text() {
        let session = MemorySession::builder().build();
        let mut workload = KeyValue::default();
        workload.prepare(&session).await.unwrap();

        let fields = FieldMap::from_defaults(workload.field_defaults());
        let mut runner = workload.runner(options(), &fields).unwrap();

        let key = PartitionKey::new("key".into(), 17);
        let op = runner.next_select(&key);
        let bound = op.bound().unwrap();
        assert_eq!(bound.values, vec![CqlValue::Text("key17".into())]);
        assert!(bound.prepared.cql.starts_with("SELECT"));

        let op = runner.next_mutation(&key);
        let bound = op.bound().unwrap();
        assert_eq!(bound.values.len(), 2);
        assert!(bound.prepared.cql.starts_with("INSERT"));
    }

    #[tokio::test]
    async fn runner_before_prepare_is_an_error() {
        let workload = KeyValue::default();
        let fields = FieldMap::from_defaults(workload.field_defaults());
        assert!(workload.runner(options(), &fields).is_err());
    }
}
