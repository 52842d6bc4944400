//! The profile runner bridge: one [`StressRunner`] per worker turns a
//! partition key into a bound operation for the kind the dispatch loop
//! picked.

use crate::driver::{Bound, ConsistencyLevel};
use crate::keys::PartitionKey;
use crate::metrics::OpKind;

/// Statement-level options every bound operation carries, resolved once
/// from the run configuration.
#[derive(Debug, Clone, Copy)]
pub struct StatementOptions {
    pub consistency: ConsistencyLevel,
    pub serial_consistency: Option<ConsistencyLevel>,
    pub page_size: Option<u32>,
    pub paginate: bool,
    pub coordinator_only: bool,
}

impl StatementOptions {
    /// Applies the options to a freshly bound statement.
    pub fn apply(&self, bound: Bound) -> Bound {
        bound
            .with_consistency(self.consistency, self.serial_consistency)
            .with_page_size(self.page_size)
            .pinned_to_coordinator(self.coordinator_only)
    }
}

/// A bound operation ready for submission, or the stop marker a runner may
/// emit when it cannot produce further work.
#[derive(Debug, Clone)]
pub enum Operation {
    Mutation { bound: Bound },
    Select { bound: Bound },
    Delete { bound: Bound },
    Stop,
}

impl Operation {
    pub fn bound(&self) -> Option<&Bound> {
        match self {
            Self::Mutation { bound } | Self::Select { bound } | Self::Delete { bound } => {
                Some(bound)
            }
            Self::Stop => None,
        }
    }

    /// Timer kind for the measured phase. The populate phase overrides this
    /// with [`OpKind::Populate`] regardless of the variant.
    pub fn kind(&self) -> Option<OpKind> {
        match self {
            Self::Mutation { .. } => Some(OpKind::Mutation),
            Self::Select { .. } => Some(OpKind::Select),
            Self::Delete { .. } => Some(OpKind::Delete),
            Self::Stop => None,
        }
    }
}

/// Per-worker adapter from partition keys to bound operations. Instances
/// own their field generators and rng, so calls take `&mut self`; the
/// prepared statements behind the bounds are shared.
pub trait StressRunner: Send {
    fn next_select(&mut self, key: &PartitionKey) -> Operation;
    fn next_mutation(&mut self, key: &PartitionKey) -> Operation;
    fn next_delete(&mut self, key: &PartitionKey) -> Operation;

    /// Populate-phase mutation; profiles with a distinct load shape
    /// override this.
    fn next_populate(&mut self, key: &PartitionKey) -> Operation {
        self.next_mutation(key)
    }
}
