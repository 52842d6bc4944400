//! Partition keys and the shared key stream.
//!
//! A [`KeyStream`] is drawn from concurrently by every worker; each `next()`
//! is atomic. `max_id` is inclusive: a stream over a key space of N
//! partitions is built with `max_id = N - 1`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Distribution of partition-key ids over the key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyDistribution {
    /// Uniform random draw per call.
    Random,
    /// 0, 1, .., max_id, 0, 1, .. with a silent wrap; ids are produced at
    /// most once per wrap across all threads.
    Sequence,
    /// Truncated gaussian, mean `max/2`, stddev `max/4`, resampled until
    /// the draw lands in range.
    Normal,
}

impl std::str::FromStr for KeyDistribution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(Self::Random),
            "sequence" => Ok(Self::Sequence),
            "normal" => Ok(Self::Normal),
            other => Err(format!("unknown key generator {other:?}")),
        }
    }
}

/// A partition key: prefix plus non-negative id. Two keys with the same
/// canonical text are the same key, whatever the split.
#[derive(Debug, Clone)]
pub struct PartitionKey {
    prefix: Arc<str>,
    id: u64,
}

impl PartitionKey {
    pub fn new(prefix: Arc<str>, id: u64) -> Self {
        Self { prefix, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Canonical text form `"<prefix><id>"`.
    pub fn text(&self) -> String {
        format!("{}{}", self.prefix, self.id)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix, self.id)
    }
}

impl PartialEq for PartitionKey {
    fn eq(&self, other: &Self) -> bool {
        self.text() == other.text()
    }
}

impl Eq for PartitionKey {}

impl Hash for PartitionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.text().hash(state);
    }
}

/// Lazy, finite, thread-safe stream of partition keys.
pub struct KeyStream {
    prefix: Arc<str>,
    max_id: u64,
    /// `u64::MAX` means unbounded.
    total: u64,
    produced: AtomicU64,
    sequence: AtomicU64,
    distribution: KeyDistribution,
    normal: Option<Normal<f64>>,
}

impl KeyStream {
    pub fn new(
        distribution: KeyDistribution,
        prefix: &str,
        max_id: u64,
        total: Option<u64>,
    ) -> Self {
        let normal = match distribution {
            KeyDistribution::Normal => {
                let mean = max_id as f64 / 2.0;
                let stddev = (max_id as f64 / 4.0).max(f64::MIN_POSITIVE);
                // stddev is positive by construction, so this cannot fail
                Normal::new(mean, stddev).ok()
            }
            _ => None,
        };
        Self {
            prefix: Arc::from(prefix),
            max_id,
            total: total.unwrap_or(u64::MAX),
            produced: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            distribution,
            normal,
        }
    }

    /// Next key, or `None` once `total` keys have been produced.
    pub fn next(&self) -> Option<PartitionKey> {
        if self.produced.fetch_add(1, Ordering::Relaxed) >= self.total {
            return None;
        }
        let id = match self.distribution {
            KeyDistribution::Random => rand::rng().random_range(0..=self.max_id),
            KeyDistribution::Sequence => {
                let n = self.sequence.fetch_add(1, Ordering::Relaxed);
                if self.max_id == u64::MAX { n } else { n % (self.max_id + 1) }
            }
            KeyDistribution::Normal => self.sample_normal(),
        };
        Some(PartitionKey::new(self.prefix.clone(), id))
    }

    fn sample_normal(&self) -> u64 {
        let Some(normal) = &self.normal else {
            return 0;
        };
        let mut rng = rand::rng();
        loop {
            let draw = normal.sample(&mut rng).round();
            if draw >= 0.0 && draw <= self.max_id as f64 {
                return draw as u64;
            }
        }
    }
}
