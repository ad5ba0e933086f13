//! Fact loader: one fact row per (time, service, group), however many times
//! the same input is loaded.

use clap::ValueEnum;
use std::fmt;
use std::ops::AddAssign;
use tracing::debug;

use crate::dimensions::DimensionKeys;
use crate::error::Result;
use crate::normalizer::Metrics;
use crate::warehouse::Warehouse;

/// What to do when the fact row for a key combination already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum FactPolicy {
    /// Keep the stored row.
    #[default]
    Skip,
    /// Overwrite the stored metrics when they differ.
    Upsert,
}

impl fmt::Display for FactPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactPolicy::Skip => f.write_str("skip"),
            FactPolicy::Upsert => f.write_str("upsert"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Inserted,
    Updated,
    Skipped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadStats {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl LoadStats {
    pub fn record(&mut self, outcome: LoadOutcome) {
        match outcome {
            LoadOutcome::Inserted => self.inserted += 1,
            LoadOutcome::Updated => self.updated += 1,
            LoadOutcome::Skipped => self.skipped += 1,
        }
    }

    /// Rows written to the destination.
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

impl AddAssign for LoadStats {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
    }
}

pub struct FactLoader<'a> {
    warehouse: &'a dyn Warehouse,
    policy: FactPolicy,
}

impl<'a> FactLoader<'a> {
    pub fn new(warehouse: &'a dyn Warehouse, policy: FactPolicy) -> Self {
        Self { warehouse, policy }
    }

    pub async fn load(&self, keys: DimensionKeys, metrics: &Metrics) -> Result<LoadOutcome> {
        let Some(existing) = self.warehouse.find_fact(keys).await? else {
            self.warehouse.insert_fact(keys, metrics).await?;
            return Ok(LoadOutcome::Inserted);
        };

        match self.policy {
            FactPolicy::Skip => Ok(LoadOutcome::Skipped),
            FactPolicy::Upsert if same_metrics(&existing.metrics, metrics) => Ok(LoadOutcome::Skipped),
            FactPolicy::Upsert => {
                debug!(fact_id = existing.id, "updating fact metrics");
                self.warehouse.update_fact(existing.id, metrics).await?;
                Ok(LoadOutcome::Updated)
            }
        }
    }
}

/// Stored numerics round-trip through the database's decimal type, so
/// equality allows a relative error of 1e-9.
fn same_metrics(a: &Metrics, b: &Metrics) -> bool {
    a.values().iter().zip(b.values().iter()).all(|pair| match pair {
        (None, None) => true,
        (Some(x), Some(y)) => (x - y).abs() <= 1e-9 * x.abs().max(y.abs()).max(1.0),
        _ => false,
    })
}
