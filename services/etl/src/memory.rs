//! In-memory warehouse used by dry runs and tests.
//!
//! Enforces the same uniqueness the destination enforces on dimension natural
//! keys. Facts carry no unique constraint, as in the destination.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::dimensions::DimensionKeys;
use crate::error::{EtlError, Result};
use crate::normalizer::Metrics;
use crate::warehouse::{Dimension, NaturalKey, StoredFact, Warehouse};

#[derive(Debug, Clone, PartialEq)]
pub struct FactRow {
    pub id: i64,
    pub keys: DimensionKeys,
    pub metrics: Metrics,
}

#[derive(Default)]
struct State {
    dimensions: BTreeMap<NaturalKey, i32>,
    next_dimension_id: BTreeMap<Dimension, i32>,
    facts: Vec<FactRow>,
}

#[derive(Default)]
pub struct MemoryWarehouse {
    state: Mutex<State>,
    offline: AtomicBool,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call fail as if the connection pool had been closed.
    pub fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    pub fn dimension_rows(&self, dimension: Dimension) -> usize {
        self.lock()
            .dimensions
            .keys()
            .filter(|k| k.dimension() == dimension)
            .count()
    }

    pub fn facts(&self) -> Vec<FactRow> {
        self.lock().facts.clone()
    }

    pub fn fact_count(&self) -> usize {
        self.lock().facts.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(EtlError::Load(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn dimension_keys(&self, dimension: Dimension) -> Result<Vec<(NaturalKey, i32)>> {
        self.check_online()?;
        Ok(self
            .lock()
            .dimensions
            .iter()
            .filter(|(k, _)| k.dimension() == dimension)
            .map(|(k, id)| (k.clone(), *id))
            .collect())
    }

    async fn insert_dimension(&self, key: &NaturalKey) -> Result<bool> {
        self.check_online()?;
        let mut state = self.lock();
        if state.dimensions.contains_key(key) {
            return Ok(false);
        }
        let next = state.next_dimension_id.entry(key.dimension()).or_insert(0);
        *next += 1;
        let id = *next;
        state.dimensions.insert(key.clone(), id);
        Ok(true)
    }

    async fn find_dimension(&self, key: &NaturalKey) -> Result<Option<i32>> {
        self.check_online()?;
        Ok(self.lock().dimensions.get(key).copied())
    }

    async fn find_fact(&self, keys: DimensionKeys) -> Result<Option<StoredFact>> {
        self.check_online()?;
        Ok(self
            .lock()
            .facts
            .iter()
            .filter(|f| f.keys == keys)
            .min_by_key(|f| f.id)
            .map(|f| StoredFact {
                id: f.id,
                metrics: f.metrics,
            }))
    }

    async fn insert_fact(&self, keys: DimensionKeys, metrics: &Metrics) -> Result<()> {
        self.check_online()?;
        let mut state = self.lock();
        let id = state.facts.len() as i64 + 1;
        state.facts.push(FactRow {
            id,
            keys,
            metrics: *metrics,
        });
        Ok(())
    }

    async fn update_fact(&self, id: i64, metrics: &Metrics) -> Result<()> {
        self.check_online()?;
        let mut state = self.lock();
        match state.facts.iter_mut().find(|f| f.id == id) {
            Some(fact) => {
                fact.metrics = *metrics;
                Ok(())
            }
            None => Err(EtlError::Load(sqlx::Error::RowNotFound)),
        }
    }
}
