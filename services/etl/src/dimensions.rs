//! Dimension resolver: surrogate keys for the time, service and
//! economic-group dimensions.
//!
//! Keys live in a run-scoped map preloaded from the warehouse. A miss inserts
//! the natural key (ignoring a concurrent duplicate) and reads the key back.

use chrono::{Datelike, NaiveDate};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

use crate::error::{EtlError, Result};
use crate::normalizer::NormalizedRecord;
use crate::sheet::normalize_header;
use crate::warehouse::{Dimension, NaturalKey, Warehouse};

/// The closed set of regulated services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Service {
    Smp,
    Stfc,
    Scm,
}

impl Service {
    pub fn code(self) -> &'static str {
        match self {
            Service::Smp => "SMP",
            Service::Stfc => "STFC",
            Service::Scm => "SCM",
        }
    }

    /// Accepts the acronym or the long Portuguese name, in any case or accenting.
    pub fn parse(name: &str) -> Option<Service> {
        match normalize_header(name).as_str() {
            "SMP" | "SERVICO MOVEL PESSOAL" => Some(Service::Smp),
            "STFC" | "SERVICO TELEFONICO FIXO COMUTADO" => Some(Service::Stfc),
            "SCM" | "SERVICO DE COMUNICACAO MULTIMIDIA" => Some(Service::Scm),
            _ => None,
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Natural key of an economic group: trimmed, inner whitespace collapsed, upper case.
pub fn group_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Foreign keys of one fact row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DimensionKeys {
    pub time_id: i32,
    pub service_id: i32,
    pub group_id: i32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResolverStats {
    pub preloaded: usize,
    pub cache_hits: usize,
    pub created: usize,
}

pub struct DimensionResolver<'a> {
    warehouse: &'a dyn Warehouse,
    keys: HashMap<NaturalKey, i32>,
    stats: ResolverStats,
}

impl<'a> DimensionResolver<'a> {
    pub fn new(warehouse: &'a dyn Warehouse) -> Self {
        Self {
            warehouse,
            keys: HashMap::new(),
            stats: ResolverStats::default(),
        }
    }

    /// Load every existing dimension row into the run-scoped maps.
    pub async fn preload(&mut self) -> Result<()> {
        for dimension in Dimension::ALL {
            let rows = self.warehouse.dimension_keys(dimension).await?;
            debug!(dimension = dimension.table(), rows = rows.len(), "dimension preloaded");
            self.stats.preloaded += rows.len();
            self.keys.extend(rows);
        }
        info!(keys = self.stats.preloaded, "dimension keys preloaded");
        Ok(())
    }

    /// Resolve the three keys of a record. The service is validated before
    /// any dimension row is written.
    pub async fn resolve(&mut self, record: &NormalizedRecord) -> Result<DimensionKeys> {
        let service = Service::parse(&record.service_name).ok_or_else(|| {
            EtlError::DimensionIntegrity(format!(
                "unknown service '{}' at row {}",
                record.service_name, record.source_row
            ))
        })?;
        let group = group_key(&record.economic_group_name);
        if group.is_empty() {
            return Err(EtlError::DimensionIntegrity(format!(
                "blank economic group at row {}",
                record.source_row
            )));
        }

        Ok(DimensionKeys {
            time_id: self.key_for(NaturalKey::Month(month_start(record.reference_month))).await?,
            service_id: self.key_for(NaturalKey::Service(service)).await?,
            group_id: self.key_for(NaturalKey::Group(group)).await?,
        })
    }

    async fn key_for(&mut self, key: NaturalKey) -> Result<i32> {
        if let Some(id) = self.keys.get(&key) {
            self.stats.cache_hits += 1;
            return Ok(*id);
        }

        if self.warehouse.insert_dimension(&key).await? {
            self.stats.created += 1;
            debug!(key = %key, "dimension row created");
        }
        // the natural key is valid, so a miss here is a destination fault
        let id = self.warehouse.find_dimension(&key).await?.ok_or_else(|| {
            EtlError::Load(sqlx::Error::Protocol(format!(
                "{} not readable after insert",
                key
            )))
        })?;

        self.keys.insert(key, id);
        Ok(id)
    }

    pub fn stats(&self) -> ResolverStats {
        self.stats
    }
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::MemoryWarehouse;
    use crate::normalizer::Metrics;
    use crate::warehouse::StoredFact;
    use async_trait::async_trait;

    /// Accepts dimension inserts but never finds the rows afterwards.
    #[derive(Default)]
    pub(crate) struct VanishingDimensions(pub(crate) MemoryWarehouse);

    #[async_trait]
    impl Warehouse for VanishingDimensions {
        async fn dimension_keys(&self, dimension: Dimension) -> Result<Vec<(NaturalKey, i32)>> {
            self.0.dimension_keys(dimension).await
        }

        async fn insert_dimension(&self, key: &NaturalKey) -> Result<bool> {
            self.0.insert_dimension(key).await
        }

        async fn find_dimension(&self, _key: &NaturalKey) -> Result<Option<i32>> {
            Ok(None)
        }

        async fn find_fact(&self, keys: DimensionKeys) -> Result<Option<StoredFact>> {
            self.0.find_fact(keys).await
        }

        async fn insert_fact(&self, keys: DimensionKeys, metrics: &Metrics) -> Result<()> {
            self.0.insert_fact(keys, metrics).await
        }

        async fn update_fact(&self, id: i64, metrics: &Metrics) -> Result<()> {
            self.0.update_fact(id, metrics).await
        }
    }

    fn record(month: u32, service: &str, group: &str) -> NormalizedRecord {
        NormalizedRecord {
            source_row: 7,
            reference_month: NaiveDate::from_ymd_opt(2023, month, 1).unwrap(),
            service_name: service.to_string(),
            economic_group_name: group.to_string(),
            metrics: Metrics::default(),
        }
    }

    // -------------------------------------------------------------------------
    // SERVICE / GROUP KEYS
    // -------------------------------------------------------------------------

    #[test]
    fn test_service_aliases() {
        assert_eq!(Service::parse("smp"), Some(Service::Smp));
        assert_eq!(Service::parse("Serviço Móvel Pessoal"), Some(Service::Smp));
        assert_eq!(Service::parse(" STFC "), Some(Service::Stfc));
        assert_eq!(Service::parse("Serviço de Comunicação Multimídia"), Some(Service::Scm));
        assert_eq!(Service::parse("XYZ"), None);
        assert_eq!(Service::parse(""), None);
    }

    #[test]
    fn test_group_key_normalization() {
        assert_eq!(group_key("  Vivo  "), "VIVO");
        assert_eq!(group_key("grupo\t  oi"), "GRUPO OI");
        assert_eq!(group_key("   "), "");
    }

    // -------------------------------------------------------------------------
    // RESOLUTION
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_resolve_creates_each_key_once() {
        let wh = MemoryWarehouse::new();
        let mut resolver = DimensionResolver::new(&wh);
        resolver.preload().await.unwrap();

        let a = resolver.resolve(&record(3, "SMP", "VIVO")).await.unwrap();
        let b = resolver.resolve(&record(3, "smp", " vivo ")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(resolver.stats().created, 3);
        assert_eq!(wh.dimension_rows(Dimension::Time), 1);
        assert_eq!(wh.dimension_rows(Dimension::Service), 1);
        assert_eq!(wh.dimension_rows(Dimension::EconomicGroup), 1);
    }

    #[tokio::test]
    async fn test_preload_reuses_existing_keys() {
        let wh = MemoryWarehouse::new();
        let first = {
            let mut resolver = DimensionResolver::new(&wh);
            resolver.preload().await.unwrap();
            resolver.resolve(&record(4, "SCM", "CLARO")).await.unwrap()
        };

        let mut resolver = DimensionResolver::new(&wh);
        resolver.preload().await.unwrap();
        assert_eq!(resolver.stats().preloaded, 3);
        let second = resolver.resolve(&record(4, "SCM", "CLARO")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(resolver.stats().created, 0);
        assert_eq!(resolver.stats().cache_hits, 3);
    }

    #[tokio::test]
    async fn test_unknown_service_writes_nothing() {
        let wh = MemoryWarehouse::new();
        let mut resolver = DimensionResolver::new(&wh);
        let err = resolver.resolve(&record(3, "XYZ", "NOVO GRUPO")).await.unwrap_err();
        assert_eq!(err.kind(), "dimension_integrity");
        assert_eq!(wh.dimension_rows(Dimension::Time), 0);
        assert_eq!(wh.dimension_rows(Dimension::EconomicGroup), 0);
    }

    #[tokio::test]
    async fn test_new_groups_are_accepted() {
        let wh = MemoryWarehouse::new();
        let mut resolver = DimensionResolver::new(&wh);
        let a = resolver.resolve(&record(1, "SMP", "BRISANET")).await.unwrap();
        let b = resolver.resolve(&record(1, "SMP", "UNIFIQUE")).await.unwrap();
        assert_ne!(a.group_id, b.group_id);
        assert_eq!(a.time_id, b.time_id);
        assert_eq!(wh.dimension_rows(Dimension::EconomicGroup), 2);
    }

    #[tokio::test]
    async fn test_key_inserted_by_another_writer_is_reread() {
        let wh = MemoryWarehouse::new();
        let mut resolver = DimensionResolver::new(&wh);
        resolver.preload().await.unwrap();

        // row appears after the preload, as if written by a concurrent run
        wh.insert_dimension(&NaturalKey::Group("TIM".into())).await.unwrap();
        let id = wh
            .find_dimension(&NaturalKey::Group("TIM".into()))
            .await
            .unwrap()
            .unwrap();

        let keys = resolver.resolve(&record(2, "SMP", "tim")).await.unwrap();
        assert_eq!(keys.group_id, id);
        assert_eq!(wh.dimension_rows(Dimension::EconomicGroup), 1);
    }

    #[tokio::test]
    async fn test_unreadable_key_after_insert_is_load_error() {
        let wh = VanishingDimensions::default();
        let mut resolver = DimensionResolver::new(&wh);
        let err = resolver.resolve(&record(3, "SMP", "VIVO")).await.unwrap_err();
        assert_eq!(err.kind(), "load");
        assert!(!err.is_connectivity_loss());
        assert!(err.to_string().contains("not readable after insert"));
    }
}
