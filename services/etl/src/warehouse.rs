//! Destination port and its PostgreSQL implementation.
//!
//! The star schema is owned by the database; nothing here creates or alters
//! tables. Dimension tables need a unique constraint on their natural key.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::dimensions::{group_key, DimensionKeys, Service};
use crate::error::Result;
use crate::normalizer::{Metrics, METRIC_COUNT, METRIC_FIELDS};

pub const FACT_TABLE: &str = "fato_desempenho_atendimento";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dimension {
    Time,
    Service,
    EconomicGroup,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Dimension::Time, Dimension::Service, Dimension::EconomicGroup];

    pub fn table(self) -> &'static str {
        match self {
            Dimension::Time => "dim_tempo",
            Dimension::Service => "dim_servico",
            Dimension::EconomicGroup => "dim_grupo_economico",
        }
    }

    fn id_column(self) -> &'static str {
        match self {
            Dimension::Time => "id_tempo",
            Dimension::Service => "id_servico",
            Dimension::EconomicGroup => "id_grupo_economico",
        }
    }

    fn key_column(self) -> &'static str {
        match self {
            Dimension::Time => "data_completa",
            Dimension::Service => "nome_servico",
            Dimension::EconomicGroup => "nome_grupo_economico",
        }
    }
}

/// Natural key of a dimension row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NaturalKey {
    /// First day of the month.
    Month(NaiveDate),
    Service(Service),
    /// Already normalized with [`group_key`].
    Group(String),
}

impl NaturalKey {
    pub fn dimension(&self) -> Dimension {
        match self {
            NaturalKey::Month(_) => Dimension::Time,
            NaturalKey::Service(_) => Dimension::Service,
            NaturalKey::Group(_) => Dimension::EconomicGroup,
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NaturalKey::Month(d) => write!(f, "time {}", d.format("%Y-%m")),
            NaturalKey::Service(s) => write!(f, "service {}", s),
            NaturalKey::Group(g) => write!(f, "economic group {}", g),
        }
    }
}

/// A fact row already present in the destination.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFact {
    pub id: i64,
    pub metrics: Metrics,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Every (natural key, surrogate key) pair of one dimension.
    async fn dimension_keys(&self, dimension: Dimension) -> Result<Vec<(NaturalKey, i32)>>;

    /// Insert the natural key unless present. `true` when a row was written.
    async fn insert_dimension(&self, key: &NaturalKey) -> Result<bool>;

    async fn find_dimension(&self, key: &NaturalKey) -> Result<Option<i32>>;

    async fn find_fact(&self, keys: DimensionKeys) -> Result<Option<StoredFact>>;

    async fn insert_fact(&self, keys: DimensionKeys, metrics: &Metrics) -> Result<()>;

    async fn update_fact(&self, id: i64, metrics: &Metrics) -> Result<()>;
}

// =============================================================================
// PostgreSQL
// =============================================================================

pub struct PgWarehouse {
    pool: PgPool,
    schema: String,
}

impl PgWarehouse {
    /// One connection per run; statements execute strictly in order.
    pub async fn connect(db_url: &str, schema: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(db_url)
            .await?;
        info!(schema, "connected to warehouse");
        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    /// Star-schema tables missing from the destination.
    pub async fn missing_tables(&self) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        let tables = Dimension::ALL
            .iter()
            .map(|d| d.table())
            .chain(std::iter::once(FACT_TABLE));
        for table in tables {
            let qualified = self.qualified(table);
            let (found,): (Option<String>,) = sqlx::query_as("SELECT to_regclass($1)::text")
                .bind(&qualified)
                .fetch_one(&self.pool)
                .await?;
            if found.is_none() {
                missing.push(qualified);
            }
        }
        Ok(missing)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", self.schema, table)
    }

    fn metric_columns() -> Vec<&'static str> {
        METRIC_FIELDS.iter().map(|f| f.column()).collect()
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn dimension_keys(&self, dimension: Dimension) -> Result<Vec<(NaturalKey, i32)>> {
        let table = self.qualified(dimension.table());
        let id = dimension.id_column();
        let key = dimension.key_column();

        let keys = match dimension {
            Dimension::Time => {
                let rows: Vec<(i32, NaiveDate)> =
                    sqlx::query_as(&format!("SELECT {id}::int4, {key} FROM {table}"))
                        .fetch_all(&self.pool)
                        .await?;
                rows.into_iter()
                    .map(|(id, date)| (NaturalKey::Month(date), id))
                    .collect()
            }
            Dimension::Service | Dimension::EconomicGroup => {
                let rows: Vec<(i32, String)> =
                    sqlx::query_as(&format!("SELECT {id}::int4, {key} FROM {table}"))
                        .fetch_all(&self.pool)
                        .await?;
                rows.into_iter()
                    .filter_map(|(id, name)| {
                        let natural = if dimension == Dimension::Service {
                            match Service::parse(&name) {
                                Some(service) => NaturalKey::Service(service),
                                None => {
                                    warn!(table = %table, name = %name, "ignoring unknown service row");
                                    return None;
                                }
                            }
                        } else {
                            NaturalKey::Group(group_key(&name))
                        };
                        Some((natural, id))
                    })
                    .collect()
            }
        };
        Ok(keys)
    }

    async fn insert_dimension(&self, key: &NaturalKey) -> Result<bool> {
        let table = self.qualified(key.dimension().table());
        let result = match key {
            NaturalKey::Month(date) => {
                sqlx::query(&format!(
                    "INSERT INTO {table} (ano, mes, data_completa) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING"
                ))
                .bind(date.year())
                .bind(date.month() as i32)
                .bind(*date)
                .execute(&self.pool)
                .await?
            }
            NaturalKey::Service(service) => {
                sqlx::query(&format!(
                    "INSERT INTO {table} (nome_servico) VALUES ($1) ON CONFLICT DO NOTHING"
                ))
                .bind(service.code())
                .execute(&self.pool)
                .await?
            }
            NaturalKey::Group(name) => {
                sqlx::query(&format!(
                    "INSERT INTO {table} (nome_grupo_economico) VALUES ($1) ON CONFLICT DO NOTHING"
                ))
                .bind(name)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    async fn find_dimension(&self, key: &NaturalKey) -> Result<Option<i32>> {
        let dimension = key.dimension();
        let sql = format!(
            "SELECT {}::int4 FROM {} WHERE {} = $1",
            dimension.id_column(),
            self.qualified(dimension.table()),
            dimension.key_column()
        );
        let query = sqlx::query_as::<_, (i32,)>(&sql);
        let row = match key {
            NaturalKey::Month(date) => query.bind(*date).fetch_optional(&self.pool).await?,
            NaturalKey::Service(service) => {
                query.bind(service.code()).fetch_optional(&self.pool).await?
            }
            NaturalKey::Group(name) => query.bind(name).fetch_optional(&self.pool).await?,
        };
        Ok(row.map(|(id,)| id))
    }

    async fn find_fact(&self, keys: DimensionKeys) -> Result<Option<StoredFact>> {
        let metric_list = Self::metric_columns()
            .iter()
            .map(|c| format!("{c}::float8"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id_fato::int8, {metric_list} FROM {} \
             WHERE id_tempo = $1 AND id_servico = $2 AND id_grupo_economico = $3 \
             ORDER BY id_fato LIMIT 1",
            self.qualified(FACT_TABLE)
        );

        let row = sqlx::query(&sql)
            .bind(keys.time_id)
            .bind(keys.service_id)
            .bind(keys.group_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut values = [None; METRIC_COUNT];
        for (i, value) in values.iter_mut().enumerate() {
            *value = row.try_get::<Option<f64>, _>(i + 1)?;
        }
        Ok(Some(StoredFact {
            id: row.try_get(0)?,
            metrics: Metrics::from_values(values),
        }))
    }

    async fn insert_fact(&self, keys: DimensionKeys, metrics: &Metrics) -> Result<()> {
        let columns = Self::metric_columns();
        let placeholders = (4..4 + columns.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} (id_tempo, id_servico, id_grupo_economico, {}) VALUES ($1, $2, $3, {})",
            self.qualified(FACT_TABLE),
            columns.join(", "),
            placeholders
        );

        let mut q = sqlx::query(&sql)
            .bind(keys.time_id)
            .bind(keys.service_id)
            .bind(keys.group_id);
        for value in metrics.values() {
            q = q.bind(*value);
        }
        q.execute(&self.pool).await?;
        Ok(())
    }

    async fn update_fact(&self, id: i64, metrics: &Metrics) -> Result<()> {
        let columns = Self::metric_columns();
        let assignments = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{c} = ${}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE id_fato = ${}",
            self.qualified(FACT_TABLE),
            assignments,
            columns.len() + 1
        );

        let mut q = sqlx::query(&sql);
        for value in metrics.values() {
            q = q.bind(*value);
        }
        q.bind(id).execute(&self.pool).await?;
        Ok(())
    }
}
