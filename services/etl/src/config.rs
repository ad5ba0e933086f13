//! Runtime configuration: environment variables and the sources file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Published IDA spreadsheets loaded when no sources file is given.
const DEFAULT_SOURCES: &[(&str, i32, &str)] = &[
    ("SMP", 2019, "https://www.anatel.gov.br/dadosabertos/PDA/IDA/SMP2019.ods"),
    ("STFC", 2019, "https://www.anatel.gov.br/dadosabertos/PDA/IDA/STFC2019.ods"),
    ("SCM", 2019, "https://www.anatel.gov.br/dadosabertos/PDA/IDA/SCM2019.ods"),
];

#[derive(Debug, Clone)]
pub struct Config {
    /// `None` when neither `DB_URL` nor `DB_HOST` is set; only dry runs accept that.
    pub db_url: Option<String>,
    pub db_schema: String,
    pub raw_fs_dir: PathBuf,
    pub rate_limit_ms: u64,
    pub http_timeout: Duration,
    pub accept_invalid_certs: bool,
    pub json_logs: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let db_url = match std::env::var("DB_URL") {
            Ok(url) => Some(url),
            Err(_) if std::env::var("DB_HOST").is_ok() => Some(postgres_url_from_parts()?),
            Err(_) => None,
        };

        let db_schema = std::env::var("DB_SCHEMA").unwrap_or_else(|_| "ida_datamart".to_string());
        if !is_sql_identifier(&db_schema) {
            anyhow::bail!("DB_SCHEMA '{}' is not a plain SQL identifier", db_schema);
        }

        Ok(Self {
            db_url,
            db_schema,
            raw_fs_dir: PathBuf::from(
                std::env::var("RAW_FS_DIR").unwrap_or_else(|_| "./data/raw".to_string()),
            ),
            rate_limit_ms: std::env::var("RATE_LIMIT_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
            http_timeout: Duration::from_secs(
                std::env::var("HTTP_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "120".to_string())
                    .parse()
                    .unwrap_or(120),
            ),
            accept_invalid_certs: env_flag("ACCEPT_INVALID_CERTS"),
            json_logs: std::env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }
}

impl Config {
    pub fn require_db_url(&self) -> Result<&str> {
        self.db_url
            .as_deref()
            .context("DB_URL or DB_HOST env var missing")
    }
}

fn postgres_url_from_parts() -> Result<String> {
    let host = std::env::var("DB_HOST").context("DB_HOST env var missing")?;
    let port = std::env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string());
    let name = std::env::var("DB_NAME").context("DB_NAME env var missing")?;
    let user = std::env::var("DB_USER").context("DB_USER env var missing")?;
    let password = std::env::var("DB_PASSWORD").context("DB_PASSWORD env var missing")?;
    Ok(format!(
        "postgres://{}:{}@{}:{}/{}",
        user, password, host, port, name
    ))
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Schema names are spliced into SQL text, so only `[A-Za-z_][A-Za-z0-9_]*` passes.
pub fn is_sql_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// =============================================================================
// Source descriptors
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SourcesConfig {
    pub version: String,
    pub sources: Vec<SourceFile>,
}

/// One remote spreadsheet to ingest.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SourceFile {
    /// Service tag for files that cover a single service (SMP, STFC, SCM).
    #[serde(default)]
    pub service: Option<String>,
    pub year: i32,
    /// Set when the file covers a single reporting month.
    #[serde(default)]
    pub month: Option<u32>,
    pub url: String,
    /// Worksheet to read; the first sheet with a recognizable header otherwise.
    #[serde(default)]
    pub sheet: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl SourceFile {
    /// Stable human label, also used to name cache files.
    pub fn label(&self) -> String {
        let mut label = match &self.service {
            Some(service) => format!("{}-{}", service.trim().to_uppercase(), self.year),
            None => self.year.to_string(),
        };
        if let Some(month) = self.month {
            label.push_str(&format!("-{:02}", month));
        }
        label
    }
}

pub fn default_sources() -> Vec<SourceFile> {
    DEFAULT_SOURCES
        .iter()
        .map(|(service, year, url)| SourceFile {
            service: Some(service.to_string()),
            year: *year,
            month: None,
            url: url.to_string(),
            sheet: None,
            enabled: true,
        })
        .collect()
}

pub fn load_sources_config(path: &Path) -> Result<SourcesConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read sources config {}", path.display()))?;
    parse_sources_config(&content)
}

pub fn parse_sources_config(content: &str) -> Result<SourcesConfig> {
    let config: SourcesConfig =
        serde_json::from_str(content).context("Failed to parse sources config")?;
    for source in &config.sources {
        if let Some(month) = source.month {
            if !(1..=12).contains(&month) {
                anyhow::bail!("Source {} has invalid month {}", source.url, month);
            }
        }
    }
    Ok(config)
}

/// Apply the CLI filters to the configured source list.
pub fn select_sources(
    sources: Vec<SourceFile>,
    service: Option<&str>,
    year: Option<i32>,
) -> Vec<SourceFile> {
    sources
        .into_iter()
        .filter(|s| s.enabled)
        .filter(|s| match service {
            Some(wanted) => s
                .service
                .as_deref()
                .map(|svc| svc.eq_ignore_ascii_case(wanted))
                .unwrap_or(false),
            None => true,
        })
        .filter(|s| year.map(|y| s.year == y).unwrap_or(true))
        .collect()
}
