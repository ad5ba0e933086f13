//! Schema normalizer: maps every historical column convention onto the
//! canonical fact shape.
//!
//! Each publication vintage is a [`FormatVersion`] variant holding an explicit
//! raw-column → [`MetricField`] table. The variant is picked once per file by
//! structural match against the header, then applied row by row.
//!
//! Rates are stored on a 0–100 scale. Vintages that publish fractions of one
//! are multiplied by 100 (text cells with a `%` suffix are already 0–100).

use chrono::{Datelike, NaiveDate};
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::config::SourceFile;
use crate::error::NormalizationError;
use crate::sheet::{parse_year_month, ParsedSheet, RawCell, RawRecord};

// =============================================================================
// Canonical fact columns
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Index,
    Count,
    Rate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricField {
    IndicadorDesempenhoAtendimento,
    IndiceReclamacoes,
    QuantidadeAcessosServico,
    QuantidadeReabertas,
    QuantidadeReclamacoes,
    QuantidadeReclamacoesPeriodo,
    QuantidadeRespondidas,
    QuantidadeSolRespondidas5Dias,
    QuantidadeSolRespondidasPeriodo,
    TaxaReabertas,
    TaxaRespondidas5DiasUteis,
    TaxaRespondidasPeriodo,
}

pub const METRIC_COUNT: usize = 12;

/// Fact-table column order.
pub const METRIC_FIELDS: [MetricField; METRIC_COUNT] = [
    MetricField::IndicadorDesempenhoAtendimento,
    MetricField::IndiceReclamacoes,
    MetricField::QuantidadeAcessosServico,
    MetricField::QuantidadeReabertas,
    MetricField::QuantidadeReclamacoes,
    MetricField::QuantidadeReclamacoesPeriodo,
    MetricField::QuantidadeRespondidas,
    MetricField::QuantidadeSolRespondidas5Dias,
    MetricField::QuantidadeSolRespondidasPeriodo,
    MetricField::TaxaReabertas,
    MetricField::TaxaRespondidas5DiasUteis,
    MetricField::TaxaRespondidasPeriodo,
];

impl MetricField {
    pub fn column(self) -> &'static str {
        match self {
            MetricField::IndicadorDesempenhoAtendimento => "indicador_desempenho_atendimento",
            MetricField::IndiceReclamacoes => "indice_reclamacoes",
            MetricField::QuantidadeAcessosServico => "quantidade_acessos_servico",
            MetricField::QuantidadeReabertas => "quantidade_reabertas",
            MetricField::QuantidadeReclamacoes => "quantidade_reclamacoes",
            MetricField::QuantidadeReclamacoesPeriodo => "quantidade_reclamacoes_periodo",
            MetricField::QuantidadeRespondidas => "quantidade_respondidas",
            MetricField::QuantidadeSolRespondidas5Dias => "quantidade_sol_respondidas_5_dias",
            MetricField::QuantidadeSolRespondidasPeriodo => "quantidade_sol_respondidas_periodo",
            MetricField::TaxaReabertas => "taxa_reabertas",
            MetricField::TaxaRespondidas5DiasUteis => "taxa_respondidas_5_dias_uteis",
            MetricField::TaxaRespondidasPeriodo => "taxa_respondidas_periodo",
        }
    }

    pub fn kind(self) -> MetricKind {
        match self {
            MetricField::IndicadorDesempenhoAtendimento | MetricField::IndiceReclamacoes => {
                MetricKind::Index
            }
            MetricField::TaxaReabertas
            | MetricField::TaxaRespondidas5DiasUteis
            | MetricField::TaxaRespondidasPeriodo => MetricKind::Rate,
            _ => MetricKind::Count,
        }
    }

    fn index(self) -> usize {
        METRIC_FIELDS
            .iter()
            .position(|f| *f == self)
            .unwrap_or_default()
    }
}

/// The twelve nullable measurements of one fact row.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Metrics([Option<f64>; METRIC_COUNT]);

impl Metrics {
    pub fn get(&self, field: MetricField) -> Option<f64> {
        self.0[field.index()]
    }

    pub fn set(&mut self, field: MetricField, value: Option<f64>) {
        self.0[field.index()] = value;
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|v| v.is_none())
    }

    /// Values in [`METRIC_FIELDS`] order.
    pub fn values(&self) -> &[Option<f64>; METRIC_COUNT] {
        &self.0
    }

    pub fn from_values(values: [Option<f64>; METRIC_COUNT]) -> Self {
        Metrics(values)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub source_row: usize,
    /// Always the first day of the month.
    pub reference_month: NaiveDate,
    pub service_name: String,
    pub economic_group_name: String,
    pub metrics: Metrics,
}

// =============================================================================
// Format versions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScale {
    /// Published as 0–100.
    Percent,
    /// Published as a fraction of one.
    Fraction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeriodColumns {
    YearAndMonth { year: &'static str, month: &'static str },
    Single(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    /// Open-data workbooks: one row per (group, variable), one column per
    /// month, pivoted by the sheet parser. Service comes from the source.
    VariableRows,
    /// Long layout with year and month columns and short metric headings.
    MonthlyColumns,
    /// Snake-case database export with a single period column; rates as fractions.
    SnakeCaseExport,
}

pub const FORMAT_VERSIONS: [FormatVersion; 3] = [
    FormatVersion::VariableRows,
    FormatVersion::MonthlyColumns,
    FormatVersion::SnakeCaseExport,
];

use MetricField::*;

const VARIABLE_ROWS_METRICS: &[(&str, MetricField)] = &[
    ("INDICADOR DE DESEMPENHO NO ATENDIMENTO (IDA)", IndicadorDesempenhoAtendimento),
    ("INDICE DE RECLAMACOES", IndiceReclamacoes),
    ("QUANTIDADE DE ACESSOS EM SERVICO", QuantidadeAcessosServico),
    ("QUANTIDADE DE REABERTAS", QuantidadeReabertas),
    ("QUANTIDADE DE RECLAMACOES", QuantidadeReclamacoes),
    ("QUANTIDADE DE RECLAMACOES NO PERIODO", QuantidadeReclamacoesPeriodo),
    ("QUANTIDADE DE RESPONDIDAS", QuantidadeRespondidas),
    ("QUANTIDADE DE SOL. RESPONDIDAS EM ATE 5 DIAS", QuantidadeSolRespondidas5Dias),
    ("QUANTIDADE DE SOL. RESPONDIDAS NO PERIODO", QuantidadeSolRespondidasPeriodo),
    ("TAXA DE REABERTAS", TaxaReabertas),
    ("TAXA DE RESPONDIDAS EM 5 DIAS UTEIS", TaxaRespondidas5DiasUteis),
    ("TAXA DE RESPONDIDAS NO PERIODO", TaxaRespondidasPeriodo),
];

const MONTHLY_COLUMNS_METRICS: &[(&str, MetricField)] = &[
    ("IDA", IndicadorDesempenhoAtendimento),
    ("INDICADOR DE DESEMPENHO NO ATENDIMENTO (IDA)", IndicadorDesempenhoAtendimento),
    ("INDICE DE RECLAMACOES", IndiceReclamacoes),
    ("ACESSOS EM SERVICO", QuantidadeAcessosServico),
    ("QUANTIDADE DE ACESSOS EM SERVICO", QuantidadeAcessosServico),
    ("REABERTAS", QuantidadeReabertas),
    ("QUANTIDADE DE REABERTAS", QuantidadeReabertas),
    ("RECLAMACOES", QuantidadeReclamacoes),
    ("QUANTIDADE DE RECLAMACOES", QuantidadeReclamacoes),
    ("RECLAMACOES NO PERIODO", QuantidadeReclamacoesPeriodo),
    ("QUANTIDADE DE RECLAMACOES NO PERIODO", QuantidadeReclamacoesPeriodo),
    ("RESPONDIDAS", QuantidadeRespondidas),
    ("QUANTIDADE DE RESPONDIDAS", QuantidadeRespondidas),
    ("RESPONDIDAS EM ATE 5 DIAS", QuantidadeSolRespondidas5Dias),
    ("QUANTIDADE DE SOL. RESPONDIDAS EM ATE 5 DIAS", QuantidadeSolRespondidas5Dias),
    ("RESPONDIDAS NO PERIODO", QuantidadeSolRespondidasPeriodo),
    ("QUANTIDADE DE SOL. RESPONDIDAS NO PERIODO", QuantidadeSolRespondidasPeriodo),
    ("TAXA DE REABERTAS", TaxaReabertas),
    ("TAXA DE RESPONDIDAS EM 5 DIAS UTEIS", TaxaRespondidas5DiasUteis),
    ("TAXA DE RESPONDIDAS NO PERIODO", TaxaRespondidasPeriodo),
];

const SNAKE_CASE_METRICS: &[(&str, MetricField)] = &[
    ("IDA", IndicadorDesempenhoAtendimento),
    ("IND_RECLAMACOES", IndiceReclamacoes),
    ("QTD_ACESSOS", QuantidadeAcessosServico),
    ("QTD_REABERTAS", QuantidadeReabertas),
    ("QTD_RECLAMACOES", QuantidadeReclamacoes),
    ("QTD_RECLAMACOES_PERIODO", QuantidadeReclamacoesPeriodo),
    ("QTD_RESPONDIDAS", QuantidadeRespondidas),
    ("QTD_RESP_5_DIAS", QuantidadeSolRespondidas5Dias),
    ("QTD_RESP_PERIODO", QuantidadeSolRespondidasPeriodo),
    ("TX_REABERTAS", TaxaReabertas),
    ("TX_RESP_5_DIAS_UTEIS", TaxaRespondidas5DiasUteis),
    ("TX_RESP_PERIODO", TaxaRespondidasPeriodo),
];

impl FormatVersion {
    pub fn name(self) -> &'static str {
        match self {
            FormatVersion::VariableRows => "variable_rows",
            FormatVersion::MonthlyColumns => "monthly_columns",
            FormatVersion::SnakeCaseExport => "snake_case_export",
        }
    }

    fn required_columns(self) -> &'static [&'static str] {
        match self {
            FormatVersion::VariableRows => &["GRUPO ECONOMICO", "MES"],
            FormatVersion::MonthlyColumns => &["ANO", "MES", "SERVICO", "GRUPO ECONOMICO"],
            FormatVersion::SnakeCaseExport => &["PERIODO", "SERVICO", "GRUPO_ECONOMICO"],
        }
    }

    fn metric_columns(self) -> &'static [(&'static str, MetricField)] {
        match self {
            FormatVersion::VariableRows => VARIABLE_ROWS_METRICS,
            FormatVersion::MonthlyColumns => MONTHLY_COLUMNS_METRICS,
            FormatVersion::SnakeCaseExport => SNAKE_CASE_METRICS,
        }
    }

    pub fn rate_scale(self) -> RateScale {
        match self {
            FormatVersion::SnakeCaseExport => RateScale::Fraction,
            _ => RateScale::Percent,
        }
    }

    fn group_column(self) -> &'static str {
        match self {
            FormatVersion::SnakeCaseExport => "GRUPO_ECONOMICO",
            _ => "GRUPO ECONOMICO",
        }
    }

    /// Workbooks split per service usually omit this column; the source
    /// descriptor supplies the service then.
    fn service_column(self) -> &'static str {
        "SERVICO"
    }

    fn period_columns(self) -> PeriodColumns {
        match self {
            FormatVersion::VariableRows => PeriodColumns::Single("MES"),
            FormatVersion::MonthlyColumns => PeriodColumns::YearAndMonth {
                year: "ANO",
                month: "MES",
            },
            FormatVersion::SnakeCaseExport => PeriodColumns::Single("PERIODO"),
        }
    }

    /// Pick the variant whose identity columns are all present and whose
    /// metric table covers the most columns; ties go to the variant with more
    /// identity columns.
    pub fn detect(columns: &BTreeSet<String>) -> Result<FormatVersion, NormalizationError> {
        FORMAT_VERSIONS
            .iter()
            .filter(|v| v.required_columns().iter().all(|c| columns.contains(*c)))
            .map(|v| {
                let matched = v
                    .metric_columns()
                    .iter()
                    .filter(|(raw, _)| columns.contains(*raw))
                    .count();
                (*v, matched)
            })
            .filter(|(_, matched)| *matched > 0)
            .max_by_key(|(v, matched)| (*matched, v.required_columns().len()))
            .map(|(v, _)| v)
            .ok_or_else(|| {
                NormalizationError::Fatal(format!(
                    "header matches no known vintage (columns: {:?})",
                    columns
                ))
            })
    }
}

// =============================================================================
// Row normalization
// =============================================================================

/// Per-file facts the rows themselves may not carry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceContext {
    pub service: Option<String>,
    pub year: Option<i32>,
    pub month: Option<u32>,
}

impl From<&SourceFile> for SourceContext {
    fn from(source: &SourceFile) -> Self {
        Self {
            service: source.service.clone(),
            year: Some(source.year),
            month: source.month,
        }
    }
}

/// Map one raw record. `Err(Droppable)` means the row is skipped.
pub fn normalize_record(
    version: FormatVersion,
    record: &RawRecord,
    ctx: &SourceContext,
) -> Result<NormalizedRecord, NormalizationError> {
    let dropped = |reason: String| NormalizationError::Droppable {
        row: record.row,
        reason,
    };

    let economic_group_name = record
        .get(version.group_column())
        .and_then(|c| c.as_text())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| dropped("missing economic group".to_string()))?;

    let service_name = record
        .get(version.service_column())
        .and_then(|c| c.as_text())
        .or_else(|| ctx.service.clone())
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| dropped("missing service identifier".to_string()))?;

    let (year, month) = record_period(version, record, ctx).map_err(dropped)?;
    let reference_month = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| dropped(format!("invalid period {}-{}", year, month)))?;

    let mut metrics = Metrics::default();
    for (raw, field) in version.metric_columns() {
        if metrics.get(*field).is_some() {
            continue;
        }
        let Some(cell) = record.get(raw) else {
            continue;
        };
        let value = parse_metric(cell, field.kind(), version.rate_scale())
            .map_err(|e| dropped(format!("column '{}': {}", raw, e)))?;
        metrics.set(*field, value);
    }

    if metrics.is_empty() {
        return Err(dropped("no metric values".to_string()));
    }

    Ok(NormalizedRecord {
        source_row: record.row,
        reference_month,
        service_name,
        economic_group_name,
        metrics,
    })
}

fn record_period(
    version: FormatVersion,
    record: &RawRecord,
    ctx: &SourceContext,
) -> Result<(i32, u32), String> {
    let from_row = match version.period_columns() {
        PeriodColumns::YearAndMonth { year, month } => match (record.get(year), record.get(month)) {
            (Some(y), Some(m)) => {
                // some exports repeat the full period in the month column
                if let Some(ym) = cell_year_month(m) {
                    Some(ym)
                } else {
                    let y = cell_year(y).ok_or_else(|| format!("unparseable year {:?}", y))?;
                    let m = cell_month(m).ok_or_else(|| format!("unparseable month {:?}", m))?;
                    Some((y, m))
                }
            }
            (None, None) => None,
            _ => return Err("incomplete period".to_string()),
        },
        PeriodColumns::Single(col) => match record.get(col) {
            Some(cell) => Some(
                cell_year_month(cell).ok_or_else(|| format!("unparseable period {:?}", cell))?,
            ),
            None => None,
        },
    };

    match (from_row, ctx.year, ctx.month) {
        (Some(ym), _, _) => Ok(ym),
        (None, Some(y), Some(m)) => Ok((y, m)),
        _ => Err("missing period".to_string()),
    }
}

fn cell_year(cell: &RawCell) -> Option<i32> {
    let year = match cell {
        RawCell::Number(n) if n.fract() == 0.0 => *n as i32,
        RawCell::Text(s) => s.trim().parse().ok()?,
        RawCell::Date(d) => d.year(),
        _ => return None,
    };
    (1990..=2100).contains(&year).then_some(year)
}

const MONTH_NAMES: [&str; 12] = [
    "JANEIRO", "FEVEREIRO", "MARCO", "ABRIL", "MAIO", "JUNHO", "JULHO", "AGOSTO", "SETEMBRO",
    "OUTUBRO", "NOVEMBRO", "DEZEMBRO",
];

fn cell_month(cell: &RawCell) -> Option<u32> {
    let month = match cell {
        RawCell::Number(n) if n.fract() == 0.0 => *n as u32,
        RawCell::Date(d) => d.month(),
        RawCell::Text(s) => {
            let s = crate::sheet::normalize_header(s);
            match s.parse::<u32>() {
                Ok(n) => n,
                Err(_) => {
                    let idx = MONTH_NAMES
                        .iter()
                        .position(|name| *name == s || (s.len() == 3 && name.starts_with(&s)))?;
                    idx as u32 + 1
                }
            }
        }
        _ => return None,
    };
    (1..=12).contains(&month).then_some(month)
}

fn cell_year_month(cell: &RawCell) -> Option<(i32, u32)> {
    match cell {
        RawCell::Date(d) => Some((d.year(), d.month())),
        RawCell::Text(s) => parse_year_month(s),
        // yyyymm
        RawCell::Number(n) if n.fract() == 0.0 && (199001.0..=210012.0).contains(n) => {
            let n = *n as i64;
            let (y, m) = ((n / 100) as i32, (n % 100) as u32);
            (1..=12).contains(&m).then_some((y, m))
        }
        _ => None,
    }
}

/// Cell tokens that mean "no measurement".
const NULL_TOKENS: &[&str] = &["-", "–", "—", "N/A", "NA", "ND", "N/D", "..."];

/// Parse a metric cell. Blank-like cells are `None`, never zero.
pub fn parse_metric(
    cell: &RawCell,
    kind: MetricKind,
    scale: RateScale,
) -> Result<Option<f64>, String> {
    let (value, is_percent_text) = match cell {
        RawCell::Empty => return Ok(None),
        RawCell::Number(n) if n.is_finite() => (*n, false),
        RawCell::Number(n) => return Err(format!("non-finite number {}", n)),
        // stored as a fraction whatever the vintage's scale
        RawCell::Percent(f) if f.is_finite() => (round_scaled(f * 100.0), true),
        RawCell::Percent(f) => return Err(format!("non-finite percentage {}", f)),
        RawCell::Date(d) => return Err(format!("date {} where a number was expected", d)),
        RawCell::Text(s) => {
            let trimmed = s.trim();
            let is_percent = trimmed.ends_with('%');
            match parse_decimal(trimmed.trim_end_matches('%'))? {
                Some(v) => (v, is_percent),
                None => return Ok(None),
            }
        }
    };

    if kind == MetricKind::Rate && scale == RateScale::Fraction && !is_percent_text {
        Ok(Some(round_scaled(value * 100.0)))
    } else {
        Ok(Some(value))
    }
}

fn round_scaled(v: f64) -> f64 {
    (v * 1e10).round() / 1e10
}

/// Locale-tolerant decimal: `1.234,56`, `78,5`, `1234.5`, `1.234.567`.
pub fn parse_decimal(s: &str) -> Result<Option<f64>, String> {
    let cleaned: String = s
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .collect();
    if cleaned.is_empty() || NULL_TOKENS.contains(&cleaned.to_uppercase().as_str()) {
        return Ok(None);
    }

    let commas = cleaned.matches(',').count();
    let dots = cleaned.matches('.').count();
    let canonical = match (commas, dots) {
        (0, 0) => cleaned.clone(),
        (0, 1) => cleaned.clone(),
        (0, _) => cleaned.replace('.', ""),
        (1, 0) => cleaned.replace(',', "."),
        (_, 0) => cleaned.replace(',', ""),
        _ => {
            let last_comma = cleaned.rfind(',').unwrap_or(0);
            let last_dot = cleaned.rfind('.').unwrap_or(0);
            if last_comma > last_dot {
                cleaned.replace('.', "").replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
    };

    match canonical.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(format!("unparseable number '{}'", s.trim())),
    }
}

// =============================================================================
// Whole-sheet normalization
// =============================================================================

#[derive(Debug)]
pub struct NormalizedBatch {
    pub version: FormatVersion,
    pub records: Vec<NormalizedRecord>,
    pub rows_seen: usize,
    pub rows_dropped: usize,
}

/// Detect the vintage and normalize every record. Droppable rows are logged
/// and counted; a file with no surviving row is a fatal error.
pub fn normalize_sheet(
    sheet: &ParsedSheet,
    ctx: &SourceContext,
) -> Result<NormalizedBatch, NormalizationError> {
    let version = FormatVersion::detect(&sheet.columns())?;
    debug!(version = version.name(), sheet = %sheet.sheet_name, "format detected");

    let mut records = Vec::new();
    let mut rows_seen = 0;
    let mut rows_dropped = 0;

    for raw in sheet.records() {
        rows_seen += 1;
        match normalize_record(version, &raw, ctx) {
            Ok(record) => records.push(record),
            Err(e) => {
                rows_dropped += 1;
                warn!(sheet = %sheet.sheet_name, error = %e, "row dropped");
            }
        }
    }

    if records.is_empty() {
        return Err(NormalizationError::Fatal(format!(
            "no rows survived normalization ({} seen, {} dropped)",
            rows_seen, rows_dropped
        )));
    }

    Ok(NormalizedBatch {
        version,
        records,
        rows_seen,
        rows_dropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheet::parse_csv;
    use std::collections::BTreeMap;

    fn record(row: usize, cells: &[(&str, RawCell)]) -> RawRecord {
        RawRecord {
            row,
            cells: cells
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn text(s: &str) -> RawCell {
        RawCell::Text(s.to_string())
    }

    fn columns(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    // -------------------------------------------------------------------------
    // NUMBER PARSING
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_decimal_locale_variants() {
        assert_eq!(parse_decimal("78,5").unwrap(), Some(78.5));
        assert_eq!(parse_decimal("78.5").unwrap(), Some(78.5));
        assert_eq!(parse_decimal("1.234,56").unwrap(), Some(1234.56));
        assert_eq!(parse_decimal("1,234.56").unwrap(), Some(1234.56));
        assert_eq!(parse_decimal("1.234.567").unwrap(), Some(1234567.0));
        assert_eq!(parse_decimal("1 234,5").unwrap(), Some(1234.5));
        assert_eq!(parse_decimal("0").unwrap(), Some(0.0));
        assert_eq!(parse_decimal("-3,5").unwrap(), Some(-3.5));
    }

    #[test]
    fn test_parse_decimal_null_tokens() {
        for token in ["", "  ", "-", "–", "N/A", "nd", "..."] {
            assert_eq!(parse_decimal(token).unwrap(), None, "token {:?}", token);
        }
    }

    #[test]
    fn test_parse_decimal_rejects_garbage() {
        assert!(parse_decimal("abc").is_err());
        assert!(parse_decimal("NaN").is_err());
        assert!(parse_decimal("inf").is_err());
    }

    #[test]
    fn test_blank_is_null_not_zero() {
        let blank = parse_metric(&RawCell::Empty, MetricKind::Count, RateScale::Percent).unwrap();
        let zero = parse_metric(&RawCell::Number(0.0), MetricKind::Count, RateScale::Percent).unwrap();
        assert_eq!(blank, None);
        assert_eq!(zero, Some(0.0));
    }

    #[test]
    fn test_rate_scaling() {
        let frac = parse_metric(&RawCell::Number(0.785), MetricKind::Rate, RateScale::Fraction);
        assert_eq!(frac.unwrap(), Some(78.5));

        // explicit percent text is already 0–100
        let pct = parse_metric(&text("78,5%"), MetricKind::Rate, RateScale::Fraction);
        assert_eq!(pct.unwrap(), Some(78.5));

        let percent = parse_metric(&RawCell::Number(78.5), MetricKind::Rate, RateScale::Percent);
        assert_eq!(percent.unwrap(), Some(78.5));

        // counts are never rescaled
        let count = parse_metric(&RawCell::Number(12.0), MetricKind::Count, RateScale::Fraction);
        assert_eq!(count.unwrap(), Some(12.0));
    }

    #[test]
    fn test_percentage_cells_scale_in_every_vintage() {
        for scale in [RateScale::Percent, RateScale::Fraction] {
            let pct = parse_metric(&RawCell::Percent(0.785), MetricKind::Rate, scale);
            assert_eq!(pct.unwrap(), Some(78.5));
        }
        assert!(parse_metric(&RawCell::Percent(f64::NAN), MetricKind::Rate, RateScale::Percent).is_err());
    }

    // -------------------------------------------------------------------------
    // VERSION DETECTION
    // -------------------------------------------------------------------------

    #[test]
    fn test_detect_monthly_columns_over_variable_rows() {
        let cols = columns(&[
            "ANO",
            "MES",
            "SERVICO",
            "GRUPO ECONOMICO",
            "TAXA DE RESPONDIDAS EM 5 DIAS UTEIS",
        ]);
        assert_eq!(FormatVersion::detect(&cols).unwrap(), FormatVersion::MonthlyColumns);
    }

    #[test]
    fn test_detect_variable_rows() {
        let cols = columns(&[
            "GRUPO ECONOMICO",
            "MES",
            "INDICADOR DE DESEMPENHO NO ATENDIMENTO (IDA)",
            "TAXA DE REABERTAS",
        ]);
        assert_eq!(FormatVersion::detect(&cols).unwrap(), FormatVersion::VariableRows);
    }

    #[test]
    fn test_detect_snake_case_superset() {
        let cols = columns(&["PERIODO", "SERVICO", "GRUPO_ECONOMICO", "IDA", "TX_REABERTAS", "UF"]);
        assert_eq!(FormatVersion::detect(&cols).unwrap(), FormatVersion::SnakeCaseExport);
    }

    #[test]
    fn test_detect_unknown_is_fatal() {
        let err = FormatVersion::detect(&columns(&["GRUPO ECONOMICO", "FOO"])).unwrap_err();
        assert!(matches!(err, NormalizationError::Fatal(_)));
    }

    // -------------------------------------------------------------------------
    // RECORD NORMALIZATION
    // -------------------------------------------------------------------------

    #[test]
    fn test_monthly_columns_record() {
        let raw = record(
            5,
            &[
                ("ANO", RawCell::Number(2023.0)),
                ("MES", RawCell::Number(3.0)),
                ("SERVICO", text("smp")),
                ("GRUPO ECONOMICO", text("  VIVO ")),
                ("TAXA DE RESPONDIDAS EM 5 DIAS UTEIS", text("78,5")),
                ("IDA", RawCell::Empty),
            ],
        );
        let rec = normalize_record(FormatVersion::MonthlyColumns, &raw, &SourceContext::default()).unwrap();
        assert_eq!(rec.reference_month, NaiveDate::from_ymd_opt(2023, 3, 1).unwrap());
        assert_eq!(rec.service_name, "SMP");
        assert_eq!(rec.economic_group_name, "VIVO");
        assert_eq!(rec.metrics.get(TaxaRespondidas5DiasUteis), Some(78.5));
        assert_eq!(rec.metrics.get(IndicadorDesempenhoAtendimento), None);
        assert_eq!(rec.source_row, 5);
    }

    #[test]
    fn test_month_names() {
        assert_eq!(cell_month(&text("Março")), Some(3));
        assert_eq!(cell_month(&text("DEZ")), Some(12));
        assert_eq!(cell_month(&text("fev")), Some(2));
        assert_eq!(cell_month(&text("13")), None);
    }

    #[test]
    fn test_variable_rows_uses_source_service() {
        let raw = record(
            9,
            &[
                ("GRUPO ECONOMICO", text("CLARO")),
                ("MES", text("2019-07")),
                ("INDICADOR DE DESEMPENHO NO ATENDIMENTO (IDA)", RawCell::Number(88.1)),
            ],
        );
        let ctx = SourceContext {
            service: Some("STFC".into()),
            year: Some(2019),
            month: None,
        };
        let rec = normalize_record(FormatVersion::VariableRows, &raw, &ctx).unwrap();
        assert_eq!(rec.service_name, "STFC");
        assert_eq!(rec.reference_month, NaiveDate::from_ymd_opt(2019, 7, 1).unwrap());
    }

    #[test]
    fn test_snake_case_fraction_rates() {
        let raw = record(
            2,
            &[
                ("PERIODO", RawCell::Number(202303.0)),
                ("SERVICO", text("SCM")),
                ("GRUPO_ECONOMICO", text("TIM")),
                ("TX_REABERTAS", RawCell::Number(0.05)),
                ("QTD_REABERTAS", RawCell::Number(40.0)),
            ],
        );
        let rec = normalize_record(FormatVersion::SnakeCaseExport, &raw, &SourceContext::default()).unwrap();
        assert_eq!(rec.reference_month, NaiveDate::from_ymd_opt(2023, 3, 1).unwrap());
        assert_eq!(rec.metrics.get(TaxaReabertas), Some(5.0));
        assert_eq!(rec.metrics.get(QuantidadeReabertas), Some(40.0));
    }

    #[test]
    fn test_period_falls_back_to_source_month() {
        let raw = record(
            3,
            &[
                ("PERIODO", RawCell::Empty),
                ("SERVICO", text("SMP")),
                ("GRUPO_ECONOMICO", text("TIM")),
                ("IDA", RawCell::Number(90.0)),
            ],
        );
        let ctx = SourceContext {
            service: None,
            year: Some(2022),
            month: Some(11),
        };
        let rec = normalize_record(FormatVersion::SnakeCaseExport, &raw, &ctx).unwrap();
        assert_eq!(rec.reference_month, NaiveDate::from_ymd_opt(2022, 11, 1).unwrap());

        let no_month = SourceContext {
            month: None,
            ..ctx
        };
        assert!(normalize_record(FormatVersion::SnakeCaseExport, &raw, &no_month).is_err());
    }

    #[test]
    fn test_droppable_rows() {
        let ctx = SourceContext::default();
        let missing_group = record(
            4,
            &[("ANO", text("2023")), ("MES", text("3")), ("SERVICO", text("SMP")), ("IDA", text("1"))],
        );
        let bad_number = record(
            5,
            &[
                ("ANO", text("2023")),
                ("MES", text("3")),
                ("SERVICO", text("SMP")),
                ("GRUPO ECONOMICO", text("OI")),
                ("IDA", text("n/a?")),
            ],
        );
        let no_metrics = record(
            6,
            &[
                ("ANO", text("2023")),
                ("MES", text("3")),
                ("SERVICO", text("SMP")),
                ("GRUPO ECONOMICO", text("OI")),
                ("IDA", text("-")),
            ],
        );
        for raw in [missing_group, bad_number, no_metrics] {
            let err = normalize_record(FormatVersion::MonthlyColumns, &raw, &ctx).unwrap_err();
            assert!(
                matches!(err, NormalizationError::Droppable { row, .. } if row == raw.row),
                "row {} should be droppable",
                raw.row
            );
        }
    }

    #[test]
    fn test_unknown_service_survives_normalization() {
        // the closed enumeration is enforced by the dimension resolver
        let raw = record(
            2,
            &[
                ("ANO", text("2023")),
                ("MES", text("3")),
                ("SERVICO", text("XYZ")),
                ("GRUPO ECONOMICO", text("OI")),
                ("IDA", text("1")),
            ],
        );
        let rec = normalize_record(FormatVersion::MonthlyColumns, &raw, &SourceContext::default()).unwrap();
        assert_eq!(rec.service_name, "XYZ");
    }

    // -------------------------------------------------------------------------
    // SHEET NORMALIZATION
    // -------------------------------------------------------------------------

    #[test]
    fn test_normalize_sheet_counts_dropped_rows() {
        let csv = "ANO;MÊS;SERVIÇO;GRUPO ECONÔMICO;IDA;TAXA DE REABERTAS\n\
                   2023;3;SMP;VIVO;91,2;\n\
                   2023;3;SMP;;90;1\n\
                   2023;3;SMP;OI;;\n\
                   2023;3;SMP;TIM;abc;2\n";
        let sheet = parse_csv(csv.as_bytes()).unwrap();
        let batch = normalize_sheet(&sheet, &SourceContext::default()).unwrap();
        assert_eq!(batch.version, FormatVersion::MonthlyColumns);
        assert_eq!(batch.rows_seen, 4);
        assert_eq!(batch.rows_dropped, 3);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].metrics.get(TaxaReabertas), None);
    }

    #[test]
    fn test_ods_percentage_and_plain_rates_agree() {
        use crate::sheet::tests::{ods_bytes, Cell::*};
        use crate::sheet::{parse_source, SheetSelector};

        let bytes = ods_bytes(&[(
            "IDA",
            vec![
                vec![S("ANO"), S("MÊS"), S("SERVIÇO"), S("GRUPO ECONÔMICO"), S("TAXA DE REABERTAS")],
                vec![F(2023.0), F(3.0), S("SMP"), S("VIVO"), Pct(0.785)],
                vec![F(2023.0), F(3.0), S("SMP"), S("CLARO"), F(78.5)],
            ],
        )]);
        let sheet = parse_source(&bytes, &SheetSelector::Auto).unwrap();
        let batch = normalize_sheet(&sheet, &SourceContext::default()).unwrap();
        assert_eq!(batch.version, FormatVersion::MonthlyColumns);
        assert_eq!(batch.records.len(), 2);
        for record in &batch.records {
            assert_eq!(record.metrics.get(TaxaReabertas), Some(78.5));
        }
    }

    #[test]
    fn test_normalize_sheet_all_dropped_is_fatal() {
        let csv = "ANO;MÊS;SERVIÇO;GRUPO ECONÔMICO;IDA\n2023;3;SMP;OI;\n";
        let sheet = parse_csv(csv.as_bytes()).unwrap();
        let err = normalize_sheet(&sheet, &SourceContext::default()).unwrap_err();
        assert!(matches!(err, NormalizationError::Fatal(_)));
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let csv = "ANO;MES;SERVICO;GRUPO ECONOMICO;IDA\n2023;1;SMP;VIVO;1\n2023;2;SMP;VIVO;2\n";
        let sheet = parse_csv(csv.as_bytes()).unwrap();
        let a = normalize_sheet(&sheet, &SourceContext::default()).unwrap();
        let b = normalize_sheet(&sheet, &SourceContext::default()).unwrap();
        assert_eq!(a.records, b.records);
    }
}
