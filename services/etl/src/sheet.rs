//! Sheet parser: turns a spreadsheet (or semicolon CSV) buffer into raw records.
//!
//! Column positions are never assumed. The header row is located by text,
//! and every data row is keyed by the normalized header names above it.
//! Two layouts exist in the published history:
//!
//! - long: one row per (period, group), one column per metric
//! - wide: one row per (group, variable), one column per month; these are
//!   pivoted into one record per (group, month) keyed by variable name

use calamine::{open_workbook_auto_from_rs, Data, Range, Reader};
use chrono::{Datelike, Duration, NaiveDate};
use quick_xml::events::{BytesStart, Event};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::{Cursor, Read};
use tracing::debug;

use crate::error::{EtlError, Result};

/// Header rows are searched for within this many leading rows.
const HEADER_SCAN_ROWS: usize = 40;

/// Any of these in a row marks it as the header row.
const GROUP_HEADER_ANCHORS: &[&str] = &["GRUPO ECONOMICO", "GRUPO_ECONOMICO"];

pub const GROUP_KEY: &str = "GRUPO ECONOMICO";
pub const MONTH_KEY: &str = "MES";
const VARIABLE_KEY: &str = "VARIAVEL";
const SERVICE_KEY: &str = "SERVICO";

#[derive(Debug, Clone, PartialEq)]
pub enum RawCell {
    Empty,
    Number(f64),
    /// Percentage-typed workbook cell, holding the stored fraction (0.785 for 78.5%).
    Percent(f64),
    Text(String),
    Date(NaiveDate),
}

impl RawCell {
    pub fn is_empty(&self) -> bool {
        matches!(self, RawCell::Empty)
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            RawCell::Empty => None,
            RawCell::Text(s) => Some(s.clone()),
            RawCell::Number(n) if n.fract() == 0.0 => Some(format!("{}", *n as i64)),
            RawCell::Number(n) => Some(n.to_string()),
            RawCell::Percent(f) => Some(format!("{}%", f * 100.0)),
            RawCell::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        }
    }
}

/// One data row keyed by normalized column name.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// 1-based row in the source sheet.
    pub row: usize,
    pub cells: BTreeMap<String, RawCell>,
}

impl RawRecord {
    pub fn get(&self, column: &str) -> Option<&RawCell> {
        self.cells.get(column).filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SheetSelector {
    /// First worksheet with a recognizable header.
    Auto,
    Named(String),
}

impl SheetSelector {
    pub fn from_option(name: Option<&str>) -> Self {
        match name {
            Some(n) => SheetSelector::Named(n.to_string()),
            None => SheetSelector::Auto,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Layout {
    Long,
    Wide {
        group_col: usize,
        variable_col: usize,
        service_col: Option<usize>,
        month_cols: Vec<(usize, String)>,
    },
}

/// A worksheet whose header has been located.
#[derive(Debug, Clone)]
pub struct ParsedSheet {
    pub sheet_name: String,
    /// 1-based row of the header.
    pub header_row: usize,
    header: Vec<String>,
    rows: Vec<(usize, Vec<RawCell>)>,
    layout: Layout,
}

impl ParsedSheet {
    fn from_grid(sheet_name: &str, grid: Vec<(usize, Vec<RawCell>)>) -> Result<Self> {
        let header_idx = grid
            .iter()
            .take(HEADER_SCAN_ROWS)
            .position(|(_, cells)| {
                cells
                    .iter()
                    .any(|c| GROUP_HEADER_ANCHORS.contains(&header_text(c).as_str()))
            })
            .ok_or_else(|| {
                EtlError::parse(format!(
                    "no recognizable header in worksheet '{}' (looked for {:?})",
                    sheet_name, GROUP_HEADER_ANCHORS
                ))
            })?;

        let mut grid = grid;
        let rows = grid.split_off(header_idx + 1);
        let (header_row, header_cells) = grid.pop().ok_or_else(|| EtlError::parse("empty sheet"))?;
        let header: Vec<String> = header_cells.iter().map(header_text).collect();
        let layout = detect_layout(&header);

        debug!(
            sheet = sheet_name,
            header_row,
            columns = header.iter().filter(|h| !h.is_empty()).count(),
            wide = matches!(layout, Layout::Wide { .. }),
            "header located"
        );

        Ok(Self {
            sheet_name: sheet_name.to_string(),
            header_row,
            header,
            rows,
            layout,
        })
    }

    pub fn is_wide(&self) -> bool {
        matches!(self.layout, Layout::Wide { .. })
    }

    /// Column names the records of this sheet carry.
    pub fn columns(&self) -> BTreeSet<String> {
        match &self.layout {
            Layout::Long => self.header.iter().filter(|h| !h.is_empty()).cloned().collect(),
            Layout::Wide {
                variable_col,
                service_col,
                ..
            } => {
                let mut cols: BTreeSet<String> = [GROUP_KEY.to_string(), MONTH_KEY.to_string()]
                    .into_iter()
                    .collect();
                if service_col.is_some() {
                    cols.insert(SERVICE_KEY.to_string());
                }
                for (_, cells) in &self.rows {
                    if let Some(name) = cells.get(*variable_col).and_then(|c| c.as_text()) {
                        cols.insert(normalize_header(&name));
                    }
                }
                cols
            }
        }
    }

    /// Records in sheet order. Each call starts over from the first data row.
    pub fn records(&self) -> RawRecords<'_> {
        match &self.layout {
            Layout::Long => RawRecords::Long {
                sheet: self,
                pos: 0,
            },
            Layout::Wide { .. } => RawRecords::Wide(self.pivot().into_iter()),
        }
    }

    fn long_record(&self, row: usize, cells: &[RawCell]) -> RawRecord {
        let mut map = BTreeMap::new();
        for (name, cell) in self.header.iter().zip(cells.iter()) {
            if !name.is_empty() {
                map.entry(name.clone()).or_insert_with(|| cell.clone());
            }
        }
        RawRecord { row, cells: map }
    }

    fn pivot(&self) -> Vec<RawRecord> {
        let Layout::Wide {
            group_col,
            variable_col,
            service_col,
            month_cols,
        } = &self.layout
        else {
            return Vec::new();
        };

        // (group, service, month) -> record; groups are often merged cells, so
        // a blank group cell continues the previous one.
        let mut pivot: BTreeMap<(String, String, String), RawRecord> = BTreeMap::new();
        let mut current_group: Option<String> = None;

        for (row, cells) in &self.rows {
            if is_skippable_row(cells) {
                continue;
            }
            let group = cells.get(*group_col).and_then(|c| c.as_text());
            if group.is_some() {
                current_group = group;
            }
            let (Some(group), Some(variable)) = (
                current_group.clone(),
                cells.get(*variable_col).and_then(|c| c.as_text()),
            ) else {
                continue;
            };
            let service = service_col
                .and_then(|col| cells.get(col))
                .and_then(|c| c.as_text())
                .unwrap_or_default();
            let variable = normalize_header(&variable);

            for (col, month) in month_cols {
                let key = (group.clone(), service.clone(), month.clone());
                let record = pivot.entry(key).or_insert_with(|| {
                    let mut cells = BTreeMap::new();
                    cells.insert(GROUP_KEY.to_string(), RawCell::Text(group.clone()));
                    cells.insert(MONTH_KEY.to_string(), RawCell::Text(month.clone()));
                    if service_col.is_some() {
                        cells.insert(SERVICE_KEY.to_string(), RawCell::Text(service.clone()));
                    }
                    RawRecord { row: *row, cells }
                });
                let value = cells.get(*col).cloned().unwrap_or(RawCell::Empty);
                record.cells.entry(variable.clone()).or_insert(value);
            }
        }

        pivot.into_values().collect()
    }
}

/// Lazy record sequence over a parsed sheet.
pub enum RawRecords<'a> {
    Long { sheet: &'a ParsedSheet, pos: usize },
    Wide(std::vec::IntoIter<RawRecord>),
}

impl Iterator for RawRecords<'_> {
    type Item = RawRecord;

    fn next(&mut self) -> Option<RawRecord> {
        match self {
            RawRecords::Long { sheet, pos } => {
                while let Some((row, cells)) = sheet.rows.get(*pos) {
                    *pos += 1;
                    if !is_skippable_row(cells) {
                        return Some(sheet.long_record(*row, cells));
                    }
                }
                None
            }
            RawRecords::Wide(iter) => iter.next(),
        }
    }
}

/// Blank rows and note rows (only the first cell filled) carry no data.
fn is_skippable_row(cells: &[RawCell]) -> bool {
    let filled = cells.iter().filter(|c| !c.is_empty()).count();
    filled == 0 || (filled == 1 && cells.first().map(|c| !c.is_empty()).unwrap_or(false))
}

fn detect_layout(header: &[String]) -> Layout {
    let find = |name: &str| header.iter().position(|h| h == name);
    let group_col = header
        .iter()
        .position(|h| GROUP_HEADER_ANCHORS.contains(&h.as_str()));
    let month_cols: Vec<(usize, String)> = header
        .iter()
        .enumerate()
        .filter_map(|(i, h)| parse_year_month(h).map(|(y, m)| (i, format!("{:04}-{:02}", y, m))))
        .collect();

    match (group_col, find(VARIABLE_KEY)) {
        (Some(group_col), Some(variable_col)) if !month_cols.is_empty() => Layout::Wide {
            group_col,
            variable_col,
            service_col: find(SERVICE_KEY),
            month_cols,
        },
        _ => Layout::Long,
    }
}

// =============================================================================
// Entry points
// =============================================================================

/// Parse a fetched payload: workbooks by signature, anything else as CSV.
pub fn parse_source(bytes: &[u8], selector: &SheetSelector) -> Result<ParsedSheet> {
    if is_workbook(bytes) {
        parse_workbook(bytes, selector)
    } else {
        parse_csv(bytes)
    }
}

fn is_workbook(bytes: &[u8]) -> bool {
    const ZIP: &[u8] = b"PK\x03\x04";
    const OLE: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0];
    bytes.starts_with(ZIP) || bytes.starts_with(OLE)
}

/// Parse an ODS/XLS/XLSX buffer (calamine detects the format).
pub fn parse_workbook(bytes: &[u8], selector: &SheetSelector) -> Result<ParsedSheet> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| EtlError::parse(format!("cannot open workbook: {}", e)))?;

    let sheet_names = workbook.sheet_names().to_vec();
    if sheet_names.is_empty() {
        return Err(EtlError::parse("workbook has no sheets"));
    }
    let percent_cells = ods_percent_cells(bytes);

    match selector {
        SheetSelector::Named(wanted) => {
            let name = sheet_names
                .iter()
                .find(|n| *n == wanted)
                .or_else(|| {
                    sheet_names
                        .iter()
                        .find(|n| n.trim().eq_ignore_ascii_case(wanted.trim()))
                })
                .cloned()
                .ok_or_else(|| {
                    EtlError::parse(format!(
                        "worksheet '{}' not found (available: {:?})",
                        wanted, sheet_names
                    ))
                })?;
            let range = workbook
                .worksheet_range(&name)
                .map_err(|e| EtlError::parse(format!("cannot read worksheet '{}': {}", name, e)))?;
            ParsedSheet::from_grid(&name, grid_from_range(&range, percent_cells.get(&name)))
        }
        SheetSelector::Auto => {
            for name in &sheet_names {
                let range = match workbook.worksheet_range(name) {
                    Ok(r) => r,
                    Err(e) => {
                        debug!(sheet = %name, error = %e, "skipping unreadable worksheet");
                        continue;
                    }
                };
                let grid = grid_from_range(&range, percent_cells.get(name));
                if let Ok(sheet) = ParsedSheet::from_grid(name, grid) {
                    return Ok(sheet);
                }
            }
            Err(EtlError::parse(format!(
                "no worksheet with a recognizable header (sheets: {:?})",
                sheet_names
            )))
        }
    }
}

/// Parse a delimited text export. Semicolon is the regulator's delimiter;
/// comma is accepted when it clearly dominates the first line.
pub fn parse_csv(bytes: &[u8]) -> Result<ParsedSheet> {
    let text = decode_text(bytes);
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);

    let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let delimiter = if first_line.matches(',').count() > first_line.matches(';').count() {
        b','
    } else {
        b';'
    };

    let mut builder = csv::ReaderBuilder::new();
    builder
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All);

    // One reader per physical line keeps row numbers equal to file line numbers.
    let mut grid = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut record = csv::StringRecord::new();
        builder
            .from_reader(line.as_bytes())
            .read_record(&mut record)
            .map_err(|e| EtlError::parse(format!("CSV line {}: {}", idx + 1, e)))?;
        let cells = record
            .iter()
            .map(|field| {
                if field.is_empty() {
                    RawCell::Empty
                } else {
                    RawCell::Text(field.to_string())
                }
            })
            .collect();
        grid.push((idx + 1, cells));
    }

    ParsedSheet::from_grid("csv", grid)
}

fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

fn grid_from_range(
    range: &Range<Data>,
    percent_cells: Option<&HashSet<(usize, usize)>>,
) -> Vec<(usize, Vec<RawCell>)> {
    let (first_row, first_col) = range
        .start()
        .map(|(r, c)| (r as usize, c as usize))
        .unwrap_or((0, 0));
    range
        .rows()
        .enumerate()
        .map(|(i, row)| {
            let cells = row
                .iter()
                .enumerate()
                .map(|(j, data)| match (cell_from_data(data), percent_cells) {
                    (RawCell::Number(f), Some(set))
                        if set.contains(&(first_row + i, first_col + j)) =>
                    {
                        RawCell::Percent(f)
                    }
                    (cell, _) => cell,
                })
                .collect();
            (first_row + i + 1, cells)
        })
        .collect()
}

/// calamine reads ODS percentage cells as plain floats, so their positions
/// (0-based row, column) are recovered from `content.xml`, per sheet name.
/// Anything that is not a readable ODS package yields an empty map.
fn ods_percent_cells(bytes: &[u8]) -> HashMap<String, HashSet<(usize, usize)>> {
    let content = zip::ZipArchive::new(Cursor::new(bytes))
        .and_then(|mut archive| {
            let mut content = String::new();
            archive.by_name("content.xml")?.read_to_string(&mut content)?;
            Ok(content)
        });
    match content {
        Ok(xml) => scan_percent_cells(&xml).unwrap_or_else(|e| {
            debug!(error = %e, "could not scan ODS cell types");
            HashMap::new()
        }),
        Err(_) => HashMap::new(),
    }
}

/// Upper bound on expanded repeated cells, so a trailing
/// `number-columns-repeated="16384"` stays cheap.
const MAX_REPEAT: usize = 1024;

fn repeat_attr(e: &BytesStart, key: &[u8]) -> usize {
    e.try_get_attribute(key)
        .ok()
        .flatten()
        .and_then(|a| std::str::from_utf8(&a.value).ok()?.parse().ok())
        .unwrap_or(1)
}

fn scan_percent_cells(
    xml: &str,
) -> std::result::Result<HashMap<String, HashSet<(usize, usize)>>, String> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut found: HashMap<String, HashSet<(usize, usize)>> = HashMap::new();
    let mut sheet: Option<String> = None;
    let (mut row, mut col, mut row_repeat) = (0usize, 0usize, 1usize);

    loop {
        let event = reader.read_event().map_err(|e| e.to_string())?;
        let (e, self_closing) = match &event {
            Event::Start(e) => (e, false),
            Event::Empty(e) => (e, true),
            Event::End(e) => {
                match e.name().as_ref() {
                    b"table:table-row" => row += row_repeat,
                    b"table:table" => sheet = None,
                    _ => {}
                }
                continue;
            }
            Event::Eof => break,
            _ => continue,
        };

        match e.name().as_ref() {
            b"table:table" => {
                let name = e
                    .try_get_attribute("table:name")
                    .map_err(|e| e.to_string())?
                    .map(|a| a.unescape_value().map(|v| v.into_owned()))
                    .transpose()
                    .map_err(|e| e.to_string())?;
                sheet = name;
                row = 0;
            }
            // calamine does not count self-closing rows either
            b"table:table-row" if !self_closing => {
                col = 0;
                row_repeat = repeat_attr(e, b"table:number-rows-repeated");
            }
            b"table:table-cell" | b"table:covered-table-cell" => {
                let repeat = repeat_attr(e, b"table:number-columns-repeated");
                let is_percent = e
                    .try_get_attribute("office:value-type")
                    .ok()
                    .flatten()
                    .map(|a| &*a.value == b"percentage")
                    .unwrap_or(false);
                if let (true, Some(name)) = (is_percent, &sheet) {
                    let cells = found.entry(name.clone()).or_default();
                    for r in row..row + row_repeat.min(MAX_REPEAT) {
                        for c in col..col + repeat.min(MAX_REPEAT) {
                            cells.insert((r, c));
                        }
                    }
                }
                col += repeat;
            }
            _ => {}
        }
    }
    Ok(found)
}

fn cell_from_data(cell: &Data) -> RawCell {
    match cell {
        Data::Empty | Data::Error(_) => RawCell::Empty,
        Data::String(s) if s.trim().is_empty() => RawCell::Empty,
        Data::String(s) => RawCell::Text(s.trim().to_string()),
        Data::Float(f) => RawCell::Number(*f),
        Data::Int(i) => RawCell::Number(*i as f64),
        Data::Bool(b) => RawCell::Text(b.to_string()),
        Data::DateTime(dt) => excel_serial_date(dt.as_f64())
            .map(RawCell::Date)
            .unwrap_or(RawCell::Number(dt.as_f64())),
        Data::DateTimeIso(s) => s
            .get(..10)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .map(RawCell::Date)
            .unwrap_or_else(|| RawCell::Text(s.clone())),
        Data::DurationIso(s) => RawCell::Text(s.clone()),
    }
}

/// Serial of 9999-12-31, the last date spreadsheet applications represent.
const MAX_EXCEL_SERIAL: f64 = 2_958_465.0;

fn excel_serial_date(serial: f64) -> Option<NaiveDate> {
    if !(1.0..=MAX_EXCEL_SERIAL).contains(&serial) {
        return None;
    }
    let days = Duration::try_days(serial.floor() as i64)?;
    NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_signed(days)
}

fn header_text(cell: &RawCell) -> String {
    match cell {
        RawCell::Date(d) => format!("{:04}-{:02}", d.year(), d.month()),
        other => other.as_text().map(|s| normalize_header(&s)).unwrap_or_default(),
    }
}

/// Upper-case, fold Portuguese accents, collapse whitespace.
pub fn normalize_header(s: &str) -> String {
    let folded: String = s
        .to_uppercase()
        .chars()
        .map(|c| match c {
            'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'A',
            'É' | 'È' | 'Ê' | 'Ë' => 'E',
            'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
            'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'O',
            'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
            'Ç' => 'C',
            'Ñ' => 'N',
            '\u{a0}' => ' ',
            other => other,
        })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `2019-03`, `2019-03-01`, `2019/03`, `03/2019` or `03-2019`.
pub fn parse_year_month(s: &str) -> Option<(i32, u32)> {
    let s = s.trim();
    let s = s.get(..10).filter(|_| s.len() > 7 && s.as_bytes().get(4) == Some(&b'-')).unwrap_or(s);
    let parts: Vec<&str> = s.split(['-', '/']).collect();
    let (year, month) = match parts.as_slice() {
        [y, m] if y.len() == 4 => (y.parse().ok()?, m.parse().ok()?),
        [m, y] if y.len() == 4 && m.len() <= 2 => (y.parse().ok()?, m.parse().ok()?),
        [y, m, d] if y.len() == 4 && d.len() == 2 => (y.parse().ok()?, m.parse().ok()?),
        _ => return None,
    };
    if (1990..=2100).contains(&year) && (1..=12).contains(&month) {
        Some((year, month))
    } else {
        None
    }
}
