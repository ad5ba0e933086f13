//! Pipeline orchestrator.
//!
//! Files run one after another through
//! `Pending → Fetched → Parsed → Normalized → Loaded`, or end in `Failed`
//! with the stage and reason recorded. One bad file never stops the others;
//! losing the destination does.

use std::fmt;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SourceFile;
use crate::dimensions::DimensionResolver;
use crate::error::{EtlError, Result};
use crate::fetcher::Fetch;
use crate::loader::{FactLoader, FactPolicy, LoadStats};
use crate::normalizer::{normalize_sheet, SourceContext};
use crate::sheet::{parse_source, SheetSelector};
use crate::warehouse::Warehouse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Pending,
    Fetched,
    Parsed,
    Normalized,
    Loaded,
    Failed,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileState::Pending => "pending",
            FileState::Fetched => "fetched",
            FileState::Parsed => "parsed",
            FileState::Normalized => "normalized",
            FileState::Loaded => "loaded",
            FileState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    /// Last state reached before the failure.
    pub stage: FileState,
    pub kind: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub label: String,
    pub url: String,
    pub state: FileState,
    pub failure: Option<Failure>,
    pub content_hash: Option<String>,
    pub format: Option<&'static str>,
    pub rows_parsed: usize,
    pub rows_normalized: usize,
    pub rows_dropped: usize,
    /// Rows refused by the dimension resolver.
    pub rows_rejected: usize,
    pub load: LoadStats,
}

impl FileOutcome {
    fn new(source: &SourceFile) -> Self {
        Self {
            label: source.label(),
            url: source.url.clone(),
            state: FileState::Pending,
            failure: None,
            content_hash: None,
            format: None,
            rows_parsed: 0,
            rows_normalized: 0,
            rows_dropped: 0,
            rows_rejected: 0,
            load: LoadStats::default(),
        }
    }

    fn fail(&mut self, err: &EtlError) {
        self.failure = Some(Failure {
            stage: self.state,
            kind: err.kind(),
            reason: err.to_string(),
        });
        self.state = FileState::Failed;
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub files: Vec<FileOutcome>,
    /// Set when the run stopped early because the destination was lost.
    pub aborted: Option<String>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.state == FileState::Loaded)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.state == FileState::Failed)
            .count()
    }

    pub fn rows_loaded(&self) -> usize {
        self.files.iter().map(|f| f.load.written()).sum()
    }

    pub fn load_totals(&self) -> LoadStats {
        let mut total = LoadStats::default();
        for file in &self.files {
            total += file.load;
        }
        total
    }

    /// A run succeeds when it was not aborted and at least one file loaded.
    pub fn is_success(&self) -> bool {
        self.aborted.is_none() && self.succeeded() > 0
    }

    pub fn log_summary(&self) {
        let totals = self.load_totals();
        info!(
            run_id = %self.run_id,
            files = self.files.len(),
            succeeded = self.succeeded(),
            failed = self.failed(),
            inserted = totals.inserted,
            updated = totals.updated,
            skipped = totals.skipped,
            "run summary"
        );
        for file in &self.files {
            match &file.failure {
                Some(failure) => error!(
                    run_id = %self.run_id,
                    file = %file.label,
                    stage = %failure.stage,
                    kind = failure.kind,
                    reason = %failure.reason,
                    "file failed"
                ),
                None if file.state == FileState::Pending => {
                    warn!(run_id = %self.run_id, file = %file.label, "file not processed")
                }
                None => {}
            }
        }
        if let Some(reason) = &self.aborted {
            error!(run_id = %self.run_id, reason = %reason, "run aborted");
        }
    }
}

pub struct Pipeline<'a> {
    fetcher: &'a dyn Fetch,
    warehouse: &'a dyn Warehouse,
    policy: FactPolicy,
}

impl<'a> Pipeline<'a> {
    pub fn new(fetcher: &'a dyn Fetch, warehouse: &'a dyn Warehouse, policy: FactPolicy) -> Self {
        Self {
            fetcher,
            warehouse,
            policy,
        }
    }

    pub async fn run(&self, run_id: Uuid, sources: &[SourceFile]) -> RunReport {
        self.run_files(run_id, sources)
            .instrument(info_span!("run", run_id = %run_id))
            .await
    }

    async fn run_files(&self, run_id: Uuid, sources: &[SourceFile]) -> RunReport {
        let mut report = RunReport {
            run_id,
            files: sources.iter().map(FileOutcome::new).collect(),
            aborted: None,
        };
        info!(files = sources.len(), policy = %self.policy, "run started");

        let mut resolver = DimensionResolver::new(self.warehouse);
        if let Err(e) = resolver.preload().await {
            error!(error = %e, "could not read dimensions");
            report.aborted = Some(e.to_string());
            return report;
        }
        let loader = FactLoader::new(self.warehouse, self.policy);

        for (source, outcome) in sources.iter().zip(report.files.iter_mut()) {
            let span = info_span!("file", file = %outcome.label);
            let result = self
                .process_file(source, &mut resolver, &loader, outcome)
                .instrument(span)
                .await;

            match result {
                Ok(()) => {
                    outcome.state = FileState::Loaded;
                }
                Err(e) => {
                    let stage = outcome.state;
                    outcome.fail(&e);
                    error!(file = %outcome.label, stage = %stage, error = %e, "file failed");
                    if e.is_connectivity_loss() {
                        report.aborted = Some(format!("destination unreachable: {}", e));
                        break;
                    }
                }
            }
        }

        let stats = resolver.stats();
        info!(
            dimension_rows_created = stats.created,
            dimension_cache_hits = stats.cache_hits,
            "dimension resolution finished"
        );
        report
    }

    async fn process_file(
        &self,
        source: &SourceFile,
        resolver: &mut DimensionResolver<'_>,
        loader: &FactLoader<'_>,
        outcome: &mut FileOutcome,
    ) -> Result<()> {
        let fetched = self.fetcher.fetch(source).await?;
        info!(
            bytes = fetched.bytes.len(),
            hash = %fetched.content_hash,
            cached = fetched.from_cache,
            "fetched"
        );
        outcome.content_hash = Some(fetched.content_hash.clone());
        outcome.state = FileState::Fetched;

        let selector = SheetSelector::from_option(source.sheet.as_deref());
        let sheet = parse_source(&fetched.bytes, &selector)?;
        info!(sheet = %sheet.sheet_name, header_row = sheet.header_row, wide = sheet.is_wide(), "parsed");
        outcome.state = FileState::Parsed;

        let batch = normalize_sheet(&sheet, &SourceContext::from(source))?;
        outcome.format = Some(batch.version.name());
        outcome.rows_parsed = batch.rows_seen;
        outcome.rows_normalized = batch.records.len();
        outcome.rows_dropped = batch.rows_dropped;
        info!(
            format = batch.version.name(),
            rows = batch.rows_seen,
            normalized = batch.records.len(),
            dropped = batch.rows_dropped,
            "normalized"
        );
        outcome.state = FileState::Normalized;

        for record in &batch.records {
            let keys = match resolver.resolve(record).await {
                Ok(keys) => keys,
                Err(e @ EtlError::DimensionIntegrity(_)) => {
                    warn!(error = %e, "row rejected");
                    outcome.rows_rejected += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let result = loader.load(keys, &record.metrics).await?;
            outcome.load.record(result);
        }

        if outcome.rows_rejected == batch.records.len() {
            return Err(EtlError::DimensionIntegrity(format!(
                "all {} normalized rows rejected",
                outcome.rows_rejected
            )));
        }

        info!(
            inserted = outcome.load.inserted,
            updated = outcome.load.updated,
            skipped = outcome.load.skipped,
            rejected = outcome.rows_rejected,
            "loaded"
        );
        Ok(())
    }
}
