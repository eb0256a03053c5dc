use std::collections::HashMap;
use std::fs;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ResolvedConfig;
use crate::domain::{AssignType, PaperRecord};
use crate::download::{DownloadCandidate, DownloadOutcome, Downloader, Transport};
use crate::error::HarvestError;
use crate::extract::TreeExtractor;
use crate::fs_util::write_bytes_atomic;
use crate::lineage::LineageAssigner;
use crate::taxonomy::ReferenceTables;
use crate::tree_format::TreeSchema;
use crate::validate::check_tree_file;

#[derive(Debug, Clone, Serialize)]
pub struct ValidateResult {
    pub files: Vec<ValidateEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidateEntry {
    pub path: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<TreeSchema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreResult {
    pub source: String,
    pub trees: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AssignSummary {
    pub fail: usize,
    pub by_text: usize,
    pub by_tree: usize,
    pub both: usize,
    pub by_text_bad: usize,
    pub total_paper: usize,
    pub total_tree: usize,
}

impl AssignSummary {
    pub fn record(&mut self, assign_type: AssignType) {
        let slot = match assign_type {
            AssignType::Fail => &mut self.fail,
            AssignType::ByText => &mut self.by_text,
            AssignType::ByTree => &mut self.by_tree,
            AssignType::Both => &mut self.both,
            AssignType::ByTextBad => &mut self.by_text_bad,
        };
        *slot += 1;
    }

    pub fn count(&self, assign_type: AssignType) -> usize {
        match assign_type {
            AssignType::Fail => self.fail,
            AssignType::ByText => self.by_text,
            AssignType::ByTree => self.by_tree,
            AssignType::Both => self.both,
            AssignType::ByTextBad => self.by_text_bad,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AssignReport {
    pub generated_at: DateTime<Utc>,
    pub output: Utf8PathBuf,
    pub written: usize,
    pub summary: AssignSummary,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Parses a JSON array of records, or one record per line.
pub fn parse_records(content: &str) -> Result<Vec<PaperRecord>, HarvestError> {
    if content.trim_start().starts_with('[') {
        return serde_json::from_str(content)
            .map_err(|err| HarvestError::RecordParse(err.to_string()));
    }
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .map_err(|err| HarvestError::RecordParse(format!("line {}: {err}", index + 1)))
        })
        .collect()
}

pub fn read_records(path: &Utf8Path) -> Result<Vec<PaperRecord>, HarvestError> {
    if !path.as_std_path().exists() {
        return Err(HarvestError::MissingInput(path.as_std_path().to_path_buf()));
    }
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| HarvestError::Filesystem(format!("read {path}: {err}")))?;
    parse_records(&content).map_err(|err| match err {
        HarvestError::RecordParse(message) => {
            HarvestError::RecordParse(format!("{path}: {message}"))
        }
        other => other,
    })
}

pub fn write_records(path: &Utf8Path, records: &[PaperRecord]) -> Result<(), HarvestError> {
    let json = serde_json::to_vec_pretty(records)
        .map_err(|err| HarvestError::RecordParse(err.to_string()))?;
    write_bytes_atomic(path, &json)
}

pub fn dedup_records(records: Vec<PaperRecord>) -> Vec<PaperRecord> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<PaperRecord> = Vec::with_capacity(records.len());
    for record in records {
        let key = if record.doi.is_empty() {
            record
                .tree_files()
                .first()
                .and_then(|path| path.file_name())
                .map(str::to_string)
        } else {
            Some(record.doi.clone())
        };
        match key {
            Some(key) => match slots.get(&key) {
                Some(&slot) => kept[slot] = record,
                None => {
                    slots.insert(key, kept.len());
                    kept.push(record);
                }
            },
            None => kept.push(record),
        }
    }
    kept
}

pub fn assign_batch(
    assigner: &LineageAssigner<'_>,
    records: Vec<PaperRecord>,
) -> (Vec<PaperRecord>, AssignSummary) {
    let mut records: Vec<PaperRecord> =
        records.into_iter().filter(PaperRecord::has_tree).collect();
    records
        .par_iter_mut()
        .for_each(|record| assigner.assign_in_place(record));

    let mut summary = AssignSummary::default();
    for record in &records {
        summary.total_paper += 1;
        summary.total_tree += record.tree_files().len();
        if let Some(assign_type) = record.assign_type() {
            summary.record(assign_type);
        }
    }
    (records, summary)
}

pub struct App<T: Transport> {
    config: ResolvedConfig,
    downloader: Downloader<T>,
    extractor: TreeExtractor,
}

impl<T: Transport> App<T> {
    pub fn new(config: ResolvedConfig, downloader: Downloader<T>) -> Self {
        let extractor = TreeExtractor::new(config.extract);
        Self {
            config,
            downloader,
            extractor,
        }
    }

    pub fn validate(&self, paths: &[Utf8PathBuf]) -> ValidateResult {
        let files = paths
            .iter()
            .map(|path| match check_tree_file(path.as_std_path()) {
                Ok(schema) => ValidateEntry {
                    path: path.to_string(),
                    valid: true,
                    schema: Some(schema),
                    error: None,
                },
                Err(err) => ValidateEntry {
                    path: path.to_string(),
                    valid: false,
                    schema: None,
                    error: Some(err.to_string()),
                },
            })
            .collect();
        ValidateResult { files }
    }

    pub fn extract_file(
        &self,
        path: &Utf8Path,
        out_dir: &Utf8Path,
    ) -> Result<StoreResult, HarvestError> {
        if !path.as_std_path().exists() {
            return Err(HarvestError::MissingInput(path.as_std_path().to_path_buf()));
        }
        let bytes = fs::read(path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("read {path}: {err}")))?;
        let trees = self
            .extractor
            .store_download(&bytes, path.as_str(), out_dir);
        Ok(StoreResult {
            source: path.to_string(),
            trees,
        })
    }

    pub fn fetch(
        &self,
        candidate: &DownloadCandidate,
        out_dir: &Utf8Path,
    ) -> Result<StoreResult, HarvestError> {
        let bytes = match self
            .downloader
            .download(&candidate.url, candidate.declared_size)?
        {
            DownloadOutcome::Fetched(bytes) => bytes,
            DownloadOutcome::TooLarge { size, cap } => {
                warn!(url = %candidate.url, size, cap, "skipped oversized file");
                Vec::new()
            }
            DownloadOutcome::Exhausted { attempts } => {
                return Err(HarvestError::DownloadFailed {
                    url: candidate.url.clone(),
                    attempts,
                });
            }
        };
        let trees = if bytes.is_empty() {
            Vec::new()
        } else {
            self.extractor
                .store_download(&bytes, &candidate.filename, out_dir)
        };
        Ok(StoreResult {
            source: candidate.url.clone(),
            trees,
        })
    }

    pub fn harvest(
        &self,
        record: &mut PaperRecord,
        candidates: &[DownloadCandidate],
        sink: &dyn ProgressSink,
    ) -> Result<(), HarvestError> {
        let Some(out_dir) = record.output_dir(&self.config.output_dir) else {
            return Err(HarvestError::InvalidDoi(record.doi.clone()));
        };
        let started = Instant::now();
        sink.event(ProgressEvent {
            message: format!("harvest {}: {} files", record.doi, candidates.len()),
            elapsed: None,
        });

        let outcomes = self.downloader.download_all(candidates);
        let mut trees = Vec::new();
        for (candidate, outcome) in candidates.iter().zip(outcomes) {
            match outcome {
                Ok(DownloadOutcome::Fetched(bytes)) => trees.extend(
                    self.extractor
                        .store_download(&bytes, &candidate.filename, &out_dir),
                ),
                Ok(_) => {}
                Err(HarvestError::Cancelled) => return Err(HarvestError::Cancelled),
                Err(err) => warn!(url = %candidate.url, %err, "download skipped"),
            }
        }

        info!(doi = %record.doi, trees = trees.len(), "harvested");
        record.add_trees(trees);
        sink.event(ProgressEvent {
            message: format!(
                "harvest {}: {} trees",
                record.doi,
                record.tree_files().len()
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(())
    }

    pub fn assign(
        &self,
        inputs: &[Utf8PathBuf],
        output: &Utf8Path,
        dedup: bool,
        sink: &dyn ProgressSink,
    ) -> Result<AssignReport, HarvestError> {
        let started = Instant::now();
        let tables = ReferenceTables::load(&self.config.reference)?;
        let assigner = LineageAssigner::new(&tables)
            .with_priority(self.config.priority)
            .with_remap(self.config.path_remap.clone());

        let mut records = Vec::new();
        for input in inputs {
            let batch = read_records(input)?;
            info!(%input, records = batch.len(), "read records");
            records.extend(batch);
        }
        sink.event(ProgressEvent {
            message: format!("assign: {} records", records.len()),
            elapsed: None,
        });

        let (assigned, summary) = match self.config.workers {
            Some(workers) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .build()
                    .map_err(|err| HarvestError::InvalidConfig(err.to_string()))?;
                pool.install(|| assign_batch(&assigner, records))
            }
            None => assign_batch(&assigner, records),
        };
        for assign_type in AssignType::ALL {
            info!(%assign_type, count = summary.count(assign_type), "assignment count");
        }
        info!(
            total_paper = summary.total_paper,
            total_tree = summary.total_tree,
            "assignment summary"
        );

        let assigned = if dedup {
            dedup_records(assigned)
        } else {
            assigned
        };
        write_records(output, &assigned)?;
        info!(%output, records = assigned.len(), "wrote result");
        sink.event(ProgressEvent {
            message: format!("assign: wrote {}", output),
            elapsed: Some(started.elapsed()),
        });

        Ok(AssignReport {
            generated_at: Utc::now(),
            output: output.to_path_buf(),
            written: assigned.len(),
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn with_trees(doi: &str, trees: &[&str]) -> PaperRecord {
        let mut record = PaperRecord::new(doi);
        record.add_trees(trees.iter().map(Utf8PathBuf::from).collect());
        record
    }

    #[test]
    fn parse_records_array_and_lines() {
        let array = parse_records(r#"[{"doi": "10.1/a"}, {"doi": "10.1/b"}]"#).unwrap();
        assert_eq!(array.len(), 2);

        let lines = parse_records("{\"doi\": \"10.1/a\"}\n\n{\"doi\": \"10.1/b\", \"issue\": 3}\n")
            .unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].issue, "3");
    }

    #[test]
    fn parse_records_reports_line() {
        let err = parse_records("{\"doi\": \"10.1/a\"}\n{oops}\n").unwrap_err();
        assert_matches!(err, HarvestError::RecordParse(message) if message.starts_with("line 2"));
    }

    #[test]
    fn dedup_last_wins_in_first_position() {
        let mut newer = with_trees("10.1/a", &["x/a.nwk"]);
        newer.title = "newer".to_string();
        let records = vec![
            with_trees("10.1/a", &["x/a.nwk"]),
            with_trees("", &["one/tree.nwk"]),
            with_trees("10.1/b", &["x/b.nwk"]),
            newer,
            with_trees("", &["two/tree.nwk"]),
        ];
        let kept = dedup_records(records);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].title, "newer");
        assert_eq!(
            kept[1].tree_files()[0],
            Utf8PathBuf::from("two/tree.nwk")
        );
        assert_eq!(kept[2].doi, "10.1/b");
    }

    #[test]
    fn summary_counts_by_type() {
        let mut summary = AssignSummary::default();
        summary.record(AssignType::Both);
        summary.record(AssignType::Both);
        summary.record(AssignType::Fail);
        assert_eq!(summary.count(AssignType::Both), 2);
        assert_eq!(summary.count(AssignType::Fail), 1);
        assert_eq!(summary.count(AssignType::ByText), 0);
        let total: usize = AssignType::ALL.into_iter().map(|t| summary.count(t)).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn read_records_prefixes_path_once() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("papers.jsonl")).unwrap();
        fs::write(path.as_std_path(), "{\"doi\": \"10.1/a\"}\n{oops}\n").unwrap();

        let err = read_records(&path).unwrap_err();
        let expected_prefix = format!("{path}: line 2: ");
        assert_matches!(
            &err,
            HarvestError::RecordParse(message) if message.starts_with(&expected_prefix)
        );
        assert_eq!(err.to_string().matches("failed to parse records").count(), 1);
    }
}
