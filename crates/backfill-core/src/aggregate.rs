//! Result aggregation.
//!
//! Groups raw per-iteration [`BenchmarkRecord`]s by benchmark name and
//! computes descriptive statistics of wall-clock time per group.
//!
//! Standard deviation uses the sample (n-1) definition. A group with a single
//! record reports a standard deviation of exactly 0.0: the value must stay a
//! finite JSON number for the dashboard, which rejects NaN.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::domain::{
    AggregatedResult, BenchmarkRecord, BenchmarkSummary, BuildContext, ParseFailure, Result,
    RunContext,
};

/// File extension of raw harness output inside a result directory.
pub const RAW_RESULT_EXTENSION: &str = "bench";

/// Records read from raw result files, with the lines that failed to parse.
#[derive(Debug, Default)]
pub struct RecordSet {
    pub records: Vec<BenchmarkRecord>,
    pub failures: Vec<ParseFailure>,
    pub files: Vec<PathBuf>,
}

/// Summarise one group of samples. `None` for an empty group.
pub fn summarize(name: &str, samples: &[f64]) -> Option<BenchmarkSummary> {
    if samples.is_empty() {
        return None;
    }

    let count = samples.len();
    let mean = samples.iter().sum::<f64>() / count as f64;
    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let std_dev = if count < 2 {
        0.0
    } else {
        let variance =
            samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
        variance.sqrt()
    };

    Some(BenchmarkSummary {
        name: name.to_string(),
        count,
        mean,
        min,
        max,
        std_dev,
    })
}

/// Group records by exact benchmark name and summarise each group.
///
/// Output is sorted by name. Empty input yields an empty list and a warning.
pub fn aggregate(records: &[BenchmarkRecord]) -> Vec<BenchmarkSummary> {
    if records.is_empty() {
        warn!("no benchmark records to aggregate");
        return Vec::new();
    }

    let mut groups: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for record in records {
        groups
            .entry(record.name.as_str())
            .or_default()
            .push(record.time_secs);
    }

    groups
        .into_iter()
        .filter_map(|(name, samples)| summarize(name, &samples))
        .collect()
}

/// Parse JSON-lines harness output. Bad lines are collected, not fatal.
pub fn parse_records(path: &Path, text: &str) -> (Vec<BenchmarkRecord>, Vec<ParseFailure>) {
    let mut records = Vec::new();
    let mut failures = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match BenchmarkRecord::from_json_line(line) {
            Ok(record) => records.push(record),
            Err(e) => failures.push(ParseFailure {
                path: path.to_path_buf(),
                line: idx + 1,
                reason: e.to_string(),
            }),
        }
    }

    (records, failures)
}

/// Raw result files in a directory, sorted by name.
pub fn raw_result_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext == RAW_RESULT_EXTENSION)
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Read every raw result file of a result directory.
///
/// Unreadable files and malformed lines are logged and recorded as parse
/// failures; only a missing directory is an error.
pub fn load_records(dir: &Path) -> Result<RecordSet> {
    let mut set = RecordSet::default();

    for file in raw_result_files(dir)? {
        match fs::read_to_string(&file) {
            Ok(text) => {
                let (records, failures) = parse_records(&file, &text);
                debug!(file = %file.display(), records = records.len(), "loaded raw results");
                set.records.extend(records);
                set.failures.extend(failures);
            }
            Err(e) => set.failures.push(ParseFailure {
                path: file.clone(),
                line: 0,
                reason: e.to_string(),
            }),
        }
        set.files.push(file);
    }

    for failure in &set.failures {
        warn!(error = %failure, "skipping unparseable result");
    }
    if set.records.is_empty() {
        warn!(dir = %dir.display(), "no parseable benchmark records found");
    }

    Ok(set)
}

/// Aggregate a result directory and attach its metadata.
pub fn aggregate_dir(
    dir: &Path,
    build: &BuildContext,
    run: &RunContext,
) -> Result<Vec<AggregatedResult>> {
    let set = load_records(dir)?;
    Ok(aggregate(&set.records)
        .into_iter()
        .map(|summary| AggregatedResult::new(summary, build, run, Some(dir.to_path_buf())))
        .collect())
}
