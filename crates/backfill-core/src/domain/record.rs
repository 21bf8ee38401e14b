//! Raw benchmark records, summaries and the metadata attached to them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One raw measurement emitted by the benchmark harness (one iteration).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    pub name: String,

    /// Wall-clock seconds, the primary timing metric.
    pub time_secs: f64,

    pub user_time_secs: Option<f64>,

    /// Suite-specific counters, nested objects flattened with `.`
    /// (e.g. `gc.minor_collections`).
    #[serde(default)]
    pub counters: BTreeMap<String, f64>,
}

#[derive(Deserialize)]
struct HarnessLine {
    name: String,
    time_secs: f64,
    #[serde(default)]
    user_time_secs: Option<f64>,
    #[serde(flatten)]
    rest: BTreeMap<String, Value>,
}

impl BenchmarkRecord {
    pub fn new(name: &str, time_secs: f64) -> Self {
        Self {
            name: name.to_string(),
            time_secs,
            user_time_secs: None,
            counters: BTreeMap::new(),
        }
    }

    /// Parse one JSON line of harness output.
    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        let raw: HarnessLine = serde_json::from_str(line)?;
        let mut counters = BTreeMap::new();
        for (key, value) in &raw.rest {
            flatten_counters(key, value, &mut counters);
        }
        Ok(Self {
            name: raw.name,
            time_secs: raw.time_secs,
            user_time_secs: raw.user_time_secs,
            counters,
        })
    }
}

fn flatten_counters(prefix: &str, value: &Value, out: &mut BTreeMap<String, f64>) {
    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_f64() {
                out.insert(prefix.to_string(), v);
            }
        }
        Value::Object(map) => {
            for (key, nested) in map {
                flatten_counters(&format!("{prefix}.{key}"), nested, out);
            }
        }
        _ => {}
    }
}

/// Descriptive statistics of the primary timing metric for one benchmark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkSummary {
    pub name: String,
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Sample (n-1) standard deviation; 0.0 for a single sample.
    pub std_dev: f64,
}

/// Identifying metadata of a build, snapshotted next to its results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildContext {
    #[serde(rename = "commitid")]
    pub commit_id_short: String,
    #[serde(rename = "commitid_long")]
    pub commit_id: String,
    pub branch: String,
    pub project: String,
    pub executable: String,
    pub executable_description: String,
}

/// Metadata of one benchmark run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub environment: String,
    pub run_timestamp: String,
}

/// Aggregated statistics for one benchmark of one revision, with metadata.
///
/// Built once from a non-empty record set and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub summary: BenchmarkSummary,
    pub build: BuildContext,
    pub run: RunContext,
    /// Where the raw records for this result live.
    pub artifact_location: Option<PathBuf>,
}

impl AggregatedResult {
    pub fn new(
        summary: BenchmarkSummary,
        build: &BuildContext,
        run: &RunContext,
        artifact_location: Option<PathBuf>,
    ) -> Self {
        Self {
            summary,
            build: build.clone(),
            run: run.clone(),
            artifact_location,
        }
    }
}
