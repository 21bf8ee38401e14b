//! Run stages and stage selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::BackfillError;

/// One phase of per-revision work, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Build,
    Benchmark,
    Archive,
    Upload,
}

impl RunStage {
    /// All stages in their fixed execution order.
    pub const ORDER: [RunStage; 4] = [
        RunStage::Build,
        RunStage::Benchmark,
        RunStage::Archive,
        RunStage::Upload,
    ];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            RunStage::Build => "build",
            RunStage::Benchmark => "benchmark",
            RunStage::Archive => "archive",
            RunStage::Upload => "upload",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RunStage {
    type Err = BackfillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "build" => Ok(RunStage::Build),
            "benchmark" | "bench" | "operf" => Ok(RunStage::Benchmark),
            "archive" => Ok(RunStage::Archive),
            "upload" => Ok(RunStage::Upload),
            other => Err(BackfillError::Configuration(format!(
                "unknown stage \"{other}\""
            ))),
        }
    }
}

/// The subset of stages a run is asked to execute.
///
/// Iteration always follows [`RunStage::ORDER`], whatever order the stages
/// were requested in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSet {
    stages: Vec<RunStage>,
}

impl StageSet {
    pub fn new(requested: impl IntoIterator<Item = RunStage>) -> Self {
        let requested: Vec<RunStage> = requested.into_iter().collect();
        let stages = RunStage::ORDER
            .into_iter()
            .filter(|s| requested.contains(s))
            .collect();
        Self { stages }
    }

    pub fn all() -> Self {
        Self::new(RunStage::ORDER)
    }

    pub fn contains(&self, stage: RunStage) -> bool {
        self.stages.contains(&stage)
    }

    pub fn iter(&self) -> impl Iterator<Item = RunStage> + '_ {
        self.stages.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Default for StageSet {
    fn default() -> Self {
        Self::new([RunStage::Build, RunStage::Benchmark, RunStage::Upload])
    }
}

impl FromStr for StageSet {
    type Err = BackfillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stages = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(RunStage::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        if stages.is_empty() {
            return Err(BackfillError::Configuration(
                "no stages requested".to_string(),
            ));
        }
        Ok(Self::new(stages))
    }
}

impl fmt::Display for StageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.stages.iter().map(RunStage::name).collect();
        f.write_str(&names.join(","))
    }
}
