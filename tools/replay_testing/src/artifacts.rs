use crate::errors::ReplayError;
use crate::filter::FILTERED_FIXTURE_NAME;
use crate::lifecycle::ParamStatus;
use crate::orchestrator::OUTPUT_RECORDING_NAME;
use crate::types::ReplayRunParams;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const RUN_METADATA_NAME: &str = "run.json";
pub const RESULTS_XML_NAME: &str = "results.xml";
pub const RUN_LOG_NAME: &str = "replay.jsonl";
const RUNS_DIR_NAME: &str = "runs";
const INPUT_DIR_NAME: &str = "input";
const LOGS_DIR_NAME: &str = "logs";

/// Entries of a run directory that a fixture key must not shadow.
pub const RESERVED_RUN_DIR_ENTRIES: &[&str] = &[LOGS_DIR_NAME, RESULTS_XML_NAME];

/// Directory layout of one invocation:
///
/// ```text
/// {tmp_root}/{run_id}/
///   logs/replay.jsonl
///   results.xml
///   {fixture_key}/input/<source file>
///   {fixture_key}/filtered.mcap
///   {fixture_key}/runs/{param_name}/{output.mcap, run.json, logs/}
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub run_id: String,
    pub run_dir: PathBuf,
}

impl RunLayout {
    pub fn new(tmp_root: &Path, run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            run_dir: tmp_root.join(run_id),
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.run_dir.join(LOGS_DIR_NAME).join(RUN_LOG_NAME)
    }

    pub fn results_xml(&self) -> PathBuf {
        self.run_dir.join(RESULTS_XML_NAME)
    }

    pub fn fixture_dir(&self, fixture_key: &str) -> PathBuf {
        self.run_dir.join(fixture_key)
    }

    pub fn input_dir(&self, fixture_key: &str) -> PathBuf {
        self.fixture_dir(fixture_key).join(INPUT_DIR_NAME)
    }

    pub fn filtered_fixture(&self, fixture_key: &str) -> PathBuf {
        self.fixture_dir(fixture_key).join(FILTERED_FIXTURE_NAME)
    }

    pub fn runs_dir(&self, fixture_key: &str) -> PathBuf {
        self.fixture_dir(fixture_key).join(RUNS_DIR_NAME)
    }

    pub fn param_dir(&self, fixture_key: &str, param_name: &str) -> PathBuf {
        self.runs_dir(fixture_key).join(param_name)
    }

    pub fn output_recording(&self, fixture_key: &str, param_name: &str) -> PathBuf {
        self.param_dir(fixture_key, param_name)
            .join(OUTPUT_RECORDING_NAME)
    }

    pub fn run_metadata(&self, fixture_key: &str, param_name: &str) -> PathBuf {
        self.param_dir(fixture_key, param_name)
            .join(RUN_METADATA_NAME)
    }
}

/// `run.json`, written once per parameter set after its RUNNING stage ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub test_name: String,
    pub fixture_key: String,
    pub fixture_source: String,
    pub param: ReplayRunParams,
    pub filtered_fixture: PathBuf,
    pub output: Option<PathBuf>,
    pub status: ParamStatus,
    pub failure: Option<String>,
    pub started_at_unix_ms: u64,
    pub duration_ms: u64,
    #[serde(default)]
    pub exit_codes: BTreeMap<String, i32>,
    #[serde(default)]
    pub commands: Vec<String>,
}

/// Writes through a sibling temp file and a rename so readers never see half a file.
pub fn write_run_metadata(path: &Path, metadata: &RunMetadata) -> Result<(), ReplayError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ReplayError::Io(e.to_string()))?;
    }
    let body = serde_json::to_string_pretty(metadata).map_err(|e| ReplayError::Io(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body).map_err(|e| ReplayError::Io(format!("{}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path).map_err(|e| ReplayError::Io(format!("{}: {e}", path.display())))
}

pub fn read_run_metadata(path: &Path) -> Result<RunMetadata, ReplayError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ReplayError::Io(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&raw).map_err(|e| ReplayError::Io(format!("{}: {e}", path.display())))
}
