use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

pub type EnvMap = BTreeMap<String, String>;

pub const DEFAULT_PARAM_NAME: &str = "default";
pub const CLOCK_TOPIC: &str = "/clock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    NeverExpire,
    VerifyChecksum,
}

impl CachePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NeverExpire => "never_expire",
            Self::VerifyChecksum => "verify_checksum",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub process_cwd: PathBuf,
    pub tmp_root: PathBuf,
    pub cache_dir: PathBuf,
}

/// Where a fixture's bytes come from before they land on local disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FixtureSource {
    Local(PathBuf),
    S3 { key: String, bucket: Option<String> },
    Nexus(String),
}

impl FixtureSource {
    /// File stem of the source, used as the fixture's directory name in a run.
    pub fn key(&self) -> String {
        let raw = match self {
            Self::Local(path) => path.to_string_lossy().to_string(),
            Self::S3 { key, .. } => key.clone(),
            Self::Nexus(path) => path.clone(),
        };
        Path::new(&raw)
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or(raw)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Local(path) => format!("local:{}", path.display()),
            Self::S3 {
                key,
                bucket: Some(bucket),
            } => format!("s3://{bucket}/{key}"),
            Self::S3 { key, bucket: None } => format!("s3:{key}"),
            Self::Nexus(path) => format!("nexus:{path}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopicSet {
    pub required_input_topics: BTreeSet<String>,
    pub expected_output_topics: BTreeSet<String>,
}

fn default_use_clock() -> bool {
    true
}

fn default_playback_rate() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerArgs {
    #[serde(default = "default_use_clock")]
    pub use_clock: bool,
    #[serde(default = "default_playback_rate")]
    pub playback_rate: f64,
}

impl Default for RunnerArgs {
    fn default() -> Self {
        Self {
            use_clock: default_use_clock(),
            playback_rate: default_playback_rate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRunParams {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub runner_args: RunnerArgs,
}

impl ReplayRunParams {
    pub fn default_set() -> Self {
        Self {
            name: DEFAULT_PARAM_NAME.to_string(),
            params: BTreeMap::new(),
            runner_args: RunnerArgs::default(),
        }
    }

    /// Parameter value as it should appear on a command line.
    pub fn value_text(&self, key: &str) -> Option<String> {
        self.params.get(key).map(|value| match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
    }

    pub fn params_json(&self) -> String {
        serde_json::to_string(&self.params).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Names end up as directory names, so they must stay a single path segment.
pub fn is_filesystem_safe(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fixture_key_is_the_file_stem() {
        let local = FixtureSource::Local(PathBuf::from("fixtures/cmd_vel_only.mcap"));
        assert_eq!(local.key(), "cmd_vel_only");
        let s3 = FixtureSource::S3 {
            key: "drives/2024/lap.mcap".to_string(),
            bucket: Some("bags".to_string()),
        };
        assert_eq!(s3.key(), "lap");
        assert_eq!(s3.describe(), "s3://bags/drives/2024/lap.mcap");
    }

    #[test]
    fn param_values_render_without_json_quotes_for_strings() {
        let mut params = ReplayRunParams::default_set();
        params.params.insert("mode".to_string(), json!("fast"));
        params.params.insert("x".to_string(), json!(1.5));
        assert_eq!(params.value_text("mode").as_deref(), Some("fast"));
        assert_eq!(params.value_text("x").as_deref(), Some("1.5"));
        assert_eq!(params.value_text("missing"), None);
    }

    #[test]
    fn filesystem_safe_names_reject_separators() {
        assert!(is_filesystem_safe("slow_1.0"));
        assert!(!is_filesystem_safe("a/b"));
        assert!(!is_filesystem_safe(".."));
        assert!(!is_filesystem_safe(""));
    }
}
