use crate::errors::ReplayError;
use crate::logging::{append_run_log, DEFAULT_DISK_BUDGET_BYTES, DEFAULT_MAX_PAYLOAD_BYTES};
use crate::runtime::FileSystem;
use crate::types::{CachePolicy, EnvMap, ResolvedPaths};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};

pub const CI_RESULTS_DIR: &str = "test_results/replay_testing";

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub tmp_root: Option<PathBuf>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub run: RunConfig,
    pub commands: CommandsConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PathsConfig {
    pub tmp_root: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunConfig {
    pub timeout_seconds: u64,
    pub teardown_grace_seconds: u64,
    pub poll_interval_ms: u64,
    pub clock_frequency_hz: u32,
}

/// Argument templates for the external recorder and player. Placeholders:
/// `${output}`, `${fixture}`, `${rate}`, `${clock_hz}`, `${qos}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandsConfig {
    pub record: Vec<String>,
    pub play: Vec<String>,
    pub clock_args: Vec<String>,
    pub qos_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    pub policy: CachePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub disk_budget_bytes: u64,
    pub max_payload_bytes: usize,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            run: RunConfig {
                timeout_seconds: 300,
                teardown_grace_seconds: 5,
                poll_interval_ms: 100,
                clock_frequency_hz: 1000,
            },
            commands: CommandsConfig {
                record: strings(&[
                    "ros2", "bag", "record", "-s", "mcap", "--all", "-o", "${output}",
                ]),
                play: strings(&["ros2", "bag", "play", "${fixture}", "-r", "${rate}"]),
                clock_args: strings(&["--clock", "${clock_hz}"]),
                qos_args: strings(&["--qos-profile-overrides-path", "${qos}"]),
            },
            cache: CacheConfig {
                policy: CachePolicy::NeverExpire,
            },
            logging: LoggingConfig {
                disk_budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
                max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialAppConfig {
    paths: Option<PathsConfig>,
    run: Option<PartialRunConfig>,
    commands: Option<PartialCommandsConfig>,
    cache: Option<CacheConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialRunConfig {
    timeout_seconds: Option<u64>,
    teardown_grace_seconds: Option<u64>,
    poll_interval_ms: Option<u64>,
    clock_frequency_hz: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialCommandsConfig {
    record: Option<Vec<String>>,
    play: Option<Vec<String>>,
    clock_args: Option<Vec<String>>,
    qos_args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    disk_budget_bytes: Option<u64>,
    max_payload_bytes: Option<usize>,
}

pub fn load_config(overrides: &CliOverrides, fs: &dyn FileSystem) -> Result<AppConfig, ReplayError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(path)?;
        let partial: PartialAppConfig = toml::from_str(&file_contents)
            .map_err(|e| ReplayError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(paths) = partial.paths {
        if paths.tmp_root.is_some() {
            cfg.paths.tmp_root = paths.tmp_root;
        }
        if paths.cache_dir.is_some() {
            cfg.paths.cache_dir = paths.cache_dir;
        }
    }

    if let Some(run) = partial.run {
        if let Some(value) = run.timeout_seconds {
            cfg.run.timeout_seconds = value;
        }
        if let Some(value) = run.teardown_grace_seconds {
            cfg.run.teardown_grace_seconds = value;
        }
        if let Some(value) = run.poll_interval_ms {
            cfg.run.poll_interval_ms = value;
        }
        if let Some(value) = run.clock_frequency_hz {
            cfg.run.clock_frequency_hz = value;
        }
    }

    if let Some(commands) = partial.commands {
        if let Some(value) = commands.record {
            cfg.commands.record = value;
        }
        if let Some(value) = commands.play {
            cfg.commands.play = value;
        }
        if let Some(value) = commands.clock_args {
            cfg.commands.clock_args = value;
        }
        if let Some(value) = commands.qos_args {
            cfg.commands.qos_args = value;
        }
    }

    if let Some(cache) = partial.cache {
        cfg.cache = cache;
    }

    if let Some(logging) = partial.logging {
        if let Some(value) = logging.disk_budget_bytes {
            cfg.logging.disk_budget_bytes = value;
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(tmp_root) = &overrides.tmp_root {
        cfg.paths.tmp_root = Some(tmp_root.clone());
    }
    if let Some(timeout) = overrides.timeout_seconds {
        cfg.run.timeout_seconds = timeout;
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), ReplayError> {
    if cfg.run.timeout_seconds == 0 {
        return Err(ReplayError::InvalidConfig(
            "run.timeout_seconds must be greater than zero".to_string(),
        ));
    }
    if cfg.run.poll_interval_ms == 0 {
        return Err(ReplayError::InvalidConfig(
            "run.poll_interval_ms must be greater than zero".to_string(),
        ));
    }
    if cfg.run.clock_frequency_hz == 0 {
        return Err(ReplayError::InvalidConfig(
            "run.clock_frequency_hz must be greater than zero".to_string(),
        ));
    }
    if cfg.commands.record.is_empty() || cfg.commands.play.is_empty() {
        return Err(ReplayError::InvalidConfig(
            "commands.record and commands.play need at least a program name".to_string(),
        ));
    }
    if !cfg.commands.record.iter().any(|arg| arg.contains("${output}")) {
        return Err(ReplayError::InvalidConfig(
            "commands.record must reference ${output}".to_string(),
        ));
    }
    if !cfg.commands.play.iter().any(|arg| arg.contains("${fixture}")) {
        return Err(ReplayError::InvalidConfig(
            "commands.play must reference ${fixture}".to_string(),
        ));
    }
    Ok(())
}

pub fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

fn is_writable(fs: &dyn FileSystem, dir: &Path) -> bool {
    if fs.create_dir_all(dir).is_err() {
        return false;
    }
    let marker = dir.join(".write_check");
    if fs.write_string(&marker, "").is_err() {
        return false;
    }
    let _ = fs.remove_file(&marker);
    true
}

/// Picks the temp root and cache dir. Explicit config wins, CI runs keep their
/// artifacts next to the workspace, everything else goes under the system temp dir.
pub fn resolve_paths(
    process_cwd: &Path,
    cfg: &AppConfig,
    env: &EnvMap,
    system_temp: &Path,
    fs: &dyn FileSystem,
) -> ResolvedPaths {
    let ci_root = process_cwd.join(CI_RESULTS_DIR);
    let preferred = if let Some(path) = &cfg.paths.tmp_root {
        absolutize_path(process_cwd, path)
    } else if env.contains_key("CI") {
        ci_root.clone()
    } else {
        system_temp.join("replay_testing")
    };

    let tmp_root = if is_writable(fs, &preferred) {
        preferred
    } else {
        append_run_log(
            "error",
            "paths.tmp_root_unwritable",
            json!({
                "path": preferred.display().to_string(),
                "fallback": ci_root.display().to_string(),
            }),
        );
        ci_root
    };

    let cache_dir = if let Some(path) = &cfg.paths.cache_dir {
        absolutize_path(process_cwd, path)
    } else if let Some(home) = env.get("HOME").filter(|home| !home.is_empty()) {
        PathBuf::from(home).join(".cache").join("replay_testing")
    } else {
        tmp_root.join("cache")
    };

    ResolvedPaths {
        process_cwd: process_cwd.to_path_buf(),
        tmp_root,
        cache_dir,
    }
}
