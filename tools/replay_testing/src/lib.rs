pub mod analyze;
pub mod artifacts;
pub mod cancel;
pub mod config;
pub mod descriptor;
pub mod driver;
pub mod env_file;
pub mod errors;
pub mod filter;
pub mod fixture;
pub mod junit;
pub mod launch;
pub mod lifecycle;
pub mod log_retention;
pub mod logging;
pub mod orchestrator;
pub mod recording;
pub mod registry;
pub mod report;
pub mod runtime;
pub mod summary;
pub mod types;

use artifacts::RunLayout;
use cancel::CancelToken;
use clap::{error::ErrorKind, Parser};
use config::{absolutize_path, load_config, resolve_paths, CliOverrides};
use descriptor::{load_test_file, ReplayTest};
use driver::Driver;
use env_file::{env_to_map, load_env_file};
use errors::ReplayError;
use logging::{append_run_log, init_run_logger, JsonlLogger};
use registry::RunRegistry;
use report::TestReport;
use runtime::ProductionRuntime;
use serde_json::json;
use std::path::{Path, PathBuf};
use summary::print_summary;

pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Clone, Parser)]
#[command(name = "replay_test")]
#[command(about = "Replay recorded fixtures into a launch graph, record its output, and assert on it")]
pub struct Cli {
    /// Replay test file (TOML). Optional with --analyze when the run recorded it.
    #[arg(value_name = "REPLAY_TEST_PATH")]
    pub replay_test_file: Option<PathBuf>,
    /// Re-run only the analyze stage against the artifacts of a previous run.
    #[arg(long, value_name = "RUN_ID")]
    pub analyze: Option<String>,
    /// KEY=VALUE file overlaid on the environment given to resolvers and processes.
    #[arg(long = "env", value_name = "ENV_FILE")]
    pub env_file: Option<PathBuf>,
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Copy the JUnit report to this path.
    #[arg(long = "junit-xml", value_name = "PATH")]
    pub junit_xml: Option<PathBuf>,
    /// Name of the root `testsuites` element; defaults to the test file stem.
    #[arg(long)]
    pub package_name: Option<String>,
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
    /// Print the parameter sets the test would run and exit.
    #[arg(short = 's', long = "show-args", visible_alias = "show-arguments", default_value_t = false)]
    pub show_args: bool,
    #[arg(long)]
    pub tmp_root: Option<PathBuf>,
    #[arg(long = "timeout", value_name = "SECONDS")]
    pub timeout_seconds: Option<u64>,
}

pub fn run() -> Result<i32, ReplayError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let env = std::env::vars_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| ReplayError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    let cancel = CancelToken::new();
    cancel.install_ctrlc_handler()?;
    run_with_runtime(&args, &env, &cwd, &runtime, cancel)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    env: &[(std::ffi::OsString, std::ffi::OsString)],
    cwd: &Path,
    runtime: &ProductionRuntime,
    cancel: CancelToken,
) -> Result<i32, ReplayError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(ReplayError::Cli(error.to_string())),
        },
    };

    let mut env_map = env_to_map(env);
    if let Some(env_file) = &cli.env_file {
        env_map = load_env_file(
            runtime.file_system.as_ref(),
            &absolutize_path(cwd, env_file),
            &env_map,
        )?;
    }

    let cfg = load_config(
        &CliOverrides {
            config_path: cli.config.as_deref().map(|path| absolutize_path(cwd, path)),
            tmp_root: cli.tmp_root.as_deref().map(|path| absolutize_path(cwd, path)),
            timeout_seconds: cli.timeout_seconds,
        },
        runtime.file_system.as_ref(),
    )?;
    let system_temp = env_map
        .get("TMPDIR")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let paths = resolve_paths(cwd, &cfg, &env_map, &system_temp, runtime.file_system.as_ref());

    let test_file = cli
        .replay_test_file
        .as_deref()
        .map(|path| absolutize_path(cwd, path));

    if cli.show_args {
        let path = test_file.ok_or_else(|| {
            ReplayError::Cli("--show-args needs a replay test file".to_string())
        })?;
        let test = load_test_file(runtime.file_system.as_ref(), &path)?;
        show_args(runtime, &test)?;
        return Ok(0);
    }

    // A new run needs a loadable test file before anything is written under tmp_root.
    let (run_id, new_run_test) = match &cli.analyze {
        Some(run_id) => (run_id.clone(), None),
        None => {
            let path = test_file.clone().ok_or_else(|| {
                ReplayError::Cli("REPLAY_TEST_PATH is required unless --analyze is given".to_string())
            })?;
            let test = load_test_file(runtime.file_system.as_ref(), &path)?;
            (uuid::Uuid::new_v4().to_string(), Some(test))
        }
    };
    let layout = RunLayout::new(&paths.tmp_root, &run_id);
    // An unknown --analyze id must not leave a run directory behind.
    if new_run_test.is_some() || runtime.file_system.exists(&layout.run_dir) {
        init_run_logger(JsonlLogger {
            path: layout.log_path(),
            max_payload_bytes: cfg.logging.max_payload_bytes,
            budget_bytes: cfg.logging.disk_budget_bytes,
            echo_debug: cli.verbose,
        });
    }
    let registry = RunRegistry::open_in(&paths.tmp_root)?;

    let (test, record) = match new_run_test {
        Some(test) => (test, None),
        None => {
            let record = registry.lookup(&run_id)?;
            let path = test_file
                .or_else(|| record.test_file.clone())
                .ok_or_else(|| {
                    ReplayError::Cli(format!(
                        "run `{run_id}` did not record its test file; pass REPLAY_TEST_PATH"
                    ))
                })?;
            let test = load_test_file(runtime.file_system.as_ref(), &path)?;
            (test, Some(record))
        }
    };

    append_run_log(
        "info",
        "replay_test.started",
        json!({
            "run_id": run_id,
            "test": test.name,
            "analyze_only": record.is_some(),
            "tmp_root": paths.tmp_root.display().to_string(),
            "cache_dir": paths.cache_dir.display().to_string(),
        }),
    );

    let package_name = cli.package_name.clone().unwrap_or_else(|| {
        test.source_file
            .as_deref()
            .and_then(Path::file_stem)
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| test.name.clone())
    });
    let driver = Driver::new(runtime, &cfg, &paths, &env_map, &registry, cancel, package_name);
    let outcome = match &record {
        Some(record) => driver.analyze_only(&test, record),
        None => driver.run_test(&test, &run_id),
    };
    let report = match outcome {
        Ok(report) => report,
        Err(ReplayError::Cancelled(reason)) => {
            append_run_log("warn", "replay_test.cancelled", json!({"reason": reason}));
            runtime
                .terminal
                .write_line(&format!("cancelled: {reason}"))?;
            if layout.results_xml().is_file() {
                copy_junit(runtime, &cli, cwd, &layout)?;
            }
            return Ok(EXIT_CANCELLED);
        }
        Err(err) => return Err(err),
    };

    finish(runtime, &cli, cwd, &layout, &report)
}

fn show_args(runtime: &ProductionRuntime, test: &ReplayTest) -> Result<(), ReplayError> {
    runtime
        .terminal
        .write_line(&format!("{}: {} parameter set(s)", test.name, test.run.parameters.len()))?;
    for param in &test.run.parameters {
        runtime.terminal.write_line(&format!(
            "  {} params={} use_clock={} playback_rate={}",
            param.name,
            param.params_json(),
            param.runner_args.use_clock,
            param.runner_args.playback_rate
        ))?;
    }
    Ok(())
}

fn finish(
    runtime: &ProductionRuntime,
    cli: &Cli,
    cwd: &Path,
    layout: &RunLayout,
    report: &TestReport,
) -> Result<i32, ReplayError> {
    print_summary(runtime.terminal.as_ref(), report)?;
    copy_junit(runtime, cli, cwd, layout)?;
    append_run_log(
        "info",
        "replay_test.finished",
        json!({"run_id": report.run_id, "passed": report.passed()}),
    );
    Ok(report.exit_code())
}

fn copy_junit(
    runtime: &ProductionRuntime,
    cli: &Cli,
    cwd: &Path,
    layout: &RunLayout,
) -> Result<(), ReplayError> {
    let Some(target) = &cli.junit_xml else {
        return Ok(());
    };
    let target = absolutize_path(cwd, target);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ReplayError::Io(e.to_string()))?;
    }
    std::fs::copy(layout.results_xml(), &target).map_err(|e| {
        ReplayError::Io(format!("copy JUnit report to {}: {e}", target.display()))
    })?;
    runtime
        .terminal
        .write_line(&format!("JUnit report: {}", target.display()))
}
