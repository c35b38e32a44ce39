use crate::cancel::CancelToken;
use crate::config::{AppConfig, CommandsConfig};
use crate::errors::ReplayError;
use crate::launch::{substitute, LaunchContext, LaunchFactory, LaunchProcess};
use crate::logging::append_run_log;
use crate::recording::find_mcap_files;
use crate::runtime::{Clock, ProcessRequest, ProcessRunner};
use crate::types::{EnvMap, ReplayRunParams};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub const OUTPUT_RECORDING_NAME: &str = "output.mcap";
const BAG_DIR_NAME: &str = "recording";
const RECORDER_NAME: &str = "recorder";
const PLAYER_NAME: &str = "player";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub timeout: Duration,
    pub teardown_grace: Duration,
    pub poll_interval: Duration,
    pub clock_hz: u32,
    pub commands: CommandsConfig,
}

impl RunSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            timeout: Duration::from_secs(cfg.run.timeout_seconds),
            teardown_grace: Duration::from_secs(cfg.run.teardown_grace_seconds),
            poll_interval: Duration::from_millis(cfg.run.poll_interval_ms),
            clock_hz: cfg.run.clock_frequency_hz,
            commands: cfg.commands.clone(),
        }
    }
}

pub struct RunRequest<'a> {
    pub fixture_key: &'a str,
    pub filtered_fixture: &'a Path,
    pub param: &'a ReplayRunParams,
    pub param_dir: &'a Path,
    pub launch: &'a dyn LaunchFactory,
    pub qos_overrides: Option<&'a Path>,
    pub env: &'a EnvMap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub param_name: String,
    /// Normalized recording, kept even when the run failed part way.
    pub output: Option<PathBuf>,
    pub failure: Option<String>,
    pub cancelled: bool,
    pub started_at: SystemTime,
    pub duration: Duration,
    pub exit_codes: BTreeMap<String, i32>,
    pub commands: Vec<String>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn error(&self) -> Option<ReplayError> {
        let reason = self.failure.as_ref()?;
        Some(if self.cancelled {
            ReplayError::Cancelled(format!("param `{}`: {reason}", self.param_name))
        } else {
            ReplayError::RunFailed {
                param: self.param_name.clone(),
                reason: reason.clone(),
            }
        })
    }
}

struct Supervised {
    name: String,
    handle: u64,
    exited: bool,
}

enum Stop {
    PlaybackFinished,
    Failed(String),
    Cancelled,
}

pub struct Orchestrator<'a> {
    runner: &'a dyn ProcessRunner,
    clock: &'a dyn Clock,
    settings: RunSettings,
    cancel: CancelToken,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        runner: &'a dyn ProcessRunner,
        clock: &'a dyn Clock,
        settings: RunSettings,
        cancel: CancelToken,
    ) -> Self {
        Self {
            runner,
            clock,
            settings,
            cancel,
        }
    }

    pub fn recorder_args(&self, bag_dir: &Path) -> Result<Vec<String>, ReplayError> {
        let vars = BTreeMap::from([("output".to_string(), bag_dir.display().to_string())]);
        self.settings
            .commands
            .record
            .iter()
            .map(|arg| substitute(arg, &vars))
            .collect()
    }

    pub fn player_args(
        &self,
        fixture: &Path,
        param: &ReplayRunParams,
        qos_overrides: Option<&Path>,
    ) -> Result<Vec<String>, ReplayError> {
        let mut vars = BTreeMap::new();
        vars.insert("fixture".to_string(), fixture.display().to_string());
        vars.insert("rate".to_string(), param.runner_args.playback_rate.to_string());
        vars.insert("clock_hz".to_string(), self.settings.clock_hz.to_string());
        let mut template = self.settings.commands.play.clone();
        if param.runner_args.use_clock {
            template.extend(self.settings.commands.clock_args.iter().cloned());
        }
        if let Some(qos) = qos_overrides {
            vars.insert("qos".to_string(), qos.display().to_string());
            template.extend(self.settings.commands.qos_args.iter().cloned());
        }
        template.iter().map(|arg| substitute(arg, &vars)).collect()
    }

    fn spawn(
        &self,
        name: &str,
        argv: Vec<String>,
        env: Vec<(String, String)>,
        cwd: Option<PathBuf>,
        log_dir: &Path,
        commands: &mut Vec<String>,
    ) -> Result<Supervised, ReplayError> {
        let mut argv = argv.into_iter();
        let program = argv
            .next()
            .ok_or_else(|| ReplayError::InvalidConfig(format!("empty command for `{name}`")))?;
        let request = ProcessRequest {
            program,
            args: argv.collect(),
            cwd,
            env,
            log_path: Some(log_dir.join(format!("{name}.log"))),
        };
        commands.push(request.display_command());
        let handle = self.runner.spawn(request)?;
        append_run_log(
            "debug",
            "run.process.spawned",
            json!({"name": name, "handle": handle}),
        );
        Ok(Supervised {
            name: name.to_string(),
            handle,
            exited: false,
        })
    }

    /// Runs one parameter set end to end. Never returns early without tearing down
    /// what it started; failures are reported in the outcome.
    pub fn run_param(&self, request: &RunRequest<'_>) -> RunOutcome {
        let started_at = self.clock.now();
        let mut outcome = RunOutcome {
            param_name: request.param.name.clone(),
            output: None,
            failure: None,
            cancelled: false,
            started_at,
            duration: Duration::ZERO,
            exit_codes: BTreeMap::new(),
            commands: Vec::new(),
        };
        append_run_log(
            "info",
            "run.param.started",
            json!({
                "fixture": request.fixture_key,
                "param": request.param.name,
                "use_clock": request.param.runner_args.use_clock,
                "playback_rate": request.param.runner_args.playback_rate,
            }),
        );

        let bag_dir = request.param_dir.join(BAG_DIR_NAME);
        let mut processes = Vec::new();
        let stop = match self.bring_up(request, &bag_dir, &mut processes, &mut outcome.commands) {
            Ok(()) => self.supervise(&mut processes, &mut outcome.exit_codes),
            Err(err) => Stop::Failed(err.to_string()),
        };
        self.teardown(&mut processes, &mut outcome.exit_codes);

        match stop {
            Stop::PlaybackFinished => {}
            Stop::Failed(reason) => outcome.failure = Some(reason),
            Stop::Cancelled => {
                outcome.cancelled = true;
                outcome.failure = Some("cancelled by user".to_string());
            }
        }

        match normalize_recording(&bag_dir, request.param_dir) {
            Ok(Some(path)) => outcome.output = Some(path),
            Ok(None) => {
                if outcome.failure.is_none() {
                    outcome.failure = Some(format!(
                        "recorder produced no .mcap under {}",
                        bag_dir.display()
                    ));
                }
            }
            Err(err) => {
                if outcome.failure.is_none() {
                    outcome.failure = Some(err.to_string());
                }
            }
        }

        outcome.duration = self
            .clock
            .now()
            .duration_since(started_at)
            .unwrap_or(Duration::ZERO);
        append_run_log(
            if outcome.succeeded() { "info" } else { "error" },
            "run.param.finished",
            json!({
                "fixture": request.fixture_key,
                "param": request.param.name,
                "failure": outcome.failure,
                "cancelled": outcome.cancelled,
                "output": outcome.output.as_ref().map(|p| p.display().to_string()),
                "exit_codes": outcome.exit_codes,
                "duration_ms": outcome.duration.as_millis() as u64,
            }),
        );
        outcome
    }

    fn bring_up(
        &self,
        request: &RunRequest<'_>,
        bag_dir: &Path,
        processes: &mut Vec<Supervised>,
        commands: &mut Vec<String>,
    ) -> Result<(), ReplayError> {
        let log_dir = request.param_dir.join("logs");
        std::fs::create_dir_all(&log_dir).map_err(|e| ReplayError::Io(e.to_string()))?;
        if bag_dir.exists() {
            std::fs::remove_dir_all(bag_dir).map_err(|e| ReplayError::Io(e.to_string()))?;
        }

        let launch_ctx = LaunchContext {
            fixture_key: request.fixture_key.to_string(),
            filtered_fixture: request.filtered_fixture.to_path_buf(),
            param_dir: request.param_dir.to_path_buf(),
        };
        let launched = request
            .launch
            .launch_description(request.param, &launch_ctx)
            .map_err(|e| ReplayError::RunFailed {
                param: request.param.name.clone(),
                reason: format!("launch description: {e}"),
            })?;

        let mut base_env = request
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Vec<_>>();
        base_env.push(("REPLAY_PARAMS".to_string(), request.param.params_json()));
        base_env.push(("PYTHONUNBUFFERED".to_string(), "1".to_string()));

        processes.push(self.spawn(
            RECORDER_NAME,
            self.recorder_args(bag_dir)?,
            base_env.clone(),
            None,
            &log_dir,
            commands,
        )?);

        for LaunchProcess {
            name,
            program,
            args,
            env,
            cwd,
        } in launched
        {
            let mut argv = vec![program];
            argv.extend(args);
            let mut process_env = base_env.clone();
            process_env.extend(env);
            processes.push(self.spawn(&name, argv, process_env, cwd, &log_dir, commands)?);
        }

        processes.push(self.spawn(
            PLAYER_NAME,
            self.player_args(request.filtered_fixture, request.param, request.qos_overrides)?,
            base_env,
            None,
            &log_dir,
            commands,
        )?);
        Ok(())
    }

    /// Polls until the player exits, something crashes, the timeout elapses, or the
    /// run is cancelled.
    fn supervise(&self, processes: &mut [Supervised], exit_codes: &mut BTreeMap<String, i32>) -> Stop {
        let deadline = self.clock.now() + self.settings.timeout;
        let Some(player_index) = processes.iter().position(|p| p.name == PLAYER_NAME) else {
            return Stop::Failed("player was not started".to_string());
        };

        loop {
            if self.cancel.is_cancelled() {
                return Stop::Cancelled;
            }

            // Player first: its clean exit is the normal end of a run.
            let mut order = vec![player_index];
            order.extend((0..processes.len()).filter(|index| *index != player_index));
            for index in order {
                let process = &mut processes[index];
                if process.exited {
                    continue;
                }
                let polled = match self.runner.try_wait(process.handle) {
                    Ok(polled) => polled,
                    Err(err) => return Stop::Failed(format!("poll `{}`: {err}", process.name)),
                };
                let Some(output) = polled else {
                    continue;
                };
                process.exited = true;
                exit_codes.insert(process.name.clone(), output.exit_code);
                append_run_log(
                    "debug",
                    "run.process.exited",
                    json!({"name": process.name, "exit_code": output.exit_code}),
                );
                if process.name == PLAYER_NAME {
                    if output.exit_code == 0 {
                        return Stop::PlaybackFinished;
                    }
                    return Stop::Failed(format!("player exited with {}", output.exit_code));
                }
                if process.name == RECORDER_NAME {
                    return Stop::Failed(format!(
                        "recorder exited early with {}",
                        output.exit_code
                    ));
                }
                if output.exit_code != 0 {
                    return Stop::Failed(format!(
                        "process `{}` crashed with {}",
                        process.name, output.exit_code
                    ));
                }
            }

            if self.clock.now() >= deadline {
                return Stop::Failed(format!(
                    "timed out after {}s",
                    self.settings.timeout.as_secs()
                ));
            }
            if let Err(err) = self.clock.sleep(self.settings.poll_interval) {
                return Stop::Failed(err.to_string());
            }
        }
    }

    /// Stops everything still running, newest first, so the recorder is the last to go
    /// and captures whatever the launch graph published while shutting down.
    fn teardown(&self, processes: &mut [Supervised], exit_codes: &mut BTreeMap<String, i32>) {
        for process in processes.iter_mut().rev() {
            if process.exited {
                // The leader is gone but its group may not be.
                if let Err(err) = self.runner.interrupt(process.handle) {
                    append_run_log(
                        "debug",
                        "run.teardown.group_interrupt_failed",
                        json!({"name": process.name, "error": err.to_string()}),
                    );
                }
                continue;
            }
            if let Err(err) = self.runner.interrupt(process.handle) {
                append_run_log(
                    "warn",
                    "run.teardown.interrupt_failed",
                    json!({"name": process.name, "error": err.to_string()}),
                );
            }
            let grace_deadline = self.clock.now() + self.settings.teardown_grace;
            loop {
                match self.runner.try_wait(process.handle) {
                    Ok(Some(output)) => {
                        exit_codes.insert(process.name.clone(), output.exit_code);
                        break;
                    }
                    Ok(None) if self.clock.now() < grace_deadline => {
                        let _ = self.clock.sleep(self.settings.poll_interval);
                    }
                    Ok(None) | Err(_) => {
                        append_run_log(
                            "warn",
                            "run.teardown.killed",
                            json!({"name": process.name}),
                        );
                        if let Err(err) = self.runner.kill(process.handle) {
                            append_run_log(
                                "error",
                                "run.teardown.kill_failed",
                                json!({"name": process.name, "error": err.to_string()}),
                            );
                        }
                        break;
                    }
                }
            }
            process.exited = true;
        }
    }
}

/// Moves the first `.mcap` the recorder wrote to `output.mcap` next to it and drops
/// the recorder's directory.
pub fn normalize_recording(bag_dir: &Path, param_dir: &Path) -> Result<Option<PathBuf>, ReplayError> {
    if !bag_dir.is_dir() {
        return Ok(None);
    }
    let Some(first) = find_mcap_files(bag_dir)?.into_iter().next() else {
        return Ok(None);
    };
    let destination = param_dir.join(OUTPUT_RECORDING_NAME);
    std::fs::rename(&first, &destination).map_err(|e| ReplayError::Io(e.to_string()))?;
    std::fs::remove_dir_all(bag_dir).map_err(|e| ReplayError::Io(e.to_string()))?;
    Ok(Some(destination))
}
