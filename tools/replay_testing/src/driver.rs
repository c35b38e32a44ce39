//! Sequences one replay test through FILTERING, RUNNING and ANALYZING, and
//! re-analyzes a finished run by id.

use crate::analyze::{run_assertions, AnalyzeTarget};
use crate::artifacts::{read_run_metadata, write_run_metadata, RunLayout, RunMetadata};
use crate::cancel::CancelToken;
use crate::config::AppConfig;
use crate::descriptor::ReplayTest;
use crate::errors::ReplayError;
use crate::filter::filter_fixture;
use crate::fixture::{resolve_fixture, FetchContext};
use crate::junit::write_junit;
use crate::lifecycle::{Lifecycle, ParamProgress, ParamStatus, Stage};
use crate::logging::append_run_log;
use crate::orchestrator::{Orchestrator, RunOutcome, RunRequest, RunSettings};
use crate::registry::{NewRun, ParamRecord, RunRecord, RunRegistry};
use crate::report::{FixtureFailure, ParamReport, TestReport};
use crate::runtime::ProductionRuntime;
use crate::summary::stage_banner;
use crate::types::{EnvMap, FixtureSource, ReplayRunParams, ResolvedPaths};
use serde_json::json;
use std::path::PathBuf;
use std::time::{Duration, UNIX_EPOCH};

pub struct Driver<'a> {
    runtime: &'a ProductionRuntime,
    config: &'a AppConfig,
    paths: &'a ResolvedPaths,
    env: &'a EnvMap,
    registry: &'a RunRegistry,
    cancel: CancelToken,
    package_name: String,
}

/// A fixture that made it through FILTERING.
struct PreparedFixture {
    key: String,
    filtered: PathBuf,
    lifecycle: Lifecycle,
}

impl<'a> Driver<'a> {
    pub fn new(
        runtime: &'a ProductionRuntime,
        config: &'a AppConfig,
        paths: &'a ResolvedPaths,
        env: &'a EnvMap,
        registry: &'a RunRegistry,
        cancel: CancelToken,
        package_name: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            config,
            paths,
            env,
            registry,
            cancel,
            package_name: package_name.into(),
        }
    }

    fn banner(&self, stage: &str) -> Result<(), ReplayError> {
        append_run_log("info", "driver.stage.started", json!({"stage": stage}));
        self.runtime.terminal.write_line(&stage_banner(stage))
    }

    /// Full invocation. Resolver and filter failures only cost their own fixture;
    /// `Err` is reserved for cancellation and infrastructure errors.
    pub fn run_test(&self, test: &ReplayTest, run_id: &str) -> Result<TestReport, ReplayError> {
        let layout = RunLayout::new(&self.paths.tmp_root, run_id);
        self.runtime.file_system.create_dir_all(&layout.run_dir)?;
        self.registry.create_run(NewRun {
            run_id: run_id.to_string(),
            test_name: test.name.clone(),
            test_file: test.source_file.clone(),
            run_dir: layout.run_dir.clone(),
        })?;
        append_run_log(
            "info",
            "driver.run.started",
            json!({
                "run_id": run_id,
                "test": test.name,
                "fixtures": test.fixture_keys(),
                "params": test.param_names(),
            }),
        );
        let mut report = TestReport::new(&test.name, run_id, layout.run_dir.clone());

        self.banner("FIXTURES")?;
        self.registry.set_stage(run_id, Stage::Filtering)?;
        let mut prepared = Vec::new();
        for source in &test.fixtures.sources {
            let key = source.key();
            let mut lifecycle = Lifecycle::new(&test.param_names());
            lifecycle.transition(Stage::Filtering)?;
            match self.prepare_fixture(test, source, &layout) {
                Ok(filtered) => prepared.push(PreparedFixture {
                    key,
                    filtered,
                    lifecycle,
                }),
                Err(err) => {
                    lifecycle.fail(err.to_string())?;
                    append_run_log(
                        "error",
                        "driver.fixture.failed",
                        json!({"fixture": key, "source": source.describe(), "error": err.to_string()}),
                    );
                    self.runtime
                        .terminal
                        .write_line(&format!("fixture {key} failed: {err}"))?;
                    report.fixture_failures.push(FixtureFailure {
                        fixture_key: key,
                        source: source.describe(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        if prepared.is_empty() {
            self.registry.set_stage(run_id, Stage::Failed)?;
            self.finish_report(&layout, &report)?;
            return Ok(report);
        }

        self.banner("RUN")?;
        self.registry.set_stage(run_id, Stage::Running)?;
        let orchestrator = Orchestrator::new(
            self.runtime.process_runner.as_ref(),
            self.runtime.clock.as_ref(),
            RunSettings::from_config(self.config),
            self.cancel.clone(),
        );
        let mut cancelled = None;
        'fixtures: for fixture in &mut prepared {
            fixture.lifecycle.transition(Stage::Running)?;
            for param in &test.run.parameters {
                let outcome = self.run_one(test, &orchestrator, &layout, fixture, param, run_id)?;
                if outcome.cancelled {
                    fixture.lifecycle.fail("cancelled")?;
                    cancelled = Some(outcome.error().unwrap_or_else(|| {
                        ReplayError::Cancelled(format!("param `{}`", param.name))
                    }));
                    break 'fixtures;
                }
            }
        }
        if let Some(err) = cancelled {
            self.registry.set_stage(run_id, Stage::Failed)?;
            for fixture in &prepared {
                for progress in &fixture.lifecycle.params {
                    if let Some(param_report) =
                        self.finished_param_report(test, &layout, &fixture.key, progress)
                    {
                        report.params.push(param_report);
                    }
                }
            }
            self.finish_report(&layout, &report)?;
            self.runtime.terminal.write_line(&format!(
                "Cancelled. Artifacts: {}",
                layout.run_dir.display()
            ))?;
            return Err(err);
        }

        self.banner("ANALYZE")?;
        self.registry.set_stage(run_id, Stage::Analyzing)?;
        for fixture in &mut prepared {
            fixture.lifecycle.transition(Stage::Analyzing)?;
            for progress in &fixture.lifecycle.params {
                if let Some(param_report) =
                    self.finished_param_report(test, &layout, &fixture.key, progress)
                {
                    report.params.push(param_report);
                }
            }
            fixture.lifecycle.transition(Stage::Done)?;
        }

        self.registry.set_stage(run_id, Stage::Done)?;
        self.finish_report(&layout, &report)?;
        Ok(report)
    }

    fn prepare_fixture(
        &self,
        test: &ReplayTest,
        source: &FixtureSource,
        layout: &RunLayout,
    ) -> Result<PathBuf, ReplayError> {
        let key = source.key();
        let ctx = FetchContext {
            process_runner: self.runtime.process_runner.as_ref(),
            file_system: self.runtime.file_system.as_ref(),
            env: self.env,
            base_dir: &test.base_dir,
            cache_dir: &self.paths.cache_dir,
            cache_policy: self.config.cache.policy,
        };
        let input = resolve_fixture(source, &ctx, &layout.input_dir(&key))?;
        let filtered = layout.filtered_fixture(&key);
        let filter_report = filter_fixture(&input, &filtered, &test.fixtures.topics)?;
        self.runtime.terminal.write_line(&format!(
            "fixture {key}: kept {} message(s) on {} topic(s), dropped {} topic(s)",
            filter_report.kept_messages(),
            filter_report.kept.len(),
            filter_report.dropped.len()
        ))?;
        Ok(filtered)
    }

    fn run_one(
        &self,
        test: &ReplayTest,
        orchestrator: &Orchestrator<'_>,
        layout: &RunLayout,
        fixture: &mut PreparedFixture,
        param: &ReplayRunParams,
        run_id: &str,
    ) -> Result<RunOutcome, ReplayError> {
        fixture.lifecycle.start_param(&param.name)?;
        self.registry.record_param(
            run_id,
            ParamRecord {
                fixture_key: fixture.key.clone(),
                param_name: param.name.clone(),
                status: ParamStatus::Running,
                output_path: None,
                failure: None,
            },
        )?;
        self.runtime.terminal.write_line(&format!(
            "running {} [{}] against {}",
            test.name, param.name, fixture.key
        ))?;

        let param_dir = layout.param_dir(&fixture.key, &param.name);
        self.runtime.file_system.create_dir_all(&param_dir)?;
        let outcome = orchestrator.run_param(&RunRequest {
            fixture_key: &fixture.key,
            filtered_fixture: &fixture.filtered,
            param,
            param_dir: &param_dir,
            launch: test.run.launch.as_ref(),
            qos_overrides: test.run.qos_overrides.as_deref(),
            env: self.env,
        });

        let status = if outcome.succeeded() {
            ParamStatus::Recorded
        } else {
            ParamStatus::Failed
        };
        fixture.lifecycle.finish_param(
            &param.name,
            match &outcome.failure {
                None => Ok(()),
                Some(reason) => Err(reason.clone()),
            },
        )?;
        write_run_metadata(
            &layout.run_metadata(&fixture.key, &param.name),
            &RunMetadata {
                run_id: run_id.to_string(),
                test_name: test.name.clone(),
                fixture_key: fixture.key.clone(),
                fixture_source: test
                    .fixtures
                    .sources
                    .iter()
                    .find(|source| source.key() == fixture.key)
                    .map(FixtureSource::describe)
                    .unwrap_or_default(),
                param: param.clone(),
                filtered_fixture: fixture.filtered.clone(),
                output: outcome.output.clone(),
                status,
                failure: outcome.failure.clone(),
                started_at_unix_ms: outcome
                    .started_at
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0),
                duration_ms: outcome.duration.as_millis() as u64,
                exit_codes: outcome.exit_codes.clone(),
                commands: outcome.commands.clone(),
            },
        )?;
        self.registry.record_param(
            run_id,
            ParamRecord {
                fixture_key: fixture.key.clone(),
                param_name: param.name.clone(),
                status,
                output_path: outcome.output.clone(),
                failure: outcome.failure.clone(),
            },
        )?;
        if let Some(err) = outcome.error() {
            self.runtime.terminal.write_line(&err.to_string())?;
        }
        Ok(outcome)
    }

    /// Report for a param that left RUNNING, or `None` if it never started.
    fn finished_param_report(
        &self,
        test: &ReplayTest,
        layout: &RunLayout,
        fixture_key: &str,
        progress: &ParamProgress,
    ) -> Option<ParamReport> {
        let param = test.param(&progress.name)?;
        let run_failure = match progress.status {
            ParamStatus::Recorded => None,
            ParamStatus::Failed => Some(
                progress
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "run did not complete".to_string()),
            ),
            ParamStatus::Pending | ParamStatus::Running => return None,
        };
        let duration_ms = read_run_metadata(&layout.run_metadata(fixture_key, &param.name))
            .map(|m| m.duration_ms)
            .unwrap_or(0);
        Some(self.analyze_param(test, layout, fixture_key, param, duration_ms, run_failure))
    }

    /// Runs the assertions against the param's recording. A failed run is still
    /// analyzed when it left a recording behind; its failure stays on the report.
    fn analyze_param(
        &self,
        test: &ReplayTest,
        layout: &RunLayout,
        fixture_key: &str,
        param: &ReplayRunParams,
        duration_ms: u64,
        run_failure: Option<String>,
    ) -> ParamReport {
        let output = layout.output_recording(fixture_key, &param.name);
        let filtered = layout.filtered_fixture(fixture_key);
        if run_failure.is_some() && !self.runtime.file_system.exists(&output) {
            return ParamReport {
                fixture_key: fixture_key.to_string(),
                param_name: param.name.clone(),
                filtered_fixture: filtered,
                output: None,
                run_failure,
                results: Vec::new(),
                duration_ms,
            };
        }
        append_run_log(
            "info",
            "driver.param.analyzing",
            json!({
                "fixture": fixture_key,
                "param": param.name,
                "run_failure": run_failure.as_deref(),
            }),
        );
        let results = run_assertions(
            &test.analyze,
            &AnalyzeTarget {
                test_name: &test.name,
                fixture_key,
                param,
                recording_path: &output,
                filtered_fixture: &filtered,
                command_timeout: Duration::from_secs(self.config.run.timeout_seconds),
            },
            self.runtime.process_runner.as_ref(),
            self.runtime.clock.as_ref(),
            self.env,
        );
        ParamReport {
            fixture_key: fixture_key.to_string(),
            param_name: param.name.clone(),
            filtered_fixture: filtered,
            output: Some(output),
            run_failure,
            results,
            duration_ms,
        }
    }

    /// Re-runs only the analyze stage against the artifacts of a finished run.
    pub fn analyze_only(&self, test: &ReplayTest, record: &RunRecord) -> Result<TestReport, ReplayError> {
        let layout = RunLayout::new(
            record.run_dir.parent().unwrap_or(self.paths.tmp_root.as_path()),
            &record.run_id,
        );
        if record.test_name != test.name {
            append_run_log(
                "warn",
                "driver.analyze_only.test_name_mismatch",
                json!({"recorded": record.test_name, "given": test.name}),
            );
        }
        append_run_log(
            "info",
            "driver.analyze_only.started",
            json!({"run_id": record.run_id, "run_dir": record.run_dir.display().to_string()}),
        );
        self.banner("ANALYZE")?;
        let mut report = TestReport::new(&test.name, &record.run_id, record.run_dir.clone());

        for source in &test.fixtures.sources {
            let key = source.key();
            let recorded = record
                .params
                .iter()
                .filter(|param| param.fixture_key == key)
                .collect::<Vec<_>>();
            if recorded.is_empty() {
                report.fixture_failures.push(FixtureFailure {
                    fixture_key: key.clone(),
                    source: source.describe(),
                    reason: format!("run `{}` has no recorded runs for this fixture", record.run_id),
                });
                continue;
            }

            let names = recorded.iter().map(|p| p.param_name.clone()).collect::<Vec<_>>();
            let mut lifecycle = Lifecycle::new(&names);
            lifecycle.transition(Stage::Analyzing)?;
            for param_record in recorded {
                let metadata =
                    read_run_metadata(&layout.run_metadata(&key, &param_record.param_name)).ok();
                let duration_ms = metadata.as_ref().map(|m| m.duration_ms).unwrap_or(0);
                let param = test
                    .param(&param_record.param_name)
                    .cloned()
                    .or_else(|| metadata.as_ref().map(|m| m.param.clone()));
                match (param_record.status, param) {
                    (ParamStatus::Recorded, Some(param)) => {
                        report.params.push(
                            self.analyze_param(test, &layout, &key, &param, duration_ms, None),
                        );
                    }
                    (ParamStatus::Failed, Some(param)) => {
                        let reason = param_record
                            .failure
                            .clone()
                            .unwrap_or_else(|| "run did not complete".to_string());
                        report.params.push(self.analyze_param(
                            test,
                            &layout,
                            &key,
                            &param,
                            duration_ms,
                            Some(reason),
                        ));
                    }
                    (status, _) => {
                        let reason = param_record.failure.clone().unwrap_or_else(|| {
                            format!("run ended in status {}", status.as_str())
                        });
                        report.params.push(ParamReport {
                            fixture_key: key.clone(),
                            param_name: param_record.param_name.clone(),
                            filtered_fixture: layout.filtered_fixture(&key),
                            output: param_record.output_path.clone(),
                            run_failure: Some(reason),
                            results: Vec::new(),
                            duration_ms,
                        });
                    }
                }
            }
            lifecycle.transition(Stage::Done)?;
        }

        self.finish_report(&layout, &report)?;
        Ok(report)
    }

    fn finish_report(&self, layout: &RunLayout, report: &TestReport) -> Result<(), ReplayError> {
        write_junit(&layout.results_xml(), &self.package_name, report)?;
        append_run_log(
            "info",
            "driver.run.finished",
            json!({
                "run_id": report.run_id,
                "passed": report.passed(),
                "params": report.params.len(),
                "fixture_failures": report.fixture_failures.len(),
            }),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::{assertion, AssertionOutcome};
    use crate::launch::{LaunchContext, LaunchProcess};
    use crate::runtime::{
        FakeClock, FakeProcessRunner, FakeTerminal, ProcessOutput, ProductionFileSystem,
    };
    use std::collections::BTreeMap;
    use std::io::BufWriter;
    use std::path::Path;
    use std::sync::Arc;

    fn write_fixture(path: &Path, topics: &[&str]) {
        let file = std::fs::File::create(path).expect("create");
        let mut writer = mcap::Writer::new(BufWriter::new(file)).expect("writer");
        let schema = writer
            .add_schema("geometry_msgs/msg/Twist", "ros2msg", b"")
            .expect("schema");
        for (seq, topic) in topics.iter().enumerate() {
            let channel = writer
                .add_channel(schema, topic, "cdr", &BTreeMap::new())
                .expect("channel");
            writer
                .write_to_known_channel(
                    &mcap::records::MessageHeader {
                        channel_id: channel,
                        sequence: seq as u32,
                        log_time: seq as u64,
                        publish_time: seq as u64,
                    },
                    b"x",
                )
                .expect("message");
        }
        writer.finish().expect("finish");
    }

    struct Harness {
        _dir: tempfile::TempDir,
        root: PathBuf,
        runtime: ProductionRuntime,
        runner: FakeProcessRunner,
        terminal: FakeTerminal,
        config: AppConfig,
        paths: ResolvedPaths,
        registry: RunRegistry,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        let runner = FakeProcessRunner::default();
        let terminal = FakeTerminal::new(false);
        let runtime = ProductionRuntime {
            clock: Arc::new(FakeClock::default()),
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(runner.clone()),
            terminal: Arc::new(terminal.clone()),
        };
        let paths = ResolvedPaths {
            process_cwd: root.clone(),
            tmp_root: root.join("tmp"),
            cache_dir: root.join("cache"),
        };
        let registry = RunRegistry::open_in(&paths.tmp_root).expect("registry");
        Harness {
            _dir: dir,
            root,
            runtime,
            runner,
            terminal,
            config: AppConfig::default(),
            paths,
            registry,
        }
    }

    fn test_with(root: &Path, fixtures: &[&str], params: &[&str]) -> ReplayTest {
        let mut builder = ReplayTest::builder("basic_replay")
            .base_dir(root)
            .required_input_topics(["/vehicle/cmd_vel"])
            .expected_output_topics(["/user/cmd_vel"])
            .launch(
                |_params: &ReplayRunParams,
                 _ctx: &LaunchContext|
                 -> Result<Vec<LaunchProcess>, ReplayError> {
                    Ok(vec![LaunchProcess::new("node", "my_node", Vec::new())])
                },
            )
            .assertion(assertion("always_passes", |_ctx| Ok(())));
        for fixture in fixtures {
            builder = builder.source(FixtureSource::Local(PathBuf::from(fixture)));
        }
        for name in params {
            builder = builder.parameter(ReplayRunParams {
                name: name.to_string(),
                ..ReplayRunParams::default_set()
            });
        }
        builder.build().expect("test")
    }

    /// Like `test_with`, but the launch graph leaves a recording with `/user/cmd_vel`
    /// where the recorder would, and the assertion needs that topic.
    fn recording_test(root: &Path, params: &[&str]) -> ReplayTest {
        let mut builder = ReplayTest::builder("basic_replay")
            .base_dir(root)
            .source(FixtureSource::Local(PathBuf::from("cmd_vel_only.mcap")))
            .required_input_topics(["/vehicle/cmd_vel"])
            .expected_output_topics(["/user/cmd_vel"])
            .launch(
                |_params: &ReplayRunParams,
                 ctx: &LaunchContext|
                 -> Result<Vec<LaunchProcess>, ReplayError> {
                    let bag = ctx.param_dir.join("recording");
                    std::fs::create_dir_all(&bag).expect("bag dir");
                    write_fixture(&bag.join("rec_0.mcap"), &["/user/cmd_vel"]);
                    Ok(vec![LaunchProcess::new("node", "my_node", Vec::new())])
                },
            )
            .assertion(assertion("test_cmd_vel", |ctx| {
                let counts = ctx.recording.message_counts()?;
                ctx.ensure(counts.contains_key("/user/cmd_vel"), "no /user/cmd_vel")
            }));
        for name in params {
            builder = builder.parameter(ReplayRunParams {
                name: name.to_string(),
                ..ReplayRunParams::default_set()
            });
        }
        builder.build().expect("test")
    }

    fn exited(code: i32) -> Result<ProcessOutput, ReplayError> {
        Ok(ProcessOutput {
            exit_code: code,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    #[test]
    fn missing_required_topic_fails_only_that_fixture() {
        let h = harness();
        write_fixture(&h.root.join("bad.mcap"), &["/other"]);
        let test = test_with(&h.root, &["bad.mcap"], &[]);
        let env = EnvMap::new();
        let driver = Driver::new(
            &h.runtime, &h.config, &h.paths, &env, &h.registry, CancelToken::new(), "pkg",
        );

        let report = driver.run_test(&test, "run-a").expect("report");
        assert_eq!(report.fixture_failures.len(), 1);
        assert!(report.fixture_failures[0].reason.contains("/vehicle/cmd_vel"));
        assert!(!report.passed());
        assert!(h.runner.spawned().is_empty());
        assert_eq!(h.registry.lookup("run-a").expect("lookup").stage, Stage::Failed);
        assert!(h.paths.tmp_root.join("run-a/results.xml").is_file());
    }

    #[test]
    fn passing_param_is_analyzed_next_to_a_failing_sibling() {
        let h = harness();
        write_fixture(&h.root.join("cmd_vel_only.mcap"), &["/vehicle/cmd_vel"]);
        let test = recording_test(&h.root, &["good", "broken"]);
        // good: player exits 0, then node and recorder stop on interrupt.
        h.runner.push_response(exited(0));
        h.runner.push_response(exited(0));
        h.runner.push_response(exited(0));
        // broken: player exits 2; node and recorder are killed after the grace period.
        h.runner.push_response(exited(2));
        let env = EnvMap::new();
        let driver = Driver::new(
            &h.runtime, &h.config, &h.paths, &env, &h.registry, CancelToken::new(), "pkg",
        );

        let report = driver.run_test(&test, "run-e").expect("report");
        assert_eq!(report.params.len(), 2);

        let good = &report.params[0];
        assert_eq!(good.param_name, "good");
        assert!(good.passed());
        assert_eq!(good.results.len(), 1);
        assert_eq!(good.results[0].outcome, AssertionOutcome::Passed);

        let broken = &report.params[1];
        assert_eq!(broken.param_name, "broken");
        assert_eq!(broken.run_failure.as_deref(), Some("player exited with 2"));
        assert!(!broken.passed());
        assert!(!report.passed());

        let record = h.registry.lookup("run-e").expect("lookup");
        assert_eq!(
            record.params.iter().map(|p| (p.param_name.as_str(), p.status)).collect::<Vec<_>>(),
            vec![("good", ParamStatus::Recorded), ("broken", ParamStatus::Failed)]
        );
        let xml = std::fs::read_to_string(h.paths.tmp_root.join("run-e/results.xml")).expect("xml");
        assert!(xml.contains("pkg.cmd_vel_only.good"));
        assert!(xml.contains("player exited with 2"));
    }

    #[test]
    fn timed_out_param_with_a_recording_is_still_analyzed() {
        let mut h = harness();
        h.config.run.timeout_seconds = 2;
        write_fixture(&h.root.join("cmd_vel_only.mcap"), &["/vehicle/cmd_vel"]);
        let test = recording_test(&h.root, &["slow"]);
        let env = EnvMap::new();
        let driver = Driver::new(
            &h.runtime, &h.config, &h.paths, &env, &h.registry, CancelToken::new(), "pkg",
        );

        let report = driver.run_test(&test, "run-f").expect("report");
        let slow = &report.params[0];
        assert_eq!(slow.run_failure.as_deref(), Some("timed out after 2s"));
        assert_eq!(
            slow.output,
            Some(h.paths.tmp_root.join("run-f/cmd_vel_only/runs/slow/output.mcap"))
        );
        assert_eq!(
            slow.results.iter().map(|r| (r.assertion.as_str(), &r.outcome)).collect::<Vec<_>>(),
            vec![("test_cmd_vel", &AssertionOutcome::Passed)]
        );
        assert!(!report.passed());
        assert_eq!(report.exit_code(), 1);

        let record = h.registry.lookup("run-f").expect("lookup");
        assert_eq!(record.params[0].status, ParamStatus::Failed);
        let again = driver.analyze_only(&test, &record).expect("analyze");
        assert_eq!(again.params[0].run_failure.as_deref(), Some("timed out after 2s"));
        assert_eq!(again.params[0].results.len(), 1);
        assert_eq!(again.params[0].results[0].outcome, AssertionOutcome::Passed);
    }

    #[test]
    fn failed_params_without_recordings_report_only_the_run_failure() {
        let mut h = harness();
        h.config.run.timeout_seconds = 2;
        write_fixture(&h.root.join("cmd_vel_only.mcap"), &["/vehicle/cmd_vel", "/user/cmd_vel"]);
        let test = test_with(&h.root, &["cmd_vel_only.mcap"], &["broken", "slow"]);
        // Only the first player exits; the second param runs into the timeout.
        h.runner.push_response(exited(2));
        let env = EnvMap::new();
        let driver = Driver::new(
            &h.runtime, &h.config, &h.paths, &env, &h.registry, CancelToken::new(), "pkg",
        );

        let report = driver.run_test(&test, "run-b").expect("report");
        let runs = h.paths.tmp_root.join("run-b/cmd_vel_only/runs");
        assert!(runs.join("broken/run.json").is_file());
        assert!(runs.join("slow/run.json").is_file());

        assert_eq!(report.params.len(), 2);
        assert!(report.params[0]
            .run_failure
            .as_deref()
            .is_some_and(|reason| reason.contains("player")));
        assert!(report.params[0].results.is_empty());
        assert!(report.params[1]
            .run_failure
            .as_deref()
            .is_some_and(|reason| reason.contains("timed out")));

        let record = h.registry.lookup("run-b").expect("lookup");
        assert_eq!(record.stage, Stage::Done);
        assert_eq!(record.params.len(), 2);
        assert!(record.params.iter().all(|p| p.status == ParamStatus::Failed));
        assert!(h
            .terminal
            .written_lines()
            .iter()
            .any(|line| line.contains("STAGE RUN STARTING")));
    }

    #[test]
    fn analyze_only_reuses_recorded_output() {
        let h = harness();
        write_fixture(&h.root.join("cmd_vel_only.mcap"), &["/vehicle/cmd_vel"]);
        let test = ReplayTest {
            analyze: vec![
                assertion("has_cmd_vel", |ctx| {
                    let counts = ctx.recording.message_counts()?;
                    ctx.ensure(counts.contains_key("/user/cmd_vel"), "no /user/cmd_vel")
                }),
            ],
            ..test_with(&h.root, &["cmd_vel_only.mcap"], &[])
        };
        let layout = RunLayout::new(&h.paths.tmp_root, "run-c");
        std::fs::create_dir_all(layout.param_dir("cmd_vel_only", "default")).expect("dirs");
        write_fixture(&layout.output_recording("cmd_vel_only", "default"), &["/user/cmd_vel"]);
        h.registry
            .create_run(NewRun {
                run_id: "run-c".to_string(),
                test_name: "basic_replay".to_string(),
                test_file: None,
                run_dir: layout.run_dir.clone(),
            })
            .expect("create");
        h.registry
            .record_param(
                "run-c",
                ParamRecord {
                    fixture_key: "cmd_vel_only".to_string(),
                    param_name: "default".to_string(),
                    status: ParamStatus::Recorded,
                    output_path: Some(layout.output_recording("cmd_vel_only", "default")),
                    failure: None,
                },
            )
            .expect("param");

        let env = EnvMap::new();
        let driver = Driver::new(
            &h.runtime, &h.config, &h.paths, &env, &h.registry, CancelToken::new(), "pkg",
        );
        let record = h.registry.lookup("run-c").expect("lookup");
        let first = driver.analyze_only(&test, &record).expect("analyze");
        let second = driver.analyze_only(&test, &record).expect("analyze again");
        assert!(first.passed());
        assert_eq!(first.params[0].results[0].outcome, AssertionOutcome::Passed);
        assert_eq!(
            first.rows().iter().map(|r| r.status).collect::<Vec<_>>(),
            second.rows().iter().map(|r| r.status).collect::<Vec<_>>()
        );
        assert!(h.runner.spawned().is_empty());
    }

    #[test]
    fn cancellation_fails_the_current_param_and_propagates() {
        let h = harness();
        write_fixture(&h.root.join("cmd_vel_only.mcap"), &["/vehicle/cmd_vel"]);
        let test = test_with(&h.root, &["cmd_vel_only.mcap"], &["a", "b"]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let env = EnvMap::new();
        let driver = Driver::new(&h.runtime, &h.config, &h.paths, &env, &h.registry, cancel, "pkg");

        let err = driver.run_test(&test, "run-d").expect_err("cancelled");
        assert!(matches!(err, ReplayError::Cancelled(_)));
        let record = h.registry.lookup("run-d").expect("lookup");
        assert_eq!(record.stage, Stage::Failed);
        assert_eq!(record.params.len(), 1);
        assert_eq!(record.params[0].status, ParamStatus::Failed);

        // The param that was cancelled is reported; the one that never started is not.
        let xml = std::fs::read_to_string(h.paths.tmp_root.join("run-d/results.xml")).expect("xml");
        assert!(xml.contains("pkg.cmd_vel_only.a"));
        assert!(xml.contains("cancelled by user"));
        assert!(!xml.contains("pkg.cmd_vel_only.b"));
    }
}
