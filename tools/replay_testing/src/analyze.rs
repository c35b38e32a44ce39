use crate::errors::ReplayError;
use crate::logging::append_run_log;
use crate::recording::RecordingReader;
use crate::runtime::{Clock, ProcessOutput, ProcessRequest, ProcessRunner};
use crate::types::{EnvMap, ReplayRunParams};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(50);
const COMMAND_LOG_TAIL_LINES: usize = 20;

/// Everything one assertion may look at for one `(fixture, param)` run.
pub struct AnalyzeContext<'a> {
    pub test_name: &'a str,
    pub assertion_name: &'a str,
    pub fixture_key: &'a str,
    pub param: &'a ReplayRunParams,
    pub recording: &'a RecordingReader,
    pub filtered_fixture: &'a Path,
    pub process_runner: &'a dyn ProcessRunner,
    pub clock: &'a dyn Clock,
    /// Upper bound for external `command` checks.
    pub command_timeout: Duration,
    pub env: &'a EnvMap,
}

impl AnalyzeContext<'_> {
    pub fn fail(&self, message: impl Into<String>) -> ReplayError {
        ReplayError::AssertionFailure {
            test: self.test_name.to_string(),
            assertion: self.assertion_name.to_string(),
            message: message.into(),
        }
    }

    pub fn ensure(&self, condition: bool, message: impl Into<String>) -> Result<(), ReplayError> {
        if condition {
            Ok(())
        } else {
            Err(self.fail(message))
        }
    }
}

pub trait Assertion: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self, ctx: &AnalyzeContext<'_>) -> Result<(), ReplayError>;
}

pub struct FnAssertion<F> {
    name: String,
    check: F,
}

impl<F> Assertion for FnAssertion<F>
where
    F: Fn(&AnalyzeContext<'_>) -> Result<(), ReplayError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, ctx: &AnalyzeContext<'_>) -> Result<(), ReplayError> {
        (self.check)(ctx)
    }
}

pub fn assertion<F>(name: impl Into<String>, check: F) -> Arc<dyn Assertion>
where
    F: Fn(&AnalyzeContext<'_>) -> Result<(), ReplayError> + Send + Sync + 'static,
{
    Arc::new(FnAssertion {
        name: name.into(),
        check,
    })
}

/// Checks a test file can declare without writing code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    MinMessages { topics: Vec<String>, count: u64 },
    MaxMessages { topics: Vec<String>, count: u64 },
    FirstTopic { topics: Vec<String>, topic: String },
    TopicPresent { topic: String },
    TopicAbsent { topic: String },
    /// External program run from `cwd`; passes iff it exits 0.
    Command { program: Vec<String>, cwd: Option<PathBuf> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredAssertion {
    pub name: String,
    pub check: Check,
}

fn count_messages(recording: &RecordingReader, topics: &[String]) -> Result<u64, ReplayError> {
    let mut count = 0;
    for message in recording.messages(topics)? {
        message?;
        count += 1;
    }
    Ok(count)
}

fn describe_topics(topics: &[String]) -> String {
    if topics.is_empty() {
        "all topics".to_string()
    } else {
        topics.join(", ")
    }
}

impl Assertion for DeclaredAssertion {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, ctx: &AnalyzeContext<'_>) -> Result<(), ReplayError> {
        match &self.check {
            Check::MinMessages { topics, count } => {
                let seen = count_messages(ctx.recording, topics)?;
                ctx.ensure(
                    seen >= *count,
                    format!(
                        "expected at least {count} message(s) on {}, saw {seen}",
                        describe_topics(topics)
                    ),
                )
            }
            Check::MaxMessages { topics, count } => {
                let seen = count_messages(ctx.recording, topics)?;
                ctx.ensure(
                    seen <= *count,
                    format!(
                        "expected at most {count} message(s) on {}, saw {seen}",
                        describe_topics(topics)
                    ),
                )
            }
            Check::FirstTopic { topics, topic } => match ctx.recording.first_message(topics)? {
                Some(first) => ctx.ensure(
                    first.topic == *topic,
                    format!("first message was on `{}`, expected `{topic}`", first.topic),
                ),
                None => Err(ctx.fail(format!("no messages on {}", describe_topics(topics)))),
            },
            Check::TopicPresent { topic } => {
                let present = ctx.recording.first_message(std::slice::from_ref(topic))?.is_some();
                ctx.ensure(present, format!("topic `{topic}` never appeared"))
            }
            Check::TopicAbsent { topic } => {
                let seen = count_messages(ctx.recording, std::slice::from_ref(topic))?;
                ctx.ensure(seen == 0, format!("topic `{topic}` appeared {seen} time(s)"))
            }
            Check::Command { program, cwd } => {
                let (cmd, args) = program
                    .split_first()
                    .ok_or_else(|| ReplayError::InvalidConfig("empty command check".to_string()))?;
                let mut env = ctx
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<Vec<_>>();
                env.push((
                    "REPLAY_RECORDING".to_string(),
                    ctx.recording.path().display().to_string(),
                ));
                env.push((
                    "REPLAY_FILTERED_FIXTURE".to_string(),
                    ctx.filtered_fixture.display().to_string(),
                ));
                env.push(("REPLAY_PARAM".to_string(), ctx.param.name.clone()));
                env.push(("REPLAY_PARAMS".to_string(), ctx.param.params_json()));
                let log_path = command_log_path(ctx.recording.path(), ctx.assertion_name);
                let handle = ctx.process_runner.spawn(ProcessRequest {
                    env,
                    cwd: cwd.clone(),
                    log_path: log_path.clone(),
                    ..ProcessRequest::new(cmd.clone(), args.to_vec())
                })?;
                let deadline = ctx.clock.now() + ctx.command_timeout;
                let output = loop {
                    if let Some(output) = ctx.process_runner.try_wait(handle)? {
                        break output;
                    }
                    if ctx.clock.now() >= deadline {
                        if let Err(err) = ctx.process_runner.kill(handle) {
                            append_run_log(
                                "warn",
                                "analyze.command.kill_failed",
                                json!({"assertion": ctx.assertion_name, "error": err.to_string()}),
                            );
                        }
                        return Err(ReplayError::Process(format!(
                            "`{}` timed out after {}s",
                            program.join(" "),
                            ctx.command_timeout.as_secs()
                        )));
                    }
                    ctx.clock.sleep(COMMAND_POLL_INTERVAL)?;
                };
                let detail = command_detail(&output, log_path.as_deref());
                ctx.ensure(
                    output.exit_code == 0,
                    format!("`{}` exited with {}: {detail}", program.join(" "), output.exit_code),
                )
            }
        }
    }
}

/// `logs/check_<assertion>.log` next to the recording.
fn command_log_path(recording: &Path, assertion_name: &str) -> Option<PathBuf> {
    let stem = assertion_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect::<String>();
    recording
        .parent()
        .map(|dir| dir.join("logs").join(format!("check_{stem}.log")))
}

fn command_detail(output: &ProcessOutput, log_path: Option<&Path>) -> String {
    for stream in [&output.stderr, &output.stdout] {
        if !stream.trim().is_empty() {
            return stream.trim().to_string();
        }
    }
    let Some(logged) = log_path.and_then(|path| std::fs::read_to_string(path).ok()) else {
        return String::new();
    };
    let lines = logged.lines().collect::<Vec<_>>();
    lines[lines.len().saturating_sub(COMMAND_LOG_TAIL_LINES)..]
        .join("\n")
        .trim()
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum AssertionOutcome {
    Passed,
    Failed(String),
    /// The assertion could not be evaluated at all.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionResult {
    pub fixture_key: String,
    pub param_name: String,
    pub assertion: String,
    pub outcome: AssertionOutcome,
    pub duration_ms: u64,
}

impl AssertionResult {
    pub fn passed(&self) -> bool {
        self.outcome == AssertionOutcome::Passed
    }
}

pub struct AnalyzeTarget<'a> {
    pub test_name: &'a str,
    pub fixture_key: &'a str,
    pub param: &'a ReplayRunParams,
    pub recording_path: &'a Path,
    pub filtered_fixture: &'a Path,
    pub command_timeout: Duration,
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "assertion panicked".to_string()
    }
}

/// Runs every assertion against one recording. A failing or panicking assertion
/// never stops the ones after it.
pub fn run_assertions(
    assertions: &[Arc<dyn Assertion>],
    target: &AnalyzeTarget<'_>,
    process_runner: &dyn ProcessRunner,
    clock: &dyn Clock,
    env: &EnvMap,
) -> Vec<AssertionResult> {
    let recording = match RecordingReader::open(target.recording_path) {
        Ok(recording) => recording,
        Err(err) => {
            return assertions
                .iter()
                .map(|assertion| AssertionResult {
                    fixture_key: target.fixture_key.to_string(),
                    param_name: target.param.name.clone(),
                    assertion: assertion.name().to_string(),
                    outcome: AssertionOutcome::Error(err.to_string()),
                    duration_ms: 0,
                })
                .collect();
        }
    };

    assertions
        .iter()
        .map(|assertion| {
            let ctx = AnalyzeContext {
                test_name: target.test_name,
                assertion_name: assertion.name(),
                fixture_key: target.fixture_key,
                param: target.param,
                recording: &recording,
                filtered_fixture: target.filtered_fixture,
                process_runner,
                clock,
                command_timeout: target.command_timeout,
                env,
            };
            let started = clock.now();
            let checked = catch_unwind(AssertUnwindSafe(|| assertion.check(&ctx)));
            let duration_ms = clock
                .now()
                .duration_since(started)
                .unwrap_or(Duration::ZERO)
                .as_millis() as u64;
            let outcome = match checked {
                Ok(Ok(())) => AssertionOutcome::Passed,
                Ok(Err(ReplayError::AssertionFailure { message, .. })) => {
                    AssertionOutcome::Failed(message)
                }
                Ok(Err(other)) => AssertionOutcome::Error(other.to_string()),
                Err(payload) => AssertionOutcome::Failed(panic_message(payload)),
            };
            append_run_log(
                if outcome == AssertionOutcome::Passed { "info" } else { "error" },
                "analyze.assertion",
                json!({
                    "test": target.test_name,
                    "fixture": target.fixture_key,
                    "param": target.param.name,
                    "assertion": assertion.name(),
                    "outcome": outcome,
                }),
            );
            AssertionResult {
                fixture_key: target.fixture_key.to_string(),
                param_name: target.param.name.clone(),
                assertion: assertion.name().to_string(),
                outcome,
                duration_ms,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FakeClock, FakeProcessRunner};
    use std::collections::BTreeMap;
    use std::fs::File;
    use std::io::BufWriter;

    fn write_recording(path: &Path, topics: &[&str]) {
        let file = File::create(path).expect("create");
        let mut writer = mcap::Writer::new(BufWriter::new(file)).expect("writer");
        let schema = writer
            .add_schema("geometry_msgs/msg/Twist", "ros2msg", b"")
            .expect("schema");
        let mut channels = BTreeMap::new();
        for (index, topic) in topics.iter().enumerate() {
            let channel = match channels.get(topic) {
                Some(id) => *id,
                None => {
                    let id = writer
                        .add_channel(schema, topic, "cdr", &BTreeMap::new())
                        .expect("channel");
                    channels.insert(*topic, id);
                    id
                }
            };
            writer
                .write_to_known_channel(
                    &mcap::records::MessageHeader {
                        channel_id: channel,
                        sequence: index as u32,
                        log_time: index as u64,
                        publish_time: index as u64,
                    },
                    b"x",
                )
                .expect("message");
        }
        writer.finish().expect("finish");
    }

    fn run(
        assertions: &[Arc<dyn Assertion>],
        path: &Path,
        runner: &FakeProcessRunner,
    ) -> Vec<AssertionResult> {
        let param = ReplayRunParams::default_set();
        run_assertions(
            assertions,
            &AnalyzeTarget {
                test_name: "basic_replay",
                fixture_key: "cmd_vel_only",
                param: &param,
                recording_path: path,
                filtered_fixture: Path::new("/filtered.mcap"),
                command_timeout: Duration::from_secs(5),
            },
            runner,
            &FakeClock::default(),
            &EnvMap::new(),
        )
    }

    fn declared(name: &str, check: Check) -> Arc<dyn Assertion> {
        Arc::new(DeclaredAssertion {
            name: name.to_string(),
            check,
        })
    }

    #[test]
    fn declarative_checks_cover_counts_order_and_presence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("output.mcap");
        write_recording(&path, &["/user/cmd_vel", "/rosout", "/user/cmd_vel"]);
        let cmd_vel = vec!["/user/cmd_vel".to_string()];

        let results = run(
            &[
                declared("min", Check::MinMessages { topics: cmd_vel.clone(), count: 1 }),
                declared("max", Check::MaxMessages { topics: Vec::new(), count: 2 }),
                declared(
                    "first",
                    Check::FirstTopic { topics: cmd_vel.clone(), topic: "/user/cmd_vel".to_string() },
                ),
                declared("present", Check::TopicPresent { topic: "/rosout".to_string() }),
                declared("absent", Check::TopicAbsent { topic: "/clock".to_string() }),
            ],
            &path,
            &FakeProcessRunner::default(),
        );
        let outcomes = results.iter().map(|r| (r.assertion.as_str(), r.passed())).collect::<Vec<_>>();
        assert_eq!(
            outcomes,
            vec![("min", true), ("max", false), ("first", true), ("present", true), ("absent", true)]
        );
        assert!(matches!(&results[1].outcome, AssertionOutcome::Failed(message) if message.contains("saw 3")));
    }

    #[test]
    fn failures_and_panics_do_not_short_circuit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("output.mcap");
        write_recording(&path, &["/a"]);

        let results = run(
            &[
                assertion("fails", |ctx| Err(ctx.fail("nope"))),
                assertion("panics", |_ctx| panic!("boom")),
                assertion("passes", |ctx| {
                    let counts = ctx.recording.message_counts()?;
                    ctx.ensure(counts.get("/a") == Some(&1), "one message on /a")
                }),
            ],
            &path,
            &FakeProcessRunner::default(),
        );
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].outcome, AssertionOutcome::Failed("nope".to_string()));
        assert_eq!(results[1].outcome, AssertionOutcome::Failed("boom".to_string()));
        assert!(results[2].passed());
    }

    #[test]
    fn command_check_gets_run_paths_in_env() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("output.mcap");
        write_recording(&path, &["/a"]);
        let runner = FakeProcessRunner::default();
        runner.push_response(Ok(ProcessOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "speed too high".to_string(),
        }));

        let results = run(
            &[declared(
                "external",
                Check::Command {
                    program: vec!["python3".to_string(), "check.py".to_string()],
                    cwd: Some(PathBuf::from("/tests")),
                },
            )],
            &path,
            &runner,
        );
        assert!(matches!(&results[0].outcome, AssertionOutcome::Failed(message) if message.contains("speed too high")));
        let env = &runner.spawned()[0].env;
        assert!(env.contains(&("REPLAY_RECORDING".to_string(), path.display().to_string())));
        assert!(env.contains(&("REPLAY_FILTERED_FIXTURE".to_string(), "/filtered.mcap".to_string())));
        assert!(env.contains(&("REPLAY_PARAM".to_string(), "default".to_string())));
        assert_eq!(runner.spawned()[0].cwd, Some(PathBuf::from("/tests")));
        assert_eq!(
            runner.spawned()[0].log_path,
            Some(dir.path().join("logs/check_external.log"))
        );
    }

    #[test]
    fn hung_command_check_is_killed_at_the_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("output.mcap");
        write_recording(&path, &["/a"]);
        let runner = FakeProcessRunner::default();

        let results = run(
            &[
                declared(
                    "hangs",
                    Check::Command {
                        program: vec!["sleep".to_string(), "3600".to_string()],
                        cwd: None,
                    },
                ),
                declared("present", Check::TopicPresent { topic: "/a".to_string() }),
            ],
            &path,
            &runner,
        );
        assert!(matches!(
            &results[0].outcome,
            AssertionOutcome::Error(message) if message.contains("`sleep 3600` timed out after 5s")
        ));
        assert_eq!(runner.kills(), vec![0]);
        assert!(results[1].passed());
    }

    #[test]
    fn silent_command_failure_reports_the_tail_of_its_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("logs")).expect("logs");
        std::fs::write(
            dir.path().join("logs/check_speed_limit.log"),
            "checking\nmax speed 4.2 > 3.0\n",
        )
        .expect("log");
        let output = ProcessOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "  ".to_string(),
        };
        let log_path = command_log_path(&dir.path().join("output.mcap"), "speed limit");
        assert_eq!(log_path, Some(dir.path().join("logs/check_speed_limit.log")));
        assert_eq!(
            command_detail(&output, log_path.as_deref()),
            "checking\nmax speed 4.2 > 3.0"
        );
    }

    #[test]
    fn unreadable_recording_is_an_error_for_every_assertion() {
        let results = run(
            &[
                declared("a", Check::TopicPresent { topic: "/a".to_string() }),
                declared("b", Check::TopicAbsent { topic: "/b".to_string() }),
            ],
            Path::new("/missing/output.mcap"),
            &FakeProcessRunner::default(),
        );
        assert!(results
            .iter()
            .all(|r| matches!(r.outcome, AssertionOutcome::Error(_))));
    }
}
