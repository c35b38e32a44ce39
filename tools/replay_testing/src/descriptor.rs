//! Replay test descriptors.
//!
//! A test is an explicit value: which fixtures to replay and which topics matter,
//! how to launch the system under test for each parameter set, and the ordered
//! assertions to run on every recording. Test files are TOML and are turned into a
//! [`ReplayTest`] by [`load_test_file`]; Rust callers can use [`ReplayTestBuilder`].

use crate::analyze::{Assertion, Check, DeclaredAssertion};
use crate::artifacts::RESERVED_RUN_DIR_ENTRIES;
use crate::errors::ReplayError;
use crate::launch::{LaunchFactory, ProcessTemplate, TemplateLaunch};
use crate::runtime::FileSystem;
use crate::types::{is_filesystem_safe, FixtureSource, ReplayRunParams, TopicSet};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FixtureSpec {
    pub topics: TopicSet,
    pub sources: Vec<FixtureSource>,
}

#[derive(Clone)]
pub struct RunSpec {
    pub launch: Arc<dyn LaunchFactory>,
    pub parameters: Vec<ReplayRunParams>,
    pub qos_overrides: Option<PathBuf>,
}

#[derive(Clone)]
pub struct ReplayTest {
    pub name: String,
    /// Directory relative fixture and QoS paths resolve against.
    pub base_dir: PathBuf,
    pub source_file: Option<PathBuf>,
    pub fixtures: FixtureSpec,
    pub run: RunSpec,
    pub analyze: Vec<Arc<dyn Assertion>>,
}

impl std::fmt::Debug for ReplayTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayTest")
            .field("name", &self.name)
            .field("base_dir", &self.base_dir)
            .field("fixtures", &self.fixtures)
            .field("parameters", &self.param_names())
            .field(
                "analyze",
                &self.analyze.iter().map(|a| a.name().to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ReplayTest {
    pub fn builder(name: impl Into<String>) -> ReplayTestBuilder {
        ReplayTestBuilder::new(name)
    }

    pub fn param_names(&self) -> Vec<String> {
        self.run.parameters.iter().map(|p| p.name.clone()).collect()
    }

    pub fn param(&self, name: &str) -> Option<&ReplayRunParams> {
        self.run.parameters.iter().find(|p| p.name == name)
    }

    pub fn fixture_keys(&self) -> Vec<String> {
        self.fixtures.sources.iter().map(FixtureSource::key).collect()
    }

    pub fn validate(&self) -> Result<(), ReplayError> {
        if self.fixtures.sources.is_empty() {
            return Err(ReplayError::InvalidConfig(format!(
                "test `{}` declares no fixture sources",
                self.name
            )));
        }

        let mut keys = BTreeSet::new();
        for source in &self.fixtures.sources {
            let key = source.key();
            if !is_filesystem_safe(&key) {
                return Err(ReplayError::InvalidConfig(format!(
                    "fixture key `{key}` from {} is not a valid directory name",
                    source.describe()
                )));
            }
            if RESERVED_RUN_DIR_ENTRIES.contains(&key.as_str()) {
                return Err(ReplayError::InvalidConfig(format!(
                    "fixture key `{key}` from {} is reserved; rename the fixture",
                    source.describe()
                )));
            }
            if !keys.insert(key.clone()) {
                return Err(ReplayError::InvalidConfig(format!(
                    "duplicate fixture key `{key}`"
                )));
            }
        }

        let overlap = self
            .fixtures
            .topics
            .required_input_topics
            .intersection(&self.fixtures.topics.expected_output_topics)
            .cloned()
            .collect::<Vec<_>>();
        if !overlap.is_empty() {
            return Err(ReplayError::InvalidConfig(format!(
                "topics are both required inputs and expected outputs: {}",
                overlap.join(", ")
            )));
        }

        if self.run.parameters.is_empty() {
            return Err(ReplayError::InvalidConfig(format!(
                "test `{}` has no parameter sets",
                self.name
            )));
        }
        let mut names = BTreeSet::new();
        for param in &self.run.parameters {
            if !is_filesystem_safe(&param.name) {
                return Err(ReplayError::InvalidConfig(format!(
                    "parameter set name `{}` must be a single path segment of [A-Za-z0-9._-]",
                    param.name
                )));
            }
            if !names.insert(param.name.as_str()) {
                return Err(ReplayError::InvalidConfig(format!(
                    "duplicate parameter set `{}`",
                    param.name
                )));
            }
            if !(param.runner_args.playback_rate.is_finite() && param.runner_args.playback_rate > 0.0) {
                return Err(ReplayError::InvalidConfig(format!(
                    "parameter set `{}` needs a positive playback_rate",
                    param.name
                )));
            }
        }

        let mut assertions = BTreeSet::new();
        for assertion in &self.analyze {
            if !assertions.insert(assertion.name()) {
                return Err(ReplayError::InvalidConfig(format!(
                    "duplicate analyze name `{}`",
                    assertion.name()
                )));
            }
        }
        Ok(())
    }
}

pub struct ReplayTestBuilder {
    name: String,
    base_dir: PathBuf,
    fixtures: FixtureSpec,
    launch: Option<Arc<dyn LaunchFactory>>,
    parameters: Vec<ReplayRunParams>,
    qos_overrides: Option<PathBuf>,
    analyze: Vec<Arc<dyn Assertion>>,
}

impl ReplayTestBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_dir: PathBuf::from("."),
            fixtures: FixtureSpec::default(),
            launch: None,
            parameters: Vec::new(),
            qos_overrides: None,
            analyze: Vec::new(),
        }
    }

    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub fn required_input_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fixtures
            .topics
            .required_input_topics
            .extend(topics.into_iter().map(Into::into));
        self
    }

    pub fn expected_output_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fixtures
            .topics
            .expected_output_topics
            .extend(topics.into_iter().map(Into::into));
        self
    }

    pub fn source(mut self, source: FixtureSource) -> Self {
        self.fixtures.sources.push(source);
        self
    }

    pub fn launch(mut self, factory: impl LaunchFactory + 'static) -> Self {
        self.launch = Some(Arc::new(factory));
        self
    }

    pub fn parameter(mut self, params: ReplayRunParams) -> Self {
        self.parameters.push(params);
        self
    }

    pub fn qos_overrides(mut self, path: impl Into<PathBuf>) -> Self {
        self.qos_overrides = Some(path.into());
        self
    }

    pub fn assertion(mut self, assertion: Arc<dyn Assertion>) -> Self {
        self.analyze.push(assertion);
        self
    }

    /// Empty parameter lists become the single `default` set.
    pub fn build(self) -> Result<ReplayTest, ReplayError> {
        let launch = self.launch.ok_or_else(|| {
            ReplayError::InvalidConfig(format!("test `{}` has no launch description", self.name))
        })?;
        let parameters = if self.parameters.is_empty() {
            vec![ReplayRunParams::default_set()]
        } else {
            self.parameters
        };
        let qos_overrides = self.qos_overrides.map(|path| {
            if path.is_absolute() {
                path
            } else {
                self.base_dir.join(path)
            }
        });
        let test = ReplayTest {
            name: self.name,
            base_dir: self.base_dir,
            source_file: None,
            fixtures: self.fixtures,
            run: RunSpec {
                launch,
                parameters,
                qos_overrides,
            },
            analyze: self.analyze,
        };
        test.validate()?;
        Ok(test)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTestFile {
    name: Option<String>,
    fixtures: RawFixtures,
    run: RawRun,
    #[serde(default)]
    analyze: Vec<RawCheck>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFixtures {
    #[serde(default)]
    required_input_topics: Vec<String>,
    #[serde(default)]
    expected_output_topics: Vec<String>,
    sources: Vec<RawSource>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSource {
    local: Option<PathBuf>,
    s3: Option<String>,
    bucket: Option<String>,
    nexus: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRun {
    qos_overrides: Option<PathBuf>,
    cwd: Option<PathBuf>,
    #[serde(default, rename = "process")]
    processes: Vec<ProcessTemplate>,
    #[serde(default)]
    parameters: Vec<ReplayRunParams>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCheck {
    name: String,
    check: String,
    #[serde(default)]
    topics: Vec<String>,
    count: Option<u64>,
    topic: Option<String>,
    program: Option<Vec<String>>,
}

fn source_from_raw(raw: RawSource) -> Result<FixtureSource, ReplayError> {
    match (raw.local, raw.s3, raw.nexus) {
        (Some(path), None, None) if raw.bucket.is_none() => Ok(FixtureSource::Local(path)),
        (None, Some(key), None) => Ok(FixtureSource::S3 {
            key,
            bucket: raw.bucket,
        }),
        (None, None, Some(path)) if raw.bucket.is_none() => Ok(FixtureSource::Nexus(path)),
        _ => Err(ReplayError::InvalidConfig(
            "each fixture source needs exactly one of `local`, `s3` (with optional `bucket`), `nexus`"
                .to_string(),
        )),
    }
}

fn check_from_raw(raw: RawCheck, base_dir: &Path) -> Result<DeclaredAssertion, ReplayError> {
    let missing = |field: &str| {
        ReplayError::InvalidConfig(format!(
            "analyze `{}` ({}) needs `{field}`",
            raw.name, raw.check
        ))
    };
    let check = match raw.check.as_str() {
        "min_messages" => Check::MinMessages {
            topics: raw.topics.clone(),
            count: raw.count.unwrap_or(1),
        },
        "max_messages" => Check::MaxMessages {
            topics: raw.topics.clone(),
            count: raw.count.ok_or_else(|| missing("count"))?,
        },
        "first_topic" => Check::FirstTopic {
            topics: raw.topics.clone(),
            topic: raw.topic.clone().ok_or_else(|| missing("topic"))?,
        },
        "topic_present" => Check::TopicPresent {
            topic: raw.topic.clone().ok_or_else(|| missing("topic"))?,
        },
        "topic_absent" => Check::TopicAbsent {
            topic: raw.topic.clone().ok_or_else(|| missing("topic"))?,
        },
        "command" => Check::Command {
            program: raw
                .program
                .clone()
                .filter(|program| !program.is_empty())
                .ok_or_else(|| missing("program"))?,
            cwd: Some(base_dir.to_path_buf()),
        },
        other => {
            return Err(ReplayError::InvalidConfig(format!(
                "analyze `{}` has unknown check `{other}`",
                raw.name
            )))
        }
    };
    Ok(DeclaredAssertion {
        name: raw.name,
        check,
    })
}

pub fn parse_test_file(contents: &str, path: &Path) -> Result<ReplayTest, ReplayError> {
    let raw: RawTestFile = toml::from_str(contents)
        .map_err(|e| ReplayError::ConfigParse(format!("{}: {e}", path.display())))?;
    let base_dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = raw.name.unwrap_or_else(|| {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "replay_test".to_string())
    });

    if raw.run.processes.is_empty() {
        return Err(ReplayError::InvalidConfig(format!(
            "{}: [run] declares no process",
            path.display()
        )));
    }
    let cwd = match raw.run.cwd {
        Some(cwd) if cwd.is_absolute() => cwd,
        Some(cwd) => base_dir.join(cwd),
        None => base_dir.clone(),
    };

    let mut builder = ReplayTestBuilder::new(name)
        .base_dir(base_dir.clone())
        .required_input_topics(raw.fixtures.required_input_topics)
        .expected_output_topics(raw.fixtures.expected_output_topics)
        .launch(TemplateLaunch {
            processes: raw.run.processes,
            cwd,
        });
    for source in raw.fixtures.sources {
        builder = builder.source(source_from_raw(source)?);
    }
    for params in raw.run.parameters {
        builder = builder.parameter(params);
    }
    if let Some(qos) = raw.run.qos_overrides {
        builder = builder.qos_overrides(qos);
    }
    for check in raw.analyze {
        builder = builder.assertion(Arc::new(check_from_raw(check, &base_dir)?));
    }

    let mut test = builder.build()?;
    test.source_file = Some(path.to_path_buf());
    Ok(test)
}

pub fn load_test_file(fs: &dyn FileSystem, path: &Path) -> Result<ReplayTest, ReplayError> {
    if !fs.exists(path) {
        return Err(ReplayError::Cli(format!(
            "replay test file not found: {}",
            path.display()
        )));
    }
    let contents = fs.read_to_string(path)?;
    parse_test_file(&contents, path)
}
