use super::{remote_file_name, FetchContext, FixtureProvider};
use crate::errors::ReplayError;
use crate::logging::append_run_log;
use crate::runtime::ProcessRequest;
use crate::types::EnvMap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::json;
use std::path::{Path, PathBuf};

pub const DEFAULT_NEXUS_REPOSITORY: &str = "rosbag-hosted";
/// CI stores this account's password base64-encoded.
const CI_USERNAME: &str = "ci";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NexusSettings {
    pub server: String,
    pub repository: String,
    pub username: String,
    pub password: String,
}

impl NexusSettings {
    pub fn from_env(env: &EnvMap) -> Result<Self, ReplayError> {
        let server = env
            .get("NEXUS_SERVER")
            .filter(|server| !server.is_empty())
            .cloned()
            .ok_or_else(|| ReplayError::FixtureUnavailable("NEXUS_SERVER is not set".to_string()))?;
        let repository = env
            .get("NEXUS_REPOSITORY")
            .filter(|repo| !repo.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_NEXUS_REPOSITORY.to_string());
        let username = env.get("NEXUS_CI_USERNAME").cloned().unwrap_or_default();
        let raw_password = env.get("NEXUS_CI_PASSWORD").cloned().unwrap_or_default();
        let password = if username == CI_USERNAME {
            let decoded = STANDARD.decode(raw_password.trim()).map_err(|e| {
                ReplayError::FixtureUnavailable(format!("NEXUS_CI_PASSWORD is not base64: {e}"))
            })?;
            String::from_utf8_lossy(&decoded).trim().to_string()
        } else {
            raw_password
        };
        Ok(Self {
            server: server.trim_end_matches('/').to_string(),
            repository,
            username,
            password,
        })
    }

    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/repository/{}/{}",
            self.server,
            self.repository,
            path.trim_start_matches('/')
        )
    }
}

pub struct NexusFixture {
    path: String,
}

impl NexusFixture {
    pub fn new(path: String) -> Self {
        Self { path }
    }
}

impl FixtureProvider for NexusFixture {
    fn kind(&self) -> &'static str {
        "nexus"
    }

    fn fetch(&self, ctx: &FetchContext<'_>, destination_dir: &Path) -> Result<PathBuf, ReplayError> {
        let settings = NexusSettings::from_env(ctx.env)?;
        let destination = destination_dir.join(remote_file_name(&self.path)?);
        let url = settings.url_for(&self.path);
        append_run_log(
            "info",
            "fixture.nexus.download",
            json!({"url": url, "destination": destination.display().to_string()}),
        );

        let output = ctx.process_runner.run(ProcessRequest {
            env: ctx.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ..ProcessRequest::new(
                "curl",
                vec![
                    "-sSfL".to_string(),
                    "-u".to_string(),
                    format!("{}:{}", settings.username, settings.password),
                    "-o".to_string(),
                    destination.display().to_string(),
                    url.clone(),
                ],
            )
        })?;
        if output.exit_code != 0 {
            append_run_log(
                "error",
                "fixture.nexus.failed",
                json!({"url": url, "exit_code": output.exit_code, "stderr": output.stderr}),
            );
            return Err(ReplayError::FixtureUnavailable(format!(
                "nexus download of {} failed (exit {}): {}",
                self.path,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FakeProcessRunner, ProcessOutput, ProductionFileSystem};
    use crate::types::CachePolicy;

    fn env(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn ci_password_is_base64_decoded_and_repository_defaults() {
        let settings = NexusSettings::from_env(&env(&[
            ("NEXUS_SERVER", "https://nexus.example/"),
            ("NEXUS_CI_USERNAME", "ci"),
            ("NEXUS_CI_PASSWORD", "c2VjcmV0Cg=="),
        ]))
        .expect("settings");
        assert_eq!(settings.password, "secret");
        assert_eq!(settings.repository, DEFAULT_NEXUS_REPOSITORY);
        assert_eq!(
            settings.url_for("/bags/lap.mcap"),
            "https://nexus.example/repository/rosbag-hosted/bags/lap.mcap"
        );
    }

    #[test]
    fn other_users_keep_the_raw_password() {
        let settings = NexusSettings::from_env(&env(&[
            ("NEXUS_SERVER", "https://nexus.example"),
            ("NEXUS_CI_USERNAME", "dev"),
            ("NEXUS_CI_PASSWORD", "plain"),
            ("NEXUS_REPOSITORY", "bags"),
        ]))
        .expect("settings");
        assert_eq!(settings.password, "plain");
        assert_eq!(settings.repository, "bags");
    }

    #[test]
    fn curl_failure_is_fixture_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = FakeProcessRunner::default();
        runner.push_response(Ok(ProcessOutput {
            exit_code: 22,
            stdout: String::new(),
            stderr: "The requested URL returned error: 404".to_string(),
        }));
        let env = env(&[("NEXUS_SERVER", "https://nexus.example")]);
        let ctx = FetchContext {
            process_runner: &runner,
            file_system: &ProductionFileSystem,
            env: &env,
            base_dir: dir.path(),
            cache_dir: dir.path(),
            cache_policy: CachePolicy::NeverExpire,
        };
        let err = NexusFixture::new("bags/lap.mcap".to_string())
            .fetch(&ctx, dir.path())
            .expect_err("404");
        assert!(matches!(err, ReplayError::FixtureUnavailable(message) if message.contains("404")));
        assert_eq!(runner.spawned()[0].program, "curl");
        assert!(runner.spawned()[0]
            .args
            .contains(&"https://nexus.example/repository/rosbag-hosted/bags/lap.mcap".to_string()));
    }

    #[test]
    fn missing_server_is_unavailable() {
        let err = NexusSettings::from_env(&EnvMap::new()).expect_err("no server");
        assert!(matches!(err, ReplayError::FixtureUnavailable(message) if message.contains("NEXUS_SERVER")));
    }
}
