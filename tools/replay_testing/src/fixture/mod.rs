use crate::errors::ReplayError;
use crate::logging::append_run_log;
use crate::runtime::{FileSystem, ProcessRunner};
use crate::types::{CachePolicy, EnvMap, FixtureSource};
use serde_json::json;
use std::path::{Path, PathBuf};

pub mod cache;
pub mod local;
pub mod nexus;
pub mod s3;

pub struct FetchContext<'a> {
    pub process_runner: &'a dyn ProcessRunner,
    pub file_system: &'a dyn FileSystem,
    pub env: &'a EnvMap,
    /// Directory of the test file; relative local sources resolve against it.
    pub base_dir: &'a Path,
    pub cache_dir: &'a Path,
    pub cache_policy: CachePolicy,
}

pub trait FixtureProvider: Send + Sync {
    fn kind(&self) -> &'static str;
    /// Places the fixture inside `destination_dir` and returns its path.
    fn fetch(&self, ctx: &FetchContext<'_>, destination_dir: &Path) -> Result<PathBuf, ReplayError>;
}

pub fn provider_for(source: &FixtureSource) -> Box<dyn FixtureProvider> {
    match source {
        FixtureSource::Local(path) => Box::new(local::LocalFixture::new(path.clone())),
        FixtureSource::S3 { key, bucket } => Box::new(s3::S3Fixture::new(key.clone(), bucket.clone())),
        FixtureSource::Nexus(path) => Box::new(nexus::NexusFixture::new(path.clone())),
    }
}

/// Resolves `source` to a local replay file inside `destination_dir`.
pub fn resolve_fixture(
    source: &FixtureSource,
    ctx: &FetchContext<'_>,
    destination_dir: &Path,
) -> Result<PathBuf, ReplayError> {
    ctx.file_system.create_dir_all(destination_dir)?;
    let provider = provider_for(source);
    append_run_log(
        "info",
        "fixture.resolve.started",
        json!({
            "kind": provider.kind(),
            "source": source.describe(),
            "destination": destination_dir.display().to_string(),
        }),
    );

    let path = provider.fetch(ctx, destination_dir)?;
    if !path.is_file() {
        return Err(ReplayError::FixtureUnavailable(format!(
            "{} produced no file at {}",
            source.describe(),
            path.display()
        )));
    }
    if !path.extension().is_some_and(|ext| ext == "mcap") {
        append_run_log(
            "warn",
            "fixture.unexpected_extension",
            json!({"path": path.display().to_string()}),
        );
    }
    append_run_log(
        "info",
        "fixture.resolve.completed",
        json!({"source": source.describe(), "path": path.display().to_string()}),
    );
    Ok(path)
}

/// Last path segment of a remote key or repository path.
pub(crate) fn remote_file_name(remote: &str) -> Result<String, ReplayError> {
    remote
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ReplayError::FixtureUnavailable(format!("no file name in `{remote}`")))
}

pub(crate) fn copy_into(source: &Path, destination: &Path) -> Result<(), ReplayError> {
    std::fs::copy(source, destination).map(|_| ()).map_err(|e| {
        ReplayError::Io(format!(
            "copy {} -> {}: {e}",
            source.display(),
            destination.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FakeProcessRunner, ProductionFileSystem};

    #[test]
    fn remote_file_name_takes_the_last_segment() {
        assert_eq!(remote_file_name("a/b/lap.mcap").expect("name"), "lap.mcap");
        assert!(remote_file_name("a/b/").is_err());
    }

    #[test]
    fn resolve_copies_local_fixture_into_the_run_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tests_dir = dir.path().join("tests");
        std::fs::create_dir_all(tests_dir.join("fixtures")).expect("fixtures dir");
        std::fs::write(tests_dir.join("fixtures/lap.mcap"), b"bytes").expect("fixture");

        let runner = FakeProcessRunner::default();
        let env = EnvMap::new();
        let cache = dir.path().join("cache");
        let ctx = FetchContext {
            process_runner: &runner,
            file_system: &ProductionFileSystem,
            env: &env,
            base_dir: &tests_dir,
            cache_dir: &cache,
            cache_policy: CachePolicy::NeverExpire,
        };
        let destination = dir.path().join("run/lap");
        let path = resolve_fixture(
            &FixtureSource::Local(PathBuf::from("fixtures/lap.mcap")),
            &ctx,
            &destination,
        )
        .expect("resolve");
        assert_eq!(path, destination.join("lap.mcap"));
        assert_eq!(std::fs::read(&path).expect("read"), b"bytes");
        assert!(runner.spawned().is_empty());
    }
}
