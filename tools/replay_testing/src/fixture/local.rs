use super::{copy_into, FetchContext, FixtureProvider};
use crate::errors::ReplayError;
use std::path::{Path, PathBuf};

pub struct LocalFixture {
    path: PathBuf,
}

impl LocalFixture {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl FixtureProvider for LocalFixture {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn fetch(&self, ctx: &FetchContext<'_>, destination_dir: &Path) -> Result<PathBuf, ReplayError> {
        let source = if self.path.is_absolute() {
            self.path.clone()
        } else {
            ctx.base_dir.join(&self.path)
        };
        if !source.is_file() {
            return Err(ReplayError::FixtureUnavailable(format!(
                "local fixture not found: {}",
                source.display()
            )));
        }
        let file_name = source.file_name().ok_or_else(|| {
            ReplayError::FixtureUnavailable(format!("no file name in {}", source.display()))
        })?;
        let destination = destination_dir.join(file_name);
        copy_into(&source, &destination)?;
        Ok(destination)
    }
}
