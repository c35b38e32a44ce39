use crate::errors::ReplayError;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const LOG_EXTENSIONS: &[&str] = &["jsonl", "log"];

fn is_log_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| LOG_EXTENSIONS.contains(&ext))
}

/// Deletes the oldest log files in `dir` until their combined size fits `budget_bytes`.
/// Files that are not logs (recordings, metadata) are never touched, and `active`
/// survives even when it alone exceeds the budget.
pub fn enforce_total_budget(
    dir: &Path,
    budget_bytes: u64,
    active: Option<&Path>,
) -> Result<Vec<PathBuf>, ReplayError> {
    let mut files = fs::read_dir(dir)
        .map_err(|e| ReplayError::Io(format!("{}: {e}", dir.display())))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| is_log_file(path))
        .filter_map(|path| {
            let meta = fs::metadata(&path).ok()?;
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((path, modified, meta.len()))
        })
        .collect::<Vec<_>>();

    files.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

    let mut total = files.iter().map(|(_, _, len)| *len).sum::<u64>();
    let mut deleted = Vec::new();
    for (path, _, len) in files {
        if total <= budget_bytes {
            break;
        }
        if active.is_some_and(|keep| keep == path) {
            continue;
        }
        fs::remove_file(&path).map_err(|e| ReplayError::Io(e.to_string()))?;
        total = total.saturating_sub(len);
        deleted.push(path);
    }

    Ok(deleted)
}
