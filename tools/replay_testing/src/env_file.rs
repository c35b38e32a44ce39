use crate::errors::ReplayError;
use crate::logging::append_run_log;
use crate::runtime::FileSystem;
use crate::types::EnvMap;
use serde_json::json;
use std::ffi::OsString;
use std::path::Path;

pub fn env_to_map(env: &[(OsString, OsString)]) -> EnvMap {
    env.iter()
        .map(|(k, v)| (k.to_string_lossy().to_string(), v.to_string_lossy().to_string()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedEnvFile {
    pub values: EnvMap,
    /// 1-based line numbers that were neither blank, comments, nor `KEY=VALUE`.
    pub malformed_lines: Vec<usize>,
}

fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

pub fn parse_env_file(contents: &str) -> ParsedEnvFile {
    let mut parsed = ParsedEnvFile::default();
    for (index, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            parsed.malformed_lines.push(index + 1);
            continue;
        };
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            parsed.malformed_lines.push(index + 1);
            continue;
        }
        parsed
            .values
            .insert(key.to_string(), strip_quotes(value.trim()).to_string());
    }
    parsed
}

/// Overlays the values of `path` on `base`. The process environment is left alone;
/// callers thread the returned map to every resolver and child process.
pub fn load_env_file(
    fs: &dyn FileSystem,
    path: &Path,
    base: &EnvMap,
) -> Result<EnvMap, ReplayError> {
    if !fs.exists(path) {
        return Err(ReplayError::Cli(format!(
            "env file not found: {}",
            path.display()
        )));
    }
    let parsed = parse_env_file(&fs.read_to_string(path)?);
    for line in &parsed.malformed_lines {
        append_run_log(
            "warn",
            "env_file.line_skipped",
            json!({"path": path.display().to_string(), "line": line}),
        );
    }
    append_run_log(
        "debug",
        "env_file.loaded",
        json!({
            "path": path.display().to_string(),
            "keys": parsed.values.keys().collect::<Vec<_>>(),
        }),
    );

    let mut merged = base.clone();
    merged.extend(parsed.values);
    Ok(merged)
}
