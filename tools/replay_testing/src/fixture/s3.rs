use super::cache::{cache_entry, is_valid, write_meta, CacheMeta};
use super::{copy_into, remote_file_name, FetchContext, FixtureProvider};
use crate::errors::ReplayError;
use crate::logging::append_run_log;
use crate::runtime::{ProcessOutput, ProcessRequest};
use crate::types::{CachePolicy, EnvMap};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

pub const AWS_PROGRAM: &str = "aws";

/// S3 object fetched through the `aws` CLI into the shared fixture cache.
pub struct S3Fixture {
    key: String,
    bucket: Option<String>,
}

impl S3Fixture {
    pub fn new(key: String, bucket: Option<String>) -> Self {
        Self { key, bucket }
    }

    fn bucket(&self, env: &EnvMap) -> Result<String, ReplayError> {
        self.bucket
            .clone()
            .or_else(|| env.get("AWS_BUCKET").cloned())
            .filter(|bucket| !bucket.is_empty())
            .ok_or_else(|| {
                ReplayError::FixtureUnavailable(
                    "S3 bucket name is required: set `bucket` on the source or AWS_BUCKET".to_string(),
                )
            })
    }
}

fn request(env: &EnvMap, args: Vec<String>) -> ProcessRequest {
    let mut args = args;
    if let Some(endpoint) = env.get("AWS_S3_ENDPOINT_URL").filter(|url| !url.is_empty()) {
        args.push("--endpoint-url".to_string());
        args.push(endpoint.clone());
    }
    ProcessRequest {
        env: env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        ..ProcessRequest::new(AWS_PROGRAM, args)
    }
}

fn describe_failure(bucket: &str, key: &str, output: &ProcessOutput) -> ReplayError {
    let stderr = output.stderr.trim();
    let reason = if stderr.contains("Unable to locate credentials")
        || stderr.contains("InvalidAccessKeyId")
        || stderr.contains("SignatureDoesNotMatch")
    {
        "AWS credentials are missing or invalid (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, or --env)"
    } else if stderr.contains("404") || stderr.contains("Not Found") || stderr.contains("NoSuchKey") {
        "object does not exist"
    } else if stderr.contains("NoSuchBucket") {
        "bucket does not exist"
    } else if stderr.contains("AccessDenied") || stderr.contains("403") {
        "access denied"
    } else {
        "aws cli failed"
    };
    ReplayError::FixtureUnavailable(format!(
        "s3://{bucket}/{key}: {reason} (exit {}): {stderr}",
        output.exit_code
    ))
}

/// Checksum from `head-object` output, preferring the SHA-256 checksum over the ETag.
pub fn parse_remote_checksum(stdout: &str) -> Option<String> {
    let value: Value = serde_json::from_str(stdout).ok()?;
    value
        .get("ChecksumSHA256")
        .or_else(|| value.get("ETag"))
        .and_then(Value::as_str)
        .map(|raw| raw.trim_matches('"').to_string())
        .filter(|checksum| !checksum.is_empty())
}

fn run_aws(ctx: &FetchContext<'_>, bucket: &str, key: &str, args: Vec<String>) -> Result<ProcessOutput, ReplayError> {
    let output = ctx
        .process_runner
        .run(request(ctx.env, args))
        .map_err(|e| ReplayError::FixtureUnavailable(format!("s3://{bucket}/{key}: {e}")))?;
    if output.exit_code != 0 {
        return Err(describe_failure(bucket, key, &output));
    }
    Ok(output)
}

impl FixtureProvider for S3Fixture {
    fn kind(&self) -> &'static str {
        "s3"
    }

    fn fetch(&self, ctx: &FetchContext<'_>, destination_dir: &Path) -> Result<PathBuf, ReplayError> {
        let bucket = self.bucket(ctx.env)?;
        let file_name = remote_file_name(&self.key)?;
        let entry = cache_entry(ctx.cache_dir, &bucket, &self.key, &file_name);
        let destination = destination_dir.join(&file_name);

        let remote_checksum = if ctx.cache_policy == CachePolicy::VerifyChecksum {
            let head = run_aws(
                ctx,
                &bucket,
                &self.key,
                vec![
                    "s3api".to_string(),
                    "head-object".to_string(),
                    "--bucket".to_string(),
                    bucket.clone(),
                    "--key".to_string(),
                    self.key.clone(),
                    "--checksum-mode".to_string(),
                    "ENABLED".to_string(),
                ],
            )?;
            parse_remote_checksum(&head.stdout)
        } else {
            None
        };

        if is_valid(&entry, &bucket, &self.key, ctx.cache_policy, remote_checksum.as_deref()) {
            append_run_log(
                "info",
                "fixture.s3.cache_hit",
                json!({"bucket": bucket, "key": self.key, "cache": entry.file.display().to_string()}),
            );
            copy_into(&entry.file, &destination)?;
            return Ok(destination);
        }

        append_run_log(
            "info",
            "fixture.s3.cache_miss",
            json!({"bucket": bucket, "key": self.key}),
        );
        if let Some(dir) = entry.file.parent() {
            ctx.file_system.create_dir_all(dir)?;
        }
        run_aws(
            ctx,
            &bucket,
            &self.key,
            vec![
                "s3".to_string(),
                "cp".to_string(),
                "--only-show-errors".to_string(),
                format!("s3://{bucket}/{}", self.key),
                entry.file.display().to_string(),
            ],
        )?;
        if !entry.file.is_file() {
            return Err(ReplayError::FixtureUnavailable(format!(
                "s3://{bucket}/{}: download finished but {} is missing",
                self.key,
                entry.file.display()
            )));
        }
        write_meta(
            &entry,
            &CacheMeta {
                bucket: bucket.clone(),
                key: self.key.clone(),
                checksum: remote_checksum,
            },
        )?;
        copy_into(&entry.file, &destination)?;
        Ok(destination)
    }
}
