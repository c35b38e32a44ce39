use crate::errors::ReplayError;
use crate::types::CachePolicy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub bucket: String,
    pub key: String,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub file: PathBuf,
    pub meta: PathBuf,
}

pub fn cache_slot(bucket: &str, key: &str) -> String {
    let mut digest = Sha256::new();
    digest.update(format!("{bucket}/{key}").as_bytes());
    let bytes = digest.finalize();
    let mut out = String::with_capacity(16);
    for byte in bytes.iter().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn cache_entry(cache_dir: &Path, bucket: &str, key: &str, file_name: &str) -> CacheEntry {
    let dir = cache_dir.join(cache_slot(bucket, key));
    CacheEntry {
        file: dir.join(file_name),
        meta: dir.join(format!("{file_name}.meta.json")),
    }
}

pub fn read_meta(entry: &CacheEntry) -> Option<CacheMeta> {
    let text = std::fs::read_to_string(&entry.meta).ok()?;
    serde_json::from_str(&text).ok()
}

pub fn write_meta(entry: &CacheEntry, meta: &CacheMeta) -> Result<(), ReplayError> {
    let text = serde_json::to_string_pretty(meta).map_err(|e| ReplayError::Io(e.to_string()))?;
    std::fs::write(&entry.meta, text).map_err(|e| ReplayError::Io(e.to_string()))
}

/// Cached bytes are reused forever unless the policy asks to compare against the
/// remote checksum. A remote object without a checksum keeps the cached copy.
pub fn is_valid(
    entry: &CacheEntry,
    bucket: &str,
    key: &str,
    policy: CachePolicy,
    remote_checksum: Option<&str>,
) -> bool {
    if !entry.file.is_file() {
        return false;
    }
    let Some(meta) = read_meta(entry) else {
        return false;
    };
    if meta.bucket != bucket || meta.key != key {
        return false;
    }
    match (policy, remote_checksum) {
        (CachePolicy::NeverExpire, _) | (CachePolicy::VerifyChecksum, None) => true,
        (CachePolicy::VerifyChecksum, Some(remote)) => meta.checksum.as_deref() == Some(remote),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populate(dir: &Path, checksum: Option<&str>) -> CacheEntry {
        let entry = cache_entry(dir, "bags", "2024/lap.mcap", "lap.mcap");
        std::fs::create_dir_all(entry.file.parent().expect("parent")).expect("dir");
        std::fs::write(&entry.file, b"mcap").expect("file");
        write_meta(
            &entry,
            &CacheMeta {
                bucket: "bags".to_string(),
                key: "2024/lap.mcap".to_string(),
                checksum: checksum.map(str::to_string),
            },
        )
        .expect("meta");
        entry
    }

    #[test]
    fn slot_is_a_stable_sixteen_char_prefix() {
        let slot = cache_slot("bags", "2024/lap.mcap");
        assert_eq!(slot.len(), 16);
        assert_eq!(slot, cache_slot("bags", "2024/lap.mcap"));
        assert_ne!(slot, cache_slot("other", "2024/lap.mcap"));
    }

    #[test]
    fn never_expire_ignores_remote_checksum() {
        let dir = tempfile::tempdir().expect("tempdir");
        let entry = populate(dir.path(), Some("abc"));
        assert!(is_valid(&entry, "bags", "2024/lap.mcap", CachePolicy::NeverExpire, Some("zzz")));
    }

    #[test]
    fn verify_checksum_refetches_on_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let entry = populate(dir.path(), Some("abc"));
        let policy = CachePolicy::VerifyChecksum;
        assert!(is_valid(&entry, "bags", "2024/lap.mcap", policy, Some("abc")));
        assert!(!is_valid(&entry, "bags", "2024/lap.mcap", policy, Some("def")));
        assert!(is_valid(&entry, "bags", "2024/lap.mcap", policy, None));
    }

    #[test]
    fn missing_meta_or_other_key_is_a_miss() {
        let dir = tempfile::tempdir().expect("tempdir");
        let entry = populate(dir.path(), None);
        assert!(!is_valid(&entry, "bags", "other.mcap", CachePolicy::NeverExpire, None));
        std::fs::remove_file(&entry.meta).expect("rm meta");
        assert!(!is_valid(&entry, "bags", "2024/lap.mcap", CachePolicy::NeverExpire, None));
    }
}
