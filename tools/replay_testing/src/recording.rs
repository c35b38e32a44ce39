//! Sequential access to MCAP recordings.
//!
//! A [`RecordingReader`] memory-maps the file; every call to
//! [`RecordingReader::messages`] starts a fresh single-pass stream from the
//! first message, which is how a test re-reads a recording from the start.

use crate::errors::ReplayError;
use memmap2::Mmap;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedMessage {
    pub topic: String,
    pub schema_name: Option<String>,
    pub encoding: String,
    pub log_time: u64,
    pub publish_time: u64,
    pub data: Vec<u8>,
}

/// Maps a recording read-only. Recordings are written once and never modified
/// while a harness process holds them open.
pub fn map_recording(path: &Path) -> Result<Mmap, ReplayError> {
    let file = File::open(path)
        .map_err(|e| ReplayError::Recording(format!("{}: {e}", path.display())))?;
    // SAFETY: the file is opened read-only and nothing in this process writes to
    // it while the map is alive.
    unsafe { Mmap::map(&file) }
        .map_err(|e| ReplayError::Recording(format!("map {}: {e}", path.display())))
}

#[derive(Debug, Clone)]
pub struct RecordingReader {
    path: PathBuf,
    bytes: Arc<Mmap>,
}

impl RecordingReader {
    pub fn open(path: &Path) -> Result<Self, ReplayError> {
        let bytes = map_recording(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            bytes: Arc::new(bytes),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lazily yields messages in file order. An empty `topics` slice means every topic.
    pub fn messages<'a>(
        &'a self,
        topics: &'a [String],
    ) -> Result<impl Iterator<Item = Result<RecordedMessage, ReplayError>> + 'a, ReplayError> {
        let stream = mcap::MessageStream::new(&self.bytes[..])?;
        Ok(stream.filter_map(move |item| match item {
            Ok(message) => {
                if !topics.is_empty() && !topics.iter().any(|t| *t == message.channel.topic) {
                    return None;
                }
                Some(Ok(RecordedMessage {
                    topic: message.channel.topic.clone(),
                    schema_name: message.channel.schema.as_ref().map(|s| s.name.clone()),
                    encoding: message.channel.message_encoding.clone(),
                    log_time: message.log_time,
                    publish_time: message.publish_time,
                    data: message.data.into_owned(),
                }))
            }
            Err(err) => Some(Err(ReplayError::from(err))),
        }))
    }

    pub fn message_counts(&self) -> Result<BTreeMap<String, u64>, ReplayError> {
        let mut counts = BTreeMap::new();
        for message in self.messages(&[])? {
            *counts.entry(message?.topic).or_insert(0) += 1;
        }
        Ok(counts)
    }

    pub fn topics(&self) -> Result<BTreeSet<String>, ReplayError> {
        Ok(self.message_counts()?.into_keys().collect())
    }

    pub fn first_message(&self, topics: &[String]) -> Result<Option<RecordedMessage>, ReplayError> {
        self.messages(topics)?.next().transpose()
    }
}

/// Recursively finds `.mcap` files under `dir`, sorted so the first match is stable.
pub fn find_mcap_files(dir: &Path) -> Result<Vec<PathBuf>, ReplayError> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current)
            .map_err(|e| ReplayError::Io(format!("{}: {e}", current.display())))?;
        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == "mcap") {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}
