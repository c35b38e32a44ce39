#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Writes an MCAP file with one message per `(topic, count)` entry repeated `count` times.
pub fn write_mcap(path: &Path, topics: &[(&str, u32)]) {
    let file = File::create(path).expect("create mcap");
    let mut writer = mcap::Writer::new(BufWriter::new(file)).expect("mcap writer");
    let schema = writer
        .add_schema("geometry_msgs/msg/Twist", "ros2msg", b"")
        .expect("schema");
    let mut sequence = 0u32;
    for (topic, count) in topics {
        let channel = writer
            .add_channel(schema, topic, "cdr", &BTreeMap::new())
            .expect("channel");
        for _ in 0..*count {
            writer
                .write_to_known_channel(
                    &mcap::records::MessageHeader {
                        channel_id: channel,
                        sequence,
                        log_time: 1_000 + u64::from(sequence),
                        publish_time: 1_000 + u64::from(sequence),
                    },
                    b"twist",
                )
                .expect("message");
            sequence += 1;
        }
    }
    writer.finish().expect("finish");
}

/// A scratch workspace with a test file, its fixture, and a config whose recorder
/// "records" by copying a prepared output MCAP into its bag directory.
pub struct Workspace {
    pub dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    pub fn tmp_root(&self) -> PathBuf {
        self.root().join("runs")
    }

    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.root().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(&path, contents).expect("write");
        path
    }

    /// Config pointing the recorder and player at `sh`. `recorded` is copied into the
    /// recorder's output directory as soon as it starts.
    pub fn write_config(&self, recorded: &Path) -> PathBuf {
        self.write_config_with(recorded, 20, PLAY_ONCE)
    }

    /// Same as `write_config` with an explicit timeout and `play` command (a TOML array).
    pub fn write_config_with(&self, recorded: &Path, timeout_seconds: u64, play: &str) -> PathBuf {
        let contents = format!(
            r#"[run]
timeout_seconds = {timeout_seconds}
teardown_grace_seconds = 2
poll_interval_ms = 20

[commands]
record = ["sh", "-c", "mkdir -p \"$1\" && cp \"$2\" \"$1/rec_0.mcap\" && exec sleep 30", "recorder", "${{output}}", "{recorded}"]
play = {play}
"#,
            recorded = recorded.display()
        );
        self.write("replay_testing.toml", &contents)
    }
}

/// Player that checks the fixture exists and finishes after a second.
pub const PLAY_ONCE: &str = r#"["sh", "-c", "test -f \"$1\" && sleep 1", "player", "${fixture}"]"#;

/// Player that never finishes on its own.
pub const PLAY_FOREVER: &str = r#"["sh", "-c", "exec sleep 30"]"#;
