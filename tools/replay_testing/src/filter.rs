use crate::errors::ReplayError;
use crate::logging::append_run_log;
use crate::recording::map_recording;
use crate::types::{TopicSet, CLOCK_TOPIC};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

pub const FILTERED_FIXTURE_NAME: &str = "filtered.mcap";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterReport {
    pub kept: BTreeMap<String, u64>,
    pub dropped: BTreeMap<String, u64>,
}

impl FilterReport {
    pub fn kept_messages(&self) -> u64 {
        self.kept.values().sum()
    }
}

fn should_drop(topic: &str, topics: &TopicSet) -> bool {
    topic == CLOCK_TOPIC || topics.expected_output_topics.contains(topic)
}

/// Copies every message of `input` whose topic is neither an expected output nor
/// the clock topic into `output`, keeping timestamps, sequence numbers, schemas and
/// channel metadata. `output` only appears once every required topic was seen.
pub fn filter_fixture(
    input: &Path,
    output: &Path,
    topics: &TopicSet,
) -> Result<FilterReport, ReplayError> {
    let mapped = map_recording(input)?;
    let staging = output.with_extension("mcap.partial");
    let result = copy_filtered(&mapped[..], &staging, topics);

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            let _ = std::fs::remove_file(&staging);
            return Err(err);
        }
    };

    let missing = topics
        .required_input_topics
        .iter()
        .filter(|topic| !report.kept.contains_key(topic.as_str()))
        .cloned()
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        let _ = std::fs::remove_file(&staging);
        append_run_log(
            "error",
            "filter.missing_required_topics",
            json!({
                "input": input.display().to_string(),
                "missing": missing,
                "present": report.kept.keys().collect::<Vec<_>>(),
            }),
        );
        return Err(ReplayError::MissingRequiredTopic(missing));
    }

    std::fs::rename(&staging, output).map_err(|e| ReplayError::Io(e.to_string()))?;
    append_run_log(
        "info",
        "filter.completed",
        json!({
            "input": input.display().to_string(),
            "output": output.display().to_string(),
            "kept": report.kept,
            "dropped": report.dropped,
        }),
    );
    Ok(report)
}

fn copy_filtered(bytes: &[u8], staging: &Path, topics: &TopicSet) -> Result<FilterReport, ReplayError> {
    let file = File::create(staging).map_err(|e| ReplayError::Io(e.to_string()))?;
    let mut writer = mcap::Writer::new(BufWriter::new(file))?;
    let mut report = FilterReport::default();

    for message in mcap::MessageStream::new(bytes)? {
        let message = message?;
        let topic = message.channel.topic.clone();
        if should_drop(&topic, topics) {
            *report.dropped.entry(topic).or_insert(0) += 1;
            continue;
        }
        writer.write(&message)?;
        *report.kept.entry(topic).or_insert(0) += 1;
    }

    writer.finish()?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingReader;
    use std::collections::{BTreeMap, BTreeSet};

    fn write_fixture(path: &Path, topics: &[&str]) {
        let file = File::create(path).expect("create");
        let mut writer = mcap::Writer::new(BufWriter::new(file)).expect("writer");
        let schema = writer
            .add_schema("geometry_msgs/msg/Twist", "ros2msg", b"")
            .expect("schema");
        let mut metadata = BTreeMap::new();
        metadata.insert("offered_qos_profiles".to_string(), "reliable".to_string());
        for (index, topic) in topics.iter().enumerate() {
            let channel = writer
                .add_channel(schema, topic, "cdr", &metadata)
                .expect("channel");
            writer
                .write_to_known_channel(
                    &mcap::records::MessageHeader {
                        channel_id: channel,
                        sequence: index as u32,
                        log_time: 1_000 + index as u64,
                        publish_time: 1_000 + index as u64,
                    },
                    b"payload",
                )
                .expect("message");
        }
        writer.finish().expect("finish");
    }

    fn topic_set(required: &[&str], outputs: &[&str]) -> TopicSet {
        TopicSet {
            required_input_topics: required.iter().map(|t| t.to_string()).collect(),
            expected_output_topics: outputs.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn strips_outputs_and_clock_but_keeps_timestamps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("input.mcap");
        let output = dir.path().join(FILTERED_FIXTURE_NAME);
        write_fixture(&input, &["/vehicle/cmd_vel", "/user/cmd_vel", "/clock", "/tf"]);

        let report = filter_fixture(
            &input,
            &output,
            &topic_set(&["/vehicle/cmd_vel"], &["/user/cmd_vel"]),
        )
        .expect("filter");
        assert_eq!(report.kept_messages(), 2);
        assert_eq!(report.dropped.get("/clock"), Some(&1));

        let reader = RecordingReader::open(&output).expect("open");
        let topics = reader.topics().expect("topics");
        let expected: BTreeSet<String> = ["/tf", "/vehicle/cmd_vel"]
            .iter()
            .map(|t| t.to_string())
            .collect();
        assert_eq!(topics, expected);
        let first = reader.first_message(&[]).expect("read").expect("message");
        assert_eq!(first.log_time, 1_000);
        assert!(!dir.path().join("filtered.mcap.partial").exists());
    }

    #[test]
    fn refiltering_yields_the_same_topic_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("input.mcap");
        let once = dir.path().join("once.mcap");
        let twice = dir.path().join("twice.mcap");
        write_fixture(&input, &["/a", "/b", "/out"]);
        let topics = topic_set(&["/a"], &["/out"]);

        filter_fixture(&input, &once, &topics).expect("first");
        filter_fixture(&once, &twice, &topics).expect("second");
        assert_eq!(
            RecordingReader::open(&once).expect("once").topics().expect("t1"),
            RecordingReader::open(&twice).expect("twice").topics().expect("t2")
        );
    }

    #[test]
    fn missing_required_topics_are_named_and_no_output_is_left() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("input.mcap");
        let output = dir.path().join(FILTERED_FIXTURE_NAME);
        write_fixture(&input, &["/a"]);

        let err = filter_fixture(&input, &output, &topic_set(&["/a", "/z", "/y"], &[]))
            .expect_err("missing");
        match err {
            ReplayError::MissingRequiredTopic(missing) => {
                assert_eq!(missing, vec!["/y".to_string(), "/z".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!output.exists());
    }
}
