//! CSV persistence.
//!
//! One session folder holds:
//!
//! - `<stem>.csv`: behavior rows (`Component,Action,Start Timestamp,End Timestamp`)
//! - `<stem>-frames.csv`: frame rows (`Frame Timestamp`)
//! - `<stem>-configuration.json`: the latest device configuration block
//!
//! Files are created on first use and every row is flushed as it is written.

use super::EventSink;
use crate::error::SinkError;
use crate::event::{Event, EventKind};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

const BEHAVIOR_HEADER: [&str; 4] = ["Component", "Action", "Start Timestamp", "End Timestamp"];
const FRAME_HEADER: [&str; 1] = ["Frame Timestamp"];

/// Writes a session's events as CSV files in one folder.
pub struct CsvSink {
    folder: PathBuf,
    stem: String,
    behavior: Option<csv::Writer<File>>,
    frames: Option<csv::Writer<File>>,
}

impl CsvSink {
    /// Create a sink writing into `folder`. `filename` may carry a `.csv` suffix.
    pub fn create(folder: impl Into<PathBuf>, filename: &str) -> Result<Self, SinkError> {
        let folder = folder.into();
        std::fs::create_dir_all(&folder)?;
        let stem = filename.strip_suffix(".csv").unwrap_or(filename).to_string();
        info!(folder = %folder.display(), stem = %stem, "CSV sink ready");
        Ok(Self {
            folder,
            stem,
            behavior: None,
            frames: None,
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Path of the behavior file.
    pub fn behavior_path(&self) -> PathBuf {
        self.folder.join(format!("{}.csv", self.stem))
    }

    /// Path of the frame file.
    pub fn frames_path(&self) -> PathBuf {
        self.folder.join(format!("{}-frames.csv", self.stem))
    }

    /// Path of the device configuration file.
    pub fn configuration_path(&self) -> PathBuf {
        self.folder.join(format!("{}-configuration.json", self.stem))
    }

    fn open_writer(path: &Path, header: &[&str]) -> Result<csv::Writer<File>, SinkError> {
        let file = File::create(path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(header)?;
        writer.flush()?;
        Ok(writer)
    }

    fn write_row(
        slot: &mut Option<csv::Writer<File>>,
        path: PathBuf,
        header: &[&str],
        row: &[&str],
    ) -> Result<(), SinkError> {
        if slot.is_none() {
            *slot = Some(Self::open_writer(&path, header)?);
        }
        if let Some(writer) = slot.as_mut() {
            writer.write_record(row)?;
            writer.flush()?;
        }
        Ok(())
    }
}

impl EventSink for CsvSink {
    fn append(&mut self, event: Event) -> Result<(), SinkError> {
        match event.kind() {
            EventKind::Behavior => {
                let path = self.behavior_path();
                Self::write_row(&mut self.behavior, path, &BEHAVIOR_HEADER, &event.values())
            }
            EventKind::Frame => {
                let timestamp = event.field("timestamp").unwrap_or_default();
                let path = self.frames_path();
                Self::write_row(&mut self.frames, path, &FRAME_HEADER, &[timestamp])
            }
            EventKind::Configuration => {
                let value = event.configuration().ok_or_else(|| {
                    SinkError::Rejected("configuration event without a JSON body".into())
                })?;
                let file = File::create(self.configuration_path())?;
                serde_json::to_writer_pretty(file, &value)?;
                Ok(())
            }
        }
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        for writer in [&mut self.behavior, &mut self.frames].into_iter().flatten() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn append(sink: &mut CsvSink, seq: u64, line: &str) {
        sink.append(Event::parse_text(seq, line, Duration::ZERO).unwrap())
            .unwrap();
    }

    #[test]
    fn writes_behavior_frames_and_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::create(dir.path().join("session"), "rat01.csv").unwrap();

        append(&mut sink, 0, r#"{"timeout": 20}"#);
        append(&mut sink, 1, "LH_LEVER,ACTIVE_PRESS,100,_");
        append(&mut sink, 2, "FRAME,120");
        append(&mut sink, 3, "PUMP,INFUSION,130,2130");
        sink.flush().unwrap();

        let behavior = std::fs::read_to_string(sink.behavior_path()).unwrap();
        assert_eq!(
            behavior,
            "Component,Action,Start Timestamp,End Timestamp\n\
             LH_LEVER,ACTIVE_PRESS,100,_\n\
             PUMP,INFUSION,130,2130\n"
        );

        let frames = std::fs::read_to_string(sink.frames_path()).unwrap();
        assert_eq!(frames, "Frame Timestamp\n120\n");

        let config: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(sink.configuration_path()).unwrap())
                .unwrap();
        assert_eq!(config["timeout"], 20);
    }

    #[test]
    fn files_appear_only_when_used() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::create(dir.path(), "run").unwrap();
        append(&mut sink, 0, "FRAME,5");
        assert!(sink.frames_path().exists());
        assert!(!sink.behavior_path().exists());
        assert!(sink.behavior_path().ends_with("run.csv"));
    }

    #[test]
    fn written_rows_reparse_to_the_same_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::create(dir.path(), "rt").unwrap();
        let lines = ["RH_LEVER,INACTIVE_PRESS,_,900", "CS,TONE,1000,3000"];
        for (seq, line) in lines.iter().enumerate() {
            append(&mut sink, seq as u64, line);
        }

        let mut reader = csv::Reader::from_path(sink.behavior_path()).unwrap();
        let rows: Vec<String> = reader
            .records()
            .map(|r| r.unwrap().iter().collect::<Vec<_>>().join(","))
            .collect();
        assert_eq!(rows, lines);
    }
}
