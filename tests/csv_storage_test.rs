//! A session recording to CSV files end to end.
#![cfg(feature = "storage_csv")]

mod common;

use common::*;
use reacher_daq::destination::DataDestination;
use reacher_daq::sink::CsvSink;

#[test]
fn test_session_writes_csv_files() {
    let root = tempfile::tempdir().unwrap();
    let destination = DataDestination::new(root.path(), "rat07");
    let folder = destination.prepare().unwrap();
    let sink = CsvSink::create(&folder, destination.filename()).unwrap();
    let (behavior, frames, configuration) =
        (sink.behavior_path(), sink.frames_path(), sink.configuration_path());

    let (session, wire) = started_session(quick_config(16), Box::new(sink));
    let log = session.event_log();

    wire.feed_lines([
        r#"{"timeout": 30, "ratio": 1}"#,
        "LH_LEVER,ACTIVE_PRESS,1000,1040",
        "FRAME,1010",
        "not,a,valid,line,at,all",
        "PUMP,INFUSION,1050,3050",
        "FRAME,1043",
    ]);
    assert!(wait_until(SETTLE, || log.len() == 5));
    session.stop().unwrap();

    assert_eq!(folder, root.path().join("rat07"));
    assert_eq!(
        std::fs::read_to_string(&behavior).unwrap(),
        "Component,Action,Start Timestamp,End Timestamp\n\
         LH_LEVER,ACTIVE_PRESS,1000,1040\n\
         PUMP,INFUSION,1050,3050\n"
    );
    assert_eq!(
        std::fs::read_to_string(&frames).unwrap(),
        "Frame Timestamp\n1010\n1043\n"
    );
    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&configuration).unwrap()).unwrap();
    assert_eq!(saved["timeout"], 30);
    assert_eq!(session.status().stats.parse_errors, 1);
}
