//! Automatic stop on program limits.

mod common;

use common::*;
use reacher_daq::session::limits::{LimitConfig, LimitKind};
use reacher_daq::session::{SessionState, StopReason};
use reacher_daq::sink::NullSink;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_time_limit_stops_session() {
    let mut config = quick_config(16);
    config.limits = Some(LimitConfig::time(Duration::from_millis(300)));
    let (session, _wire) = started_session(config, Box::new(NullSink));

    assert!(session.wait_stopped_timeout(SETTLE), "time limit never fired");

    let status = session.status();
    match status.stop_reason {
        Some(StopReason::LimitReached(ref description)) => {
            assert!(description.starts_with("time limit"), "{description}")
        }
        ref other => panic!("unexpected stop reason {other:?}"),
    }
    assert!(status.active_time >= Duration::from_millis(300));
}

#[test]
fn test_paused_time_does_not_count_toward_limit() {
    let mut config = quick_config(16);
    config.limits = Some(LimitConfig::time(Duration::from_millis(300)));
    let started = Instant::now();
    let (session, _wire) = started_session(config, Box::new(NullSink));

    session.pause().unwrap();
    thread::sleep(Duration::from_millis(500));
    assert_eq!(session.state(), SessionState::Paused);

    session.resume().unwrap();
    assert!(session.wait_stopped_timeout(SETTLE));
    assert!(started.elapsed() >= Duration::from_millis(800));
    assert!(matches!(
        session.status().stop_reason,
        Some(StopReason::LimitReached(_))
    ));
}

#[test]
fn test_infusion_limit_waits_for_stop_delay() {
    let mut config = quick_config(16);
    config.limits = Some(LimitConfig::infusion(3, Duration::from_millis(200)));
    let (session, wire) = started_session(config, Box::new(NullSink));
    let log = session.event_log();

    wire.feed_lines(["PUMP,INFUSION,100,2100", "LH_LEVER,ACTIVE_PRESS,150,151"]);
    wire.feed_lines(["PUMP,INFUSION,2200,4200", "PUMP,INFUSION,4300,6300"]);

    assert!(wait_until(SETTLE, || log.infusion_count() == 3));
    let reached = Instant::now();
    assert!(session.wait_stopped_timeout(SETTLE), "infusion limit never fired");
    assert!(reached.elapsed() >= Duration::from_millis(150));

    match session.status().stop_reason {
        Some(StopReason::LimitReached(description)) => {
            assert_eq!(description, "infusion limit of 3 reached")
        }
        other => panic!("unexpected stop reason {other:?}"),
    }
    assert_eq!(log.len(), 4);
}

#[test]
fn test_either_limit_stops_when_both_configured() {
    let mut config = quick_config(16);
    config.limits = Some(LimitConfig {
        kind: LimitKind::Both,
        time_limit: Some(Duration::from_secs(60)),
        infusion_limit: Some(1),
        stop_delay: Duration::ZERO,
    });
    let (session, wire) = started_session(config, Box::new(NullSink));

    wire.feed_line("PUMP,INFUSION,10,2010");
    assert!(session.wait_stopped_timeout(SETTLE));
    assert!(matches!(
        session.status().stop_reason,
        Some(StopReason::LimitReached(ref d)) if d.starts_with("infusion")
    ));
}

#[test]
fn test_manual_stop_before_limit_keeps_requested_reason() {
    let mut config = quick_config(16);
    config.limits = Some(LimitConfig::time(Duration::from_secs(60)));
    let (session, _wire) = started_session(config, Box::new(NullSink));

    session.stop().unwrap();
    assert_eq!(session.status().stop_reason, Some(StopReason::Requested));
}
