//! # REACHER acquisition core
//!
//! Serial event acquisition and session control for behavioral experiment
//! rigs. Microcontroller firmware streams timestamped text lines; this crate
//! reads them, buffers them in a bounded queue, parses them into structured
//! events and hands them to a sink, without losing or reordering a line,
//! while an operator pauses, resumes and stops the session.
//!
//! ## Crate Structure
//!
//! - **`transport`**: the `LineChannel`/`ChannelOpener` boundary to the serial
//!   hardware, the `LINK` handshake and reconnect policy, a `serialport`
//!   implementation and an in-process mock.
//! - **`acquisition`**: the per-session pipeline: bounded `EventQueue`,
//!   `ControlFlags`, and the reader and processor threads.
//! - **`event`**: parsing of device lines into `Event`s.
//! - **`sink`**: the `EventSink` trait with CSV, in-memory, fan-out and shared sinks.
//! - **`session`**: `Session` lifecycle (start/pause/resume/stop), program limits
//!   and the multi-device `SessionController`.
//! - **`config`**: Figment-based configuration (TOML + `REACHER_` environment).
//! - **`destination`**: per-session data folders.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: `AcquisitionError` and the per-stage leaf errors.

pub mod acquisition;
pub mod config;
pub mod destination;
pub mod error;
pub mod event;
pub mod logging;
pub mod session;
pub mod sink;
pub mod transport;

pub use acquisition::{ControlFlags, EventQueue, RawLine, SessionStats};
pub use config::{AppConfig, RetryPolicy, SessionConfig};
pub use error::{AcquisitionError, AcquisitionResult};
pub use event::{Event, EventKind, EventTime};
pub use session::{
    Fault, FaultKind, Session, SessionController, SessionHandle, SessionNotice, SessionState,
    SessionStatus, StopReason,
};
pub use sink::{EventLog, EventSink, MemorySink};
