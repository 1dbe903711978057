//! `reachlab-middleware` – event routing.
//!
//! Carries asynchronous signals into the fixed-rate loop and session events
//! out of it, without caring about their meaning.
//!
//! # Modules
//!
//! - [`bus`] – typed, topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels.
//! - [`capture`] – the motion-capture recording signal: a UDP listener that
//!   publishes it and a non-blocking [`RecordingGate`] the loop polls.

pub mod bus;
pub mod capture;

pub use bus::{EventBus, Topic, TopicReceiver};
pub use capture::{CaptureSignalListener, RecordingGate, parse_capture_signal, recording_event};
