//! Motion-capture recording signal.
//!
//! The capture system broadcasts `"capture started"` / `"capture stopped"`
//! notifications. [`CaptureSignalListener`] receives them on a UDP socket
//! inside the async runtime and republishes them on [`Topic::Capture`];
//! [`RecordingGate`] is the loop-side view, drained without blocking once per
//! iteration.

use std::net::SocketAddr;

use reachlab_types::{Event, EventPayload, LabError};
use tokio::net::UdpSocket;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Topic, TopicReceiver};

const SOURCE: &str = "reachlab-middleware::capture";

/// Interpret a notification payload. `Some(true)` for started, `Some(false)`
/// for stopped, `None` for anything else.
///
/// Matching ignores case, surrounding whitespace and NUL padding, and accepts
/// the phrase embedded in a longer message.
pub fn parse_capture_signal(payload: &[u8]) -> Option<bool> {
    let text = String::from_utf8_lossy(payload).to_ascii_lowercase();
    let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if text.contains("capture started") {
        Some(true)
    } else if text.contains("capture stopped") {
        Some(false)
    } else {
        None
    }
}

/// Build the bus event for a recording-state change.
pub fn recording_event(recording: bool) -> Event {
    Event::new(SOURCE, EventPayload::RecordingState { recording })
}

// ────────────────────────────────────────────────────────────────────────────
// Loop-side gate
// ────────────────────────────────────────────────────────────────────────────

/// Latest known recording state, updated by draining the capture topic.
pub struct RecordingGate {
    receiver: TopicReceiver,
    recording: bool,
}

impl RecordingGate {
    pub fn new(bus: &EventBus) -> Self {
        Self {
            receiver: bus.subscribe_to(Topic::Capture),
            recording: false,
        }
    }

    /// Apply every queued notification and return the current state.
    /// Never blocks.
    pub fn poll(&mut self) -> bool {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if let EventPayload::RecordingState { recording } = event.payload {
                        if recording != self.recording {
                            info!(recording, "recording state changed");
                        }
                        self.recording = recording;
                    }
                }
                Err(TryRecvError::Lagged(n)) => {
                    warn!(skipped = n, "recording gate lagged, older notifications dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        self.recording
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }
}

// ────────────────────────────────────────────────────────────────────────────
// UDP listener
// ────────────────────────────────────────────────────────────────────────────

/// Receives capture notifications on a UDP socket and publishes them.
pub struct CaptureSignalListener {
    socket: UdpSocket,
    bus: EventBus,
}

impl CaptureSignalListener {
    /// # Errors
    ///
    /// Returns [`LabError::Channel`] when the socket cannot be bound.
    pub async fn bind(addr: SocketAddr, bus: EventBus) -> Result<Self, LabError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| LabError::Channel(format!("bind capture listener {addr}: {e}")))?;
        info!(%addr, "capture signal listener bound");
        Ok(Self { socket, bus })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LabError> {
        self.socket
            .local_addr()
            .map_err(|e| LabError::Channel(e.to_string()))
    }

    /// Receive until the socket fails. Unrecognised payloads are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::Channel`] on a socket error.
    pub async fn run(self) -> Result<(), LabError> {
        let mut buf = [0u8; 1024];
        loop {
            let (n, src) = self
                .socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| LabError::Channel(format!("capture listener: {e}")))?;
            match parse_capture_signal(&buf[..n]) {
                Some(recording) => {
                    debug!(%src, recording, "capture notification");
                    if let Err(e) = self.bus.publish_to(Topic::Capture, recording_event(recording)) {
                        debug!(error = %e, "capture notification had no subscribers");
                    }
                }
                None => debug!(%src, len = n, "ignoring unrecognised capture payload"),
            }
        }
    }
}
