use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::experiment::{TrialPhase, TrialReport};

/// Unified event wrapper for the session event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "reachlab-middleware::capture"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Wrap `payload` with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// Motion-capture recording started or stopped.
    RecordingState { recording: bool },
    PhaseChanged { from: TrialPhase, to: TrialPhase },
    TrialCompleted(TrialReport),
    BlockStarted {
        block_index: usize,
        total_trials: u32,
    },
    SessionFinished { score: u32, total_trials: u32 },
    Fault { component: String, message: String },
}
