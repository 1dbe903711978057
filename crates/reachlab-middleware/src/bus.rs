//! Topic-routed broadcast bus.
//!
//! One [`tokio::sync::broadcast`] channel per [`Topic`]. Sending is
//! synchronous and never waits, so the control loop publishes from its own
//! thread; listeners and reporters receive on the async runtime.
//!
//! | Topic | Producer | Consumer |
//! |---|---|---|
//! | [`Topic::Capture`] | capture listener | recording gate |
//! | [`Topic::Protocol`] | control loop | console / presentation |
//! | [`Topic::Alerts`] | control loop, Ctrl-C handler | monitoring |
//!
//! A receiver that falls more than the channel capacity behind loses the
//! oldest events and sees `Lagged(n)` once.

use reachlab_types::{Event, LabError};
use tokio::sync::broadcast::{self, Sender};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Recording started/stopped notifications, inbound.
    Capture,
    /// Phase changes, trial reports, block and session events, outbound.
    Protocol,
    /// Faults and operator stops.
    Alerts,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Capture, Topic::Protocol, Topic::Alerts];

    fn lane(self) -> usize {
        match self {
            Topic::Capture => 0,
            Topic::Protocol => 1,
            Topic::Alerts => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Capture => "capture",
            Topic::Protocol => "protocol",
            Topic::Alerts => "alerts",
        }
    }
}

/// Cloning shares the channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    lanes: [Sender<Event>; 3],
}

impl EventBus {
    /// `capacity` events are buffered per topic.
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Topic::ALL.map(|_| broadcast::channel(capacity).0),
        }
    }

    /// Hand `event` to every current subscriber of `topic` and return how
    /// many there were.
    ///
    /// # Errors
    ///
    /// [`LabError::Channel`] when `topic` has no subscriber. Opportunistic
    /// publishers drop it.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, LabError> {
        self.lanes[topic.lane()]
            .send(event)
            .map_err(|_| LabError::Channel(format!("nobody is listening on {}", topic.as_str())))
    }

    /// Receive everything published to `topic` from now on.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.lanes[topic.lane()].subscribe(),
        }
    }

    pub fn receiver_count(&self, topic: Topic) -> usize {
        self.lanes[topic.lane()].receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Subscription to one topic, from [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Next event. `Lagged(n)` reports `n` events lost to overflow; `Closed`
    /// means every sender has been dropped.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Next queued event, if any. Usable outside the runtime.
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}
