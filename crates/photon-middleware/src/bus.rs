//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.  Sending is synchronous and never waits, so the safety core
//! can publish from inside its non-blocking methods, and no async runtime is
//! needed for delivery: [`TopicReceiver::try_recv`] drains events from plain
//! synchronous code.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Safety`] | State changes, laser-enable changes, named safety events |
//! | [`Topic::Interlock`] | Per-poll interlock level and edge notifications |
//! | [`Topic::Execution`] | Run state, progress, action start/complete, ramp steps |
//! | [`Topic::Watchdog`] | Heartbeat stats, normal stop, critical fault |

use photon_types::{Event, EventPayload, PhotonError};
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Enumeration of all routing topics on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Safety,
    Interlock,
    Execution,
    Watchdog,
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    safety: broadcast::Sender<Event>,
    interlock: broadcast::Sender<Event>,
    execution: broadcast::Sender<Event>,
    watchdog: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (safety, _) = broadcast::channel(capacity);
        let (interlock, _) = broadcast::channel(capacity);
        let (execution, _) = broadcast::channel(capacity);
        let (watchdog, _) = broadcast::channel(capacity);
        Self {
            safety,
            interlock,
            execution,
            watchdog,
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event, or
    /// [`PhotonError::Channel`] when nobody is listening on the topic.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, PhotonError> {
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| PhotonError::Channel(format!("No subscribers for topic {topic:?}")))
    }

    /// Fire-and-forget notification used by the safety core.
    ///
    /// A topic without listeners is a normal condition for a headless core,
    /// so the missing-subscriber case is only traced.
    pub fn notify(&self, topic: Topic, source: &str, payload: EventPayload) {
        if self.publish_to(topic, Event::new(source, payload)).is_err() {
            trace!(?topic, source, "notification dropped: no subscribers");
        }
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Safety => &self.safety,
            Topic::Interlock => &self.interlock,
            Topic::Execution => &self.execution,
            Topic::Watchdog => &self.watchdog,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// A receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.  The caller decides whether to
    ///   continue or abort.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking receive for synchronous listeners.
    ///
    /// Lagged gaps are logged and skipped; `None` means nothing is pending.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "TopicReceiver lagged");
                    continue;
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain every pending payload.
    pub fn drain(&mut self) -> Vec<EventPayload> {
        std::iter::from_fn(|| self.try_recv())
            .map(|e| e.payload)
            .collect()
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}
