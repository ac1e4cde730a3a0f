//! Per-session event fan-out with a bounded replay window.
//!
//! Every session gets its own channel: a ring of the most recent events
//! plus the senders of its live subscribers, all behind one mutex. Events
//! published before anyone subscribes are still buffered, so a subscriber
//! that attaches late sees recent history first. Closing a session ends
//! every feed and leaves a tombstone so later subscribers get an
//! already-finished feed instead of waiting forever.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use parley_core::{SessionId, StreamEvent};

pub const DEFAULT_REPLAY_CAPACITY: usize = 50;

/// Live feed of one session's events. Ends when the session is closed.
pub type EventStream = UnboundedReceiverStream<StreamEvent>;

#[derive(Clone, Debug)]
pub struct BusConfig {
    /// How many recent events a new subscriber receives first.
    pub replay_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
        }
    }
}

#[derive(Default)]
struct Channel {
    replay: VecDeque<StreamEvent>,
    subscribers: Vec<mpsc::UnboundedSender<StreamEvent>>,
    closed: bool,
}

enum Slot {
    Open(Arc<Mutex<Channel>>),
    Closed,
}

pub struct EventBus {
    config: BusConfig,
    channels: DashMap<SessionId, Slot>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

fn ended_stream() -> EventStream {
    let (_tx, rx) = mpsc::unbounded_channel();
    UnboundedReceiverStream::new(rx)
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            channels: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Channel for `id`, created on first use. `None` once closed.
    fn channel(&self, id: &SessionId) -> Option<Arc<Mutex<Channel>>> {
        if let Some(slot) = self.channels.get(id) {
            return match slot.value() {
                Slot::Open(channel) => Some(Arc::clone(channel)),
                Slot::Closed => None,
            };
        }
        let slot = self
            .channels
            .entry(id.clone())
            .or_insert_with(|| Slot::Open(Arc::default()));
        match slot.value() {
            Slot::Open(channel) => Some(Arc::clone(channel)),
            Slot::Closed => None,
        }
    }

    /// Attach to a session's events: the buffered window in original order,
    /// then everything published afterwards.
    pub fn subscribe(&self, id: &SessionId) -> EventStream {
        let Some(channel) = self.channel(id) else {
            debug!(session_id = %id, "subscribe to closed session");
            return ended_stream();
        };

        let mut channel = channel.lock();
        if channel.closed {
            return ended_stream();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for event in &channel.replay {
            let _ = tx.send(event.clone());
        }
        channel.subscribers.push(tx);
        UnboundedReceiverStream::new(rx)
    }

    /// Buffer `event` and deliver it to every live subscriber.
    pub fn publish(&self, id: &SessionId, event: StreamEvent) {
        let Some(channel) = self.channel(id) else {
            debug!(session_id = %id, event = event.event_type(), "publish to closed session dropped");
            return;
        };

        let mut channel = channel.lock();
        if channel.closed {
            debug!(session_id = %id, event = event.event_type(), "publish to closed session dropped");
            return;
        }
        channel.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if self.config.replay_capacity > 0 {
            channel.replay.push_back(event);
            while channel.replay.len() > self.config.replay_capacity {
                channel.replay.pop_front();
            }
        }
    }

    /// End every feed for `id` and release its buffer. Subscribers still
    /// receive events that were already delivered to them.
    pub fn close_session(&self, id: &SessionId) {
        let previous = self.channels.insert(id.clone(), Slot::Closed);
        if let Some(Slot::Open(channel)) = previous {
            let mut channel = channel.lock();
            channel.closed = true;
            channel.subscribers.clear();
            channel.replay.clear();
        }
        debug!(session_id = %id, "session stream closed");
    }

    /// Drop everything kept for `id`, including the closed marker. Open
    /// feeds end as with [`EventBus::close_session`].
    pub fn forget(&self, id: &SessionId) -> bool {
        match self.channels.remove(id) {
            Some((_, Slot::Open(channel))) => {
                let mut channel = channel.lock();
                channel.closed = true;
                channel.subscribers.clear();
                channel.replay.clear();
                true
            }
            Some((_, Slot::Closed)) => true,
            None => false,
        }
    }

    /// Sessions with a channel or a closed marker.
    pub fn tracked_sessions(&self) -> usize {
        self.channels.len()
    }

    pub fn is_closed(&self, id: &SessionId) -> bool {
        matches!(self.channels.get(id).as_deref(), Some(Slot::Closed))
    }

    /// Live subscribers for `id`. Subscribers that went away are pruned.
    pub fn subscriber_count(&self, id: &SessionId) -> usize {
        let channel = match self.channels.get(id).as_deref() {
            Some(Slot::Open(channel)) => Arc::clone(channel),
            _ => return 0,
        };
        let mut channel = channel.lock();
        channel.subscribers.retain(|tx| !tx.is_closed());
        channel.subscribers.len()
    }

    /// Number of sessions with an open channel.
    pub fn open_sessions(&self) -> usize {
        self.channels
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Open(_)))
            .count()
    }
}
