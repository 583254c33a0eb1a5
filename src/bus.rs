//! Live output bus: per-host, in-order, replayable operation event stream.
//!
//! Every subscriber first receives the buffered prefix, then new events in
//! publish order; the buffer lock is held across replay and registration so
//! no event can slip between the two. A `reset` clears the buffer and tells
//! subscribers to clear their local view. Subscribers whose channel is gone
//! are evicted silently on the next publish.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::constants::bus::BUFFER_CAPACITY;
use crate::ssh::StreamKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    Reset,
    Started { command: String, manager: String },
    Output { data: String, stream: StreamKind },
    Phase { label: String },
    Warning { message: String },
    Error { message: String },
    Done { success: bool },
}

#[derive(Default)]
struct HostStream {
    buffer: VecDeque<BusMessage>,
    subscribers: Vec<mpsc::UnboundedSender<BusMessage>>,
}

#[derive(Default)]
pub struct LiveBus {
    streams: Mutex<HashMap<String, HostStream>>,
}

impl LiveBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, host_id: &str, message: BusMessage) {
        let mut streams = self.streams.lock().await;
        let stream = streams.entry(host_id.to_string()).or_default();

        if message == BusMessage::Reset {
            stream.buffer.clear();
        } else {
            stream.buffer.push_back(message.clone());
            while stream.buffer.len() > BUFFER_CAPACITY {
                stream.buffer.pop_front();
            }
        }

        stream
            .subscribers
            .retain(|tx| tx.send(message.clone()).is_ok());
    }

    /// Attach a subscriber; the current buffer is replayed before any event
    /// published after this call.
    pub async fn subscribe(&self, host_id: &str) -> mpsc::UnboundedReceiver<BusMessage> {
        let mut streams = self.streams.lock().await;
        let stream = streams.entry(host_id.to_string()).or_default();

        let (tx, rx) = mpsc::unbounded_channel();
        for buffered in &stream.buffer {
            // A receiver dropped during replay just never registers.
            if tx.send(buffered.clone()).is_err() {
                return rx;
            }
        }
        stream.subscribers.push(tx);
        debug!(
            "Live subscriber attached to {} ({} events replayed)",
            host_id,
            stream.buffer.len()
        );
        rx
    }

    /// Drop the host's stream entirely, closing all subscribers. Used when
    /// a host is deleted.
    pub async fn remove_stream(&self, host_id: &str) {
        let mut streams = self.streams.lock().await;
        streams.remove(host_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_buffer_to_new_subscriber() {
        let bus = LiveBus::new();
        bus.publish("h1", BusMessage::Phase { label: "one".into() }).await;
        bus.publish("h1", BusMessage::Phase { label: "two".into() }).await;

        let mut rx = bus.subscribe("h1").await;
        bus.publish("h1", BusMessage::Done { success: true }).await;

        assert_eq!(rx.recv().await.unwrap(), BusMessage::Phase { label: "one".into() });
        assert_eq!(rx.recv().await.unwrap(), BusMessage::Phase { label: "two".into() });
        assert_eq!(rx.recv().await.unwrap(), BusMessage::Done { success: true });
    }

    #[tokio::test]
    async fn reset_clears_buffer_and_reaches_subscribers() {
        let bus = LiveBus::new();
        bus.publish("h1", BusMessage::Phase { label: "old".into() }).await;
        let mut live = bus.subscribe("h1").await;
        assert_eq!(live.recv().await.unwrap(), BusMessage::Phase { label: "old".into() });

        bus.publish("h1", BusMessage::Reset).await;
        assert_eq!(live.recv().await.unwrap(), BusMessage::Reset);

        // A subscriber arriving after the reset sees nothing old.
        let mut fresh = bus.subscribe("h1").await;
        bus.publish("h1", BusMessage::Done { success: false }).await;
        assert_eq!(fresh.recv().await.unwrap(), BusMessage::Done { success: false });
    }

    #[tokio::test]
    async fn dropped_subscriber_is_evicted() {
        let bus = LiveBus::new();
        let rx = bus.subscribe("h1").await;
        drop(rx);
        bus.publish("h1", BusMessage::Done { success: true }).await;

        let streams = bus.streams.lock().await;
        assert!(streams.get("h1").unwrap().subscribers.is_empty());
    }

    #[tokio::test]
    async fn remove_stream_closes_subscribers() {
        let bus = LiveBus::new();
        let mut rx = bus.subscribe("h1").await;
        bus.remove_stream("h1").await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn buffer_is_bounded() {
        let bus = LiveBus::new();
        for i in 0..(BUFFER_CAPACITY + 10) {
            bus.publish("h1", BusMessage::Phase { label: i.to_string() }).await;
        }
        let streams = bus.streams.lock().await;
        assert_eq!(streams.get("h1").unwrap().buffer.len(), BUFFER_CAPACITY);
    }

    #[test]
    fn messages_serialize_with_type_tag() {
        let json = serde_json::to_string(&BusMessage::Output {
            data: "hello".into(),
            stream: StreamKind::Stdout,
        })
        .unwrap();
        assert!(json.contains(r#""type":"output""#));
        assert!(json.contains(r#""stream":"stdout""#));

        let json = serde_json::to_string(&BusMessage::Reset).unwrap();
        assert_eq!(json, r#"{"type":"reset"}"#);
    }
}
