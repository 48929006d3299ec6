//! Ordered event stream emitted by the supervisor.
//!
//! Events carry a monotonically increasing sequence number and end with
//! exactly one `Complete`, after which the channel is closed. The HTTP
//! layer serializes these to SSE frames; this crate only defines the
//! contract.

use serde::{Deserialize, Serialize};

/// Terminal outcome delivered with the `Complete` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Success,
    Failed,
    Cancelled,
    TokenLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    /// Emitted once, at launch.
    Start,
    /// One per output line, in emission order.
    Output(String),
    /// Supervisor-driven progress labels.
    Status(String),
    /// At most once, before a failed `Complete`.
    Error(String),
    /// Exactly once; the stream closes after it.
    Complete(CompletionStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

// ---------------------------------------------------------------------------
// EventSender
// ---------------------------------------------------------------------------

/// Sending half of a dispatch event stream.
///
/// Sends never fail from the supervisor's point of view; a vanished
/// subscriber is not a dispatch error. After `Complete` the sender goes
/// quiet and the receiver sees the channel close.
pub struct EventSender {
    tx: flume::Sender<DispatchEvent>,
    seq: std::sync::atomic::AtomicU64,
    completed: std::sync::atomic::AtomicBool,
}

impl EventSender {
    /// Create a bounded event channel.
    pub fn channel(capacity: usize) -> (EventSender, flume::Receiver<DispatchEvent>) {
        let (tx, rx) = flume::bounded(capacity);
        (
            EventSender {
                tx,
                seq: std::sync::atomic::AtomicU64::new(0),
                completed: std::sync::atomic::AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Emit an event with the next sequence number. Events after
    /// `Complete` are dropped.
    pub fn send(&self, kind: EventKind) {
        use std::sync::atomic::Ordering;

        if self.completed.load(Ordering::Acquire) {
            return;
        }
        if matches!(kind, EventKind::Complete(_)) {
            self.completed.store(true, Ordering::Release);
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.try_send(DispatchEvent { seq, kind });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_are_monotonic() {
        let (tx, rx) = EventSender::channel(64);
        tx.send(EventKind::Start);
        tx.send(EventKind::Output("a".into()));
        tx.send(EventKind::Output("b".into()));
        tx.send(EventKind::Complete(CompletionStatus::Success));

        let events: Vec<DispatchEvent> = rx.drain().collect();
        assert_eq!(events.len(), 4);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.seq, i as u64);
        }
        assert_eq!(
            events.last().unwrap().kind,
            EventKind::Complete(CompletionStatus::Success)
        );
    }

    #[test]
    fn nothing_after_complete() {
        let (tx, rx) = EventSender::channel(8);
        tx.send(EventKind::Complete(CompletionStatus::Cancelled));
        tx.send(EventKind::Output("late".into()));
        tx.send(EventKind::Complete(CompletionStatus::Success));

        let events: Vec<DispatchEvent> = rx.drain().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].kind,
            EventKind::Complete(CompletionStatus::Cancelled)
        );
    }

    #[test]
    fn full_channel_does_not_block_sender() {
        let (tx, rx) = EventSender::channel(1);
        tx.send(EventKind::Output("one".into()));
        tx.send(EventKind::Output("two".into())); // dropped, not blocked
        assert_eq!(rx.drain().count(), 1);
    }

    #[test]
    fn event_json_shape() {
        let event = DispatchEvent {
            seq: 3,
            kind: EventKind::Output("hello".into()),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"seq\":3"));
        assert!(json.contains("\"type\":\"output\""));
        assert!(json.contains("\"data\":\"hello\""));
    }
}
