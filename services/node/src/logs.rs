//! Per-deployment log storage: a bounded ring plus a live feed.
//!
//! Every captured line lands in the ring (oldest entries fall out once
//! the cap is reached) and is broadcast to live subscribers. A
//! subscriber that falls behind the broadcast buffer observes a lag
//! error and is expected to end its stream with a slow-consumer notice.

use std::collections::VecDeque;
use std::sync::Mutex;

use symphony_proto::{LogEntry, LogStream};
use tokio::sync::broadcast;

/// Default ring capacity.
pub const DEFAULT_LOG_CAPACITY: usize = 3000;

/// Live-feed buffer; beyond this a subscriber lags out.
const LIVE_BUFFER: usize = 512;

struct RingInner {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    dropped: u64,
}

/// Bounded log ring with a live broadcast feed.
pub struct LogRing {
    inner: Mutex<RingInner>,
    live: broadcast::Sender<LogEntry>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(LIVE_BUFFER);
        Self {
            inner: Mutex::new(RingInner {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                capacity: capacity.max(1),
                dropped: 0,
            }),
            live,
        }
    }

    /// Append a line, timestamped now.
    pub fn push(&self, stream: LogStream, line: impl Into<String>) {
        let entry = LogEntry {
            timestamp_unix_ms: chrono::Utc::now().timestamp_millis(),
            stream,
            line: line.into(),
        };

        {
            let mut inner = self.inner.lock().expect("log ring lock poisoned");
            inner.entries.push_back(entry.clone());
            while inner.entries.len() > inner.capacity {
                inner.entries.pop_front();
                inner.dropped += 1;
            }
        }

        // Nobody listening is fine.
        let _ = self.live.send(entry);
    }

    /// The most recent `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogEntry> {
        let inner = self.inner.lock().expect("log ring lock poisoned");
        let skip = inner.entries.len().saturating_sub(n);
        inner.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("log ring lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lines lost to the ring bound so far.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().expect("log ring lock poisoned").dropped
    }

    /// Subscribe to the live feed.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.live.subscribe()
    }

    /// Adjust the ring bound (spec updates); trims immediately.
    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock().expect("log ring lock poisoned");
        inner.capacity = capacity.max(1);
        while inner.entries.len() > inner.capacity {
            inner.entries.pop_front();
            inner.dropped += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_holds_exactly_the_last_capacity_lines() {
        let ring = LogRing::new(DEFAULT_LOG_CAPACITY);
        for i in 0..10_000 {
            ring.push(LogStream::Stdout, format!("line-{i}"));
        }

        assert_eq!(ring.len(), DEFAULT_LOG_CAPACITY);
        assert_eq!(ring.dropped(), 10_000 - DEFAULT_LOG_CAPACITY as u64);

        let tail = ring.tail(200);
        assert_eq!(tail.len(), 200);
        assert_eq!(tail[0].line, "line-9800");
        assert_eq!(tail[199].line, "line-9999");
    }

    #[test]
    fn tail_larger_than_ring_returns_everything() {
        let ring = LogRing::new(100);
        for i in 0..5 {
            ring.push(LogStream::Stderr, format!("e{i}"));
        }
        let tail = ring.tail(200);
        assert_eq!(tail.len(), 5);
        assert_eq!(tail[0].line, "e0");
    }

    #[tokio::test]
    async fn live_feed_delivers_in_order() {
        let ring = LogRing::new(100);
        let mut rx = ring.subscribe();

        ring.push(LogStream::Stdout, "a");
        ring.push(LogStream::System, "b");

        assert_eq!(rx.recv().await.unwrap().line, "a");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.line, "b");
        assert_eq!(second.stream, LogStream::System);
    }

    #[tokio::test]
    async fn lagging_subscriber_observes_loss() {
        let ring = LogRing::new(10_000);
        let mut rx = ring.subscribe();

        for i in 0..(LIVE_BUFFER + 50) {
            ring.push(LogStream::Stdout, format!("{i}"));
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n >= 50),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[test]
    fn shrinking_capacity_trims() {
        let ring = LogRing::new(100);
        for i in 0..100 {
            ring.push(LogStream::Stdout, format!("{i}"));
        }
        ring.set_capacity(10);
        assert_eq!(ring.len(), 10);
        assert_eq!(ring.tail(10)[0].line, "90");
    }
}
