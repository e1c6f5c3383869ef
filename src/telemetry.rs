//! Live level telemetry fan-out
//!
//! One feed per running recorder. Publishing walks a lock-free snapshot of
//! the feed's subscribers and pushes a shared sample into each bounded
//! queue; a full queue loses its oldest sample, so the producer never waits.
//! Subscriber add/remove and feed closing serialize on a per-feed lock.

use crate::error::{FleetError, FleetResult};
use crate::recorder::{ChannelLevel, RecorderId};
use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::debug;

/// One level reading of a recorder
#[derive(Debug, Clone, Serialize)]
pub struct LevelSample {
    pub recorder_id: RecorderId,
    /// Per-feed sequence number, starting at 0
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub channels: Vec<ChannelLevel>,
}

#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    Sample(Arc<LevelSample>),
    /// Terminal marker; the feed is gone
    End(String),
}

#[derive(Default)]
struct QueueState {
    samples: VecDeque<Arc<LevelSample>>,
    end: Option<String>,
    end_delivered: bool,
    detached: bool,
    dropped: u64,
}

struct SubscriberQueue {
    id: u64,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SubscriberQueue {
    fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Returns false once the subscriber has gone away
    fn push(&self, sample: Arc<LevelSample>) -> bool {
        {
            let mut state = self.state.lock();
            if state.detached {
                return false;
            }
            if state.end.is_some() {
                return true;
            }
            if state.samples.len() >= self.capacity {
                state.samples.pop_front();
                state.dropped += 1;
            }
            state.samples.push_back(sample);
        }
        self.notify.notify_one();
        true
    }

    fn close(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if state.end.is_none() {
                state.end = Some(reason.to_string());
            }
        }
        self.notify.notify_one();
    }

    fn detached(&self) -> bool {
        self.state.lock().detached
    }
}

struct Feed {
    subscribers: ArcSwap<Vec<Arc<SubscriberQueue>>>,
    /// Close reason; also the lock for subscriber edits
    closed: Mutex<Option<String>>,
    seq: AtomicU64,
    latest: ArcSwapOption<LevelSample>,
}

impl Feed {
    fn new() -> Self {
        Self {
            subscribers: ArcSwap::from_pointee(Vec::new()),
            closed: Mutex::new(None),
            seq: AtomicU64::new(0),
            latest: ArcSwapOption::empty(),
        }
    }

    fn close(&self, reason: &str) {
        let mut closed = self.closed.lock();
        if closed.is_some() {
            return;
        }
        *closed = Some(reason.to_string());
        let subscribers = self.subscribers.swap(Arc::new(Vec::new()));
        for queue in subscribers.iter() {
            queue.close(reason);
        }
    }

    fn prune(&self) {
        let _edit = self.closed.lock();
        let current = self.subscribers.load_full();
        let live: Vec<_> = current.iter().filter(|q| !q.detached()).cloned().collect();
        if live.len() != current.len() {
            self.subscribers.store(Arc::new(live));
        }
    }
}

/// Per-recorder telemetry feeds
pub struct TelemetryMux {
    feeds: DashMap<RecorderId, Arc<Feed>>,
    queue_depth: usize,
    next_subscriber: AtomicU64,
}

impl TelemetryMux {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            feeds: DashMap::new(),
            queue_depth: queue_depth.max(1),
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Open the feed of a recorder that just became running
    pub fn open(&self, recorder_id: RecorderId) {
        if let Some(previous) = self.feeds.insert(recorder_id, Arc::new(Feed::new())) {
            previous.close("feed reopened");
        }
        debug!("Telemetry feed opened for recorder {}", recorder_id);
    }

    /// Close a feed, ending every subscription with `reason`
    pub fn close(&self, recorder_id: RecorderId, reason: &str) {
        if let Some((_, feed)) = self.feeds.remove(&recorder_id) {
            feed.close(reason);
            debug!("Telemetry feed closed for recorder {}: {}", recorder_id, reason);
        }
    }

    /// Fan one reading out to every subscriber of the recorder
    pub fn publish(&self, recorder_id: RecorderId, channels: Vec<ChannelLevel>) {
        let Some(feed) = self.feeds.get(&recorder_id).map(|f| f.clone()) else {
            return;
        };

        let sample = Arc::new(LevelSample {
            recorder_id,
            seq: feed.seq.fetch_add(1, Ordering::Relaxed),
            at: Utc::now(),
            channels,
        });
        feed.latest.store(Some(sample.clone()));

        let mut gone = false;
        for queue in feed.subscribers.load().iter() {
            if !queue.push(sample.clone()) {
                gone = true;
            }
        }
        if gone {
            feed.prune();
        }
    }

    /// Most recent reading of a running recorder
    pub fn latest(&self, recorder_id: RecorderId) -> Option<Arc<LevelSample>> {
        self.feeds.get(&recorder_id).and_then(|f| f.latest.load_full())
    }

    pub fn subscribe(&self, recorder_id: RecorderId) -> FleetResult<Subscription> {
        let unavailable =
            || FleetError::TelemetryUnavailable(format!("recorder {} is not running", recorder_id));

        let feed = self
            .feeds
            .get(&recorder_id)
            .map(|f| f.clone())
            .ok_or_else(unavailable)?;

        let closed = feed.closed.lock();
        if closed.is_some() {
            return Err(unavailable());
        }

        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(id, self.queue_depth));
        let mut next = Vec::clone(&feed.subscribers.load());
        next.push(queue.clone());
        feed.subscribers.store(Arc::new(next));
        drop(closed);

        debug!("Subscriber {} attached to recorder {}", id, recorder_id);
        Ok(Subscription {
            recorder_id,
            queue,
            feed: Arc::downgrade(&feed),
        })
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, recorder_id: RecorderId) -> usize {
        self.feeds
            .get(&recorder_id)
            .map(|f| f.subscribers.load().len())
            .unwrap_or(0)
    }
}

/// Delivery handle of one observer
pub struct Subscription {
    recorder_id: RecorderId,
    queue: Arc<SubscriberQueue>,
    feed: Weak<Feed>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.queue.id
    }

    pub fn recorder_id(&self) -> RecorderId {
        self.recorder_id
    }

    /// Samples lost to the drop-oldest policy so far
    pub fn dropped(&self) -> u64 {
        self.queue.state.lock().dropped
    }

    /// Next event in order. Buffered samples come before the end marker;
    /// after the end marker this returns `None`.
    pub async fn next(&mut self) -> Option<TelemetryEvent> {
        loop {
            {
                let mut state = self.queue.state.lock();
                if let Some(sample) = state.samples.pop_front() {
                    return Some(TelemetryEvent::Sample(sample));
                }
                if state.end_delivered {
                    return None;
                }
                if let Some(reason) = state.end.clone() {
                    state.end_delivered = true;
                    return Some(TelemetryEvent::End(reason));
                }
            }
            self.queue.notify.notified().await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.state.lock().detached = true;
        if let Some(feed) = self.feed.upgrade() {
            feed.prune();
        }
        debug!("Subscriber {} detached from recorder {}", self.queue.id, self.recorder_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORDER: RecorderId = RecorderId(7);

    fn reading(db: f32) -> Vec<ChannelLevel> {
        vec![ChannelLevel::new("L", db, db + 6.0, false)]
    }

    fn drain(subscription: &mut Subscription) -> Vec<u64> {
        let mut seqs = Vec::new();
        let mut state = subscription.queue.state.lock();
        while let Some(sample) = state.samples.pop_front() {
            seqs.push(sample.seq);
        }
        seqs
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order() {
        let mux = TelemetryMux::new(32);
        mux.open(RECORDER);

        let mut subscribers: Vec<Subscription> =
            (0..3).map(|_| mux.subscribe(RECORDER).unwrap()).collect();
        assert_eq!(mux.subscriber_count(RECORDER), 3);

        for i in 0..10 {
            mux.publish(RECORDER, reading(-40.0 + i as f32));
        }

        for subscription in subscribers.iter_mut() {
            let mut seqs = Vec::new();
            for _ in 0..10 {
                match subscription.next().await {
                    Some(TelemetryEvent::Sample(sample)) => seqs.push(sample.seq),
                    other => panic!("unexpected {:?}", other),
                }
            }
            assert_eq!(seqs, (0..10).collect::<Vec<_>>());
            assert_eq!(subscription.dropped(), 0);
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_loses_oldest_only() {
        let mux = TelemetryMux::new(4);
        mux.open(RECORDER);

        let mut fast = mux.subscribe(RECORDER).unwrap();
        let mut slow = mux.subscribe(RECORDER).unwrap();

        let mut fast_seqs = Vec::new();
        for i in 0..10 {
            mux.publish(RECORDER, reading(-30.0 - i as f32));
            fast_seqs.extend(drain(&mut fast));
        }

        assert_eq!(fast_seqs, (0..10).collect::<Vec<_>>());
        assert_eq!(drain(&mut slow), vec![6, 7, 8, 9]);
        assert_eq!(slow.dropped(), 6);
        assert_eq!(fast.dropped(), 0);
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let mux = TelemetryMux::new(8);
        mux.open(RECORDER);
        let mut subscription = mux.subscribe(RECORDER).unwrap();

        mux.publish(RECORDER, reading(-20.0));
        mux.close(RECORDER, "recorder stopping");
        // Samples after close go nowhere
        mux.publish(RECORDER, reading(-20.0));

        assert!(matches!(subscription.next().await, Some(TelemetryEvent::Sample(_))));
        match subscription.next().await {
            Some(TelemetryEvent::End(reason)) => assert_eq!(reason, "recorder stopping"),
            other => panic!("expected end, got {:?}", other),
        }
        assert!(subscription.next().await.is_none());

        assert!(matches!(
            mux.subscribe(RECORDER),
            Err(FleetError::TelemetryUnavailable(_))
        ));
        assert!(matches!(
            mux.subscribe(RecorderId(99)),
            Err(FleetError::TelemetryUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_waiting_subscriber_is_woken() {
        let mux = Arc::new(TelemetryMux::new(8));
        mux.open(RECORDER);
        let mut subscription = mux.subscribe(RECORDER).unwrap();

        let reader = tokio::spawn(async move {
            let mut events = Vec::new();
            while let Some(event) = subscription.next().await {
                events.push(event);
            }
            events
        });

        tokio::task::yield_now().await;
        mux.publish(RECORDER, reading(-12.0));
        mux.publish(RECORDER, reading(-13.0));
        mux.close(RECORDER, "done");

        let events = reader.await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events.last(), Some(TelemetryEvent::End(_))));
    }

    #[tokio::test]
    async fn test_disconnect_removes_only_that_subscriber() {
        let mux = TelemetryMux::new(8);
        mux.open(RECORDER);

        let gone = mux.subscribe(RECORDER).unwrap();
        let mut stays = mux.subscribe(RECORDER).unwrap();
        assert_ne!(gone.id(), stays.id());

        drop(gone);
        assert_eq!(mux.subscriber_count(RECORDER), 1);

        mux.publish(RECORDER, reading(-10.0));
        assert!(matches!(stays.next().await, Some(TelemetryEvent::Sample(_))));

        // Publishing to a recorder without a feed is a no-op
        mux.publish(RecorderId(42), reading(-10.0));
    }

    #[tokio::test]
    async fn test_reopen_resets_sequence() {
        let mux = TelemetryMux::new(8);
        mux.open(RECORDER);
        let mut old = mux.subscribe(RECORDER).unwrap();
        mux.publish(RECORDER, reading(-10.0));

        mux.open(RECORDER);
        let mut fresh = mux.subscribe(RECORDER).unwrap();
        mux.publish(RECORDER, reading(-10.0));

        assert_eq!(drain(&mut old), vec![0]);
        assert!(matches!(old.next().await, Some(TelemetryEvent::End(_))));
        assert_eq!(drain(&mut fresh), vec![0]);
    }

    #[tokio::test]
    async fn test_latest_reading() {
        let mux = TelemetryMux::new(8);
        assert!(mux.latest(RECORDER).is_none());

        mux.open(RECORDER);
        assert!(mux.latest(RECORDER).is_none());

        mux.publish(RECORDER, reading(-20.0));
        mux.publish(RECORDER, reading(-12.0));
        let latest = mux.latest(RECORDER).unwrap();
        assert_eq!(latest.seq, 1);
        assert_eq!(latest.channels, reading(-12.0));

        mux.close(RECORDER, "stopped");
        assert!(mux.latest(RECORDER).is_none());
    }
}
