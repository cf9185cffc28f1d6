//! In-process publish/subscribe with per-subscriber filters, bounded
//! queues, and stale-subscriber eviction.

use crate::config::BroadcasterConfig;
use crate::events::{BroadcastEvent, EventPayload};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const MAX_FAILED_WRITES: u32 = 3;

/// Optional delivery filters. Empty `types` means all kinds.
#[derive(Debug, Clone, Default)]
pub struct SubscribeFilters {
    pub types: Vec<String>,
    pub project_id: Option<i64>,
    pub agent_id: Option<i64>,
}

impl SubscribeFilters {
    fn matches(&self, payload: &EventPayload) -> bool {
        if !self.types.is_empty() && !self.types.iter().any(|t| t == payload.kind()) {
            return false;
        }
        if let Some(project_id) = self.project_id {
            if payload.project_id() != Some(project_id) {
                return false;
            }
        }
        if let Some(agent_id) = self.agent_id {
            if payload.agent_id() != Some(agent_id) {
                return false;
            }
        }
        true
    }
}

struct Slot {
    sender: SyncSender<BroadcastEvent>,
    filters: SubscribeFilters,
    failed_writes: u32,
    last_activity: Instant,
}

struct Inner {
    slots: HashMap<u64, Slot>,
    next_client_id: u64,
    event_counter: u64,
}

/// The fan-out hub. One per process, shared by reference.
pub struct Broadcaster {
    inner: Mutex<Inner>,
    max_subscribers: usize,
    queue_capacity: usize,
    idle_timeout: Duration,
    sweep_interval: Duration,
    stop_flag: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Broadcaster {
    pub fn new(config: &BroadcasterConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                next_client_id: 0,
                event_counter: 0,
            }),
            max_subscribers: config.max_subscribers,
            queue_capacity: config.queue_capacity,
            idle_timeout: Duration::from_secs(config.idle_timeout_seconds),
            sweep_interval: Duration::from_secs(config.sweep_interval_seconds),
            stop_flag: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        }
    }

    /// Register a subscriber. Returns `None` when capacity is saturated;
    /// the caller should tell its client to try again later.
    pub fn subscribe(self: &Arc<Self>, filters: SubscribeFilters) -> Option<Subscription> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.slots.len() >= self.max_subscribers {
            warn!(limit = self.max_subscribers, "subscriber limit reached");
            return None;
        }

        inner.next_client_id += 1;
        let client_id = inner.next_client_id;
        let (sender, receiver) = sync_channel(self.queue_capacity);
        inner.slots.insert(
            client_id,
            Slot {
                sender,
                filters,
                failed_writes: 0,
                last_activity: Instant::now(),
            },
        );
        debug!(client_id, "subscriber registered");

        Some(Subscription {
            client_id,
            receiver,
            broadcaster: Arc::clone(self),
        })
    }

    pub fn unsubscribe(&self, client_id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let removed = inner.slots.remove(&client_id).is_some();
        if removed {
            debug!(client_id, "subscriber unregistered");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .slots
            .len()
    }

    /// Deliver an event to every matching subscriber. Returns how many
    /// queues accepted it. A full queue counts as a failed write.
    pub fn broadcast(&self, payload: EventPayload) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.event_counter += 1;
        let event = BroadcastEvent {
            id: inner.event_counter,
            timestamp: Utc::now(),
            payload,
        };

        let mut sent = 0;
        for slot in inner.slots.values_mut() {
            if !slot.filters.matches(&event.payload) {
                continue;
            }
            match slot.sender.try_send(event.clone()) {
                Ok(()) => {
                    slot.last_activity = Instant::now();
                    sent += 1;
                }
                Err(TrySendError::Full(_)) => {
                    slot.failed_writes += 1;
                }
                Err(TrySendError::Disconnected(_)) => {
                    slot.failed_writes = MAX_FAILED_WRITES;
                }
            }
        }
        debug!(kind = event.payload.kind(), id = event.id, sent, "broadcast");
        sent
    }

    fn touch(&self, client_id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = inner.slots.get_mut(&client_id) {
            slot.last_activity = Instant::now();
        }
    }

    fn sweep(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let idle_timeout = self.idle_timeout;
        let before = inner.slots.len();
        inner.slots.retain(|client_id, slot| {
            if slot.failed_writes >= MAX_FAILED_WRITES {
                info!(client_id, "evicting subscriber after failed writes");
                return false;
            }
            if slot.last_activity.elapsed() > idle_timeout {
                info!(client_id, "evicting idle subscriber");
                return false;
            }
            true
        });
        let evicted = before - inner.slots.len();
        if evicted > 0 {
            debug!(evicted, "sweeper pass removed stale subscribers");
        }
    }

    /// Start the background stale-subscriber sweeper.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut handle = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            return;
        }
        let broadcaster = Arc::clone(self);
        *handle = Some(
            std::thread::Builder::new()
                .name("broadcast-sweeper".to_string())
                .spawn(move || {
                    while !broadcaster.stop_flag.load(Ordering::Relaxed) {
                        broadcaster.sweep();
                        let step = Duration::from_millis(200);
                        let mut waited = Duration::ZERO;
                        while waited < broadcaster.sweep_interval
                            && !broadcaster.stop_flag.load(Ordering::Relaxed)
                        {
                            std::thread::sleep(step);
                            waited += step;
                        }
                    }
                })
                .expect("spawn broadcast-sweeper"),
        );
    }

    /// Stop the sweeper and drop every subscriber.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = handle.join();
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.slots.clear();
    }
}

/// A subscriber's end of the queue. Dropping it unregisters.
pub struct Subscription {
    pub client_id: u64,
    receiver: Receiver<BroadcastEvent>,
    broadcaster: Arc<Broadcaster>,
}

impl Subscription {
    /// Wait up to `timeout` for the next event. `None` on timeout is a
    /// heartbeat, not an error; it also refreshes the idle clock.
    pub fn next(&self, timeout: Duration) -> Option<BroadcastEvent> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(_) => {
                self.broadcaster.touch(self.client_id);
                None
            }
        }
    }

    pub fn close(self) {
        // Drop handles unregistration.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BroadcasterConfig {
        BroadcasterConfig {
            max_subscribers: 3,
            queue_capacity: 4,
            idle_timeout_seconds: 60,
            sweep_interval_seconds: 60,
        }
    }

    fn state_changed(agent_id: i64, project_id: i64) -> EventPayload {
        EventPayload::StateChanged {
            agent_id,
            project_id,
            event_type: "stop".to_string(),
            new_state: "COMPLETE".to_string(),
            message: None,
        }
    }

    #[test]
    fn test_subscribe_and_receive() {
        let broadcaster = Arc::new(Broadcaster::new(&test_config()));
        let sub = broadcaster.subscribe(SubscribeFilters::default()).unwrap();

        let sent = broadcaster.broadcast(state_changed(1, 2));
        assert_eq!(sent, 1);

        let event = sub.next(Duration::from_millis(100)).unwrap();
        assert_eq!(event.id, 1);
        assert_eq!(event.payload.kind(), "state_changed");
    }

    #[test]
    fn test_event_ids_are_monotonic() {
        let broadcaster = Arc::new(Broadcaster::new(&test_config()));
        let sub = broadcaster.subscribe(SubscribeFilters::default()).unwrap();
        broadcaster.broadcast(state_changed(1, 1));
        broadcaster.broadcast(state_changed(1, 1));
        let a = sub.next(Duration::from_millis(100)).unwrap();
        let b = sub.next(Duration::from_millis(100)).unwrap();
        assert!(b.id > a.id);
    }

    #[test]
    fn test_type_filter() {
        let broadcaster = Arc::new(Broadcaster::new(&test_config()));
        let sub = broadcaster
            .subscribe(SubscribeFilters {
                types: vec!["session_ended".to_string()],
                ..Default::default()
            })
            .unwrap();

        assert_eq!(broadcaster.broadcast(state_changed(1, 1)), 0);
        assert!(sub.next(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn test_agent_filter() {
        let broadcaster = Arc::new(Broadcaster::new(&test_config()));
        let sub = broadcaster
            .subscribe(SubscribeFilters {
                agent_id: Some(7),
                ..Default::default()
            })
            .unwrap();

        broadcaster.broadcast(state_changed(1, 1));
        broadcaster.broadcast(state_changed(7, 1));
        let event = sub.next(Duration::from_millis(100)).unwrap();
        assert_eq!(event.payload.agent_id(), Some(7));
        assert!(sub.next(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn test_capacity_saturation_returns_none() {
        let broadcaster = Arc::new(Broadcaster::new(&test_config()));
        let _a = broadcaster.subscribe(SubscribeFilters::default()).unwrap();
        let _b = broadcaster.subscribe(SubscribeFilters::default()).unwrap();
        let _c = broadcaster.subscribe(SubscribeFilters::default()).unwrap();
        assert!(broadcaster.subscribe(SubscribeFilters::default()).is_none());
    }

    #[test]
    fn test_drop_unregisters() {
        let broadcaster = Arc::new(Broadcaster::new(&test_config()));
        let sub = broadcaster.subscribe(SubscribeFilters::default()).unwrap();
        assert_eq!(broadcaster.subscriber_count(), 1);
        drop(sub);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_full_queue_counts_failed_writes_and_sweeps() {
        let broadcaster = Arc::new(Broadcaster::new(&test_config()));
        let _sub = broadcaster.subscribe(SubscribeFilters::default()).unwrap();

        // Queue capacity is 4; overflow three more times to hit the
        // eviction threshold without ever consuming.
        for _ in 0..7 {
            broadcaster.broadcast(state_changed(1, 1));
        }
        broadcaster.sweep();
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_timeout_is_heartbeat() {
        let broadcaster = Arc::new(Broadcaster::new(&test_config()));
        let sub = broadcaster.subscribe(SubscribeFilters::default()).unwrap();
        assert!(sub.next(Duration::from_millis(10)).is_none());
        // Still registered after a quiet period.
        assert_eq!(broadcaster.subscriber_count(), 1);
    }
}
