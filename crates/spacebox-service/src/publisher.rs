//! Bounded, non-blocking delivery of store events.
//!
//! ```text
//! ContentStore ──emit──▶ [bounded queue] ──▶ worker ──deliver──▶ EventTransport
//!                  ▲ drops oldest at 3/4       │ retry with backoff
//!                  └──────── requeue if below 1/2 ◀─┘
//! ```

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use spacebox_cas::{EventSink, StoreEvent};
use spacebox_config::{log_notify_debug, log_notify_info, log_notify_warn, NotifyConfig};
use thiserror::Error;

pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Transport error: {0}")]
pub struct TransportError(pub String);

/// Outbound side of the publisher, e.g. a message broker client.
pub trait EventTransport: Send + Sync {
    fn deliver(&self, event: &StoreEvent) -> Result<(), TransportError>;
}

/// Writes each event as JSON to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

impl EventTransport for LogTransport {
    fn deliver(&self, event: &StoreEvent) -> Result<(), TransportError> {
        let body = serde_json::to_string(event).map_err(|e| TransportError(e.to_string()))?;
        log_notify_info!("store event", event_type = event.kind(), body = body.as_str());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherStats {
    pub published: u64,
    pub delivered: u64,
    pub retried: u64,
    pub requeued: u64,
    pub dropped: u64,
}

/// Delay before retry number `attempt` (1-based).
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

/// Event queue with a single delivery worker.
pub struct EventPublisher {
    tx: Sender<StoreEvent>,
    // Producer-side receiver, used only to evict the oldest event
    rx: Receiver<StoreEvent>,
    high_water: usize,
    counters: Arc<Counters>,
    closed: AtomicBool,
    shutdown: Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("queued", &self.tx.len())
            .field("high_water", &self.high_water)
            .finish()
    }
}

struct Worker {
    tx: Sender<StoreEvent>,
    rx: Receiver<StoreEvent>,
    shutdown: Receiver<()>,
    transport: Arc<dyn EventTransport>,
    counters: Arc<Counters>,
    requeue_below: usize,
    max_attempts: u32,
    backoff: Duration,
}

impl Worker {
    fn run(self) {
        loop {
            select! {
                recv(self.shutdown) -> _ => break,
                recv(self.rx) -> msg => match msg {
                    Ok(event) => {
                        if !self.deliver_with_retry(event) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
            }
        }

        // Drain: one attempt each, no requeue
        let mut drained = 0usize;
        while let Ok(event) = self.rx.try_recv() {
            match self.transport.deliver(&event) {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            drained += 1;
        }
        log_notify_debug!("publisher stopped", drained = drained);
    }

    /// Returns false when shutdown was requested during a backoff.
    fn deliver_with_retry(&self, event: StoreEvent) -> bool {
        let attempts = self.max_attempts.max(1);
        for attempt in 1..=attempts {
            let err = match self.transport.deliver(&event) {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(e) => e,
            };
            if attempt == attempts {
                log_notify_warn!(
                    "event delivery failed",
                    key = event.key(),
                    attempts = attempts,
                    error = tracing::field::display(&err)
                );
                break;
            }
            self.counters.retried.fetch_add(1, Ordering::Relaxed);
            match self.shutdown.recv_timeout(backoff_delay(self.backoff, attempt)) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    self.requeue(event);
                    return false;
                }
            }
        }
        self.requeue(event);
        true
    }

    fn requeue(&self, event: StoreEvent) {
        if self.tx.len() < self.requeue_below && self.tx.try_send(event).is_ok() {
            self.counters.requeued.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl EventPublisher {
    pub fn new(config: &NotifyConfig, transport: Arc<dyn EventTransport>) -> io::Result<Self> {
        let capacity = config.queue_capacity.max(2);
        let (tx, rx) = bounded(capacity);
        let (shutdown, shutdown_rx) = bounded(1);
        let counters = Arc::new(Counters::default());

        let worker = Worker {
            tx: tx.clone(),
            rx: rx.clone(),
            shutdown: shutdown_rx,
            transport,
            counters: counters.clone(),
            requeue_below: capacity / 2,
            max_attempts: config.max_attempts,
            backoff: config.retry_backoff(),
        };
        let handle = thread::Builder::new()
            .name("spacebox-publisher".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            tx,
            rx,
            high_water: (capacity * 3 / 4).max(1),
            counters,
            closed: AtomicBool::new(false),
            shutdown,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queue an event. Never blocks.
    pub fn publish(&self, event: StoreEvent) {
        if self.closed.load(Ordering::Acquire) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        if self.tx.len() >= self.high_water {
            if let Ok(oldest) = self.rx.try_recv() {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log_notify_warn!("queue above high water, dropped oldest", key = oldest.key());
            }
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) | Err(TrySendError::Disconnected(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log_notify_warn!("queue full, dropped event", key = event.key());
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    pub fn stats(&self) -> PublisherStats {
        let c = &self.counters;
        PublisherStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting events, flush the queue once and join the worker.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.shutdown.try_send(());
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl EventSink for EventPublisher {
    fn emit(&self, event: StoreEvent) {
        self.publish(event);
    }
}

impl Drop for EventPublisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    fn delete(key: &str) -> StoreEvent {
        StoreEvent::Delete {
            key: key.to_string(),
            bucket: "b".to_string(),
        }
    }

    fn config(capacity: usize, max_attempts: u32) -> NotifyConfig {
        NotifyConfig {
            queue_capacity: capacity,
            max_attempts,
            retry_backoff_ms: 1,
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    /// Blocks the first delivery until released; records every key.
    struct GatedTransport {
        entered: Sender<()>,
        release: Receiver<()>,
        delivered: Mutex<Vec<String>>,
    }

    impl EventTransport for GatedTransport {
        fn deliver(&self, event: &StoreEvent) -> Result<(), TransportError> {
            let first = self.delivered.lock().unwrap().is_empty();
            if first {
                let _ = self.entered.send(());
                let _ = self.release.recv();
            }
            self.delivered.lock().unwrap().push(event.key().to_string());
            Ok(())
        }
    }

    /// Fails the first `failures` deliveries.
    struct FlakyTransport {
        failures: u32,
        calls: AtomicU32,
    }

    impl EventTransport for FlakyTransport {
        fn deliver(&self, _event: &StoreEvent) -> Result<(), TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(TransportError("unavailable".into()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 60), MAX_BACKOFF);
    }

    #[test]
    fn test_drops_oldest_above_high_water() {
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let transport = Arc::new(GatedTransport {
            entered: entered_tx,
            release: release_rx,
            delivered: Mutex::new(Vec::new()),
        });
        let publisher = EventPublisher::new(&config(4, 1), transport.clone()).unwrap();

        publisher.publish(delete("e0"));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // High water for capacity 4 is 3
        for key in ["e1", "e2", "e3", "e4", "e5"] {
            publisher.publish(delete(key));
        }
        assert_eq!(publisher.queued(), 3);
        assert_eq!(publisher.stats().dropped, 2);

        release_tx.send(()).unwrap();
        assert!(wait_for(|| transport.delivered.lock().unwrap().len() == 4));
        assert_eq!(
            *transport.delivered.lock().unwrap(),
            vec!["e0", "e3", "e4", "e5"]
        );
        publisher.shutdown();
    }

    #[test]
    fn test_retries_until_delivered() {
        let transport = Arc::new(FlakyTransport {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let publisher = EventPublisher::new(&config(8, 5), transport.clone()).unwrap();
        publisher.publish(delete("k"));

        assert!(wait_for(|| publisher.stats().delivered == 1));
        let stats = publisher.stats();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.dropped, 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        publisher.shutdown();
    }

    #[test]
    fn test_failed_event_is_requeued_and_shutdown_terminates() {
        let transport = Arc::new(FlakyTransport {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let publisher = EventPublisher::new(&config(8, 1), transport.clone()).unwrap();
        publisher.publish(delete("k"));

        assert!(wait_for(|| publisher.stats().requeued >= 2));
        publisher.shutdown();

        let stats = publisher.stats();
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.dropped, 1);

        // Closed publishers drop new events
        publisher.publish(delete("late"));
        assert_eq!(publisher.stats().dropped, 2);
    }

    #[test]
    fn test_log_transport_accepts_events() {
        assert!(LogTransport.deliver(&delete("k")).is_ok());
    }
}
