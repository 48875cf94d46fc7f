//! The log itself: exclusive publish path, snapshot reads, wakeable subscribers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use karl_core::{Clock, IndexAndTimestamp, MicroDuration, MicroTimestamp};

use crate::error::{Result, StreamError};
use crate::persister::{FilePersister, MemoryPersister, PersistedEntry, Persister};

/// How long an idle subscriber worker sleeps between terminate checks when no
/// publish wakes it first.
const SUBSCRIBER_IDLE_POLL: Duration = Duration::from_millis(100);

/// What a subscriber wants the worker to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionFlow {
    /// Keep delivering entries.
    Continue,
    /// Stop the worker.
    Terminate,
}

/// A log subscriber: receives every entry in publish order, plus periodic idle
/// callbacks that double as terminate checks.
pub trait Subscriber<T>: Send + 'static {
    /// Called for each entry, in order, starting from the first.
    fn on_entry(&mut self, entry: &T, cursor: IndexAndTimestamp) -> SubscriptionFlow;

    /// Called when the worker has drained the log and found nothing new.
    fn on_idle(&mut self) -> SubscriptionFlow {
        SubscriptionFlow::Continue
    }
}

struct Shared<T> {
    persister: Mutex<Box<dyn Persister<T>>>,
    publish_cv: Condvar,
    shutting_down: AtomicBool,
}

impl<T> Shared<T> {
    /// Reads never fail; a poisoned lock still guards a consistent append-only
    /// sequence, so recover the guard.
    fn lock_for_read(&self) -> MutexGuard<'_, Box<dyn Persister<T>>> {
        match self.persister.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A typed, persisted, append-only sequence with a single writer and many
/// readers. Cheap to clone; clones share the underlying log.
pub struct Stream<T> {
    shared: Arc<Shared<T>>,
    clock: Arc<dyn Clock>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<T> std::fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("size", &self.shared.lock_for_read().size())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Stream<T> {
    /// Creates a log over an explicit persister.
    pub fn new(persister: impl Persister<T> + 'static, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                persister: Mutex::new(Box::new(persister)),
                publish_cv: Condvar::new(),
                shutting_down: AtomicBool::new(false),
            }),
            clock,
        }
    }

    /// Creates an in-memory log (tests, debug runs).
    #[must_use]
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(MemoryPersister::new(), clock)
    }

    /// Appends an entry, assigning the next index and a strictly increasing
    /// timestamp, then wakes all waiting subscribers.
    ///
    /// The assigned timestamp is `max(now, last + 1µs)`: a wall clock standing
    /// still (or stepping backwards) clamps forward rather than rejecting the
    /// entry.
    ///
    /// # Errors
    ///
    /// Fails with [`StreamError::ShuttingDown`] during teardown, or with a
    /// persistence error if the entry could not be written.
    pub fn publish(&self, entry: &T) -> Result<IndexAndTimestamp> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(StreamError::ShuttingDown);
        }
        let mut persister = self
            .shared
            .persister
            .lock()
            .map_err(|_| StreamError::persistence("publish lock poisoned"))?;
        let now = self.clock.now();
        let us = match persister.last_index_and_timestamp() {
            Some(last) => now.max(last.us + MicroDuration::from_micros(1)),
            None => now,
        };
        let idx_ts = persister.append(entry, us)?;
        self.shared.publish_cv.notify_all();
        Ok(idx_ts)
    }

    /// Returns the number of entries committed so far.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.shared.lock_for_read().size()
    }

    /// Returns the cursor of the last committed entry, if any.
    #[must_use]
    pub fn last_index_and_timestamp(&self) -> Option<IndexAndTimestamp> {
        self.shared.lock_for_read().last_index_and_timestamp()
    }

    /// Returns the entries with index in `[lo, hi)` (1-based), in insertion
    /// order. The result is a snapshot: concurrent appends do not extend it.
    #[must_use]
    pub fn iter_range(&self, lo: u64, hi: u64) -> Vec<PersistedEntry<T>> {
        self.shared.lock_for_read().range(lo, hi)
    }

    /// Returns all committed entries, in insertion order.
    #[must_use]
    pub fn iter_all(&self) -> Vec<PersistedEntry<T>> {
        let guard = self.shared.lock_for_read();
        let size = guard.size();
        guard.range(1, size + 1)
    }

    /// Returns the entries whose timestamp falls in `[from, to)`.
    #[must_use]
    pub fn iter_window(&self, from: MicroTimestamp, to: MicroTimestamp) -> Vec<PersistedEntry<T>> {
        self.iter_all()
            .into_iter()
            .filter(|e| e.idx_ts.us >= from && e.idx_ts.us < to)
            .collect()
    }

    /// Runs `subscriber` on a dedicated worker that sees every entry in order
    /// from the beginning of the log, waiting on the publish condition variable
    /// when drained. Dropping (or cancelling) the returned handle signals the
    /// worker and joins it.
    pub fn subscribe(&self, subscriber: impl Subscriber<T>) -> SubscriptionHandle {
        let shared = Arc::clone(&self.shared);
        let cancelled = Arc::new(AtomicBool::new(false));
        let worker_cancelled = Arc::clone(&cancelled);
        let worker_shared = Arc::clone(&self.shared);
        let thread = thread::spawn(move || {
            run_subscriber(&worker_shared, subscriber, &worker_cancelled);
        });
        SubscriptionHandle {
            cancelled,
            wake: Box::new(move || shared.publish_cv.notify_all()),
            thread: Some(thread),
        }
    }

    /// Begins teardown: subsequent publishes fail and subscriber workers are
    /// woken so they observe the flag on their next poll.
    pub fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.publish_cv.notify_all();
    }
}

impl<T: Serialize + DeserializeOwned + Clone + Send + 'static> Stream<T> {
    /// Opens (or creates) a durable log at `path`, replaying existing entries.
    ///
    /// # Errors
    ///
    /// Fails when the backing file cannot be opened or fails replay validation.
    pub fn open_file(path: impl AsRef<std::path::Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self::new(FilePersister::open(path)?, clock))
    }
}

fn run_subscriber<T: Clone + Send>(
    shared: &Shared<T>,
    mut subscriber: impl Subscriber<T>,
    cancelled: &AtomicBool,
) {
    let mut next_index: u64 = 1;
    loop {
        if cancelled.load(Ordering::SeqCst) || shared.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let batch = {
            let guard = shared.lock_for_read();
            let size = guard.size();
            if size >= next_index {
                guard.range(next_index, size + 1)
            } else {
                // Nothing new: wait for a publish (or a timeout, so cancellation
                // and the idle callback still run without one).
                let _guard = match shared.publish_cv.wait_timeout(guard, SUBSCRIBER_IDLE_POLL) {
                    Ok((guard, _timeout)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
                Vec::new()
            }
        };

        if batch.is_empty() {
            if subscriber.on_idle() == SubscriptionFlow::Terminate {
                return;
            }
            continue;
        }
        for persisted in &batch {
            if cancelled.load(Ordering::SeqCst) {
                return;
            }
            if subscriber.on_entry(&persisted.entry, persisted.idx_ts)
                == SubscriptionFlow::Terminate
            {
                return;
            }
            next_index = persisted.idx_ts.index + 1;
        }
    }
}

/// Owner handle for a running subscription; the worker terminates and is joined
/// when the handle is cancelled or dropped.
pub struct SubscriptionHandle {
    cancelled: Arc<AtomicBool>,
    wake: Box<dyn Fn() + Send>,
    thread: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Signals the worker to terminate and joins it. Idempotent.
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        (self.wake)();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("subscriber worker panicked");
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("cancelled", &self.cancelled.load(Ordering::SeqCst))
            .field("joined", &self.thread.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    use karl_test_utils::MockClock;

    use super::*;

    fn mock_stream(start_us: i64) -> (Stream<String>, MockClock) {
        let clock = MockClock::starting_at(start_us);
        let stream = Stream::in_memory(Arc::new(clock.clone()));
        (stream, clock)
    }

    #[test]
    fn publish_assigns_strictly_increasing_timestamps() {
        let (stream, clock) = mock_stream(1_000);

        // Three publishes on a frozen clock: timestamps must still advance.
        let a = stream.publish(&"a".to_string()).unwrap();
        let b = stream.publish(&"b".to_string()).unwrap();
        clock.advance(MicroDuration::from_seconds(1));
        let c = stream.publish(&"c".to_string()).unwrap();

        assert_eq!(a.us.as_micros(), 1_000);
        assert_eq!(b.us.as_micros(), 1_001);
        assert_eq!(c.us.as_micros(), 1_001_000);
        assert!(a.index < b.index && b.index < c.index);
    }

    #[test]
    fn publish_clamps_backwards_clock() {
        let (stream, clock) = mock_stream(5_000);
        stream.publish(&"a".to_string()).unwrap();
        clock.set(MicroTimestamp::from_micros(1_000));
        let entry = stream.publish(&"b".to_string()).unwrap();
        assert_eq!(entry.us.as_micros(), 5_001);
    }

    #[test]
    fn publish_fails_during_shutdown() {
        let (stream, _clock) = mock_stream(0);
        stream.publish(&"a".to_string()).unwrap();
        stream.shutdown();
        assert!(matches!(
            stream.publish(&"b".to_string()),
            Err(StreamError::ShuttingDown)
        ));
        // Reads still work.
        assert_eq!(stream.size(), 1);
    }

    #[test]
    fn iter_range_is_a_snapshot() {
        let (stream, _clock) = mock_stream(0);
        for name in ["a", "b", "c"] {
            stream.publish(&name.to_string()).unwrap();
        }
        let snapshot = stream.iter_range(1, 3);
        stream.publish(&"d".to_string()).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(stream.size(), 4);
    }

    #[test]
    fn iter_window_filters_by_timestamp() {
        let (stream, clock) = mock_stream(100);
        stream.publish(&"early".to_string()).unwrap();
        clock.set(MicroTimestamp::from_micros(500));
        stream.publish(&"mid".to_string()).unwrap();
        clock.set(MicroTimestamp::from_micros(900));
        stream.publish(&"late".to_string()).unwrap();

        let window = stream.iter_window(
            MicroTimestamp::from_micros(200),
            MicroTimestamp::from_micros(900),
        );
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].entry, "mid");
    }

    struct Collector {
        sender: mpsc::Sender<(String, u64)>,
        idle_calls: Arc<AtomicUsize>,
    }

    impl Subscriber<String> for Collector {
        fn on_entry(&mut self, entry: &String, cursor: IndexAndTimestamp) -> SubscriptionFlow {
            self.sender.send((entry.clone(), cursor.index)).ok();
            SubscriptionFlow::Continue
        }

        fn on_idle(&mut self) -> SubscriptionFlow {
            self.idle_calls.fetch_add(1, Ordering::SeqCst);
            SubscriptionFlow::Continue
        }
    }

    #[test]
    fn subscriber_sees_every_entry_in_order() {
        let (stream, _clock) = mock_stream(0);
        stream.publish(&"before".to_string()).unwrap();

        let (sender, receiver) = mpsc::channel();
        let idle_calls = Arc::new(AtomicUsize::new(0));
        let mut handle = stream.subscribe(Collector {
            sender,
            idle_calls: Arc::clone(&idle_calls),
        });

        stream.publish(&"after".to_string()).unwrap();

        let first = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, ("before".to_string(), 1));
        assert_eq!(second, ("after".to_string(), 2));

        handle.cancel();
        // Cancel joined the worker; further publishes reach nobody.
        stream.publish(&"ignored".to_string()).unwrap();
        assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn dropping_the_handle_joins_the_worker() {
        let (stream, _clock) = mock_stream(0);
        let (sender, _receiver) = mpsc::channel();
        let idle_calls = Arc::new(AtomicUsize::new(0));
        {
            let _handle = stream.subscribe(Collector {
                sender,
                idle_calls: Arc::clone(&idle_calls),
            });
            std::thread::sleep(Duration::from_millis(250));
        }
        // The worker had idle wakeups before the handle dropped and joined it.
        assert!(idle_calls.load(Ordering::SeqCst) > 0);
    }

    struct StopAfterFirst(mpsc::Sender<String>);

    impl Subscriber<String> for StopAfterFirst {
        fn on_entry(&mut self, entry: &String, _cursor: IndexAndTimestamp) -> SubscriptionFlow {
            self.0.send(entry.clone()).ok();
            SubscriptionFlow::Terminate
        }
    }

    #[test]
    fn subscriber_can_terminate_itself() {
        let (stream, _clock) = mock_stream(0);
        stream.publish(&"only".to_string()).unwrap();
        stream.publish(&"never seen".to_string()).unwrap();

        let (sender, receiver) = mpsc::channel();
        let mut handle = stream.subscribe(StopAfterFirst(sender));
        assert_eq!(
            receiver.recv_timeout(Duration::from_secs(5)).unwrap(),
            "only"
        );
        handle.cancel();
        assert!(receiver.try_recv().is_err());
    }
}
