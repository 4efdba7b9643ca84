//! Bounded stack of idle connections tagged by key

use crate::errors::{BoxError, PoolError, PoolResult};
use crate::health::HealthStatus;
use crate::metrics::{MetricsTracker, PoolMetrics};

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

type Factory<K, T> = Box<dyn Fn(&K) -> Result<T, BoxError> + Send + Sync>;
type Disposer<T> = Box<dyn FnMut(T) -> Result<(), BoxError> + Send>;

/// How often `pop_async` retries while the pool is exhausted
const ASYNC_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct Slot<K, T> {
    conn: T,
    key: K,
}

struct State<K, T> {
    /// Front is the least recently returned slot.
    idle: VecDeque<Slot<K, T>>,
    created: usize,
    checked_out: usize,
    shutdown: bool,
    disposer: Option<Disposer<T>>,
}

/// A fixed-capacity stack of idle connections shared by every key.
///
/// Connections are created lazily by the factory, up to `size` in total. Once
/// that many exist, a checkout for a key with no idle match replaces the least
/// recently returned idle connection. The replaced connection is dropped
/// without calling the shutdown disposer.
///
/// # Examples
///
/// ```
/// use keyed_pool::KeyedResourceStack;
/// use std::time::Duration;
///
/// let stack = KeyedResourceStack::new(2, |host: &String| format!("conn to {}", host));
///
/// let conn = stack.pop(&"a.example".to_string(), Duration::from_secs(1)).unwrap();
/// assert_eq!(conn, "conn to a.example");
/// stack.push(conn, "a.example".to_string()).unwrap();
///
/// assert_eq!(stack.len(), 1);
/// ```
pub struct KeyedResourceStack<K, T> {
    state: Mutex<State<K, T>>,
    available: Condvar,
    factory: Factory<K, T>,
    max: usize,
    metrics: MetricsTracker,
}

impl<K, T> KeyedResourceStack<K, T>
where
    K: PartialEq + fmt::Debug,
{
    /// Create a stack of at most `size` connections built by `factory`
    pub fn new<F>(size: usize, factory: F) -> Self
    where
        F: Fn(&K) -> T + Send + Sync + 'static,
    {
        Self::with_fallible_factory(size, move |key: &K| Ok::<T, BoxError>(factory(key)))
    }

    /// Create a stack whose factory may fail.
    ///
    /// A factory error surfaces from [`pop`](Self::pop) as
    /// [`PoolError::Factory`] and leaves the stack unchanged.
    pub fn with_fallible_factory<F, E>(size: usize, factory: F) -> Self
    where
        F: Fn(&K) -> Result<T, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self {
            state: Mutex::new(State {
                idle: VecDeque::with_capacity(size),
                created: 0,
                checked_out: 0,
                shutdown: false,
                disposer: None,
            }),
            available: Condvar::new(),
            factory: Box::new(move |key: &K| factory(key).map_err(Into::into)),
            max: size,
            metrics: MetricsTracker::new(),
        }
    }

    /// Take a connection for `key`, waiting up to `timeout` when every slot
    /// is checked out. A zero timeout never waits.
    pub fn pop(&self, key: &K, timeout: Duration) -> PoolResult<T> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();

        loop {
            match self.try_fetch(&mut state, key) {
                Ok(Some(conn)) => return Ok(conn),
                Ok(None) => {}
                Err(err) => {
                    // A slot may still be idle; pass the wakeup on.
                    self.available.notify_one();
                    return Err(err);
                }
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(self.timed_out(key, timeout));
                    }
                    self.available.wait_until(&mut state, deadline);
                }
                None => self.available.wait(&mut state),
            }
        }
    }

    /// Like [`pop`](Self::pop), but waits without blocking the runtime thread.
    pub async fn pop_async(&self, key: &K, timeout: Duration) -> PoolResult<T> {
        let polled = tokio::time::timeout(timeout, async {
            loop {
                let fetched = {
                    let mut state = self.state.lock();
                    self.try_fetch(&mut state, key)
                };
                match fetched {
                    Ok(Some(conn)) => return Ok(conn),
                    Ok(None) => tokio::time::sleep(ASYNC_POLL_INTERVAL).await,
                    Err(err) => return Err(err),
                }
            }
        })
        .await;

        match polled {
            Ok(result) => result,
            Err(_) => Err(self.timed_out(key, timeout)),
        }
    }

    /// Return `conn` to the stack as the most recently used slot for `key`.
    ///
    /// After shutdown the connection is handed to the disposer instead, and
    /// a disposer error is returned as [`PoolError::Dispose`].
    pub fn push(&self, conn: T, key: K) -> PoolResult<()> {
        let mut state = self.state.lock();
        state.checked_out = state.checked_out.saturating_sub(1);
        MetricsTracker::record(&self.metrics.total_checkins);

        if let Some(disposer) = state.disposer.as_mut() {
            MetricsTracker::record(&self.metrics.disposed);
            debug!(?key, "disposing connection returned after shutdown");
            return disposer(conn).map_err(PoolError::dispose);
        }

        trace!(?key, "connection returned");
        state.idle.push_back(Slot { conn, key });
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Number of idle connections
    pub fn len(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Whether there is no idle connection
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of connections shared across keys
    pub fn capacity(&self) -> usize {
        self.max
    }

    /// Number of connections materialized so far
    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Dispose every idle connection and refuse further checkouts.
    ///
    /// Connections still checked out are disposed when they are pushed back.
    /// Threads blocked in [`pop`](Self::pop) wake up with
    /// [`PoolError::PoolShuttingDown`].
    pub fn shutdown<D>(&self, mut disposer: D)
    where
        D: FnMut(T) + Send + 'static,
    {
        // An infallible disposer cannot fail the shutdown.
        let _ = self.install_disposer(Box::new(move |conn: T| -> Result<(), BoxError> {
            disposer(conn);
            Ok(())
        }));
    }

    /// Like [`shutdown`](Self::shutdown), with a disposer that may fail.
    ///
    /// Every idle connection is handed to the disposer exactly once even when
    /// some of them fail; the first failure is returned as
    /// [`PoolError::Dispose`]. The pool is shut down either way.
    pub fn try_shutdown<D, E>(&self, mut disposer: D) -> PoolResult<()>
    where
        D: FnMut(T) -> Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.install_disposer(Box::new(move |conn: T| -> Result<(), BoxError> {
            disposer(conn).map_err(Into::into)
        }))
    }

    fn install_disposer(&self, disposer: Disposer<T>) -> PoolResult<()> {
        let mut state = self.state.lock();
        state.shutdown = true;
        // Waiters re-check the flag once the lock is released, even if a disposer panics.
        self.available.notify_all();

        let State { idle, disposer: installed, .. } = &mut *state;
        let disposer = installed.insert(disposer);
        let mut disposed = 0;
        let mut first_error = None;
        // Slots leave the queue one at a time so a panicking disposer leaves the rest idle.
        while let Some(slot) = idle.pop_front() {
            disposed += 1;
            MetricsTracker::record(&self.metrics.disposed);
            if let Err(err) = disposer(slot.conn) {
                debug!(key = ?slot.key, error = %err, "disposer failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        drop(state);

        debug!(disposed, "pool shut down");
        match first_error {
            Some(err) => Err(PoolError::dispose(err)),
            None => Ok(()),
        }
    }

    /// Get a metrics snapshot
    pub fn metrics(&self) -> PoolMetrics {
        let state = self.state.lock();
        self.metrics.get_metrics(
            state.idle.len(),
            state.checked_out,
            state.created,
            self.max,
            state.shutdown,
        )
    }

    /// Get health status
    pub fn health_status(&self) -> HealthStatus {
        HealthStatus::from_metrics(&self.metrics())
    }

    /// One non-blocking attempt: reuse a match, create, or recycle.
    fn try_fetch(&self, state: &mut State<K, T>, key: &K) -> PoolResult<Option<T>> {
        if state.shutdown {
            return Err(PoolError::PoolShuttingDown);
        }

        let conn = if let Some(index) = state.idle.iter().rposition(|slot| slot.key == *key) {
            trace!(?key, "reusing idle connection");
            state.idle.remove(index).map(|slot| slot.conn)
        } else if state.created < self.max {
            let conn = (self.factory)(key).map_err(PoolError::factory)?;
            state.created += 1;
            debug!(?key, created = state.created, "created connection");
            Some(conn)
        } else if !state.idle.is_empty() {
            // Build the replacement first so a failing factory evicts nothing.
            let conn = (self.factory)(key).map_err(PoolError::factory)?;
            if let Some(evicted) = state.idle.pop_front() {
                debug!(evicted = ?evicted.key, requested = ?key, "recycled least recently used connection");
            }
            MetricsTracker::record(&self.metrics.recycled);
            Some(conn)
        } else {
            None
        };

        if conn.is_some() {
            state.checked_out += 1;
            MetricsTracker::record(&self.metrics.total_checkouts);
        }
        Ok(conn)
    }

    fn timed_out(&self, key: &K, timeout: Duration) -> PoolError {
        MetricsTracker::record(&self.metrics.timeouts);
        debug!(?key, ?timeout, "timed out waiting for a connection");
        PoolError::Timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::thread;

    #[derive(Debug, PartialEq)]
    struct Connection {
        id: usize,
        host: String,
    }

    fn connection_stack(size: usize) -> KeyedResourceStack<String, Connection> {
        let next_id = AtomicUsize::new(0);
        KeyedResourceStack::new(size, move |host: &String| Connection {
            id: next_id.fetch_add(1, Ordering::Relaxed),
            host: host.clone(),
        })
    }

    fn key(host: &str) -> String {
        host.to_string()
    }

    #[test]
    fn test_len_tracks_idle_slots() {
        let stack = connection_stack(1);
        assert!(stack.is_empty());

        let conn = stack.pop(&key("a"), Duration::ZERO).unwrap();
        assert_eq!(stack.len(), 0);

        stack.push(conn, key("a")).unwrap();
        assert_eq!(stack.len(), 1);
        assert!(!stack.is_empty());
    }

    #[test]
    fn test_pop_reuses_matching_key() {
        let stack = connection_stack(3);

        let conn = stack.pop(&key("a"), Duration::ZERO).unwrap();
        let id = conn.id;
        stack.push(conn, key("a")).unwrap();

        let again = stack.pop(&key("a"), Duration::ZERO).unwrap();
        assert_eq!(again.id, id);
        assert_eq!(stack.created(), 1);
    }

    #[test]
    fn test_pop_prefers_match_over_creation() {
        let stack = connection_stack(3);

        let a = stack.pop(&key("a"), Duration::ZERO).unwrap();
        let b = stack.pop(&key("b"), Duration::ZERO).unwrap();
        let b_id = b.id;
        stack.push(a, key("a")).unwrap();
        stack.push(b, key("b")).unwrap();

        let conn = stack.pop(&key("b"), Duration::ZERO).unwrap();
        assert_eq!(conn.id, b_id);
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn test_pop_timeout_zero_fails_immediately() {
        let stack = connection_stack(1);
        let _held = stack.pop(&key("a"), Duration::ZERO).unwrap();

        let started = Instant::now();
        let err = stack.pop(&key("a"), Duration::ZERO).unwrap_err();

        assert!(matches!(err, PoolError::Timeout(waited) if waited.is_zero()));
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(stack.metrics().timeouts, 1);
    }

    #[test]
    fn test_pop_times_out_after_waiting() {
        let stack = connection_stack(1);
        let _held = stack.pop(&key("a"), Duration::ZERO).unwrap();

        let started = Instant::now();
        let err = stack.pop(&key("b"), Duration::from_millis(50)).unwrap_err();

        assert!(matches!(err, PoolError::Timeout(waited) if waited == Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_pop_waits_for_push() {
        let stack = Arc::new(connection_stack(1));
        let conn = stack.pop(&key("a"), Duration::ZERO).unwrap();
        let id = conn.id;

        let (started_tx, started_rx) = crossbeam::channel::bounded(1);
        let waiter = {
            let stack = Arc::clone(&stack);
            thread::spawn(move || {
                started_tx.send(()).unwrap();
                stack.pop(&key("a"), Duration::from_secs(5))
            })
        };

        started_rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        stack.push(conn, key("a")).unwrap();

        assert_eq!(waiter.join().unwrap().unwrap().id, id);
    }

    #[test]
    fn test_waiter_for_other_key_recycles_returned_slot() {
        let stack = Arc::new(connection_stack(1));
        let conn = stack.pop(&key("a"), Duration::ZERO).unwrap();

        let waiter = {
            let stack = Arc::clone(&stack);
            thread::spawn(move || stack.pop(&key("b"), Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        stack.push(conn, key("a")).unwrap();

        let recycled = waiter.join().unwrap().unwrap();
        assert_eq!(recycled.host, "b");
        assert_eq!(stack.created(), 1);
        assert_eq!(stack.metrics().recycled, 1);
    }

    #[test]
    fn test_pop_recycles_least_recently_returned() {
        let stack = connection_stack(2);

        let a = stack.pop(&key("a.example"), Duration::ZERO).unwrap();
        let a_id = a.id;
        stack.push(a, key("a.example")).unwrap();

        let b = stack.pop(&key("b.example"), Duration::ZERO).unwrap();
        stack.push(b, key("b.example")).unwrap();

        let c = stack.pop(&key("c.example"), Duration::ZERO).unwrap();
        assert_eq!(c.host, "c.example");
        stack.push(c, key("c.example")).unwrap();

        let recreated = stack.pop(&key("a.example"), Duration::ZERO).unwrap();
        assert_ne!(recreated.id, a_id);
        assert_eq!(recreated.host, "a.example");
        assert_eq!(stack.created(), 2);
    }

    #[test]
    fn test_recycling_does_not_call_disposer() {
        let stack = connection_stack(1);
        let a = stack.pop(&key("a"), Duration::ZERO).unwrap();
        stack.push(a, key("a")).unwrap();
        let b = stack.pop(&key("b"), Duration::ZERO).unwrap();
        stack.push(b, key("b")).unwrap();

        let disposed = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&disposed);
        stack.shutdown(move |conn: Connection| sink.lock().unwrap().push(conn.host));

        // "a" was recycled silently, only the idle "b" reaches the disposer.
        assert_eq!(*disposed.lock().unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn test_pop_after_shutdown() {
        let stack = connection_stack(2);
        stack.shutdown(|_| {});

        assert!(matches!(
            stack.pop(&key("a"), Duration::ZERO),
            Err(PoolError::PoolShuttingDown)
        ));
        assert!(stack.is_shutdown());
    }

    #[test]
    fn test_shutdown_wakes_waiter() {
        let stack = Arc::new(connection_stack(1));
        let _held = stack.pop(&key("a"), Duration::ZERO).unwrap();

        let waiter = {
            let stack = Arc::clone(&stack);
            thread::spawn(move || stack.pop(&key("a"), Duration::from_secs(30)))
        };

        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        stack.shutdown(|_| {});

        assert!(matches!(waiter.join().unwrap(), Err(PoolError::PoolShuttingDown)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_shutdown_disposes_idle_and_late_returns() {
        let stack = connection_stack(3);
        let a = stack.pop(&key("a"), Duration::ZERO).unwrap();
        let b = stack.pop(&key("b"), Duration::ZERO).unwrap();
        stack.push(a, key("a")).unwrap();

        let disposed = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&disposed);
        stack.shutdown(move |conn: Connection| sink.lock().unwrap().push(conn.host));

        assert_eq!(*disposed.lock().unwrap(), vec!["a".to_string()]);
        assert!(stack.is_empty());

        stack.push(b, key("b")).unwrap();
        assert_eq!(*disposed.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert!(stack.is_empty());
        assert_eq!(stack.metrics().disposed, 2);
    }

    #[test]
    fn test_try_shutdown_disposes_every_slot_and_reports_first_error() {
        let stack = connection_stack(3);
        let conns: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|host| stack.pop(&key(host), Duration::ZERO).unwrap())
            .collect();
        for conn in conns {
            let host = conn.host.clone();
            stack.push(conn, host).unwrap();
        }

        let disposed = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&disposed);
        let err = stack
            .try_shutdown(move |conn: Connection| {
                let mut disposed = sink.lock().unwrap();
                disposed.push(conn.host.clone());
                if disposed.len() == 1 {
                    Err(format!("{} already closed", conn.host))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();

        assert!(matches!(err, PoolError::Dispose(_)));
        assert_eq!(err.to_string(), "Connection disposer failed: a already closed");
        assert_eq!(*disposed.lock().unwrap(), vec!["a", "b", "c"]);
        assert!(stack.is_empty());
        assert!(stack.is_shutdown());
        assert_eq!(stack.metrics().disposed, 3);
    }

    #[test]
    fn test_push_after_try_shutdown_returns_disposer_error() {
        let stack = connection_stack(1);
        let conn = stack.pop(&key("a"), Duration::ZERO).unwrap();
        stack.try_shutdown(|_: Connection| Err("refused")).unwrap();

        let err = stack.push(conn, key("a")).unwrap_err();
        assert!(matches!(err, PoolError::Dispose(_)));
        assert_eq!(stack.metrics().checked_out, 0);
    }

    #[test]
    fn test_panicking_disposer_keeps_remaining_slots() {
        let stack = connection_stack(2);
        let a = stack.pop(&key("a"), Duration::ZERO).unwrap();
        let b = stack.pop(&key("b"), Duration::ZERO).unwrap();
        stack.push(a, key("a")).unwrap();
        stack.push(b, key("b")).unwrap();

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            stack.shutdown(|conn: Connection| panic!("cannot close {}", conn.host));
        }));
        assert!(panicked.is_err());
        assert!(stack.is_shutdown());
        assert_eq!(stack.len(), 1);

        // A second shutdown reaches the slot the panic left behind.
        let disposed = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&disposed);
        stack.shutdown(move |conn: Connection| sink.lock().unwrap().push(conn.host));
        assert_eq!(*disposed.lock().unwrap(), vec!["b".to_string()]);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_push_foreign_connection_after_shutdown() {
        let stack = connection_stack(1);
        let disposed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disposed);
        stack.shutdown(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        stack.push(Connection { id: 99, host: "x".to_string() }, key("x")).unwrap();

        assert_eq!(disposed.load(Ordering::Relaxed), 1);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_factory_error_leaves_state_intact() {
        let stack: KeyedResourceStack<&str, String> =
            KeyedResourceStack::with_fallible_factory(1, |host: &&str| {
                if *host == "down.example" {
                    Err("connection refused")
                } else {
                    Ok(host.to_string())
                }
            });

        let err = stack.pop(&"down.example", Duration::ZERO).unwrap_err();
        assert!(matches!(err, PoolError::Factory(_)));
        assert_eq!(stack.created(), 0);
        assert_eq!(stack.metrics().checked_out, 0);

        let conn = stack.pop(&"up.example", Duration::ZERO).unwrap();
        assert_eq!(conn, "up.example");
        stack.push(conn, "up.example").unwrap();

        // Recycling path: the idle slot must survive a failed replacement.
        assert!(stack.pop(&"down.example", Duration::ZERO).is_err());
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.created(), 1);
    }

    #[test]
    fn test_capacity_bound_under_contention() {
        let size = 4;
        let stack = Arc::new(connection_stack(size));
        let handles: Vec<_> = (0..16)
            .map(|n| {
                let stack = Arc::clone(&stack);
                thread::spawn(move || {
                    for round in 0..50 {
                        let host = format!("host-{}", (n + round) % 6);
                        let conn = stack.pop(&host, Duration::from_secs(10)).unwrap();
                        assert_eq!(conn.host, host);
                        let metrics = stack.metrics();
                        assert!(metrics.idle + metrics.checked_out <= size);
                        stack.push(conn, host).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = stack.metrics();
        assert_eq!(metrics.checked_out, 0);
        assert!(metrics.created <= size);
        assert_eq!(metrics.idle, metrics.created);
    }

    #[test]
    fn test_no_connection_held_twice() {
        let stack = Arc::new(connection_stack(3));
        let held = Arc::new(StdMutex::new(HashSet::new()));

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let stack = Arc::clone(&stack);
                let held = Arc::clone(&held);
                thread::spawn(move || {
                    for round in 0..100 {
                        let host = format!("host-{}", (n * round) % 4);
                        let conn = stack.pop(&host, Duration::from_secs(10)).unwrap();
                        assert!(held.lock().unwrap().insert(conn.id));
                        thread::yield_now();
                        held.lock().unwrap().remove(&conn.id);
                        stack.push(conn, host).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[tokio::test]
    async fn test_pop_async() {
        let stack = connection_stack(1);

        let conn = stack.pop_async(&key("a"), Duration::ZERO).await.unwrap();
        let err = stack.pop_async(&key("b"), Duration::from_millis(30)).await.unwrap_err();
        assert!(err.is_timeout());

        stack.push(conn, key("a")).unwrap();
        let conn = stack.pop_async(&key("b"), Duration::from_millis(30)).await.unwrap();
        assert_eq!(conn.host, "b");
    }

    #[tokio::test]
    async fn test_pop_async_after_shutdown() {
        let stack = connection_stack(1);
        stack.shutdown(|_| {});

        assert!(matches!(
            stack.pop_async(&key("a"), Duration::from_secs(1)).await,
            Err(PoolError::PoolShuttingDown)
        ));
    }
}
