//! Reentrant, thread-scoped checkout on top of the keyed stack

use crate::config::PoolConfiguration;
use crate::errors::{BoxError, PoolError, PoolResult};
use crate::health::HealthStatus;
use crate::metrics::PoolMetrics;
use crate::stack::KeyedResourceStack;

use dashmap::DashMap;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, trace};

/// One outstanding checkout on a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    /// Opened by `checkout`, closed by `checkin`
    Manual,
    /// Owned by a guard and closed when the guard goes away
    Guard(u64),
}

/// The connection a thread holds and the checkouts stacked on it
struct Lease<K, T> {
    /// `None` while lent out through `get_mut`.
    conn: Option<Arc<T>>,
    key: K,
    /// Innermost last.
    frames: Vec<Frame>,
    next_guard: u64,
}

impl<K, T> Lease<K, T> {
    fn open(&mut self, guarded: bool) -> Frame {
        let frame = if guarded {
            self.next_guard += 1;
            Frame::Guard(self.next_guard)
        } else {
            Frame::Manual
        };
        self.frames.push(frame);
        frame
    }
}

/// Shared access to a connection checked out through [`ReentrantPool::get`].
///
/// Checks the connection back in when dropped, or explicitly through
/// [`checkin`](Self::checkin). The guard stays on the thread that created it
/// because checkouts are tracked per thread, and nothing borrowed from it
/// outlives the checkin:
///
/// ```compile_fail
/// use keyed_pool::{PoolConfiguration, ReentrantPool};
///
/// let pool = ReentrantPool::new(PoolConfiguration::new(), |host: &String| host.clone());
/// let conn = pool.get(&"a.example".to_string()).unwrap();
/// let host: &String = &conn;
/// conn.checkin().unwrap();
/// println!("{}", host);
/// ```
pub struct PooledConnection<'a, K, T>
where
    K: PartialEq + Clone + fmt::Debug,
{
    conn: Option<Arc<T>>,
    frame: Frame,
    pool: &'a ReentrantPool<K, T>,
    _not_send: PhantomData<*const ()>,
}

impl<K, T> PooledConnection<'_, K, T>
where
    K: PartialEq + Clone + fmt::Debug,
{
    /// Check in now and report a disposer failure after shutdown
    pub fn checkin(mut self) -> PoolResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> PoolResult<()> {
        // Drop the handle before the frame so the last checkin owns the connection.
        match self.conn.take() {
            Some(conn) => {
                drop(conn);
                self.pool.leave(self.frame)
            }
            None => Ok(()),
        }
    }
}

impl<K, T> Deref for PooledConnection<'_, K, T>
where
    K: PartialEq + Clone + fmt::Debug,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.conn.as_deref().expect("Connection already checked in")
    }
}

impl<K, T> Drop for PooledConnection<'_, K, T>
where
    K: PartialEq + Clone + fmt::Debug,
{
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            debug!(error = %err, "checkin on drop failed");
        }
    }
}

/// Exclusive access to a connection checked out through
/// [`ReentrantPool::get_mut`].
///
/// While it is alive, other checkouts on the same thread cannot reach the
/// connection and fail with [`PoolError::ConnectionInUse`].
pub struct PooledConnectionMut<'a, K, T>
where
    K: PartialEq + Clone + fmt::Debug,
{
    conn: Option<T>,
    frame: Frame,
    pool: &'a ReentrantPool<K, T>,
    _not_send: PhantomData<*const ()>,
}

impl<K, T> PooledConnectionMut<'_, K, T>
where
    K: PartialEq + Clone + fmt::Debug,
{
    /// Check in now and report a disposer failure after shutdown
    pub fn checkin(mut self) -> PoolResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> PoolResult<()> {
        match self.conn.take() {
            Some(conn) => {
                self.pool.restore(Arc::new(conn));
                self.pool.leave(self.frame)
            }
            None => Ok(()),
        }
    }
}

impl<K, T> Deref for PooledConnectionMut<'_, K, T>
where
    K: PartialEq + Clone + fmt::Debug,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("Connection already checked in")
    }
}

impl<K, T> DerefMut for PooledConnectionMut<'_, K, T>
where
    K: PartialEq + Clone + fmt::Debug,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("Connection already checked in")
    }
}

impl<K, T> Drop for PooledConnectionMut<'_, K, T>
where
    K: PartialEq + Clone + fmt::Debug,
{
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            debug!(error = %err, "checkin on drop failed");
        }
    }
}

/// Thread-safe keyed connection pool with reentrant checkout.
///
/// A thread that checks out again before checking in gets the connection it
/// already holds, whatever key it asks for. Only the outermost checkout and
/// checkin reach the shared [`KeyedResourceStack`].
///
/// Connections are only reachable through scoped access: [`with`](Self::with)
/// and [`get`](Self::get) share the thread's connection between nested
/// checkouts, [`with_mut`](Self::with_mut) and [`get_mut`](Self::get_mut) lend
/// it out exclusively.
///
/// # Examples
///
/// ```
/// use keyed_pool::{PoolConfiguration, ReentrantPool};
///
/// let pool = ReentrantPool::new(PoolConfiguration::new().with_size(10), |(host, port): &(String, u16)| {
///     format!("{}:{}", host, port)
/// });
///
/// let addr = pool.with(&("www.example".to_string(), 80), |conn| conn.clone()).unwrap();
/// assert_eq!(addr, "www.example:80");
///
/// pool.with_mut(&("www.example".to_string(), 80), |conn| conn.push_str("/index")).unwrap();
///
/// pool.shutdown(|conn| println!("closing {}", conn));
/// ```
pub struct ReentrantPool<K, T> {
    available: KeyedResourceStack<K, T>,
    leases: DashMap<ThreadId, Lease<K, T>>,
    timeout: Duration,
    size: usize,
}

impl<K, T> ReentrantPool<K, T>
where
    K: PartialEq + Clone + fmt::Debug,
{
    /// Create a pool that builds connections with `factory`
    pub fn new<F>(config: PoolConfiguration, factory: F) -> Self
    where
        F: Fn(&K) -> T + Send + Sync + 'static,
    {
        Self::from_stack(config, KeyedResourceStack::new(config.size, factory))
    }

    /// Create a pool whose factory may fail
    pub fn with_fallible_factory<F, E>(config: PoolConfiguration, factory: F) -> Self
    where
        F: Fn(&K) -> Result<T, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self::from_stack(
            config,
            KeyedResourceStack::with_fallible_factory(config.size, factory),
        )
    }

    fn from_stack(config: PoolConfiguration, available: KeyedResourceStack<K, T>) -> Self {
        Self {
            available,
            leases: DashMap::new(),
            timeout: config.timeout,
            size: config.size,
        }
    }

    /// Check out a connection for `key` using the pool's default timeout
    pub fn checkout(&self, key: &K) -> PoolResult<()> {
        self.checkout_with_timeout(key, None)
    }

    /// Hold a connection for `key` on the calling thread until the matching
    /// [`checkin`](Self::checkin).
    ///
    /// `timeout` overrides the pool default for this call only. If the calling
    /// thread already holds a connection, the checkout nests on it without
    /// touching the shared stack and `key` is ignored. The held connection is
    /// reached through [`with`](Self::with) or [`get`](Self::get).
    pub fn checkout_with_timeout(&self, key: &K, timeout: Option<Duration>) -> PoolResult<()> {
        self.enter(key, timeout, false).map(|_| ())
    }

    /// Check in the calling thread's most recent checkout.
    ///
    /// The connection goes back to the shared stack once the thread's
    /// outermost checkout is checked in. Fails with
    /// [`PoolError::NotCheckedOut`] when the most recent checkout belongs to a
    /// live guard, and with [`PoolError::Dispose`] when the connection reaches
    /// a failing disposer after shutdown.
    pub fn checkin(&self) -> PoolResult<()> {
        self.leave(Frame::Manual)
    }

    /// Check out a connection wrapped in a guard that checks it in on drop
    pub fn get(&self, key: &K) -> PoolResult<PooledConnection<'_, K, T>> {
        self.get_with_timeout(key, None)
    }

    /// [`get`](Self::get) with a per-call timeout override
    pub fn get_with_timeout(
        &self,
        key: &K,
        timeout: Option<Duration>,
    ) -> PoolResult<PooledConnection<'_, K, T>> {
        let frame = self.enter(key, timeout, true)?;
        let conn = self
            .leases
            .get(&thread::current().id())
            .and_then(|lease| lease.conn.clone());

        match conn {
            Some(conn) => Ok(PooledConnection {
                conn: Some(conn),
                frame,
                pool: self,
                _not_send: PhantomData,
            }),
            None => {
                self.leave(frame)?;
                Err(PoolError::ConnectionInUse)
            }
        }
    }

    /// Check out a connection for exclusive use.
    ///
    /// Nests like [`get`](Self::get), but fails with
    /// [`PoolError::ConnectionInUse`] while another guard on this thread
    /// still has the connection.
    pub fn get_mut(&self, key: &K) -> PoolResult<PooledConnectionMut<'_, K, T>> {
        self.get_mut_with_timeout(key, None)
    }

    /// [`get_mut`](Self::get_mut) with a per-call timeout override
    pub fn get_mut_with_timeout(
        &self,
        key: &K,
        timeout: Option<Duration>,
    ) -> PoolResult<PooledConnectionMut<'_, K, T>> {
        let frame = self.enter(key, timeout, true)?;
        let taken = self
            .leases
            .get_mut(&thread::current().id())
            .and_then(|mut lease| lease.conn.take());

        match taken.map(Arc::try_unwrap) {
            Some(Ok(conn)) => Ok(PooledConnectionMut {
                conn: Some(conn),
                frame,
                pool: self,
                _not_send: PhantomData,
            }),
            Some(Err(shared)) => {
                self.restore(shared);
                self.leave(frame)?;
                Err(PoolError::ConnectionInUse)
            }
            None => {
                self.leave(frame)?;
                Err(PoolError::ConnectionInUse)
            }
        }
    }

    /// Run `body` with a connection for `key`.
    ///
    /// The connection is checked in on every exit path, including a panic in
    /// `body`.
    pub fn with<R, B>(&self, key: &K, body: B) -> PoolResult<R>
    where
        B: FnOnce(&T) -> R,
    {
        self.with_timeout(key, None, body)
    }

    /// [`with`](Self::with) with a per-call timeout override
    pub fn with_timeout<R, B>(&self, key: &K, timeout: Option<Duration>, body: B) -> PoolResult<R>
    where
        B: FnOnce(&T) -> R,
    {
        let conn = self.get_with_timeout(key, timeout)?;
        let result = body(&*conn);
        conn.checkin()?;
        Ok(result)
    }

    /// Run `body` with exclusive access to a connection for `key`
    pub fn with_mut<R, B>(&self, key: &K, body: B) -> PoolResult<R>
    where
        B: FnOnce(&mut T) -> R,
    {
        self.with_mut_timeout(key, None, body)
    }

    /// [`with_mut`](Self::with_mut) with a per-call timeout override
    pub fn with_mut_timeout<R, B>(&self, key: &K, timeout: Option<Duration>, body: B) -> PoolResult<R>
    where
        B: FnOnce(&mut T) -> R,
    {
        let mut conn = self.get_mut_with_timeout(key, timeout)?;
        let result = body(&mut *conn);
        conn.checkin()?;
        Ok(result)
    }

    /// Dispose idle connections now and the rest as they are checked in.
    ///
    /// Checkouts that need the shared stack fail with
    /// [`PoolError::PoolShuttingDown`] afterwards.
    pub fn shutdown<D>(&self, disposer: D)
    where
        D: FnMut(T) + Send + 'static,
    {
        self.available.shutdown(disposer);
    }

    /// [`shutdown`](Self::shutdown) with a disposer that may fail.
    ///
    /// Returns the first failure among the idle connections. Failures for
    /// connections checked in later surface from that checkin.
    pub fn try_shutdown<D, E>(&self, disposer: D) -> PoolResult<()>
    where
        D: FnMut(T) -> Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.available.try_shutdown(disposer)
    }

    /// Nesting depth of the calling thread's checkouts
    pub fn checked_out_depth(&self) -> usize {
        self.leases
            .get(&thread::current().id())
            .map_or(0, |lease| lease.frames.len())
    }

    /// Number of idle connections
    pub fn len(&self) -> usize {
        self.available.len()
    }

    /// Whether there is no idle connection
    pub fn is_empty(&self) -> bool {
        self.available.is_empty()
    }

    /// Maximum number of connections shared across keys
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Default checkout timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shutdown(&self) -> bool {
        self.available.is_shutdown()
    }

    /// Get pool metrics
    pub fn metrics(&self) -> PoolMetrics {
        self.available.metrics()
    }

    /// Get health status
    pub fn health_status(&self) -> HealthStatus {
        self.available.health_status()
    }

    /// Open a frame on the calling thread, taking a connection from the shared
    /// stack for the outermost one.
    fn enter(&self, key: &K, timeout: Option<Duration>, guarded: bool) -> PoolResult<Frame> {
        let thread = thread::current().id();

        if let Some(mut lease) = self.leases.get_mut(&thread) {
            let frame = lease.open(guarded);
            trace!(depth = lease.frames.len(), "reentrant checkout");
            return Ok(frame);
        }

        let conn = self.available.pop(key, timeout.unwrap_or(self.timeout))?;
        let mut lease = Lease {
            conn: Some(Arc::new(conn)),
            key: key.clone(),
            frames: Vec::new(),
            next_guard: 0,
        };
        let frame = lease.open(guarded);
        self.leases.insert(thread, lease);
        Ok(frame)
    }

    /// Close `frame` on the calling thread and release the connection with the
    /// last one.
    fn leave(&self, frame: Frame) -> PoolResult<()> {
        let thread = thread::current().id();

        let released = {
            let mut lease = self.leases.get_mut(&thread).ok_or(PoolError::NotCheckedOut)?;
            let index = match frame {
                // Manual checkins pair with the innermost checkout only.
                Frame::Manual => match lease.frames.last() {
                    Some(Frame::Manual) => Some(lease.frames.len() - 1),
                    _ => None,
                },
                Frame::Guard(_) => lease.frames.iter().rposition(|open| *open == frame),
            }
            .ok_or(PoolError::NotCheckedOut)?;
            lease.frames.remove(index);
            lease.frames.is_empty()
        };

        if !released {
            trace!("nested checkin");
            return Ok(());
        }

        let Some((_, lease)) = self.leases.remove_if(&thread, |_, lease| lease.frames.is_empty()) else {
            return Ok(());
        };
        // Every guard dropped its handle before its frame closed.
        match lease.conn.and_then(Arc::into_inner) {
            Some(conn) => self.available.push(conn, lease.key),
            None => Ok(()),
        }
    }

    /// Put back a connection taken out by `get_mut`
    fn restore(&self, conn: Arc<T>) {
        if let Some(mut lease) = self.leases.get_mut(&thread::current().id()) {
            lease.conn = Some(conn);
        }
    }
}
