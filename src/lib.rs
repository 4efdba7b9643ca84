//! # keyed_pool
//!
//! A bounded, thread-safe pool of connections partitioned by key. Every key
//! draws from one shared slot budget; connections are created lazily and the
//! least recently returned idle connection is recycled when a new key needs
//! room.
//!
//! ## Features
//!
//! - One capacity shared by every key (host, port, credentials, ...)
//! - Reuse of idle connections whose key matches
//! - LRU recycling once the capacity is reached
//! - Blocking checkout with per-call timeout, zero meaning "don't wait"
//! - Reentrant checkout: nested checkouts on one thread share a connection
//! - Scoped use via [`ReentrantPool::with`] and the [`PooledConnection`] guard
//! - Exclusive use via [`ReentrantPool::with_mut`] and [`PooledConnectionMut`]
//! - Graceful shutdown with a (possibly fallible) disposer for idle and
//!   late-returned connections
//! - Metrics, health status and Prometheus text export
//!
//! ## Quick Start
//!
//! ```rust
//! use keyed_pool::{PoolConfiguration, ReentrantPool};
//!
//! let pool = ReentrantPool::new(PoolConfiguration::new().with_size(2), |host: &&str| {
//!     format!("session with {}", host)
//! });
//!
//! let greeting = pool.with(&"db.internal", |conn| conn.len()).unwrap();
//! assert_eq!(greeting, "session with db.internal".len());
//!
//! pool.with_mut(&"db.internal", |conn| conn.push_str(" (authenticated)")).unwrap();
//!
//! pool.try_shutdown(|conn: String| {
//!     if conn.ends_with("(authenticated)") { Ok(()) } else { Err("never authenticated") }
//! })
//! .unwrap();
//! ```

mod config;
mod errors;
mod health;
mod metrics;
mod pool;
mod stack;

pub use config::{PoolConfiguration, DEFAULT_SIZE, DEFAULT_TIMEOUT};
pub use errors::{BoxError, PoolError, PoolResult};
pub use health::HealthStatus;
#[cfg(feature = "metrics")]
pub use metrics::MetricsExporter;
pub use metrics::PoolMetrics;
pub use pool::{PooledConnection, PooledConnectionMut, ReentrantPool};
pub use stack::KeyedResourceStack;
