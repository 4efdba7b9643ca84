//! Metrics collection and export for keyed pools

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Point-in-time metrics for a pool
///
/// # Examples
///
/// ```
/// use keyed_pool::KeyedResourceStack;
/// use std::time::Duration;
///
/// let stack = KeyedResourceStack::new(2, |host: &&str| host.len());
///
/// let conn = stack.pop(&"a.example", Duration::ZERO).unwrap();
/// let metrics = stack.metrics();
/// assert_eq!(metrics.created, 1);
/// assert_eq!(metrics.checked_out, 1);
///
/// stack.push(conn, "a.example").unwrap();
/// assert_eq!(stack.metrics().idle, 1);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolMetrics {
    /// Checkouts served by the shared stack
    pub total_checkouts: usize,

    /// Connections returned to the shared stack
    pub total_checkins: usize,

    /// Slots materialized so far, never above the capacity
    pub created: usize,

    /// Idle connections discarded to make room for another key
    pub recycled: usize,

    /// Checkouts that gave up waiting
    pub timeouts: usize,

    /// Connections handed to the shutdown disposer
    pub disposed: usize,

    /// Currently idle connections
    pub idle: usize,

    /// Currently checked out connections
    pub checked_out: usize,

    /// Slot capacity shared across keys
    pub capacity: usize,

    /// Checked out share of the capacity (0.0 to 1.0)
    pub utilization: f64,

    /// Whether shutdown has begun
    pub is_shutdown: bool,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("total_checkouts".to_string(), self.total_checkouts.to_string());
        metrics.insert("total_checkins".to_string(), self.total_checkins.to_string());
        metrics.insert("created".to_string(), self.created.to_string());
        metrics.insert("recycled".to_string(), self.recycled.to_string());
        metrics.insert("timeouts".to_string(), self.timeouts.to_string());
        metrics.insert("disposed".to_string(), self.disposed.to_string());
        metrics.insert("idle".to_string(), self.idle.to_string());
        metrics.insert("checked_out".to_string(), self.checked_out.to_string());
        metrics.insert("capacity".to_string(), self.capacity.to_string());
        metrics.insert("utilization".to_string(), format!("{:.2}", self.utilization));
        metrics.insert("is_shutdown".to_string(), self.is_shutdown.to_string());
        metrics
    }
}

/// Metrics exporter for Prometheus format
#[cfg(feature = "metrics")]
pub struct MetricsExporter;

#[cfg(feature = "metrics")]
impl MetricsExporter {
    /// Export metrics in Prometheus exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use keyed_pool::{KeyedResourceStack, MetricsExporter};
    /// use std::collections::HashMap;
    ///
    /// let stack = KeyedResourceStack::new(5, |_: &u16| ());
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("service".to_string(), "api".to_string());
    ///
    /// let output = MetricsExporter::export_prometheus(&stack.metrics(), "http", Some(&tags));
    /// assert!(output.contains("keyedpool_connections_idle"));
    /// assert!(output.contains("service=\"api\""));
    /// ```
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        let mut output = String::new();
        let labels = Self::format_labels(pool_name, tags);

        let gauges = [
            ("keyedpool_connections_idle", "Current idle connections", metrics.idle as f64),
            ("keyedpool_connections_checked_out", "Current checked out connections", metrics.checked_out as f64),
            ("keyedpool_capacity", "Slot capacity shared across keys", metrics.capacity as f64),
            ("keyedpool_utilization", "Pool utilization ratio", metrics.utilization),
        ];
        for (name, help, value) in gauges {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} gauge\n", name));
            output.push_str(&format!("{}{{{}}} {:.2}\n", name, labels, value));
        }

        let counters = [
            ("keyedpool_checkouts_total", "Checkouts served by the shared stack", metrics.total_checkouts),
            ("keyedpool_checkins_total", "Connections returned to the shared stack", metrics.total_checkins),
            ("keyedpool_connections_created_total", "Connections created", metrics.created),
            ("keyedpool_connections_recycled_total", "Idle connections recycled for another key", metrics.recycled),
            ("keyedpool_timeouts_total", "Checkouts that timed out", metrics.timeouts),
            ("keyedpool_connections_disposed_total", "Connections disposed during shutdown", metrics.disposed),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{}{{{}}} {}\n", name, labels, value));
        }

        output
    }

    fn format_labels(pool_name: &str, tags: Option<&HashMap<String, String>>) -> String {
        let mut labels = vec![format!("pool=\"{}\"", pool_name)];

        if let Some(tags) = tags {
            let mut tags: Vec<_> = tags.iter().collect();
            tags.sort();
            for (key, value) in tags {
                labels.push(format!("{}=\"{}\"", key, value));
            }
        }

        labels.join(",")
    }
}

/// Internal metrics tracker
#[derive(Default)]
pub(crate) struct MetricsTracker {
    pub total_checkouts: AtomicUsize,
    pub total_checkins: AtomicUsize,
    pub recycled: AtomicUsize,
    pub timeouts: AtomicUsize,
    pub disposed: AtomicUsize,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_metrics(
        &self,
        idle: usize,
        checked_out: usize,
        created: usize,
        capacity: usize,
        is_shutdown: bool,
    ) -> PoolMetrics {
        let utilization = if capacity > 0 {
            checked_out as f64 / capacity as f64
        } else {
            0.0
        };

        PoolMetrics {
            total_checkouts: self.total_checkouts.load(Ordering::Relaxed),
            total_checkins: self.total_checkins.load(Ordering::Relaxed),
            created,
            recycled: self.recycled.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            disposed: self.disposed.load(Ordering::Relaxed),
            idle,
            checked_out,
            capacity,
            utilization,
            is_shutdown,
        }
    }
}
