//! Health monitoring for keyed pools

use crate::metrics::PoolMetrics;

/// Health status of a keyed pool
///
/// # Examples
///
/// ```
/// use keyed_pool::KeyedResourceStack;
///
/// let stack = KeyedResourceStack::new(5, |_: &u16| ());
///
/// let health = stack.health_status();
/// assert!(health.is_healthy());
/// assert_eq!(health.total_capacity, 5);
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct HealthStatus {
    /// Whether the pool is healthy
    pub is_healthy: bool,

    /// Number of warnings detected
    pub warning_count: usize,

    /// Current pool utilization (0.0 to 1.0)
    pub utilization: f64,

    /// Idle connections count
    pub idle_connections: usize,

    /// Checked out connections count
    pub checked_out_connections: usize,

    /// Total capacity
    pub total_capacity: usize,

    /// Warning messages
    pub warnings: Vec<String>,
}

impl HealthStatus {
    /// Derive a health status from a metrics snapshot
    pub fn from_metrics(metrics: &PoolMetrics) -> Self {
        let mut warnings = Vec::new();
        let mut is_healthy = true;

        if metrics.is_shutdown {
            warnings.push("Pool is shutting down".to_string());
            is_healthy = false;
        }

        if metrics.utilization > 0.9 {
            warnings.push(format!("High utilization: {:.1}%", metrics.utilization * 100.0));
            is_healthy = false;
        }

        // Next checkout on a new key has to wait.
        if metrics.idle == 0 && metrics.created >= metrics.capacity && metrics.capacity > 0 {
            warnings.push("No idle or creatable connections".to_string());
        }

        Self {
            is_healthy,
            warning_count: warnings.len(),
            utilization: metrics.utilization,
            idle_connections: metrics.idle,
            checked_out_connections: metrics.checked_out,
            total_capacity: metrics.capacity,
            warnings,
        }
    }

    /// Check if the pool is healthy
    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }
}
