//! Pool configuration options

use std::time::Duration;

/// Default number of connections shared across all keys.
pub const DEFAULT_SIZE: usize = 5;

/// Default time to wait for a connection when every slot is checked out.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for keyed pool behavior
///
/// # Examples
///
/// ```
/// use keyed_pool::PoolConfiguration;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_size(50)
///     .with_timeout(Duration::from_millis(250));
///
/// assert_eq!(config.size, 50);
/// assert_eq!(config.timeout, Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolConfiguration {
    /// Maximum number of connections ever created, shared by every key
    pub size: usize,

    /// How long a checkout waits when the pool is completely checked out.
    /// A zero timeout never waits.
    pub timeout: Duration,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            size: DEFAULT_SIZE,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total slot capacity
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set the default checkout timeout
    ///
    /// # Examples
    ///
    /// ```
    /// use keyed_pool::PoolConfiguration;
    /// use std::time::Duration;
    ///
    /// let config = PoolConfiguration::new().with_timeout(Duration::ZERO);
    /// assert!(config.timeout.is_zero());
    /// ```
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfiguration::default();
        assert_eq!(config.size, 5);
        assert_eq!(config.timeout, Duration::from_secs(5));
    }
}
