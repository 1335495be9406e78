use crate::error::ConfigError;
use route_rs_packets::MacAddr;
use std::net::Ipv4Addr;
use std::time::Duration;

/// 2^9 slots.
pub const DEFAULT_CACHE_CAPACITY: usize = 512;
pub const DEFAULT_RETRY_COUNT: u32 = 4;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_EMIT_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);
/// Upper bound on every interval, so deadlines stay representable as `Instant`s.
pub const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Everything the resolver needs to know about the link it sits on. Addresses are injected here
/// and never rediscovered.
///
/// Built in the same by-value style as the route-rs link builders:
///
/// ```
/// use route_rs_arp::ResolverConfig;
/// use std::time::Duration;
///
/// let config = ResolverConfig::new(
///     "da:d1:d2:d3:d4:d5".parse().unwrap(),
///     "192.168.1.101".parse().unwrap(),
///     "192.168.1.1".parse().unwrap(),
///     "255.255.255.0".parse().unwrap(),
/// )
/// .cache_capacity(4)
/// .retry_interval(Duration::from_millis(300));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolverConfig {
    pub local_mac: MacAddr,
    pub local_ip: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    /// Number of direct-mapped cache slots.
    pub cache_capacity: usize,
    /// Total number of request packets sent for one address before giving up.
    pub retry_count: u32,
    /// Wait between two requests for the same address.
    pub retry_interval: Duration,
    /// Wait after the final request before failing with a timeout.
    pub request_timeout: Duration,
    /// Frames held back while the transport applies backpressure.
    pub emit_queue_capacity: usize,
    /// How often the driver scans pending requests.
    pub tick_interval: Duration,
}

impl ResolverConfig {
    pub fn new(
        local_mac: MacAddr,
        local_ip: Ipv4Addr,
        gateway_ip: Ipv4Addr,
        subnet_mask: Ipv4Addr,
    ) -> Self {
        ResolverConfig {
            local_mac,
            local_ip,
            gateway_ip,
            subnet_mask,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            emit_queue_capacity: DEFAULT_EMIT_QUEUE_CAPACITY,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }

    pub fn cache_capacity(self, cache_capacity: usize) -> Self {
        ResolverConfig {
            cache_capacity,
            ..self
        }
    }

    pub fn retry_count(self, retry_count: u32) -> Self {
        ResolverConfig {
            retry_count,
            ..self
        }
    }

    pub fn retry_interval(self, retry_interval: Duration) -> Self {
        ResolverConfig {
            retry_interval,
            ..self
        }
    }

    pub fn request_timeout(self, request_timeout: Duration) -> Self {
        ResolverConfig {
            request_timeout,
            ..self
        }
    }

    pub fn emit_queue_capacity(self, emit_queue_capacity: usize) -> Self {
        ResolverConfig {
            emit_queue_capacity,
            ..self
        }
    }

    pub fn tick_interval(self, tick_interval: Duration) -> Self {
        ResolverConfig {
            tick_interval,
            ..self
        }
    }

    /// Checks the invariants the resolver relies on. Called by `Resolver::new`, so a bad
    /// configuration never reaches a running engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_capacity == 0 {
            return Err(ConfigError::ZeroCacheCapacity);
        }
        if self.retry_count == 0 {
            return Err(ConfigError::ZeroRetryCount);
        }
        if self.emit_queue_capacity == 0 {
            return Err(ConfigError::ZeroEmitQueueCapacity);
        }
        for (name, interval) in &[
            ("retry interval", self.retry_interval),
            ("request timeout", self.request_timeout),
            ("tick interval", self.tick_interval),
        ] {
            if *interval == Duration::from_secs(0) {
                return Err(ConfigError::ZeroInterval { name: *name });
            }
            if *interval > MAX_INTERVAL {
                return Err(ConfigError::IntervalTooLarge { name: *name });
            }
        }
        // A valid mask is a run of ones followed by a run of zeros, so its complement plus one
        // is a power of two (or wraps to zero for 0.0.0.0).
        let host_bits = !u32::from(self.subnet_mask);
        if host_bits & host_bits.wrapping_add(1) != 0 {
            return Err(ConfigError::InvalidSubnetMask {
                mask: self.subnet_mask,
            });
        }
        Ok(())
    }
}
