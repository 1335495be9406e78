use crate::cache::ArpCache;
use crate::config::ResolverConfig;
use crate::emitter::{Egress, Emitter};
use crate::error::{ConfigError, EmitError, ResolutionError};
use crate::pending::{Attached, PendingTable, Resolution, WaiterId};
use crate::route::SubnetClassifier;
use route_rs_packets::MacAddr;
use std::net::Ipv4Addr;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Outcome of asking the resolver for an address.
#[derive(Debug)]
pub enum Query {
    /// Answered without touching the network.
    Ready(Resolution),
    /// A request is in flight; the answer arrives on `receiver`.
    Waiting {
        target: Ipv4Addr,
        waiter: WaiterId,
        receiver: oneshot::Receiver<Resolution>,
    },
}

/// What one scan of the pending requests did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub retransmitted: usize,
    pub failed: usize,
}

/// The synchronous core of the engine.
///
/// The resolver owns the cache, the pending requests and the emitter, and it is the only thing
/// that mutates them. It never reads a clock: every time-dependent operation takes `now`, so the
/// caller decides what time it is. `ArpEngine` wraps it for concurrent use.
pub struct Resolver {
    pub(crate) config: ResolverConfig,
    pub(crate) classifier: SubnetClassifier,
    pub(crate) cache: ArpCache,
    pub(crate) pending: PendingTable,
    pub(crate) emitter: Emitter,
    /// Set by `shutdown`. Nothing ticks a shut down resolver, so it takes no new requests.
    pub(crate) shut_down: bool,
}

impl Resolver {
    pub fn new(config: ResolverConfig, egress: Box<dyn Egress + Send>) -> Result<Self, ConfigError> {
        config.validate()?;
        let classifier =
            SubnetClassifier::new(config.local_ip, config.gateway_ip, config.subnet_mask);
        let cache = ArpCache::new(config.cache_capacity)?;
        let pending = PendingTable::new(
            config.retry_count,
            config.retry_interval,
            config.request_timeout,
        );
        let emitter = Emitter::new(
            config.local_mac,
            config.local_ip,
            egress,
            config.emit_queue_capacity,
        );
        info!(
            mac = %config.local_mac,
            ip = %config.local_ip,
            gateway = %config.gateway_ip,
            mask = %config.subnet_mask,
            "ARP resolver ready"
        );
        Ok(Resolver {
            config,
            classifier,
            cache,
            pending,
            emitter,
            shut_down: false,
        })
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn cache(&self) -> &ArpCache {
        &self.cache
    }

    /// Resolves `addr` from the cache if possible, otherwise attaches to (or starts) a request
    /// for its next hop. Once shut down, every query fails with `ResolutionError::Shutdown`.
    pub fn query(&mut self, addr: Ipv4Addr, now: Instant) -> Query {
        if self.shut_down {
            return Query::Ready(Err(ResolutionError::Shutdown { addr }));
        }
        let target = match self.classifier.classify(addr).next_hop() {
            Some(target) => target,
            None => return Query::Ready(Ok(MacAddr::BROADCAST)),
        };
        if target == self.config.local_ip {
            return Query::Ready(Ok(self.config.local_mac));
        }
        if let Some(mac) = self.cache.lookup(target) {
            return Query::Ready(Ok(mac));
        }

        let (completion, receiver) = oneshot::channel();
        let attached = self.pending.attach(target, addr, completion, now);
        if let Attached::Created(_) = attached {
            // A refused request still arms the deadline, so the retry covers it.
            let result = self.emitter.emit_request(target);
            self.pending.mark_sent(target, now);
            self.absorb(result);
        }
        Query::Waiting {
            target,
            waiter: attached.waiter(),
            receiver,
        }
    }

    /// Retransmits or fails every request whose deadline passed, then drains what the emitter
    /// is holding back.
    pub fn tick(&mut self, now: Instant) -> TickReport {
        let flushed = self.emitter.flush();
        self.absorb(flushed);

        let expired = self.pending.expire(now);
        for target in &expired.retransmit {
            let result = self.emitter.emit_request(*target);
            self.absorb(result);
        }
        for target in &expired.failed {
            warn!(ip = %target, "ARP resolution failed, no reply");
        }
        TickReport {
            retransmitted: expired.retransmit.len(),
            failed: expired.failed.len(),
        }
    }

    pub fn flush(&mut self) {
        let result = self.emitter.flush();
        self.absorb(result);
    }

    /// Empties the cache and aborts every request in flight.
    pub fn clear(&mut self) -> usize {
        self.cache.clear();
        let aborted = self.pending.fail_all(|addr| ResolutionError::Cleared { addr });
        info!(aborted, "ARP cache cleared");
        aborted
    }

    /// Aborts every request in flight and refuses new ones. The cache is kept.
    pub fn shutdown(&mut self) -> usize {
        self.shut_down = true;
        let aborted = self.pending.fail_all(|addr| ResolutionError::Shutdown { addr });
        if aborted > 0 {
            info!(aborted, "ARP resolver shut down");
        }
        aborted
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn cancel(&mut self, target: Ipv4Addr, waiter: WaiterId) -> bool {
        self.pending.cancel(target, waiter)
    }

    /// The cached mapping for `addr` itself, without routing it or sending anything.
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<MacAddr> {
        self.cache.lookup(addr)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Learns a confirmed mapping and resolves whoever was waiting for it.
    pub(crate) fn learn(&mut self, ip: Ipv4Addr, mac: MacAddr) -> usize {
        if let Some(evicted) = self.cache.insert_or_update(ip, mac) {
            debug!(ip = %evicted.ip, mac = %evicted.mac, "evicted ARP cache entry");
        }
        self.pending.complete(ip, mac)
    }

    /// The emitter already logged the failure. A closed transport means nothing in flight can
    /// ever be answered.
    pub(crate) fn absorb(&mut self, result: Result<(), EmitError>) {
        if let Err(EmitError::Disconnected) = result {
            self.shutdown();
        }
    }
}
