use crate::config::ResolverConfig;
use crate::driver::ArpDriver;
use crate::emitter::Egress;
use crate::error::{ConfigError, ResolutionError};
use crate::ingress::Ingested;
use crate::pending::{Resolution, WaiterId};
use crate::resolver::{Query, Resolver, TickReport};
use futures::Stream;
use route_rs_packets::{ArpFrame, EthernetFrame, MacAddr};
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Cloneable handle to a running resolver.
///
/// Every clone shares one `Resolver` behind a mutex, so queries from many tasks, inbound frames
/// and timer ticks are applied one at a time. The engine itself never spawns anything; hand the
/// future returned by `driver` to the runtime to get packets flowing.
#[derive(Clone)]
pub struct ArpEngine {
    core: Arc<Mutex<Resolver>>,
    tick_interval: Duration,
}

impl ArpEngine {
    pub fn new<E>(config: ResolverConfig, egress: E) -> Result<Self, ConfigError>
    where
        E: Egress + Send + 'static,
    {
        let tick_interval = config.tick_interval;
        let resolver = Resolver::new(config, Box::new(egress))?;
        Ok(ArpEngine {
            core: Arc::new(Mutex::new(resolver)),
            tick_interval,
        })
    }

    /// Resolves `addr` to the link address packets for it should be sent to.
    ///
    /// Broadcast addresses and cache hits resolve on first poll without touching the network.
    /// Anything else waits on an ARP request for the next hop, shared with every other caller
    /// asking for the same next hop. Dropping the future withdraws the caller from that request.
    pub fn resolve(&self, addr: Ipv4Addr) -> ResolveFuture {
        match self.lock().query(addr, Instant::now()) {
            Query::Ready(resolution) => ResolveFuture {
                state: ResolveState::Ready(resolution),
            },
            Query::Waiting {
                target,
                waiter,
                receiver,
            } => ResolveFuture {
                state: ResolveState::Waiting {
                    core: Arc::downgrade(&self.core),
                    requested: addr,
                    target,
                    waiter,
                    receiver,
                },
            },
        }
    }

    /// Empties the cache. Resolutions in flight fail with `ResolutionError::Cleared`.
    pub fn clear_cache(&self) -> usize {
        self.lock().clear()
    }

    /// Peeks at the cache without resolving anything.
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<MacAddr> {
        self.lock().lookup(addr)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending_count()
    }

    pub fn ingest(&self, frame: &ArpFrame) -> Ingested {
        self.lock().ingest(frame)
    }

    pub fn ingest_ethernet(&self, frame: EthernetFrame) -> Ingested {
        self.lock().ingest_ethernet(frame)
    }

    pub fn tick(&self) -> TickReport {
        self.lock().tick(Instant::now())
    }

    /// Fails every resolution in flight with `ResolutionError::Shutdown`. Later calls to
    /// `resolve` fail the same way.
    pub fn shutdown(&self) -> usize {
        self.lock().shutdown()
    }

    /// The future that feeds `inbound` to the resolver and drives its retry timer.
    pub fn driver<S>(&self, inbound: S) -> ArpDriver<S>
    where
        S: Stream<Item = ArpFrame> + Unpin,
    {
        ArpDriver::new(self.clone(), inbound, self.tick_interval)
    }

    // Nothing panics while holding the lock, and the resolver stays consistent between calls
    // even if something did.
    fn lock(&self) -> MutexGuard<'_, Resolver> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum ResolveState {
    Ready(Resolution),
    Waiting {
        core: Weak<Mutex<Resolver>>,
        requested: Ipv4Addr,
        target: Ipv4Addr,
        waiter: WaiterId,
        receiver: oneshot::Receiver<Resolution>,
    },
    Done,
}

/// Returned by `ArpEngine::resolve`.
#[must_use = "futures do nothing unless polled"]
pub struct ResolveFuture {
    state: ResolveState,
}

impl ResolveFuture {
    /// The next hop being resolved, if the answer was not known right away.
    pub fn next_hop(&self) -> Option<Ipv4Addr> {
        match self.state {
            ResolveState::Waiting { target, .. } => Some(target),
            _ => None,
        }
    }
}

impl Future for ResolveFuture {
    type Output = Result<MacAddr, ResolutionError>;

    /// Implement Poll for Future for ResolveFuture
    ///
    /// #1 The answer was known when the future was made: hand it out.
    ///
    /// #2 Waiting on the resolver: poll the one-shot. If the resolver went away without
    /// answering, every handle to it was dropped, which is a shutdown.
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let resolution = match &mut self.state {
            ResolveState::Ready(resolution) => *resolution,
            ResolveState::Waiting {
                requested,
                receiver,
                ..
            } => match Pin::new(receiver).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(resolution)) => resolution,
                Poll::Ready(Err(_)) => Err(ResolutionError::Shutdown { addr: *requested }),
            },
            ResolveState::Done => panic!("ResolveFuture polled after completion"),
        };
        self.state = ResolveState::Done;
        Poll::Ready(resolution)
    }
}

impl Drop for ResolveFuture {
    fn drop(&mut self) {
        if let ResolveState::Waiting {
            core,
            target,
            waiter,
            ..
        } = &self.state
        {
            if let Some(core) = core.upgrade() {
                core.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .cancel(*target, *waiter);
            }
        }
    }
}
