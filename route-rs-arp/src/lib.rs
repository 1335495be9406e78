/// The engine is the public face of the crate. An `ArpEngine` is a cloneable handle that resolves IPv4
/// addresses to link addresses: broadcasts and cached mappings answer immediately, everything else waits
/// on an ARP request shared by every caller asking for the same next hop. Its `driver` is the future that
/// feeds inbound frames to it and keeps retry timers running; hand it to tokio and the engine is live.
pub mod engine;
pub use self::engine::{ArpEngine, ResolveFuture};

/// The driver pulls frames off any `Stream` of ARP frames and ticks the resolver on a tokio interval.
pub mod driver;
pub use self::driver::ArpDriver;

/// The resolver is the single-threaded core under the engine. It owns the cache, the pending requests and
/// the emitter, and takes the current time as an argument, which makes it straightforward to test.
pub mod resolver;
pub use self::resolver::{Query, Resolver, TickReport};

/// Inbound frame validation, and the rules for what an ARP request or reply teaches the resolver.
pub mod ingress;
pub use self::ingress::{validate, Ingested, Validated};

/// Bookkeeping for addresses that are being resolved right now: retries left, deadlines, waiters.
pub mod pending;

/// Outbound ARP frames and the backlog that absorbs transport backpressure.
pub mod emitter;
pub use self::emitter::{Egress, Emitter, Refused};

/// Fixed size, direct-mapped IPv4 to MAC cache.
pub mod cache;
pub use self::cache::{ArpCache, CacheEntry};

/// Decides whether an address is on-link, behind the gateway or a broadcast.
pub mod route;
pub use self::route::{classify, Route, SubnetClassifier};

mod config;
pub use self::config::*;

mod error;
pub use self::error::*;
