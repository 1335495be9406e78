use failure::Fail;
use route_rs_packets::MacAddr;
use std::net::Ipv4Addr;

/// The only failures a caller of `ArpEngine::resolve` can observe. Each variant names the
/// address the caller asked for, even when a gateway was resolved on its behalf.
#[derive(Clone, Copy, Debug, Fail, PartialEq, Eq)]
pub enum ResolutionError {
    #[fail(display = "no ARP reply for {} after all retries", addr)]
    Timeout { addr: Ipv4Addr },

    #[fail(display = "resolution of {} aborted, the ARP cache was cleared", addr)]
    Cleared { addr: Ipv4Addr },

    #[fail(display = "resolution of {} aborted, the ARP engine shut down", addr)]
    Shutdown { addr: Ipv4Addr },
}

impl ResolutionError {
    pub fn addr(&self) -> Ipv4Addr {
        match *self {
            ResolutionError::Timeout { addr }
            | ResolutionError::Cleared { addr }
            | ResolutionError::Shutdown { addr } => addr,
        }
    }
}

/// Rejected configuration. Raised once, when the resolver is built.
#[derive(Clone, Debug, Fail, PartialEq, Eq)]
pub enum ConfigError {
    #[fail(display = "ARP cache capacity must be > 0")]
    ZeroCacheCapacity,

    #[fail(display = "ARP retry count must be > 0")]
    ZeroRetryCount,

    #[fail(display = "ARP emit queue capacity must be > 0")]
    ZeroEmitQueueCapacity,

    #[fail(display = "{} must be non-zero", name)]
    ZeroInterval { name: &'static str },

    #[fail(display = "{} must be at most a year", name)]
    IntervalTooLarge { name: &'static str },

    #[fail(display = "subnet mask {} is not a contiguous prefix", mask)]
    InvalidSubnetMask { mask: Ipv4Addr },
}

/// Why an inbound frame was dropped by the ingestor. Never surfaced to callers.
#[derive(Clone, Copy, Debug, Fail, PartialEq, Eq)]
pub enum PacketError {
    #[fail(display = "malformed frame: {}", _0)]
    Malformed(&'static str),

    #[fail(display = "ether type {:#06x} is not ARP", _0)]
    NotArp(u16),

    #[fail(display = "unsupported hardware type {}", _0)]
    UnsupportedHardware(u16),

    #[fail(display = "unsupported protocol type {:#06x}", _0)]
    UnsupportedProtocol(u16),

    #[fail(display = "bad address lengths (hardware {}, protocol {})", hlen, plen)]
    BadAddressLengths { hlen: u8, plen: u8 },

    #[fail(display = "unknown opcode {}", _0)]
    UnknownOpcode(u16),

    #[fail(display = "sender hardware address {} is not unicast", _0)]
    InvalidSenderMac(MacAddr),

    #[fail(display = "sender protocol address {} is unusable", _0)]
    InvalidSenderIp(Ipv4Addr),

    #[fail(display = "{} claims our own protocol address", _0)]
    AddressConflict(MacAddr),
}

/// Failures inside the request emitter. Logged by the resolver, never surfaced to callers.
#[derive(Clone, Copy, Debug, Fail, PartialEq, Eq)]
pub enum EmitError {
    #[fail(display = "emit backlog is full ({} frames)", capacity)]
    QueueFull { capacity: usize },

    #[fail(display = "transport is closed")]
    Disconnected,
}
