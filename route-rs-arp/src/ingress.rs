use crate::error::PacketError;
use crate::resolver::Resolver;
use route_rs_packets::{ArpFrame, ArpOp, EthernetFrame, MacAddr, ARP_ETHER_TYPE, IPV4_ETHER_TYPE};
use std::convert::TryFrom;
use std::net::Ipv4Addr;
use tracing::{debug, trace, warn};

const ETHERNET_HARDWARE_TYPE: u16 = 1;
const ETHERNET_ADDR_LEN: u8 = 6;
const IPV4_ADDR_LEN: u8 = 4;
/// htype, ptype, hlen, plen and opcode.
const ARP_HEADER_LEN: usize = 8;

/// The fields of an ARP frame the resolver acts on, after validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Validated {
    pub op: ArpOp,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_ip: Ipv4Addr,
}

/// What ingesting one frame did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ingested {
    /// The frame failed validation and changed nothing.
    Dropped(PacketError),
    /// A request for our address was answered, and the requester learned.
    Answered { requester: Ipv4Addr, resolved: usize },
    /// A mapping was written into the cache. `resolved` waiters were completed by it.
    Learned { ip: Ipv4Addr, resolved: usize },
    /// A request from a host we already knew updated its entry.
    Refreshed { ip: Ipv4Addr },
    /// Valid, but nothing to do with us.
    Ignored,
}

/// Checks that `frame` is an Ethernet/IPv4 ARP request or reply from a usable sender.
pub fn validate(frame: &ArpFrame) -> Result<Validated, PacketError> {
    let ether_type = frame.ethernet().ether_type();
    if ether_type != ARP_ETHER_TYPE {
        return Err(PacketError::NotArp(ether_type));
    }
    // The frame may have been resized since it was checked on construction.
    let payload_len = frame.ethernet().payload().len();
    if payload_len < ARP_HEADER_LEN {
        return Err(PacketError::Malformed("truncated ARP header"));
    }
    if frame.hardware_type() != ETHERNET_HARDWARE_TYPE {
        return Err(PacketError::UnsupportedHardware(frame.hardware_type()));
    }
    if frame.protocol_type() != IPV4_ETHER_TYPE {
        return Err(PacketError::UnsupportedProtocol(frame.protocol_type()));
    }
    let (hlen, plen) = (frame.hardware_addr_len(), frame.protocol_addr_len());
    if hlen != ETHERNET_ADDR_LEN || plen != IPV4_ADDR_LEN {
        return Err(PacketError::BadAddressLengths { hlen, plen });
    }
    if payload_len < ARP_HEADER_LEN + 2 * (hlen as usize + plen as usize) {
        return Err(PacketError::Malformed("truncated ARP addresses"));
    }
    let op = ArpOp::try_from(frame.opcode())
        .map_err(|_| PacketError::UnknownOpcode(frame.opcode()))?;

    // The lengths were checked above, so the typed getters cannot come back empty.
    let malformed = PacketError::Malformed("address fields out of range");
    let sender_mac = frame.sender_mac_addr().ok_or(malformed)?;
    let sender_ip = frame.sender_ipv4_addr().ok_or(malformed)?;
    let target_ip = frame.target_ipv4_addr().ok_or(malformed)?;

    if !sender_mac.is_unicast() {
        return Err(PacketError::InvalidSenderMac(sender_mac));
    }
    if sender_ip.is_unspecified() || sender_ip.is_broadcast() || sender_ip.is_multicast() {
        return Err(PacketError::InvalidSenderIp(sender_ip));
    }

    Ok(Validated {
        op,
        sender_mac,
        sender_ip,
        target_ip,
    })
}

impl Resolver {
    /// Feeds one inbound ARP frame to the resolver.
    ///
    /// Replies are always learned. Requests for our address are answered and their sender
    /// learned. Other requests follow the RFC 826 merge rule: they may update a mapping we
    /// already hold, or answer one we are waiting for, but never add a new one.
    pub fn ingest(&mut self, frame: &ArpFrame) -> Ingested {
        let packet = match validate(frame) {
            Ok(packet) if packet.sender_ip == self.classifier.subnet_broadcast() => {
                let reason = PacketError::InvalidSenderIp(packet.sender_ip);
                debug!(%reason, "dropping ARP frame");
                return Ingested::Dropped(reason);
            }
            Ok(packet) => packet,
            Err(reason) => {
                debug!(%reason, "dropping ARP frame");
                return Ingested::Dropped(reason);
            }
        };

        if packet.sender_ip == self.config.local_ip {
            if packet.sender_mac == self.config.local_mac {
                trace!("ignoring our own ARP frame");
                return Ingested::Ignored;
            }
            warn!(
                ip = %packet.sender_ip,
                mac = %packet.sender_mac,
                "ARP address conflict"
            );
            return Ingested::Dropped(PacketError::AddressConflict(packet.sender_mac));
        }

        match packet.op {
            ArpOp::Reply => {
                trace!(ip = %packet.sender_ip, mac = %packet.sender_mac, "ARP reply");
                let resolved = self.learn(packet.sender_ip, packet.sender_mac);
                Ingested::Learned {
                    ip: packet.sender_ip,
                    resolved,
                }
            }
            ArpOp::Request if packet.target_ip == self.config.local_ip => {
                trace!(ip = %packet.sender_ip, mac = %packet.sender_mac, "ARP request for us");
                let result = self
                    .emitter
                    .emit_reply(packet.sender_mac, packet.sender_ip);
                self.absorb(result);
                let resolved = self.learn(packet.sender_ip, packet.sender_mac);
                Ingested::Answered {
                    requester: packet.sender_ip,
                    resolved,
                }
            }
            ArpOp::Request => {
                if self.pending.contains(packet.sender_ip) {
                    let resolved = self.learn(packet.sender_ip, packet.sender_mac);
                    Ingested::Learned {
                        ip: packet.sender_ip,
                        resolved,
                    }
                } else if self.cache.refresh(packet.sender_ip, packet.sender_mac) {
                    trace!(ip = %packet.sender_ip, mac = %packet.sender_mac, "refreshed ARP entry");
                    Ingested::Refreshed {
                        ip: packet.sender_ip,
                    }
                } else {
                    Ingested::Ignored
                }
            }
        }
    }

    /// Like `ingest`, for a frame that has not been checked for ARP framing yet.
    pub fn ingest_ethernet(&mut self, frame: EthernetFrame) -> Ingested {
        match ArpFrame::try_from(frame) {
            Ok(arp) => self.ingest(&arp),
            Err(reason) => {
                debug!(%reason, "dropping malformed frame");
                Ingested::Dropped(PacketError::Malformed(reason))
            }
        }
    }
}
