use crate::{EthernetFrame, MacAddr, ARP_ETHER_TYPE, IPV4_ETHER_TYPE};
use std::convert::{TryFrom, TryInto};
use std::net::{IpAddr, Ipv4Addr};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArpOp {
    Request = 1,
    Reply = 2,
}

impl TryFrom<u16> for ArpOp {
    type Error = &'static str;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(ArpOp::Request),
            2 => Ok(ArpOp::Reply),
            _ => Err("Unknown ARP opcode"),
        }
    }
}

pub enum ArpHardwareType {
    Ethernet = 1,
}

/// Size of the fixed part of the ARP header, before the variable length addresses.
const FIXED_HEADER_LEN: usize = 8;

const HARDWARE_TYPE_RANGE: (usize, usize) = (0, 2);
const PROTOCOL_TYPE_RANGE: (usize, usize) = (2, 4);
const HARDWARE_ADDR_LEN_RANGE: (usize, usize) = (4, 5);
const PROTOCOL_ADDR_LEN_RANGE: (usize, usize) = (5, 6);
const OPCODE_RANGE: (usize, usize) = (6, 8);

///
/// EthernetFrame wrapper with getters/setters for the packet structure described in RFC 826
/// https://tools.ietf.org/html/rfc826
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArpFrame {
    frame: EthernetFrame,
}

impl ArpFrame {
    ///
    /// Constructs a new, empty packet with a payload big enough for all ARP fields,
    /// given some hardware/protocol address lengths.
    ///
    pub fn new(hardware_addr_len: u8, protocol_addr_len: u8) -> Self {
        let payload_len =
            FIXED_HEADER_LEN + (2 * hardware_addr_len as usize) + (2 * protocol_addr_len as usize);
        let payload: Vec<u8> = vec![0; payload_len];

        let mut frame = EthernetFrame::empty();
        frame.set_payload(payload.as_slice());
        frame.set_ether_type(ARP_ETHER_TYPE);

        let mut arp_frame = ArpFrame { frame };
        arp_frame.set_hardware_addr_len(hardware_addr_len);
        arp_frame.set_protocol_addr_len(protocol_addr_len);
        arp_frame
    }

    /// An empty Ethernet/IPv4 ARP packet: hardware type 1, protocol type 0x0800, lengths 6 and 4.
    pub fn ethernet_ipv4() -> Self {
        let mut arp_frame = ArpFrame::new(6, 4);
        arp_frame.set_hardware_type(ArpHardwareType::Ethernet as u16);
        arp_frame.set_protocol_type(IPV4_ETHER_TYPE);
        arp_frame
    }

    ///
    /// Builds a broadcast "who has `target_ip`" request. The target hardware address is left
    /// zeroed, since it is the value being asked for.
    ///
    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        let mut arp_frame = ArpFrame::ethernet_ipv4();
        arp_frame.set_opcode(ArpOp::Request as u16);
        arp_frame.set_sender_hardware_addr(sender_mac);
        arp_frame.set_sender_protocol_addr(IpAddr::V4(sender_ip));
        arp_frame.set_target_hardware_addr(MacAddr::ZERO);
        arp_frame.set_target_protocol_addr(IpAddr::V4(target_ip));
        arp_frame.frame.set_dest_mac(MacAddr::BROADCAST);
        arp_frame.frame.set_src_mac(sender_mac);
        arp_frame
    }

    /// Builds a reply telling `target` that `sender_ip` is at `sender_mac`, unicast to `target_mac`.
    pub fn reply(
        sender_mac: MacAddr,
        sender_ip: Ipv4Addr,
        target_mac: MacAddr,
        target_ip: Ipv4Addr,
    ) -> Self {
        let mut arp_frame = ArpFrame::ethernet_ipv4();
        arp_frame.set_opcode(ArpOp::Reply as u16);
        arp_frame.set_sender_hardware_addr(sender_mac);
        arp_frame.set_sender_protocol_addr(IpAddr::V4(sender_ip));
        arp_frame.set_target_hardware_addr(target_mac);
        arp_frame.set_target_protocol_addr(IpAddr::V4(target_ip));
        arp_frame.frame.set_dest_mac(target_mac);
        arp_frame.frame.set_src_mac(sender_mac);
        arp_frame
    }

    pub fn hardware_type(&self) -> u16 {
        let (start, end) = HARDWARE_TYPE_RANGE;
        u16::from_be_bytes(self.arp_data(start, end).try_into().unwrap())
    }

    pub fn protocol_type(&self) -> u16 {
        let (start, end) = PROTOCOL_TYPE_RANGE;
        u16::from_be_bytes(self.arp_data(start, end).try_into().unwrap())
    }

    pub fn hardware_addr_len(&self) -> u8 {
        let (start, _) = HARDWARE_ADDR_LEN_RANGE;
        self.arp_data(start, start + 1)[0]
    }

    pub fn protocol_addr_len(&self) -> u8 {
        let (start, _) = PROTOCOL_ADDR_LEN_RANGE;
        self.arp_data(start, start + 1)[0]
    }

    pub fn opcode(&self) -> u16 {
        let (start, end) = OPCODE_RANGE;
        u16::from_be_bytes(self.arp_data(start, end).try_into().unwrap())
    }

    pub fn sender_hardware_addr(&self) -> &[u8] {
        let (start, end) = self.sender_hardware_addr_range();
        self.arp_data(start, end)
    }

    pub fn sender_protocol_addr(&self) -> &[u8] {
        let (start, end) = self.sender_protocol_addr_range();
        self.arp_data(start, end)
    }

    pub fn target_hardware_addr(&self) -> &[u8] {
        let (start, end) = self.target_hardware_addr_range();
        self.arp_data(start, end)
    }

    pub fn target_protocol_addr(&self) -> &[u8] {
        let (start, end) = self.target_protocol_addr_range();
        self.arp_data(start, end)
    }

    /// Sender hardware address as a `MacAddr`, if the frame carries 6 byte hardware addresses.
    pub fn sender_mac_addr(&self) -> Option<MacAddr> {
        self.sender_hardware_addr().try_into().ok().map(MacAddr::new)
    }

    /// Sender protocol address as an `Ipv4Addr`, if the frame carries 4 byte protocol addresses.
    pub fn sender_ipv4_addr(&self) -> Option<Ipv4Addr> {
        let octets: [u8; 4] = self.sender_protocol_addr().try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    pub fn target_mac_addr(&self) -> Option<MacAddr> {
        self.target_hardware_addr().try_into().ok().map(MacAddr::new)
    }

    pub fn target_ipv4_addr(&self) -> Option<Ipv4Addr> {
        let octets: [u8; 4] = self.target_protocol_addr().try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    pub fn set_hardware_type(&mut self, htype: u16) {
        let (start, end) = HARDWARE_TYPE_RANGE;
        self.set_arp_data(&htype.to_be_bytes(), start, end);
    }

    pub fn set_protocol_type(&mut self, ptype: u16) {
        let (start, end) = PROTOCOL_TYPE_RANGE;
        self.set_arp_data(&ptype.to_be_bytes(), start, end);
    }

    pub fn set_hardware_addr_len(&mut self, len: u8) {
        let (start, end) = HARDWARE_ADDR_LEN_RANGE;
        self.set_arp_data(&len.to_be_bytes(), start, end);
    }

    pub fn set_protocol_addr_len(&mut self, len: u8) {
        let (start, end) = PROTOCOL_ADDR_LEN_RANGE;
        self.set_arp_data(&len.to_be_bytes(), start, end);
    }

    pub fn set_opcode(&mut self, code: u16) {
        let (start, end) = OPCODE_RANGE;
        self.set_arp_data(&code.to_be_bytes(), start, end);
    }

    // The address setters write as many bytes as the length fields in the header declare. The
    // header lengths must match the address kinds (6 for MacAddr, 4/16 for IPv4/IPv6).
    pub fn set_sender_hardware_addr(&mut self, addr: MacAddr) {
        let (start, end) = self.sender_hardware_addr_range();
        self.set_arp_data(&addr.bytes, start, end);
    }

    pub fn set_sender_protocol_addr(&mut self, ip_addr: IpAddr) {
        let (start, _) = self.sender_protocol_addr_range();
        self.set_ip_addr(ip_addr, start);
    }

    pub fn set_target_hardware_addr(&mut self, addr: MacAddr) {
        let (start, end) = self.target_hardware_addr_range();
        self.set_arp_data(&addr.bytes, start, end);
    }

    pub fn set_target_protocol_addr(&mut self, ip_addr: IpAddr) {
        let (start, _) = self.target_protocol_addr_range();
        self.set_ip_addr(ip_addr, start);
    }

    /// The Ethernet frame this packet travels in, e.g. to read the link level source.
    pub fn ethernet(&self) -> &EthernetFrame {
        &self.frame
    }

    pub fn ethernet_mut(&mut self) -> &mut EthernetFrame {
        &mut self.frame
    }

    // Move ownership of the frame back to the caller
    pub fn frame(self) -> EthernetFrame {
        self.frame
    }

    // Returns the bytes in the ethernet frame between start and end, exclusive
    fn arp_data(&self, start: usize, end: usize) -> &[u8] {
        let frame_offset_start = self.frame.payload_offset + start;
        let frame_offset_end = self.frame.payload_offset + end;

        &self.frame.data[frame_offset_start..frame_offset_end]
    }

    fn set_arp_data(&mut self, bytes: &[u8], start: usize, end: usize) {
        let frame_offset_start = self.frame.payload_offset + start;
        let frame_offset_end = self.frame.payload_offset + end;

        self.frame.data[frame_offset_start..frame_offset_end].copy_from_slice(bytes);
    }

    fn set_ip_addr(&mut self, addr: IpAddr, start: usize) {
        match addr {
            IpAddr::V4(ipv4) => self.set_arp_data(&ipv4.octets(), start, start + 4),
            IpAddr::V6(ipv6) => self.set_arp_data(&ipv6.octets(), start, start + 16),
        };
    }

    fn sender_hardware_addr_range(&self) -> (usize, usize) {
        let hlen = self.hardware_addr_len() as usize;

        let start = FIXED_HEADER_LEN;
        let end = start + hlen;
        (start, end)
    }

    fn sender_protocol_addr_range(&self) -> (usize, usize) {
        let hlen = self.hardware_addr_len() as usize;
        let plen = self.protocol_addr_len() as usize;

        let start = FIXED_HEADER_LEN + hlen;
        let end = start + plen;
        (start, end)
    }

    fn target_hardware_addr_range(&self) -> (usize, usize) {
        let hlen = self.hardware_addr_len() as usize;
        let plen = self.protocol_addr_len() as usize;

        let start = FIXED_HEADER_LEN + hlen + plen;
        let end = start + hlen;
        (start, end)
    }

    fn target_protocol_addr_range(&self) -> (usize, usize) {
        let hlen = self.hardware_addr_len() as usize;
        let plen = self.protocol_addr_len() as usize;

        let start = FIXED_HEADER_LEN + (2 * hlen) + plen;
        let end = start + plen;
        (start, end)
    }
}

impl TryFrom<EthernetFrame> for ArpFrame {
    type Error = &'static str;

    ///
    /// Decorates the given EthernetFrame with ArpFrame getters/setters.
    /// Validates
    /// - The frame has an ARP ether type
    /// - The frame has a reasonable payload size given the hardware/protocol address lengths
    ///
    /// Ethernet pads short payloads up to 46 bytes, so trailing bytes after the target protocol
    /// address are accepted and ignored.
    ///
    fn try_from(frame: EthernetFrame) -> Result<Self, Self::Error> {
        if frame.ether_type() != ARP_ETHER_TYPE {
            return Err("Frame does not have ARP ether type.");
        };

        let arp_frame = ArpFrame { frame };
        let payload_len = arp_frame.frame.payload().len();

        if payload_len < FIXED_HEADER_LEN {
            return Err("Frame payload is too small");
        }

        let hlen = arp_frame.hardware_addr_len() as usize;
        let plen = arp_frame.protocol_addr_len() as usize;

        if payload_len < (FIXED_HEADER_LEN + (2 * hlen) + (2 * plen)) {
            return Err("Frame payload doesn't match address length fields");
        }

        Ok(arp_frame)
    }
}
