use std::fmt;
use std::str::FromStr;

pub type PacketData = Vec<u8>;

pub const ARP_ETHER_TYPE: u16 = 0x0806;
pub const IPV4_ETHER_TYPE: u16 = 0x0800;

/// A 48-bit Ethernet address. Most significant byte is 0th.
#[derive(Eq, Clone, Copy, Hash, PartialEq, Default)]
pub struct MacAddr {
    pub bytes: [u8; 6],
}

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr { bytes: [0xff; 6] };
    pub const ZERO: MacAddr = MacAddr { bytes: [0; 6] };

    pub fn new(bytes: [u8; 6]) -> MacAddr {
        MacAddr { bytes }
    }

    pub fn is_zero(&self) -> bool {
        self.bytes == [0; 6]
    }

    pub fn is_broadcast(&self) -> bool {
        self.bytes == [0xff; 6]
    }

    /// The I/G bit is set for group addresses, broadcast included.
    pub fn is_multicast(&self) -> bool {
        self.bytes[0] & 0x01 != 0
    }

    /// True for addresses a station may legitimately claim as its own.
    pub fn is_unicast(&self) -> bool {
        !self.is_zero() && !self.is_multicast()
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(bytes: [u8; 6]) -> Self {
        MacAddr::new(bytes)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = &self.bytes;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MacAddr({})", self)
    }
}

impl FromStr for MacAddr {
    type Err = &'static str;

    /// Parses the usual colon (or dash) separated hex notation, e.g. `5a:51:52:53:54:55`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut octets = s.split(|c| c == ':' || c == '-');
        for byte in bytes.iter_mut() {
            let octet = octets.next().ok_or("MAC address has fewer than 6 octets")?;
            if octet.is_empty() || octet.len() > 2 {
                return Err("MAC address octet must be 1 or 2 hex digits");
            }
            *byte = u8::from_str_radix(octet, 16).map_err(|_| "MAC address octet is not hex")?;
        }
        if octets.next().is_some() {
            return Err("MAC address has more than 6 octets");
        }
        Ok(MacAddr::new(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let mac: MacAddr = "DA:D1:D2:D3:D4:D5".parse().unwrap();
        assert_eq!(mac, MacAddr::new([0xda, 0xd1, 0xd2, 0xd3, 0xd4, 0xd5]));
        assert_eq!(mac.to_string(), "da:d1:d2:d3:d4:d5");

        let dashed: MacAddr = "0-1-2-a-b-c".parse().unwrap();
        assert_eq!(dashed, MacAddr::new([0, 1, 2, 0xa, 0xb, 0xc]));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<MacAddr>().is_err());
        assert!("01:02:03:04:05".parse::<MacAddr>().is_err());
        assert!("01:02:03:04:05:06:07".parse::<MacAddr>().is_err());
        assert!("01:02:03:04:05:zz".parse::<MacAddr>().is_err());
        assert!("01:02:03:04:05:123".parse::<MacAddr>().is_err());
    }

    #[test]
    fn address_classes() {
        assert!(MacAddr::ZERO.is_zero());
        assert!(!MacAddr::ZERO.is_unicast());
        assert!(MacAddr::BROADCAST.is_broadcast());
        assert!(MacAddr::BROADCAST.is_multicast());
        assert!(MacAddr::new([0x01, 0x00, 0x5e, 0, 0, 1]).is_multicast());
        assert!(MacAddr::new([0x5a, 0x51, 0x52, 0x53, 0x54, 0x55]).is_unicast());
    }
}
