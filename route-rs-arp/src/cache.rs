use crate::error::ConfigError;
use route_rs_packets::MacAddr;
use std::net::Ipv4Addr;

/// One slot of the cache. A slot is either fully valid or treated as absent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub valid: bool,
}

impl Default for CacheEntry {
    fn default() -> Self {
        CacheEntry {
            ip: Ipv4Addr::UNSPECIFIED,
            mac: MacAddr::ZERO,
            valid: false,
        }
    }
}

/// A fixed size, direct-mapped IPv4 to MAC table.
///
/// Every address maps to exactly one slot, picked by the CRC-32 of its octets. There is no
/// probing: writing an address whose slot holds a different address evicts the incumbent, so
/// the newest confirmed mapping always wins its slot.
#[derive(Debug)]
pub struct ArpCache {
    slots: Vec<CacheEntry>,
    len: usize,
}

impl ArpCache {
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::ZeroCacheCapacity);
        }
        Ok(ArpCache {
            slots: vec![CacheEntry::default(); capacity],
            len: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of valid entries.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The slot `ip` lives in, whether or not it is cached.
    pub fn slot_of(&self, ip: Ipv4Addr) -> usize {
        crc32(&ip.octets()) as usize % self.slots.len()
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        let entry = &self.slots[self.slot_of(ip)];
        if entry.valid && entry.ip == ip {
            Some(entry.mac)
        } else {
            None
        }
    }

    /// Writes a confirmed mapping. Returns the entry it displaced from the slot, if that entry
    /// belonged to a different address.
    pub fn insert_or_update(&mut self, ip: Ipv4Addr, mac: MacAddr) -> Option<CacheEntry> {
        let slot = self.slot_of(ip);
        let evicted = self.evict_if_full(ip, slot);
        if !self.slots[slot].valid {
            self.len += 1;
        }
        self.slots[slot] = CacheEntry {
            ip,
            mac,
            valid: true,
        };
        evicted
    }

    /// Updates `ip` only if it is already cached. Used for traffic that may refresh a mapping
    /// but must not create one.
    pub fn refresh(&mut self, ip: Ipv4Addr, mac: MacAddr) -> bool {
        let slot = self.slot_of(ip);
        let entry = &mut self.slots[slot];
        if entry.valid && entry.ip == ip {
            entry.mac = mac;
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        for entry in self.slots.iter_mut() {
            entry.valid = false;
        }
        self.len = 0;
    }

    /// Valid entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.slots.iter().filter(|entry| entry.valid)
    }

    fn evict_if_full(&mut self, ip: Ipv4Addr, slot: usize) -> Option<CacheEntry> {
        let incumbent = self.slots[slot];
        if incumbent.valid && incumbent.ip != ip {
            self.slots[slot].valid = false;
            self.len -= 1;
            Some(incumbent)
        } else {
            None
        }
    }
}

/// CRC-32 (IEEE 802.3, reflected) of `bytes`.
fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = !0u32;
    for byte in bytes {
        crc ^= u32::from(*byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}
