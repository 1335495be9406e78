use std::net::Ipv4Addr;

/// Where a packet for some IPv4 address has to go on the local link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// The target shares our subnet and is resolved directly.
    OnLink(Ipv4Addr),
    /// The target is off-subnet; the gateway's address is resolved instead.
    ViaGateway(Ipv4Addr),
    /// The directed broadcast address of our subnet.
    SubnetBroadcast,
    /// 255.255.255.255
    GeneralBroadcast,
}

impl Route {
    /// The address that actually gets resolved over ARP. Broadcasts need no resolution.
    pub fn next_hop(&self) -> Option<Ipv4Addr> {
        match *self {
            Route::OnLink(addr) | Route::ViaGateway(addr) => Some(addr),
            Route::SubnetBroadcast | Route::GeneralBroadcast => None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.next_hop().is_none()
    }
}

/// Decides how `target` is reached from a host at `local_addr`. Pure and total: every address
/// maps to exactly one route.
pub fn classify(
    target: Ipv4Addr,
    local_addr: Ipv4Addr,
    gateway_addr: Ipv4Addr,
    subnet_mask: Ipv4Addr,
) -> Route {
    let target_bits = u32::from(target);
    let local_bits = u32::from(local_addr);
    let mask_bits = u32::from(subnet_mask);

    if target == Ipv4Addr::BROADCAST {
        Route::GeneralBroadcast
    } else if target_bits == local_bits | !mask_bits {
        Route::SubnetBroadcast
    } else if target_bits & mask_bits == local_bits & mask_bits {
        Route::OnLink(target)
    } else {
        Route::ViaGateway(gateway_addr)
    }
}

/// `classify` with the local addressing captured once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubnetClassifier {
    local_addr: Ipv4Addr,
    gateway_addr: Ipv4Addr,
    subnet_mask: Ipv4Addr,
}

impl SubnetClassifier {
    pub fn new(local_addr: Ipv4Addr, gateway_addr: Ipv4Addr, subnet_mask: Ipv4Addr) -> Self {
        SubnetClassifier {
            local_addr,
            gateway_addr,
            subnet_mask,
        }
    }

    pub fn classify(&self, target: Ipv4Addr) -> Route {
        classify(target, self.local_addr, self.gateway_addr, self.subnet_mask)
    }

    pub fn subnet_broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.local_addr) | !u32::from(self.subnet_mask))
    }
}
