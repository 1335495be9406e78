use crossbeam::crossbeam_channel::Receiver;
use route_rs_packets::{ArpFrame, ArpOp, MacAddr};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

/// An in-process Ethernet segment. Every peer answers broadcast requests for its own address,
/// the way a real host would.
#[derive(Default)]
pub struct Segment {
    peers: HashMap<Ipv4Addr, MacAddr>,
}

impl Segment {
    pub fn new() -> Self {
        Segment {
            peers: HashMap::new(),
        }
    }

    pub fn peer(mut self, ip: Ipv4Addr, mac: MacAddr) -> Self {
        self.peers.insert(ip, mac);
        self
    }

    /// Plugs the segment in: frames from `outbound` are seen by every peer, and their answers are
    /// delivered on `inbound`. The thread exits once the sending side of `outbound` is gone.
    pub fn attach(
        self,
        outbound: Receiver<ArpFrame>,
        inbound: UnboundedSender<ArpFrame>,
    ) -> JoinHandle<usize> {
        thread::spawn(move || {
            let mut frames = 0;
            for frame in outbound.iter() {
                frames += 1;
                if frame.opcode() != ArpOp::Request as u16 {
                    debug!(dest = %frame.ethernet().dest_mac(), "reply on the wire");
                    continue;
                }
                let (requester_mac, requester_ip, target) = match (
                    frame.sender_mac_addr(),
                    frame.sender_ipv4_addr(),
                    frame.target_ipv4_addr(),
                ) {
                    (Some(mac), Some(ip), Some(target)) => (mac, ip, target),
                    _ => continue,
                };
                if let Some(mac) = self.peers.get(&target) {
                    info!(ip = %target, mac = %mac, "peer answering");
                    let reply = ArpFrame::reply(*mac, target, requester_mac, requester_ip);
                    if inbound.send(reply).is_err() {
                        break;
                    }
                }
            }
            frames
        })
    }
}
