use crate::error::EmitError;
use crossbeam::crossbeam_channel::{Sender, TrySendError};
use route_rs_packets::{ArpFrame, MacAddr};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use tracing::{trace, warn};

/// Why the transport did not take a frame. The frame is handed back so it can be held.
#[derive(Debug)]
pub enum Refused {
    /// No room right now; try again later.
    Full(ArpFrame),
    /// The transport is gone for good.
    Closed(ArpFrame),
}

/// The outbound half of the link. Implementations must not block: a transport that cannot take a
/// frame right away refuses it.
pub trait Egress {
    fn offer(&mut self, frame: ArpFrame) -> Result<(), Refused>;
}

impl Egress for Sender<ArpFrame> {
    fn offer(&mut self, frame: ArpFrame) -> Result<(), Refused> {
        self.try_send(frame).map_err(|err| match err {
            TrySendError::Full(frame) => Refused::Full(frame),
            TrySendError::Disconnected(frame) => Refused::Closed(frame),
        })
    }
}

/// Builds ARP frames from the local addresses and pushes them at the transport.
///
/// Frames the transport refuses are kept in a bounded FIFO backlog and offered again, oldest
/// first, on the next emission or `flush`. Once the backlog is full new frames are dropped; the
/// retry timer of whichever request they belonged to covers the loss.
pub struct Emitter {
    local_mac: MacAddr,
    local_ip: Ipv4Addr,
    egress: Box<dyn Egress + Send>,
    backlog: VecDeque<ArpFrame>,
    backlog_capacity: usize,
    closed: bool,
}

impl Emitter {
    pub fn new(
        local_mac: MacAddr,
        local_ip: Ipv4Addr,
        egress: Box<dyn Egress + Send>,
        backlog_capacity: usize,
    ) -> Self {
        assert_ne!(backlog_capacity, 0, "emit backlog capacity must be non-zero");
        Emitter {
            local_mac,
            local_ip,
            egress,
            backlog: VecDeque::with_capacity(backlog_capacity),
            backlog_capacity,
            closed: false,
        }
    }

    /// Broadcasts a who-has for `target`.
    pub fn emit_request(&mut self, target: Ipv4Addr) -> Result<(), EmitError> {
        let frame = ArpFrame::request(self.local_mac, self.local_ip, target);
        trace!(ip = %target, "emitting ARP request");
        self.emit(frame)
    }

    /// Answers `requester_ip` at `requester_mac` with our own address.
    pub fn emit_reply(
        &mut self,
        requester_mac: MacAddr,
        requester_ip: Ipv4Addr,
    ) -> Result<(), EmitError> {
        let frame = ArpFrame::reply(self.local_mac, self.local_ip, requester_mac, requester_ip);
        trace!(ip = %requester_ip, mac = %requester_mac, "emitting ARP reply");
        self.emit(frame)
    }

    /// Offers held frames to the transport until it refuses one or the backlog is empty.
    pub fn flush(&mut self) -> Result<(), EmitError> {
        if self.closed {
            return Err(EmitError::Disconnected);
        }
        while let Some(frame) = self.backlog.pop_front() {
            match self.egress.offer(frame) {
                Ok(()) => (),
                Err(Refused::Full(frame)) => {
                    self.backlog.push_front(frame);
                    break;
                }
                Err(Refused::Closed(_)) => {
                    self.close();
                    return Err(EmitError::Disconnected);
                }
            }
        }
        Ok(())
    }

    /// Frames waiting for the transport.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn emit(&mut self, frame: ArpFrame) -> Result<(), EmitError> {
        self.flush()?;

        // Only skip the queue when nothing is ahead of us, so frames leave in order.
        let frame = if self.backlog.is_empty() {
            match self.egress.offer(frame) {
                Ok(()) => return Ok(()),
                Err(Refused::Full(frame)) => frame,
                Err(Refused::Closed(_)) => {
                    self.close();
                    return Err(EmitError::Disconnected);
                }
            }
        } else {
            frame
        };

        if self.backlog.len() >= self.backlog_capacity {
            warn!(
                capacity = self.backlog_capacity,
                "ARP emit backlog full, dropping frame"
            );
            return Err(EmitError::QueueFull {
                capacity: self.backlog_capacity,
            });
        }
        self.backlog.push_back(frame);
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            warn!(dropped = self.backlog.len(), "ARP transport closed");
        }
        self.closed = true;
        self.backlog.clear();
    }
}
