//! # What is it for?
//!
//! The pending table tracks every address that is being resolved right now. Each entry remembers
//! how many more requests it may send, when it next needs attention, and every caller waiting on
//! it. Only the resolver core touches this table, so retry counters and deadlines have a single
//! writer.
//!
//! An entry moves through `Fresh -> AwaitingReply` and is then destroyed, either because a reply
//! resolved it or because its retries ran out. Destroying an entry always drains its waiters, so
//! every waiter hears back exactly once.

use crate::error::ResolutionError;
use route_rs_packets::MacAddr;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, trace};

pub type Resolution = Result<MacAddr, ResolutionError>;

/// Identifies one caller's attachment to a pending request.
pub type WaiterId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// Created, first request not handed to the emitter yet.
    Fresh,
    /// At least one request went out; waiting for a reply or the deadline.
    AwaitingReply,
}

struct Waiter {
    id: WaiterId,
    /// What the caller asked for. Differs from the request's target when a gateway is resolved.
    requested: Ipv4Addr,
    completion: oneshot::Sender<Resolution>,
}

impl Waiter {
    fn notify(self, resolution: Resolution) {
        // The caller may have stopped listening; that is not our problem.
        let _ = self.completion.send(resolution);
    }
}

struct PendingRequest {
    state: RequestState,
    retries_remaining: u32,
    armed_at: Instant,
    deadline: Instant,
    waiters: Vec<Waiter>,
}

/// Result of attaching a caller to the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attached {
    /// A new request was created for the target; its first packet must be sent.
    Created(WaiterId),
    /// The caller joined a request that was already in flight.
    Joined(WaiterId),
}

impl Attached {
    pub fn waiter(&self) -> WaiterId {
        match *self {
            Attached::Created(id) | Attached::Joined(id) => id,
        }
    }
}

/// What a scan of the table did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Expired {
    /// Targets whose deadline passed with retries left. Already re-armed; a request must be sent.
    pub retransmit: Vec<Ipv4Addr>,
    /// Targets that ran out of retries and were failed.
    pub failed: Vec<Ipv4Addr>,
}

pub struct PendingTable {
    requests: HashMap<Ipv4Addr, PendingRequest>,
    retry_count: u32,
    retry_interval: Duration,
    request_timeout: Duration,
    next_waiter: WaiterId,
}

impl PendingTable {
    /// `retry_count` is the total number of requests sent per address, so it must be non-zero.
    pub fn new(retry_count: u32, retry_interval: Duration, request_timeout: Duration) -> Self {
        assert!(retry_count > 0, "retry count must be non-zero");
        PendingTable {
            requests: HashMap::new(),
            retry_count,
            retry_interval,
            request_timeout,
            next_waiter: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn contains(&self, target: Ipv4Addr) -> bool {
        self.requests.contains_key(&target)
    }

    pub fn state(&self, target: Ipv4Addr) -> Option<RequestState> {
        self.requests.get(&target).map(|request| request.state)
    }

    pub fn retries_remaining(&self, target: Ipv4Addr) -> Option<u32> {
        self.requests
            .get(&target)
            .map(|request| request.retries_remaining)
    }

    pub fn waiter_count(&self, target: Ipv4Addr) -> usize {
        self.requests
            .get(&target)
            .map_or(0, |request| request.waiters.len())
    }

    /// Adds a waiter for `target`, creating the request if none is in flight. At most one request
    /// exists per target; later callers join the existing one.
    pub fn attach(
        &mut self,
        target: Ipv4Addr,
        requested: Ipv4Addr,
        completion: oneshot::Sender<Resolution>,
        now: Instant,
    ) -> Attached {
        let id = self.next_waiter;
        self.next_waiter += 1;
        let waiter = Waiter {
            id,
            requested,
            completion,
        };

        if let Some(request) = self.requests.get_mut(&target) {
            request.waiters.push(waiter);
            trace!(ip = %target, waiters = request.waiters.len(), "joined pending request");
            return Attached::Joined(id);
        }

        self.requests.insert(
            target,
            PendingRequest {
                state: RequestState::Fresh,
                retries_remaining: self.retry_count - 1,
                armed_at: now,
                deadline: now,
                waiters: vec![waiter],
            },
        );
        debug!(ip = %target, "created pending request");
        Attached::Created(id)
    }

    /// Records that the first request for `target` was handed to the emitter and arms its
    /// deadline. Does nothing for requests that already left the `Fresh` state.
    pub fn mark_sent(&mut self, target: Ipv4Addr, now: Instant) {
        let retry_interval = self.retry_interval;
        let request_timeout = self.request_timeout;
        if let Some(request) = self.requests.get_mut(&target) {
            if request.state == RequestState::Fresh {
                request.state = RequestState::AwaitingReply;
                request.arm(now, retry_interval, request_timeout);
            }
        }
    }

    /// Scans every request waiting on a reply. Expired requests with retries left are re-armed
    /// and reported for retransmission; the rest fail their waiters with a timeout.
    pub fn expire(&mut self, now: Instant) -> Expired {
        let retry_interval = self.retry_interval;
        let request_timeout = self.request_timeout;
        let mut expired = Expired::default();

        for (target, request) in self.requests.iter_mut() {
            if !request.is_due(now) {
                continue;
            }
            if request.retries_remaining > 0 {
                request.retries_remaining -= 1;
                request.arm(now, retry_interval, request_timeout);
                trace!(
                    ip = %target,
                    retries_remaining = request.retries_remaining,
                    "retrying ARP request"
                );
                expired.retransmit.push(*target);
            } else {
                expired.failed.push(*target);
            }
        }

        for target in &expired.failed {
            if let Some(request) = self.requests.remove(target) {
                debug!(ip = %target, waiters = request.waiters.len(), "ARP request timed out");
                for waiter in request.waiters {
                    let addr = waiter.requested;
                    waiter.notify(Err(ResolutionError::Timeout { addr }));
                }
            }
        }

        expired
    }

    /// Resolves the request for `target`, if any, handing `mac` to every waiter. Returns how
    /// many waiters were notified.
    pub fn complete(&mut self, target: Ipv4Addr, mac: MacAddr) -> usize {
        match self.requests.remove(&target) {
            Some(request) => {
                let notified = request.waiters.len();
                debug!(ip = %target, mac = %mac, waiters = notified, "ARP request resolved");
                for waiter in request.waiters {
                    waiter.notify(Ok(mac));
                }
                notified
            }
            None => 0,
        }
    }

    /// Detaches one waiter. A request left without waiters is torn down early. Returns whether
    /// the waiter was found.
    pub fn cancel(&mut self, target: Ipv4Addr, waiter: WaiterId) -> bool {
        let (found, orphaned) = match self.requests.get_mut(&target) {
            Some(request) => {
                let before = request.waiters.len();
                request.waiters.retain(|w| w.id != waiter);
                (request.waiters.len() != before, request.waiters.is_empty())
            }
            None => (false, false),
        };
        if orphaned {
            self.requests.remove(&target);
            trace!(ip = %target, "dropped orphaned pending request");
        }
        found
    }

    /// Fails every request in flight. `error` builds the error for each waiter from the address
    /// that waiter asked for. Returns how many waiters were notified.
    pub fn fail_all<F>(&mut self, error: F) -> usize
    where
        F: Fn(Ipv4Addr) -> ResolutionError,
    {
        let mut notified = 0;
        for (_, request) in self.requests.drain() {
            for waiter in request.waiters {
                let addr = waiter.requested;
                waiter.notify(Err(error(addr)));
                notified += 1;
            }
        }
        notified
    }
}

impl PendingRequest {
    /// The last request gets the long timeout, every earlier one the retry interval.
    fn arm(&mut self, now: Instant, retry_interval: Duration, request_timeout: Duration) {
        let wait = if self.retries_remaining > 0 {
            retry_interval
        } else {
            request_timeout
        };
        self.armed_at = now;
        self.deadline = now + wait;
    }

    // A `now` before the arm time never counts as expired.
    fn is_due(&self, now: Instant) -> bool {
        self.state == RequestState::AwaitingReply && now >= self.armed_at && now >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot::error::TryRecvError;

    const INTERVAL: Duration = Duration::from_millis(300);
    const TIMEOUT: Duration = Duration::from_millis(800);

    fn table() -> PendingTable {
        PendingTable::new(4, INTERVAL, TIMEOUT)
    }

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 1, last)
    }

    fn mac(last: u8) -> MacAddr {
        MacAddr::new([0x6a, 0x61, 0x62, 0x63, 0x64, last])
    }

    #[test]
    fn first_attach_creates_then_joins() {
        let mut table = table();
        let now = Instant::now();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();

        let first = table.attach(ip(102), ip(102), tx1, now);
        let second = table.attach(ip(102), ip(102), tx2, now);

        assert!(matches!(first, Attached::Created(_)));
        assert!(matches!(second, Attached::Joined(_)));
        assert_ne!(first.waiter(), second.waiter());
        assert_eq!(table.len(), 1);
        assert_eq!(table.waiter_count(ip(102)), 2);
        assert_eq!(table.state(ip(102)), Some(RequestState::Fresh));
    }

    #[test]
    fn fresh_requests_never_expire() {
        let mut table = table();
        let now = Instant::now();
        let (tx, _rx) = oneshot::channel();
        table.attach(ip(102), ip(102), tx, now);

        let expired = table.expire(now + TIMEOUT * 10);
        assert_eq!(expired, Expired::default());
        assert!(table.contains(ip(102)));
    }

    #[test]
    fn retries_then_timeout() {
        let mut table = table();
        let start = Instant::now();
        let (tx, mut rx) = oneshot::channel();
        table.attach(ip(103), ip(103), tx, start);
        table.mark_sent(ip(103), start);
        assert_eq!(table.retries_remaining(ip(103)), Some(3));

        // Not yet due.
        assert_eq!(table.expire(start + INTERVAL / 2), Expired::default());

        let mut now = start;
        for remaining in (0..3).rev() {
            now += INTERVAL;
            let expired = table.expire(now);
            assert_eq!(expired.retransmit, vec![ip(103)]);
            assert_eq!(table.retries_remaining(ip(103)), Some(remaining));
        }

        // The final request waits for the long timeout, not the retry interval.
        assert_eq!(table.expire(now + INTERVAL), Expired::default());
        let expired = table.expire(now + TIMEOUT);
        assert_eq!(expired.failed, vec![ip(103)]);
        assert!(table.is_empty());
        assert_eq!(
            rx.try_recv(),
            Ok(Err(ResolutionError::Timeout { addr: ip(103) }))
        );
    }

    #[test]
    fn retries_never_increase() {
        let mut table = table();
        let start = Instant::now();
        let (tx, _rx) = oneshot::channel();
        table.attach(ip(103), ip(103), tx, start);
        table.mark_sent(ip(103), start);

        let mut last = table.retries_remaining(ip(103)).unwrap();
        let mut now = start;
        while let Some(remaining) = table.retries_remaining(ip(103)) {
            assert!(remaining <= last);
            last = remaining;
            now += Duration::from_millis(100);
            table.expire(now);
            // Marking again must not re-arm or reset anything.
            table.mark_sent(ip(103), now);
        }
    }

    #[test]
    fn earlier_now_does_not_fire() {
        let mut table = table();
        let start = Instant::now() + Duration::from_secs(10);
        let (tx, _rx) = oneshot::channel();
        table.attach(ip(104), ip(104), tx, start);
        table.mark_sent(ip(104), start);

        assert_eq!(table.expire(start - Duration::from_secs(5)), Expired::default());
        assert_eq!(table.retries_remaining(ip(104)), Some(3));
    }

    #[test]
    fn one_transition_per_scan() {
        let mut table = table();
        let start = Instant::now();
        let (tx, _rx) = oneshot::channel();
        table.attach(ip(104), ip(104), tx, start);
        table.mark_sent(ip(104), start);

        // A long stall costs one retry, not all of them.
        let expired = table.expire(start + Duration::from_secs(60));
        assert_eq!(expired.retransmit, vec![ip(104)]);
        assert_eq!(table.retries_remaining(ip(104)), Some(2));
    }

    #[test]
    fn complete_notifies_every_waiter_with_its_own_address() {
        let mut table = table();
        let now = Instant::now();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        table.attach(ip(1), Ipv4Addr::new(8, 8, 8, 8), tx1, now);
        table.attach(ip(1), Ipv4Addr::new(1, 1, 1, 1), tx2, now);

        assert_eq!(table.complete(ip(1), mac(1)), 2);
        assert_eq!(rx1.try_recv(), Ok(Ok(mac(1))));
        assert_eq!(rx2.try_recv(), Ok(Ok(mac(1))));
        assert!(table.is_empty());
        assert_eq!(table.complete(ip(1), mac(1)), 0);
    }

    #[test]
    fn cancel_last_waiter_tears_down() {
        let mut table = table();
        let now = Instant::now();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        let first = table.attach(ip(5), ip(5), tx1, now).waiter();
        let second = table.attach(ip(5), ip(5), tx2, now).waiter();

        assert!(table.cancel(ip(5), first));
        assert!(!table.cancel(ip(5), first));
        assert_eq!(table.waiter_count(ip(5)), 1);
        assert_eq!(rx2.try_recv(), Err(TryRecvError::Empty));

        assert!(table.cancel(ip(5), second));
        assert!(!table.contains(ip(5)));
    }

    #[test]
    fn fail_all_drains() {
        let mut table = table();
        let now = Instant::now();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        table.attach(ip(6), ip(6), tx1, now);
        table.attach(ip(7), Ipv4Addr::new(9, 9, 9, 9), tx2, now);

        let notified = table.fail_all(|addr| ResolutionError::Cleared { addr });
        assert_eq!(notified, 2);
        assert!(table.is_empty());
        assert_eq!(
            rx1.try_recv(),
            Ok(Err(ResolutionError::Cleared { addr: ip(6) }))
        );
        assert_eq!(
            rx2.try_recv(),
            Ok(Err(ResolutionError::Cleared {
                addr: Ipv4Addr::new(9, 9, 9, 9)
            }))
        );
    }

    #[test]
    fn dropped_receiver_is_harmless() {
        let mut table = table();
        let now = Instant::now();
        let (tx, rx) = oneshot::channel();
        table.attach(ip(8), ip(8), tx, now);
        drop(rx);
        assert_eq!(table.complete(ip(8), mac(8)), 1);
    }

    #[test]
    #[should_panic]
    fn zero_retry_count_panics() {
        PendingTable::new(0, INTERVAL, TIMEOUT);
    }
}
