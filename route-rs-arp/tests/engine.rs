use crossbeam::crossbeam_channel::{bounded, unbounded, Receiver};
use rand::seq::SliceRandom;
use route_rs_arp::{ArpCache, ArpEngine, Ingested, PacketError, ResolutionError, ResolverConfig};
use route_rs_packets::{ArpFrame, ArpOp, MacAddr};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::runtime;
use tokio::sync::mpsc;

const LOCAL_MAC: MacAddr = MacAddr {
    bytes: [0xda, 0xd1, 0xd2, 0xd3, 0xd4, 0xd5],
};

fn local_ip() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 1, 101)
}

fn gateway_ip() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 1, 1)
}

fn peer_mac(ip: Ipv4Addr) -> MacAddr {
    let [a, b, c, d] = ip.octets();
    MacAddr::new([0x02, 0x00, a, b, c, d])
}

fn config() -> ResolverConfig {
    ResolverConfig::new(
        LOCAL_MAC,
        local_ip(),
        gateway_ip(),
        Ipv4Addr::new(255, 255, 255, 0),
    )
    .cache_capacity(64)
    .retry_count(4)
    .retry_interval(Duration::from_millis(50))
    .request_timeout(Duration::from_millis(80))
    .tick_interval(Duration::from_millis(5))
}

fn initialize_runtime() -> runtime::Runtime {
    runtime::Builder::new()
        .threaded_scheduler()
        .enable_all()
        .build()
        .unwrap()
}

/// A host on the simulated segment. It stays silent for the first `ignore` requests it sees.
#[derive(Clone, Copy)]
struct Peer {
    mac: MacAddr,
    ignore: usize,
}

impl Peer {
    fn answering(ip: Ipv4Addr) -> Self {
        Peer {
            mac: peer_mac(ip),
            ignore: 0,
        }
    }
}

/// Everything the engine put on the wire, in order.
type Wire = Arc<Mutex<Vec<ArpFrame>>>;

/// Plays every peer in `peers`: reads the engine's outbound frames, records them and answers
/// requests for peer addresses through `inject`. Exits once the engine is gone.
fn spawn_segment(
    outbound: Receiver<ArpFrame>,
    inject: mpsc::UnboundedSender<ArpFrame>,
    peers: HashMap<Ipv4Addr, Peer>,
) -> Wire {
    let wire: Wire = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&wire);
    thread::spawn(move || {
        let mut seen: HashMap<Ipv4Addr, usize> = HashMap::new();
        for frame in outbound.iter() {
            log.lock().unwrap().push(frame.clone());
            if frame.opcode() != ArpOp::Request as u16 {
                continue;
            }
            let target = frame.target_ipv4_addr().unwrap();
            if let Some(peer) = peers.get(&target) {
                let count = seen.entry(target).or_insert(0);
                *count += 1;
                if *count > peer.ignore {
                    let reply = ArpFrame::reply(peer.mac, target, LOCAL_MAC, local_ip());
                    let _ = inject.send(reply);
                }
            }
        }
    });
    wire
}

/// An engine wired to a simulated segment, plus the sender its driver reads from.
fn start(
    config: ResolverConfig,
    peers: HashMap<Ipv4Addr, Peer>,
) -> (
    ArpEngine,
    mpsc::UnboundedReceiver<ArpFrame>,
    mpsc::UnboundedSender<ArpFrame>,
    Wire,
) {
    let (to_segment, outbound) = unbounded();
    let (inject, inbound) = mpsc::unbounded_channel();
    let engine = ArpEngine::new(config, to_segment).unwrap();
    let wire = spawn_segment(outbound, inject.clone(), peers);
    (engine, inbound, inject, wire)
}

fn requests_for(wire: &Wire, target: Ipv4Addr) -> usize {
    wire.lock()
        .unwrap()
        .iter()
        .filter(|frame| frame.opcode() == ArpOp::Request as u16)
        .filter(|frame| frame.target_ipv4_addr() == Some(target))
        .count()
}

fn total_frames(wire: &Wire) -> usize {
    wire.lock().unwrap().len()
}

#[test]
fn resolves_on_link_peer_then_hits_cache() {
    let target = Ipv4Addr::new(192, 168, 1, 102);
    let mut peers = HashMap::new();
    peers.insert(target, Peer::answering(target));
    let (engine, inbound, _inject, wire) = start(config(), peers);

    let mut rt = initialize_runtime();
    let (first, second) = rt.block_on(async {
        tokio::spawn(engine.driver(inbound));
        let first = engine.resolve(target).await;
        let second = engine.resolve(target).await;
        (first, second)
    });

    assert_eq!(first, Ok(peer_mac(target)));
    assert_eq!(second, Ok(peer_mac(target)));
    assert_eq!(requests_for(&wire, target), 1);
    assert_eq!(total_frames(&wire), 1);
    assert_eq!(engine.lookup(target), Some(peer_mac(target)));
    assert_eq!(engine.pending_count(), 0);
}

#[test]
fn retries_until_peer_answers() {
    let target = Ipv4Addr::new(192, 168, 1, 102);
    let mut peers = HashMap::new();
    peers.insert(
        target,
        Peer {
            mac: peer_mac(target),
            ignore: 2,
        },
    );
    let (engine, inbound, _inject, wire) = start(config(), peers);

    let mut rt = initialize_runtime();
    let result = rt.block_on(async {
        tokio::spawn(engine.driver(inbound));
        engine.resolve(target).await
    });

    assert_eq!(result, Ok(peer_mac(target)));
    assert_eq!(requests_for(&wire, target), 3);
}

#[test]
fn silent_address_times_out_after_every_retry() {
    let target = Ipv4Addr::new(192, 168, 1, 103);
    let (engine, inbound, _inject, wire) = start(config(), HashMap::new());

    let mut rt = initialize_runtime();
    let result = rt.block_on(async {
        tokio::spawn(engine.driver(inbound));
        engine.resolve(target).await
    });

    assert_eq!(result, Err(ResolutionError::Timeout { addr: target }));
    assert_eq!(requests_for(&wire, target), 4);
    assert_eq!(engine.pending_count(), 0);
    assert_eq!(engine.lookup(target), None);
}

#[test]
fn broadcasts_never_touch_the_network() {
    let (engine, inbound, _inject, wire) = start(config(), HashMap::new());

    let mut rt = initialize_runtime();
    let results = rt.block_on(async {
        tokio::spawn(engine.driver(inbound));
        let general = engine.resolve(Ipv4Addr::BROADCAST).await;
        let subnet = engine.resolve(Ipv4Addr::new(192, 168, 1, 255)).await;
        (general, subnet)
    });

    assert_eq!(results, (Ok(MacAddr::BROADCAST), Ok(MacAddr::BROADCAST)));
    assert_eq!(total_frames(&wire), 0);
    assert_eq!(engine.pending_count(), 0);
}

#[test]
fn off_subnet_resolves_through_gateway() {
    let mut peers = HashMap::new();
    peers.insert(gateway_ip(), Peer::answering(gateway_ip()));
    let (engine, inbound, _inject, wire) = start(config(), peers);

    let mut rt = initialize_runtime();
    let result = rt.block_on(async {
        tokio::spawn(engine.driver(inbound));
        engine.resolve(Ipv4Addr::new(8, 8, 8, 8)).await
    });

    assert_eq!(result, Ok(peer_mac(gateway_ip())));
    assert_eq!(requests_for(&wire, gateway_ip()), 1);
    assert_eq!(requests_for(&wire, Ipv4Addr::new(8, 8, 8, 8)), 0);
    assert_eq!(engine.lookup(gateway_ip()), Some(peer_mac(gateway_ip())));
    assert_eq!(engine.lookup(Ipv4Addr::new(8, 8, 8, 8)), None);
}

#[test]
fn concurrent_callers_share_one_request() {
    let mut rng = rand::thread_rng();
    let mut targets: Vec<Ipv4Addr> = (2..=254)
        .filter(|n| *n != 101)
        .map(|n| Ipv4Addr::new(192, 168, 1, n))
        .collect();
    targets.shuffle(&mut rng);
    targets.truncate(6);

    let mut peers = HashMap::new();
    for target in &targets {
        peers.insert(*target, Peer::answering(*target));
    }
    // Long retry interval so the only requests on the wire are the first ones.
    let config = config().retry_interval(Duration::from_secs(5));
    let (engine, inbound, _inject, wire) = start(config, peers);

    let queries: Vec<Ipv4Addr> = (0..64)
        .map(|_| *targets.choose(&mut rng).unwrap())
        .collect();

    let mut rt = initialize_runtime();
    let results = rt.block_on(async {
        tokio::spawn(engine.driver(inbound));
        let handles: Vec<_> = queries
            .iter()
            .map(|target| {
                let engine = engine.clone();
                let target = *target;
                tokio::spawn(async move { (target, engine.resolve(target).await) })
            })
            .collect();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    });

    for (target, result) in results {
        assert_eq!(result, Ok(peer_mac(target)));
    }
    for target in &targets {
        let asked = queries.contains(target);
        assert_eq!(requests_for(&wire, *target), asked as usize, "{}", target);
    }
}

#[test]
fn malformed_frames_are_dropped() {
    let target = Ipv4Addr::new(192, 168, 1, 102);
    let mut peers = HashMap::new();
    peers.insert(
        target,
        Peer {
            mac: peer_mac(target),
            ignore: 1,
        },
    );
    let (engine, inbound, inject, wire) = start(config(), peers);

    let zero_sender = ArpFrame::reply(MacAddr::ZERO, target, LOCAL_MAC, local_ip());
    assert_eq!(
        engine.ingest(&zero_sender),
        Ingested::Dropped(PacketError::InvalidSenderMac(MacAddr::ZERO))
    );

    let mut bad_opcode = ArpFrame::reply(
        MacAddr::new([0x02, 0, 0, 0, 0, 0x09]),
        target,
        LOCAL_MAC,
        local_ip(),
    );
    bad_opcode.set_opcode(9);

    let mut rt = initialize_runtime();
    let result = rt.block_on(async {
        tokio::spawn(engine.driver(inbound));
        let pending = engine.resolve(target);
        inject.send(zero_sender).unwrap();
        inject.send(bad_opcode).unwrap();
        pending.await
    });

    // Garbage neither answered the request nor reset its retries.
    assert_eq!(result, Ok(peer_mac(target)));
    assert_eq!(requests_for(&wire, target), 2);
}

#[test]
fn colliding_addresses_evict_each_other() {
    let (to_segment, _outbound) = unbounded();
    let engine = ArpEngine::new(config().cache_capacity(2), to_segment).unwrap();

    // Same index function as the engine's cache.
    let slots = ArpCache::new(2).unwrap();
    let a = Ipv4Addr::new(192, 168, 1, 17);
    let b = (18..=254)
        .map(|n| Ipv4Addr::new(192, 168, 1, n))
        .find(|ip| slots.slot_of(*ip) != slots.slot_of(a))
        .unwrap();
    let c = (18..=254)
        .map(|n| Ipv4Addr::new(192, 168, 1, n))
        .find(|ip| *ip != b && slots.slot_of(*ip) == slots.slot_of(a))
        .unwrap();

    for ip in &[a, b, c] {
        let reply = ArpFrame::reply(peer_mac(*ip), *ip, LOCAL_MAC, local_ip());
        engine.ingest(&reply);
    }

    assert_eq!(engine.lookup(a), None);
    assert_eq!(engine.lookup(b), Some(peer_mac(b)));
    assert_eq!(engine.lookup(c), Some(peer_mac(c)));
}

#[test]
fn clearing_the_cache_fails_waiters() {
    let config = config().retry_interval(Duration::from_secs(5));
    let (engine, inbound, _inject, _wire) = start(config, HashMap::new());
    let target = Ipv4Addr::new(192, 168, 1, 102);

    let mut rt = initialize_runtime();
    let result = rt.block_on(async {
        tokio::spawn(engine.driver(inbound));
        let pending = engine.resolve(target);
        assert_eq!(engine.clear_cache(), 1);
        pending.await
    });

    assert_eq!(result, Err(ResolutionError::Cleared { addr: target }));
    assert_eq!(engine.pending_count(), 0);
}

#[test]
fn ending_the_inbound_stream_shuts_down() {
    let (to_segment, _outbound) = unbounded();
    let engine = ArpEngine::new(config(), to_segment).unwrap();
    let (inject, inbound) = mpsc::unbounded_channel::<ArpFrame>();
    let target = Ipv4Addr::new(192, 168, 1, 102);

    let mut rt = initialize_runtime();
    let result = rt.block_on(async {
        let pending = engine.resolve(target);
        let driver = tokio::spawn(engine.driver(inbound));
        drop(inject);
        driver.await.unwrap();
        pending.await
    });

    assert_eq!(result, Err(ResolutionError::Shutdown { addr: target }));
}

#[test]
fn resolve_after_the_driver_ends_fails_fast() {
    let (to_segment, outbound) = unbounded();
    let engine = ArpEngine::new(config(), to_segment).unwrap();
    let (inject, inbound) = mpsc::unbounded_channel::<ArpFrame>();
    let target = Ipv4Addr::new(192, 168, 1, 102);

    let mut rt = initialize_runtime();
    let result = rt.block_on(async {
        let driver = tokio::spawn(engine.driver(inbound));
        drop(inject);
        driver.await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), engine.resolve(target)).await
    });

    assert_eq!(
        result.expect("resolve hung after the driver ended"),
        Err(ResolutionError::Shutdown { addr: target })
    );
    assert_eq!(engine.pending_count(), 0);
    assert!(outbound.try_recv().is_err());
}

#[test]
fn stalled_transport_still_resolves() {
    // Room for one frame on the wire and one in the backlog.
    let (to_segment, outbound) = bounded(1);
    let engine = ArpEngine::new(config().emit_queue_capacity(1), to_segment).unwrap();
    let (inject, inbound) = mpsc::unbounded_channel();

    let targets: Vec<Ipv4Addr> = (102..=104).map(|n| Ipv4Addr::new(192, 168, 1, n)).collect();
    let pending: Vec<_> = targets.iter().map(|ip| engine.resolve(*ip)).collect();
    assert_eq!(engine.pending_count(), 3);

    // Only now does the segment start draining.
    let mut peers = HashMap::new();
    for target in &targets {
        peers.insert(*target, Peer::answering(*target));
    }
    let _wire = spawn_segment(outbound, inject, peers);

    let mut rt = initialize_runtime();
    let results = rt.block_on(async {
        tokio::spawn(engine.driver(inbound));
        let mut results = Vec::new();
        for resolution in pending {
            results.push(resolution.await);
        }
        results
    });

    for (target, result) in targets.iter().zip(results) {
        assert_eq!(result, Ok(peer_mac(*target)));
    }
}
