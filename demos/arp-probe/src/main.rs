mod segment;

use clap::{App, Arg, ArgMatches};
use crossbeam::crossbeam_channel;
use futures::future::join_all;
use route_rs_arp::{ArpEngine, ResolverConfig};
use route_rs_packets::MacAddr;
use segment::Segment;
use std::net::Ipv4Addr;
use std::process;
use std::str::FromStr;
use std::time::Duration;
use tokio::runtime;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

fn main() {
    // RUST_LOG overrides the default of warnings only
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Collect arguments from user
    let matches = App::new("ARP Probe")
        .version("0.1")
        .author("Route-rs Contributors")
        .about("Resolve IPv4 addresses with the route-rs ARP engine on a simulated segment")
        .arg(Arg::with_name("local_mac")
             .long("local-mac")
             .value_name("MAC")
             .help("Link address of this host")
             .required(true)
             .takes_value(true))
        .arg(Arg::with_name("local_ip")
             .long("local-ip")
             .value_name("IP")
             .help("IPv4 address of this host")
             .required(true)
             .takes_value(true))
        .arg(Arg::with_name("gateway")
             .long("gateway")
             .value_name("IP")
             .help("Default gateway for off-subnet targets")
             .required(true)
             .takes_value(true))
        .arg(Arg::with_name("netmask")
             .long("netmask")
             .value_name("MASK")
             .help("Subnet mask, e.g. 255.255.255.0")
             .required(true)
             .takes_value(true))
        .arg(Arg::with_name("cache_size")
             .long("cache-size")
             .value_name("SLOTS")
             .help("ARP cache slots")
             .takes_value(true))
        .arg(Arg::with_name("retries")
             .long("retries")
             .value_name("COUNT")
             .help("Requests sent per address before giving up")
             .takes_value(true))
        .arg(Arg::with_name("retry_interval_ms")
             .long("retry-interval-ms")
             .value_name("MS")
             .help("Wait between requests for the same address")
             .takes_value(true))
        .arg(Arg::with_name("timeout_ms")
             .long("timeout-ms")
             .value_name("MS")
             .help("Wait after the last request")
             .takes_value(true))
        .arg(Arg::with_name("peer")
             .long("peer")
             .value_name("IP=MAC")
             .help("A host on the simulated segment; may be repeated")
             .multiple(true)
             .number_of_values(1)
             .takes_value(true))
        .arg(Arg::with_name("targets")
             .value_name("TARGET")
             .help("Addresses to resolve")
             .required(true)
             .multiple(true))
        .get_matches();

    let config = match build_config(&matches) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(2);
        }
    };
    let segment = match build_segment(&matches) {
        Ok(segment) => segment,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(2);
        }
    };
    let targets: Vec<Ipv4Addr> = match matches
        .values_of("targets")
        .into_iter()
        .flatten()
        .map(|target| parse::<Ipv4Addr>("target", target))
        .collect()
    {
        Ok(targets) => targets,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(2);
        }
    };

    let (to_segment, outbound) = crossbeam_channel::unbounded();
    let (to_engine, inbound) = mpsc::unbounded_channel();
    let engine = match ArpEngine::new(config, to_segment) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("invalid configuration: {}", err);
            process::exit(2);
        }
    };
    segment.attach(outbound, to_engine);

    let mut rt = match runtime::Builder::new()
        .threaded_scheduler()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start runtime: {}", err);
            process::exit(1);
        }
    };

    let results = rt.block_on(async {
        tokio::spawn(engine.driver(inbound));
        join_all(targets.iter().map(|target| engine.resolve(*target))).await
    });

    let mut failed = false;
    for (target, result) in targets.iter().zip(results) {
        match result {
            Ok(mac) => println!("{} is at {}", target, mac),
            Err(err) => {
                failed = true;
                println!("{}: {}", target, err);
            }
        }
    }
    if failed {
        process::exit(1);
    }
}

fn parse<T: FromStr>(what: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid {}: {}", what, value))
}

fn build_config(matches: &ArgMatches) -> Result<ResolverConfig, String> {
    // Required arguments are enforced by clap.
    let required = |name: &str| matches.value_of(name).unwrap_or_default();

    let mut config = ResolverConfig::new(
        parse::<MacAddr>("local MAC", required("local_mac"))?,
        parse("local IP", required("local_ip"))?,
        parse("gateway", required("gateway"))?,
        parse("netmask", required("netmask"))?,
    );
    if let Some(slots) = matches.value_of("cache_size") {
        config = config.cache_capacity(parse("cache size", slots)?);
    }
    if let Some(count) = matches.value_of("retries") {
        config = config.retry_count(parse("retry count", count)?);
    }
    if let Some(ms) = matches.value_of("retry_interval_ms") {
        config = config.retry_interval(Duration::from_millis(parse("retry interval", ms)?));
    }
    if let Some(ms) = matches.value_of("timeout_ms") {
        config = config.request_timeout(Duration::from_millis(parse("timeout", ms)?));
    }
    config.validate().map_err(|err| format!("invalid configuration: {}", err))?;
    Ok(config)
}

fn build_segment(matches: &ArgMatches) -> Result<Segment, String> {
    let mut segment = Segment::new();
    for peer in matches.values_of("peer").into_iter().flatten() {
        let mut parts = peer.splitn(2, '=');
        let ip = parts.next().unwrap_or_default();
        let mac = parts
            .next()
            .ok_or_else(|| format!("peer {} is not IP=MAC", peer))?;
        segment = segment.peer(parse("peer IP", ip)?, parse("peer MAC", mac)?);
    }
    Ok(segment)
}
