//! SSDP discovery registry.
//!
//! One registry per process: the first mapping to start lazily spawns a
//! broadcast task that multicasts an M-SEARCH every minute, and a receive
//! task that folds answering beacons into a table keyed by USN. Entries age
//! out after three missed broadcast intervals.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use tokio::net::UdpSocket;
use tracing::{debug, trace};
use url::Url;

use crate::util::AbortingJoinHandle;

/// Interval at which discovery beacons are sent.
pub(crate) const BROADCAST_INTERVAL: Duration = Duration::from_secs(60);

/// Services unseen for three broadcast intervals are considered gone.
const FRESHNESS_INTERVALS: u32 = 3;

const SSDP_MULTICAST_ADDR: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900);

const SEARCH_REQUEST: &[u8] = b"M-SEARCH * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
ST: ssdp:all\r\n\
MAN: \"ssdp:discover\"\r\n\
MX: 2\r\n\r\n";

/// A service discovered via SSDP.
#[derive(Debug, Clone)]
pub(crate) struct Service {
    /// Unique serial number of the service; the registry key.
    pub(crate) usn: String,
    /// Service type string.
    pub(crate) st: String,
    /// Device description URL.
    pub(crate) location: Url,
    /// When a beacon for this service was last seen.
    pub(crate) last_seen: Instant,
}

/// Freshness-windowed table of discovered services.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    services: Mutex<HashMap<String, Service>>,
    tasks: tokio::sync::OnceCell<Vec<AbortingJoinHandle<()>>>,
}

static GLOBAL: OnceCell<Arc<Registry>> = OnceCell::new();

impl Registry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Registry::default())
    }

    /// The process-wide registry shared by all mappings.
    pub(crate) fn global() -> Arc<Registry> {
        GLOBAL.get_or_init(Registry::new).clone()
    }

    /// Start the broadcast and receive tasks. Idempotent: calls after the
    /// first are no-ops, and a failure to bind the discovery socket is
    /// recorded once and not retried.
    pub(crate) async fn start(self: Arc<Self>) {
        let registry = Arc::downgrade(&self);
        self.tasks
            .get_or_init(|| async move {
                match spawn_tasks(registry).await {
                    Ok(tasks) => tasks,
                    Err(e) => {
                        debug!("SSDP discovery unavailable: {e}");
                        Vec::new()
                    }
                }
            })
            .await;
    }

    /// All fresh services whose service type matches `st`.
    pub(crate) fn services_by_type(&self, st: &str) -> Vec<Service> {
        self.services_by_type_at(st, Instant::now())
    }

    fn services_by_type_at(&self, st: &str, now: Instant) -> Vec<Service> {
        let limit = now.checked_sub(BROADCAST_INTERVAL * FRESHNESS_INTERVALS);
        let services = self.services.lock().expect("poisoned");
        services
            .values()
            .filter(|service| service.st == st)
            .filter(|service| match limit {
                Some(limit) => service.last_seen > limit,
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Record a beacon, inserting or refreshing the entry for its USN.
    pub(crate) fn observe(&self, usn: String, st: String, location: Url, now: Instant) {
        let mut services = self.services.lock().expect("poisoned");
        services.insert(
            usn.clone(),
            Service {
                usn,
                st,
                location,
                last_seen: now,
            },
        );
    }
}

async fn spawn_tasks(
    registry: Weak<Registry>,
) -> std::io::Result<Vec<AbortingJoinHandle<()>>> {
    let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?);
    let broadcast = tokio::spawn(broadcast_loop(socket.clone()));
    let receive = tokio::spawn(receive_loop(socket, registry));
    Ok(vec![broadcast.into(), receive.into()])
}

/// Multicast the M-SEARCH beacon once per interval, best-effort.
async fn broadcast_loop(socket: Arc<UdpSocket>) {
    let mut ticker = tokio::time::interval(BROADCAST_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(e) = socket.send_to(SEARCH_REQUEST, SSDP_MULTICAST_ADDR).await {
            trace!("SSDP search send failed: {e}");
        }
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, registry: Weak<Registry>) {
    let mut buf = vec![0u8; 2048];
    loop {
        let len = match socket.recv_from(&mut buf).await {
            Ok((len, _)) => len,
            Err(e) => {
                debug!("SSDP receive failed: {e}");
                return;
            }
        };
        let Some(registry) = registry.upgrade() else {
            return;
        };
        if let Some((usn, st, location)) = parse_beacon(&buf[..len]) {
            trace!(%usn, %st, %location, "SSDP beacon");
            registry.observe(usn, st, location, Instant::now());
        }
    }
}

/// Parse a datagram as an HTTP response carrying an SSDP beacon.
///
/// Requires status 200, a non-empty `ST` and a parseable `LOCATION`; an
/// absent or empty `USN` falls back to the location string.
fn parse_beacon(datagram: &[u8]) -> Option<(String, String, Url)> {
    let text = std::str::from_utf8(datagram).ok()?;
    let mut lines = text.split("\r\n");

    let mut status = lines.next()?.split_ascii_whitespace();
    if !status.next()?.starts_with("HTTP/") {
        return None;
    }
    if status.next()? != "200" {
        return None;
    }

    let mut st = None;
    let mut location = None;
    let mut usn = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("st") {
            st = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("location") {
            location = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("usn") {
            usn = Some(value.to_string());
        }
    }

    let st = st.filter(|st| !st.is_empty())?;
    let location = Url::parse(&location?).ok()?;
    let usn = match usn {
        Some(usn) if !usn.is_empty() => usn,
        _ => location.to_string(),
    };
    Some((usn, st, location))
}
