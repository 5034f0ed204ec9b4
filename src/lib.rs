//! Automatic mapping of TCP and UDP ports via NAT-PMP or UPnP IGDv1.
//!
//! To map a port, build a [`Config`] and call [`Mapping::new`]. Negotiation
//! via NAT-PMP and, if that fails, via UPnP is attempted in the background;
//! the mapping is renewed at roughly half its negotiated lifetime, and
//! failed attempts back off exponentially. Interrogate the returned
//! [`Mapping`] to learn when the mapping becomes active, and to cancel it.
//!
//! A successful mapping is never guaranteed: a mapping that cannot be
//! established simply stays inactive, with [`Mapping::external_addr`]
//! returning the empty string. Hosts that already hold a globally routable
//! address are refused at construction time.

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::num::NonZeroU16;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

mod backoff;
mod controller;
pub mod gateway;
pub mod nat_pmp;
mod ssdp;
#[cfg(test)]
mod test_utils;
mod upnp;
mod util;

pub use backoff::Backoff;

/// Lifetime requested for mappings whose [`Config`] leaves it at zero.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60);

/// Transport protocol of a mapped port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Protocol {
    /// Map a TCP port.
    #[display("TCP")]
    Tcp = 6,
    /// Map a UDP port.
    #[display("UDP")]
    Udp = 17,
}

/// Specifies a port mapping to be created.
#[derive(Debug, Clone)]
pub struct Config {
    /// The protocol for which the port should be mapped.
    pub protocol: Protocol,
    /// A short description for the mapping. Not used in all cases; a name is
    /// generated when left empty.
    pub name: String,
    /// The port on this host to map to. Mapping ports of other hosts is not
    /// supported.
    pub internal_port: NonZeroU16,
    /// The preferred external port. Purely advisory: the gateway may
    /// allocate a different port, and 0 asks for an arbitrary one. The port
    /// actually allocated is reported through [`Mapping::external_addr`].
    pub external_port: u16,
    /// How long the gateway should hold the mapping. Renewal happens halfway
    /// through each lifetime period, so this value governs how long a
    /// mapping outlives the process if it is not deleted. Zero selects
    /// [`DEFAULT_LIFETIME`].
    pub lifetime: Duration,
    /// Spacing of retries after failed mapping attempts. The default backs
    /// off to two minutes and never gives up; a bounded schedule makes the
    /// mapping fail permanently once exhausted.
    pub backoff: Backoff,
}

impl Config {
    /// A configuration with the default name, lifetime, backoff, and an
    /// arbitrary external port.
    pub fn new(protocol: Protocol, internal_port: NonZeroU16) -> Self {
        Config {
            protocol,
            name: String::new(),
            internal_port,
            external_port: 0,
            lifetime: Duration::ZERO,
            backoff: Backoff::default(),
        }
    }
}

/// Errors surfaced when constructing a [`Mapping`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The host is on the global internet; port mapping is not required.
    #[error("machine is on global internet, port mapping not required")]
    GlobalIp,
    /// No default gateway could be discovered.
    #[error("gateway discovery failed: {0}")]
    Discovery(#[from] gateway::Error),
    /// The HTTP client for UPnP exchanges could not be constructed.
    #[error("failed to construct http client: {0}")]
    Http(#[from] reqwest::Error),
    /// A NAT-PMP transaction failed.
    #[error(transparent)]
    NatPmp(#[from] nat_pmp::Error),
}

/// A port mapping maintained in the background.
///
/// The mapping is *active* whenever [`Mapping::external_addr`] returns a
/// non-empty string; that value may change over time as gateways come and
/// go. Dropping the handle deletes the mapping.
#[derive(Debug)]
pub struct Mapping {
    shared: Arc<Shared>,
}

impl Mapping {
    /// Create a port mapping.
    ///
    /// The mapping process is continually attempted and maintained in the
    /// background; this returns without blocking on negotiation, and the
    /// mapping will generally not yet be active when it does. Subscribe to
    /// [`Mapping::notify_chan`] to learn when it becomes active.
    pub async fn new(config: Config) -> Result<Mapping, Error> {
        if let Some(ip) = global_ip() {
            debug!("host address {ip} is globally routable, refusing to map");
            return Err(Error::GlobalIp);
        }
        let gateways = gateway::ips().await?;
        Mapping::create(config, None, gateways, ssdp::Registry::global()).await
    }

    pub(crate) async fn create(
        mut config: Config,
        global_ip: Option<IpAddr>,
        gateways: Vec<Ipv4Addr>,
        registry: Arc<ssdp::Registry>,
    ) -> Result<Mapping, Error> {
        if global_ip.is_some() {
            return Err(Error::GlobalIp);
        }
        if config.lifetime.is_zero() {
            config.lifetime = DEFAULT_LIFETIME;
        }
        if config.name.is_empty() {
            config.name = format!("portmap-{:08x}", rand::random::<u32>());
        }
        let http = upnp::http_client()?;

        registry.clone().start().await;

        let shared = Arc::new(Shared::new(&config));
        let controller = controller::Controller {
            shared: shared.clone(),
            gateways: gateways
                .into_iter()
                .map(|ip| SocketAddrV4::new(ip, nat_pmp::SERVER_PORT))
                .collect(),
            registry,
            http,
            backoff: config.backoff,
            schedule: Backoff::rfc6886(),
        };
        tokio::spawn(controller.run());

        Ok(Mapping { shared })
    }

    /// A channel signalled whenever the value of
    /// [`Mapping::external_addr`] changes.
    ///
    /// Signals for intermediate values are coalesced: a consumer is
    /// guaranteed at least one signal after the latest change, and should
    /// re-read [`Mapping::external_addr`] on each one.
    pub fn notify_chan(&self) -> watch::Receiver<()> {
        self.shared.subscribe()
    }

    /// The external address of the mapping in `"ip:port"` form.
    ///
    /// Returns the empty string while the mapping is inactive. The address
    /// may not be globally routable, for example behind a double NAT. When
    /// an external port has been mapped but the external IP could not be
    /// determined, returns `":port"`.
    pub fn external_addr(&self) -> String {
        self.shared.external_addr()
    }

    /// Delete the mapping. Does not block until the mapping is destroyed;
    /// calling this more than once has no further effect.
    pub fn delete(&self) {
        self.shared.delete();
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        self.shared.delete();
    }
}

/// State shared between a [`Mapping`] handle and its controller task.
#[derive(Debug)]
pub(crate) struct Shared {
    state: Mutex<State>,
    notify_tx: watch::Sender<()>,
    /// Kept so the channel stays open (and pending signals deliverable)
    /// while no consumer is subscribed.
    notify_rx: watch::Receiver<()>,
    abort: CancellationToken,
}

#[derive(Debug)]
struct State {
    protocol: Protocol,
    name: String,
    internal_port: NonZeroU16,
    /// The requested external port until a gateway grants one, then
    /// whatever the gateway granted.
    external_port: u16,
    /// The requested lifetime until a gateway grants one.
    lifetime: Duration,
    expires_at: Option<Instant>,
    external_ip: Option<Ipv4Addr>,
    prev_notified: String,
    aborted: bool,
}

impl State {
    fn is_active(&self) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at > Instant::now())
    }
}

impl Shared {
    pub(crate) fn new(config: &Config) -> Self {
        let (notify_tx, notify_rx) = watch::channel(());
        Shared {
            state: Mutex::new(State {
                protocol: config.protocol,
                name: config.name.clone(),
                internal_port: config.internal_port,
                external_port: config.external_port,
                lifetime: config.lifetime,
                expires_at: None,
                external_ip: None,
                prev_notified: String::new(),
                aborted: false,
            }),
            notify_tx,
            notify_rx,
            abort: CancellationToken::new(),
        }
    }

    pub(crate) fn external_addr(&self) -> String {
        let state = self.state.lock().expect("poisoned");
        if !state.is_active() || state.external_port == 0 {
            return String::new();
        }
        match state.external_ip {
            Some(ip) => format!("{ip}:{}", state.external_port),
            None => format!(":{}", state.external_port),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.lock().expect("poisoned").is_active()
    }

    pub(crate) fn lifetime(&self) -> Duration {
        self.state.lock().expect("poisoned").lifetime
    }

    pub(crate) fn name(&self) -> String {
        self.state.lock().expect("poisoned").name.clone()
    }

    /// Protocol, internal port and external port for the next attempt.
    pub(crate) fn request_params(&self) -> (Protocol, u16, u16) {
        let state = self.state.lock().expect("poisoned");
        (
            state.protocol,
            state.internal_port.get(),
            state.external_port,
        )
    }

    /// Record what a gateway granted for this mapping.
    pub(crate) fn record_grant(&self, external_port: u16, lifetime: Duration) {
        let mut state = self.state.lock().expect("poisoned");
        state.external_port = external_port;
        state.lifetime = lifetime;
    }

    /// Mark the mapping live until `expires_at`, refreshing the external IP
    /// when one was learned.
    pub(crate) fn activate(&self, expires_at: Instant, external_ip: Option<Ipv4Addr>) {
        let mut state = self.state.lock().expect("poisoned");
        state.expires_at = Some(expires_at);
        if let Some(ip) = external_ip {
            state.external_ip = Some(ip);
        }
    }

    pub(crate) fn set_external_ip(&self, external_ip: Ipv4Addr) {
        self.state.lock().expect("poisoned").external_ip = Some(external_ip);
    }

    pub(crate) fn set_inactive(&self) {
        self.state.lock().expect("poisoned").expires_at = None;
    }

    /// Signal observers if the externally visible address changed since the
    /// last notification.
    pub(crate) fn notify(&self) {
        let current = self.external_addr();
        let mut state = self.state.lock().expect("poisoned");
        if state.prev_notified == current {
            return;
        }
        state.prev_notified = current;
        drop(state);
        let _ = self.notify_tx.send(());
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<()> {
        self.notify_rx.clone()
    }

    pub(crate) fn delete(&self) {
        let mut state = self.state.lock().expect("poisoned");
        if state.aborted {
            return;
        }
        state.aborted = true;
        drop(state);
        self.abort.cancel();
    }

    pub(crate) fn abort_cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.abort.cancelled()
    }
}

/// Whether this machine holds a globally routable address, making port
/// mapping unnecessary.
pub fn is_globally_routable() -> bool {
    global_ip().is_some()
}

/// Obtain the external IP address of this host.
///
/// Returns the host address directly when it is globally routable, and
/// otherwise asks each discovered gateway over NAT-PMP. Note that behind a
/// double NAT the returned address may itself be a private one; protocols
/// like STUN are better suited when a definitive answer is needed.
pub async fn external_address() -> Result<IpAddr, Error> {
    if let Some(ip) = global_ip() {
        return Ok(ip);
    }
    let gateways = gateway::ips().await?;
    let mut last_error = None;
    for gw in gateways {
        match nat_pmp::external_address(gw).await {
            Ok(ip) => return Ok(IpAddr::V4(ip)),
            Err(e) => last_error = Some(e),
        }
    }
    Err(match last_error {
        Some(e) => Error::NatPmp(e),
        None => Error::Discovery(gateway::Error::NoGateway),
    })
}

/// Address a UDP socket aimed at the public internet binds to locally.
/// Nothing is ever sent to it.
const SELF_IP_PROBE: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(4, 2, 2, 1), 53);

fn self_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(SELF_IP_PROBE).ok()?;
    Some(socket.local_addr().ok()?.ip())
}

fn global_ip() -> Option<IpAddr> {
    self_ip().filter(is_global_unicast)
}

fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => {
            !ip.is_unspecified()
                && !ip.is_loopback()
                && !ip.is_link_local()
                && !ip.is_broadcast()
                && !ip.is_private()
                && !ip.is_documentation()
        }
        // 2000::/3 is the currently allocated global unicast space
        IpAddr::V6(ip) => (ip.segments()[0] & 0xe000) == 0x2000,
    }
}
