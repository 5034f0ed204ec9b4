//! Per-mapping controller: the task that negotiates, renews and tears down
//! one port mapping.
//!
//! NAT-PMP is tried first, since a single UDP round-trip either succeeds or
//! fails quickly and needs no discovery. UPnP is reached for only once
//! NAT-PMP has demonstrably failed *and* SSDP knows of a WANIPConnection:1
//! service, so networks with neither waste no work on SOAP.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::backoff::Backoff;
use crate::ssdp::{self, Registry};
use crate::{nat_pmp, upnp, Shared};

/// UPnP gateways commonly honor but do not report the granted lease, so
/// renew hourly regardless of the requested lifetime.
const UPNP_RENEW_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy)]
enum Mode {
    NatPmp,
    Upnp,
}

#[derive(Debug)]
pub(crate) struct Controller {
    pub(crate) shared: Arc<Shared>,
    /// NAT-PMP endpoints of the default gateways, in routing-table order.
    pub(crate) gateways: Vec<SocketAddrV4>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) http: reqwest::Client,
    /// Spacing between whole-protocol retries.
    pub(crate) backoff: Backoff,
    /// Retransmit schedule handed to each NAT-PMP transaction.
    pub(crate) schedule: Backoff,
}

impl Controller {
    /// Drive the mapping until it is deleted or its retries are exhausted.
    pub(crate) async fn run(mut self) {
        let mut mode = Mode::NatPmp;
        let mut tearing_down = false;
        loop {
            // nothing to undo if the mapping expired or never activated
            if tearing_down && !self.shared.is_active() {
                debug!("mapping already inactive, exiting");
                return;
            }

            let (ok, delay) = loop {
                match mode {
                    Mode::NatPmp => {
                        let ok = self.try_nat_pmp(tearing_down).await;
                        if !ok
                            && !self
                                .registry
                                .services_by_type(upnp::WANIP_CONNECTION)
                                .is_empty()
                        {
                            debug!("NAT-PMP failed and UPnP is available, switching to UPnP");
                            mode = Mode::Upnp;
                            continue;
                        }
                        // the granted lifetime was recorded by the attempt
                        break (ok, self.shared.lifetime() / 2);
                    }
                    Mode::Upnp => {
                        let services = self.registry.services_by_type(upnp::WANIP_CONNECTION);
                        if services.is_empty() {
                            debug!("UPnP not available, switching to NAT-PMP");
                            mode = Mode::NatPmp;
                            continue;
                        }
                        let ok = self.try_upnp(&services, tearing_down).await;
                        break (ok, UPNP_RENEW_INTERVAL);
                    }
                }
            };

            // when tearing down, the call just made removed the mapping
            if tearing_down {
                self.shared.set_inactive();
                self.shared.notify();
                debug!("mapping torn down, exiting");
                return;
            }

            let delay = if ok {
                self.backoff.reset();
                delay
            } else {
                let delay = self.backoff.next_delay();
                if delay.is_zero() {
                    debug!("mapping attempts exhausted, giving up");
                    self.shared.set_inactive();
                    self.shared.notify();
                    return;
                }
                delay
            };

            self.shared.notify();

            tokio::select! {
                _ = self.shared.abort_cancelled() => {
                    debug!("delete requested, tearing down");
                    tearing_down = true;
                }
                _ = tokio::time::sleep(delay) => {
                    // renew
                }
            }
        }
    }

    async fn try_nat_pmp(&self, tearing_down: bool) -> bool {
        for &gateway in &self.gateways {
            if self.try_nat_pmp_gateway(gateway, tearing_down).await {
                return true;
            }
        }
        false
    }

    async fn try_nat_pmp_gateway(&self, gateway: SocketAddrV4, tearing_down: bool) -> bool {
        let lifetime = if tearing_down {
            if !self.shared.is_active() {
                return true;
            }
            // mapping with a lifetime of zero is the delete operation
            Duration::ZERO
        } else {
            self.shared.lifetime()
        };

        let (protocol, internal_port, external_port) = self.shared.request_params();
        let (granted_port, granted_lifetime) = match nat_pmp::map_with(
            gateway,
            protocol,
            internal_port,
            external_port,
            lifetime,
            self.schedule.clone(),
        )
        .await
        {
            Ok(granted) => granted,
            Err(e) => {
                info!("NAT-PMP via {gateway} failed: {e}");
                return false;
            }
        };
        // whatever the gateway granted overrides what we asked for
        self.shared.record_grant(granted_port, granted_lifetime);
        if tearing_down {
            return true;
        }

        let expires_at = Instant::now() + granted_lifetime;
        let external_ip = match nat_pmp::external_address_with(gateway, self.schedule.clone()).await
        {
            Ok(ip) => Some(ip),
            Err(e) => {
                debug!("NAT-PMP external address query failed: {e}");
                None
            }
        };
        self.shared.activate(expires_at, external_ip);
        true
    }

    async fn try_upnp(&self, services: &[ssdp::Service], tearing_down: bool) -> bool {
        for service in services {
            if self.try_upnp_service(service, tearing_down).await {
                return true;
            }
        }
        false
    }

    async fn try_upnp_service(&self, service: &ssdp::Service, tearing_down: bool) -> bool {
        let (protocol, internal_port, external_port) = self.shared.request_params();

        if tearing_down {
            if !self.shared.is_active() {
                return true;
            }
            return match upnp::delete_port_mapping(
                &self.http,
                &service.location,
                protocol,
                external_port,
            )
            .await
            {
                Ok(()) => true,
                Err(e) => {
                    debug!("UPnP unmap via {} failed: {e}", service.location);
                    false
                }
            };
        }

        let lifetime = self.shared.lifetime();
        let name = self.shared.name();
        let granted_port = match upnp::add_port_mapping(
            &self.http,
            &service.location,
            protocol,
            internal_port,
            external_port,
            &name,
            u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX),
        )
        .await
        {
            Ok(port) => port,
            Err(e) => {
                debug!("UPnP mapping via {} failed: {e}", service.location);
                return false;
            }
        };
        self.shared.record_grant(granted_port, lifetime);
        self.shared.activate(Instant::now() + lifetime, None);

        // refresh the external address; a failure here leaves the mapping valid
        match upnp::get_external_ip(&self.http, &service.location).await {
            Ok(ip) => self.shared.set_external_ip(ip),
            Err(e) => debug!("UPnP external address query failed: {e}"),
        }
        true
    }
}
