//! Default-gateway enumeration from the OS routing table.

use std::net::Ipv4Addr;

use tracing::debug;

/// Errors while locating the default gateway(s).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The routing table holds no IPv4 default gateway.
    #[error("no default gateway found")]
    NoGateway,
    /// The routing table could not be read.
    #[error("failed to read the routing table: {0}")]
    Io(#[from] std::io::Error),
}

/// IPv4 addresses of the default gateways, most-preferred first.
///
/// On Linux this parses `/proc/net/route` and collects the gateway of every
/// up gateway-route; elsewhere (and as a fallback) the platform lookup of
/// `default_net` provides the single default gateway.
pub async fn ips() -> Result<Vec<Ipv4Addr>, Error> {
    #[cfg(target_os = "linux")]
    {
        match proc_net_route_gateways().await {
            Ok(gateways) if !gateways.is_empty() => return Ok(gateways),
            Ok(_) => {}
            Err(e) => debug!("failed to read /proc/net/route: {e}"),
        }
    }
    default_gateway()
}

fn default_gateway() -> Result<Vec<Ipv4Addr>, Error> {
    match default_net::get_default_gateway() {
        Ok(gateway) => match gateway.ip_addr {
            std::net::IpAddr::V4(ip) => Ok(vec![ip]),
            std::net::IpAddr::V6(ip) => {
                debug!("ignoring IPv6 default gateway {ip}");
                Err(Error::NoGateway)
            }
        },
        Err(e) => {
            debug!("default gateway lookup failed: {e}");
            Err(Error::NoGateway)
        }
    }
}

#[cfg(target_os = "linux")]
const PROC_NET_ROUTE_PATH: &str = "/proc/net/route";
/// The max number of lines to read from /proc/net/route.
#[cfg(target_os = "linux")]
const MAX_PROC_NET_ROUTE_READ: usize = 1000;

#[cfg(target_os = "linux")]
async fn proc_net_route_gateways() -> Result<Vec<Ipv4Addr>, Error> {
    let file = tokio::fs::File::open(PROC_NET_ROUTE_PATH).await?;
    parse_proc_net_route(file).await
}

/// Collects every gateway out of:
///
/// ```norun
/// $ cat /proc/net/route
/// Iface   Destination     Gateway         Flags   RefCnt  Use     Metric  Mask            MTU     Window  IRTT
/// ens18   00000000        0100000A        0003    0       0       0       00000000        0       0       0
/// ens18   0000000A        00000000        0001    0       0       0       0000FFFF        0       0       0
/// ```
#[cfg(target_os = "linux")]
async fn parse_proc_net_route<R: tokio::io::AsyncRead + Unpin>(
    source: R,
) -> Result<Vec<Ipv4Addr>, Error> {
    use tokio::io::AsyncBufReadExt;

    let mut gateways = Vec::new();
    let mut reader = tokio::io::BufReader::new(source).lines();
    let mut line_num = 0;

    while let Some(line) = reader.next_line().await? {
        line_num += 1;
        if line_num == 1 {
            // header line
            continue;
        }
        if line_num > MAX_PROC_NET_ROUTE_READ {
            break;
        }

        let mut fields = line.split_ascii_whitespace();
        let Some(gateway_hex) = fields.nth(2) else {
            continue;
        };
        let Some(flags_hex) = fields.next() else {
            continue;
        };

        let mut flags_bytes = [0u8; 2];
        if hex::decode_to_slice(flags_hex, &mut flags_bytes).is_err() {
            continue;
        }
        let flags = u16::from_be_bytes(flags_bytes);
        if flags & (libc::RTF_UP | libc::RTF_GATEWAY) != (libc::RTF_UP | libc::RTF_GATEWAY) {
            continue;
        }

        let mut gateway_bytes = [0u8; 4];
        if hex::decode_to_slice(gateway_hex, &mut gateway_bytes).is_err() {
            continue;
        }
        let ip = Ipv4Addr::from(u32::from_le_bytes(gateway_bytes));
        if !ip.is_unspecified() && !gateways.contains(&ip) {
            gateways.push(ip);
        }
    }

    Ok(gateways)
}
