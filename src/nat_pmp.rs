//! Single-transaction NAT-PMP client (RFC 6886).
//!
//! These are low-level operations: one request, one validated response, no
//! renewal. The mapping controller is responsible for keeping a mapping
//! alive.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::trace;

use crate::backoff::Backoff;
use crate::Protocol;

mod protocol;

pub(crate) use protocol::SERVER_PORT;
use protocol::{MapProtocol, Request, RESPONSE_HEADER_SIZE, RESPONSE_INDICATOR, VERSION};

/// Receive buffer size; NAT-PMP responses are at most 16 bytes.
const RECV_BUFFER_SIZE: usize = 64;

/// Errors of a single NAT-PMP transaction.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The retransmission schedule was exhausted without a valid response.
    #[error("request timed out")]
    Timeout,
    /// The gateway answered with a nonzero result code.
    #[error("gateway responded with nonzero result code {0}")]
    Gateway(u16),
    /// The response was well-formed but its payload is too short.
    #[error("response payload too short")]
    ShortResponse,
    /// The socket failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Protocol> for MapProtocol {
    fn from(value: Protocol) -> Self {
        match value {
            Protocol::Tcp => MapProtocol::Tcp,
            Protocol::Udp => MapProtocol::Udp,
        }
    }
}

/// Perform one NAT-PMP transaction against `gateway`.
///
/// The request datagram is retransmitted on the given schedule, and each
/// schedule delay also serves as the receive deadline for that attempt;
/// datagrams that do not parse as a matching response from the gateway are
/// discarded without consuming the attempt. Returns the response bytes after
/// the four-byte header (result code already checked).
async fn make_request(
    gateway: SocketAddrV4,
    request: Request,
    mut schedule: Backoff,
) -> Result<Vec<u8>, Error> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(gateway).await?;

    let msg = request.encode();
    let expected_opcode = u8::from(request.opcode()) | RESPONSE_INDICATOR;
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    schedule.reset();
    loop {
        let delay = schedule.next_delay();
        if delay.is_zero() {
            return Err(Error::Timeout);
        }
        let deadline = tokio::time::Instant::now() + delay;

        socket.send(&msg).await?;

        // keep reading within this attempt's deadline window, dropping
        // datagrams that are not the response we asked for
        loop {
            let (len, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Err(_) => break, // deadline elapsed, retransmit
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(received)) => received,
            };
            if from != SocketAddr::V4(gateway) {
                trace!("dropping datagram from unexpected source {from}");
                continue;
            }
            let response = &buf[..len];
            if len < RESPONSE_HEADER_SIZE
                || response[0] != VERSION
                || response[1] != expected_opcode
            {
                trace!("dropping datagram that is not a matching response");
                continue;
            }
            let result_code = u16::from_be_bytes([response[2], response[3]]);
            if result_code != 0 {
                return Err(Error::Gateway(result_code));
            }
            return Ok(response[RESPONSE_HEADER_SIZE..].to_vec());
        }
    }
}

/// Ask the default gateway at `gateway` for its external IPv4 address.
pub async fn external_address(gateway: Ipv4Addr) -> Result<Ipv4Addr, Error> {
    external_address_with(
        SocketAddrV4::new(gateway, SERVER_PORT),
        Backoff::rfc6886(),
    )
    .await
}

pub(crate) async fn external_address_with(
    gateway: SocketAddrV4,
    schedule: Backoff,
) -> Result<Ipv4Addr, Error> {
    let payload = make_request(gateway, Request::ExternalAddress, schedule).await?;
    parse_external_address_payload(&payload)
}

/// Perform a single Map Port transaction.
///
/// If `external_port` is 0 the gateway chooses a port. A `lifetime` of zero
/// removes the mapping, per RFC 6886. Returns the externally mapped port and
/// the lifetime actually granted by the gateway, which the caller must
/// respect when scheduling renewal.
pub async fn map(
    gateway: Ipv4Addr,
    protocol: Protocol,
    internal_port: u16,
    external_port: u16,
    lifetime: Duration,
) -> Result<(u16, Duration), Error> {
    map_with(
        SocketAddrV4::new(gateway, SERVER_PORT),
        protocol,
        internal_port,
        external_port,
        lifetime,
        Backoff::rfc6886(),
    )
    .await
}

pub(crate) async fn map_with(
    gateway: SocketAddrV4,
    protocol: Protocol,
    internal_port: u16,
    external_port: u16,
    lifetime: Duration,
    schedule: Backoff,
) -> Result<(u16, Duration), Error> {
    let request = Request::Mapping {
        proto: protocol.into(),
        internal_port,
        external_port,
        lifetime_seconds: u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX),
    };
    let payload = make_request(gateway, request, schedule).await?;
    parse_map_payload(&payload)
}

/// Payload of a mapping response: epoch, internal port, external port,
/// granted lifetime.
fn parse_map_payload(payload: &[u8]) -> Result<(u16, Duration), Error> {
    if payload.len() < 12 {
        return Err(Error::ShortResponse);
    }
    // payload[0..4] is the seconds-since-epoch field
    let external_port = u16::from_be_bytes([payload[6], payload[7]]);
    let lifetime_seconds = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
    Ok((external_port, Duration::from_secs(lifetime_seconds.into())))
}

/// Payload of an external-address response: epoch, then the IPv4 address.
fn parse_external_address_payload(payload: &[u8]) -> Result<Ipv4Addr, Error> {
    if payload.len() < 8 {
        return Err(Error::ShortResponse);
    }
    Ok(Ipv4Addr::new(payload[4], payload[5], payload[6], payload[7]))
}
