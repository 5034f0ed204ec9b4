//! NAT-PMP request encoding and response framing, per RFC 6886.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Port on which the gateway listens for NAT-PMP requests.
pub(crate) const SERVER_PORT: u16 = 5351;

/// The only protocol version this client speaks.
pub(crate) const VERSION: u8 = 0;

/// Indicator ORd into the opcode of a response packet.
pub(crate) const RESPONSE_INDICATOR: u8 = 1 << 7;

/// Size of the fixed response header: version, opcode and result code.
pub(crate) const RESPONSE_HEADER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub(crate) enum Opcode {
    // 3.2. Determining the External Address
    DetermineExternalAddress = 0,
    // 3.3. Requesting a Mapping
    MapUdp = 1,
    MapTcp = 2,
}

/// Transport protocol for which a mapping is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MapProtocol {
    Udp,
    Tcp,
}

impl MapProtocol {
    pub(crate) fn opcode(&self) -> Opcode {
        match self {
            MapProtocol::Udp => Opcode::MapUdp,
            MapProtocol::Tcp => Opcode::MapTcp,
        }
    }
}

/// A NAT-PMP request.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Request {
    /// Ask the gateway for its external address.
    ExternalAddress,
    /// Register (or, with a lifetime of zero, remove) a port mapping.
    Mapping {
        proto: MapProtocol,
        internal_port: u16,
        /// Preferred external port; 0 lets the gateway choose.
        external_port: u16,
        lifetime_seconds: u32,
    },
}

impl Request {
    /// Opcode a response to this request must carry (without the response bit).
    pub(crate) fn opcode(&self) -> Opcode {
        match self {
            Request::ExternalAddress => Opcode::DetermineExternalAddress,
            Request::Mapping { proto, .. } => proto.opcode(),
        }
    }

    /// Encode this request as a datagram.
    pub(crate) fn encode(&self) -> Vec<u8> {
        match self {
            Request::ExternalAddress => {
                vec![VERSION, Opcode::DetermineExternalAddress.into()]
            }
            Request::Mapping {
                proto,
                internal_port,
                external_port,
                lifetime_seconds,
            } => {
                let mut buf = vec![VERSION, proto.opcode().into()];
                buf.push(0); // reserved
                buf.push(0); // reserved
                buf.extend_from_slice(&internal_port.to_be_bytes());
                buf.extend_from_slice(&external_port.to_be_bytes());
                buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
                buf
            }
        }
    }
}
