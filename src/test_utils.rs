//! Test-only helpers: captured logging and scripted protocol peers.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use url::Url;

use crate::upnp::extract_tag;
use crate::util::AbortingJoinHandle;

/// Route tracing output through the test framework's capture, so logs only
/// show up for failing tests.
pub(crate) fn setup_logging() -> tracing::subscriber::DefaultGuard {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::level_filters::LevelFilter::TRACE)
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(subscriber)
}

/// What a [`FakeNatPmpGateway`] does with requests.
#[derive(Debug, Clone, Copy)]
pub(crate) enum NatPmpBehavior {
    /// Answer mapping requests with the given grant and external-address
    /// requests with the given address. Delete requests (lifetime 0) are
    /// granted a lifetime of 0.
    Map {
        external_port: u16,
        lifetime_seconds: u32,
        external_ip: Ipv4Addr,
    },
    /// Swallow every request.
    BlackHole,
}

/// A scripted NAT-PMP gateway on a loopback ephemeral port.
#[derive(Debug)]
pub(crate) struct FakeNatPmpGateway {
    pub(crate) addr: SocketAddrV4,
    /// Every datagram the gateway received, in order.
    pub(crate) requests: mpsc::UnboundedReceiver<Vec<u8>>,
    _task: AbortingJoinHandle<()>,
}

impl FakeNatPmpGateway {
    pub(crate) async fn spawn(behavior: NatPmpBehavior) -> FakeNatPmpGateway {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = match socket.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!("bound to an ipv4 address"),
        };
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let request = buf[..len].to_vec();
                let _ = requests_tx.send(request.clone());

                let NatPmpBehavior::Map {
                    external_port,
                    lifetime_seconds,
                    external_ip,
                } = behavior
                else {
                    continue;
                };
                if len < 2 || request[0] != 0 {
                    continue;
                }
                let response = match request[1] {
                    0 => {
                        let mut response = vec![0, 0x80, 0, 0];
                        response.extend_from_slice(&1u32.to_be_bytes());
                        response.extend_from_slice(&external_ip.octets());
                        response
                    }
                    opcode @ (1 | 2) if len >= 12 => {
                        let requested_lifetime =
                            u32::from_be_bytes([request[8], request[9], request[10], request[11]]);
                        let granted = if requested_lifetime == 0 {
                            0
                        } else {
                            lifetime_seconds
                        };
                        let mut response = vec![0, 0x80 | opcode, 0, 0];
                        response.extend_from_slice(&1u32.to_be_bytes());
                        response.extend_from_slice(&request[4..6]); // internal port echoed
                        response.extend_from_slice(&external_port.to_be_bytes());
                        response.extend_from_slice(&granted.to_be_bytes());
                        response
                    }
                    _ => continue,
                };
                let _ = socket.send_to(&response, from).await;
            }
        });
        FakeNatPmpGateway {
            addr,
            requests,
            _task: task.into(),
        }
    }
}

/// Actions observed by a [`FakeIgd`].
#[derive(Debug)]
pub(crate) enum IgdEvent {
    Add {
        external_port: u16,
        protocol: String,
        lease_seconds: u32,
    },
    Delete {
        external_port: u16,
    },
    GetExternalIp,
}

#[derive(Debug)]
pub(crate) struct IgdOptions {
    /// Value served for `GetExternalIPAddress`; intentionally not
    /// necessarily a valid address.
    pub(crate) external_ip: String,
    /// Answer this many `AddPortMapping` calls with UPnP error 718 before
    /// accepting one.
    pub(crate) conflicts_before_success: usize,
}

impl Default for IgdOptions {
    fn default() -> Self {
        IgdOptions {
            external_ip: "198.51.100.9".into(),
            conflicts_before_success: 0,
        }
    }
}

/// A WANIPConnection:1 device on a loopback HTTP listener: serves a device
/// description at `/rootDesc.xml` with its control endpoint at `/ctl`.
#[derive(Debug)]
pub(crate) struct FakeIgd {
    pub(crate) location: Url,
    pub(crate) events: mpsc::UnboundedReceiver<IgdEvent>,
    _task: AbortingJoinHandle<()>,
}

impl FakeIgd {
    pub(crate) async fn spawn(options: IgdOptions) -> FakeIgd {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let location = Url::parse(&format!("http://{addr}/rootDesc.xml")).unwrap();
        let (events_tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut conflicts_left = options.conflicts_before_success;
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                serve_one(stream, &options.external_ip, &mut conflicts_left, &events_tx).await;
            }
        });
        FakeIgd {
            location,
            events,
            _task: task.into(),
        }
    }
}

const DESCRIPTION: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
<device><deviceList><device><serviceList><service>
<serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
<serviceId>urn:upnp-org:serviceId:WANIPConn1</serviceId>
<controlURL>/ctl</controlURL>
</service></serviceList></device></deviceList></device>
</root>"#;

fn envelope(inner: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\
         <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\">\
         <s:Body>{inner}</s:Body></s:Envelope>"
    )
}

/// Serve exactly one HTTP exchange, then close the connection.
async fn serve_one(
    mut stream: TcpStream,
    external_ip: &str,
    conflicts_left: &mut usize,
    events: &mpsc::UnboundedSender<IgdEvent>,
) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let Ok(len) = stream.read(&mut chunk).await else {
            return;
        };
        if len == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..len]);
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 64 * 1024 {
            return;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let Ok(len) = stream.read(&mut chunk).await else {
            return;
        };
        if len == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..len]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();

    let (status_line, response_body) = if head.starts_with("GET") {
        ("200 OK", DESCRIPTION.to_string())
    } else if body.contains("AddPortMapping") {
        let external_port = extract_tag(&body, "NewExternalPort")
            .and_then(|port| port.trim().parse().ok())
            .unwrap_or(0);
        let protocol = extract_tag(&body, "NewProtocol").unwrap_or("").to_string();
        let lease_seconds = extract_tag(&body, "NewLeaseDuration")
            .and_then(|lease| lease.trim().parse().ok())
            .unwrap_or(0);
        let _ = events.send(IgdEvent::Add {
            external_port,
            protocol,
            lease_seconds,
        });
        if *conflicts_left > 0 {
            *conflicts_left -= 1;
            (
                "500 Internal Server Error",
                envelope(
                    "<s:Fault><detail>\
                     <UPnPError xmlns=\"urn:schemas-upnp-org:control-1-0\">\
                     <errorCode>718</errorCode>\
                     <errorDescription>ConflictInMappingEntry</errorDescription>\
                     </UPnPError></detail></s:Fault>",
                ),
            )
        } else {
            ("200 OK", envelope("<u:AddPortMappingResponse/>"))
        }
    } else if body.contains("DeletePortMapping") {
        let external_port = extract_tag(&body, "NewExternalPort")
            .and_then(|port| port.trim().parse().ok())
            .unwrap_or(0);
        let _ = events.send(IgdEvent::Delete { external_port });
        ("200 OK", envelope("<u:DeletePortMappingResponse/>"))
    } else if body.contains("GetExternalIPAddress") {
        let _ = events.send(IgdEvent::GetExternalIp);
        (
            "200 OK",
            envelope(&format!(
                "<u:GetExternalIPAddressResponse>\
                 <NewExternalIPAddress>{external_ip}</NewExternalIPAddress>\
                 </u:GetExternalIPAddressResponse>"
            )),
        )
    } else {
        ("400 Bad Request", String::new())
    };

    let response = format!(
        "HTTP/1.1 {status_line}\r\n\
         Content-Type: text/xml; charset=\"utf-8\"\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{response_body}",
        response_body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
