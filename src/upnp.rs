//! UPnP IGDv1 port mapping over SOAP, for WANIPConnection:1 services.
//!
//! Given the device-description URL of a discovered gateway, these
//! operations resolve the service control URL and issue `AddPortMapping`,
//! `DeletePortMapping` and `GetExternalIPAddress` actions against it.

use std::borrow::Cow;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tracing::debug;
use url::Url;

use crate::Protocol;

/// Service type whose control endpoint can map ports on an IGDv1 gateway.
pub(crate) const WANIP_CONNECTION: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";

/// Timeout applied to every device-description GET and SOAP POST.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// SOAP error for a mapping that collides with an existing one.
const CONFLICT_IN_MAPPING_ENTRY: u16 = 718;

/// How many fresh external ports to try when the gateway reports conflicts.
const CONFLICT_RETRIES: usize = 3;

/// Errors of a single UPnP exchange.
#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gateway answered with http status {0}")]
    Status(reqwest::StatusCode),
    #[error("gateway rejected the action with UPnP error {0}")]
    Fault(u16),
    #[error("device description lists no usable WANIPConnection:1 control URL")]
    ControlUrlNotFound,
    #[error("malformed gateway response: {0}")]
    Parse(&'static str),
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// The HTTP client shared by all exchanges of one mapping.
pub(crate) fn http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()
}

/// Map `internal_port` of this host through the gateway described at
/// `location`.
///
/// An `external_port` of 0 asks for an arbitrary port, chosen uniformly in
/// [1025, 65000). `AddPortMapping` does not report the granted port, so a
/// mapping that the gateway reports as conflicting (UPnP error 718) is
/// retried with a fresh random port rather than trusted blindly. Returns the
/// external port that was accepted.
pub(crate) async fn add_port_mapping(
    http: &reqwest::Client,
    location: &Url,
    protocol: Protocol,
    internal_port: u16,
    external_port: u16,
    name: &str,
    lease_seconds: u32,
) -> Result<u16, Error> {
    let control = control_url(http, location).await?;
    let internal_client = local_ip_for(&control).await?;

    let mut port = if external_port == 0 {
        random_port()
    } else {
        external_port
    };
    for _ in 0..CONFLICT_RETRIES {
        let body = format!(
            "<u:AddPortMapping xmlns:u=\"{WANIP_CONNECTION}\">\
             <NewRemoteHost></NewRemoteHost>\
             <NewExternalPort>{port}</NewExternalPort>\
             <NewProtocol>{protocol}</NewProtocol>\
             <NewInternalPort>{internal_port}</NewInternalPort>\
             <NewInternalClient>{internal_client}</NewInternalClient>\
             <NewEnabled>1</NewEnabled>\
             <NewPortMappingDescription>{}</NewPortMappingDescription>\
             <NewLeaseDuration>{lease_seconds}</NewLeaseDuration>\
             </u:AddPortMapping>",
            xml_escape(name),
        );
        match soap_request(http, &control, "AddPortMapping", body).await {
            Ok(_) => return Ok(port),
            Err(Error::Fault(CONFLICT_IN_MAPPING_ENTRY)) => {
                debug!("external port {port} already mapped, retrying with another");
                port = random_port();
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::Fault(CONFLICT_IN_MAPPING_ENTRY))
}

/// Remove the mapping for `external_port` on the gateway at `location`.
pub(crate) async fn delete_port_mapping(
    http: &reqwest::Client,
    location: &Url,
    protocol: Protocol,
    external_port: u16,
) -> Result<(), Error> {
    let control = control_url(http, location).await?;
    let body = format!(
        "<u:DeletePortMapping xmlns:u=\"{WANIP_CONNECTION}\">\
         <NewRemoteHost></NewRemoteHost>\
         <NewExternalPort>{external_port}</NewExternalPort>\
         <NewProtocol>{protocol}</NewProtocol>\
         </u:DeletePortMapping>"
    );
    soap_request(http, &control, "DeletePortMapping", body).await?;
    Ok(())
}

/// Ask the gateway at `location` for its external IPv4 address.
pub(crate) async fn get_external_ip(
    http: &reqwest::Client,
    location: &Url,
) -> Result<Ipv4Addr, Error> {
    let control = control_url(http, location).await?;
    let body = format!("<u:GetExternalIPAddress xmlns:u=\"{WANIP_CONNECTION}\"/>");
    let response = soap_request(http, &control, "GetExternalIPAddress", body).await?;
    let ip = extract_tag(&response, "NewExternalIPAddress")
        .ok_or(Error::Parse("NewExternalIPAddress missing"))?;
    ip.trim()
        .parse()
        .map_err(|_| Error::Parse("external address is not an IPv4 address"))
}

/// Fetch the device description at `location` and resolve the control URL of
/// its WANIPConnection:1 service. Relative control URLs are resolved against
/// the description URL.
async fn control_url(http: &reqwest::Client, location: &Url) -> Result<Url, Error> {
    let response = http.get(location.clone()).send().await?;
    if response.status() != reqwest::StatusCode::OK {
        return Err(Error::Status(response.status()));
    }
    let description = response.text().await?;
    let service = description
        .find(WANIP_CONNECTION)
        .ok_or(Error::ControlUrlNotFound)?;
    let control = extract_tag(&description[service..], "controlURL")
        .ok_or(Error::ControlUrlNotFound)?;
    location
        .join(control.trim())
        .map_err(|_| Error::ControlUrlNotFound)
}

/// POST a SOAP action to `control`, returning the response body on HTTP 200.
/// Error statuses are mined for a UPnP fault code first.
async fn soap_request(
    http: &reqwest::Client,
    control: &Url,
    action: &str,
    body: String,
) -> Result<String, Error> {
    let envelope = format!(
        "<?xml version=\"1.0\"?>\
         <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
         <s:Body>{body}</s:Body></s:Envelope>"
    );
    let response = http
        .post(control.clone())
        .header("Content-Type", "text/xml; charset=\"utf-8\"")
        .header("SOAPAction", format!("\"{WANIP_CONNECTION}#{action}\""))
        .body(envelope)
        .send()
        .await?;
    let status = response.status();
    let text = response.text().await?;
    if status != reqwest::StatusCode::OK {
        if let Some(code) = extract_tag(&text, "errorCode").and_then(|c| c.trim().parse().ok()) {
            return Err(Error::Fault(code));
        }
        return Err(Error::Status(status));
    }
    Ok(text)
}

/// The local address the OS would route toward the control host, used as
/// `NewInternalClient`.
async fn local_ip_for(control: &Url) -> Result<IpAddr, Error> {
    let host = control
        .host_str()
        .ok_or(Error::Parse("control URL has no host"))?;
    let port = control.port_or_known_default().unwrap_or(80);
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect((host, port)).await?;
    Ok(socket.local_addr()?.ip())
}

fn random_port() -> u16 {
    rand::thread_rng().gen_range(1025..65000)
}

/// Content of the first `<tag>...</tag>` pair in `body`, if any.
pub(crate) fn extract_tag<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)?;
    Some(&body[start..start + end])
}

fn xml_escape(value: &str) -> Cow<'_, str> {
    if !value.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(value);
    }
    let mut escaped = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    Cow::Owned(escaped)
}
