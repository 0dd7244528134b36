//! UPnP IGD (Internet Gateway Device) client.
//!
//! Unlike NAT-PMP/PCP, UPnP discovery is multicast, so there's no
//! candidate-wave fan-out here — a single SSDP query reaches every router
//! on the segment at once. The three phases (discover, describe, control)
//! are hand-rolled against [`NetCapability`] rather than delegated to a
//! higher-level UPnP crate, since the discovery/extraction/SOAP sequence
//! is itself the thing this client exists to implement. Device-description
//! and SOAP-fault XML parsing uses `roxmltree`, the same crate the
//! `paritytech/upnp-igdp` client in the retrieval pack uses for the same
//! purpose.

use std::time::Duration;

use roxmltree::Document;
use tracing::{debug, warn};
use url::Url;

use crate::error::MappingError;
use crate::net::NetCapability;

const SSDP_SEARCH_WINDOW: Duration = Duration::from_secs(1);
const SERVICE_TYPE: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";

fn build_search_request() -> Vec<u8> {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 2\r\n\
         ST: {SERVICE_TYPE}\r\n\r\n"
    )
    .into_bytes()
}

/// Pull the `LOCATION:` header out of a raw SSDP unicast reply. These
/// replies are a bare HTTP/1.1 status line plus headers, no body, so a
/// line-oriented scan is all that's needed.
fn extract_location(reply: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(reply);
    for line in text.lines() {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("location") {
            return Some(value.trim().to_string());
        }
    }
    None
}

/// Find the `WANIPConnection` service's `controlURL` in a device
/// description document, resolved against `location`.
fn extract_control_url(description_xml: &str, location: &Url) -> Option<Url> {
    let doc = Document::parse(description_xml).ok()?;
    for service in doc.descendants().filter(|n| n.has_tag_name("service")) {
        let service_type = service
            .children()
            .find(|c| c.has_tag_name("serviceType"))
            .and_then(|n| n.text());
        if service_type != Some(SERVICE_TYPE) {
            continue;
        }
        let control_url = service
            .children()
            .find(|c| c.has_tag_name("controlURL"))
            .and_then(|n| n.text())?;
        if let Ok(absolute) = Url::parse(control_url) {
            return Some(absolute);
        }
        return location.join(control_url).ok();
    }
    None
}

/// SSDP discover, then fetch each LOCATION's device description until one
/// yields a parseable `WANIPConnection` control URL.
pub(crate) async fn discover_control_url(net: &dyn NetCapability) -> Result<Url, MappingError> {
    let group = "239.255.255.250:1900"
        .parse()
        .map_err(|_| MappingError::Internal("invalid SSDP multicast address".into()))?;
    let request = build_search_request();
    let replies = net.udp_multicast_search(group, &request, SSDP_SEARCH_WINDOW).await?;
    debug!(replies = replies.len(), "SSDP M-SEARCH collected replies");

    let locations: Vec<String> = replies.iter().filter_map(|r| extract_location(r)).collect();
    if locations.is_empty() {
        return Err(MappingError::NoGateway);
    }

    for location in locations {
        let Ok(location_url) = Url::parse(&location) else { continue };
        let body = match net.http_get(&location).await {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, location, "failed to fetch device description");
                continue;
            }
        };
        if let Some(control_url) = extract_control_url(&body, &location_url) {
            return Ok(control_url);
        }
    }
    Err(MappingError::NoGateway)
}

fn soap_envelope(action: &str, args: &[(&str, String)]) -> String {
    let body: String = args
        .iter()
        .map(|(name, value)| format!("<{name}>{}</{name}>", xml_escape(value)))
        .collect();
    format!(
        "<?xml version=\"1.0\"?>\
         <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
         <s:Body><u:{action} xmlns:u=\"{SERVICE_TYPE}\">{body}</u:{action}></s:Body>\
         </s:Envelope>"
    )
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Parse a SOAP fault's `<errorDescription>` out of a response body, if
/// the response is a fault.
fn parse_soap_fault(body: &str) -> Option<String> {
    let doc = Document::parse(body).ok()?;
    doc.descendants()
        .find(|n| n.has_tag_name("errorDescription"))
        .and_then(|n| n.text())
        .map(str::to_string)
}

/// Result of a successful `AddPortMapping` call.
pub(crate) struct AddResult {
    pub control_url: Url,
}

/// Add a mapping via `AddPortMapping`. `lifetime == 0` is passed through
/// as `NewLeaseDuration=0`, which UPnP treats as "static"; the 24 h
/// refresh cadence for that case is the orchestrator's concern, not
/// this client's.
pub(crate) async fn add_mapping(
    net: &dyn NetCapability,
    control_url: &Url,
    internal_ip: &str,
    internal_port: u16,
    external_port: u16,
    lifetime: u32,
) -> Result<AddResult, MappingError> {
    let args = [
        ("NewRemoteHost", String::new()),
        ("NewExternalPort", external_port.to_string()),
        ("NewProtocol", "TCP".to_string()),
        ("NewInternalPort", internal_port.to_string()),
        ("NewInternalClient", internal_ip.to_string()),
        ("NewEnabled", "1".to_string()),
        ("NewPortMappingDescription", "PortControl".to_string()),
        ("NewLeaseDuration", lifetime.to_string()),
    ];
    let body = soap_envelope("AddPortMapping", &args);
    let soap_action = format!("{SERVICE_TYPE}#AddPortMapping");

    let response = net.http_post_soap(control_url.as_str(), &soap_action, &body).await?;
    if let Some(fault) = parse_soap_fault(&response) {
        return Err(MappingError::GatewayError(fault));
    }
    Ok(AddResult { control_url: control_url.clone() })
}

/// Remove a mapping via `DeletePortMapping`.
pub(crate) async fn delete_mapping(
    net: &dyn NetCapability,
    control_url: &Url,
    external_port: u16,
) -> Result<(), MappingError> {
    let args = [
        ("NewRemoteHost", String::new()),
        ("NewExternalPort", external_port.to_string()),
        ("NewProtocol", "TCP".to_string()),
    ];
    let body = soap_envelope("DeletePortMapping", &args);
    let soap_action = format!("{SERVICE_TYPE}#DeletePortMapping");

    let response = net.http_post_soap(control_url.as_str(), &soap_action, &body).await?;
    if let Some(fault) = parse_soap_fault(&response) {
        warn!(fault, "UPnP DeletePortMapping returned a fault");
        return Err(MappingError::GatewayError(fault));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_location_header_case_insensitively() {
        let reply = b"HTTP/1.1 200 OK\r\nST: upnp:rootdevice\r\nLocation: http://192.168.1.1:5000/desc.xml\r\n\r\n";
        assert_eq!(
            extract_location(reply).as_deref(),
            Some("http://192.168.1.1:5000/desc.xml")
        );
    }

    #[test]
    fn missing_location_header_returns_none() {
        let reply = b"HTTP/1.1 200 OK\r\nST: upnp:rootdevice\r\n\r\n";
        assert!(extract_location(reply).is_none());
    }

    #[test]
    fn extracts_control_url_for_matching_service() {
        let xml = r#"<root xmlns="urn:schemas-upnp-org:device-1-0">
            <device>
                <serviceList>
                    <service>
                        <serviceType>urn:schemas-upnp-org:service:Layer3Forwarding:1</serviceType>
                        <controlURL>/wrong</controlURL>
                    </service>
                    <service>
                        <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
                        <controlURL>/upnp/control/WANIPConn1</controlURL>
                    </service>
                </serviceList>
            </device>
        </root>"#;
        let base = Url::parse("http://192.168.1.1:5000/desc.xml").unwrap();
        let control = extract_control_url(xml, &base).unwrap();
        assert_eq!(control.path(), "/upnp/control/WANIPConn1");
        assert_eq!(control.host_str(), Some("192.168.1.1"));
    }

    #[test]
    fn soap_envelope_wraps_action_with_args() {
        let body = soap_envelope("AddPortMapping", &[("NewExternalPort", "4000".to_string())]);
        assert!(body.contains("<u:AddPortMapping"));
        assert!(body.contains("<NewExternalPort>4000</NewExternalPort>"));
    }

    #[test]
    fn parses_soap_fault_description() {
        let body = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
            <s:Body><s:Fault><detail><UPnPError>
            <errorDescription>ConflictInMappingEntry</errorDescription>
            </UPnPError></detail></s:Fault></s:Body></s:Envelope>"#;
        assert_eq!(parse_soap_fault(body).as_deref(), Some("ConflictInMappingEntry"));
    }

    #[test]
    fn successful_response_has_no_fault() {
        let body = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
            <s:Body><u:AddPortMappingResponse/></s:Body></s:Envelope>"#;
        assert!(parse_soap_fault(body).is_none());
    }
}
