//! PCP (Port Control Protocol, RFC 6887) codec and client.
//!
//! PCP's MAP request is fixed at 60 bytes and, unlike NAT-PMP, carries a
//! client-chosen nonce that must be reused unchanged on delete, plus the
//! router's assigned external address in the response — no separate probe
//! is needed the way NAT-PMP needs one.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::candidates::CandidateWaves;
use crate::codec::{build_buffer, read_u16, read_u32, read_u8, Field};
use crate::error::MappingError;
use crate::ip_util::longest_prefix_match;
use crate::net::NetCapability;

pub(crate) const PCP_SERVER_PORT: u16 = 5351;
const PCP_VERSION: u8 = 2;
const PCP_TIMEOUT: Duration = Duration::from_secs(2);
const MAP_OPCODE: u8 = 1;

/// Protocol byte for the MAP request's internal/external port pair.
/// Hard-coded to UDP (17, per RFC 6887 §11.1's IANA protocol numbers):
/// `add_mapping`'s public signature has no per-call protocol parameter,
/// so this client only ever requests UDP mappings. See DESIGN.md for why
/// TCP was left out of scope rather than threaded through as a choice.
const MAP_PROTOCOL_UDP: u8 = 17;

fn build_map_request(client_ip: Ipv4Addr, nonce: &[u8; 12], internal_port: u16, suggested_external_port: u16, lifetime: u32) -> Vec<u8> {
    let mut fields = vec![
        Field::u8(0, PCP_VERSION),
        Field::u8(1, MAP_OPCODE),
        Field::u32(4, lifetime),
        // Client IP, IPv4-mapped IPv6: 10 zero bytes, then 0xffff at
        // offset 18, then the 4 octets at offset 20..23.
        Field::u16(18, 0xffff),
        Field::u8(36, MAP_PROTOCOL_UDP),
        Field::u16(40, internal_port),
        Field::u16(42, suggested_external_port),
        // Suggested external address: 0xffff at offset 54 marks
        // IPv4-mapped; left as all-zero octets (no suggestion).
        Field::u16(54, 0xffff),
    ];
    let octets = client_ip.octets();
    for (i, byte) in octets.iter().enumerate() {
        fields.push(Field::u8(20 + i, *byte));
    }

    let mut buf = build_buffer(60, &fields);
    buf[24..36].copy_from_slice(nonce);
    buf
}

struct MapResponse {
    result_code: u8,
    lifetime: u32,
    external_port: u16,
    external_ip: Ipv4Addr,
    nonce: [u8; 12],
}

fn parse_map_response(buf: &[u8]) -> Result<MapResponse, MappingError> {
    if buf.len() < 60 {
        return Err(MappingError::InvalidResponse(format!(
            "PCP response too short: {} bytes (expected at least 60)",
            buf.len()
        )));
    }
    let opcode_byte = read_u8(buf, 1);
    if opcode_byte & 0x80 == 0 {
        return Err(MappingError::InvalidResponse("received a request, not a response".into()));
    }
    if opcode_byte & 0x7f != MAP_OPCODE {
        return Err(MappingError::InvalidResponse(format!(
            "unexpected PCP opcode {}",
            opcode_byte & 0x7f
        )));
    }

    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&buf[24..36]);

    Ok(MapResponse {
        result_code: read_u8(buf, 3),
        lifetime: read_u32(buf, 4),
        external_port: read_u16(buf, 42),
        external_ip: Ipv4Addr::new(buf[56], buf[57], buf[58], buf[59]),
        nonce,
    })
}

fn result_message(code: u8) -> &'static str {
    match code {
        0 => "success",
        1 => "unsupported PCP version",
        2 => "not authorized",
        3 => "malformed request",
        4 => "unsupported opcode",
        5 => "unsupported option",
        6 => "malformed option",
        7 => "network failure",
        8 => "no resources available",
        9 => "unsupported protocol",
        10 => "user exceeded quota",
        11 => "cannot provide external port",
        12 => "address mismatch",
        13 => "excessive remote peers",
        _ => "unknown PCP result code",
    }
}

async fn request_map(
    net: &dyn NetCapability,
    router_ip: &str,
    client_ip: Ipv4Addr,
    nonce: &[u8; 12],
    internal_port: u16,
    suggested_external_port: u16,
    lifetime: u32,
) -> Result<MapResponse, MappingError> {
    let ip: Ipv4Addr = router_ip
        .parse()
        .map_err(|_| MappingError::InvalidResponse(format!("not a valid router IP: {router_ip}")))?;
    let dst = SocketAddr::new(IpAddr::V4(ip), PCP_SERVER_PORT);
    let request = build_map_request(client_ip, nonce, internal_port, suggested_external_port, lifetime);

    let response = net.udp_request(dst, &request, PCP_TIMEOUT).await?;
    debug!(router_ip, bytes = response.len(), "received PCP MAP response");
    parse_map_response(&response)
}

/// Result of a successful PCP wave fan-out.
pub(crate) struct WaveSuccess {
    pub router_ip: String,
    pub internal_ip: String,
    pub external_ip: Ipv4Addr,
    pub external_port: u16,
    pub lifetime: u32,
    pub nonce: [u8; 12],
}

/// Fan out a MAP add request (lifetime > 0 is implied by the caller)
/// across waves, same matched-then-other order as NAT-PMP.
pub(crate) async fn map_via_waves(
    net: &dyn NetCapability,
    waves: &CandidateWaves,
    local_ips: &[String],
    internal_port: u16,
    suggested_external_port: u16,
    lifetime: u32,
) -> Result<WaveSuccess, MappingError> {
    let nonce = net.random_nonce();

    for wave in [&waves.matched, &waves.other] {
        if wave.is_empty() {
            continue;
        }
        let attempts = wave.iter().map(|router_ip| {
            let router_ip = router_ip.clone();
            let client_ip = longest_prefix_match(local_ips, &router_ip)
                .and_then(|s| s.parse::<Ipv4Addr>().ok())
                .or_else(|| local_ips.first().and_then(|s| s.parse::<Ipv4Addr>().ok()))
                .unwrap_or(Ipv4Addr::UNSPECIFIED);
            async move {
                request_map(net, &router_ip, client_ip, &nonce, internal_port, suggested_external_port, lifetime)
                    .await
                    .and_then(|resp| {
                        if resp.result_code == 0 {
                            Ok((router_ip, resp))
                        } else {
                            Err(MappingError::GatewayError(result_message(resp.result_code).to_string()))
                        }
                    })
            }
        });

        if let Some((router_ip, resp)) = join_all(attempts).await.into_iter().find_map(Result::ok) {
            let internal_ip = longest_prefix_match(local_ips, &router_ip)
                .unwrap_or_else(|| local_ips.first().map(String::as_str).unwrap_or(""))
                .to_string();
            return Ok(WaveSuccess {
                router_ip,
                internal_ip,
                external_ip: resp.external_ip,
                external_port: resp.external_port,
                lifetime: resp.lifetime,
                nonce: resp.nonce,
            });
        }
        warn!(wave_size = wave.len(), "PCP wave produced no responses");
    }
    Err(MappingError::NoGateway)
}

/// Delete a mapping: a MAP request with `lifetime=0`, the same nonce, and
/// `suggested external port=0`. Result codes 0 (success) and 8
/// (NO_RESOURCES, meaning "already absent") both count as success.
pub(crate) async fn delete_via_waves(
    net: &dyn NetCapability,
    waves: &CandidateWaves,
    router_ip: &str,
    client_ip: Ipv4Addr,
    nonce: &[u8; 12],
    internal_port: u16,
) -> Result<(), MappingError> {
    // The router that granted the mapping is almost always still the
    // right target; try it directly before falling back to the waves.
    let mut candidates = vec![router_ip.to_string()];
    candidates.extend(waves.matched.iter().cloned());
    candidates.extend(waves.other.iter().cloned());
    candidates.dedup();

    for candidate in candidates {
        match request_map(net, &candidate, client_ip, nonce, internal_port, 0, 0).await {
            Ok(resp) if resp.result_code == 0 || resp.result_code == 8 => return Ok(()),
            Ok(resp) => {
                warn!(result_code = resp.result_code, "PCP delete rejected by {candidate}");
            }
            Err(e) => {
                debug!(error = %e, "PCP delete attempt against {candidate} failed");
            }
        }
    }
    Err(MappingError::NoGateway)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_60_byte_map_request() {
        let nonce = [7u8; 12];
        let req = build_map_request(Ipv4Addr::new(192, 168, 1, 42), &nonce, 4001, 4001, 120);
        assert_eq!(req.len(), 60);
        assert_eq!(req[0], PCP_VERSION);
        assert_eq!(req[1], MAP_OPCODE);
        assert_eq!(read_u32(&req, 4), 120);
        assert_eq!(&req[8..18], &[0u8; 10]);
        assert_eq!(read_u16(&req, 18), 0xffff);
        assert_eq!(&req[20..24], &[192, 168, 1, 42]);
        assert_eq!(&req[24..36], &nonce);
        assert_eq!(req[36], MAP_PROTOCOL_UDP);
        assert_eq!(read_u16(&req, 40), 4001);
        assert_eq!(read_u16(&req, 42), 4001);
    }

    #[test]
    fn round_trips_request_fields_through_response_offsets() {
        // Build a request, then read back the same field positions a
        // response would use, to pin down offset agreement between the
        // builder and the parser.
        let nonce = [9u8; 12];
        let req = build_map_request(Ipv4Addr::new(10, 0, 0, 5), &nonce, 5000, 5000, 3600);
        assert_eq!(read_u16(&req, 40), 5000);
        assert_eq!(read_u16(&req, 42), 5000);
        assert_eq!(read_u32(&req, 4), 3600);
        assert_eq!(&req[24..36], &nonce);
    }

    #[test]
    fn parses_successful_map_response() {
        let mut resp = vec![0u8; 60];
        resp[0] = PCP_VERSION;
        resp[1] = 0x80 | MAP_OPCODE;
        resp[3] = 0;
        resp[4..8].copy_from_slice(&120u32.to_be_bytes());
        resp[24..36].copy_from_slice(&[1u8; 12]);
        resp[42..44].copy_from_slice(&4001u16.to_be_bytes());
        resp[56..60].copy_from_slice(&[203, 0, 113, 5]);

        let parsed = parse_map_response(&resp).unwrap();
        assert_eq!(parsed.result_code, 0);
        assert_eq!(parsed.lifetime, 120);
        assert_eq!(parsed.external_port, 4001);
        assert_eq!(parsed.external_ip, Ipv4Addr::new(203, 0, 113, 5));
        assert_eq!(parsed.nonce, [1u8; 12]);
    }

    #[test]
    fn no_resources_is_a_distinct_result_code_not_swallowed_by_the_parser() {
        let mut resp = vec![0u8; 60];
        resp[0] = PCP_VERSION;
        resp[1] = 0x80 | MAP_OPCODE;
        resp[3] = 8;
        let parsed = parse_map_response(&resp).unwrap();
        assert_eq!(parsed.result_code, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn each_candidate_gets_its_own_longest_prefix_matched_client_ip() {
        // Multi-homed host: one local IP per subnet, one wave candidate
        // per subnet. Each candidate's MAP request must embed the local
        // IP on *its* subnet, not whichever local IP happens to be first.
        use crate::net::fake::FakeNet;
        use std::net::SocketAddr;

        let net = FakeNet::new();
        let dst_a: SocketAddr = "192.168.1.1:5351".parse().unwrap();
        let dst_b: SocketAddr = "10.0.0.1:5351".parse().unwrap();
        // Neither candidate replies; the test only inspects the request
        // bytes each one was sent.
        let local_ips = vec!["192.168.1.42".to_string(), "10.0.0.5".to_string()];
        let waves = CandidateWaves {
            matched: vec!["192.168.1.1".to_string(), "10.0.0.1".to_string()],
            other: vec![],
        };

        let _ = map_via_waves(&net, &waves, &local_ips, 4000, 4000, 3600).await;

        let sent_a = net.last_sent_to(dst_a).expect("request sent to 192.168.1.1");
        assert_eq!(&sent_a[20..24], &[192, 168, 1, 42]);

        let sent_b = net.last_sent_to(dst_b).expect("request sent to 10.0.0.1");
        assert_eq!(&sent_b[20..24], &[10, 0, 0, 5]);
    }
}
