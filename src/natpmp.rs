//! NAT-PMP (NAT Port Mapping Protocol, RFC 6886) codec and client.
//!
//! NAT-PMP is the legacy protocol predating PCP, still found on older
//! Apple and Cisco gateways. A MAP request is 12 bytes, a MAP response is
//! 16 bytes, and the router never reports the external IP in the MAP
//! response itself — a separate 2-byte external-address probe is needed
//! for that (used here only by [`fetch_external_address`], which PCP
//! doesn't need since its own MAP response carries the external address).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::candidates::CandidateWaves;
use crate::codec::{build_buffer, read_u16, read_u32, read_u8, Field};
use crate::error::MappingError;
use crate::ip_util::longest_prefix_match;
use crate::net::NetCapability;

pub(crate) const NATPMP_SERVER_PORT: u16 = 5351;
const NATPMP_VERSION: u8 = 0;
const NATPMP_TIMEOUT: Duration = Duration::from_secs(2);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opcode {
    ExternalAddress = 0,
    /// `MapUdp` (op=1) is part of RFC 6886 but unused here: the public
    /// `add_mapping` API takes no per-call protocol parameter, so this
    /// client always requests a TCP mapping (op=2) — see DESIGN.md for
    /// why UDP mappings were left out of scope rather than threaded
    /// through as a caller-supplied choice.
    #[allow(dead_code)]
    MapUdp = 1,
    MapTcp = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultCode {
    Success = 0,
    UnsupportedVersion = 1,
    NotAuthorized = 2,
    NetworkFailure = 3,
    OutOfResources = 4,
    UnsupportedOpcode = 5,
}

impl ResultCode {
    fn from_u16(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::UnsupportedVersion),
            2 => Some(Self::NotAuthorized),
            3 => Some(Self::NetworkFailure),
            4 => Some(Self::OutOfResources),
            5 => Some(Self::UnsupportedOpcode),
            _ => None,
        }
    }

    fn message(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::UnsupportedVersion => "unsupported NAT-PMP version",
            Self::NotAuthorized => "not authorized / refused",
            Self::NetworkFailure => "network failure",
            Self::OutOfResources => "out of resources",
            Self::UnsupportedOpcode => "unsupported opcode",
        }
    }
}

fn build_map_request(internal_port: u16, suggested_external_port: u16, lifetime: u32) -> Vec<u8> {
    build_buffer(
        12,
        &[
            Field::u8(0, NATPMP_VERSION),
            Field::u8(1, Opcode::MapTcp as u8),
            Field::u16(4, internal_port),
            Field::u16(6, suggested_external_port),
            Field::u32(8, lifetime),
        ],
    )
}

fn build_external_address_request() -> Vec<u8> {
    build_buffer(2, &[Field::u8(0, NATPMP_VERSION), Field::u8(1, Opcode::ExternalAddress as u8)])
}

struct MapResponse {
    result_code: u16,
    external_port: u16,
    lifetime: u32,
}

fn parse_map_response(buf: &[u8]) -> Result<MapResponse, MappingError> {
    if buf.len() < 16 {
        return Err(MappingError::InvalidResponse(format!(
            "NAT-PMP MAP response too short: {} bytes",
            buf.len()
        )));
    }
    if read_u8(buf, 0) != NATPMP_VERSION {
        return Err(MappingError::InvalidResponse("unexpected NAT-PMP version".into()));
    }
    let opcode = read_u8(buf, 1);
    if opcode < 0x80 {
        return Err(MappingError::InvalidResponse("received a request, not a response".into()));
    }

    Ok(MapResponse {
        result_code: read_u16(buf, 2),
        external_port: read_u16(buf, 10),
        lifetime: read_u32(buf, 12),
    })
}

fn parse_external_address_response(buf: &[u8]) -> Result<Ipv4Addr, MappingError> {
    if buf.len() < 12 {
        return Err(MappingError::InvalidResponse(format!(
            "NAT-PMP external-address response too short: {} bytes",
            buf.len()
        )));
    }
    if read_u8(buf, 0) != NATPMP_VERSION {
        return Err(MappingError::InvalidResponse("unexpected NAT-PMP version".into()));
    }
    let result_code = read_u16(buf, 2);
    let result = ResultCode::from_u16(result_code)
        .ok_or_else(|| MappingError::InvalidResponse(format!("unknown result code {result_code}")))?;
    if result != ResultCode::Success {
        return Err(MappingError::GatewayError(result.message().to_string()));
    }
    Ok(Ipv4Addr::new(buf[8], buf[9], buf[10], buf[11]))
}

/// Send one MAP request to `router_ip:5351` and return `(external_port,
/// granted_lifetime)` on success.
async fn request_mapping(
    net: &dyn NetCapability,
    router_ip: &str,
    internal_port: u16,
    suggested_external_port: u16,
    lifetime: u32,
) -> Result<(u16, u32), MappingError> {
    let ip: Ipv4Addr = router_ip
        .parse()
        .map_err(|_| MappingError::InvalidResponse(format!("not a valid router IP: {router_ip}")))?;
    let dst = SocketAddr::new(IpAddr::V4(ip), NATPMP_SERVER_PORT);
    let request = build_map_request(internal_port, suggested_external_port, lifetime);

    let response = net.udp_request(dst, &request, NATPMP_TIMEOUT).await?;
    debug!(router_ip, bytes = response.len(), "received NAT-PMP MAP response");

    let parsed = parse_map_response(&response)?;
    let result = ResultCode::from_u16(parsed.result_code)
        .ok_or_else(|| MappingError::InvalidResponse(format!("unknown result code {}", parsed.result_code)))?;
    if result != ResultCode::Success {
        return Err(MappingError::GatewayError(result.message().to_string()));
    }
    Ok((parsed.external_port, parsed.lifetime))
}

/// Fetch the external IPv4 address NAT-PMP reports for this gateway.
/// NAT-PMP's MAP response never carries it, so this is always a second,
/// separate request (RFC 6886 §3.2). `Mapping::external_ip` is only
/// populated for PCP, whose MAP response reports the external address
/// directly, so nothing in the add/probe flow calls this today — it's
/// kept as a standalone capability for callers that want it directly.
#[allow(dead_code)]
pub(crate) async fn fetch_external_address(
    net: &dyn NetCapability,
    router_ip: &str,
) -> Result<Ipv4Addr, MappingError> {
    let ip: Ipv4Addr = router_ip
        .parse()
        .map_err(|_| MappingError::InvalidResponse(format!("not a valid router IP: {router_ip}")))?;
    let dst = SocketAddr::new(IpAddr::V4(ip), NATPMP_SERVER_PORT);
    let request = build_external_address_request();
    let response = net.udp_request(dst, &request, NATPMP_TIMEOUT).await?;
    parse_external_address_response(&response)
}

/// Result of a successful wave fan-out: the router that answered, the
/// internal IP selected for it, the granted external port and lifetime.
pub(crate) struct WaveSuccess {
    pub router_ip: String,
    pub internal_ip: String,
    pub external_port: u16,
    pub lifetime: u32,
}

/// Fan out a MAP request across the matched wave, then (only if nothing
/// answered) the other wave, to avoid flooding every residential default
/// gateway IP when a known-good or LAN-matched candidate already exists.
pub(crate) async fn map_via_waves(
    net: &dyn NetCapability,
    waves: &CandidateWaves,
    local_ips: &[String],
    internal_port: u16,
    suggested_external_port: u16,
    lifetime: u32,
) -> Result<WaveSuccess, MappingError> {
    for wave in [&waves.matched, &waves.other] {
        if wave.is_empty() {
            continue;
        }
        let attempts = wave.iter().map(|router_ip| {
            let router_ip = router_ip.clone();
            async move {
                request_mapping(net, &router_ip, internal_port, suggested_external_port, lifetime)
                    .await
                    .map(|(external_port, lifetime)| (router_ip, external_port, lifetime))
            }
        });

        // Only the first success in wave order is honoured even though
        // every candidate is queried in parallel; ties are broken by wave
        // order (cache-first, then LAN-matched) rather than reply timing.
        if let Some((router_ip, external_port, lifetime)) =
            join_all(attempts).await.into_iter().find_map(Result::ok)
        {
            let internal_ip = longest_prefix_match(local_ips, &router_ip)
                .unwrap_or_else(|| local_ips.first().map(String::as_str).unwrap_or(""))
                .to_string();
            return Ok(WaveSuccess { router_ip, internal_ip, external_port, lifetime });
        }
        warn!(wave_size = wave.len(), "NAT-PMP wave produced no responses");
    }
    Err(MappingError::NoGateway)
}

/// Delete a mapping: a `lifetime=0` MAP request, trying the granting
/// router first and then falling back across both waves.
pub(crate) async fn delete_via_waves(
    net: &dyn NetCapability,
    waves: &CandidateWaves,
    router_ip: &str,
    internal_port: u16,
    external_port: u16,
) -> Result<(), MappingError> {
    let mut candidates = vec![router_ip.to_string()];
    candidates.extend(waves.matched.iter().cloned());
    candidates.extend(waves.other.iter().cloned());
    candidates.dedup();

    for candidate in candidates {
        match request_mapping(net, &candidate, internal_port, external_port, 0).await {
            Ok(_) => return Ok(()),
            Err(e) => debug!(error = %e, "NAT-PMP delete attempt against {candidate} failed"),
        }
    }
    Err(MappingError::NoGateway)
}
