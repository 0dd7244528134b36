//! Public data model: `Mapping`, the protocol-support cache, and the
//! router-IP cache (everything the orchestrator tracks except the
//! registry itself, which lives in `orchestrator.rs` alongside the
//! scheduling it needs).

use serde::{Deserialize, Serialize};

/// The wire protocol that produced a mapping. Determines which deleter
/// `Orchestrator::delete_mapping` dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingProtocol {
    NatPmp,
    Pcp,
    Upnp,
}

/// A port mapping, successful or not.
///
/// A failed attempt is represented by `external_port: None` plus
/// `err_info` rather than a separate `Result<Mapping, _>` wrapper:
/// `add_mapping` never fails outright (a router that refuses every
/// protocol is a normal, expected outcome, not an exceptional one), so
/// the failure information belongs on the value itself. `timer_handle`
/// and a protocol-specific deleter are not public fields here: they are
/// implementation details of a single registry entry, kept in
/// `orchestrator::RegistryEntry` instead, since exposing a live tokio
/// task handle or a boxed closure on a `Serialize`able value the caller
/// can inspect/clone makes little sense in Rust.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    /// LAN IPv4 of the host receiving forwarded traffic.
    pub internal_ip: String,
    pub internal_port: u16,
    /// Populated by PCP only.
    pub external_ip: Option<String>,
    /// `None` iff this mapping attempt failed.
    pub external_port: Option<u16>,
    /// Router-granted lifetime in seconds. `0` means "static".
    pub lifetime: u32,
    /// Absent when `external_port` is `None`.
    pub protocol: Option<MappingProtocol>,
    /// PCP only; required to delete.
    pub nonce: Option<[u8; 12]>,
    /// Human-readable failure reason (UPnP SOAP faults, exhausted
    /// fallback chain, etc). Only ever set alongside `external_port: None`.
    pub err_info: Option<String>,
}

impl Mapping {
    /// Build a failure placeholder: no registry entry is ever created for
    /// this value, matching the invariant `externalPort == None ⇔ failed`.
    pub fn failed(internal_ip: impl Into<String>, internal_port: u16, err_info: impl Into<String>) -> Self {
        Mapping {
            internal_ip: internal_ip.into(),
            internal_port,
            external_ip: None,
            external_port: None,
            lifetime: 0,
            protocol: None,
            nonce: None,
            err_info: Some(err_info.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.external_port.is_some()
    }
}

/// Tri-state support flag: no probe has run yet, or the probe's boolean
/// outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Support {
    Unknown,
    Supported,
    Unsupported,
}

impl Support {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Support::Unknown => None,
            Support::Supported => Some(true),
            Support::Unsupported => Some(false),
        }
    }
}

/// Three tri-state protocol-support flags plus the discovered UPnP
/// control URL, if any. `unknown` for any of the three means "no probe
/// has ever completed"; probing always resolves all three together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSupportCache {
    pub nat_pmp: Support,
    pub pcp: Support,
    pub upnp: Support,
    pub upnp_control_url: Option<String>,
}

impl Default for ProtocolSupportCache {
    fn default() -> Self {
        ProtocolSupportCache {
            nat_pmp: Support::Unknown,
            pcp: Support::Unknown,
            upnp: Support::Unknown,
            upnp_control_url: None,
        }
    }
}

impl ProtocolSupportCache {
    pub fn is_unknown(&self) -> bool {
        matches!(self.nat_pmp, Support::Unknown)
            && matches!(self.pcp, Support::Unknown)
            && matches!(self.upnp, Support::Unknown)
    }

    pub fn all_unsupported(&self) -> bool {
        matches!(self.nat_pmp, Support::Unsupported)
            && matches!(self.pcp, Support::Unsupported)
            && matches!(self.upnp, Support::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Host applications carry a `Mapping` across their own IPC boundary
    // as JSON; round-tripping through serde_json pins down that the
    // derived (de)serialization survives the trip unchanged.
    #[test]
    fn mapping_round_trips_through_json() {
        let mapping = Mapping {
            internal_ip: "192.168.1.42".to_string(),
            internal_port: 4000,
            external_ip: Some("203.0.113.5".to_string()),
            external_port: Some(4001),
            lifetime: 7200,
            protocol: Some(MappingProtocol::Pcp),
            nonce: Some([9u8; 12]),
            err_info: None,
        };

        let json = serde_json::to_string(&mapping).unwrap();
        let deserialized: Mapping = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.internal_ip, mapping.internal_ip);
        assert_eq!(deserialized.external_port, mapping.external_port);
        assert_eq!(deserialized.protocol, mapping.protocol);
        assert_eq!(deserialized.nonce, mapping.nonce);
    }

    #[test]
    fn failed_mapping_round_trips_with_none_fields() {
        let mapping = Mapping::failed("192.168.1.42", 4000, "all protocols failed");
        let json = serde_json::to_string(&mapping).unwrap();
        let deserialized: Mapping = serde_json::from_str(&json).unwrap();
        assert!(!deserialized.is_success());
        assert_eq!(deserialized.err_info, mapping.err_info);
    }
}
