//! natgate - automatic NAT-PMP, PCP and UPnP IGD port mapping
//!
//! Opens and maintains inbound TCP/UDP port forwardings on a residential
//! NAT gateway from behind the NAT, without manual router configuration.
//! Three wire protocols are supported, tried in order until one works:
//! - NAT-PMP (NAT Port Mapping Protocol) - RFC 6886
//! - PCP (Port Control Protocol) - RFC 6887
//! - UPnP IGD (WANIPConnection AddPortMapping/DeletePortMapping)
//!
//! [`Orchestrator`] is the entry point: it owns the active-mapping
//! registry and both caches, drives the PMP -> PCP -> UPnP fallback chain,
//! and schedules the refresh/expiry timer for every mapping it grants.
//! Host applications construct one with [`TokioNet`] and call
//! [`Orchestrator::add_mapping`] / [`Orchestrator::delete_mapping`]; the
//! process entry point, any RPC/IPC framing, configuration loading and
//! logging policy are left to the host, per this crate's scope.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod candidates;
pub mod codec;
pub mod error;
pub mod ip_util;
pub mod mapping;
mod natpmp;
mod pcp;
mod upnp;

pub mod net;
pub mod orchestrator;

pub use error::MappingError;
pub use mapping::{Mapping, MappingProtocol, ProtocolSupportCache, Support};
pub use net::{NetCapability, TokioNet};
pub use orchestrator::Orchestrator;

/// Initialize default `tracing` output for host binaries that don't want
/// to build their own subscriber.
pub fn init() {
    tracing_subscriber::fmt::init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_orchestrator_has_empty_caches_and_registry() {
        let orchestrator = Orchestrator::new(TokioNet::new());
        assert!(orchestrator.active_mappings().await.is_empty());
        assert!(orchestrator.router_ip_cache().await.is_empty());
        assert!(orchestrator.protocol_support_cache().await.is_unknown());
    }
}
