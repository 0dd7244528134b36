//! Mapping registry & protocol-failover orchestrator.
//!
//! `Orchestrator<N>` owns the active-mapping table, the router-IP cache
//! and the protocol-support cache — the only mutable state in this crate
//! — behind a `tokio::sync::Mutex`. No two callers ever genuinely contend
//! on this state (each operation either touches a disjoint external port
//! or runs to completion before the next begins), so the mutex exists to
//! satisfy the borrow checker on tokio's multi-threaded runtime rather
//! than to arbitrate real contention.
//!
//! Refresh/expiry is one `tokio::spawn`ed task per live mapping, holding
//! an `Arc<Orchestrator<N>>` so it can re-invoke `add_mapping` on itself
//! when the router-granted lifetime is about to run out — the natural
//! tokio shape for "arm a timer that calls back into the owning actor".

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, warn};
use url::Url;

use crate::candidates::{candidate_waves, CandidateWaves, PCP_PROBE_PORT, PMP_PROBE_PORT, UPNP_PROBE_PORT};
use crate::error::MappingError;
use crate::mapping::{Mapping, MappingProtocol, ProtocolSupportCache, Support};
use crate::net::NetCapability;
use crate::{natpmp, pcp, upnp};

/// Refresh cadence for a `lifetime == 0` ("static") mapping.
const STATIC_REFRESH: Duration = Duration::from_secs(24 * 60 * 60);

/// A successful protocol attempt, plus the bookkeeping needed later to
/// delete it — not part of the public [`Mapping`] record.
struct Attempt {
    mapping: Mapping,
    router_ip: String,
    control_url: Option<Url>,
}

struct RegistryEntry {
    mapping: Mapping,
    timer: JoinHandle<()>,
    router_ip: String,
    control_url: Option<Url>,
}

struct OrchestratorState {
    registry: HashMap<u16, RegistryEntry>,
    router_ip_cache: Vec<String>,
    protocol_support: ProtocolSupportCache,
}

/// Owns the mapping registry and both caches, and drives the PMP → PCP →
/// UPnP fallback chain over an injected [`NetCapability`].
pub struct Orchestrator<N: NetCapability> {
    net: Arc<N>,
    state: Mutex<OrchestratorState>,
}

impl<N: NetCapability + 'static> Orchestrator<N> {
    /// Construct a fresh orchestrator: empty registry, empty router-IP
    /// cache, protocol support unknown. Wrapped in `Arc` since refresh
    /// timers need to call back into it.
    pub fn new(net: N) -> Arc<Self> {
        Arc::new(Orchestrator {
            net: Arc::new(net),
            state: Mutex::new(OrchestratorState {
                registry: HashMap::new(),
                router_ip_cache: Vec::new(),
                protocol_support: ProtocolSupportCache::default(),
            }),
        })
    }

    async fn local_ips(&self) -> Result<Vec<String>, MappingError> {
        self.net.local_ipv4s().await
    }

    async fn waves(&self) -> CandidateWaves {
        let cache = self.state.lock().await.router_ip_cache.clone();
        let local = self.local_ips().await.unwrap_or_default();
        candidate_waves(&cache, &local)
    }

    /// Add a port mapping, falling back across protocols as needed. Never
    /// returns an error type — failure is represented by
    /// `external_port: None` and `err_info` on the returned [`Mapping`].
    pub async fn add_mapping(self: &Arc<Self>, internal_port: u16, external_port: u16, lifetime: u32) -> Mapping {
        let support = self.state.lock().await.protocol_support.clone();

        let attempt = if support.is_unknown() {
            self.add_via_fallback_chain(internal_port, external_port, lifetime).await
        } else if support.all_unsupported() {
            Err(MappingError::AllProtocolsFailed(
                "No protocols are supported from last probe".into(),
            ))
        } else {
            self.add_via_known_protocol(&support, internal_port, external_port, lifetime).await
        };

        match attempt {
            Ok(Attempt { mapping, router_ip, control_url }) => {
                self.record_router_ip(&router_ip).await;
                let granted_port = mapping
                    .external_port
                    .expect("a successful attempt always carries an external port");
                self.insert_registry_entry(granted_port, mapping.clone(), router_ip, control_url, lifetime)
                    .await;
                mapping
            }
            Err(e) => {
                error!(error = %e, internal_port, external_port, "add_mapping failed across all protocols");
                Mapping::failed(String::new(), internal_port, e.to_string())
            }
        }
    }

    /// Cache already says exactly which protocol(s) are supported —
    /// dispatch directly, preferring PMP, then PCP, then UPnP if more
    /// than one tested true.
    async fn add_via_known_protocol(
        &self,
        support: &ProtocolSupportCache,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
    ) -> Result<Attempt, MappingError> {
        if support.nat_pmp.as_bool() == Some(true) {
            return self.try_nat_pmp(internal_port, external_port, lifetime).await;
        }
        if support.pcp.as_bool() == Some(true) {
            return self.try_pcp(internal_port, external_port, lifetime).await;
        }
        if support.upnp.as_bool() == Some(true) {
            return self.try_upnp(internal_port, external_port, lifetime).await;
        }
        Err(MappingError::AllProtocolsFailed(
            "No protocols are supported from last probe".into(),
        ))
    }

    /// No probe has ever completed: try PMP, then PCP, then UPnP,
    /// stopping at the first success. This does *not* populate the
    /// protocol-support cache — only `probe_protocol_support` does that
    /// (the cache's all-or-nothing tri-state transition is a property of
    /// an explicit probe, not of incidental fallback during an add).
    async fn add_via_fallback_chain(
        &self,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
    ) -> Result<Attempt, MappingError> {
        let mut errors = Vec::new();

        match self.try_nat_pmp(internal_port, external_port, lifetime).await {
            Ok(attempt) => return Ok(attempt),
            Err(e) => errors.push(format!("natPmp: {e}")),
        }
        match self.try_pcp(internal_port, external_port, lifetime).await {
            Ok(attempt) => return Ok(attempt),
            Err(e) => errors.push(format!("pcp: {e}")),
        }
        match self.try_upnp(internal_port, external_port, lifetime).await {
            Ok(attempt) => return Ok(attempt),
            Err(e) => errors.push(format!("upnp: {e}")),
        }
        Err(MappingError::AllProtocolsFailed(errors.join("; ")))
    }

    async fn try_nat_pmp(&self, internal_port: u16, external_port: u16, lifetime: u32) -> Result<Attempt, MappingError> {
        let waves = self.waves().await;
        let local_ips = self.local_ips().await?;
        let success = natpmp::map_via_waves(self.net.as_ref(), &waves, &local_ips, internal_port, external_port, lifetime).await?;

        Ok(Attempt {
            mapping: Mapping {
                internal_ip: success.internal_ip,
                internal_port,
                external_ip: None,
                external_port: Some(success.external_port),
                lifetime: success.lifetime,
                protocol: Some(MappingProtocol::NatPmp),
                nonce: None,
                err_info: None,
            },
            router_ip: success.router_ip,
            control_url: None,
        })
    }

    async fn try_pcp(&self, internal_port: u16, external_port: u16, lifetime: u32) -> Result<Attempt, MappingError> {
        let waves = self.waves().await;
        let local_ips = self.local_ips().await?;
        let success = pcp::map_via_waves(self.net.as_ref(), &waves, &local_ips, internal_port, external_port, lifetime).await?;

        Ok(Attempt {
            mapping: Mapping {
                internal_ip: success.internal_ip,
                internal_port,
                external_ip: Some(success.external_ip.to_string()),
                external_port: Some(success.external_port),
                lifetime: success.lifetime,
                protocol: Some(MappingProtocol::Pcp),
                nonce: Some(success.nonce),
                err_info: None,
            },
            router_ip: success.router_ip,
            control_url: None,
        })
    }

    async fn try_upnp(&self, internal_port: u16, external_port: u16, lifetime: u32) -> Result<Attempt, MappingError> {
        let control_url = self.upnp_control_url().await?;
        let local_ips = self.local_ips().await?;
        let internal_ip = local_ips.first().cloned().unwrap_or_default();

        let result = upnp::add_mapping(self.net.as_ref(), &control_url, &internal_ip, internal_port, external_port, lifetime).await?;
        let router_ip = result.control_url.host_str().unwrap_or_default().to_string();

        Ok(Attempt {
            mapping: Mapping {
                internal_ip,
                internal_port,
                external_ip: None,
                external_port: Some(external_port),
                // UPnP's SOAP response carries no lifetime echo; the
                // requested value is what the router was told to grant.
                lifetime,
                protocol: Some(MappingProtocol::Upnp),
                nonce: None,
                err_info: None,
            },
            router_ip,
            control_url: Some(result.control_url),
        })
    }

    async fn upnp_control_url(&self) -> Result<Url, MappingError> {
        if let Some(cached) = self.state.lock().await.protocol_support.upnp_control_url.clone() {
            if let Ok(url) = Url::parse(&cached) {
                return Ok(url);
            }
        }
        let url = upnp::discover_control_url(self.net.as_ref()).await?;
        self.state.lock().await.protocol_support.upnp_control_url = Some(url.to_string());
        Ok(url)
    }

    async fn record_router_ip(&self, router_ip: &str) {
        if router_ip.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        if !state.router_ip_cache.iter().any(|ip| ip == router_ip) {
            state.router_ip_cache.push(router_ip.to_string());
        }
    }

    /// Arm the refresh/expiry timer for a newly granted mapping and
    /// insert the registry entry, replacing (and cancelling) any prior
    /// entry at the same external port. A `requested == 0` lifetime
    /// re-adds on a static 24h cadence; a `granted < requested` lifetime
    /// re-adds after `granted` seconds for the remaining time the caller
    /// asked for; otherwise the entry is simply evicted once it expires.
    async fn insert_registry_entry(
        self: &Arc<Self>,
        external_port: u16,
        mapping: Mapping,
        router_ip: String,
        control_url: Option<Url>,
        requested: u32,
    ) {
        let granted = mapping.lifetime;
        let internal_port = mapping.internal_port;
        let orchestrator = Arc::clone(self);

        let timer: JoinHandle<()> = if requested == 0 {
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(STATIC_REFRESH).await;
                    let _ = orchestrator.add_mapping(internal_port, external_port, 0).await;
                }
            })
        } else if granted < requested {
            let remaining = requested - granted;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(granted as u64)).await;
                let _ = orchestrator.add_mapping(internal_port, external_port, remaining).await;
            })
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(granted as u64)).await;
                orchestrator.state.lock().await.registry.remove(&external_port);
            })
        };

        let mut state = self.state.lock().await;
        if let Some(old) = state.registry.insert(external_port, RegistryEntry { mapping, timer, router_ip, control_url }) {
            old.timer.abort();
        }
    }

    /// `deleteMapping(extPort) → bool`. `false` for an absent entry or a
    /// failed deletion; on success the timer is cancelled and the entry
    /// removed.
    pub async fn delete_mapping(self: &Arc<Self>, external_port: u16) -> bool {
        let (mapping, router_ip, control_url) = {
            let state = self.state.lock().await;
            match state.registry.get(&external_port) {
                Some(entry) => (entry.mapping.clone(), entry.router_ip.clone(), entry.control_url.clone()),
                None => return false,
            }
        };

        let result: Result<(), MappingError> = match mapping.protocol {
            Some(MappingProtocol::NatPmp) => {
                let waves = self.waves().await;
                natpmp::delete_via_waves(self.net.as_ref(), &waves, &router_ip, mapping.internal_port, external_port).await
            }
            Some(MappingProtocol::Pcp) => {
                let waves = self.waves().await;
                let client_ip: Ipv4Addr = mapping.internal_ip.parse().unwrap_or(Ipv4Addr::UNSPECIFIED);
                let nonce = mapping.nonce.unwrap_or([0u8; 12]);
                pcp::delete_via_waves(self.net.as_ref(), &waves, &router_ip, client_ip, &nonce, mapping.internal_port).await
            }
            Some(MappingProtocol::Upnp) => match &control_url {
                Some(url) => upnp::delete_mapping(self.net.as_ref(), url, external_port).await,
                None => Err(MappingError::Internal("missing UPnP control URL".into())),
            },
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.registry.remove(&external_port) {
                    entry.timer.abort();
                }
                true
            }
            Err(e) => {
                warn!(error = %e, external_port, "delete_mapping failed");
                false
            }
        }
    }

    /// `probeProtocolSupport() → {natPmp, pcp, upnp}`. Runs all three
    /// probes in parallel and fully populates the support cache — the
    /// only operation that transitions it out of `unknown`.
    pub async fn probe_protocol_support(self: &Arc<Self>) -> (bool, bool, bool) {
        let waves = self.waves().await;
        let local_ips = self.local_ips().await.unwrap_or_default();

        let (pmp_ok, pcp_ok, upnp_ok) = tokio::join!(
            self.probe_nat_pmp(&waves, &local_ips),
            self.probe_pcp(&waves, &local_ips),
            self.probe_upnp(),
        );

        let mut state = self.state.lock().await;
        state.protocol_support.nat_pmp = support_from_bool(pmp_ok);
        state.protocol_support.pcp = support_from_bool(pcp_ok);
        state.protocol_support.upnp = support_from_bool(upnp_ok);

        (pmp_ok, pcp_ok, upnp_ok)
    }

    async fn probe_nat_pmp(&self, waves: &CandidateWaves, local_ips: &[String]) -> bool {
        natpmp::map_via_waves(self.net.as_ref(), waves, local_ips, PMP_PROBE_PORT, PMP_PROBE_PORT, 120)
            .await
            .is_ok()
    }

    async fn probe_pcp(&self, waves: &CandidateWaves, local_ips: &[String]) -> bool {
        pcp::map_via_waves(self.net.as_ref(), waves, local_ips, PCP_PROBE_PORT, PCP_PROBE_PORT, 120)
            .await
            .is_ok()
    }

    async fn probe_upnp(&self) -> bool {
        let Ok(control_url) = upnp::discover_control_url(self.net.as_ref()).await else {
            return false;
        };
        let local_ips = self.local_ips().await.unwrap_or_default();
        let internal_ip = local_ips.first().cloned().unwrap_or_default();

        match upnp::add_mapping(self.net.as_ref(), &control_url, &internal_ip, UPNP_PROBE_PORT, UPNP_PROBE_PORT, 120).await {
            Ok(_) => {
                self.state.lock().await.protocol_support.upnp_control_url = Some(control_url.to_string());
                true
            }
            Err(_) => false,
        }
    }

    /// `getActiveMappings()`.
    pub async fn active_mappings(&self) -> HashMap<u16, Mapping> {
        self.state.lock().await.registry.iter().map(|(port, entry)| (*port, entry.mapping.clone())).collect()
    }

    /// `getRouterIpCache()`.
    pub async fn router_ip_cache(&self) -> Vec<String> {
        self.state.lock().await.router_ip_cache.clone()
    }

    /// `getProtocolSupportCache()`.
    pub async fn protocol_support_cache(&self) -> ProtocolSupportCache {
        self.state.lock().await.protocol_support.clone()
    }

    /// `getPrivateIps()`.
    pub async fn private_ips(&self) -> Result<Vec<String>, MappingError> {
        self.local_ips().await
    }

    /// Tear down every active mapping. Snapshots the registry's keys
    /// into an owned `Vec` before deleting — iterating a live handle into
    /// the map while `delete_mapping` concurrently removes entries from
    /// it would be unsound — and deletes them all in parallel.
    /// Individual failures don't abort the others.
    pub async fn close(self: &Arc<Self>) {
        let ports: Vec<u16> = self.state.lock().await.registry.keys().copied().collect();
        let deletions = ports.into_iter().map(|port| {
            let orchestrator = Arc::clone(self);
            async move {
                orchestrator.delete_mapping(port).await;
            }
        });
        futures::future::join_all(deletions).await;
    }
}

fn support_from_bool(ok: bool) -> Support {
    if ok {
        Support::Supported
    } else {
        Support::Unsupported
    }
}
