//! Injected network capability surface.
//!
//! Every protocol module talks to the outside world exclusively through
//! [`NetCapability`] rather than calling `tokio::net`/`reqwest` directly,
//! so a fake implementation can stand in for a real router in tests.
//! [`TokioNet`] is the real implementation used by
//! [`crate::orchestrator::Orchestrator`] in production, [`FakeNet`] is an
//! in-memory stand-in the test suite scripts canned router replies into.
//!
//! The low-level bind/send/recv/close steps of a UDP request are
//! collapsed into two higher-level methods, [`NetCapability::udp_request`]
//! and [`NetCapability::udp_multicast_search`]: every call site in this
//! crate performs the whole bind-send-recv(timeout)-close sequence
//! atomically, never the steps independently, so modelling them as one
//! fallible operation keeps Rust's `Drop`-on-every-exit-path guarantee
//! doing the "socket released exactly once" work for free instead of
//! threading a manual close through each error branch.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use tokio::net::UdpSocket;

use crate::error::MappingError;

/// Capability surface injected into the orchestrator and protocol clients.
#[async_trait]
pub trait NetCapability: Send + Sync {
    /// Bind an ephemeral UDP socket, send `payload` to `dst`, and wait up
    /// to `timeout` for the first reply datagram. The socket is always
    /// released before this returns, on every path.
    async fn udp_request(
        &self,
        dst: SocketAddr,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, MappingError>;

    /// Send `payload` to the SSDP multicast `group` and collect whatever
    /// unicast HTTP/1.1 replies arrive within `window`.
    async fn udp_multicast_search(
        &self,
        group: SocketAddr,
        payload: &[u8],
        window: Duration,
    ) -> Result<Vec<Vec<u8>>, MappingError>;

    /// Plain HTTP GET, returning the response body.
    async fn http_get(&self, url: &str) -> Result<String, MappingError>;

    /// HTTP POST of a SOAP 1.1 envelope with `Content-Type: text/xml` and
    /// a `SOAPAction` header, returning the response body.
    async fn http_post_soap(
        &self,
        url: &str,
        soap_action: &str,
        body: &str,
    ) -> Result<String, MappingError>;

    /// Enumerate the host's LAN-routable IPv4 addresses.
    async fn local_ipv4s(&self) -> Result<Vec<String>, MappingError>;

    /// Produce a 96-bit random nonce for a PCP mapping.
    fn random_nonce(&self) -> [u8; 12];
}

/// Real [`NetCapability`] implementation backed by tokio UDP sockets and a
/// shared `reqwest` client.
pub struct TokioNet {
    http: reqwest::Client,
}

impl TokioNet {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }
}

impl Default for TokioNet {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetCapability for TokioNet {
    async fn udp_request(
        &self,
        dst: SocketAddr,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, MappingError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(payload, dst).await?;

        let mut buf = vec![0u8; 1100];
        let (n, _) = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| MappingError::Timeout)??;
        buf.truncate(n);
        Ok(buf)
        // `socket` drops here on every exit path above, including the `?`s.
    }

    async fn udp_multicast_search(
        &self,
        group: SocketAddr,
        payload: &[u8],
        window: Duration,
    ) -> Result<Vec<Vec<u8>>, MappingError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(payload, group).await?;

        let mut replies = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let mut buf = vec![0u8; 2048];
            match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok((n, _))) => {
                    buf.truncate(n);
                    replies.push(buf);
                }
                _ => break,
            }
        }
        Ok(replies)
    }

    async fn http_get(&self, url: &str) -> Result<String, MappingError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| MappingError::GatewayError(e.to_string()))?;
        resp.text().await.map_err(|e| MappingError::GatewayError(e.to_string()))
    }

    async fn http_post_soap(
        &self,
        url: &str,
        soap_action: &str,
        body: &str,
    ) -> Result<String, MappingError> {
        let resp = self
            .http
            .post(url)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", format!("\"{soap_action}\""))
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| MappingError::GatewayError(e.to_string()))?;
        resp.text().await.map_err(|e| MappingError::GatewayError(e.to_string()))
    }

    async fn local_ipv4s(&self) -> Result<Vec<String>, MappingError> {
        let probe = async {
            // Connect-trick: no packet is actually sent, this just asks
            // the kernel which local interface would carry traffic to a
            // public address, which is the outbound-facing LAN IP.
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect("8.8.8.8:80").await?;
            match socket.local_addr()?.ip() {
                IpAddr::V4(v4) => Ok(vec![v4.to_string()]),
                IpAddr::V6(_) => Err(MappingError::NoLocalIp),
            }
        };

        match tokio::time::timeout(Duration::from_secs(2), probe).await {
            Ok(result) => result,
            Err(_) => Err(MappingError::NoLocalIp),
        }
    }

    fn random_nonce(&self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);
        nonce
    }
}

#[cfg(test)]
pub mod fake {
    //! In-memory [`NetCapability`] used by the end-to-end fake-router
    //! tests in `orchestrator.rs`. Tests script replies keyed by
    //! destination address / URL / SOAP action; anything unscripted
    //! behaves like a router that never answers.

    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct FakeNetState {
        udp: HashMap<SocketAddr, VecDeque<Vec<u8>>>,
        multicast: VecDeque<Vec<Vec<u8>>>,
        http_get: HashMap<String, String>,
        http_post: HashMap<String, String>,
        local_ips: Vec<String>,
        sent: HashMap<SocketAddr, Vec<u8>>,
    }

    /// Scriptable fake router/gateway for tests.
    #[derive(Default)]
    pub struct FakeNet {
        state: Mutex<FakeNetState>,
    }

    impl FakeNet {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue `reply` as the next UDP response from `dst`. Calling this
        /// more than once for the same `dst` queues multiple replies,
        /// consumed in order.
        pub fn script_udp_reply(&self, dst: SocketAddr, reply: Vec<u8>) {
            self.state.lock().unwrap().udp.entry(dst).or_default().push_back(reply);
        }

        /// Queue the set of unicast SSDP replies returned by the next
        /// `udp_multicast_search` call.
        pub fn script_multicast_replies(&self, replies: Vec<Vec<u8>>) {
            self.state.lock().unwrap().multicast.push_back(replies);
        }

        /// Script the body returned for an HTTP GET of `url`.
        pub fn script_http_get(&self, url: &str, body: &str) {
            self.state.lock().unwrap().http_get.insert(url.to_string(), body.to_string());
        }

        /// Script the body returned for a SOAP call with this
        /// `soap_action` (e.g. `...#AddPortMapping`).
        pub fn script_soap_reply(&self, soap_action: &str, body: &str) {
            self.state
                .lock()
                .unwrap()
                .http_post
                .insert(soap_action.to_string(), body.to_string());
        }

        /// Set the host's local IPv4 addresses reported by `local_ipv4s`.
        pub fn set_local_ips(&self, ips: Vec<String>) {
            self.state.lock().unwrap().local_ips = ips;
        }

        /// The payload of the last `udp_request` sent to `dst`, if any —
        /// lets a test inspect exactly what wire bytes a candidate received.
        pub fn last_sent_to(&self, dst: SocketAddr) -> Option<Vec<u8>> {
            self.state.lock().unwrap().sent.get(&dst).cloned()
        }
    }

    #[async_trait]
    impl NetCapability for FakeNet {
        async fn udp_request(
            &self,
            dst: SocketAddr,
            payload: &[u8],
            timeout: Duration,
        ) -> Result<Vec<u8>, MappingError> {
            let reply = {
                let mut state = self.state.lock().unwrap();
                state.sent.insert(dst, payload.to_vec());
                state.udp.get_mut(&dst).and_then(VecDeque::pop_front)
            };
            match reply {
                Some(bytes) => Ok(bytes),
                None => {
                    tokio::time::sleep(timeout).await;
                    Err(MappingError::Timeout)
                }
            }
        }

        async fn udp_multicast_search(
            &self,
            _group: SocketAddr,
            _payload: &[u8],
            window: Duration,
        ) -> Result<Vec<Vec<u8>>, MappingError> {
            let replies = self.state.lock().unwrap().multicast.pop_front().unwrap_or_default();
            tokio::time::sleep(window).await;
            Ok(replies)
        }

        async fn http_get(&self, url: &str) -> Result<String, MappingError> {
            self.state
                .lock()
                .unwrap()
                .http_get
                .get(url)
                .cloned()
                .ok_or_else(|| MappingError::GatewayError(format!("no scripted GET for {url}")))
        }

        async fn http_post_soap(
            &self,
            _url: &str,
            soap_action: &str,
            _body: &str,
        ) -> Result<String, MappingError> {
            self.state
                .lock()
                .unwrap()
                .http_post
                .get(soap_action)
                .cloned()
                .ok_or_else(|| MappingError::GatewayError(format!("no scripted SOAP reply for {soap_action}")))
        }

        async fn local_ipv4s(&self) -> Result<Vec<String>, MappingError> {
            let ips = self.state.lock().unwrap().local_ips.clone();
            if ips.is_empty() {
                Err(MappingError::NoLocalIp)
            } else {
                Ok(ips)
            }
        }

        fn random_nonce(&self) -> [u8; 12] {
            [0x42; 12]
        }
    }
}
