use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::{UdpSocket, lookup_host};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use webrtc::stun::agent::TransactionId;
use webrtc::stun::message::{BINDING_REQUEST, Getter, Message};
use webrtc::stun::xoraddr::XorMappedAddress;

use crate::config::IceServerConfig;

const DEFAULT_STUN_PORT: u16 = 3478;
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to enumerate interfaces: {0}")]
    Interfaces(#[source] io::Error),
    #[error("stun request failed: {0}")]
    Stun(String),
    #[error("stun request to {0} timed out")]
    Timeout(String),
}

/// What the local host looks like from the network's point of view.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkIdentity {
    pub local_addrs: Vec<IpAddr>,
    pub reflexive: Option<IpAddr>,
}

impl NetworkIdentity {
    pub fn new(mut local_addrs: Vec<IpAddr>, reflexive: Option<IpAddr>) -> Self {
        local_addrs.sort();
        local_addrs.dedup();
        Self {
            local_addrs,
            reflexive,
        }
    }

    /// A lost STUN answer is not a change; a different reflexive address or
    /// a different set of interface addresses is.
    pub fn differs_from(&self, previous: &NetworkIdentity) -> bool {
        if self.local_addrs != previous.local_addrs {
            return true;
        }
        matches!((self.reflexive, previous.reflexive), (Some(now), Some(before)) if now != before)
    }

    /// Carry a known reflexive address forward when this probe missed it.
    fn merged_with(mut self, previous: &NetworkIdentity) -> Self {
        if self.reflexive.is_none() {
            self.reflexive = previous.reflexive;
        }
        self
    }
}

#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn probe(&self) -> Result<NetworkIdentity, ProbeError>;
}

/// Interface addresses from the OS plus a STUN binding request for the
/// server-reflexive address.
#[derive(Clone, Debug)]
pub struct StunProbe {
    servers: Vec<String>,
    request_timeout: Duration,
}

impl StunProbe {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            request_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn from_ice_servers(ice_servers: &[IceServerConfig]) -> Self {
        let servers = ice_servers
            .iter()
            .flat_map(|server| server.urls.iter())
            .filter_map(|url| stun_host(url))
            .collect();
        Self::new(servers)
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    async fn reflexive_address(&self) -> Option<IpAddr> {
        for server in &self.servers {
            match self.binding_request(server).await {
                Ok(addr) => return Some(addr),
                Err(err) => tracing::debug!(
                    target = "rendezvous::network",
                    %server,
                    error = %err,
                    "stun probe failed"
                ),
            }
        }
        None
    }

    async fn binding_request(&self, server: &str) -> Result<IpAddr, ProbeError> {
        let target = lookup_host(server)
            .await
            .map_err(|err| ProbeError::Stun(err.to_string()))?
            .next()
            .ok_or_else(|| ProbeError::Stun(format!("{server} did not resolve")))?;
        let bind: SocketAddr = match target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|err| ProbeError::Stun(err.to_string()))?;

        let mut request = Message::new();
        request
            .build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])
            .map_err(|err| ProbeError::Stun(err.to_string()))?;
        socket
            .send_to(&request.raw, target)
            .await
            .map_err(|err| ProbeError::Stun(err.to_string()))?;

        let mut buf = vec![0u8; 1500];
        let (len, _) = timeout(self.request_timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| ProbeError::Timeout(server.to_string()))?
            .map_err(|err| ProbeError::Stun(err.to_string()))?;

        let mut response = Message::new();
        response.raw = buf[..len].to_vec();
        response
            .decode()
            .map_err(|err| ProbeError::Stun(err.to_string()))?;
        if response.transaction_id != request.transaction_id {
            return Err(ProbeError::Stun("transaction id mismatch".into()));
        }
        let mut mapped = XorMappedAddress::default();
        mapped
            .get_from(&response)
            .map_err(|err| ProbeError::Stun(err.to_string()))?;
        Ok(mapped.ip)
    }
}

/// `stun:host[:port]` to `host:port`. TURN and TLS entries are skipped.
fn stun_host(url: &str) -> Option<String> {
    let rest = url.trim().strip_prefix("stun:")?;
    let rest = rest.split('?').next().unwrap_or(rest);
    if rest.is_empty() {
        return None;
    }
    let has_port = match rest.rsplit_once(':') {
        Some((host, port)) => {
            port.parse::<u16>().is_ok() && (!host.contains(':') || host.ends_with(']'))
        }
        None => false,
    };
    if has_port {
        Some(rest.to_string())
    } else {
        Some(format!("{rest}:{DEFAULT_STUN_PORT}"))
    }
}

#[async_trait]
impl NetworkProbe for StunProbe {
    async fn probe(&self) -> Result<NetworkIdentity, ProbeError> {
        let local_addrs = if_addrs::get_if_addrs()
            .map_err(ProbeError::Interfaces)?
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .map(|iface| iface.ip())
            .collect();
        let reflexive = self.reflexive_address().await;
        Ok(NetworkIdentity::new(local_addrs, reflexive))
    }
}

/// A probe whose answer is set by hand. Clones share the same identity.
#[derive(Clone, Debug, Default)]
pub struct StaticProbe {
    identity: Arc<Mutex<NetworkIdentity>>,
}

impl StaticProbe {
    pub fn new(identity: NetworkIdentity) -> Self {
        Self {
            identity: Arc::new(Mutex::new(identity)),
        }
    }

    pub fn set(&self, identity: NetworkIdentity) {
        *self.identity.lock() = identity;
    }

    pub fn current(&self) -> NetworkIdentity {
        self.identity.lock().clone()
    }
}

#[async_trait]
impl NetworkProbe for StaticProbe {
    async fn probe(&self) -> Result<NetworkIdentity, ProbeError> {
        Ok(self.current())
    }
}

/// Re-probes the network on its own timer and reports identity changes.
pub struct NetworkChangeMonitor {
    probe: Arc<dyn NetworkProbe>,
    poll_interval: Duration,
}

impl NetworkChangeMonitor {
    pub fn new(probe: Arc<dyn NetworkProbe>, poll_interval: Duration) -> Self {
        Self {
            probe,
            poll_interval,
        }
    }

    pub fn spawn(
        self,
        cancel: CancellationToken,
        changes: mpsc::UnboundedSender<NetworkIdentity>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel, changes))
    }

    async fn run(self, cancel: CancellationToken, changes: mpsc::UnboundedSender<NetworkIdentity>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut baseline: Option<NetworkIdentity> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let probed = tokio::select! {
                _ = cancel.cancelled() => break,
                probed = self.probe.probe() => probed,
            };
            let identity = match probed {
                Ok(identity) => identity,
                Err(err) => {
                    tracing::debug!(target = "rendezvous::network", error = %err, "network probe failed");
                    continue;
                }
            };
            match baseline.take() {
                None => {
                    tracing::debug!(target = "rendezvous::network", identity = ?identity, "network baseline");
                    baseline = Some(identity);
                }
                Some(previous) => {
                    let changed = identity.differs_from(&previous);
                    let current = identity.merged_with(&previous);
                    if changed {
                        tracing::info!(
                            target = "rendezvous::network",
                            before = ?previous,
                            after = ?current,
                            "network change detected"
                        );
                        if changes.send(current.clone()).is_err() {
                            break;
                        }
                    }
                    baseline = Some(current);
                }
            }
        }
        tracing::trace!(target = "rendezvous::network", "network monitor stopped");
    }
}
