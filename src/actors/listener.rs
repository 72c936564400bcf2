//! ListenerActor - Answers passive checks
//!
//! Each accepted connection carries exactly one request: a framed or bare
//! item key. The key is evaluated through the scheduler's single-shot path
//! and the value (or `ZBX_NOTSUPPORTED\0<message>`) is written back in the
//! same form the request arrived in.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream, lookup_host};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use super::messages::ListenerCommand;
use super::scheduler::SchedulerHandle;
use crate::CheckResult;
use crate::protocol::{AcceptOptions, Connection, TransportError};

/// Prefix of a passive reply for an unsupported or failed key
pub const NOT_SUPPORTED: &str = "ZBX_NOTSUPPORTED";

/// Peers allowed to request passive checks
#[derive(Debug, Clone, Default)]
pub struct PeerFilter {
    allowed: HashSet<IpAddr>,
}

impl PeerFilter {
    /// Resolve the configured peers; host names may map to several addresses
    pub async fn resolve(peers: &[String]) -> Result<Self> {
        let mut allowed = HashSet::new();
        for peer in peers {
            if let Ok(ip) = peer.parse::<IpAddr>() {
                allowed.insert(ip);
                continue;
            }
            let resolved = lookup_host((peer.as_str(), 0))
                .await
                .with_context(|| format!("cannot resolve allowed peer \"{peer}\""))?;
            allowed.extend(resolved.map(|addr| addr.ip()));
        }
        Ok(Self { allowed })
    }

    pub fn from_ips(ips: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            allowed: ips.into_iter().collect(),
        }
    }

    /// An empty filter admits every peer
    pub fn permits(&self, peer: IpAddr) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        let peer = match peer {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(peer, IpAddr::V4),
            v4 => v4,
        };
        self.allowed.contains(&peer)
    }
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind: SocketAddr,
    pub peers: PeerFilter,
    pub accept: AcceptOptions,
    /// How long a passive check may take
    pub timeout: Duration,
}

/// Render a check result as a passive reply body
pub fn render_reply(result: &CheckResult) -> Vec<u8> {
    match (&result.value.render(), result.error_message()) {
        (Some(text), _) => text.clone().into_bytes(),
        (None, message) => not_supported(message.unwrap_or("")),
    }
}

fn not_supported(message: &str) -> Vec<u8> {
    let mut reply = Vec::with_capacity(NOT_SUPPORTED.len() + 1 + message.len());
    reply.extend_from_slice(NOT_SUPPORTED.as_bytes());
    reply.push(0);
    reply.extend_from_slice(message.as_bytes());
    reply
}

pub struct ListenerActor {
    listener: TcpListener,
    config: ListenerConfig,
    scheduler: SchedulerHandle,
    command_rx: mpsc::Receiver<ListenerCommand>,
}

impl ListenerActor {
    pub fn new(
        listener: TcpListener,
        config: ListenerConfig,
        scheduler: SchedulerHandle,
        command_rx: mpsc::Receiver<ListenerCommand>,
    ) -> Self {
        Self {
            listener,
            config,
            scheduler,
            command_rx,
        }
    }

    #[instrument(skip(self), fields(bind = %self.config.bind))]
    pub async fn run(mut self) {
        debug!("starting passive check listener");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.admit(stream, peer),
                        Err(e) => warn!("failed to accept connection: {}", e),
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ListenerCommand::Shutdown) => {
                            debug!("received shutdown command");
                            break;
                        }
                        None => {
                            warn!("command channel closed, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        debug!("passive check listener stopped");
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        if !self.config.peers.permits(peer.ip()) {
            warn!("connection from \"{}\" rejected, not in the allowed peer list", peer.ip());
            return;
        }

        let accept = self.config.accept.clone();
        let scheduler = self.scheduler.clone();
        let wait = self.config.timeout;
        tokio::spawn(async move {
            if let Err(e) = serve(stream, &accept, &scheduler, wait).await {
                debug!("passive check from {} failed: {}", peer, e);
            }
        });
    }
}

async fn serve(
    stream: TcpStream,
    accept: &AcceptOptions,
    scheduler: &SchedulerHandle,
    wait: Duration,
) -> Result<(), TransportError> {
    let mut connection = Connection::accept(stream, accept).await?;
    let request = connection.recv_request().await?;

    let reply = if request.payload.first() == Some(&b'{') {
        not_supported("JSON requests are not supported.")
    } else {
        let key = String::from_utf8_lossy(&request.payload).trim().to_string();
        trace!("passive check for [{}]", key);
        match scheduler.check_once(&key, wait).await {
            Ok(result) => render_reply(&result),
            Err(e) => not_supported(&format!("{e:#}")),
        }
    };

    let sent = if request.framed {
        connection.set_compression(request.compressed);
        connection.send(&reply).await
    } else {
        connection.send_raw(&reply).await
    };
    connection.close().await;
    sent
}

/// Handle for controlling the ListenerActor
#[derive(Clone)]
pub struct ListenerHandle {
    sender: mpsc::Sender<ListenerCommand>,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    /// Bind the listening socket and start accepting
    pub async fn spawn(config: ListenerConfig, scheduler: SchedulerHandle) -> Result<Self> {
        let listener = TcpListener::bind(config.bind)
            .await
            .with_context(|| format!("cannot listen on {}", config.bind))?;
        let local_addr = listener.local_addr().context("listener has no local address")?;
        info!("listening for passive checks on {}", local_addr);

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let actor = ListenerActor::new(listener, config, scheduler, cmd_rx);
        tokio::spawn(actor.run());
        Ok(Self {
            sender: cmd_tx,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(ListenerCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_reply_rendering() {
        assert_eq!(render_reply(&CheckResult::new(0, Value::Unsigned(1))), b"1");
        assert_eq!(
            render_reply(&CheckResult::error(0, "Unsupported item key.")),
            b"ZBX_NOTSUPPORTED\0Unsupported item key."
        );
    }

    #[test]
    fn test_peer_filter() {
        let filter = PeerFilter::from_ips([IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        assert!(filter.permits(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(filter.permits(IpAddr::V6(Ipv4Addr::LOCALHOST.to_ipv6_mapped())));
        assert!(!filter.permits(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(!filter.permits(IpAddr::V6(Ipv6Addr::LOCALHOST)));

        assert!(PeerFilter::default().permits(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    }

    #[tokio::test]
    async fn test_resolve_literal_and_hostname() {
        let filter = PeerFilter::resolve(&["192.0.2.7".to_string(), "localhost".to_string()])
            .await
            .unwrap();
        assert!(filter.permits("192.0.2.7".parse().unwrap()));
        assert!(!filter.permits("192.0.2.8".parse().unwrap()));
    }
}
