use std::net::{Ipv4Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::crypto::KeyPair;
use crate::network_params::NetworkConstants;
use crate::numbers::ParseError;
use crate::rate_limiter::BandwidthLimiter;
use crate::stats::{StatDetail, StatType, Stats};
use crate::transport::message::{subnet_prefix, HandshakeResponse, HEADER_SIZE};
use crate::transport::socket::{TcpSocket, TcpSocketConfig};
use crate::transport::{
    Message, MessageHeader, SynCookies, TcpChannel, TrafficType, TransportError, TransportResult,
};
use crate::utils::ObserverSet;

#[derive(Debug, Clone)]
pub struct TcpListenerConfig {
    /// Port to listen on; 0 picks an ephemeral port.
    pub port: u16,
    pub max_inbound_connections: usize,
    /// Connections allowed per IPv6 /128 (v4-mapped preserved); 0 disables.
    pub max_peers_per_ip: usize,
    /// Connections allowed per IPv6 /64 subnet; 0 disables.
    pub max_peers_per_subnetwork: usize,
}

impl Default for TcpListenerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            max_inbound_connections: 2048,
            max_peers_per_ip: 4,
            max_peers_per_subnetwork: 16,
        }
    }
}

struct ConnectionEntry {
    channel: Arc<TcpChannel>,
    remote: SocketAddrV6,
    inbound: bool,
}

/// Accept loop enforcing inbound, per-IP and per-subnet caps, plus the
/// syn-cookie node-id handshake on every accepted connection.
pub struct TcpListener {
    weak_self: std::sync::Weak<TcpListener>,
    config: TcpListenerConfig,
    socket_config: TcpSocketConfig,
    network: NetworkConstants,
    stats: Arc<Stats>,
    node_key: KeyPair,
    syn_cookies: Arc<SynCookies>,
    limiter: Arc<BandwidthLimiter>,
    connections: Mutex<Vec<ConnectionEntry>>,
    local_port: Mutex<Option<u16>>,
    cancel: CancellationToken,
    /// Fired once a peer completes the handshake.
    pub connection_accepted: ObserverSet<Arc<TcpChannel>>,
    /// Every post-handshake message received on any connection.
    pub inbound: ObserverSet<(Arc<TcpChannel>, Message)>,
}

impl TcpListener {
    pub fn new(
        config: TcpListenerConfig,
        socket_config: TcpSocketConfig,
        network: NetworkConstants,
        node_key: KeyPair,
        limiter: Arc<BandwidthLimiter>,
        stats: Arc<Stats>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            syn_cookies: Arc::new(SynCookies::new(network.syn_cookie_ttl)),
            config,
            socket_config,
            network,
            stats,
            node_key,
            limiter,
            connections: Mutex::new(Vec::new()),
            local_port: Mutex::new(None),
            cancel: CancellationToken::new(),
            connection_accepted: ObserverSet::new(),
            inbound: ObserverSet::new(),
        })
    }

    pub async fn start(&self) -> TransportResult<()> {
        let listener =
            tokio::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.config.port)).await?;
        let port = listener.local_addr()?.port();
        *self.local_port.lock() = Some(port);
        debug!(target: "tcp_listener", port, "listening");

        let this = self.weak_self.upgrade().expect("listener is alive");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => this.accept_one(stream, remote),
                        Err(err) => {
                            this.stats.inc(StatType::TcpListener, StatDetail::AcceptFailure);
                            warn!(target: "tcp_listener", %err, "accept failed");
                        }
                    },
                    _ = this.cancel.cancelled() => return,
                }
            }
        });
        Ok(())
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        let connections = std::mem::take(&mut *self.connections.lock());
        for entry in connections {
            entry.channel.close();
        }
    }

    pub fn port(&self) -> Option<u16> {
        *self.local_port.lock()
    }

    pub fn node_id(&self) -> crate::numbers::Account {
        self.node_key.account()
    }

    fn purge_dead(&self) {
        self.connections.lock().retain(|entry| entry.channel.alive());
    }

    pub fn connection_count(&self) -> usize {
        self.purge_dead();
        self.connections.lock().len()
    }

    pub fn inbound_count(&self) -> usize {
        self.purge_dead();
        self.connections
            .lock()
            .iter()
            .filter(|entry| entry.inbound)
            .count()
    }

    /// Channels that completed the handshake, used by bootstrap peer
    /// selection.
    pub fn realtime_channels(&self) -> Vec<Arc<TcpChannel>> {
        self.purge_dead();
        self.connections
            .lock()
            .iter()
            .filter(|entry| entry.channel.node_id().is_some())
            .map(|entry| entry.channel.clone())
            .collect()
    }

    /// Applies the three caps in order. The syscall has already accepted the
    /// connection; on a breach the stream is dropped immediately.
    fn check_limits(&self, remote: SocketAddrV6) -> bool {
        self.purge_dead();
        let connections = self.connections.lock();

        let inbound = connections.iter().filter(|entry| entry.inbound).count();
        if inbound >= self.config.max_inbound_connections {
            self.stats
                .inc(StatType::TcpListenerRejected, StatDetail::MaxInbound);
            return false;
        }

        if self.config.max_peers_per_ip > 0 {
            let per_ip = connections
                .iter()
                .filter(|entry| entry.inbound && entry.remote.ip() == remote.ip())
                .count();
            if per_ip >= self.config.max_peers_per_ip {
                self.stats
                    .inc(StatType::TcpListenerRejected, StatDetail::MaxPerIp);
                return false;
            }
        }

        if self.config.max_peers_per_subnetwork > 0 {
            let subnet = subnet_prefix(remote.ip());
            let per_subnet = connections
                .iter()
                .filter(|entry| entry.inbound && subnet_prefix(entry.remote.ip()) == subnet)
                .count();
            if per_subnet >= self.config.max_peers_per_subnetwork {
                self.stats
                    .inc(StatType::TcpListenerRejected, StatDetail::MaxPerSubnetwork);
                return false;
            }
        }

        true
    }

    fn accept_one(&self, stream: tokio::net::TcpStream, remote: SocketAddr) {
        let remote = crate::transport::message::map_endpoint_to_v6(remote);
        if !self.check_limits(remote) {
            debug!(target: "tcp_listener", %remote, "connection rejected");
            // Dropping the stream closes the just-accepted socket
            return;
        }
        self.stats
            .inc(StatType::TcpListener, StatDetail::AcceptSuccess);

        let socket = TcpSocket::accept(stream, self.socket_config.clone(), self.stats.clone());
        let channel = TcpChannel::new(
            socket.clone(),
            self.network.clone(),
            self.limiter.clone(),
            self.stats.clone(),
        );
        self.connections.lock().push(ConnectionEntry {
            channel: channel.clone(),
            remote,
            inbound: true,
        });

        let this = self.weak_self.upgrade().expect("listener is alive");
        tokio::spawn(async move {
            if let Err(err) = this.run_server_session(socket, channel.clone(), remote).await {
                debug!(target: "tcp_listener", %remote, %err, "session ended");
                channel.close();
            }
        });
    }

    /// Server side: issue a cookie query, require a signed response within
    /// the handshake timeout, then dispatch messages.
    async fn run_server_session(
        &self,
        socket: Arc<TcpSocket>,
        channel: Arc<TcpChannel>,
        remote: SocketAddrV6,
    ) -> TransportResult<()> {
        let Some(cookie) = self.syn_cookies.assign(remote) else {
            return Err(TransportError::Handshake("cookie already issued".into()));
        };
        self.stats.inc(StatType::Handshake, StatDetail::CookieIssued);
        channel.send(
            &Message::NodeIdHandshake {
                query: Some(cookie),
                response: None,
            },
            TrafficType::Generic,
            None,
        );

        // The peer must prove its node id before anything else is accepted
        let handshake = tokio::time::timeout(
            self.network.handshake_timeout,
            read_message(&socket, &self.network),
        )
        .await
        .map_err(|_| TransportError::Handshake("handshake timed out".into()))??;

        match handshake {
            Message::NodeIdHandshake {
                response: Some(response),
                query,
            } => {
                if !self
                    .syn_cookies
                    .validate(remote, &response.node_id, &response.signature)
                {
                    self.stats
                        .inc(StatType::Handshake, StatDetail::ResponseInvalid);
                    return Err(TransportError::Handshake("invalid cookie signature".into()));
                }
                self.stats
                    .inc(StatType::Handshake, StatDetail::ResponseAccepted);
                channel.set_node_id(response.node_id);

                // The peer may have included its own query
                if let Some(peer_cookie) = query {
                    self.send_handshake_response(&channel, &peer_cookie);
                }
            }
            _ => {
                return Err(TransportError::Handshake(
                    "expected node id handshake response".into(),
                ));
            }
        }

        self.connection_accepted.notify(&channel);
        self.run_dispatch(socket, channel).await
    }

    /// Client side: answer the server's query, then dispatch messages.
    async fn run_client_session(
        &self,
        socket: Arc<TcpSocket>,
        channel: Arc<TcpChannel>,
    ) -> TransportResult<()> {
        let handshake = tokio::time::timeout(
            self.network.handshake_timeout,
            read_message(&socket, &self.network),
        )
        .await
        .map_err(|_| TransportError::Handshake("handshake timed out".into()))??;

        match handshake {
            Message::NodeIdHandshake {
                query: Some(cookie),
                ..
            } => {
                self.send_handshake_response(&channel, &cookie);
            }
            _ => {
                return Err(TransportError::Handshake(
                    "expected node id handshake query".into(),
                ));
            }
        }

        self.run_dispatch(socket, channel).await
    }

    fn send_handshake_response(&self, channel: &Arc<TcpChannel>, cookie: &[u8; 32]) {
        let response = HandshakeResponse {
            node_id: self.node_key.account(),
            signature: self.node_key.sign(cookie),
        };
        channel.send(
            &Message::NodeIdHandshake {
                query: None,
                response: Some(response),
            },
            TrafficType::Generic,
            None,
        );
    }

    async fn run_dispatch(
        &self,
        socket: Arc<TcpSocket>,
        channel: Arc<TcpChannel>,
    ) -> TransportResult<()> {
        loop {
            let message = tokio::select! {
                message = read_message(&socket, &self.network) => message?,
                _ = self.cancel.cancelled() => return Ok(()),
            };
            self.inbound.notify(&(channel.clone(), message));
        }
    }

    /// Outbound connection: dial, answer the server's handshake, register the
    /// channel. Returns once the channel is usable for sending.
    pub async fn connect(&self, endpoint: SocketAddr) -> TransportResult<Arc<TcpChannel>> {
        let socket =
            TcpSocket::connect(endpoint, self.socket_config.clone(), self.stats.clone()).await?;
        let remote = socket
            .remote_endpoint()
            .ok_or(TransportError::Closed)?;
        let channel = TcpChannel::new(
            socket.clone(),
            self.network.clone(),
            self.limiter.clone(),
            self.stats.clone(),
        );
        self.connections.lock().push(ConnectionEntry {
            channel: channel.clone(),
            remote,
            inbound: false,
        });

        let this = self.weak_self.upgrade().expect("listener is alive");
        let session_channel = channel.clone();
        tokio::spawn(async move {
            if let Err(err) = this
                .run_client_session(socket, session_channel.clone())
                .await
            {
                debug!(target: "tcp_listener", %err, "client session ended");
                session_channel.close();
            }
        });
        Ok(channel)
    }
}

/// Reads one full frame: the fixed header, then the body size it implies.
pub async fn read_message(
    socket: &Arc<TcpSocket>,
    network: &NetworkConstants,
) -> TransportResult<Message> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    socket.read_exact(&mut header_bytes).await?;
    let header = MessageHeader::deserialize(&header_bytes)
        .map_err(|_| malformed("invalid message header"))?;
    header
        .validate(network.kind, network.protocol_version_min)
        .map_err(|_| malformed("wrong network or version"))?;
    let size = header
        .payload_size()
        .map_err(|_| malformed("unknown payload size"))?;
    let mut body = vec![0u8; size];
    if size > 0 {
        socket.read_exact(&mut body).await?;
    }
    Message::deserialize(&header, &body).map_err(|_| malformed("invalid message body"))
}

fn malformed(reason: &str) -> TransportError {
    TransportError::Malformed(reason.to_string())
}

impl From<ParseError> for TransportError {
    fn from(_: ParseError) -> Self {
        TransportError::Malformed("parse error".into())
    }
}
