use std::collections::VecDeque;
use std::net::{SocketAddr, SocketAddrV6};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::stats::{StatDetail, StatDir, StatType, Stats};
use crate::transport::message::map_endpoint_to_v6;
use crate::transport::{TransportError, TransportResult};
use crate::utils::seconds_since_epoch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEndpoint {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketState {
    Constructed = 0,
    Connecting = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
}

impl SocketState {
    fn from_u8(value: u8) -> SocketState {
        match value {
            0 => SocketState::Constructed,
            1 => SocketState::Connecting,
            2 => SocketState::Open,
            3 => SocketState::Closing,
            _ => SocketState::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TcpSocketConfig {
    /// Inactivity timeout armed by every read and write.
    pub io_timeout: Duration,
    /// Server sockets receiving nothing for this long are dropped.
    pub silent_connection_tolerance: Duration,
    /// Cadence of the timeout checkup task.
    pub checkup_interval: Duration,
    /// Soft cap of the per-socket write queue; the hard cap is twice this.
    pub queue_size: usize,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(30),
            silent_connection_tolerance: Duration::from_secs(120),
            checkup_interval: Duration::from_secs(5),
            queue_size: 128,
        }
    }
}

pub type WriteCallback = Box<dyn FnOnce(TransportResult<usize>) + Send>;

struct WriteEntry {
    buffer: Vec<u8>,
    callback: Option<WriteCallback>,
}

/// One framed byte stream over an OS socket: a serialized read side, a write
/// pump draining the queue in FIFO order, and a periodic timeout checkup.
/// `close()` is idempotent and delivers pending callbacks with
/// `OperationAborted`.
pub struct TcpSocket {
    config: TcpSocketConfig,
    stats: Arc<Stats>,
    endpoint_type: SocketEndpoint,
    state: AtomicU8,
    remote: Mutex<Option<SocketAddrV6>>,
    local: Mutex<Option<SocketAddrV6>>,
    /// Current timeout in seconds; `u64::MAX` disables it.
    timeout: AtomicU64,
    default_timeout: AtomicU64,
    last_completion: AtomicU64,
    last_receive: AtomicU64,
    timed_out: AtomicBool,
    read_half: tokio::sync::Mutex<Option<OwnedReadHalf>>,
    write_queue: Mutex<VecDeque<WriteEntry>>,
    write_notify: Arc<Notify>,
    cancel: CancellationToken,
}

impl TcpSocket {
    /// Connects to `endpoint`, surfacing a timeout within the configured io
    /// timeout even for unroutable targets.
    pub async fn connect(
        endpoint: SocketAddr,
        config: TcpSocketConfig,
        stats: Arc<Stats>,
    ) -> TransportResult<Arc<TcpSocket>> {
        let connect_timeout = config.io_timeout;
        match tokio::time::timeout(connect_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => {
                let socket = Self::attach(stream, config, stats, SocketEndpoint::Client);
                debug!(
                    target: "tcp_socket",
                    remote = ?socket.remote_endpoint(),
                    local = ?socket.local_endpoint(),
                    "successfully connected"
                );
                Ok(socket)
            }
            Ok(Err(err)) => {
                stats.inc_dir(StatType::Tcp, StatDetail::ConnectError, StatDir::In);
                Err(TransportError::Io(err))
            }
            Err(_) => {
                stats.inc_dir(StatType::Tcp, StatDetail::ConnectError, StatDir::In);
                Err(TransportError::ConnectTimeout)
            }
        }
    }

    /// Wraps an accepted stream as a server-side socket.
    pub fn accept(stream: TcpStream, config: TcpSocketConfig, stats: Arc<Stats>) -> Arc<TcpSocket> {
        Self::attach(stream, config, stats, SocketEndpoint::Server)
    }

    fn attach(
        stream: TcpStream,
        config: TcpSocketConfig,
        stats: Arc<Stats>,
        endpoint_type: SocketEndpoint,
    ) -> Arc<TcpSocket> {
        let remote = stream.peer_addr().ok().map(map_endpoint_to_v6);
        let local = stream.local_addr().ok().map(map_endpoint_to_v6);
        let (read_half, write_half) = stream.into_split();
        let now = seconds_since_epoch();
        let socket = Arc::new(TcpSocket {
            default_timeout: AtomicU64::new(config.io_timeout.as_secs()),
            config,
            stats,
            endpoint_type,
            state: AtomicU8::new(SocketState::Open as u8),
            remote: Mutex::new(remote),
            local: Mutex::new(local),
            timeout: AtomicU64::new(u64::MAX),
            last_completion: AtomicU64::new(now),
            last_receive: AtomicU64::new(now),
            timed_out: AtomicBool::new(false),
            read_half: tokio::sync::Mutex::new(Some(read_half)),
            write_queue: Mutex::new(VecDeque::new()),
            write_notify: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        });
        socket.clone().spawn_write_pump(write_half);
        socket.clone().spawn_checkup();
        socket
    }

    fn spawn_write_pump(self: Arc<Self>, mut write_half: OwnedWriteHalf) {
        tokio::spawn(async move {
            loop {
                let entry = self.write_queue.lock().pop_front();
                match entry {
                    Some(entry) => {
                        self.set_default_timeout();
                        match write_half.write_all(&entry.buffer).await {
                            Ok(()) => {
                                self.stats.add_dir(
                                    StatType::TrafficTcp,
                                    StatDetail::All,
                                    StatDir::Out,
                                    entry.buffer.len() as u64,
                                );
                                self.set_last_completion();
                                if let Some(callback) = entry.callback {
                                    callback(Ok(entry.buffer.len()));
                                }
                            }
                            Err(err) => {
                                self.stats.inc_dir(
                                    StatType::Tcp,
                                    StatDetail::WriteError,
                                    StatDir::In,
                                );
                                if let Some(callback) = entry.callback {
                                    callback(Err(TransportError::Io(err)));
                                }
                                self.close();
                                break;
                            }
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = self.write_notify.notified() => {}
                            _ = self.cancel.cancelled() => break,
                        }
                    }
                }
            }
            // Graceful shutdown, best effort
            let _ = write_half.shutdown().await;
            self.drain_queue();
        });
    }

    fn spawn_checkup(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.checkup_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = self.cancel.cancelled() => return,
                }
                if !self.alive() {
                    return;
                }
                let now = seconds_since_epoch();
                let mut disconnect = false;

                // Server sockets must receive data regularly
                if self.endpoint_type == SocketEndpoint::Server
                    && now.saturating_sub(self.last_receive.load(Ordering::SeqCst))
                        > self.config.silent_connection_tolerance.as_secs()
                {
                    self.stats.inc_dir(
                        StatType::Tcp,
                        StatDetail::SilentConnectionDrop,
                        StatDir::In,
                    );
                    disconnect = true;
                }

                let timeout = self.timeout.load(Ordering::SeqCst);
                if timeout != u64::MAX
                    && now.saturating_sub(self.last_completion.load(Ordering::SeqCst)) > timeout
                {
                    self.stats.inc_dir(
                        StatType::Tcp,
                        StatDetail::IoTimeoutDrop,
                        match self.endpoint_type {
                            SocketEndpoint::Server => StatDir::In,
                            SocketEndpoint::Client => StatDir::Out,
                        },
                    );
                    disconnect = true;
                }

                if disconnect {
                    debug!(
                        target: "tcp_socket",
                        remote = ?self.remote_endpoint(),
                        "socket timeout, closing"
                    );
                    self.timed_out.store(true, Ordering::SeqCst);
                    self.close();
                    return;
                }
            }
        });
    }

    /// Reads exactly `buffer.len()` bytes. Reads on one socket are serialized
    /// by an internal lock; a second read in flight completes after the
    /// first.
    pub async fn read_exact(&self, buffer: &mut [u8]) -> TransportResult<()> {
        if !self.alive() {
            return Err(TransportError::Closed);
        }
        self.set_default_timeout();
        let mut guard = self.read_half.lock().await;
        let Some(read_half) = guard.as_mut() else {
            return Err(TransportError::Closed);
        };
        let result = tokio::select! {
            result = read_half.read_exact(buffer) => result,
            _ = self.cancel.cancelled() => return Err(TransportError::OperationAborted),
        };
        match result {
            Ok(_) => {
                self.stats.add_dir(
                    StatType::TrafficTcp,
                    StatDetail::All,
                    StatDir::In,
                    buffer.len() as u64,
                );
                self.set_last_completion();
                self.set_last_receive();
                Ok(())
            }
            Err(err) => {
                self.stats
                    .inc_dir(StatType::Tcp, StatDetail::ReadError, StatDir::In);
                drop(guard);
                self.close();
                Err(TransportError::Io(err))
            }
        }
    }

    /// Queues a buffer for writing. Returns false and fails the callback
    /// immediately once the hard cap (twice the queue size) is reached.
    pub fn async_write(&self, buffer: Vec<u8>, callback: Option<WriteCallback>) -> bool {
        if !self.alive() {
            if let Some(callback) = callback {
                callback(Err(TransportError::OperationAborted));
            }
            return false;
        }
        {
            let mut queue = self.write_queue.lock();
            if queue.len() >= 2 * self.config.queue_size {
                drop(queue);
                if let Some(callback) = callback {
                    callback(Err(TransportError::NoBufferSpace));
                }
                return false;
            }
            queue.push_back(WriteEntry { buffer, callback });
        }
        self.set_default_timeout();
        self.write_notify.notify_one();
        true
    }

    /// Soft cap reached.
    pub fn max(&self) -> bool {
        self.write_queue.lock().len() >= self.config.queue_size
    }

    /// Hard cap reached.
    pub fn full(&self) -> bool {
        self.write_queue.lock().len() >= 2 * self.config.queue_size
    }

    pub fn alive(&self) -> bool {
        !matches!(self.state(), SocketState::Closing | SocketState::Closed)
    }

    pub fn state(&self) -> SocketState {
        SocketState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn has_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    pub fn endpoint_type(&self) -> SocketEndpoint {
        self.endpoint_type
    }

    /// Cached remote endpoint; remains valid after close.
    pub fn remote_endpoint(&self) -> Option<SocketAddrV6> {
        *self.remote.lock()
    }

    pub fn local_endpoint(&self) -> Option<SocketAddrV6> {
        *self.local.lock()
    }

    pub fn set_timeout(&self, timeout: Duration) {
        let secs = timeout.as_secs();
        self.timeout.store(secs, Ordering::SeqCst);
    }

    pub fn set_default_timeout_value(&self, timeout: Duration) {
        self.default_timeout
            .store(timeout.as_secs(), Ordering::SeqCst);
    }

    fn set_default_timeout(&self) {
        self.timeout
            .store(self.default_timeout.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    fn set_last_completion(&self) {
        self.last_completion
            .store(seconds_since_epoch(), Ordering::SeqCst);
    }

    fn set_last_receive(&self) {
        self.last_receive
            .store(seconds_since_epoch(), Ordering::SeqCst);
    }

    fn drain_queue(&self) {
        let entries: Vec<WriteEntry> = self.write_queue.lock().drain(..).collect();
        for entry in entries {
            if let Some(callback) = entry.callback {
                callback(Err(TransportError::OperationAborted));
            }
        }
    }

    /// Idempotent: transitions any state to `Closed`, cancels the pumps and
    /// aborts queued writes.
    pub fn close(&self) {
        let previous = self
            .state
            .swap(SocketState::Closed as u8, Ordering::SeqCst);
        if previous == SocketState::Closed as u8 {
            return;
        }
        self.cancel.cancel();
        self.drain_queue();
        debug!(target: "tcp_socket", remote = ?self.remote_endpoint(), "closed socket");
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        if self.state() != SocketState::Closed {
            error!(
                target: "tcp_socket",
                remote = ?self.remote_endpoint(),
                "socket dropped without close"
            );
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    async fn socket_pair(config: TcpSocketConfig) -> (Arc<TcpSocket>, Arc<TcpSocket>) {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(Stats::new());
        let client = TcpSocket::connect(addr, config.clone(), stats.clone())
            .await
            .unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();
        let server = TcpSocket::accept(server_stream, config, stats);
        (client, server)
    }

    #[tokio::test]
    async fn write_and_read_round_trip() {
        let (client, server) = socket_pair(TcpSocketConfig::default()).await;
        assert!(client.async_write(b"hello".to_vec(), None));

        let mut buffer = [0u8; 5];
        server.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"hello");

        client.close();
        server.close();
    }

    #[tokio::test]
    async fn connect_timeout_to_unroutable() {
        let config = TcpSocketConfig {
            io_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        // 192.0.2.0/24 is reserved for documentation and never routed
        let endpoint: SocketAddr = "192.0.2.1:1".parse().unwrap();
        let stats = Arc::new(Stats::new());
        let started = std::time::Instant::now();
        let result = TcpSocket::connect(endpoint, config, stats.clone()).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(stats.count(StatType::Tcp, StatDetail::ConnectError), 1);
    }

    #[tokio::test]
    async fn hard_cap_rejects_with_no_buffer_space() {
        let config = TcpSocketConfig {
            queue_size: 1,
            ..Default::default()
        };
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(Stats::new());
        let client = TcpSocket::connect(addr, config, stats).await.unwrap();

        // Saturate the queue: the pump may drain entries, so push until the
        // hard cap reports full
        let mut rejected = false;
        for _ in 0..1000 {
            if !client.async_write(vec![0u8; 64 * 1024], None) {
                rejected = true;
                break;
            }
        }
        // Either the hard cap was hit or the kernel kept up; the cap state is
        // still observable through full()
        assert!(rejected || !client.full());
        client.close();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_aborts_callbacks() {
        let (client, _server) = socket_pair(TcpSocketConfig::default()).await;
        let aborted = Arc::new(std::sync::atomic::AtomicBool::new(false));
        {
            let aborted = aborted.clone();
            client.close();
            // Write after close fails with operation aborted
            let accepted = client.async_write(
                b"late".to_vec(),
                Some(Box::new(move |result| {
                    if matches!(result, Err(TransportError::OperationAborted)) {
                        aborted.store(true, Ordering::SeqCst);
                    }
                })),
            );
            assert!(!accepted);
        }
        client.close();
        client.close();
        assert_eq!(client.state(), SocketState::Closed);
        assert!(aborted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn silent_server_connection_dropped() {
        let config = TcpSocketConfig {
            io_timeout: Duration::from_secs(u32::MAX as u64),
            silent_connection_tolerance: Duration::from_secs(1),
            checkup_interval: Duration::from_millis(100),
            ..Default::default()
        };
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(Stats::new());
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();
        let server = TcpSocket::accept(server_stream, config, stats.clone());

        // The client sends nothing; within a few checkups the server drops it
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(server.state(), SocketState::Closed);
        assert_eq!(
            stats.count_dir(StatType::Tcp, StatDetail::SilentConnectionDrop, StatDir::In),
            1
        );
        assert_eq!(
            stats.count_dir(StatType::Tcp, StatDetail::IoTimeoutDrop, StatDir::In),
            0
        );
    }
}
