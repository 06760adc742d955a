use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::network_params::NetworkConstants;
use crate::numbers::Account;
use crate::rate_limiter::BandwidthLimiter;
use crate::stats::{StatDetail, StatDir, StatType, Stats};
use crate::transport::socket::{TcpSocket, WriteCallback};
use crate::transport::{Message, TrafficType, TransportError};

const MAX_BATCH: usize = 8;
const BANDWIDTH_CHUNK: usize = 128 * 1024;
const QUEUE_SIZE: usize = 128;

type QueueEntry = (Vec<u8>, Option<WriteCallback>);

/// One deque per traffic type with a soft cap of `QUEUE_SIZE` entries and a
/// hard cap of twice that. Batches are drained round-robin with equal
/// priority across types.
pub struct TcpChannelQueue {
    queues: Vec<(TrafficType, VecDeque<QueueEntry>)>,
    current: usize,
    counter: usize,
}

impl TcpChannelQueue {
    pub fn new() -> Self {
        Self {
            queues: TrafficType::all()
                .into_iter()
                .map(|traffic_type| (traffic_type, VecDeque::new()))
                .collect(),
            current: 0,
            counter: 0,
        }
    }

    fn queue_mut(&mut self, traffic_type: TrafficType) -> &mut VecDeque<QueueEntry> {
        &mut self
            .queues
            .iter_mut()
            .find(|(t, _)| *t == traffic_type)
            .expect("every traffic type has a queue")
            .1
    }

    fn queue(&self, traffic_type: TrafficType) -> &VecDeque<QueueEntry> {
        &self
            .queues
            .iter()
            .find(|(t, _)| *t == traffic_type)
            .expect("every traffic type has a queue")
            .1
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(|(_, queue)| queue.len()).sum()
    }

    pub fn size(&self, traffic_type: TrafficType) -> usize {
        self.queue(traffic_type).len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|(_, queue)| queue.is_empty())
    }

    /// Soft cap reached.
    pub fn max(&self, traffic_type: TrafficType) -> bool {
        self.size(traffic_type) >= QUEUE_SIZE
    }

    /// Hard cap reached.
    pub fn full(&self, traffic_type: TrafficType) -> bool {
        self.size(traffic_type) >= 2 * QUEUE_SIZE
    }

    pub fn push(&mut self, traffic_type: TrafficType, entry: QueueEntry) {
        debug_assert!(!self.full(traffic_type));
        self.queue_mut(traffic_type).push_back(entry);
    }

    /// Allows one entry per queue before seeking to the next, giving every
    /// traffic type equal weight.
    fn next(&mut self) -> (TrafficType, QueueEntry) {
        debug_assert!(!self.is_empty());

        let should_seek = self.queues[self.current].1.is_empty() || self.counter >= 1;
        if should_seek {
            self.counter = 0;
            loop {
                self.current = (self.current + 1) % self.queues.len();
                if !self.queues[self.current].1.is_empty() {
                    break;
                }
            }
        }

        self.counter += 1;
        let (traffic_type, queue) = &mut self.queues[self.current];
        let entry = queue.pop_front().expect("seek lands on non-empty queue");
        (*traffic_type, entry)
    }

    pub fn next_batch(&mut self, max_count: usize) -> Vec<(TrafficType, QueueEntry)> {
        let mut batch = Vec::new();
        while !self.is_empty() && batch.len() < max_count {
            batch.push(self.next());
        }
        batch
    }

    fn drain_all(&mut self) -> Vec<QueueEntry> {
        let mut entries = Vec::new();
        for (_, queue) in &mut self.queues {
            entries.extend(queue.drain(..));
        }
        entries
    }
}

impl Default for TcpChannelQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// One logical peer: per-traffic-type queues on top of a shared socket, with
/// a cooperative sender task that respects the socket's backpressure and the
/// shared bandwidth limiter.
pub struct TcpChannel {
    socket: Arc<TcpSocket>,
    network: NetworkConstants,
    limiter: Arc<BandwidthLimiter>,
    stats: Arc<Stats>,
    queue: Mutex<TcpChannelQueue>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    last_packet_sent: Mutex<Option<Instant>>,
    node_id: Mutex<Option<Account>>,
}

impl TcpChannel {
    pub fn new(
        socket: Arc<TcpSocket>,
        network: NetworkConstants,
        limiter: Arc<BandwidthLimiter>,
        stats: Arc<Stats>,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            socket,
            network,
            limiter,
            stats,
            queue: Mutex::new(TcpChannelQueue::new()),
            notify: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            last_packet_sent: Mutex::new(None),
            node_id: Mutex::new(None),
        });
        channel.clone().spawn_sender();
        channel
    }

    /// Serializes and queues a message. Returns true iff it was queued.
    pub fn send(
        &self,
        message: &Message,
        traffic_type: TrafficType,
        callback: Option<WriteCallback>,
    ) -> bool {
        let buffer = message.serialize(
            self.network.kind,
            self.network.protocol_version,
            self.network.protocol_version_min,
        );
        self.send_buffer(buffer, traffic_type, callback)
    }

    pub fn send_buffer(
        &self,
        buffer: Vec<u8>,
        traffic_type: TrafficType,
        callback: Option<WriteCallback>,
    ) -> bool {
        {
            let mut queue = self.queue.lock();
            if queue.full(traffic_type) {
                drop(queue);
                self.stats
                    .inc_dir(StatType::TcpChannel, StatDetail::Drop, StatDir::Out);
                if let Some(callback) = callback {
                    callback(Err(TransportError::NoBufferSpace));
                }
                return false;
            }
            queue.push(traffic_type, (buffer, callback));
        }
        self.stats
            .inc_dir(StatType::TcpChannel, StatDetail::Queued, StatDir::Out);
        self.notify.notify_one();
        true
    }

    /// Soft cap state for `traffic_type`.
    pub fn max(&self, traffic_type: TrafficType) -> bool {
        self.queue.lock().max(traffic_type)
    }

    pub fn full(&self, traffic_type: TrafficType) -> bool {
        self.queue.lock().full(traffic_type)
    }

    pub fn alive(&self) -> bool {
        self.socket.alive()
    }

    pub fn socket(&self) -> &Arc<TcpSocket> {
        &self.socket
    }

    pub fn remote_endpoint(&self) -> Option<std::net::SocketAddrV6> {
        self.socket.remote_endpoint()
    }

    pub fn last_packet_sent(&self) -> Option<Instant> {
        *self.last_packet_sent.lock()
    }

    pub fn node_id(&self) -> Option<Account> {
        *self.node_id.lock()
    }

    pub fn set_node_id(&self, node_id: Account) {
        *self.node_id.lock() = Some(node_id);
    }

    pub fn close(&self) {
        self.cancel.cancel();
        self.socket.close();
        let entries = self.queue.lock().drain_all();
        for (_, callback) in entries {
            if let Some(callback) = callback {
                callback(Err(TransportError::OperationAborted));
            }
        }
    }

    fn spawn_sender(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut allocated_bandwidth: usize = 0;
            loop {
                let batch = self.queue.lock().next_batch(MAX_BATCH);
                if batch.is_empty() {
                    tokio::select! {
                        _ = self.notify.notified() => continue,
                        _ = self.cancel.cancelled() => return,
                    }
                }
                for (traffic_type, (buffer, callback)) in batch {
                    if Self::send_one(&self, traffic_type, buffer, callback, &mut allocated_bandwidth)
                        .await
                        .is_err()
                    {
                        // Cancelled; exit cleanly
                        return;
                    }
                }
            }
        });
    }

    async fn send_one(
        this: &Arc<Self>,
        traffic_type: TrafficType,
        buffer: Vec<u8>,
        callback: Option<WriteCallback>,
        allocated_bandwidth: &mut usize,
    ) -> Result<(), ()> {
        this.wait_socket().await?;
        this.wait_bandwidth(traffic_type, buffer.len(), allocated_bandwidth)
            .await?;

        this.stats
            .inc_dir(StatType::TcpChannel, StatDetail::Send, StatDir::Out);
        trace!(
            target: "tcp_channel",
            remote = ?this.remote_endpoint(),
            size = buffer.len(),
            ?traffic_type,
            "sending"
        );

        let channel = this.clone();
        let wrapped: WriteCallback = Box::new(move |result| {
            if result.is_ok() {
                *channel.last_packet_sent.lock() = Some(Instant::now());
            }
            if let Some(callback) = callback {
                callback(result);
            }
        });
        this.socket.async_write(buffer, Some(wrapped));
        Ok(())
    }

    /// Waits while the underlying socket is at its hard cap.
    async fn wait_socket(&self) -> Result<(), ()> {
        while self.socket.full() {
            if !self.socket.alive() {
                return Err(());
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                _ = self.cancel.cancelled() => return Err(()),
            }
        }
        Ok(())
    }

    /// Allocates bandwidth in large chunks rather than per message, polling
    /// the shared limiter until enough is available.
    async fn wait_bandwidth(
        &self,
        traffic_type: TrafficType,
        size: usize,
        allocated: &mut usize,
    ) -> Result<(), ()> {
        while *allocated < size {
            while !self.limiter.should_pass(BANDWIDTH_CHUNK, traffic_type) {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    _ = self.cancel.cancelled() => return Err(()),
                }
            }
            *allocated += BANDWIDTH_CHUNK;
        }
        *allocated -= size;
        Ok(())
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
