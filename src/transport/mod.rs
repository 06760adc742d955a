mod channel;
mod listener;
pub mod message;
mod socket;
mod syn_cookies;

use std::io;

use thiserror::Error;

pub use channel::{TcpChannel, TcpChannelQueue};
pub use listener::{TcpListener, TcpListenerConfig};
pub use message::{Message, MessageHeader, MessageType};
pub use socket::{SocketEndpoint, SocketState, TcpSocket, TcpSocketConfig};
pub use syn_cookies::SynCookies;

/// Used for message prioritization and bandwidth limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficType {
    Generic,
    /// Ascending bootstrap (pull request/response) traffic.
    Bootstrap,
}

impl TrafficType {
    pub fn all() -> [TrafficType; 2] {
        [TrafficType::Generic, TrafficType::Bootstrap]
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("socket closed")]
    Closed,
    #[error("operation aborted")]
    OperationAborted,
    #[error("no buffer space")]
    NoBufferSpace,
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;
