use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;

use crate::block::{Block, BlockType, ByteReader};
use crate::network_params::NetworkKind;
use crate::numbers::{Account, BlockHash, ParseError, Root, Signature, U256};

pub const HEADER_SIZE: usize = 8;
pub const MAGIC: u8 = b'R';
const KEEPALIVE_PEERS: usize = 8;
const ENDPOINT_SIZE: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Invalid = 0x0,
    NotAType = 0x1,
    Keepalive = 0x2,
    Publish = 0x3,
    ConfirmReq = 0x4,
    ConfirmAck = 0x5,
    NodeIdHandshake = 0x0a,
    TelemetryReq = 0x0c,
    TelemetryAck = 0x0d,
    AscPullReq = 0x0e,
    AscPullAck = 0x0f,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<MessageType> {
        match value {
            0x0 => Some(MessageType::Invalid),
            0x1 => Some(MessageType::NotAType),
            0x2 => Some(MessageType::Keepalive),
            0x3 => Some(MessageType::Publish),
            0x4 => Some(MessageType::ConfirmReq),
            0x5 => Some(MessageType::ConfirmAck),
            0x0a => Some(MessageType::NodeIdHandshake),
            0x0c => Some(MessageType::TelemetryReq),
            0x0d => Some(MessageType::TelemetryAck),
            0x0e => Some(MessageType::AscPullReq),
            0x0f => Some(MessageType::AscPullAck),
            _ => None,
        }
    }
}

/// Eight byte preamble of every wire message:
/// `{'R', network_char, version_max, version_using, version_min, type, extensions_le}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub network: u8,
    pub version_max: u8,
    pub version_using: u8,
    pub version_min: u8,
    pub message_type: MessageType,
    pub extensions: u16,
}

impl MessageHeader {
    pub fn new(
        network: NetworkKind,
        protocol_version: u8,
        protocol_version_min: u8,
        message_type: MessageType,
        extensions: u16,
    ) -> Self {
        Self {
            network: network.id_char(),
            version_max: protocol_version,
            version_using: protocol_version,
            version_min: protocol_version_min,
            message_type,
            extensions,
        }
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(MAGIC);
        out.push(self.network);
        out.push(self.version_max);
        out.push(self.version_using);
        out.push(self.version_min);
        out.push(self.message_type as u8);
        out.extend_from_slice(&self.extensions.to_le_bytes());
    }

    pub fn deserialize(bytes: &[u8; HEADER_SIZE]) -> Result<Self, ParseError> {
        if bytes[0] != MAGIC {
            return Err(ParseError);
        }
        let message_type = MessageType::from_u8(bytes[5]).ok_or(ParseError)?;
        Ok(Self {
            network: bytes[1],
            version_max: bytes[2],
            version_using: bytes[3],
            version_min: bytes[4],
            message_type,
            extensions: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }

    /// Validates against the local network and protocol floor.
    pub fn validate(&self, network: NetworkKind, version_min: u8) -> Result<(), ParseError> {
        if self.network != network.id_char() {
            return Err(ParseError);
        }
        if self.version_using < version_min {
            return Err(ParseError);
        }
        match self.message_type {
            MessageType::Invalid | MessageType::NotAType => Err(ParseError),
            _ => Ok(()),
        }
    }

    /// Body size implied by the header. Every message is self-delimiting
    /// through the type and extensions.
    pub fn payload_size(&self) -> Result<usize, ParseError> {
        let size = match self.message_type {
            MessageType::Invalid | MessageType::NotAType => return Err(ParseError),
            MessageType::Keepalive => KEEPALIVE_PEERS * ENDPOINT_SIZE,
            MessageType::Publish => {
                let block_type = self.block_type().ok_or(ParseError)?;
                let size = Block::serialized_size(block_type);
                if size == 0 {
                    return Err(ParseError);
                }
                size
            }
            MessageType::ConfirmReq => self.count() * 64,
            MessageType::ConfirmAck => 32 + 64 + 8 + self.count() * 32,
            MessageType::NodeIdHandshake => {
                let mut size = 0;
                if self.extensions & extensions::HANDSHAKE_QUERY != 0 {
                    size += 32;
                }
                if self.extensions & extensions::HANDSHAKE_RESPONSE != 0 {
                    size += 32 + 64;
                }
                size
            }
            MessageType::TelemetryReq => 0,
            MessageType::TelemetryAck => (self.extensions & extensions::SIZE_MASK) as usize,
            // Pull payloads can exceed the masked size range, so the whole
            // extensions field carries their length
            MessageType::AscPullReq | MessageType::AscPullAck => self.extensions as usize,
        };
        Ok(size)
    }

    /// Block type carried by a publish message, packed in extensions.
    pub fn block_type(&self) -> Option<BlockType> {
        BlockType::from_u8(((self.extensions & extensions::BLOCK_TYPE_MASK) >> 8) as u8)
    }

    /// Item count for confirm_req/confirm_ack, packed in the top nibble.
    pub fn count(&self) -> usize {
        ((self.extensions & extensions::COUNT_MASK) >> 12) as usize
    }
}

pub mod extensions {
    pub const BLOCK_TYPE_MASK: u16 = 0x0f00;
    pub const COUNT_MASK: u16 = 0xf000;
    pub const SIZE_MASK: u16 = 0x07ff;
    pub const HANDSHAKE_QUERY: u16 = 0x0001;
    pub const HANDSHAKE_RESPONSE: u16 = 0x0002;
}

/// Response half of the node-id handshake: the peer proves possession of its
/// node id by signing the received cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub node_id: Account,
    pub signature: Signature,
}

/// Minimal vote container for confirm_ack frames. Vote counting itself lives
/// in the external election layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub account: Account,
    pub signature: Signature,
    pub timestamp: u64,
    pub hashes: Vec<BlockHash>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryData {
    pub node_id: Account,
    pub block_count: u64,
    pub cemented_count: u64,
    pub account_count: u64,
    pub peer_count: u32,
    pub protocol_version: u8,
    pub uptime_seconds: u64,
    pub genesis_block: BlockHash,
    pub timestamp: u64,
}

impl TelemetryData {
    const WIRE_SIZE: usize = 32 + 8 + 8 + 8 + 4 + 1 + 8 + 32 + 8;

    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.node_id.as_bytes());
        out.extend_from_slice(&self.block_count.to_be_bytes());
        out.extend_from_slice(&self.cemented_count.to_be_bytes());
        out.extend_from_slice(&self.account_count.to_be_bytes());
        out.extend_from_slice(&self.peer_count.to_be_bytes());
        out.push(self.protocol_version);
        out.extend_from_slice(&self.uptime_seconds.to_be_bytes());
        out.extend_from_slice(self.genesis_block.as_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
    }

    fn deserialize(reader: &mut ByteReader<'_>) -> Result<Self, ParseError> {
        Ok(Self {
            node_id: Account::from_bytes(reader.take::<32>()?),
            block_count: u64::from_be_bytes(reader.take::<8>()?),
            cemented_count: u64::from_be_bytes(reader.take::<8>()?),
            account_count: u64::from_be_bytes(reader.take::<8>()?),
            peer_count: u32::from_be_bytes(reader.take::<4>()?),
            protocol_version: reader.take_u8()?,
            uptime_seconds: u64::from_be_bytes(reader.take::<8>()?),
            genesis_block: BlockHash::from_bytes(reader.take::<32>()?),
            timestamp: u64::from_be_bytes(reader.take::<8>()?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AscPullType {
    Blocks = 0x1,
    AccountInfo = 0x2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AscPullReqPayload {
    /// Pull a run of blocks starting from an account frontier or a hash.
    Blocks { start: U256, count: u8 },
    /// Ask for the head state of one account (by account or dependency hash).
    AccountInfo { target: U256 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AscPullAckPayload {
    Blocks {
        blocks: Vec<Arc<Block>>,
    },
    AccountInfo {
        account: Account,
        head: BlockHash,
        head_height: u64,
        conf_frontier: BlockHash,
        conf_height: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Keepalive {
        peers: Vec<SocketAddrV6>,
    },
    Publish {
        block: Arc<Block>,
    },
    ConfirmReq {
        roots_hashes: Vec<(BlockHash, Root)>,
    },
    ConfirmAck {
        vote: Vote,
    },
    NodeIdHandshake {
        query: Option<[u8; 32]>,
        response: Option<HandshakeResponse>,
    },
    TelemetryReq,
    TelemetryAck {
        data: TelemetryData,
    },
    AscPullReq {
        id: u64,
        payload: AscPullReqPayload,
    },
    AscPullAck {
        id: u64,
        payload: AscPullAckPayload,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Keepalive { .. } => MessageType::Keepalive,
            Message::Publish { .. } => MessageType::Publish,
            Message::ConfirmReq { .. } => MessageType::ConfirmReq,
            Message::ConfirmAck { .. } => MessageType::ConfirmAck,
            Message::NodeIdHandshake { .. } => MessageType::NodeIdHandshake,
            Message::TelemetryReq => MessageType::TelemetryReq,
            Message::TelemetryAck { .. } => MessageType::TelemetryAck,
            Message::AscPullReq { .. } => MessageType::AscPullReq,
            Message::AscPullAck { .. } => MessageType::AscPullAck,
        }
    }

    fn body(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Message::Keepalive { peers } => {
                for i in 0..KEEPALIVE_PEERS {
                    let peer = peers
                        .get(i)
                        .copied()
                        .unwrap_or_else(|| SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0));
                    out.extend_from_slice(&peer.ip().octets());
                    out.extend_from_slice(&peer.port().to_le_bytes());
                }
            }
            Message::Publish { block } => block.serialize(&mut out),
            Message::ConfirmReq { roots_hashes } => {
                for (hash, root) in roots_hashes {
                    out.extend_from_slice(hash.as_bytes());
                    out.extend_from_slice(root.as_bytes());
                }
            }
            Message::ConfirmAck { vote } => {
                out.extend_from_slice(vote.account.as_bytes());
                out.extend_from_slice(vote.signature.as_bytes());
                out.extend_from_slice(&vote.timestamp.to_le_bytes());
                for hash in &vote.hashes {
                    out.extend_from_slice(hash.as_bytes());
                }
            }
            Message::NodeIdHandshake { query, response } => {
                if let Some(cookie) = query {
                    out.extend_from_slice(cookie);
                }
                if let Some(response) = response {
                    out.extend_from_slice(response.node_id.as_bytes());
                    out.extend_from_slice(response.signature.as_bytes());
                }
            }
            Message::TelemetryReq => {}
            Message::TelemetryAck { data } => data.serialize(&mut out),
            Message::AscPullReq { id, payload } => {
                match payload {
                    AscPullReqPayload::Blocks { .. } => out.push(AscPullType::Blocks as u8),
                    AscPullReqPayload::AccountInfo { .. } => {
                        out.push(AscPullType::AccountInfo as u8)
                    }
                }
                out.extend_from_slice(&id.to_be_bytes());
                match payload {
                    AscPullReqPayload::Blocks { start, count } => {
                        out.extend_from_slice(start.as_bytes());
                        out.push(*count);
                    }
                    AscPullReqPayload::AccountInfo { target } => {
                        out.extend_from_slice(target.as_bytes());
                    }
                }
            }
            Message::AscPullAck { id, payload } => {
                match payload {
                    AscPullAckPayload::Blocks { .. } => out.push(AscPullType::Blocks as u8),
                    AscPullAckPayload::AccountInfo { .. } => {
                        out.push(AscPullType::AccountInfo as u8)
                    }
                }
                out.extend_from_slice(&id.to_be_bytes());
                match payload {
                    AscPullAckPayload::Blocks { blocks } => {
                        for block in blocks {
                            out.push(block.block_type() as u8);
                            block.serialize(&mut out);
                        }
                        out.push(BlockType::NotABlock as u8);
                    }
                    AscPullAckPayload::AccountInfo {
                        account,
                        head,
                        head_height,
                        conf_frontier,
                        conf_height,
                    } => {
                        out.extend_from_slice(account.as_bytes());
                        out.extend_from_slice(head.as_bytes());
                        out.extend_from_slice(&head_height.to_be_bytes());
                        out.extend_from_slice(conf_frontier.as_bytes());
                        out.extend_from_slice(&conf_height.to_be_bytes());
                    }
                }
            }
        }
        out
    }

    fn extensions(&self, body_size: usize) -> u16 {
        match self {
            Message::Publish { block } => (block.block_type() as u16) << 8,
            Message::ConfirmReq { roots_hashes } => {
                debug_assert!(roots_hashes.len() <= 15);
                (roots_hashes.len() as u16) << 12
            }
            Message::ConfirmAck { vote } => {
                debug_assert!(vote.hashes.len() <= 15);
                (vote.hashes.len() as u16) << 12
            }
            Message::NodeIdHandshake { query, response } => {
                let mut extensions = 0;
                if query.is_some() {
                    extensions |= extensions::HANDSHAKE_QUERY;
                }
                if response.is_some() {
                    extensions |= extensions::HANDSHAKE_RESPONSE;
                }
                extensions
            }
            Message::TelemetryAck { .. } => {
                debug_assert!(body_size <= extensions::SIZE_MASK as usize);
                body_size as u16 & extensions::SIZE_MASK
            }
            Message::AscPullReq { .. } | Message::AscPullAck { .. } => {
                debug_assert!(body_size <= u16::MAX as usize);
                body_size as u16
            }
            _ => 0,
        }
    }

    /// Full frame: header followed by the type-dependent body.
    pub fn serialize(&self, network: NetworkKind, version: u8, version_min: u8) -> Vec<u8> {
        let body = self.body();
        let header = MessageHeader::new(
            network,
            version,
            version_min,
            self.message_type(),
            self.extensions(body.len()),
        );
        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        header.serialize(&mut out);
        out.extend_from_slice(&body);
        out
    }

    pub fn deserialize(header: &MessageHeader, body: &[u8]) -> Result<Message, ParseError> {
        let mut reader = ByteReader::new(body);
        let message = match header.message_type {
            MessageType::Invalid | MessageType::NotAType => return Err(ParseError),
            MessageType::Keepalive => {
                let mut peers = Vec::with_capacity(KEEPALIVE_PEERS);
                for _ in 0..KEEPALIVE_PEERS {
                    let octets = reader.take::<16>()?;
                    let port = u16::from_le_bytes(reader.take::<2>()?);
                    peers.push(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0));
                }
                Message::Keepalive { peers }
            }
            MessageType::Publish => {
                let block_type = header.block_type().ok_or(ParseError)?;
                let block = Block::deserialize(block_type, &mut reader)?;
                Message::Publish {
                    block: Arc::new(block),
                }
            }
            MessageType::ConfirmReq => {
                let mut roots_hashes = Vec::with_capacity(header.count());
                for _ in 0..header.count() {
                    let hash = BlockHash::from_bytes(reader.take::<32>()?);
                    let root = Root::from_bytes(reader.take::<32>()?);
                    roots_hashes.push((hash, root));
                }
                Message::ConfirmReq { roots_hashes }
            }
            MessageType::ConfirmAck => {
                let account = Account::from_bytes(reader.take::<32>()?);
                let signature = Signature::from_bytes(reader.take::<64>()?);
                let timestamp = u64::from_le_bytes(reader.take::<8>()?);
                let mut hashes = Vec::with_capacity(header.count());
                for _ in 0..header.count() {
                    hashes.push(BlockHash::from_bytes(reader.take::<32>()?));
                }
                Message::ConfirmAck {
                    vote: Vote {
                        account,
                        signature,
                        timestamp,
                        hashes,
                    },
                }
            }
            MessageType::NodeIdHandshake => {
                let query = if header.extensions & extensions::HANDSHAKE_QUERY != 0 {
                    Some(reader.take::<32>()?)
                } else {
                    None
                };
                let response = if header.extensions & extensions::HANDSHAKE_RESPONSE != 0 {
                    Some(HandshakeResponse {
                        node_id: Account::from_bytes(reader.take::<32>()?),
                        signature: Signature::from_bytes(reader.take::<64>()?),
                    })
                } else {
                    None
                };
                Message::NodeIdHandshake { query, response }
            }
            MessageType::TelemetryReq => Message::TelemetryReq,
            MessageType::TelemetryAck => Message::TelemetryAck {
                data: TelemetryData::deserialize(&mut reader)?,
            },
            MessageType::AscPullReq => {
                let pull_type = reader.take_u8()?;
                let id = u64::from_be_bytes(reader.take::<8>()?);
                let payload = match pull_type {
                    x if x == AscPullType::Blocks as u8 => AscPullReqPayload::Blocks {
                        start: U256::from_bytes(reader.take::<32>()?),
                        count: reader.take_u8()?,
                    },
                    x if x == AscPullType::AccountInfo as u8 => AscPullReqPayload::AccountInfo {
                        target: U256::from_bytes(reader.take::<32>()?),
                    },
                    _ => return Err(ParseError),
                };
                Message::AscPullReq { id, payload }
            }
            MessageType::AscPullAck => {
                let pull_type = reader.take_u8()?;
                let id = u64::from_be_bytes(reader.take::<8>()?);
                let payload = match pull_type {
                    x if x == AscPullType::Blocks as u8 => {
                        let mut blocks = Vec::new();
                        loop {
                            let block_type =
                                BlockType::from_u8(reader.take_u8()?).ok_or(ParseError)?;
                            if block_type == BlockType::NotABlock {
                                break;
                            }
                            blocks.push(Arc::new(Block::deserialize(block_type, &mut reader)?));
                        }
                        AscPullAckPayload::Blocks { blocks }
                    }
                    x if x == AscPullType::AccountInfo as u8 => AscPullAckPayload::AccountInfo {
                        account: Account::from_bytes(reader.take::<32>()?),
                        head: BlockHash::from_bytes(reader.take::<32>()?),
                        head_height: u64::from_be_bytes(reader.take::<8>()?),
                        conf_frontier: BlockHash::from_bytes(reader.take::<32>()?),
                        conf_height: u64::from_be_bytes(reader.take::<8>()?),
                    },
                    _ => return Err(ParseError),
                };
                Message::AscPullAck { id, payload }
            }
        };
        if reader.remaining() != 0 {
            return Err(ParseError);
        }
        Ok(message)
    }
}

/// Normalizes an endpoint to IPv6 with v4-mapped addresses preserved.
pub fn map_endpoint_to_v6(endpoint: SocketAddr) -> SocketAddrV6 {
    match endpoint {
        SocketAddr::V4(v4) => SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0),
        SocketAddr::V6(v6) => v6,
    }
}

/// The /64 prefix used for per-subnetwork connection limits.
pub fn subnet_prefix(address: &Ipv6Addr) -> [u8; 8] {
    let octets = address.octets();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&octets[..8]);
    prefix
}

pub fn ip_of(endpoint: SocketAddr) -> Ipv6Addr {
    match endpoint.ip() {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}
