use std::fmt;

use crate::crypto::{blake2b, sign_message, validate_message};
use crate::epoch::Epoch;
use crate::numbers::{
    Account, Amount, BlockHash, Link, ParseError, QualifiedRoot, RawKey, Root, Signature,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockType {
    Invalid = 0,
    NotABlock = 1,
    Send = 2,
    Receive = 3,
    Open = 4,
    Change = 5,
    State = 6,
}

impl BlockType {
    pub fn from_u8(value: u8) -> Option<BlockType> {
        match value {
            0 => Some(BlockType::Invalid),
            1 => Some(BlockType::NotABlock),
            2 => Some(BlockType::Send),
            3 => Some(BlockType::Receive),
            4 => Some(BlockType::Open),
            5 => Some(BlockType::Change),
            6 => Some(BlockType::State),
            _ => None,
        }
    }
}

/// Cursor over a byte slice used by the wire codecs.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn take<const N: usize>(&mut self) -> Result<[u8; N], ParseError> {
        if self.offset + N > self.data.len() {
            return Err(ParseError);
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.offset..self.offset + N]);
        self.offset += N;
        Ok(out)
    }

    pub fn take_u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendBlock {
    pub previous: BlockHash,
    pub destination: Account,
    pub balance: Amount,
    pub signature: Signature,
    pub work: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveBlock {
    pub previous: BlockHash,
    pub source: BlockHash,
    pub signature: Signature,
    pub work: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenBlock {
    pub source: BlockHash,
    pub representative: Account,
    pub account: Account,
    pub signature: Signature,
    pub work: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBlock {
    pub previous: BlockHash,
    pub representative: Account,
    pub signature: Signature,
    pub work: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateBlock {
    pub account: Account,
    pub previous: BlockHash,
    pub representative: Account,
    pub balance: Amount,
    pub link: Link,
    pub signature: Signature,
    pub work: u64,
}

/// Tagged union over the block variants. Blocks are immutable once built and
/// shared behind `Arc` between the processing queues.
#[derive(Clone, PartialEq, Eq)]
pub enum Block {
    Send(SendBlock),
    Receive(ReceiveBlock),
    Open(OpenBlock),
    Change(ChangeBlock),
    State(StateBlock),
}

impl Block {
    pub fn block_type(&self) -> BlockType {
        match self {
            Block::Send(_) => BlockType::Send,
            Block::Receive(_) => BlockType::Receive,
            Block::Open(_) => BlockType::Open,
            Block::Change(_) => BlockType::Change,
            Block::State(_) => BlockType::State,
        }
    }

    /// Content-derived BLAKE2b digest of the canonical hashable fields.
    pub fn hash(&self) -> BlockHash {
        let digest = match self {
            Block::Send(block) => blake2b::<32>(&[
                block.previous.as_bytes(),
                block.destination.as_bytes(),
                &block.balance.to_be_bytes(),
            ]),
            Block::Receive(block) => {
                blake2b::<32>(&[block.previous.as_bytes(), block.source.as_bytes()])
            }
            Block::Open(block) => blake2b::<32>(&[
                block.source.as_bytes(),
                block.representative.as_bytes(),
                block.account.as_bytes(),
            ]),
            Block::Change(block) => {
                blake2b::<32>(&[block.previous.as_bytes(), block.representative.as_bytes()])
            }
            Block::State(block) => {
                let mut preamble = [0u8; 32];
                preamble[31] = BlockType::State as u8;
                blake2b::<32>(&[
                    &preamble,
                    block.account.as_bytes(),
                    block.previous.as_bytes(),
                    block.representative.as_bytes(),
                    &block.balance.to_be_bytes(),
                    block.link.as_bytes(),
                ])
            }
        };
        BlockHash::from_bytes(digest)
    }

    pub fn previous(&self) -> BlockHash {
        match self {
            Block::Send(block) => block.previous,
            Block::Receive(block) => block.previous,
            Block::Open(_) => BlockHash::ZERO,
            Block::Change(block) => block.previous,
            Block::State(block) => block.previous,
        }
    }

    /// The previous hash, or the account for first blocks in a chain.
    pub fn root(&self) -> Root {
        match self {
            Block::Open(block) => Root::from(block.account),
            Block::State(block) if block.previous.is_zero() => Root::from(block.account),
            _ => Root::from(self.previous()),
        }
    }

    pub fn qualified_root(&self) -> QualifiedRoot {
        QualifiedRoot::new(self.root(), self.previous())
    }

    pub fn account_field(&self) -> Option<Account> {
        match self {
            Block::Open(block) => Some(block.account),
            Block::State(block) => Some(block.account),
            _ => None,
        }
    }

    /// Source hash claimed by legacy receive/open blocks.
    pub fn source_field(&self) -> Option<BlockHash> {
        match self {
            Block::Receive(block) => Some(block.source),
            Block::Open(block) => Some(block.source),
            _ => None,
        }
    }

    pub fn destination_field(&self) -> Option<Account> {
        match self {
            Block::Send(block) => Some(block.destination),
            _ => None,
        }
    }

    pub fn link_field(&self) -> Option<Link> {
        match self {
            Block::State(block) => Some(block.link),
            _ => None,
        }
    }

    pub fn representative_field(&self) -> Option<Account> {
        match self {
            Block::Open(block) => Some(block.representative),
            Block::Change(block) => Some(block.representative),
            Block::State(block) => Some(block.representative),
            _ => None,
        }
    }

    pub fn balance_field(&self) -> Option<Amount> {
        match self {
            Block::Send(block) => Some(block.balance),
            Block::State(block) => Some(block.balance),
            _ => None,
        }
    }

    pub fn signature(&self) -> Signature {
        match self {
            Block::Send(block) => block.signature,
            Block::Receive(block) => block.signature,
            Block::Open(block) => block.signature,
            Block::Change(block) => block.signature,
            Block::State(block) => block.signature,
        }
    }

    pub fn work(&self) -> u64 {
        match self {
            Block::Send(block) => block.work,
            Block::Receive(block) => block.work,
            Block::Open(block) => block.work,
            Block::Change(block) => block.work,
            Block::State(block) => block.work,
        }
    }

    pub fn valid_signature(&self, signer: &Account) -> bool {
        validate_message(signer, self.hash().as_bytes(), &self.signature())
    }

    pub fn serialized_size(block_type: BlockType) -> usize {
        match block_type {
            BlockType::Send => 32 + 32 + 16 + 64 + 8,
            BlockType::Receive => 32 + 32 + 64 + 8,
            BlockType::Open => 32 + 32 + 32 + 64 + 8,
            BlockType::Change => 32 + 32 + 64 + 8,
            BlockType::State => 32 + 32 + 32 + 16 + 32 + 64 + 8,
            BlockType::Invalid | BlockType::NotABlock => 0,
        }
    }

    /// Canonical wire form. Legacy blocks carry the work nonce little-endian,
    /// state blocks big-endian.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        match self {
            Block::Send(block) => {
                out.extend_from_slice(block.previous.as_bytes());
                out.extend_from_slice(block.destination.as_bytes());
                out.extend_from_slice(&block.balance.to_be_bytes());
                out.extend_from_slice(block.signature.as_bytes());
                out.extend_from_slice(&block.work.to_le_bytes());
            }
            Block::Receive(block) => {
                out.extend_from_slice(block.previous.as_bytes());
                out.extend_from_slice(block.source.as_bytes());
                out.extend_from_slice(block.signature.as_bytes());
                out.extend_from_slice(&block.work.to_le_bytes());
            }
            Block::Open(block) => {
                out.extend_from_slice(block.source.as_bytes());
                out.extend_from_slice(block.representative.as_bytes());
                out.extend_from_slice(block.account.as_bytes());
                out.extend_from_slice(block.signature.as_bytes());
                out.extend_from_slice(&block.work.to_le_bytes());
            }
            Block::Change(block) => {
                out.extend_from_slice(block.previous.as_bytes());
                out.extend_from_slice(block.representative.as_bytes());
                out.extend_from_slice(block.signature.as_bytes());
                out.extend_from_slice(&block.work.to_le_bytes());
            }
            Block::State(block) => {
                out.extend_from_slice(block.account.as_bytes());
                out.extend_from_slice(block.previous.as_bytes());
                out.extend_from_slice(block.representative.as_bytes());
                out.extend_from_slice(&block.balance.to_be_bytes());
                out.extend_from_slice(block.link.as_bytes());
                out.extend_from_slice(block.signature.as_bytes());
                out.extend_from_slice(&block.work.to_be_bytes());
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::serialized_size(self.block_type()));
        self.serialize(&mut out);
        out
    }

    pub(crate) fn deserialize(
        block_type: BlockType,
        reader: &mut ByteReader<'_>,
    ) -> Result<Block, ParseError> {
        match block_type {
            BlockType::Send => Ok(Block::Send(SendBlock {
                previous: BlockHash::from_bytes(reader.take::<32>()?),
                destination: Account::from_bytes(reader.take::<32>()?),
                balance: Amount::from_be_bytes(reader.take::<16>()?),
                signature: Signature::from_bytes(reader.take::<64>()?),
                work: u64::from_le_bytes(reader.take::<8>()?),
            })),
            BlockType::Receive => Ok(Block::Receive(ReceiveBlock {
                previous: BlockHash::from_bytes(reader.take::<32>()?),
                source: BlockHash::from_bytes(reader.take::<32>()?),
                signature: Signature::from_bytes(reader.take::<64>()?),
                work: u64::from_le_bytes(reader.take::<8>()?),
            })),
            BlockType::Open => Ok(Block::Open(OpenBlock {
                source: BlockHash::from_bytes(reader.take::<32>()?),
                representative: Account::from_bytes(reader.take::<32>()?),
                account: Account::from_bytes(reader.take::<32>()?),
                signature: Signature::from_bytes(reader.take::<64>()?),
                work: u64::from_le_bytes(reader.take::<8>()?),
            })),
            BlockType::Change => Ok(Block::Change(ChangeBlock {
                previous: BlockHash::from_bytes(reader.take::<32>()?),
                representative: Account::from_bytes(reader.take::<32>()?),
                signature: Signature::from_bytes(reader.take::<64>()?),
                work: u64::from_le_bytes(reader.take::<8>()?),
            })),
            BlockType::State => Ok(Block::State(StateBlock {
                account: Account::from_bytes(reader.take::<32>()?),
                previous: BlockHash::from_bytes(reader.take::<32>()?),
                representative: Account::from_bytes(reader.take::<32>()?),
                balance: Amount::from_be_bytes(reader.take::<16>()?),
                link: Link::from_bytes(reader.take::<32>()?),
                signature: Signature::from_bytes(reader.take::<64>()?),
                work: u64::from_be_bytes(reader.take::<8>()?),
            })),
            BlockType::Invalid | BlockType::NotABlock => Err(ParseError),
        }
    }

    pub fn from_bytes(block_type: BlockType, data: &[u8]) -> Result<Block, ParseError> {
        let mut reader = ByteReader::new(data);
        Self::deserialize(block_type, &mut reader)
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.block_type(), self.hash())
    }
}

/*
 * Sideband
 */

/// Flags and epoch packed into a single byte: epoch occupies the low five
/// bits, is_epoch bit 5, is_receive bit 6, is_send bit 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDetails {
    pub epoch: Epoch,
    pub is_send: bool,
    pub is_receive: bool,
    pub is_epoch: bool,
}

impl BlockDetails {
    pub fn new(epoch: Epoch, is_send: bool, is_receive: bool, is_epoch: bool) -> Self {
        debug_assert!((is_send as u8 + is_receive as u8 + is_epoch as u8) <= 1);
        Self {
            epoch,
            is_send,
            is_receive,
            is_epoch,
        }
    }

    pub fn packed(&self) -> u8 {
        let mut result = self.epoch.as_u8() & 0x1f;
        if self.is_epoch {
            result |= 1 << 5;
        }
        if self.is_receive {
            result |= 1 << 6;
        }
        if self.is_send {
            result |= 1 << 7;
        }
        result
    }

    pub fn unpack(packed: u8) -> Result<Self, ParseError> {
        let epoch = Epoch::from_u8(packed & 0x1f).ok_or(ParseError)?;
        Ok(Self {
            epoch,
            is_send: packed & (1 << 7) != 0,
            is_receive: packed & (1 << 6) != 0,
            is_epoch: packed & (1 << 5) != 0,
        })
    }
}

/// Derived data stored alongside each block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSideband {
    pub successor: BlockHash,
    pub account: Account,
    pub balance: Amount,
    pub height: u64,
    pub timestamp: u64,
    pub details: BlockDetails,
    pub source_epoch: Epoch,
}

impl BlockSideband {
    pub fn serialize(&self, out: &mut Vec<u8>, block_type: BlockType) {
        out.extend_from_slice(self.successor.as_bytes());
        if block_type != BlockType::State && block_type != BlockType::Open {
            out.extend_from_slice(self.account.as_bytes());
        }
        if block_type != BlockType::Open {
            out.extend_from_slice(&self.height.to_be_bytes());
        }
        if matches!(
            block_type,
            BlockType::Receive | BlockType::Change | BlockType::Open
        ) {
            out.extend_from_slice(&self.balance.to_be_bytes());
        }
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        if block_type == BlockType::State {
            out.push(self.details.packed());
            out.push(self.source_epoch.as_u8());
        }
    }

    pub(crate) fn deserialize(
        reader: &mut ByteReader<'_>,
        block_type: BlockType,
    ) -> Result<Self, ParseError> {
        let successor = BlockHash::from_bytes(reader.take::<32>()?);
        let account = if block_type != BlockType::State && block_type != BlockType::Open {
            Account::from_bytes(reader.take::<32>()?)
        } else {
            Account::ZERO
        };
        let height = if block_type != BlockType::Open {
            u64::from_be_bytes(reader.take::<8>()?)
        } else {
            1
        };
        let balance = if matches!(
            block_type,
            BlockType::Receive | BlockType::Change | BlockType::Open
        ) {
            Amount::from_be_bytes(reader.take::<16>()?)
        } else {
            Amount::ZERO
        };
        let timestamp = u64::from_be_bytes(reader.take::<8>()?);
        let (details, source_epoch) = if block_type == BlockType::State {
            let details = BlockDetails::unpack(reader.take_u8()?)?;
            let source_epoch = Epoch::from_u8(reader.take_u8()?).ok_or(ParseError)?;
            (details, source_epoch)
        } else {
            (
                BlockDetails::new(Epoch::Epoch0, false, false, false),
                Epoch::Epoch0,
            )
        };
        Ok(Self {
            successor,
            account,
            balance,
            height,
            timestamp,
            details,
            source_epoch,
        })
    }
}

/// A block together with its sideband, as persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedBlock {
    pub block: std::sync::Arc<Block>,
    pub sideband: BlockSideband,
}

impl SavedBlock {
    pub fn new(block: std::sync::Arc<Block>, sideband: BlockSideband) -> Self {
        Self { block, sideband }
    }

    pub fn hash(&self) -> BlockHash {
        self.block.hash()
    }

    /// The account this block belongs to, resolved through the sideband for
    /// legacy blocks that do not carry it.
    pub fn account(&self) -> Account {
        self.block.account_field().unwrap_or(self.sideband.account)
    }

    pub fn balance(&self) -> Amount {
        self.block.balance_field().unwrap_or(self.sideband.balance)
    }

    pub fn height(&self) -> u64 {
        self.sideband.height
    }

    pub fn is_send(&self) -> bool {
        match self.block.as_ref() {
            Block::Send(_) => true,
            Block::State(_) => self.sideband.details.is_send,
            _ => false,
        }
    }

    pub fn is_receive(&self) -> bool {
        match self.block.as_ref() {
            Block::Receive(_) | Block::Open(_) => true,
            Block::State(_) => self.sideband.details.is_receive,
            _ => false,
        }
    }

    pub fn is_epoch(&self) -> bool {
        match self.block.as_ref() {
            Block::State(_) => self.sideband.details.is_epoch,
            _ => false,
        }
    }

    /// Destination account for sends, regardless of block flavor.
    pub fn destination(&self) -> Option<Account> {
        match self.block.as_ref() {
            Block::Send(send) => Some(send.destination),
            Block::State(state) if self.sideband.details.is_send => Some(state.link.as_account()),
            _ => None,
        }
    }

    /// Source hash for receives, regardless of block flavor.
    pub fn source(&self) -> Option<BlockHash> {
        match self.block.as_ref() {
            Block::Receive(receive) => Some(receive.source),
            Block::Open(open) => Some(open.source),
            Block::State(state) if self.sideband.details.is_receive => {
                Some(state.link.as_block_hash())
            }
            _ => None,
        }
    }
}

/*
 * Builder
 */

/// Fluent constructor used by tests and genesis bootstrap.
pub struct BlockBuilder;

impl BlockBuilder {
    pub fn state() -> StateBlockBuilder {
        StateBlockBuilder::default()
    }

    pub fn send() -> SendBlockBuilder {
        SendBlockBuilder::default()
    }

    pub fn receive() -> ReceiveBlockBuilder {
        ReceiveBlockBuilder::default()
    }

    pub fn open() -> OpenBlockBuilder {
        OpenBlockBuilder::default()
    }

    pub fn change() -> ChangeBlockBuilder {
        ChangeBlockBuilder::default()
    }
}

fn signed(mut block: Block, prv: &RawKey, pub_key: &Account) -> Block {
    let hash = block.hash();
    let signature = sign_message(prv, pub_key, hash.as_bytes()).expect("valid signing key");
    match &mut block {
        Block::Send(b) => b.signature = signature,
        Block::Receive(b) => b.signature = signature,
        Block::Open(b) => b.signature = signature,
        Block::Change(b) => b.signature = signature,
        Block::State(b) => b.signature = signature,
    }
    block
}

#[derive(Default)]
pub struct StateBlockBuilder {
    account: Account,
    previous: BlockHash,
    representative: Account,
    balance: Amount,
    link: Link,
    work: u64,
}

impl StateBlockBuilder {
    pub fn account(mut self, account: Account) -> Self {
        self.account = account;
        self
    }

    pub fn previous(mut self, previous: BlockHash) -> Self {
        self.previous = previous;
        self
    }

    pub fn representative(mut self, representative: Account) -> Self {
        self.representative = representative;
        self
    }

    pub fn balance(mut self, balance: Amount) -> Self {
        self.balance = balance;
        self
    }

    pub fn link(mut self, link: Link) -> Self {
        self.link = link;
        self
    }

    pub fn work(mut self, work: u64) -> Self {
        self.work = work;
        self
    }

    pub fn sign(self, prv: &RawKey, pub_key: &Account) -> Block {
        let block = Block::State(StateBlock {
            account: self.account,
            previous: self.previous,
            representative: self.representative,
            balance: self.balance,
            link: self.link,
            signature: Signature::ZERO,
            work: self.work,
        });
        signed(block, prv, pub_key)
    }
}

#[derive(Default)]
pub struct SendBlockBuilder {
    previous: BlockHash,
    destination: Account,
    balance: Amount,
    work: u64,
}

impl SendBlockBuilder {
    pub fn previous(mut self, previous: BlockHash) -> Self {
        self.previous = previous;
        self
    }

    pub fn destination(mut self, destination: Account) -> Self {
        self.destination = destination;
        self
    }

    pub fn balance(mut self, balance: Amount) -> Self {
        self.balance = balance;
        self
    }

    pub fn work(mut self, work: u64) -> Self {
        self.work = work;
        self
    }

    pub fn sign(self, prv: &RawKey, pub_key: &Account) -> Block {
        let block = Block::Send(SendBlock {
            previous: self.previous,
            destination: self.destination,
            balance: self.balance,
            signature: Signature::ZERO,
            work: self.work,
        });
        signed(block, prv, pub_key)
    }
}

#[derive(Default)]
pub struct ReceiveBlockBuilder {
    previous: BlockHash,
    source: BlockHash,
    work: u64,
}

impl ReceiveBlockBuilder {
    pub fn previous(mut self, previous: BlockHash) -> Self {
        self.previous = previous;
        self
    }

    pub fn source(mut self, source: BlockHash) -> Self {
        self.source = source;
        self
    }

    pub fn work(mut self, work: u64) -> Self {
        self.work = work;
        self
    }

    pub fn sign(self, prv: &RawKey, pub_key: &Account) -> Block {
        let block = Block::Receive(ReceiveBlock {
            previous: self.previous,
            source: self.source,
            signature: Signature::ZERO,
            work: self.work,
        });
        signed(block, prv, pub_key)
    }
}

#[derive(Default)]
pub struct OpenBlockBuilder {
    source: BlockHash,
    representative: Account,
    account: Account,
    work: u64,
}

impl OpenBlockBuilder {
    pub fn source(mut self, source: BlockHash) -> Self {
        self.source = source;
        self
    }

    pub fn representative(mut self, representative: Account) -> Self {
        self.representative = representative;
        self
    }

    pub fn account(mut self, account: Account) -> Self {
        self.account = account;
        self
    }

    pub fn work(mut self, work: u64) -> Self {
        self.work = work;
        self
    }

    pub fn sign(self, prv: &RawKey, pub_key: &Account) -> Block {
        let block = Block::Open(OpenBlock {
            source: self.source,
            representative: self.representative,
            account: self.account,
            signature: Signature::ZERO,
            work: self.work,
        });
        signed(block, prv, pub_key)
    }
}

#[derive(Default)]
pub struct ChangeBlockBuilder {
    previous: BlockHash,
    representative: Account,
    work: u64,
}

impl ChangeBlockBuilder {
    pub fn previous(mut self, previous: BlockHash) -> Self {
        self.previous = previous;
        self
    }

    pub fn representative(mut self, representative: Account) -> Self {
        self.representative = representative;
        self
    }

    pub fn work(mut self, work: u64) -> Self {
        self.work = work;
        self
    }

    pub fn sign(self, prv: &RawKey, pub_key: &Account) -> Block {
        let block = Block::Change(ChangeBlock {
            previous: self.previous,
            representative: self.representative,
            signature: Signature::ZERO,
            work: self.work,
        });
        signed(block, prv, pub_key)
    }
}
