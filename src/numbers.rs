use std::fmt;

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;

/// 10^0, the smallest representable unit.
pub const RAW_RATIO: u128 = 1;
/// 10^30, one nano.
pub const NANO_RATIO: u128 = 1_000_000_000_000_000_000_000_000_000_000;
/// 10^33, one thousand nano.
pub const KNANO_RATIO: u128 = 1_000_000_000_000_000_000_000_000_000_000_000;

/// Error returned by the string codecs. Decoding never mutates the
/// destination: all decoders return a fresh value on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseError;

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed number encoding")
    }
}

impl std::error::Error for ParseError {}

fn hex_nibble(byte: u8) -> Result<u8, ParseError> {
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'a'..=b'f' => Ok(byte - b'a' + 10),
        b'A'..=b'F' => Ok(byte - b'A' + 10),
        _ => Err(ParseError),
    }
}

/// Big-endian fixed-width hex decode. Accepts up to `N * 2` digits, shorter
/// inputs are left-padded; anything longer would alias a different value and
/// is rejected.
fn decode_hex_fixed<const N: usize>(input: &str) -> Result<[u8; N], ParseError> {
    if input.is_empty() || input.len() > N * 2 {
        return Err(ParseError);
    }
    let mut out = [0u8; N];
    let mut nibbles = [0u8; 128];
    debug_assert!(N * 2 <= nibbles.len());
    let offset = N * 2 - input.len();
    for (i, byte) in input.bytes().enumerate() {
        nibbles[offset + i] = hex_nibble(byte)?;
    }
    for i in 0..N {
        out[i] = (nibbles[i * 2] << 4) | nibbles[i * 2 + 1];
    }
    Ok(out)
}

fn encode_hex_fixed(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Validates the shared decimal grammar: digits only, no sign, no leading
/// zeros (a lone "0" is fine).
fn check_dec_grammar(input: &str) -> Result<(), ParseError> {
    if input.is_empty() {
        return Err(ParseError);
    }
    if !input.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError);
    }
    if input.len() > 1 && input.starts_with('0') {
        return Err(ParseError);
    }
    Ok(())
}

/// 128-bit balance with big-endian byte representation.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);
    pub const MAX: Amount = Amount(u128::MAX);

    pub const fn raw(value: u128) -> Self {
        Self(value)
    }

    pub const fn number(self) -> u128 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn to_be_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn saturating_add(self, other: Amount) -> Amount {
        Amount(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    pub fn encode_hex(self) -> String {
        encode_hex_fixed(&self.to_be_bytes())
    }

    pub fn decode_hex(input: &str) -> Result<Self, ParseError> {
        decode_hex_fixed::<16>(input).map(|bytes| Self::from_be_bytes(bytes))
    }

    pub fn encode_dec(self) -> String {
        self.0.to_string()
    }

    pub fn decode_dec(input: &str) -> Result<Self, ParseError> {
        check_dec_grammar(input)?;
        let mut value: u128 = 0;
        for byte in input.bytes() {
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add((byte - b'0') as u128))
                .ok_or(ParseError)?;
        }
        Ok(Self(value))
    }

    /// Decodes `integer[.fraction]` scaled by `scale`. The fraction may not
    /// exceed 30 digits nor be finer than the scale resolves.
    pub fn decode_dec_scaled(input: &str, scale: u128) -> Result<Self, ParseError> {
        let (int_part, frac_part) = match input.split_once('.') {
            Some((i, f)) => (i, Some(f)),
            None => (input, None),
        };
        check_dec_grammar(int_part).map_err(|_| ParseError)?;
        let integer = Self::decode_dec(int_part)?.number();
        let mut value = integer.checked_mul(scale).ok_or(ParseError)?;
        if let Some(frac) = frac_part {
            if frac.is_empty() || frac.len() > 30 {
                return Err(ParseError);
            }
            if !frac.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError);
            }
            let divisor = 10u128
                .checked_pow(frac.len() as u32)
                .filter(|d| scale % d == 0)
                .ok_or(ParseError)?;
            let mut frac_value: u128 = 0;
            for byte in frac.bytes() {
                frac_value = frac_value * 10 + (byte - b'0') as u128;
            }
            value = value
                .checked_add(frac_value.checked_mul(scale / divisor).ok_or(ParseError)?)
                .ok_or(ParseError)?;
        }
        Ok(Self(value))
    }

    /// Formats the amount in units of `scale`, truncating (never rounding)
    /// the fraction to `precision` digits. Digit grouping uses `,`.
    pub fn format_balance(self, scale: u128, precision: usize, group_digits: bool) -> String {
        debug_assert!(scale > 0);
        let integer = self.0 / scale;
        let remainder = self.0 % scale;

        let mut result = if group_digits {
            group_thousands(&integer.to_string())
        } else {
            integer.to_string()
        };

        let scale_digits = decimal_digits(scale);
        if scale_digits > 0 && precision > 0 {
            let mut fraction = format!("{:0width$}", remainder, width = scale_digits);
            fraction.truncate(precision.min(scale_digits));
            while fraction.ends_with('0') {
                fraction.pop();
            }
            if !fraction.is_empty() {
                result.push('.');
                result.push_str(&fraction);
            }
        }
        result
    }
}

/// Number of decimal digits after the point implied by a power-of-ten scale.
fn decimal_digits(scale: u128) -> usize {
    let mut digits = 0;
    let mut value = scale;
    while value >= 10 {
        value /= 10;
        digits += 1;
    }
    digits
}

fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    let len = digits.len();
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u128> for Amount {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

/// 256-bit big-endian byte union. Lexicographic ordering of the bytes equals
/// numeric ordering of the represented value.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct U256(pub [u8; 32]);

impl U256 {
    pub const ZERO: U256 = U256([0u8; 32]);
    pub const MAX: U256 = U256([0xffu8; 32]);

    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    pub fn from_u128(value: u128) -> Self {
        let mut bytes = [0u8; 32];
        bytes[16..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn number(&self) -> primitive_types::U256 {
        primitive_types::U256::from_big_endian(&self.0)
    }

    pub fn from_number(value: primitive_types::U256) -> Self {
        let mut bytes = [0u8; 32];
        value.to_big_endian(&mut bytes);
        Self(bytes)
    }

    pub fn encode_hex(&self) -> String {
        encode_hex_fixed(&self.0)
    }

    pub fn decode_hex(input: &str) -> Result<Self, ParseError> {
        decode_hex_fixed::<32>(input).map(Self)
    }

    pub fn encode_dec(&self) -> String {
        self.number().to_string()
    }

    pub fn decode_dec(input: &str) -> Result<Self, ParseError> {
        check_dec_grammar(input)?;
        let mut value = primitive_types::U256::zero();
        let ten = primitive_types::U256::from(10u8);
        for byte in input.bytes() {
            value = value
                .checked_mul(ten)
                .and_then(|v| v.checked_add(primitive_types::U256::from(byte - b'0')))
                .ok_or(ParseError)?;
        }
        Ok(Self::from_number(value))
    }

    /// Symmetric obfuscation slot: XOR against a BLAKE2b keystream derived
    /// from `key` and `iv`. Applying it twice with the same parameters
    /// restores the plaintext.
    pub fn encrypt(&self, key: &RawKey, iv: &Amount) -> U256 {
        let mut hasher = Blake2bVar::new(32).expect("valid blake2b length");
        hasher.update(key.0.as_bytes());
        hasher.update(&iv.to_be_bytes());
        let mut pad = [0u8; 32];
        hasher.finalize_variable(&mut pad).expect("digest length");
        let mut out = [0u8; 32];
        for i in 0..32 {
            out[i] = self.0[i] ^ pad[i];
        }
        U256(out)
    }

    pub fn decrypt(&self, key: &RawKey, iv: &Amount) -> U256 {
        self.encrypt(key, iv)
    }
}

impl std::ops::BitXor for U256 {
    type Output = U256;

    fn bitxor(self, rhs: U256) -> U256 {
        let mut out = [0u8; 32];
        for i in 0..32 {
            out[i] = self.0[i] ^ rhs.0[i];
        }
        U256(out)
    }
}

impl std::ops::BitXorAssign for U256 {
    fn bitxor_assign(&mut self, rhs: U256) {
        *self = *self ^ rhs;
    }
}

impl fmt::Debug for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode_hex())
    }
}

impl fmt::Display for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode_hex())
    }
}

/// 512-bit big-endian byte union.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct U512(pub [u8; 64]);

impl U512 {
    pub const ZERO: U512 = U512([0u8; 64]);

    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; 64];
        bytes[56..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    pub fn from_halves(upper: U256, lower: U256) -> Self {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&upper.0);
        bytes[32..].copy_from_slice(&lower.0);
        Self(bytes)
    }

    pub fn upper(&self) -> U256 {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&self.0[..32]);
        U256(bytes)
    }

    pub fn lower(&self) -> U256 {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&self.0[32..]);
        U256(bytes)
    }

    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn encode_hex(&self) -> String {
        encode_hex_fixed(&self.0)
    }

    pub fn decode_hex(input: &str) -> Result<Self, ParseError> {
        decode_hex_fixed::<64>(input).map(Self)
    }
}

impl Default for U512 {
    fn default() -> Self {
        Self::ZERO
    }
}

impl std::ops::BitXor for U512 {
    type Output = U512;

    fn bitxor(self, rhs: U512) -> U512 {
        let mut out = [0u8; 64];
        for i in 0..64 {
            out[i] = self.0[i] ^ rhs.0[i];
        }
        U512(out)
    }
}

impl fmt::Debug for U512 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode_hex())
    }
}

impl fmt::Display for U512 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode_hex())
    }
}

macro_rules! u256_newtype {
    ($name:ident) => {
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub U256);

        impl $name {
            pub const ZERO: $name = $name(U256::ZERO);

            pub fn from_u64(value: u64) -> Self {
                Self(U256::from_u64(value))
            }

            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(U256::from_bytes(bytes))
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                self.0.as_bytes()
            }

            pub fn is_zero(&self) -> bool {
                self.0.is_zero()
            }

            pub fn encode_hex(&self) -> String {
                self.0.encode_hex()
            }

            pub fn decode_hex(input: &str) -> Result<Self, ParseError> {
                U256::decode_hex(input).map(Self)
            }
        }

        impl From<U256> for $name {
            fn from(value: U256) -> Self {
                Self(value)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

u256_newtype!(BlockHash);
u256_newtype!(PublicKey);
u256_newtype!(RawKey);
u256_newtype!(WalletId);
u256_newtype!(Link);
u256_newtype!(Root);

/// Accounts are public keys.
pub type Account = PublicKey;

impl Link {
    pub fn as_account(&self) -> Account {
        PublicKey(self.0)
    }

    pub fn as_block_hash(&self) -> BlockHash {
        BlockHash(self.0)
    }
}

impl Root {
    /// For non-open blocks the root is the previous hash.
    pub fn previous(&self) -> BlockHash {
        BlockHash(self.0)
    }

    pub fn as_account(&self) -> Account {
        PublicKey(self.0)
    }
}

impl From<BlockHash> for Root {
    fn from(hash: BlockHash) -> Self {
        Root(hash.0)
    }
}

impl From<Account> for Root {
    fn from(account: Account) -> Self {
        Root(account.0)
    }
}

impl From<Account> for Link {
    fn from(account: Account) -> Self {
        Link(account.0)
    }
}

impl From<BlockHash> for Link {
    fn from(hash: BlockHash) -> Self {
        Link(hash.0)
    }
}

/// Signature over a block or handshake cookie.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature(pub U512);

impl Signature {
    pub const ZERO: Signature = Signature(U512::ZERO);

    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(U512::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        self.0.as_bytes()
    }

    pub fn encode_hex(&self) -> String {
        self.0.encode_hex()
    }

    pub fn decode_hex(input: &str) -> Result<Self, ParseError> {
        U512::decode_hex(input).map(Self)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Root paired with the previous hash, identifying one fork point.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedRoot(pub U512);

impl QualifiedRoot {
    pub fn new(root: Root, previous: BlockHash) -> Self {
        Self(U512::from_halves(root.0, previous.0))
    }

    pub fn root(&self) -> Root {
        Root(self.0.upper())
    }

    pub fn previous(&self) -> BlockHash {
        BlockHash(self.0.lower())
    }
}

impl fmt::Debug for QualifiedRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/*
 * Account address codec
 */

const ACCOUNT_ALPHABET: &[u8; 32] = b"13456789abcdefghijkmnopqrstuwxyz";

fn account_digit(value: u8) -> char {
    ACCOUNT_ALPHABET[value as usize & 0x1f] as char
}

fn account_digit_value(ch: u8) -> Result<u8, ParseError> {
    ACCOUNT_ALPHABET
        .iter()
        .position(|&c| c == ch)
        .map(|p| p as u8)
        .ok_or(ParseError)
}

fn account_checksum(key: &PublicKey) -> u64 {
    let mut hasher = Blake2bVar::new(5).expect("valid blake2b length");
    hasher.update(key.as_bytes());
    let mut digest = [0u8; 5];
    hasher.finalize_variable(&mut digest).expect("digest length");
    // Reversed byte order, little-endian accumulate
    let mut check: u64 = 0;
    for (i, byte) in digest.iter().enumerate() {
        check |= (*byte as u64) << (8 * i);
    }
    check
}

impl PublicKey {
    /// Encodes with the canonical `nano_` prefix: 52 alphabet characters for
    /// the key, 8 for the checksum.
    pub fn to_account(&self) -> String {
        let mut out = String::with_capacity(65);
        out.push_str("nano_");
        // 260 bits, top four bits are zero padding
        let number = primitive_types::U512::from_big_endian(self.as_bytes());
        for i in (0..52).rev() {
            let digit = ((number >> (5 * i)).low_u64() & 0x1f) as u8;
            out.push(account_digit(digit));
        }
        let check = account_checksum(self);
        for i in (0..8).rev() {
            let digit = ((check >> (5 * i)) & 0x1f) as u8;
            out.push(account_digit(digit));
        }
        out
    }

    /// Decodes either the `xrb_` or `nano_` form; `-` is accepted in place of
    /// `_`. A checksum mismatch yields an error without producing a value.
    pub fn decode_account(input: &str) -> Result<Self, ParseError> {
        let body = input
            .strip_prefix("xrb_")
            .or_else(|| input.strip_prefix("xrb-"))
            .or_else(|| input.strip_prefix("nano_"))
            .or_else(|| input.strip_prefix("nano-"))
            .ok_or(ParseError)?;
        Self::decode_account_body(body)
    }

    fn decode_account_body(body: &str) -> Result<Self, ParseError> {
        if body.len() != 60 {
            return Err(ParseError);
        }
        let bytes = body.as_bytes();
        // The first character carries only one significant bit
        if bytes[0] != b'1' && bytes[0] != b'3' {
            return Err(ParseError);
        }
        let mut number = primitive_types::U512::zero();
        for &ch in &bytes[..52] {
            let digit = account_digit_value(ch)?;
            number = (number << 5) | primitive_types::U512::from(digit);
        }
        let mut check: u64 = 0;
        for &ch in &bytes[52..] {
            let digit = account_digit_value(ch)?;
            check = (check << 5) | digit as u64;
        }
        let mut wide = [0u8; 64];
        number.to_big_endian(&mut wide);
        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&wide[32..]);
        let key = PublicKey::from_bytes(key_bytes);
        if account_checksum(&key) != check {
            return Err(ParseError);
        }
        Ok(key)
    }

    pub fn to_node_id(&self) -> String {
        let account = self.to_account();
        format!("node_{}", &account["nano_".len()..])
    }

    pub fn decode_node_id(input: &str) -> Result<Self, ParseError> {
        let body = input.strip_prefix("node_").ok_or(ParseError)?;
        Self::decode_account_body(body)
    }
}
