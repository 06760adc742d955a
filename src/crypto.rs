use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use ed25519_dalek::{ExpandedSecretKey, Verifier};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::errors::{CoreError, CoreResult};
use crate::numbers::{Account, PublicKey, RawKey, Root, Signature};

/// BLAKE2b digest truncated/extended to `N` bytes over the given parts.
pub fn blake2b<const N: usize>(parts: &[&[u8]]) -> [u8; N] {
    let mut hasher = Blake2bVar::new(N).expect("valid blake2b length");
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; N];
    hasher.finalize_variable(&mut out).expect("digest length");
    out
}

pub fn pub_key(raw: &RawKey) -> CoreResult<Account> {
    let secret = ed25519_dalek::SecretKey::from_bytes(raw.as_bytes())
        .map_err(|err| CoreError::Crypto(format!("invalid secret key bytes: {err}")))?;
    let public = ed25519_dalek::PublicKey::from(&secret);
    Ok(PublicKey::from_bytes(public.to_bytes()))
}

pub fn sign_message(raw: &RawKey, public: &Account, message: &[u8]) -> CoreResult<Signature> {
    let secret = ed25519_dalek::SecretKey::from_bytes(raw.as_bytes())
        .map_err(|err| CoreError::Crypto(format!("invalid secret key bytes: {err}")))?;
    let public = ed25519_dalek::PublicKey::from_bytes(public.as_bytes())
        .map_err(|err| CoreError::Crypto(format!("invalid public key bytes: {err}")))?;
    let expanded = ExpandedSecretKey::from(&secret);
    let signature = expanded.sign(message, &public);
    Ok(Signature::from_bytes(signature.to_bytes()))
}

pub fn validate_message(public: &Account, message: &[u8], signature: &Signature) -> bool {
    let Ok(public) = ed25519_dalek::PublicKey::from_bytes(public.as_bytes()) else {
        return false;
    };
    let Ok(signature) = ed25519_dalek::Signature::from_bytes(signature.as_bytes()) else {
        return false;
    };
    public.verify(message, &signature).is_ok()
}

/// Derives the private key at `index` from a wallet seed.
pub fn deterministic_key(seed: &RawKey, index: u32) -> RawKey {
    RawKey::from_bytes(blake2b::<32>(&[seed.as_bytes(), &index.to_be_bytes()]))
}

/// Ed25519 key pair with the raw seed retained for signing.
#[derive(Clone)]
pub struct KeyPair {
    raw: RawKey,
    account: Account,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self::from_raw(RawKey::from_bytes(bytes)).expect("freshly generated key is valid")
    }

    pub fn from_raw(raw: RawKey) -> CoreResult<Self> {
        let account = pub_key(&raw)?;
        Ok(Self { raw, account })
    }

    pub fn from_hex(input: &str) -> CoreResult<Self> {
        let raw = RawKey::decode_hex(input)
            .map_err(|_| CoreError::Crypto("invalid raw key encoding".into()))?;
        Self::from_raw(raw)
    }

    pub fn raw(&self) -> &RawKey {
        &self.raw
    }

    pub fn account(&self) -> Account {
        self.account
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        sign_message(&self.raw, &self.account, message).expect("key pair holds a valid key")
    }
}

/*
 * Work proofs
 */

/// Work threshold accepted on the live network.
pub const WORK_THRESHOLD_LIVE: u64 = 0xffff_fff8_0000_0000;
/// Deliberately low threshold for the dev network profile.
pub const WORK_THRESHOLD_DEV: u64 = 0xfe00_0000_0000_0000;

/// Difficulty of a work nonce against a root: BLAKE2b(8) over the
/// little-endian nonce followed by the root bytes, read little-endian.
pub fn work_value(root: &Root, work: u64) -> u64 {
    let digest = blake2b::<8>(&[&work.to_le_bytes(), root.as_bytes()]);
    u64::from_le_bytes(digest)
}

pub fn work_validate(threshold: u64, root: &Root, work: u64) -> bool {
    work_value(root, work) >= threshold
}

/// Brute-force work generation, suitable for dev thresholds only.
pub fn work_generate(threshold: u64, root: &Root) -> u64 {
    let mut nonce = OsRng.next_u64();
    while !work_validate(threshold, root, nonce) {
        nonce = nonce.wrapping_add(1);
    }
    nonce
}
