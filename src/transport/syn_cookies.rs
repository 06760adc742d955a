use std::collections::HashMap;
use std::net::SocketAddrV6;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::crypto::validate_message;
use crate::numbers::{Account, Signature};

/// Per-remote random nonces proving possession of an endpoint during the
/// node-id handshake. One live cookie per endpoint, expiring after the TTL.
pub struct SynCookies {
    ttl: Duration,
    cookies: Mutex<HashMap<SocketAddrV6, (Cookie, Instant)>>,
}

pub type Cookie = [u8; 32];

impl SynCookies {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cookies: Mutex::new(HashMap::new()),
        }
    }

    /// Issues a cookie for `endpoint`, or `None` while one is still live.
    pub fn assign(&self, endpoint: SocketAddrV6) -> Option<Cookie> {
        let mut cookies = self.cookies.lock();
        let now = Instant::now();
        if let Some((_, issued)) = cookies.get(&endpoint) {
            if now.duration_since(*issued) < self.ttl {
                return None;
            }
        }
        let mut cookie = [0u8; 32];
        OsRng.fill_bytes(&mut cookie);
        cookies.insert(endpoint, (cookie, now));
        Some(cookie)
    }

    /// Checks the peer's signature over the cookie issued to `endpoint`. The
    /// cookie is consumed regardless of the outcome.
    pub fn validate(
        &self,
        endpoint: SocketAddrV6,
        node_id: &Account,
        signature: &Signature,
    ) -> bool {
        let entry = self.cookies.lock().remove(&endpoint);
        match entry {
            Some((cookie, issued)) => {
                if issued.elapsed() >= self.ttl {
                    return false;
                }
                validate_message(node_id, &cookie, signature)
            }
            None => false,
        }
    }

    /// Drops expired cookies.
    pub fn purge(&self) {
        let ttl = self.ttl;
        self.cookies
            .lock()
            .retain(|_, (_, issued)| issued.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.cookies.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.lock().is_empty()
    }

    pub fn cookie(&self, endpoint: &SocketAddrV6) -> Option<Cookie> {
        self.cookies.lock().get(endpoint).map(|(cookie, _)| *cookie)
    }
}
