//! DTLS anti-replay cookies.
//!
//! A server answers a ClientHello without a valid cookie with a
//! HelloVerifyRequest carrying a cookie bound to the client's transport
//! address. Only a client that can receive at that address can echo it, so no
//! per-client state is committed for spoofed sources.
//!
//! cookie = timestamp (4 bytes, big endian) || trunc_28(HMAC(secret, timestamp || address))

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::Error;

type HmacSha256 = Hmac<Sha256>;

/// Length of an issued cookie.
pub const COOKIE_LEN: usize = 32;

const TIME_LEN: usize = 4;

// Cookie timestamps count seconds from this process-wide instant, so cookies
// issued by one context verify in any other.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn now_secs() -> u32 {
    EPOCH.elapsed().as_secs() as u32
}

/// Cookie context handed to the engine of a DTLS server.
pub struct CookieJar {
    secret: Zeroizing<[u8; 32]>,
    lifetime: Duration,
}

impl CookieJar {
    /// Create a jar with a fresh random secret.
    pub fn new(lifetime: Duration) -> Self {
        let mut secret = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut *secret);

        // Force the epoch so the first cookie is not stamped before it.
        Lazy::force(&EPOCH);

        CookieJar { secret, lifetime }
    }

    /// Issue a cookie for `client`.
    pub fn generate(&self, client: &SocketAddr) -> Result<Vec<u8>, Error> {
        self.generate_at(now_secs(), client)
    }

    /// Check a cookie echoed by `client`.
    pub fn verify(&self, cookie: &[u8], client: &SocketAddr) -> bool {
        self.verify_at(now_secs(), cookie, client)
    }

    fn generate_at(&self, t: u32, client: &SocketAddr) -> Result<Vec<u8>, Error> {
        let tag = self.mac(t, client)?.finalize().into_bytes();

        let mut cookie = Vec::with_capacity(COOKIE_LEN);
        cookie.extend_from_slice(&t.to_be_bytes());
        cookie.extend_from_slice(&tag[..COOKIE_LEN - TIME_LEN]);
        Ok(cookie)
    }

    fn verify_at(&self, now: u32, cookie: &[u8], client: &SocketAddr) -> bool {
        if cookie.len() != COOKIE_LEN {
            return false;
        }

        let mut time = [0u8; TIME_LEN];
        time.copy_from_slice(&cookie[..TIME_LEN]);
        let t = u32::from_be_bytes(time);

        // Issued in the future, or too long ago.
        if t > now || u64::from(now - t) > self.lifetime.as_secs() {
            trace!("Stale cookie for {}", client);
            return false;
        }

        match self.mac(t, client) {
            Ok(mac) => mac.verify_truncated_left(&cookie[TIME_LEN..]).is_ok(),
            Err(_) => false,
        }
    }

    fn mac(&self, t: u32, client: &SocketAddr) -> Result<HmacSha256, Error> {
        let mut mac = HmacSha256::new_from_slice(&*self.secret).map_err(|_| Error::Io)?;
        mac.update(&t.to_be_bytes());
        match client {
            SocketAddr::V4(a) => mac.update(&a.ip().octets()),
            SocketAddr::V6(a) => mac.update(&a.ip().octets()),
        }
        mac.update(&client.port().to_be_bytes());
        Ok(mac)
    }
}

impl std::fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieJar")
            .field("lifetime", &self.lifetime)
            .finish()
    }
}
