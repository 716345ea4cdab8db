//! Crypto engine seam.
//!
//! The secure layer does not implement TLS itself. It drives an [`Engine`]
//! (one TLS/DTLS session plus its configuration) created by an
//! [`EngineProvider`]. The engine moves bytes through a [`Bio`], which the
//! layer implements on top of the plain socket, and reports conditions the
//! layer must act on as [`EngineError`] sentinels.
//!
//! # Contract
//!
//! 1. After creation the layer calls [`Engine::configure`], then feeds
//!    credentials ([`Engine::add_ca_cert`], [`Engine::set_own_cert`],
//!    [`Engine::set_psk`]) and finally [`Engine::setup`]. This happens once per
//!    context, before the first handshake.
//! 2. [`Engine::handshake_step`] advances the handshake as far as the `Bio`
//!    allows and returns `Ok(())` once it is complete.
//! 3. [`Engine::session_reset`] returns the session to its pre-handshake state
//!    while keeping configuration and credentials.
//! 4. A DTLS server engine given a [`CookieJar`] must not complete a handshake
//!    for a client that has not echoed a valid cookie for
//!    [`Bio::transport_id`]. It answers with a HelloVerifyRequest and returns
//!    [`EngineError::HelloVerifyRequired`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::cookie::CookieJar;
use crate::session::SessionStore;
use crate::timer::TimerState;
use crate::transport::SocketType;

/// Sentinel results of engine and bio calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Engine wants to read")]
    WantRead,

    #[error("Engine wants to write")]
    WantWrite,

    #[error("Asynchronous operation in progress")]
    AsyncInProgress,

    #[error("Hello verify required")]
    HelloVerifyRequired,

    #[error("Timeout")]
    Timeout,

    #[error("Peer sent close notify")]
    PeerCloseNotify,

    #[error("Client reconnected on the same transport id")]
    ClientReconnect,

    #[error("Transport reached end of stream")]
    Eof,

    #[error("Transport failure")]
    Transport,

    #[error("Peer or credential verification failed")]
    Verification,

    #[error("Bad input")]
    BadInput,

    #[error("Out of memory")]
    NoMemory,

    #[error("Engine failure {0}")]
    Fatal(i32),
}

impl EngineError {
    /// Conditions that mean "call again later" and lose no state.
    pub fn is_would_block(&self) -> bool {
        matches!(
            self,
            EngineError::WantRead | EngineError::WantWrite | EngineError::AsyncInProgress
        )
    }

    /// Conditions meaning the peer ended the session.
    pub fn is_peer_closed(&self) -> bool {
        matches!(
            self,
            EngineError::PeerCloseNotify | EngineError::ClientReconnect | EngineError::Eof
        )
    }
}

/// Handshake role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Client,
    Server,
}

/// Required peer verification level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyLevel {
    /// Do not verify the peer.
    None,
    /// Verify, but continue the handshake on failure.
    Optional,
    /// Abort the handshake if the peer cannot be verified.
    Required,
}

impl VerifyLevel {
    /// The level the engine uses when none was requested.
    pub fn default_for(role: Role) -> Self {
        match role {
            Role::Client => VerifyLevel::Required,
            Role::Server => VerifyLevel::None,
        }
    }
}

/// Secure protocol version requested at socket creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tls1_0,
    Tls1_1,
    Tls1_2,
    Tls1_3,
    Dtls1_0,
    Dtls1_2,
}

pub const IPPROTO_TLS_1_0: i32 = 256;
pub const IPPROTO_TLS_1_1: i32 = 257;
pub const IPPROTO_TLS_1_2: i32 = 258;
pub const IPPROTO_TLS_1_3: i32 = 259;
pub const IPPROTO_DTLS_1_0: i32 = 272;
pub const IPPROTO_DTLS_1_2: i32 = 273;

impl Protocol {
    pub fn from_raw(protocol: i32) -> Option<Self> {
        let p = match protocol {
            IPPROTO_TLS_1_0 => Protocol::Tls1_0,
            IPPROTO_TLS_1_1 => Protocol::Tls1_1,
            IPPROTO_TLS_1_2 => Protocol::Tls1_2,
            IPPROTO_TLS_1_3 => Protocol::Tls1_3,
            IPPROTO_DTLS_1_0 => Protocol::Dtls1_0,
            IPPROTO_DTLS_1_2 => Protocol::Dtls1_2,
            _ => return None,
        };
        Some(p)
    }

    pub fn is_dtls(&self) -> bool {
        matches!(self, Protocol::Dtls1_0 | Protocol::Dtls1_2)
    }

    /// The only socket type this protocol runs over.
    pub fn socket_type(&self) -> SocketType {
        if self.is_dtls() {
            SocketType::Datagram
        } else {
            SocketType::Stream
        }
    }
}

/// Configuration applied to an engine before its first handshake.
#[derive(Clone)]
pub struct EngineConfig {
    pub role: Role,
    pub protocol: Protocol,
    pub verify: VerifyLevel,
    /// Expected peer hostname. `None` disables the hostname check.
    pub hostname: Option<String>,
    /// Whether `hostname` was set by the caller, even if only to clear it.
    ///
    /// A client requiring peer verification must fail the handshake when no
    /// hostname was ever set, rather than skip the name check.
    pub hostname_set: bool,
    /// Allowed ciphersuites, in preference order. Empty means engine default.
    pub ciphersuites: Vec<i32>,
    /// ALPN protocols to offer or accept, in preference order.
    pub alpn: Vec<Vec<u8>>,
    /// DTLS retransmit timeout bounds (initial, total).
    pub dtls_timeouts: (Duration, Duration),
    /// Anti-replay cookies, DTLS servers only.
    pub cookies: Option<Arc<CookieJar>>,
    /// Server side session cache, wired when the cache is enabled.
    pub session_store: Option<Arc<dyn SessionStore>>,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("role", &self.role)
            .field("protocol", &self.protocol)
            .field("verify", &self.verify)
            .field("hostname", &self.hostname)
            .field("hostname_set", &self.hostname_set)
            .field("ciphersuites", &self.ciphersuites)
            .field("alpn", &self.alpn.len())
            .field("dtls_timeouts", &self.dtls_timeouts)
            .field("cookies", &self.cookies.is_some())
            .field("session_store", &self.session_store.is_some())
            .finish()
    }
}

/// Transport bindings the engine reads and writes records through.
pub trait Bio {
    /// Send raw record bytes to the peer.
    fn send(&mut self, buf: &[u8]) -> Result<usize, EngineError>;

    /// Receive raw record bytes from the peer.
    ///
    /// For DTLS one call yields at most one datagram. `Err(Timeout)` means the
    /// retransmit timer ran out while waiting.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, EngineError>;

    /// Address of the current datagram peer, the anti-replay transport id.
    fn transport_id(&self) -> Option<SocketAddr>;

    /// Arm the retransmit timer. A zero `fin` cancels it.
    fn set_timer(&mut self, intermediate: Duration, fin: Duration);

    fn timer(&self) -> TimerState;
}

/// One TLS/DTLS session of the crypto engine.
pub trait Engine: Send {
    fn configure(&mut self, config: &EngineConfig) -> Result<(), EngineError>;

    /// Add a trusted CA certificate (DER).
    fn add_ca_cert(&mut self, der: Arc<[u8]>) -> Result<(), EngineError>;

    /// Install the own certificate (DER) and its private key.
    fn set_own_cert(&mut self, cert: Arc<[u8]>, key: &[u8]) -> Result<(), EngineError>;

    /// Install a pre-shared key together with its identity.
    fn set_psk(&mut self, psk: &[u8], identity: &[u8]) -> Result<(), EngineError>;

    /// Finish configuration. No configuration calls follow.
    fn setup(&mut self) -> Result<(), EngineError>;

    /// Advance the handshake.
    fn handshake_step(&mut self, bio: &mut dyn Bio) -> Result<(), EngineError>;

    /// Read decrypted application data.
    ///
    /// An empty `buf` processes at most one pending record into the engine's
    /// buffer, making it visible through [`Engine::bytes_available`].
    fn read(&mut self, bio: &mut dyn Bio, buf: &mut [u8]) -> Result<usize, EngineError>;

    /// Encrypt and send application data.
    fn write(&mut self, bio: &mut dyn Bio, buf: &[u8]) -> Result<usize, EngineError>;

    /// Send a close notify alert.
    fn close_notify(&mut self, bio: &mut dyn Bio) -> Result<(), EngineError>;

    /// Decrypted bytes buffered and not yet read.
    fn bytes_available(&self) -> usize;

    fn session_reset(&mut self) -> Result<(), EngineError>;

    /// Serialize the established session for later resumption.
    fn save_session(&self) -> Result<Vec<u8>, EngineError>;

    /// Load a serialized session before the handshake.
    fn load_session(&mut self, session: &[u8]) -> Result<(), EngineError>;
}

/// Factory for engine sessions.
pub trait EngineProvider: Send + Sync {
    fn new_engine(&self) -> Result<Box<dyn Engine>, EngineError>;
}
