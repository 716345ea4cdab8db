//! TLS and DTLS sockets on top of a plain socket layer.
//!
//! A secure socket looks like a plain one at the call site. It owns a plain
//! socket from a [`TransportProvider`] and a session of a crypto [`Engine`],
//! and runs handshakes, record encryption, DTLS cookie exchange and session
//! resumption in between.
//!
//! ```ignore
//! let layer = SecureSockets::new(Config::default(), transports, engines, credentials);
//!
//! let mut sock = layer.socket(AddressFamily::Inet, SocketType::Stream, IPPROTO_TLS_1_2)?;
//! sock.setsockopt(SOL_TLS, TLS_SEC_TAG_LIST, &CA_TAG.to_ne_bytes())?;
//! sock.setsockopt(SOL_TLS, TLS_HOSTNAME, b"example.com")?;
//! sock.connect(addr)?;
//! sock.send(b"hello", MsgFlags::empty())?;
//! ```
#![forbid(unsafe_code)]
#![warn(clippy::all)]

#[macro_use]
extern crate log;

mod bio;
mod config;
mod context;
mod cookie;
mod credentials;
mod engine;
mod error;
mod handshake;
mod options;
mod poll;
mod registry;
mod session;
mod signal;
mod socket;
mod timer;
mod transport;
mod util;

pub use config::{Config, ConfigBuilder, MAX_SEC_TAGS};
pub use context::HandshakeState;
pub use cookie::{CookieJar, COOKIE_LEN};
pub use credentials::{
    CertCopy, Credential, CredentialKind, CredentialStore, MemoryCredentialStore, SecTag,
    SecTagList,
};
pub use engine::{Bio, Engine, EngineConfig, EngineError, EngineProvider, Protocol, Role};
pub use engine::{VerifyLevel, IPPROTO_DTLS_1_0, IPPROTO_DTLS_1_2};
pub use engine::{IPPROTO_TLS_1_0, IPPROTO_TLS_1_1, IPPROTO_TLS_1_2, IPPROTO_TLS_1_3};
pub use error::Error;
pub use options::{
    SOL_TLS, TLS_ALPN_LIST, TLS_CERT_NOCOPY, TLS_CERT_NOCOPY_NONE, TLS_CERT_NOCOPY_OPTIONAL,
    TLS_CIPHERSUITE_LIST, TLS_DTLS_HANDSHAKE_TIMEOUT_MAX, TLS_DTLS_HANDSHAKE_TIMEOUT_MIN,
    TLS_DTLS_ROLE, TLS_DTLS_ROLE_CLIENT, TLS_DTLS_ROLE_SERVER, TLS_HOSTNAME, TLS_PEER_VERIFY,
    TLS_PEER_VERIFY_NONE, TLS_PEER_VERIFY_OPTIONAL, TLS_PEER_VERIFY_REQUIRED, TLS_SEC_TAG_LIST,
    TLS_SESSION_CACHE, TLS_SESSION_CACHE_DISABLED, TLS_SESSION_CACHE_ENABLED,
    TLS_SESSION_CACHE_PURGE,
};
pub use poll::PollFd;
pub use registry::{Registry, SocketFamily, SocketOps};
pub use session::{ServerSessionCache, SessionStore};
pub use signal::Signal;
pub use socket::{SecureSocket, SecureSockets};
pub use timer::{DtlsTimer, TimerState};
pub use transport::{AddressFamily, MsgFlags, PollFlags, SocketType};
pub use transport::{Transport, TransportProvider, WaitRequest, WaitTarget};
