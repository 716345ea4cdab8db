//! Secure socket contexts and the pool they are allocated from.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::bio::IoAdapter;
use crate::config::Config;
use crate::cookie::CookieJar;
use crate::credentials::{CertCopy, CertificateHolders, SecTagList};
use crate::engine::{Engine, Protocol, Role, VerifyLevel};
use crate::signal::Signal;
use crate::timer::DtlsTimer;
use crate::transport::{AddressFamily, MsgFlags, SocketType, Transport};
use crate::Error;

/// Claim on one pool slot.
///
/// Neither `Clone` nor `Copy`. Each claim has a single owner, and a claim
/// outliving its release no longer matches the slot generation.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Slot {
    index: usize,
    generation: u32,
}

impl Slot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug, Default)]
struct SlotState {
    used: bool,
    generation: u32,
}

/// Fixed-size pool of context slots.
///
/// One lock guards allocation and release. The contexts themselves are
/// owned by their sockets and need no locking.
pub(crate) struct ContextPool {
    slots: Mutex<Vec<SlotState>>,
}

impl ContextPool {
    pub fn new(size: usize) -> Self {
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, SlotState::default);
        ContextPool {
            slots: Mutex::new(slots),
        }
    }

    /// Claim an unused slot.
    pub fn allocate(&self) -> Result<Slot, Error> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);

        let Some((index, state)) = slots.iter_mut().enumerate().find(|(_, s)| !s.used) else {
            debug!("Secure socket context pool exhausted");
            return Err(Error::NoMemory);
        };

        state.used = true;
        state.generation = state.generation.wrapping_add(1);

        trace!("Allocated context {} (generation {})", index, state.generation);

        Ok(Slot {
            index,
            generation: state.generation,
        })
    }

    /// Give a slot back.
    ///
    /// A claim that does not match the slot's current generation is a
    /// caller error and leaves the pool untouched.
    pub fn release(&self, slot: &Slot) -> Result<(), Error> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(state) = slots.get_mut(slot.index) else {
            return Err(Error::BadDescriptor);
        };

        if !state.used || state.generation != slot.generation {
            error!(
                "Release of stale context {} (generation {}, current {})",
                slot.index, slot.generation, state.generation
            );
            return Err(Error::BadDescriptor);
        }

        state.used = false;
        trace!("Released context {}", slot.index);

        Ok(())
    }

    pub fn in_use(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.used)
            .count()
    }
}

/// Handshake progress of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    NotStarted,
    InProgress,
    Established,
}

/// Options settable at the `SOL_TLS` level.
///
/// These are role independent and carried over to accepted sockets.
#[derive(Debug, Clone)]
pub(crate) struct TlsOptions {
    pub sec_tags: SecTagList,
    pub hostname: Option<String>,
    /// Set once the hostname was configured explicitly, even to nothing.
    pub hostname_set: bool,
    pub ciphersuites: Vec<i32>,
    pub alpn: Vec<Vec<u8>>,
    /// `None` until set, then the engine default for the role applies.
    pub verify: Option<VerifyLevel>,
    pub cert_copy: CertCopy,
    pub cache_enabled: bool,
    pub dtls_timeout_min: Duration,
    pub dtls_timeout_max: Duration,
}

impl TlsOptions {
    pub fn new(config: &Config) -> Self {
        TlsOptions {
            sec_tags: SecTagList::new(),
            hostname: None,
            hostname_set: false,
            ciphersuites: Vec::new(),
            alpn: Vec::new(),
            verify: None,
            cert_copy: CertCopy::Copy,
            cache_enabled: false,
            dtls_timeout_min: config.dtls_handshake_timeout_min(),
            dtls_timeout_max: config.dtls_handshake_timeout_max(),
        }
    }
}

/// State of one secure socket.
pub(crate) struct TlsContext {
    pub slot: Slot,
    pub protocol: Protocol,
    pub kind: SocketType,
    pub family: AddressFamily,
    pub role: Role,
    /// The plain socket, valid for the whole life of the context.
    pub transport: Box<dyn Transport>,
    pub engine: Box<dyn Engine>,
    /// Configuration and credentials have been applied to the engine.
    pub engine_ready: bool,
    /// The engine saw configuration calls and must be replaced before it
    /// is configured again.
    pub engine_stale: bool,
    pub state: HandshakeState,
    pub established: Arc<Signal>,
    pub options: TlsOptions,
    pub certs: CertificateHolders,
    pub cookies: Option<Arc<CookieJar>>,
    pub timer: DtlsTimer,
    /// Stream: the connected address. Datagram: the single tracked peer.
    pub peer: Option<SocketAddr>,
    /// Fatal error reported by the next send or recv.
    pub error: Option<Error>,
    /// The peer closed the stream session.
    pub session_closed: bool,
    pub listening: bool,
}

impl TlsContext {
    pub fn new(
        slot: Slot,
        protocol: Protocol,
        family: AddressFamily,
        transport: Box<dyn Transport>,
        engine: Box<dyn Engine>,
        config: &Config,
    ) -> Self {
        let cookies = cookie_jar(protocol, config);

        TlsContext {
            slot,
            protocol,
            kind: protocol.socket_type(),
            family,
            role: Role::Client,
            transport,
            engine,
            engine_ready: false,
            engine_stale: false,
            state: HandshakeState::NotStarted,
            established: Arc::new(Signal::new()),
            options: TlsOptions::new(config),
            certs: CertificateHolders::default(),
            cookies,
            timer: DtlsTimer::new(),
            peer: None,
            error: None,
            session_closed: false,
            listening: false,
        }
    }

    /// A server context for a connection accepted on `self`.
    ///
    /// Only option state is copied, never handshake state.
    pub fn clone_for_accept(
        &self,
        slot: Slot,
        transport: Box<dyn Transport>,
        engine: Box<dyn Engine>,
        peer: SocketAddr,
        config: &Config,
    ) -> Self {
        let mut ctx = TlsContext::new(slot, self.protocol, self.family, transport, engine, config);
        ctx.options = self.options.clone();
        ctx.role = Role::Server;
        ctx.peer = Some(peer);
        ctx
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    pub fn is_dtls(&self) -> bool {
        self.kind == SocketType::Datagram
    }

    /// Whether a call with `flags` may block.
    pub fn is_blocking(&self, flags: MsgFlags) -> bool {
        !flags.contains(MsgFlags::DONTWAIT) && !self.transport.is_nonblocking()
    }

    /// The engine together with the bindings it does I/O through.
    pub fn io(&mut self, wait: bool, flags: MsgFlags) -> (&mut dyn Engine, IoAdapter<'_>) {
        let adapter = IoAdapter {
            kind: self.kind,
            role: self.role,
            transport: &mut *self.transport,
            flags,
            wait,
            peer: &mut self.peer,
            timer: &mut self.timer,
        };
        (&mut *self.engine, adapter)
    }
}

/// Anti-replay cookie context for a new socket, DTLS only.
fn cookie_jar(protocol: Protocol, config: &Config) -> Option<Arc<CookieJar>> {
    (protocol.is_dtls() && config.with_dtls())
        .then(|| Arc::new(CookieJar::new(config.cookie_lifetime())))
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("slot", &self.slot)
            .field("protocol", &self.protocol)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("error", &self.error)
            .finish()
    }
}
