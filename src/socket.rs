//! Secure sockets.
//!
//! [`SecureSockets`] is the layer instance: it owns the context pool, the
//! session caches and the collaborators (plain socket layer, crypto engine,
//! credential store). [`SecureSocket`] is one open secure socket, with the
//! same operations as a plain socket.

use std::io::IoSlice;
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::Config;
use crate::context::{ContextPool, HandshakeState, TlsContext};
use crate::credentials::CredentialStore;
use crate::engine::{EngineError, EngineProvider, Protocol, Role};
use crate::handshake;
use crate::options::{self, TlsOption, SOL_TLS};
use crate::session::{ClientSessionCache, ServerSessionCache};
use crate::transport::{AddressFamily, MsgFlags, PollFlags, SocketType, TransportProvider};
use crate::Error;

/// State shared by all sockets of one layer instance.
pub(crate) struct Shared {
    pub config: Config,
    pub pool: ContextPool,
    pub transports: Arc<dyn TransportProvider>,
    pub engines: Arc<dyn EngineProvider>,
    pub credentials: Arc<dyn CredentialStore>,
    pub client_cache: Mutex<ClientSessionCache>,
    pub server_cache: Arc<ServerSessionCache>,
}

impl Shared {
    fn purge_caches(&self) {
        debug!("Purging session caches");
        self.client_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .purge();
        self.server_cache.purge();
    }
}

/// The secure socket layer.
#[derive(Clone)]
pub struct SecureSockets {
    pub(crate) shared: Arc<Shared>,
}

impl SecureSockets {
    pub fn new(
        config: Config,
        transports: Arc<dyn TransportProvider>,
        engines: Arc<dyn EngineProvider>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let shared = Shared {
            pool: ContextPool::new(config.max_contexts()),
            client_cache: Mutex::new(ClientSessionCache::new(config.client_cache_entries())),
            server_cache: Arc::new(ServerSessionCache::new(
                config.server_cache_entries(),
                config.server_cache_timeout(),
            )),
            config,
            transports,
            engines,
            credentials,
        };

        SecureSockets {
            shared: Arc::new(shared),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Open a secure socket.
    ///
    /// `protocol` is one of the `IPPROTO_TLS_*` or `IPPROTO_DTLS_*` numbers
    /// and must match `kind`.
    pub fn socket(
        &self,
        family: AddressFamily,
        kind: SocketType,
        protocol: i32,
    ) -> Result<SecureSocket, Error> {
        let shared = &self.shared;

        let protocol = Protocol::from_raw(protocol).ok_or(Error::ProtocolNotSupported)?;

        if protocol.socket_type() != kind {
            return Err(Error::WrongProtocolType);
        }

        if protocol.is_dtls() && !shared.config.with_dtls() {
            return Err(Error::ProtocolNotSupported);
        }

        let slot = shared.pool.allocate()?;

        let mut transport = match shared.transports.open(family, kind) {
            Ok(t) => t,
            Err(e) => {
                let _ = shared.pool.release(&slot);
                return Err(e.into());
            }
        };

        let engine = match shared.engines.new_engine() {
            Ok(e) => e,
            Err(e) => {
                warn!("Failed to create engine: {}", e);
                let _ = transport.close();
                let _ = shared.pool.release(&slot);
                return Err(Error::NoMemory);
            }
        };

        let ctx = TlsContext::new(slot, protocol, family, transport, engine, &shared.config);
        debug!("Opened {:?} socket in context {}", protocol, ctx.slot.index());

        Ok(SecureSocket::new(ctx, shared.clone()))
    }

    /// Drop every cached session, client and server side.
    pub fn purge_session_cache(&self) {
        self.shared.purge_caches();
    }

    /// Number of pool contexts held by open sockets.
    pub fn contexts_in_use(&self) -> usize {
        self.shared.pool.in_use()
    }

    /// Number of sessions in the client side cache.
    pub fn client_sessions(&self) -> usize {
        self.shared
            .client_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The server side session cache handed to engines.
    pub fn server_session_cache(&self) -> &ServerSessionCache {
        &self.shared.server_cache
    }
}

/// One open secure socket.
///
/// Dropping the socket closes it, [`SecureSocket::close`] does the same and
/// reports errors.
pub struct SecureSocket {
    pub(crate) ctx: TlsContext,
    pub(crate) shared: Arc<Shared>,
    closed: bool,
}

impl SecureSocket {
    fn new(ctx: TlsContext, shared: Arc<Shared>) -> Self {
        SecureSocket {
            ctx,
            shared,
            closed: false,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.ctx.protocol
    }

    pub fn socket_type(&self) -> SocketType {
        self.ctx.kind
    }

    pub fn role(&self) -> Role {
        self.ctx.role
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.ctx.state
    }

    /// The datagram peer the socket currently recognizes.
    pub fn dtls_peer(&self) -> Option<SocketAddr> {
        match self.ctx.kind {
            SocketType::Datagram => self.ctx.peer,
            SocketType::Stream => None,
        }
    }

    pub fn bind(&mut self, addr: SocketAddr) -> Result<(), Error> {
        Ok(self.ctx.transport.bind(addr)?)
    }

    pub fn listen(&mut self, backlog: usize) -> Result<(), Error> {
        self.ctx.transport.listen(backlog)?;
        self.ctx.listening = true;
        self.ctx.role = Role::Server;
        Ok(())
    }

    pub fn shutdown(&mut self, how: Shutdown) -> Result<(), Error> {
        Ok(self.ctx.transport.shutdown(how)?)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.ctx.transport.local_addr()?)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, Error> {
        match self.ctx.kind {
            SocketType::Stream => Ok(self.ctx.transport.peer_addr()?),
            SocketType::Datagram => self.ctx.peer.ok_or(Error::NotConnected),
        }
    }

    pub fn is_nonblocking(&self) -> bool {
        self.ctx.transport.is_nonblocking()
    }

    pub fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), Error> {
        Ok(self.ctx.transport.set_nonblocking(nonblocking)?)
    }

    /// Connect to `addr`.
    ///
    /// A stream socket completes the client handshake before returning, or
    /// returns [`Error::InProgress`] when non-blocking. A datagram socket only
    /// records the peer, the handshake runs on first send or receive.
    pub fn connect(&mut self, addr: SocketAddr) -> Result<(), Error> {
        let ctx = &mut self.ctx;

        ctx.transport.connect(addr)?;
        ctx.peer = Some(addr);

        if ctx.kind == SocketType::Datagram {
            debug!("DTLS peer set to {}", addr);
            return Ok(());
        }

        ctx.role = Role::Client;
        let blocking = !ctx.transport.is_nonblocking();

        match handshake::drive(ctx, &self.shared, blocking) {
            Err(Error::WouldBlock) => Err(Error::InProgress),
            r => r,
        }
    }

    /// Accept a connection and complete the server handshake on it.
    pub fn accept(&mut self) -> Result<(SecureSocket, SocketAddr), Error> {
        if self.ctx.kind == SocketType::Datagram {
            return Err(Error::NotSupported);
        }

        let shared = &self.shared;
        let (mut transport, peer) = self.ctx.transport.accept()?;

        let slot = match shared.pool.allocate() {
            Ok(s) => s,
            Err(e) => {
                let _ = transport.close();
                return Err(e);
            }
        };

        let engine = match shared.engines.new_engine() {
            Ok(e) => e,
            Err(e) => {
                warn!("Failed to create engine: {}", e);
                let _ = transport.close();
                let _ = shared.pool.release(&slot);
                return Err(Error::NoMemory);
            }
        };

        let ctx = self
            .ctx
            .clone_for_accept(slot, transport, engine, peer, &shared.config);
        let mut child = SecureSocket::new(ctx, shared.clone());

        debug!("Accepted {} into context {}", peer, child.ctx.slot.index());

        // Always a blocking handshake, whatever the transport mode.
        if let Err(e) = handshake::drive(&mut child.ctx, shared, true) {
            let _ = child.close();
            return Err(e);
        }

        Ok((child, peer))
    }

    /// Error left by a failed readiness check.
    ///
    /// A stream socket keeps failing with it. A datagram socket was reset
    /// when the error was found and reports it once.
    fn pending_error(&mut self) -> Option<Error> {
        if self.ctx.kind == SocketType::Datagram {
            self.ctx.error.take()
        } else {
            self.ctx.error
        }
    }

    pub fn send(&mut self, buf: &[u8], flags: MsgFlags) -> Result<usize, Error> {
        self.send_to(buf, flags, None)
    }

    /// Send `buf`, to `addr` if given.
    ///
    /// Stream sockets ignore `addr`. A datagram client adopts `addr` as its
    /// peer if it has none, and rejects any other.
    pub fn send_to(
        &mut self,
        buf: &[u8],
        flags: MsgFlags,
        addr: Option<SocketAddr>,
    ) -> Result<usize, Error> {
        if let Some(e) = self.pending_error() {
            return Err(e);
        }

        match (self.ctx.kind, self.ctx.role) {
            (SocketType::Stream, _) => self.stream_send(buf, flags),
            (SocketType::Datagram, Role::Client) => self.dtls_client_send(buf, flags, addr),
            (SocketType::Datagram, Role::Server) => self.dtls_server_send(buf, flags, addr),
        }
    }

    /// Vectored send.
    ///
    /// A datagram socket sends all slices as one record.
    pub fn send_msg(
        &mut self,
        bufs: &[IoSlice<'_>],
        flags: MsgFlags,
        addr: Option<SocketAddr>,
    ) -> Result<usize, Error> {
        if self.ctx.kind == SocketType::Datagram {
            let joined: Vec<u8> = bufs.iter().flat_map(|b| b.iter().copied()).collect();
            return self.send_to(&joined, flags, addr);
        }

        let mut sent = 0;
        for buf in bufs {
            let n = match self.send_to(buf, flags, addr) {
                Ok(n) => n,
                Err(e) if sent > 0 && e.is_would_block() => return Ok(sent),
                Err(e) => return Err(e),
            };
            sent += n;
            if n < buf.len() {
                break;
            }
        }

        Ok(sent)
    }

    fn stream_send(&mut self, buf: &[u8], flags: MsgFlags) -> Result<usize, Error> {
        if self.ctx.session_closed {
            return Err(Error::NotConnected);
        }

        let blocking = self.ctx.is_blocking(flags);

        if !self.ctx.is_established() {
            if self.ctx.state == HandshakeState::NotStarted {
                return Err(Error::NotConnected);
            }
            handshake::drive(&mut self.ctx, &self.shared, blocking)?;
        }

        if buf.is_empty() {
            return Ok(0);
        }

        self.write(buf, flags, blocking)
    }

    fn dtls_client_send(
        &mut self,
        buf: &[u8],
        flags: MsgFlags,
        addr: Option<SocketAddr>,
    ) -> Result<usize, Error> {
        match (self.ctx.peer, addr) {
            (None, None) => return Err(Error::DestinationRequired),
            (None, Some(addr)) => {
                debug!("DTLS peer set to {}", addr);
                self.ctx.peer = Some(addr);
            }
            (Some(peer), Some(addr)) if peer != addr => {
                debug!("Send to {} refused, peer is {}", addr, peer);
                return Err(Error::AlreadyConnected);
            }
            _ => {}
        }

        // The handshake blocks even on a non-blocking socket.
        if !self.ctx.is_established() {
            handshake::drive(&mut self.ctx, &self.shared, true)?;
        }

        let blocking = self.ctx.is_blocking(flags);
        self.write(buf, flags, blocking)
    }

    fn dtls_server_send(
        &mut self,
        buf: &[u8],
        flags: MsgFlags,
        addr: Option<SocketAddr>,
    ) -> Result<usize, Error> {
        if !self.ctx.is_established() {
            return Err(Error::NotConnected);
        }

        if let Some(addr) = addr {
            if Some(addr) != self.ctx.peer {
                debug!("Send to {} refused, peer is {:?}", addr, self.ctx.peer);
                return Err(Error::AlreadyConnected);
            }
        }

        let blocking = self.ctx.is_blocking(flags);
        self.write(buf, flags, blocking)
    }

    fn write(&mut self, buf: &[u8], flags: MsgFlags, blocking: bool) -> Result<usize, Error> {
        loop {
            let (engine, mut bio) = self.ctx.io(false, flags);

            match engine.write(&mut bio, buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.is_would_block() => {
                    if !blocking {
                        return Err(Error::WouldBlock);
                    }
                    let events = if e == EngineError::WantRead {
                        PollFlags::IN
                    } else {
                        PollFlags::OUT
                    };
                    self.ctx.transport.wait(events, None)?;
                }
                Err(e) => {
                    warn!("Write failed: {}", e);
                    handshake::reset(&mut self.ctx)?;
                    return Err(Error::ConnectionAborted);
                }
            }
        }
    }

    pub fn recv(&mut self, buf: &mut [u8], flags: MsgFlags) -> Result<usize, Error> {
        self.recv_from(buf, flags).map(|(n, _)| n)
    }

    /// Receive decrypted data.
    ///
    /// Datagram sockets return the peer address and deliver at most one
    /// record per call. Bytes of the record that do not fit are dropped.
    pub fn recv_from(
        &mut self,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> Result<(usize, Option<SocketAddr>), Error> {
        if buf.is_empty() {
            return Err(Error::InvalidArgument);
        }

        if flags.contains(MsgFlags::PEEK) {
            return Err(Error::NotSupported);
        }

        if let Some(e) = self.pending_error() {
            return Err(e);
        }

        match (self.ctx.kind, self.ctx.role) {
            (SocketType::Stream, _) => self.stream_recv(buf, flags).map(|n| (n, None)),
            (SocketType::Datagram, Role::Client) => self.dtls_client_recv(buf, flags),
            (SocketType::Datagram, Role::Server) => self.dtls_server_recv(buf, flags),
        }
    }

    fn stream_recv(&mut self, buf: &mut [u8], flags: MsgFlags) -> Result<usize, Error> {
        if self.ctx.session_closed {
            return Ok(0);
        }

        let blocking = self.ctx.is_blocking(flags);
        let wait_all = blocking && flags.contains(MsgFlags::WAITALL);

        if !self.ctx.is_established() {
            if self.ctx.state == HandshakeState::NotStarted {
                return Err(Error::NotConnected);
            }
            handshake::drive(&mut self.ctx, &self.shared, blocking)?;
        }

        let mut received = 0;

        loop {
            let (engine, mut bio) = self.ctx.io(false, flags);

            match engine.read(&mut bio, &mut buf[received..]) {
                Ok(n) => {
                    received += n;
                    if n == 0 || !wait_all || received == buf.len() {
                        return Ok(received);
                    }
                }
                Err(e) if e.is_peer_closed() => {
                    debug!("Peer closed the session: {}", e);
                    self.ctx.session_closed = true;
                    return Ok(received);
                }
                Err(e) if e.is_would_block() => {
                    if !blocking {
                        return if received > 0 {
                            Ok(received)
                        } else {
                            Err(Error::WouldBlock)
                        };
                    }
                    let events = if e == EngineError::WantWrite {
                        PollFlags::OUT
                    } else {
                        PollFlags::IN
                    };
                    self.ctx.transport.wait(events, None)?;
                }
                Err(e) => {
                    warn!("Read failed: {}", e);
                    handshake::reset(&mut self.ctx)?;
                    return Err(Error::Io);
                }
            }
        }
    }

    /// Read one record, dropping what does not fit in `buf`.
    fn read_record(&mut self, buf: &mut [u8], flags: MsgFlags, blocking: bool) -> Result<usize, EngineError> {
        let (engine, mut bio) = self.ctx.io(blocking, flags);
        let n = engine.read(&mut bio, buf)?;

        let mut scratch = [0u8; 256];
        let mut dropped = 0;
        while engine.bytes_available() > 0 {
            match engine.read(&mut bio, &mut scratch) {
                Ok(0) | Err(_) => break,
                Ok(m) => dropped += m,
            }
        }
        if dropped > 0 {
            debug!("Dropped {} bytes of a {} byte record", dropped, n + dropped);
        }

        Ok(n)
    }

    fn dtls_client_recv(
        &mut self,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> Result<(usize, Option<SocketAddr>), Error> {
        if !self.ctx.is_established() {
            return Err(Error::NotConnected);
        }

        let blocking = self.ctx.is_blocking(flags);

        loop {
            match self.read_record(buf, flags, blocking) {
                Ok(n) => return Ok((n, self.ctx.peer)),
                Err(e) if e.is_peer_closed() => {
                    debug!("DTLS peer closed: {}", e);
                    handshake::reset(&mut self.ctx)?;
                    return Err(Error::NotConnected);
                }
                Err(EngineError::Timeout) => return Err(Error::WouldBlock),
                Err(e) if e.is_would_block() => {
                    if !blocking {
                        return Err(Error::WouldBlock);
                    }
                }
                Err(e) => {
                    warn!("Read failed: {}", e);
                    handshake::reset(&mut self.ctx)?;
                    return Err(Error::Io);
                }
            }
        }
    }

    fn dtls_server_recv(
        &mut self,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> Result<(usize, Option<SocketAddr>), Error> {
        let blocking = self.ctx.is_blocking(flags);

        loop {
            if !self.ctx.is_established() {
                match handshake::step(&mut self.ctx, &self.shared, blocking) {
                    Ok(handshake::Progress::Done) => {}
                    Ok(handshake::Progress::Want(_)) if !blocking => return Err(Error::WouldBlock),
                    Ok(handshake::Progress::Want(events)) => {
                        if events.contains(PollFlags::OUT) {
                            self.ctx.transport.wait(events, None)?;
                        }
                    }
                    // The context was reset and is ready for the next client.
                    Err(Error::TimedOut) | Err(Error::ConnectionAborted) if blocking => {}
                    Err(Error::TimedOut) | Err(Error::ConnectionAborted) => {
                        return Err(Error::WouldBlock)
                    }
                    Err(e) => return Err(e),
                }
                continue;
            }

            match self.read_record(buf, flags, blocking) {
                Ok(n) => return Ok((n, self.ctx.peer)),
                Err(e) if e.is_peer_closed() || e == EngineError::Timeout => {
                    debug!("DTLS client {:?} gone: {}", self.ctx.peer, e);
                    if e == EngineError::Timeout {
                        let (engine, mut bio) = self.ctx.io(false, flags);
                        let _ = engine.close_notify(&mut bio);
                    }
                    handshake::reset(&mut self.ctx)?;
                    if !blocking {
                        return Err(Error::WouldBlock);
                    }
                }
                Err(e) if e.is_would_block() => {
                    if !blocking {
                        return Err(Error::WouldBlock);
                    }
                }
                Err(e) => {
                    warn!("Read failed: {}", e);
                    handshake::reset(&mut self.ctx)?;
                    return Err(Error::Io);
                }
            }
        }
    }

    /// Set an option. Levels other than `SOL_TLS` go to the plain socket.
    pub fn setsockopt(&mut self, level: i32, name: i32, value: &[u8]) -> Result<(), Error> {
        if level != SOL_TLS {
            return Ok(self.ctx.transport.setsockopt(level, name, value)?);
        }

        let opt = TlsOption::parse(name, value, &self.shared.config)?;
        let purge = opt == TlsOption::SessionCachePurge;

        trace!("Set TLS option {:?}", opt);
        opt.apply(&mut self.ctx)?;

        if purge {
            self.shared.purge_caches();
        }

        Ok(())
    }

    /// Read an option into `value`, returning the length written.
    pub fn getsockopt(&mut self, level: i32, name: i32, value: &mut [u8]) -> Result<usize, Error> {
        if level != SOL_TLS {
            return Ok(self.ctx.transport.getsockopt(level, name, value)?);
        }

        options::get(&self.ctx, name, value)
    }

    /// Close the socket.
    ///
    /// A close notify is sent on a best effort basis. An error closing the
    /// plain socket takes precedence over one releasing the context.
    pub fn close(mut self) -> Result<(), Error> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), Error> {
        self.closed = true;

        if self.ctx.is_established() {
            let (engine, mut bio) = self.ctx.io(false, MsgFlags::empty());
            if let Err(e) = engine.close_notify(&mut bio) {
                trace!("Close notify failed: {}", e);
            }
        }

        self.ctx.certs = Default::default();
        self.ctx.established.clear();

        let released = self.shared.pool.release(&self.ctx.slot);
        let closed = self.ctx.transport.close();

        debug!("Closed context {}", self.ctx.slot.index());

        closed?;
        released
    }
}

impl Drop for SecureSocket {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.teardown() {
                debug!("Error closing dropped socket: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for SecureSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSocket").field("ctx", &self.ctx).finish()
    }
}
