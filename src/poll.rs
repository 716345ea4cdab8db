//! Readiness of secure sockets.
//!
//! Readiness of the plain socket says little about a secure socket: a
//! readable transport may only carry handshake records, and a record may
//! already be decrypted and buffered in the engine with nothing left on the
//! transport. Each wait is therefore bracketed by a prepare step (report
//! buffered data, pick the wait target) and an update step (peek a record
//! into the engine to see whether application data arrived).

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::HandshakeState;
use crate::engine::Role;
use crate::handshake::{self, Progress};
use crate::signal::Signal;
use crate::socket::{SecureSocket, SecureSockets};
use crate::transport::{MsgFlags, PollFlags, SocketType, WaitRequest};
use crate::Error;

/// One socket of a [`SecureSockets::poll`] call.
#[derive(Debug)]
pub struct PollFd<'a> {
    pub socket: &'a mut SecureSocket,
    pub events: PollFlags,
    pub revents: PollFlags,
}

impl<'a> PollFd<'a> {
    pub fn new(socket: &'a mut SecureSocket, events: PollFlags) -> Self {
        PollFd {
            socket,
            events,
            revents: PollFlags::empty(),
        }
    }
}

/// What to wait on for one socket.
pub(crate) enum Prepared {
    /// Ready without waiting.
    Ready(PollFlags),
    /// Wait on the plain socket.
    Transport(PollFlags),
    /// Wait for the handshake to complete.
    Established(Arc<Signal>),
}

/// Result of translating a plain socket wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Update {
    Ready(PollFlags),
    /// Nothing usable yet, wait again.
    Retry,
}

impl SecureSocket {
    pub(crate) fn poll_prepare(&self, events: PollFlags) -> Prepared {
        let ctx = &self.ctx;

        if ctx.error.is_some() {
            return Prepared::Ready(PollFlags::ERR);
        }

        if events.contains(PollFlags::IN) {
            if ctx.session_closed {
                return Prepared::Ready(PollFlags::IN | PollFlags::HUP);
            }

            if ctx.engine.bytes_available() > 0 {
                return Prepared::Ready(PollFlags::IN);
            }

            if ctx.kind == SocketType::Datagram
                && ctx.role == Role::Client
                && ctx.state != HandshakeState::Established
            {
                return Prepared::Established(ctx.established.clone());
            }
        }

        Prepared::Transport(events)
    }

    /// Check whether buffered or incoming records hold application data.
    ///
    /// Returns the bytes available, or the error the next receive would
    /// observe.
    fn data_check(&mut self) -> Result<usize, Error> {
        if self.ctx.state != HandshakeState::Established {
            if self.ctx.state == HandshakeState::NotStarted && self.ctx.kind == SocketType::Stream {
                return Err(Error::NotConnected);
            }

            // Advance the handshake without waiting.
            match handshake::step(&mut self.ctx, &self.shared, false) {
                Ok(Progress::Done) => {}
                Ok(Progress::Want(_)) => return Err(Error::WouldBlock),
                Err(Error::TimedOut) | Err(Error::ConnectionAborted)
                    if self.ctx.kind == SocketType::Datagram =>
                {
                    return Err(Error::WouldBlock)
                }
                Err(e) => return Err(e),
            }
        }

        let (engine, mut bio) = self.ctx.io(false, MsgFlags::DONTWAIT);

        match engine.read(&mut bio, &mut []) {
            Ok(_) => Ok(engine.bytes_available()),
            Err(e) if e.is_peer_closed() => {
                if self.ctx.kind == SocketType::Datagram {
                    handshake::reset(&mut self.ctx)?;
                } else {
                    self.ctx.session_closed = true;
                }
                Err(Error::NotConnected)
            }
            // A write wish from a read is treated like a read wish.
            Err(e) if e.is_would_block() => Err(Error::WouldBlock),
            Err(e) => {
                warn!("Record check failed: {}", e);
                // A datagram socket is ready for a new handshake once the
                // error has been reported.
                if self.ctx.kind == SocketType::Datagram {
                    handshake::reset(&mut self.ctx)?;
                }
                Err(Error::ConnectionAborted)
            }
        }
    }

    pub(crate) fn poll_update(&mut self, events: PollFlags, mut revents: PollFlags) -> Update {
        if !(events.contains(PollFlags::IN) && revents.contains(PollFlags::IN)) {
            return Update::Ready(revents);
        }

        match self.data_check() {
            Ok(0) => {
                revents.remove(PollFlags::IN);
                if revents.is_empty() {
                    Update::Retry
                } else {
                    Update::Ready(revents)
                }
            }
            Ok(_) => Update::Ready(revents),
            Err(Error::NotConnected) => {
                // A datagram receive reports an error, not end of stream.
                if self.ctx.kind == SocketType::Datagram {
                    revents.remove(PollFlags::IN);
                }
                Update::Ready(revents | PollFlags::HUP)
            }
            Err(Error::WouldBlock) => {
                revents.remove(PollFlags::IN);
                if revents.is_empty() {
                    Update::Retry
                } else {
                    Update::Ready(revents)
                }
            }
            Err(e) => {
                self.ctx.error = Some(e);
                Update::Ready(revents | PollFlags::ERR)
            }
        }
    }
}

enum Pending {
    Transport(usize),
    Established,
}

impl SecureSockets {
    /// Wait until one of the sockets is ready.
    ///
    /// `None` waits forever. Returns the number of sockets with a non-empty
    /// `revents`, zero on timeout.
    pub fn poll(&self, fds: &mut [PollFd<'_>], timeout: Option<Duration>) -> Result<usize, Error> {
        self.poll_loop(fds, timeout, false)
    }

    /// Like [`SecureSockets::poll`], for plain socket layers that can only
    /// wait on plain sockets.
    ///
    /// Buffered records and sticky errors are reported as by `poll`. A DTLS
    /// client still handshaking is waited on through its plain socket
    /// instead of the handshake signal.
    pub fn poll_offload(
        &self,
        fds: &mut [PollFd<'_>],
        timeout: Option<Duration>,
    ) -> Result<usize, Error> {
        self.poll_loop(fds, timeout, true)
    }

    fn poll_loop(
        &self,
        fds: &mut [PollFd<'_>],
        timeout: Option<Duration>,
        offload: bool,
    ) -> Result<usize, Error> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));

            let mut ready = 0;
            let mut pending = Vec::with_capacity(fds.len());
            let mut requests = Vec::with_capacity(fds.len());

            for (i, fd) in fds.iter_mut().enumerate() {
                fd.revents = PollFlags::empty();

                let prepared = match fd.socket.poll_prepare(fd.events) {
                    // No signal waits here, the plain socket stands in.
                    Prepared::Established(_) if offload => Prepared::Transport(fd.events),
                    p => p,
                };

                match prepared {
                    Prepared::Ready(r) => {
                        fd.revents = r;
                        ready += 1;
                    }
                    Prepared::Transport(events) => {
                        pending.push(Pending::Transport(i));
                        requests.push(WaitRequest::transport(&mut *fd.socket.ctx.transport, events));
                    }
                    Prepared::Established(signal) => {
                        pending.push(Pending::Established);
                        requests.push(WaitRequest::signal(signal));
                    }
                }
            }

            // Sample only, something is ready already.
            let wait = if ready > 0 {
                Some(Duration::ZERO)
            } else {
                remaining
            };

            let woken = if requests.is_empty() {
                0
            } else {
                self.shared.transports.poll(&mut requests, wait)?
            };

            let results: Vec<PollFlags> = requests.iter().map(|r| r.revents).collect();
            drop(requests);

            trace!("Poll woke {} of {} waits", woken, results.len());

            let mut retry = false;

            for (p, revents) in pending.into_iter().zip(results) {
                match p {
                    Pending::Transport(i) => {
                        let fd = &mut fds[i];
                        match fd.socket.poll_update(fd.events, revents) {
                            Update::Ready(r) => {
                                fd.revents = r & (fd.events | PollFlags::ERR | PollFlags::HUP | PollFlags::NVAL);
                                if !fd.revents.is_empty() {
                                    ready += 1;
                                }
                            }
                            Update::Retry => retry = true,
                        }
                    }
                    Pending::Established if revents.contains(PollFlags::IN) => {
                        // Handshake done, wait on the plain socket next round.
                        retry = true;
                    }
                    Pending::Established => {}
                }
            }

            if ready > 0 || !retry {
                return Ok(ready);
            }

            if remaining == Some(Duration::ZERO) {
                return Ok(0);
            }
        }
    }
}
