//! Transport bindings the engine does its record I/O through.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::engine::{Bio, EngineError, Role};
use crate::timer::{DtlsTimer, TimerState};
use crate::transport::{MsgFlags, PollFlags, SocketType, Transport};

/// [`Bio`] over a context's plain socket.
///
/// Stream transports are always driven non-blocking, the handshake driver
/// and the public operations do the waiting. Datagram receives may wait
/// (bounded by the retransmit timer) when `wait` is set.
pub(crate) struct IoAdapter<'a> {
    pub kind: SocketType,
    pub role: Role,
    pub transport: &'a mut dyn Transport,
    pub flags: MsgFlags,
    pub wait: bool,
    pub peer: &'a mut Option<SocketAddr>,
    pub timer: &'a mut DtlsTimer,
}

fn io_error(e: io::Error, would_block: EngineError) -> EngineError {
    if e.kind() == io::ErrorKind::WouldBlock {
        would_block
    } else {
        trace!("Transport error: {}", e);
        EngineError::Transport
    }
}

impl IoAdapter<'_> {
    fn nonblocking_flags(&self) -> MsgFlags {
        (self.flags | MsgFlags::DONTWAIT) & !(MsgFlags::WAITALL | MsgFlags::PEEK)
    }

    fn stream_recv(&mut self, buf: &mut [u8]) -> Result<usize, EngineError> {
        let flags = self.nonblocking_flags();
        match self.transport.recv_from(buf, flags) {
            Ok((0, _)) => Err(EngineError::Eof),
            Ok((n, _)) => Ok(n),
            Err(e) => Err(io_error(e, EngineError::WantRead)),
        }
    }

    fn datagram_recv(&mut self, buf: &mut [u8]) -> Result<usize, EngineError> {
        loop {
            if self.wait {
                let timeout = self.timer.remaining();

                if timeout == Some(Duration::ZERO) {
                    return Err(EngineError::Timeout);
                }

                let ready = self
                    .transport
                    .wait(PollFlags::IN, timeout)
                    .map_err(|e| io_error(e, EngineError::WantRead))?;

                if ready.is_empty() {
                    return Err(EngineError::Timeout);
                }
            }

            let flags = self.nonblocking_flags();
            let (n, from) = match self.transport.recv_from(buf, flags) {
                Ok(r) => r,
                Err(e) => return Err(io_error(e, EngineError::WantRead)),
            };

            let Some(from) = from else {
                return Ok(n);
            };

            match *self.peer {
                Some(peer) if peer == from => return Ok(n),
                Some(peer) => {
                    trace!("Discarding datagram from {} (peer is {})", from, peer);
                    continue;
                }
                None if self.role == Role::Server => {
                    debug!("Adopting DTLS peer {}", from);
                    *self.peer = Some(from);
                    return Ok(n);
                }
                None => {
                    warn!("Datagram from {} before a peer was set", from);
                    return Err(EngineError::Verification);
                }
            }
        }
    }
}

impl Bio for IoAdapter<'_> {
    fn send(&mut self, buf: &[u8]) -> Result<usize, EngineError> {
        let flags = self.nonblocking_flags();

        let to = match self.kind {
            SocketType::Stream => None,
            SocketType::Datagram => match *self.peer {
                Some(peer) => Some(peer),
                None => return Err(EngineError::Transport),
            },
        };

        trace!("Send record of {} bytes", buf.len());

        self.transport
            .send_to(buf, flags, to)
            .map_err(|e| io_error(e, EngineError::WantWrite))
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, EngineError> {
        let n = match self.kind {
            SocketType::Stream => self.stream_recv(buf)?,
            SocketType::Datagram => self.datagram_recv(buf)?,
        };

        trace!("Received {} bytes", n);
        Ok(n)
    }

    fn transport_id(&self) -> Option<SocketAddr> {
        *self.peer
    }

    fn set_timer(&mut self, intermediate: Duration, fin: Duration) {
        self.timer.set(intermediate, fin);
    }

    fn timer(&self) -> TimerState {
        self.timer.state()
    }
}
