//! Handshake driving.
//!
//! [`step`] advances the engine once and never waits on its own, except for
//! the bounded datagram receive wait when `blocking` is set. [`drive`] loops
//! it for blocking callers. The socket's own non-blocking flag is never
//! touched.

use std::sync::Arc;

use crate::context::{HandshakeState, TlsContext};
use crate::credentials;
use crate::engine::{EngineConfig, EngineError, Role, VerifyLevel};
use crate::session::{self, SessionStore};
use crate::socket::Shared;
use crate::transport::{MsgFlags, PollFlags, SocketType};
use crate::Error;

/// Outcome of a handshake step that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    /// The handshake is complete.
    Done,
    /// Call again once the transport is ready for these events.
    Want(PollFlags),
}

fn config_error(e: EngineError) -> Error {
    warn!("Engine configuration failed: {}", e);
    match e {
        EngineError::NoMemory => Error::NoMemory,
        _ => Error::InvalidArgument,
    }
}

/// Apply options and credentials to the engine, once per configuration.
pub(crate) fn init_engine(ctx: &mut TlsContext, shared: &Shared) -> Result<(), Error> {
    if ctx.engine_ready {
        return Ok(());
    }

    // A previous attempt, or an earlier configuration, left state behind.
    if ctx.engine_stale {
        ctx.engine = shared.engines.new_engine().map_err(|e| {
            warn!("Failed to create engine: {}", e);
            Error::NoMemory
        })?;
        ctx.certs = Default::default();
    }
    ctx.engine_stale = true;

    let o = &ctx.options;
    let is_server = ctx.role == Role::Server;

    let session_store = (is_server && o.cache_enabled)
        .then(|| shared.server_cache.clone() as Arc<dyn SessionStore>);

    let cookies = if is_server && ctx.kind == SocketType::Datagram {
        ctx.cookies.clone()
    } else {
        None
    };

    if o.hostname_set && o.hostname.is_none() {
        debug!("Hostname check disabled");
    }

    let config = EngineConfig {
        role: ctx.role,
        protocol: ctx.protocol,
        verify: o.verify.unwrap_or(VerifyLevel::default_for(ctx.role)),
        hostname: o.hostname.clone(),
        hostname_set: o.hostname_set,
        ciphersuites: o.ciphersuites.clone(),
        alpn: o.alpn.clone(),
        dtls_timeouts: (o.dtls_timeout_min, o.dtls_timeout_max),
        cookies,
        session_store,
    };

    trace!("Configuring engine: {:?}", config);

    ctx.engine.configure(&config).map_err(config_error)?;
    ctx.certs = credentials::configure(&o.sec_tags, &*shared.credentials, &mut *ctx.engine, o.cert_copy)?;
    ctx.engine.setup().map_err(config_error)?;

    ctx.engine_ready = true;

    Ok(())
}

/// Return the context to its pre-handshake state.
///
/// A DTLS server forgets its peer so a new client can connect without the
/// socket being closed. A client keeps it for an immediate retry.
pub(crate) fn reset(ctx: &mut TlsContext) -> Result<(), Error> {
    debug!("Resetting session ({:?})", ctx.role);

    ctx.engine.session_reset().map_err(|e| {
        error!("Session reset failed: {}", e);
        Error::NoMemory
    })?;

    ctx.established.clear();
    ctx.state = HandshakeState::NotStarted;
    ctx.timer.cancel();

    if ctx.kind == SocketType::Datagram && ctx.role == Role::Server {
        ctx.peer = None;
    }

    Ok(())
}

fn established(ctx: &mut TlsContext, shared: &Shared) {
    ctx.state = HandshakeState::Established;
    ctx.established.raise();

    debug!("Handshake complete ({:?}, peer {:?})", ctx.role, ctx.peer);

    if ctx.role == Role::Client && ctx.options.cache_enabled && shared.config.client_cache_entries() > 0 {
        if let Some(peer) = ctx.peer {
            session::save(&shared.client_cache, &*ctx.engine, peer);
        }
    }
}

/// Advance the handshake once.
///
/// With `blocking` set, datagram receives wait up to the retransmit timer.
pub(crate) fn step(ctx: &mut TlsContext, shared: &Shared, blocking: bool) -> Result<Progress, Error> {
    if ctx.state == HandshakeState::Established {
        return Ok(Progress::Done);
    }

    if ctx.state == HandshakeState::NotStarted {
        init_engine(ctx, shared)?;

        if ctx.role == Role::Client && ctx.options.cache_enabled && shared.config.client_cache_entries() > 0 {
            if let Some(peer) = ctx.peer {
                session::restore(&shared.client_cache, &mut *ctx.engine, peer);
            }
        }

        ctx.state = HandshakeState::InProgress;
        debug!("Handshake started ({:?}, {:?})", ctx.role, ctx.protocol);
    }

    let (engine, mut bio) = ctx.io(blocking, MsgFlags::empty());
    let res = engine.handshake_step(&mut bio);

    match res {
        Ok(()) => {
            established(ctx, shared);
            Ok(Progress::Done)
        }
        Err(EngineError::WantWrite) => Ok(Progress::Want(PollFlags::OUT)),
        Err(e) if e.is_would_block() => Ok(Progress::Want(PollFlags::IN)),
        Err(EngineError::HelloVerifyRequired) => {
            debug!("Hello verify requested from {:?}", ctx.peer);
            reset(ctx)?;
            // Still waiting for the client to echo its cookie.
            ctx.state = HandshakeState::InProgress;
            Ok(Progress::Want(PollFlags::IN))
        }
        Err(EngineError::Timeout) => {
            debug!("Handshake timed out");
            reset(ctx)?;
            Err(Error::TimedOut)
        }
        Err(e) => {
            warn!("Handshake failed: {}", e);
            reset(ctx)?;
            Err(Error::ConnectionAborted)
        }
    }
}

/// Drive the handshake to completion, or to the first would-block when not
/// `blocking`.
pub(crate) fn drive(ctx: &mut TlsContext, shared: &Shared, blocking: bool) -> Result<(), Error> {
    loop {
        match step(ctx, shared, blocking)? {
            Progress::Done => return Ok(()),
            Progress::Want(_) if !blocking => return Err(Error::WouldBlock),
            Progress::Want(events) => {
                // Datagram reads already waited inside the engine.
                if ctx.kind == SocketType::Stream || events.contains(PollFlags::OUT) {
                    ctx.transport.wait(events, None)?;
                }
            }
        }
    }
}
