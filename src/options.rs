//! Socket options at the `SOL_TLS` level.
//!
//! Values use the native endian C layout of the option, see the table below.
//! Option names outside this set fail with [`Error::OptionNotSupported`]
//! and leave the socket untouched.
//!
//! | Option                               | Value                                   |
//! |--------------------------------------|-----------------------------------------|
//! | [`TLS_SEC_TAG_LIST`]                 | `i32` array                             |
//! | [`TLS_HOSTNAME`]                     | bytes, optional trailing NUL            |
//! | [`TLS_CIPHERSUITE_LIST`]             | `i32` array                             |
//! | [`TLS_PEER_VERIFY`]                  | `i32`                                   |
//! | [`TLS_DTLS_ROLE`]                    | `i32`                                   |
//! | [`TLS_ALPN_LIST`]                    | length prefixed protocol names          |
//! | [`TLS_DTLS_HANDSHAKE_TIMEOUT_MIN`]   | `u32` milliseconds                      |
//! | [`TLS_DTLS_HANDSHAKE_TIMEOUT_MAX`]   | `u32` milliseconds                      |
//! | [`TLS_CERT_NOCOPY`]                  | `i32`                                   |
//! | [`TLS_SESSION_CACHE`]                | `i32`                                   |
//! | [`TLS_SESSION_CACHE_PURGE`]          | ignored, set only                       |

use std::time::Duration;

use nom::bytes::complete::take;
use nom::combinator::all_consuming;
use nom::number::complete::{be_u8, i32 as ne_i32, u32 as ne_u32};
use nom::number::Endianness;
use nom::IResult;

use crate::config::Config;
use crate::context::{HandshakeState, TlsContext};
use crate::credentials::{CertCopy, SecTagList};
use crate::engine::{Role, VerifyLevel};
use crate::transport::SocketType;
use crate::util::many0;
use crate::Error;

/// Socket option level of the secure layer.
pub const SOL_TLS: i32 = 282;

pub const TLS_SEC_TAG_LIST: i32 = 1;
pub const TLS_HOSTNAME: i32 = 2;
pub const TLS_CIPHERSUITE_LIST: i32 = 3;
pub const TLS_PEER_VERIFY: i32 = 5;
pub const TLS_DTLS_ROLE: i32 = 6;
pub const TLS_ALPN_LIST: i32 = 7;
pub const TLS_DTLS_HANDSHAKE_TIMEOUT_MIN: i32 = 8;
pub const TLS_DTLS_HANDSHAKE_TIMEOUT_MAX: i32 = 9;
pub const TLS_CERT_NOCOPY: i32 = 10;
pub const TLS_SESSION_CACHE: i32 = 12;
pub const TLS_SESSION_CACHE_PURGE: i32 = 13;

pub const TLS_PEER_VERIFY_NONE: i32 = 0;
pub const TLS_PEER_VERIFY_OPTIONAL: i32 = 1;
pub const TLS_PEER_VERIFY_REQUIRED: i32 = 2;

pub const TLS_DTLS_ROLE_CLIENT: i32 = 0;
pub const TLS_DTLS_ROLE_SERVER: i32 = 1;

pub const TLS_CERT_NOCOPY_NONE: i32 = 0;
pub const TLS_CERT_NOCOPY_OPTIONAL: i32 = 1;

pub const TLS_SESSION_CACHE_DISABLED: i32 = 0;
pub const TLS_SESSION_CACHE_ENABLED: i32 = 1;

/// A decoded `SOL_TLS` option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TlsOption {
    SecTags(SecTagList),
    /// `None` disables the hostname check.
    Hostname(Option<String>),
    Ciphersuites(Vec<i32>),
    PeerVerify(VerifyLevel),
    DtlsRole(Role),
    Alpn(Vec<Vec<u8>>),
    DtlsTimeoutMin(Duration),
    DtlsTimeoutMax(Duration),
    CertNoCopy(CertCopy),
    SessionCache(bool),
    SessionCachePurge,
}

impl TlsOption {
    /// Decode and validate the value of option `name`.
    pub fn parse(name: i32, value: &[u8], config: &Config) -> Result<TlsOption, Error> {
        let opt = match name {
            TLS_SEC_TAG_LIST => TlsOption::SecTags(finish(sec_tags(value))?),
            TLS_HOSTNAME => TlsOption::Hostname(hostname(value, config.max_hostname_len())?),
            TLS_CIPHERSUITE_LIST => {
                let list = finish(int_list(value))?;
                if list.len() > config.max_ciphersuites() {
                    return Err(Error::InvalidArgument);
                }
                TlsOption::Ciphersuites(list)
            }
            TLS_PEER_VERIFY => TlsOption::PeerVerify(match finish(int(value))? {
                TLS_PEER_VERIFY_NONE => VerifyLevel::None,
                TLS_PEER_VERIFY_OPTIONAL => VerifyLevel::Optional,
                TLS_PEER_VERIFY_REQUIRED => VerifyLevel::Required,
                _ => return Err(Error::InvalidArgument),
            }),
            TLS_DTLS_ROLE => TlsOption::DtlsRole(match finish(int(value))? {
                TLS_DTLS_ROLE_CLIENT => Role::Client,
                TLS_DTLS_ROLE_SERVER => Role::Server,
                _ => return Err(Error::InvalidArgument),
            }),
            TLS_ALPN_LIST => {
                let list = finish(alpn_list(value))?;
                if list.len() > config.max_alpn_protocols() || list.iter().any(|p| p.is_empty()) {
                    return Err(Error::InvalidArgument);
                }
                TlsOption::Alpn(list)
            }
            TLS_DTLS_HANDSHAKE_TIMEOUT_MIN => TlsOption::DtlsTimeoutMin(finish(millis(value))?),
            TLS_DTLS_HANDSHAKE_TIMEOUT_MAX => TlsOption::DtlsTimeoutMax(finish(millis(value))?),
            TLS_CERT_NOCOPY => TlsOption::CertNoCopy(match finish(int(value))? {
                TLS_CERT_NOCOPY_NONE => CertCopy::Copy,
                TLS_CERT_NOCOPY_OPTIONAL => CertCopy::NoCopy,
                _ => return Err(Error::InvalidArgument),
            }),
            TLS_SESSION_CACHE => TlsOption::SessionCache(match finish(int(value))? {
                TLS_SESSION_CACHE_DISABLED => false,
                TLS_SESSION_CACHE_ENABLED => true,
                _ => return Err(Error::InvalidArgument),
            }),
            TLS_SESSION_CACHE_PURGE => TlsOption::SessionCachePurge,
            _ => {
                debug!("Unknown TLS option {}", name);
                return Err(Error::OptionNotSupported);
            }
        };

        Ok(opt)
    }

    fn datagram_only(&self) -> bool {
        matches!(
            self,
            TlsOption::DtlsRole(_) | TlsOption::DtlsTimeoutMin(_) | TlsOption::DtlsTimeoutMax(_)
        )
    }

    /// Store the option on `ctx`.
    ///
    /// Options feed the engine at handshake start. They cannot change while
    /// a handshake runs; a change at any other time is picked up by the next
    /// handshake.
    pub fn apply(self, ctx: &mut TlsContext) -> Result<(), Error> {
        if self.datagram_only() && ctx.kind != SocketType::Datagram {
            return Err(Error::OptionNotSupported);
        }

        // Cache purge acts on the shared caches only.
        if self == TlsOption::SessionCachePurge {
            return Ok(());
        }

        if ctx.state == HandshakeState::InProgress {
            debug!("Option change refused, handshake in progress");
            return Err(Error::Busy);
        }

        let o = &mut ctx.options;
        match self {
            TlsOption::SecTags(tags) => o.sec_tags = tags,
            TlsOption::Hostname(h) => {
                o.hostname = h;
                o.hostname_set = true;
            }
            TlsOption::Ciphersuites(list) => o.ciphersuites = list,
            TlsOption::PeerVerify(v) => o.verify = Some(v),
            TlsOption::DtlsRole(r) => ctx.role = r,
            TlsOption::Alpn(list) => o.alpn = list,
            TlsOption::DtlsTimeoutMin(t) => {
                if t.is_zero() || t > o.dtls_timeout_max {
                    return Err(Error::InvalidArgument);
                }
                o.dtls_timeout_min = t;
            }
            TlsOption::DtlsTimeoutMax(t) => {
                if t < o.dtls_timeout_min {
                    return Err(Error::InvalidArgument);
                }
                o.dtls_timeout_max = t;
            }
            TlsOption::CertNoCopy(c) => o.cert_copy = c,
            TlsOption::SessionCache(on) => o.cache_enabled = on,
            TlsOption::SessionCachePurge => {}
        }

        ctx.engine_ready = false;

        Ok(())
    }
}

/// Encode the current value of option `name` into `out`.
///
/// Returns the length written. A too short `out` fails with
/// [`Error::InvalidArgument`].
pub(crate) fn get(ctx: &TlsContext, name: i32, out: &mut [u8]) -> Result<usize, Error> {
    let o = &ctx.options;

    let value: Vec<u8> = match name {
        TLS_SEC_TAG_LIST => o.sec_tags.iter().flat_map(|t| t.to_ne_bytes()).collect(),
        TLS_HOSTNAME => o.hostname.as_deref().unwrap_or("").as_bytes().to_vec(),
        TLS_CIPHERSUITE_LIST => o.ciphersuites.iter().flat_map(|c| c.to_ne_bytes()).collect(),
        TLS_PEER_VERIFY => {
            let level = match o.verify.unwrap_or(VerifyLevel::default_for(ctx.role)) {
                VerifyLevel::None => TLS_PEER_VERIFY_NONE,
                VerifyLevel::Optional => TLS_PEER_VERIFY_OPTIONAL,
                VerifyLevel::Required => TLS_PEER_VERIFY_REQUIRED,
            };
            level.to_ne_bytes().to_vec()
        }
        TLS_DTLS_ROLE if ctx.kind == SocketType::Datagram => {
            let role = match ctx.role {
                Role::Client => TLS_DTLS_ROLE_CLIENT,
                Role::Server => TLS_DTLS_ROLE_SERVER,
            };
            role.to_ne_bytes().to_vec()
        }
        TLS_ALPN_LIST => {
            let mut v = Vec::new();
            for p in &o.alpn {
                v.push(p.len() as u8);
                v.extend_from_slice(p);
            }
            v
        }
        TLS_DTLS_HANDSHAKE_TIMEOUT_MIN if ctx.kind == SocketType::Datagram => {
            to_millis(o.dtls_timeout_min).to_ne_bytes().to_vec()
        }
        TLS_DTLS_HANDSHAKE_TIMEOUT_MAX if ctx.kind == SocketType::Datagram => {
            to_millis(o.dtls_timeout_max).to_ne_bytes().to_vec()
        }
        TLS_CERT_NOCOPY => {
            let v = match o.cert_copy {
                CertCopy::Copy => TLS_CERT_NOCOPY_NONE,
                CertCopy::NoCopy => TLS_CERT_NOCOPY_OPTIONAL,
            };
            v.to_ne_bytes().to_vec()
        }
        TLS_SESSION_CACHE => {
            let v = if o.cache_enabled {
                TLS_SESSION_CACHE_ENABLED
            } else {
                TLS_SESSION_CACHE_DISABLED
            };
            v.to_ne_bytes().to_vec()
        }
        _ => return Err(Error::OptionNotSupported),
    };

    if out.len() < value.len() {
        return Err(Error::InvalidArgument);
    }

    out[..value.len()].copy_from_slice(&value);
    Ok(value.len())
}

fn to_millis(d: Duration) -> u32 {
    d.as_millis().min(u32::MAX as u128) as u32
}

fn finish<T>(r: IResult<&[u8], T>) -> Result<T, Error> {
    r.map(|(_, v)| v).map_err(|_| Error::InvalidArgument)
}

fn sec_tags(input: &[u8]) -> IResult<&[u8], SecTagList> {
    all_consuming(many0(ne_i32(Endianness::Native)))(input)
}

fn int_list(input: &[u8]) -> IResult<&[u8], Vec<i32>> {
    all_consuming(nom::multi::many0(ne_i32(Endianness::Native)))(input)
}

fn int(input: &[u8]) -> IResult<&[u8], i32> {
    all_consuming(ne_i32(Endianness::Native))(input)
}

fn millis(input: &[u8]) -> IResult<&[u8], Duration> {
    let (input, ms) = all_consuming(ne_u32(Endianness::Native))(input)?;
    Ok((input, Duration::from_millis(ms as u64)))
}

fn protocol_name(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (input, len) = be_u8(input)?;
    let (input, name) = take(len)(input)?;
    Ok((input, name.to_vec()))
}

fn alpn_list(input: &[u8]) -> IResult<&[u8], Vec<Vec<u8>>> {
    all_consuming(nom::multi::many0(protocol_name))(input)
}

fn hostname(value: &[u8], max_len: usize) -> Result<Option<String>, Error> {
    let value = value.strip_suffix(&[0u8]).unwrap_or(value);

    if value.is_empty() {
        return Ok(None);
    }

    if value.len() > max_len || value.contains(&0) {
        return Err(Error::InvalidArgument);
    }

    let name = std::str::from_utf8(value).map_err(|_| Error::InvalidArgument)?;
    Ok(Some(name.to_owned()))
}
