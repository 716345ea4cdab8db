//! Credential store interface and per-context credential configuration.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tinyvec::ArrayVec;
use zeroize::Zeroizing;

use crate::config::MAX_SEC_TAGS;
use crate::engine::{Engine, EngineError};
use crate::Error;

/// Opaque reference to a bundle of stored credentials.
pub type SecTag = i32;

/// Ordered list of sec tags a context resolves its credentials from.
pub type SecTagList = ArrayVec<[SecTag; MAX_SEC_TAGS]>;

/// Kind of a stored credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    /// Trusted CA certificate (DER).
    CaCertificate,
    /// Own certificate presented to the peer (DER).
    OwnCertificate,
    /// Private key matching the own certificate.
    PrivateKey,
    /// Pre-shared key.
    Psk,
    /// Identity of the pre-shared key.
    PskIdentity,
}

/// One stored credential.
#[derive(Clone)]
pub struct Credential {
    pub tag: SecTag,
    pub kind: CredentialKind,
    pub data: Arc<[u8]>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("tag", &self.tag)
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .finish()
    }
}

/// The global credential store consumed by the secure layer.
pub trait CredentialStore: Send + Sync {
    /// Look up the credential of `kind` stored under `tag`.
    fn get(&self, tag: SecTag, kind: CredentialKind) -> Option<Credential>;

    /// Every credential stored under `tag`, in storage order.
    fn for_tag(&self, tag: SecTag) -> Vec<Credential>;
}

/// In-memory credential store.
#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: RwLock<Vec<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a credential. Each (tag, kind) pair holds at most one.
    pub fn add(&self, tag: SecTag, kind: CredentialKind, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let mut creds = self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if creds.iter().any(|c| c.tag == tag && c.kind == kind) {
            return Err(Error::AlreadyExists);
        }

        creds.push(Credential {
            tag,
            kind,
            data: Arc::from(data),
        });

        Ok(())
    }

    /// Remove a credential.
    pub fn delete(&self, tag: SecTag, kind: CredentialKind) -> Result<(), Error> {
        let mut creds = self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let index = creds
            .iter()
            .position(|c| c.tag == tag && c.kind == kind)
            .ok_or(Error::NoCredential)?;
        creds.remove(index);

        Ok(())
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, tag: SecTag, kind: CredentialKind) -> Option<Credential> {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|c| c.tag == tag && c.kind == kind)
            .cloned()
    }

    fn for_tag(&self, tag: SecTag) -> Vec<Credential> {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.tag == tag)
            .cloned()
            .collect()
    }
}

/// Whether certificates are copied out of the store or shared with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertCopy {
    #[default]
    Copy,
    NoCopy,
}

/// Certificate chains a context holds for its engine.
#[derive(Debug, Default)]
pub(crate) struct CertificateHolders {
    pub ca_chain: Vec<Arc<[u8]>>,
    pub own_cert: Option<Arc<[u8]>>,
}

fn hold(data: &Arc<[u8]>, copy: CertCopy) -> Arc<[u8]> {
    match copy {
        CertCopy::Copy => Arc::from(&data[..]),
        CertCopy::NoCopy => data.clone(),
    }
}

fn rejected(e: EngineError) -> Error {
    debug!("Engine rejected credential: {}", e);
    match e {
        EngineError::NoMemory => Error::NoMemory,
        _ => Error::InvalidArgument,
    }
}

/// Resolve `tags` against `store` and feed the material to `engine`.
///
/// Everything is resolved before anything reaches the engine, so a missing
/// or inconsistent credential leaves the engine untouched.
pub(crate) fn configure(
    tags: &[SecTag],
    store: &dyn CredentialStore,
    engine: &mut dyn Engine,
    copy: CertCopy,
) -> Result<CertificateHolders, Error> {
    let mut holders = CertificateHolders::default();
    let mut own_key: Option<Zeroizing<Vec<u8>>> = None;
    let mut psk: Option<Zeroizing<Vec<u8>>> = None;
    let mut psk_identity: Option<Zeroizing<Vec<u8>>> = None;

    for &tag in tags {
        let creds = store.for_tag(tag);

        if creds.is_empty() {
            debug!("No credentials for sec tag {}", tag);
            return Err(Error::NoCredential);
        }

        for c in creds {
            match c.kind {
                CredentialKind::CaCertificate => holders.ca_chain.push(hold(&c.data, copy)),
                CredentialKind::OwnCertificate => {
                    if holders.own_cert.is_some() {
                        warn!("More than one own certificate (sec tag {})", tag);
                        return Err(Error::InvalidArgument);
                    }
                    holders.own_cert = Some(hold(&c.data, copy));
                }
                CredentialKind::PrivateKey => {
                    if own_key.is_some() {
                        warn!("More than one private key (sec tag {})", tag);
                        return Err(Error::InvalidArgument);
                    }
                    own_key = Some(Zeroizing::new(c.data.to_vec()));
                }
                CredentialKind::Psk => psk = Some(Zeroizing::new(c.data.to_vec())),
                CredentialKind::PskIdentity => psk_identity = Some(Zeroizing::new(c.data.to_vec())),
            }
        }
    }

    let own = match (holders.own_cert.clone(), own_key) {
        (Some(cert), Some(key)) => Some((cert, key)),
        (None, None) => None,
        _ => {
            warn!("Own certificate and private key must be provided together");
            return Err(Error::InvalidArgument);
        }
    };

    let psk = match (psk, psk_identity) {
        (Some(psk), Some(id)) => Some((psk, id)),
        (None, None) => None,
        _ => {
            warn!("PSK and PSK identity must be provided together");
            return Err(Error::InvalidArgument);
        }
    };

    for ca in &holders.ca_chain {
        engine.add_ca_cert(ca.clone()).map_err(rejected)?;
    }

    if let Some((cert, key)) = own {
        engine.set_own_cert(cert, &key).map_err(rejected)?;
    }

    if let Some((psk, id)) = psk {
        engine.set_psk(&psk, &id).map_err(rejected)?;
    }

    debug!(
        "Configured credentials: {} CA, own cert: {}",
        holders.ca_chain.len(),
        holders.own_cert.is_some()
    );

    Ok(holders)
}
