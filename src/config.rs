use std::time::Duration;

use crate::Error;

/// Hard upper bound on the number of sec tags a context can reference.
pub const MAX_SEC_TAGS: usize = 8;

/// Secure socket layer configuration
#[derive(Debug, Clone)]
pub struct Config {
    max_contexts: usize,
    max_ciphersuites: usize,
    max_alpn_protocols: usize,
    max_hostname_len: usize,
    client_cache_entries: usize,
    server_cache_entries: usize,
    server_cache_timeout: Duration,
    with_dtls: bool,
    dtls_handshake_timeout_min: Duration,
    dtls_handshake_timeout_max: Duration,
    cookie_lifetime: Duration,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            max_contexts: 4,
            max_ciphersuites: 16,
            max_alpn_protocols: 4,
            max_hostname_len: 255,
            client_cache_entries: 4,
            server_cache_entries: 50,
            server_cache_timeout: Duration::from_secs(86_400),
            with_dtls: true,
            dtls_handshake_timeout_min: Duration::from_secs(1),
            dtls_handshake_timeout_max: Duration::from_secs(60),
            cookie_lifetime: Duration::from_secs(60),
        }
    }

    /// Number of secure socket contexts in the pool.
    ///
    /// Every open secure socket holds one context.
    #[inline(always)]
    pub fn max_contexts(&self) -> usize {
        self.max_contexts
    }

    /// Max entries in a ciphersuite allow-list.
    #[inline(always)]
    pub fn max_ciphersuites(&self) -> usize {
        self.max_ciphersuites
    }

    /// Max entries in an ALPN protocol list.
    #[inline(always)]
    pub fn max_alpn_protocols(&self) -> usize {
        self.max_alpn_protocols
    }

    /// Longest hostname accepted by `TLS_HOSTNAME`.
    #[inline(always)]
    pub fn max_hostname_len(&self) -> usize {
        self.max_hostname_len
    }

    /// Slots in the client session cache. Zero disables it.
    #[inline(always)]
    pub fn client_cache_entries(&self) -> usize {
        self.client_cache_entries
    }

    /// Entries kept by the server session cache.
    #[inline(always)]
    pub fn server_cache_entries(&self) -> usize {
        self.server_cache_entries
    }

    /// Lifetime of a server session cache entry.
    #[inline(always)]
    pub fn server_cache_timeout(&self) -> Duration {
        self.server_cache_timeout
    }

    /// Whether datagram (DTLS) sockets can be created.
    #[inline(always)]
    pub fn with_dtls(&self) -> bool {
        self.with_dtls
    }

    /// Default initial DTLS retransmit timeout.
    #[inline(always)]
    pub fn dtls_handshake_timeout_min(&self) -> Duration {
        self.dtls_handshake_timeout_min
    }

    /// Default DTLS handshake timeout, after which the handshake fails.
    #[inline(always)]
    pub fn dtls_handshake_timeout_max(&self) -> Duration {
        self.dtls_handshake_timeout_max
    }

    /// How long a DTLS cookie stays valid after it was issued.
    #[inline(always)]
    pub fn cookie_lifetime(&self) -> Duration {
        self.cookie_lifetime
    }
}

/// Builder for the secure socket layer configuration.
pub struct ConfigBuilder {
    max_contexts: usize,
    max_ciphersuites: usize,
    max_alpn_protocols: usize,
    max_hostname_len: usize,
    client_cache_entries: usize,
    server_cache_entries: usize,
    server_cache_timeout: Duration,
    with_dtls: bool,
    dtls_handshake_timeout_min: Duration,
    dtls_handshake_timeout_max: Duration,
    cookie_lifetime: Duration,
}

impl ConfigBuilder {
    /// Set the number of contexts in the pool.
    ///
    /// Defaults to 4.
    pub fn max_contexts(mut self, n: usize) -> Self {
        self.max_contexts = n;
        self
    }

    /// Set the max length of a ciphersuite allow-list.
    ///
    /// Defaults to 16.
    pub fn max_ciphersuites(mut self, n: usize) -> Self {
        self.max_ciphersuites = n;
        self
    }

    /// Set the max number of ALPN protocols per socket.
    ///
    /// Defaults to 4.
    pub fn max_alpn_protocols(mut self, n: usize) -> Self {
        self.max_alpn_protocols = n;
        self
    }

    /// Set the longest accepted hostname.
    ///
    /// Defaults to 255.
    pub fn max_hostname_len(mut self, n: usize) -> Self {
        self.max_hostname_len = n;
        self
    }

    /// Set the number of client session cache slots.
    ///
    /// Defaults to 4. Zero disables client side resumption.
    pub fn client_cache_entries(mut self, n: usize) -> Self {
        self.client_cache_entries = n;
        self
    }

    /// Set the number of server session cache entries.
    ///
    /// Defaults to 50.
    pub fn server_cache_entries(mut self, n: usize) -> Self {
        self.server_cache_entries = n;
        self
    }

    /// Set the lifetime of server session cache entries.
    ///
    /// Defaults to one day.
    pub fn server_cache_timeout(mut self, timeout: Duration) -> Self {
        self.server_cache_timeout = timeout;
        self
    }

    /// Enable or disable datagram (DTLS) support.
    ///
    /// Defaults to true.
    pub fn with_dtls(mut self, enabled: bool) -> Self {
        self.with_dtls = enabled;
        self
    }

    /// Set the default initial DTLS retransmit timeout.
    ///
    /// Defaults to 1 second.
    pub fn dtls_handshake_timeout_min(mut self, timeout: Duration) -> Self {
        self.dtls_handshake_timeout_min = timeout;
        self
    }

    /// Set the default total DTLS handshake timeout.
    ///
    /// Defaults to 60 seconds.
    pub fn dtls_handshake_timeout_max(mut self, timeout: Duration) -> Self {
        self.dtls_handshake_timeout_max = timeout;
        self
    }

    /// Set how long issued DTLS cookies remain valid.
    ///
    /// Defaults to 60 seconds.
    pub fn cookie_lifetime(mut self, lifetime: Duration) -> Self {
        self.cookie_lifetime = lifetime;
        self
    }

    /// Build the configuration.
    ///
    /// Returns `Error::InvalidArgument` if the pool is empty, the initial
    /// DTLS timeout is zero or the DTLS timeout bounds are inverted.
    pub fn build(self) -> Result<Config, Error> {
        if self.max_contexts == 0 {
            return Err(Error::InvalidArgument);
        }

        if self.dtls_handshake_timeout_min.is_zero()
            || self.dtls_handshake_timeout_min > self.dtls_handshake_timeout_max
        {
            return Err(Error::InvalidArgument);
        }

        Ok(Config {
            max_contexts: self.max_contexts,
            max_ciphersuites: self.max_ciphersuites,
            max_alpn_protocols: self.max_alpn_protocols,
            max_hostname_len: self.max_hostname_len,
            client_cache_entries: self.client_cache_entries,
            server_cache_entries: self.server_cache_entries,
            server_cache_timeout: self.server_cache_timeout,
            with_dtls: self.with_dtls,
            dtls_handshake_timeout_min: self.dtls_handshake_timeout_min,
            dtls_handshake_timeout_max: self.dtls_handshake_timeout_max,
            cookie_lifetime: self.cookie_lifetime,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::builder()
            .build()
            .expect("Default config should always validate")
    }
}
