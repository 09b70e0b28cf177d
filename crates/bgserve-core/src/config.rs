//! Per-service configuration
//!
//! A [`ServeConfig`] describes one background service: which directories
//! are mounted at which URL prefixes, where to bind, which response
//! headers to enable and whether the auth channel is used.
//!
//! ```ignore
//! let config = ServeConfig::from_pairs(&["/srv/a", "/srv/b"], &["/x", "/y"])?
//!     .addr("127.0.0.1:8181")
//!     .cors(true)
//!     .auth_keys(["s3cret"]);
//! config.validate()?;
//! ```
//!
//! Validation happens before anything is allocated. Normalization fills
//! the same defaults the embedded runtime would pick on its own, so that
//! `list()` reports what is actually served.

use core::fmt;
use std::path::Path;

use crate::auth;
use crate::constants::{DEFAULT_ADDR, DEFAULT_DIR};
use crate::error::{ServeError, ServeResult};

/// One (root directory, URL prefix) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mount {
    pub dir: String,
    pub prefix: String,
}

impl Mount {
    pub fn new(dir: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }
}

impl fmt::Display for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.prefix, self.dir)
    }
}

/// Configuration of one background service, with builder methods
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeConfig {
    /// Served directories, in registration order
    pub mounts: Vec<Mount>,
    /// Bind address, `host:port`
    pub addr: String,
    /// Send permissive CORS headers
    pub cors: bool,
    /// Send cross-origin isolation (COOP/COEP) headers
    pub coop: bool,
    /// Serve HTTPS with `cert_file` / `key_file`
    pub tls: bool,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    /// Ask the runtime not to log
    pub silent: bool,
    /// Open an auth channel to the runtime
    pub auth: bool,
    /// Keys applied before the worker starts serving
    pub auth_keys: Vec<String>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ServeConfig {
    /// Empty configuration bound to the default address.
    /// At least one mount must be added before it validates.
    pub fn new() -> Self {
        Self {
            mounts: Vec::new(),
            addr: DEFAULT_ADDR.to_string(),
            cors: false,
            coop: false,
            tls: false,
            cert_file: None,
            key_file: None,
            silent: false,
            auth: false,
            auth_keys: Vec::new(),
        }
    }

    /// Build from parallel directory and prefix lists.
    ///
    /// Fails with `InvalidConfig` when the lists differ in length or are
    /// empty.
    pub fn from_pairs<D, P>(dirs: &[D], prefixes: &[P]) -> ServeResult<Self>
    where
        D: AsRef<str>,
        P: AsRef<str>,
    {
        if dirs.len() != prefixes.len() {
            return Err(ServeError::InvalidConfig(format!(
                "{} directories but {} prefixes",
                dirs.len(),
                prefixes.len()
            )));
        }
        if dirs.is_empty() {
            return Err(ServeError::InvalidConfig(
                "at least one directory is required".into(),
            ));
        }
        let mounts = dirs
            .iter()
            .zip(prefixes)
            .map(|(d, p)| Mount::new(d.as_ref(), p.as_ref()))
            .collect();
        Ok(Self {
            mounts,
            ..Self::new()
        })
    }

    // Builder methods

    pub fn mount(mut self, dir: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.mounts.push(Mount::new(dir, prefix));
        self
    }

    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn cors(mut self, enable: bool) -> Self {
        self.cors = enable;
        self
    }

    pub fn coop(mut self, enable: bool) -> Self {
        self.coop = enable;
        self
    }

    pub fn tls(mut self, cert_file: impl Into<String>, key_file: impl Into<String>) -> Self {
        self.tls = true;
        self.cert_file = Some(cert_file.into());
        self.key_file = Some(key_file.into());
        self
    }

    pub fn silent(mut self, enable: bool) -> Self {
        self.silent = enable;
        self
    }

    pub fn auth(mut self, enable: bool) -> Self {
        self.auth = enable;
        self
    }

    /// Enable auth and seed it with `keys`
    pub fn auth_keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.auth = true;
        self.auth_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Check everything that can be checked without touching the OS
    pub fn validate(&self) -> ServeResult<()> {
        if self.mounts.is_empty() {
            return Err(ServeError::InvalidConfig(
                "at least one directory is required".into(),
            ));
        }
        if self.tls {
            if is_blank(&self.cert_file) {
                return Err(ServeError::InvalidConfig(
                    "tls requires a certificate file".into(),
                ));
            }
            if is_blank(&self.key_file) {
                return Err(ServeError::InvalidConfig("tls requires a key file".into()));
            }
        }
        for key in &self.auth_keys {
            // Empty seed keys are skipped, not rejected
            if !key.is_empty() {
                auth::validate_key(key)
                    .map_err(|_| ServeError::InvalidConfig(format!("auth key {key:?} contains a line break")))?;
            }
        }
        Ok(())
    }

    /// Fill the defaults the runtime would choose: empty directory is
    /// `"."`, empty prefix is the absolute directory, empty address is
    /// `0.0.0.0:8080`.
    pub fn normalize(&mut self) {
        if self.addr.trim().is_empty() {
            self.addr = DEFAULT_ADDR.to_string();
        }
        for m in &mut self.mounts {
            if m.dir.is_empty() {
                m.dir = DEFAULT_DIR.to_string();
            }
            if m.prefix.is_empty() {
                m.prefix = std::path::absolute(Path::new(&m.dir))
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| m.dir.clone());
            }
        }
    }

    #[inline]
    pub fn scheme(&self) -> &'static str {
        if self.tls { "https" } else { "http" }
    }
}

fn is_blank(v: &Option<String>) -> bool {
    v.as_deref().map_or(true, |s| s.trim().is_empty())
}
