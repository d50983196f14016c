//! Trust-on-first-use host verification.
//!
//! A VM's host key fingerprint is pinned the first time berth connects to it
//! and compared on every later run. A changed fingerprint is never accepted
//! silently: the operator must recreate the VM or forget the pinned key.

use ssh_key::{HashAlg, PublicKey};
use thiserror::Error;

mod runner;
mod scanner;
mod store;

pub use runner::TrustedRunner;
pub use scanner::{DEFAULT_KEYSCAN_BIN, KeyscanScanner};
pub use store::{FileHostKeyStore, HOST_KEYS_FILE_NAME};

/// Errors raised while reading or writing pinned host keys.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum HostKeyStoreError {
    /// Raised when no store location can be determined.
    #[error("cannot locate the host key store: {message}")]
    Location {
        /// Explanation of what is missing.
        message: String,
    },
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: String,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the store content cannot be parsed or has the wrong shape.
    #[error("invalid host key store {path}: {message}")]
    Invalid {
        /// Path of the malformed store.
        path: String,
        /// Human-readable error message.
        message: String,
    },
}

/// Errors raised by host verification.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TrustError {
    /// Raised when the host key could not be scanned.
    #[error("failed to scan host key of {host}:{port}: {message}")]
    ScanFailed {
        /// Scanned host.
        host: String,
        /// Scanned port.
        port: u16,
        /// Scanner diagnostic.
        message: String,
    },
    /// Raised when the scanned key differs from the pinned one.
    #[error(
        "HOST KEY CHANGED for VM \"{vm_name}\"\n\
         Stored fingerprint: {stored}\n\
         Current fingerprint: {current}\n\
         Someone may be intercepting the connection. If the VM was rebuilt, \
         destroy and recreate it with `berth recreate`, or clear the pinned key \
         with `berth forget-host-key {vm_name}`."
    )]
    HostKeyChanged {
        /// VM whose key changed.
        vm_name: String,
        /// Pinned fingerprint.
        stored: String,
        /// Fingerprint presented now.
        current: String,
    },
    /// Raised when the pinned key store fails.
    #[error(transparent)]
    Store(#[from] HostKeyStoreError),
}

impl TrustError {
    /// Returns `true` for a fingerprint mismatch.
    #[must_use]
    pub const fn is_violation(&self) -> bool {
        matches!(self, Self::HostKeyChanged { .. })
    }
}

/// Persistent map from VM name to pinned host key fingerprint.
pub trait HostKeyStore {
    /// Returns the pinned fingerprint for `vm_name`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`HostKeyStoreError`] when the store cannot be read.
    fn fingerprint(&self, vm_name: &str) -> Result<Option<String>, HostKeyStoreError>;

    /// Pins `fingerprint` for `vm_name`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`HostKeyStoreError`] when the store cannot be written.
    fn record(&self, vm_name: &str, fingerprint: &str) -> Result<(), HostKeyStoreError>;

    /// Removes the pinned fingerprint, returning whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`HostKeyStoreError`] when the store cannot be updated.
    fn forget(&self, vm_name: &str) -> Result<bool, HostKeyStoreError>;
}

impl<T: HostKeyStore + ?Sized> HostKeyStore for &T {
    fn fingerprint(&self, vm_name: &str) -> Result<Option<String>, HostKeyStoreError> {
        (**self).fingerprint(vm_name)
    }

    fn record(&self, vm_name: &str, fingerprint: &str) -> Result<(), HostKeyStoreError> {
        (**self).record(vm_name, fingerprint)
    }

    fn forget(&self, vm_name: &str) -> Result<bool, HostKeyStoreError> {
        (**self).forget(vm_name)
    }
}

/// A host key presented by a server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScannedHostKey {
    /// `SHA256:`-prefixed fingerprint.
    pub fingerprint: String,
    /// OpenSSH public key line.
    pub public_key: String,
}

/// Failure reported by a [`HostKeyScanner`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct ScanError {
    /// Scanner diagnostic.
    pub message: String,
}

impl ScanError {
    /// Builds a scan error from any message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Fetches the host key a server presents.
pub trait HostKeyScanner {
    /// Scans `host:port`.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError`] when the host is unreachable or presents no
    /// usable key.
    fn scan(&self, host: &str, port: u16) -> Result<ScannedHostKey, ScanError>;
}

impl<T: HostKeyScanner + ?Sized> HostKeyScanner for &T {
    fn scan(&self, host: &str, port: u16) -> Result<ScannedHostKey, ScanError> {
        (**self).scan(host, port)
    }
}

/// Computes the `SHA256:<base64>` fingerprint of an OpenSSH public key line.
///
/// # Errors
///
/// Returns [`ScanError`] when the line is not a valid public key.
pub fn fingerprint_of(public_key_line: &str) -> Result<String, ScanError> {
    let key = PublicKey::from_openssh(public_key_line.trim())
        .map_err(|err| ScanError::new(format!("unparseable host key: {err}")))?;
    Ok(key.fingerprint(HashAlg::Sha256).to_string())
}

#[cfg(test)]
mod tests;
