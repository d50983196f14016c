//! Remote runner decorator that verifies host identity before delegating.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::command::RemoteCommand;
use crate::remote::{RemoteFuture, RemoteRunner, RemoteTarget};

use super::{HostKeyScanner, HostKeyStore, TrustError};

type Endpoint = (String, u16);

/// Wraps a [`RemoteRunner`] with trust-on-first-use host key checks.
///
/// Each distinct `(host, port)` is scanned at most once per wrapper; the
/// outcome, failure included, is reused for every later call. Build a fresh
/// wrapper per outer operation.
///
/// The verified key travels to the inner runner in
/// [`RemoteTarget::host_key`], so the SSH client refuses a server that
/// presents anything else.
#[derive(Debug)]
pub struct TrustedRunner<'d, R, S, H> {
    inner: &'d R,
    scanner: &'d S,
    store: &'d H,
    verified: Mutex<HashMap<Endpoint, Result<String, TrustError>>>,
}

impl<'d, R, S, H> TrustedRunner<'d, R, S, H>
where
    S: HostKeyScanner,
    H: HostKeyStore,
{
    /// Creates a wrapper with an empty verification cache.
    #[must_use]
    pub fn new(inner: &'d R, scanner: &'d S, store: &'d H) -> Self {
        Self {
            inner,
            scanner,
            store,
            verified: Mutex::new(HashMap::new()),
        }
    }

    /// Drops every cached outcome so the next call scans again.
    pub fn reset(&self) {
        self.verified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Verifies the host identity of `target`, scanning only on a cache miss.
    ///
    /// Returns the verified OpenSSH public key line.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::ScanFailed`] when the key cannot be fetched and
    /// [`TrustError::HostKeyChanged`] when it differs from the pinned key.
    pub fn verify(&self, target: &RemoteTarget) -> Result<String, TrustError> {
        let endpoint = (target.host.clone(), target.port);
        let mut cache = self.verified.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(outcome) = cache.get(&endpoint) {
            return outcome.clone();
        }
        let outcome = self.check(target);
        cache.insert(endpoint, outcome.clone());
        outcome
    }

    fn check(&self, target: &RemoteTarget) -> Result<String, TrustError> {
        let scanned =
            self.scanner
                .scan(&target.host, target.port)
                .map_err(|err| TrustError::ScanFailed {
                    host: target.host.clone(),
                    port: target.port,
                    message: err.message,
                })?;

        match self.store.fingerprint(&target.vm_name)? {
            None => {
                self.store.record(&target.vm_name, &scanned.fingerprint)?;
                tracing::info!(
                    vm = %target.vm_name,
                    fingerprint = %scanned.fingerprint,
                    "pinned host key on first use"
                );
                Ok(scanned.public_key)
            }
            Some(stored) if stored == scanned.fingerprint => Ok(scanned.public_key),
            Some(stored) => {
                tracing::warn!(vm = %target.vm_name, "host key mismatch");
                Err(TrustError::HostKeyChanged {
                    vm_name: target.vm_name.clone(),
                    stored,
                    current: scanned.fingerprint,
                })
            }
        }
    }
}

impl<R, S, H> RemoteRunner for TrustedRunner<'_, R, S, H>
where
    R: RemoteRunner + Sync,
    S: HostKeyScanner + Sync,
    H: HostKeyStore + Sync,
{
    fn run<'a>(
        &'a self,
        target: &'a RemoteTarget,
        command: &'a RemoteCommand,
    ) -> RemoteFuture<'a, String> {
        Box::pin(async move {
            let pinned = target.pinned_to(self.verify(target)?);
            self.inner.run(&pinned, command).await
        })
    }
}
