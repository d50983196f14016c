//! Ephemeral SSH credentials pushed to an instance before each connection.
//!
//! A fresh Ed25519 key pair is generated per remote call. The public half is
//! delivered through the provider's key-push endpoint; the private half lives
//! in an owner-only temporary file that is removed when the
//! [`IssuedCredential`] is released or dropped.

use std::io::Write;
use std::path::Path;

use rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use tempfile::TempPath;
use thiserror::Error;

use crate::cloud::{CloudError, KeyPush, KeyPushRequest};

const KEY_FILE_PREFIX: &str = "berth-key-";

/// Errors raised while issuing an ephemeral credential.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Raised when key generation or encoding fails.
    #[error("failed to generate ephemeral key: {message}")]
    Generate {
        /// Underlying error message.
        message: String,
    },
    /// Raised when the private key cannot be written to disk.
    #[error("failed to write ephemeral private key: {message}")]
    KeyFile {
        /// Underlying error message.
        message: String,
    },
    /// Raised when the provider declines the pushed public key.
    #[error("key push to {instance_id} was rejected: {source}")]
    KeyPushRejected {
        /// Instance the key was pushed to.
        instance_id: String,
        /// Provider error, unchanged.
        #[source]
        source: CloudError,
    },
}

/// Where an ephemeral key should be delivered.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CredentialTarget<'a> {
    /// Target instance.
    pub instance_id: &'a str,
    /// Availability zone of the instance.
    pub zone: &'a str,
    /// OS user the key is valid for.
    pub os_user: &'a str,
}

/// A delivered key pair whose private half sits in a scoped temporary file.
#[derive(Debug)]
pub struct IssuedCredential {
    public_key: String,
    private_key: Option<TempPath>,
}

impl IssuedCredential {
    /// Returns the OpenSSH public key line that was pushed.
    #[must_use]
    pub fn public_key_line(&self) -> &str {
        &self.public_key
    }

    /// Returns the private key path, or `None` once released.
    #[must_use]
    pub fn private_key_path(&self) -> Option<&Path> {
        self.private_key.as_deref()
    }

    /// Deletes the private key file. Safe to call repeatedly.
    pub fn release(&mut self) {
        if let Some(path) = self.private_key.take()
            && let Err(err) = path.close()
        {
            tracing::warn!(error = %err, "failed to remove ephemeral private key");
        }
    }
}

impl Drop for IssuedCredential {
    fn drop(&mut self) {
        self.release();
    }
}

/// Generates key pairs and pushes them through a [`KeyPush`] endpoint.
#[derive(Clone, Debug)]
pub struct CredentialIssuer<P> {
    key_push: P,
}

impl<P: KeyPush> CredentialIssuer<P> {
    /// Creates an issuer that delivers keys through `key_push`.
    #[must_use]
    pub const fn new(key_push: P) -> Self {
        Self { key_push }
    }

    /// Generates a key pair, writes the private half and pushes the public
    /// half to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::KeyPushRejected`] when the provider declines
    /// the key; the private key file is already removed in that case.
    pub async fn issue(
        &self,
        target: &CredentialTarget<'_>,
    ) -> Result<IssuedCredential, CredentialError> {
        let credential = generate()?;
        let request = KeyPushRequest {
            instance_id: target.instance_id.to_owned(),
            availability_zone: target.zone.to_owned(),
            os_user: target.os_user.to_owned(),
            public_key: credential.public_key.clone(),
        };

        self.key_push
            .push_key(&request)
            .await
            .map_err(|source| CredentialError::KeyPushRejected {
                instance_id: target.instance_id.to_owned(),
                source,
            })?;

        tracing::debug!(instance_id = target.instance_id, "ephemeral key pushed");
        Ok(credential)
    }
}

fn generate() -> Result<IssuedCredential, CredentialError> {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(|err| {
        CredentialError::Generate {
            message: err.to_string(),
        }
    })?;
    let public_key = key
        .public_key()
        .to_openssh()
        .map_err(|err| CredentialError::Generate {
            message: err.to_string(),
        })?;
    let pem = key
        .to_openssh(LineEnding::LF)
        .map_err(|err| CredentialError::Generate {
            message: err.to_string(),
        })?;

    let key_file_error = |err: std::io::Error| CredentialError::KeyFile {
        message: err.to_string(),
    };
    // tempfile creates the file with mode 0600 on Unix.
    let mut file = tempfile::Builder::new()
        .prefix(KEY_FILE_PREFIX)
        .tempfile()
        .map_err(key_file_error)?;
    file.write_all(pem.as_bytes()).map_err(key_file_error)?;
    file.flush().map_err(key_file_error)?;

    Ok(IssuedCredential {
        public_key,
        private_key: Some(file.into_temp_path()),
    })
}
