//! Unverified remote execution: push a fresh key, then run one command over
//! SSH and return its stdout.
//!
//! [`CredentialedRunner`] composes the [`CredentialIssuer`] with an
//! [`SshTransport`]. Host identity is not decided at this layer; wrap the
//! runner in [`crate::trust::TrustedRunner`], which verifies the key and
//! hands it down in [`RemoteTarget::host_key`] for the client to enforce.

use std::ffi::OsString;
use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::pin::Pin;

use tempfile::NamedTempFile;
use thiserror::Error;

use crate::cloud::KeyPush;
use crate::command::RemoteCommand;
use crate::credential::{CredentialError, CredentialIssuer, CredentialTarget};
use crate::exec::{CommandRunner, ProcessCommandRunner};
use crate::trust::TrustError;

/// Default SSH client binary name.
pub const DEFAULT_SSH_BIN: &str = "ssh";

/// Exit status the OpenSSH client reserves for its own failures.
const SSH_CLIENT_FAILURE: i32 = 255;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Port OpenSSH writes into `known_hosts` without brackets.
const OPENSSH_DEFAULT_PORT: u16 = 22;

/// Connection details for one VM.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteTarget {
    /// VM name used for host trust records.
    pub vm_name: String,
    /// Provider instance identifier used for key push.
    pub instance_id: String,
    /// Availability zone used for key push.
    pub zone: String,
    /// Host name or IP address to connect to.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Remote login user.
    pub user: String,
    /// Verified OpenSSH host key line the server must present.
    ///
    /// `None` leaves the client without a host key to check against.
    pub host_key: Option<String>,
}

impl RemoteTarget {
    /// Returns a copy of the target pinned to `host_key`.
    #[must_use]
    pub fn pinned_to(&self, host_key: impl Into<String>) -> Self {
        Self {
            host_key: Some(host_key.into()),
            ..self.clone()
        }
    }

    /// Renders the `known_hosts` line for the pinned key, if any.
    ///
    /// OpenSSH stores non-default ports as `[host]:port`.
    #[must_use]
    pub fn known_hosts_line(&self) -> Option<String> {
        let key = self.host_key.as_deref()?.trim();
        let pattern = if self.port == OPENSSH_DEFAULT_PORT {
            self.host.clone()
        } else {
            format!("[{}]:{}", self.host, self.port)
        };
        Some(format!("{pattern} {key}\n"))
    }

    fn credential_target(&self) -> CredentialTarget<'_> {
        CredentialTarget {
            instance_id: &self.instance_id,
            zone: &self.zone,
            os_user: &self.user,
        }
    }
}

/// Errors raised by remote execution.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Raised when no credential could be issued for the target.
    #[error(transparent)]
    Credential(#[from] CredentialError),
    /// Raised when the connection itself fails (refused, timeout, auth).
    #[error("ssh transport to {host} failed: {message}")]
    Transport {
        /// Host that could not be reached.
        host: String,
        /// Client diagnostic.
        message: String,
    },
    /// Raised when the remote command exits non-zero.
    #[error("remote command exited with status {code}: {stderr}")]
    CommandFailed {
        /// Remote exit status.
        code: i32,
        /// Remote stderr, trimmed.
        stderr: String,
    },
    /// Raised when host identity verification fails.
    #[error(transparent)]
    Trust(#[from] TrustError),
}

impl RemoteError {
    /// Returns `true` when the failure happened before the command ran.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Future returned by remote runners.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// Runs a single remote command and returns its stdout.
pub trait RemoteRunner {
    /// Executes `command` on `target`.
    fn run<'a>(&'a self, target: &'a RemoteTarget, command: &'a RemoteCommand)
    -> RemoteFuture<'a, String>;
}

impl<T: RemoteRunner + ?Sized> RemoteRunner for &T {
    fn run<'a>(
        &'a self,
        target: &'a RemoteTarget,
        command: &'a RemoteCommand,
    ) -> RemoteFuture<'a, String> {
        (**self).run(target, command)
    }
}

/// Raw SSH transport authenticated with a private key file.
pub trait SshTransport {
    /// Runs `command` on `target` using the key at `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Transport`] for connection failures and
    /// [`RemoteError::CommandFailed`] for non-zero remote exits.
    fn exec(
        &self,
        target: &RemoteTarget,
        identity: &Path,
        command: &RemoteCommand,
    ) -> Result<String, RemoteError>;
}

impl<T: SshTransport + ?Sized> SshTransport for &T {
    fn exec(
        &self,
        target: &RemoteTarget,
        identity: &Path,
        command: &RemoteCommand,
    ) -> Result<String, RemoteError> {
        (**self).exec(target, identity, command)
    }
}

/// [`SshTransport`] backed by the system OpenSSH client.
///
/// A target carrying a pinned host key is connected with strict checking
/// against a one-off `known_hosts` file holding only that key. Targets
/// without one are connected unchecked.
#[derive(Clone, Debug)]
pub struct ProcessSshTransport<R> {
    runner: R,
    ssh_bin: String,
    connect_timeout_secs: u64,
}

impl ProcessSshTransport<ProcessCommandRunner> {
    /// Creates a transport that spawns `ssh_bin`.
    #[must_use]
    pub fn with_process_runner(ssh_bin: impl Into<String>) -> Self {
        Self::new(ProcessCommandRunner, ssh_bin)
    }
}

impl<R: CommandRunner> ProcessSshTransport<R> {
    /// Creates a transport using the provided runner.
    #[must_use]
    pub fn new(runner: R, ssh_bin: impl Into<String>) -> Self {
        Self {
            runner,
            ssh_bin: ssh_bin.into(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }

    /// Overrides the connection timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    fn build_args(
        &self,
        target: &RemoteTarget,
        identity: &Path,
        known_hosts: Option<&Path>,
        command: &RemoteCommand,
    ) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-i"),
            identity.as_os_str().to_owned(),
            OsString::from("-p"),
            OsString::from(target.port.to_string()),
        ];
        let options = [
            OsString::from("BatchMode=yes"),
            OsString::from("IdentitiesOnly=yes"),
            OsString::from(format!("ConnectTimeout={}", self.connect_timeout_secs)),
        ];
        let host_checking = known_hosts.map_or_else(
            || {
                [
                    OsString::from("StrictHostKeyChecking=no"),
                    OsString::from("UserKnownHostsFile=/dev/null"),
                ]
            },
            |path| {
                let mut file_option = OsString::from("UserKnownHostsFile=");
                file_option.push(path.as_os_str());
                [OsString::from("StrictHostKeyChecking=yes"), file_option]
            },
        );
        for option in options
            .into_iter()
            .chain(host_checking)
            .chain([OsString::from("LogLevel=ERROR")])
        {
            args.push(OsString::from("-o"));
            args.push(option);
        }
        args.push(OsString::from(format!("{}@{}", target.user, target.host)));
        args.push(OsString::from("--"));
        args.extend(command.argv().into_iter().map(OsString::from));
        args
    }
}

impl<R: CommandRunner> SshTransport for ProcessSshTransport<R> {
    fn exec(
        &self,
        target: &RemoteTarget,
        identity: &Path,
        command: &RemoteCommand,
    ) -> Result<String, RemoteError> {
        let known_hosts = target
            .known_hosts_line()
            .map(|line| write_known_hosts(&line))
            .transpose()
            .map_err(|err| RemoteError::Transport {
                host: target.host.clone(),
                message: format!("could not write pinned known_hosts file: {err}"),
            })?;
        let args = self.build_args(
            target,
            identity,
            known_hosts.as_ref().map(NamedTempFile::path),
            command,
        );
        let output =
            self.runner
                .run(&self.ssh_bin, &args)
                .map_err(|err| RemoteError::Transport {
                    host: target.host.clone(),
                    message: err.to_string(),
                })?;

        match output.code {
            Some(0) => Ok(output.stdout),
            Some(SSH_CLIENT_FAILURE) | None => Err(RemoteError::Transport {
                host: target.host.clone(),
                message: if output.stderr.trim().is_empty() {
                    format!("ssh exited with status {}", output.status_text())
                } else {
                    output.stderr.trim().to_owned()
                },
            }),
            Some(code) => Err(RemoteError::CommandFailed {
                code,
                stderr: output.stderr.trim().to_owned(),
            }),
        }
    }
}

// tempfile creates the file with mode 0600 on Unix and removes it on drop.
fn write_known_hosts(line: &str) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("berth-known-hosts-")
        .tempfile()?;
    file.write_all(line.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Remote runner that issues a fresh credential for every call.
#[derive(Clone, Debug)]
pub struct CredentialedRunner<P, T> {
    issuer: CredentialIssuer<P>,
    transport: T,
}

impl<P, T> CredentialedRunner<P, T>
where
    P: KeyPush,
    T: SshTransport,
{
    /// Composes a key-push endpoint and a transport.
    #[must_use]
    pub const fn new(key_push: P, transport: T) -> Self {
        Self {
            issuer: CredentialIssuer::new(key_push),
            transport,
        }
    }
}

impl<P, T> RemoteRunner for CredentialedRunner<P, T>
where
    P: KeyPush + Send + Sync,
    T: SshTransport + Send + Sync,
{
    fn run<'a>(
        &'a self,
        target: &'a RemoteTarget,
        command: &'a RemoteCommand,
    ) -> RemoteFuture<'a, String> {
        Box::pin(async move {
            let mut credential = self.issuer.issue(&target.credential_target()).await?;
            let result = match credential.private_key_path() {
                Some(identity) => self.transport.exec(target, identity, command),
                None => Err(RemoteError::Transport {
                    host: target.host.clone(),
                    message: String::from("ephemeral key was released before use"),
                }),
            };
            credential.release();
            result
        })
    }
}

#[cfg(test)]
mod tests;
