//! Core library for the berth development VM tool.
//!
//! The crate rebuilds a single-tenant cloud VM in place: the instance is
//! replaced while its project volume and public address carry over. Remote
//! access uses short-lived SSH keys pushed through the provider and host
//! identity is pinned on first use.

pub mod bootstrap;
pub mod cloud;
pub mod command;
pub mod config;
pub mod credential;
pub mod exec;
pub mod keys;
pub mod pending;
pub mod recreate;
pub mod remote;
pub mod sessions;
pub mod test_support;
pub mod trust;

pub use bootstrap::{
    BootConfig, BootConfigRenderer, BootstrapError, BootstrapPoller, ScriptRenderer,
    TagBootstrapPoller,
};
pub use cloud::{AwsCli, CloudError, ResourceApi};
pub use command::{CommandError, RemoteCommand};
pub use config::{BerthConfig, ConfigError};
pub use credential::{CredentialError, CredentialIssuer, IssuedCredential};
pub use exec::{CommandOutput, CommandRunner, ExecError, ProcessCommandRunner};
pub use keys::{AddKeyError, AddKeyOutcome, KeyInstaller};
pub use pending::{
    PendingError, PendingScanner, PendingVolume, render_report as render_pending_report,
};
pub use recreate::{
    ErrorKind, RecreateDeps, RecreateError, RecreateOrchestrator, RecreateOutcome,
    RecreateRequest, RecreateSettings, RecreateStep, default_instance_type_policy,
};
pub use remote::{
    CredentialedRunner, ProcessSshTransport, RemoteError, RemoteRunner, RemoteTarget,
    SshTransport,
};
pub use sessions::{DetectError, SessionDetector, SessionReport};
pub use trust::{
    FileHostKeyStore, HostKeyScanner, HostKeyStore, HostKeyStoreError, KeyscanScanner,
    TrustError, TrustedRunner,
};
