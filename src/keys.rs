//! Installs an additional public key on a running VM.

use camino::Utf8Path;
use ssh_key::PublicKey;
use thiserror::Error;

use crate::cloud::{CloudError, DescribeInstances, InstanceFilter, Vm, VmState};
use crate::command::{
    AUTHORIZED_KEYS_FILE, CommandError, append_line, key_membership, membership_present,
};
use crate::recreate::ErrorKind;
use crate::remote::{RemoteError, RemoteRunner, RemoteTarget};

/// Errors raised while installing a key.
#[derive(Debug, Error)]
pub enum AddKeyError {
    /// Raised when the key does not parse as an OpenSSH public key.
    #[error("not an OpenSSH public key: {message}")]
    InvalidKey {
        /// Parser diagnostic.
        message: String,
    },
    /// Raised when the key line cannot be embedded in a remote command.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Raised when the VM cannot be listed.
    #[error("failed to look up VM: {0}")]
    Cloud(#[from] CloudError),
    /// Raised when the owner has no such VM.
    #[error("no VM named \"{vm_name}\" owned by {owner}")]
    VmNotFound {
        /// Requested VM name.
        vm_name: String,
        /// Owner tag searched.
        owner: String,
    },
    /// Raised when the VM is not running.
    #[error("VM \"{vm_name}\" is {state}; start it before adding keys")]
    NotRunning {
        /// VM name.
        vm_name: String,
        /// Current state.
        state: VmState,
    },
    /// Raised when the VM has no public address.
    #[error("VM \"{vm_name}\" has no public address")]
    NoAddress {
        /// VM name.
        vm_name: String,
    },
    /// Raised when the remote update fails.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl AddKeyError {
    /// Maps the failure onto the shared error taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidKey { .. } | Self::Command(_) => ErrorKind::Configuration,
            Self::VmNotFound { .. } => ErrorKind::NotFound,
            Self::NotRunning { .. } | Self::NoAddress { .. } => ErrorKind::StateConflict,
            Self::Remote(RemoteError::Trust(err)) if err.is_violation() => {
                ErrorKind::TrustViolation
            }
            Self::Remote(RemoteError::CommandFailed { .. }) => ErrorKind::StepFailure,
            Self::Cloud(_) | Self::Remote(_) => ErrorKind::Transport,
        }
    }
}

/// Result of an add-key request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddKeyOutcome {
    /// The key was appended.
    Added,
    /// The key was already authorised; nothing changed.
    AlreadyPresent,
}

/// Appends public keys to the login user's `authorized_keys`.
#[derive(Clone, Debug)]
pub struct KeyInstaller<A, R> {
    api: A,
    runner: R,
    owner: String,
    ssh_user: String,
    ssh_port: u16,
}

impl<A, R> KeyInstaller<A, R>
where
    A: DescribeInstances + Sync,
    R: RemoteRunner + Sync,
{
    /// Creates an installer acting for `owner`.
    #[must_use]
    pub fn new(
        api: A,
        runner: R,
        owner: impl Into<String>,
        ssh_user: impl Into<String>,
        ssh_port: u16,
    ) -> Self {
        Self {
            api,
            runner,
            owner: owner.into(),
            ssh_user: ssh_user.into(),
            ssh_port,
        }
    }

    /// Authorises `public_key` on the VM called `vm_name`.
    ///
    /// # Errors
    ///
    /// Returns [`AddKeyError`] when the key is malformed, the VM is missing
    /// or not running, or the remote update fails.
    pub async fn add_key(
        &self,
        vm_name: &str,
        public_key: &str,
    ) -> Result<AddKeyOutcome, AddKeyError> {
        let line = public_key.trim();
        PublicKey::from_openssh(line).map_err(|err| AddKeyError::InvalidKey {
            message: err.to_string(),
        })?;
        let file = Utf8Path::new(AUTHORIZED_KEYS_FILE);
        let membership = key_membership(file, line)?;
        let append = append_line(file, line)?;

        let target = self.target(vm_name).await?;
        let count = self.runner.run(&target, &membership).await?;
        if membership_present(&count) {
            tracing::debug!(vm = vm_name, "key already authorised");
            return Ok(AddKeyOutcome::AlreadyPresent);
        }
        self.runner.run(&target, &append).await?;
        tracing::info!(vm = vm_name, "public key added");
        Ok(AddKeyOutcome::Added)
    }

    async fn target(&self, vm_name: &str) -> Result<RemoteTarget, AddKeyError> {
        let filter = InstanceFilter::by_name(&self.owner, vm_name);
        let mut vms = self
            .api
            .describe_instances(&filter)
            .await?
            .into_iter()
            .filter(|vm| !vm.state.is_gone())
            .collect::<Vec<Vm>>();
        vms.sort_by_key(|vm| vm.state != VmState::Running);
        let vm = vms
            .into_iter()
            .next()
            .ok_or_else(|| AddKeyError::VmNotFound {
                vm_name: vm_name.to_owned(),
                owner: self.owner.clone(),
            })?;
        if vm.state != VmState::Running {
            return Err(AddKeyError::NotRunning {
                vm_name: vm_name.to_owned(),
                state: vm.state,
            });
        }
        let host = vm.public_ip.ok_or_else(|| AddKeyError::NoAddress {
            vm_name: vm_name.to_owned(),
        })?;
        Ok(RemoteTarget {
            vm_name: vm_name.to_owned(),
            instance_id: vm.id,
            zone: vm.availability_zone,
            host,
            port: self.ssh_port,
            user: self.ssh_user.clone(),
            host_key: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeCloud, RemoteReply, ScriptedRemote};
    use crate::trust::TrustError;
    use rstest::rstest;

    const KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIPZyE2X3JyDzHolhUaF3Isz+4U8KLXQ/tGj15uTeBM67 bob@laptop";

    fn installer(
        cloud: &FakeCloud,
        remote: &ScriptedRemote,
    ) -> KeyInstaller<FakeCloud, ScriptedRemote> {
        KeyInstaller::new(cloud.clone(), remote.clone(), "alice", "ubuntu", 22)
    }

    #[tokio::test]
    async fn new_key_is_appended() {
        let cloud = FakeCloud::seeded("alice", "default");
        let remote = ScriptedRemote::new();
        remote.reply_to("grep -cxF", RemoteReply::stdout("0\n"));

        let outcome = installer(&cloud, &remote)
            .add_key("default", KEY)
            .await
            .expect("added");

        assert_eq!(outcome, AddKeyOutcome::Added);
        let calls = remote.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().any(|script| script.contains(">> \"$HOME\"/.ssh/authorized_keys")));
    }

    #[tokio::test]
    async fn present_key_is_left_alone() {
        let cloud = FakeCloud::seeded("alice", "default");
        let remote = ScriptedRemote::new();
        remote.reply_to("grep -cxF", RemoteReply::stdout("1\n"));

        let outcome = installer(&cloud, &remote)
            .add_key("default", KEY)
            .await
            .expect("checked");

        assert_eq!(outcome, AddKeyOutcome::AlreadyPresent);
        assert_eq!(remote.call_count(), 1);
    }

    #[rstest]
    #[case("not a key")]
    #[case("")]
    #[case("ssh-ed25519 AAAA; rm -rf ~")]
    #[tokio::test]
    async fn malformed_keys_never_reach_the_vm(#[case] key: &str) {
        let cloud = FakeCloud::seeded("alice", "default");
        let remote = ScriptedRemote::new();

        let err = installer(&cloud, &remote)
            .add_key("default", key)
            .await
            .expect_err("rejected");

        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(remote.call_count(), 0);
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn stopped_vm_is_a_state_conflict() {
        let cloud = FakeCloud::seeded("alice", "default");
        cloud.set_state("i-old", VmState::Stopped);
        let remote = ScriptedRemote::new();

        let err = installer(&cloud, &remote)
            .add_key("default", KEY)
            .await
            .expect_err("not running");

        assert_eq!(err.kind(), ErrorKind::StateConflict);
        assert_eq!(remote.call_count(), 0);
    }

    #[tokio::test]
    async fn unknown_vm_is_not_found() {
        let cloud = FakeCloud::seeded("alice", "default");
        let remote = ScriptedRemote::new();

        let err = installer(&cloud, &remote)
            .add_key("other", KEY)
            .await
            .expect_err("missing");

        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[rstest]
    #[case(
        RemoteReply::transport("connection refused"),
        ErrorKind::Transport
    )]
    #[case(RemoteReply::failed(1, "permission denied"), ErrorKind::StepFailure)]
    #[tokio::test]
    async fn remote_failures_are_classified(#[case] reply: RemoteReply, #[case] kind: ErrorKind) {
        let cloud = FakeCloud::seeded("alice", "default");
        let remote = ScriptedRemote::new();
        remote.reply_to("grep -cxF", reply);

        let err = installer(&cloud, &remote)
            .add_key("default", KEY)
            .await
            .expect_err("remote failure");

        assert_eq!(err.kind(), kind);
    }

    #[test]
    fn changed_host_key_is_a_trust_violation() {
        let err = AddKeyError::Remote(RemoteError::Trust(TrustError::HostKeyChanged {
            vm_name: String::from("default"),
            stored: String::from("SHA256:OLD"),
            current: String::from("SHA256:NEW"),
        }));
        assert_eq!(err.kind(), ErrorKind::TrustViolation);
    }
}
