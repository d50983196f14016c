//! Error types for the recreate workflow.

use std::fmt;

use thiserror::Error;

use crate::bootstrap::BootstrapError;
use crate::cloud::{CloudError, VmState};
use crate::trust::HostKeyStoreError;

use super::wait::WaitError;

/// Coarse classification of every recreate failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// A VM, volume or address is missing.
    NotFound,
    /// A resource is in the wrong state for the requested step.
    StateConflict,
    /// The operator declined or mistyped the confirmation.
    Unconfirmed,
    /// Active sessions were found and `--force` was not given.
    SessionsActive,
    /// Network or SSH failure.
    Transport,
    /// The host key changed.
    TrustViolation,
    /// A mutating step failed.
    StepFailure,
    /// Local configuration or input was rejected.
    Configuration,
    /// The operation was interrupted.
    Cancelled,
}

/// Named steps of the recreate workflow, used to label failures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecreateStep {
    /// Resolve the VM by owner and name.
    Discover,
    /// Require a running VM.
    CheckState,
    /// Look for active sessions.
    DetectSessions,
    /// Ask the operator to type the VM name.
    Confirm,
    /// Find the project volume.
    QueryVolume,
    /// Validate the launch configuration before anything is destroyed.
    ValidateConfiguration,
    /// Tag the volume as pending attach.
    MarkPendingAttach,
    /// Stop the old instance.
    StopInstance,
    /// Force-detach the volume from the old instance.
    DetachVolume,
    /// Terminate the old instance.
    TerminateInstance,
    /// Pick the newest machine image.
    ResolveImage,
    /// Look up security groups.
    ResolveSecurityGroups,
    /// Find the default subnet in the volume's zone.
    ResolveSubnet,
    /// Launch the replacement instance.
    LaunchInstance,
    /// Wait for the replacement to run.
    WaitInstanceRunning,
    /// Wait for the volume to detach fully.
    WaitVolumeAvailable,
    /// Attach the volume to the replacement.
    AttachVolume,
    /// Remove the pending-attach marker.
    ClearPendingAttach,
    /// Move the address to the replacement.
    ReassociateAddress,
    /// Drop the pinned host key of the old instance.
    ForgetHostKey,
    /// Wait for bootstrap to finish.
    PollBootstrap,
}

impl RecreateStep {
    /// Returns a human-readable step label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Discover => "discover VM",
            Self::CheckState => "check VM state",
            Self::DetectSessions => "detect sessions",
            Self::Confirm => "confirm",
            Self::QueryVolume => "query project volume",
            Self::ValidateConfiguration => "validate launch configuration",
            Self::MarkPendingAttach => "mark volume pending-attach",
            Self::StopInstance => "stop instance",
            Self::DetachVolume => "detach volume",
            Self::TerminateInstance => "terminate instance",
            Self::ResolveImage => "resolve machine image",
            Self::ResolveSecurityGroups => "resolve security groups",
            Self::ResolveSubnet => "resolve subnet",
            Self::LaunchInstance => "launch instance",
            Self::WaitInstanceRunning => "wait for instance running",
            Self::WaitVolumeAvailable => "wait for volume available",
            Self::AttachVolume => "attach volume",
            Self::ClearPendingAttach => "clear pending-attach tag",
            Self::ReassociateAddress => "reassociate address",
            Self::ForgetHostKey => "forget host key",
            Self::PollBootstrap => "poll bootstrap",
        }
    }
}

impl fmt::Display for RecreateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Underlying cause of a failed step.
#[derive(Debug, Error)]
pub enum StepSource {
    /// Resource API failure.
    #[error(transparent)]
    Cloud(#[from] CloudError),
    /// Waiter failure.
    #[error(transparent)]
    Wait(#[from] WaitError),
    /// Bootstrap failure.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    /// Host key store failure.
    #[error(transparent)]
    HostKeys(#[from] HostKeyStoreError),
}

/// Errors surfaced by [`super::RecreateOrchestrator`].
#[derive(Debug, Error)]
pub enum RecreateError {
    /// Raised when no live VM matches the owner and name.
    #[error(
        "VM \"{vm_name}\" not found for owner \"{owner}\"; provision it first with `berth create`"
    )]
    VmNotFound {
        /// Requested VM name.
        vm_name: String,
        /// Owner tag searched for.
        owner: String,
    },
    /// Raised when the VM has no project volume.
    #[error("no project volume found for VM \"{vm_name}\"")]
    VolumeNotFound {
        /// VM name.
        vm_name: String,
    },
    /// Raised when the VM has no elastic address.
    #[error("no elastic address found for VM \"{vm_name}\"; the volume is attached to {instance_id}")]
    AddressNotFound {
        /// VM name.
        vm_name: String,
        /// Replacement instance holding the volume.
        instance_id: String,
    },
    /// Raised when the VM is not running.
    #[error(
        "VM \"{vm_name}\" is {state}; recreate needs a running VM so active sessions can be checked"
    )]
    StateConflict {
        /// VM name.
        vm_name: String,
        /// Observed state.
        state: VmState,
    },
    /// Raised when the project volume is attached somewhere unexpected.
    #[error("project volume {volume_id} is attached to {attached_to}, not to {instance_id}")]
    VolumeConflict {
        /// Volume identifier.
        volume_id: String,
        /// Instance the volume is attached to.
        attached_to: String,
        /// Instance being recreated.
        instance_id: String,
    },
    /// Raised when the typed confirmation does not match.
    #[error("confirmation \"{input}\" does not match VM name \"{vm_name}\"")]
    Unconfirmed {
        /// Operator input with the line ending removed.
        input: String,
        /// Expected VM name.
        vm_name: String,
    },
    /// Raised when the confirmation cannot be read.
    #[error("failed to read confirmation: {message}")]
    ConfirmationUnreadable {
        /// Underlying I/O message.
        message: String,
    },
    /// Raised when sessions are active and `--force` is absent.
    #[error("VM \"{vm_name}\" has active sessions:\n{summary}\nrerun with --force to recreate anyway")]
    SessionsActive {
        /// VM name.
        vm_name: String,
        /// Detector summary.
        summary: String,
    },
    /// Raised when local configuration is unusable.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },
    /// Raised when a step fails.
    ///
    /// The underlying message leads; the step trails as context.
    #[error("{source} (during step: {step})")]
    Step {
        /// Step that failed.
        step: RecreateStep,
        /// Underlying failure.
        #[source]
        source: StepSource,
    },
    /// Raised when the operation is cancelled.
    #[error("recreate cancelled before completing step: {step}")]
    Cancelled {
        /// Step that was pending or running.
        step: RecreateStep,
    },
}

impl RecreateError {
    /// Builds a [`RecreateError::Step`].
    pub fn step(step: RecreateStep, source: impl Into<StepSource>) -> Self {
        Self::Step {
            step,
            source: source.into(),
        }
    }

    /// Returns the step a failure is attributed to, when step-specific.
    #[must_use]
    pub const fn failed_step(&self) -> Option<RecreateStep> {
        match self {
            Self::Step { step, .. } | Self::Cancelled { step } => Some(*step),
            _ => None,
        }
    }

    /// Classifies the failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::VmNotFound { .. } | Self::VolumeNotFound { .. } | Self::AddressNotFound { .. } => {
                ErrorKind::NotFound
            }
            Self::StateConflict { .. } | Self::VolumeConflict { .. } => ErrorKind::StateConflict,
            Self::Unconfirmed { .. } | Self::ConfirmationUnreadable { .. } => {
                ErrorKind::Unconfirmed
            }
            Self::SessionsActive { .. } => ErrorKind::SessionsActive,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Step { .. } => ErrorKind::StepFailure,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }
}
