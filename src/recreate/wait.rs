//! Polling waiters for instance and volume state transitions.

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::sleep;

use crate::cloud::{
    CloudError, DescribeInstances, DescribeVolumes, InstanceFilter, ProjectVolume, Vm, VmState,
    VolumeFilter, VolumeState,
};

/// Errors raised while waiting for a resource to change state.
#[derive(Debug, Error)]
pub enum WaitError {
    /// Raised when the deadline passes first.
    #[error("timed out after {seconds}s waiting for {resource} {id} to become {desired}")]
    Timeout {
        /// Resource kind.
        resource: &'static str,
        /// Resource identifier.
        id: String,
        /// State being waited for.
        desired: &'static str,
        /// Configured bound.
        seconds: u64,
    },
    /// Raised when the resource reaches a state it cannot leave.
    #[error("{resource} {id} entered unexpected state '{state}'")]
    UnexpectedState {
        /// Resource kind.
        resource: &'static str,
        /// Resource identifier.
        id: String,
        /// Observed state.
        state: String,
    },
    /// Raised when polling fails.
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// Polling bounds shared by the waiters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WaitBounds {
    /// Maximum time to wait.
    pub timeout: Duration,
    /// Delay between polls.
    pub interval: Duration,
}

/// Polls until `instance_id` is running.
///
/// A not-found answer right after launch is treated as eventual consistency
/// and polled again.
pub(crate) async fn wait_for_instance_running<A>(
    api: &A,
    instance_id: &str,
    bounds: WaitBounds,
) -> Result<Vm, WaitError>
where
    A: DescribeInstances + Sync,
{
    let filter = InstanceFilter::by_id(instance_id);
    let deadline = Instant::now() + bounds.timeout;

    loop {
        let found = match api.describe_instances(&filter).await {
            Ok(vms) => vms.into_iter().find(|vm| vm.id == instance_id),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err.into()),
        };
        if let Some(vm) = found {
            match vm.state {
                VmState::Running => return Ok(vm),
                VmState::Pending => {}
                other => {
                    return Err(WaitError::UnexpectedState {
                        resource: "instance",
                        id: instance_id.to_owned(),
                        state: other.as_str().to_owned(),
                    });
                }
            }
        }

        if Instant::now() >= deadline {
            return Err(WaitError::Timeout {
                resource: "instance",
                id: instance_id.to_owned(),
                desired: VmState::Running.as_str(),
                seconds: bounds.timeout.as_secs(),
            });
        }
        sleep(bounds.interval).await;
    }
}

/// Polls until `volume_id` is detached and available.
pub(crate) async fn wait_for_volume_available<A>(
    api: &A,
    volume_id: &str,
    bounds: WaitBounds,
) -> Result<ProjectVolume, WaitError>
where
    A: DescribeVolumes + Sync,
{
    let filter = VolumeFilter::by_id(volume_id);
    let deadline = Instant::now() + bounds.timeout;

    loop {
        let volumes = api.describe_volumes(&filter).await?;
        let Some(volume) = volumes.into_iter().find(|volume| volume.volume_id == volume_id)
        else {
            return Err(WaitError::UnexpectedState {
                resource: "volume",
                id: volume_id.to_owned(),
                state: String::from("missing"),
            });
        };
        match volume.state {
            VolumeState::Available => return Ok(volume),
            VolumeState::InUse | VolumeState::Creating => {}
            other @ (VolumeState::Deleting | VolumeState::Deleted | VolumeState::Error) => {
                return Err(WaitError::UnexpectedState {
                    resource: "volume",
                    id: volume_id.to_owned(),
                    state: other.as_str().to_owned(),
                });
            }
        }

        if Instant::now() >= deadline {
            return Err(WaitError::Timeout {
                resource: "volume",
                id: volume_id.to_owned(),
                desired: VolumeState::Available.as_str(),
                seconds: bounds.timeout.as_secs(),
            });
        }
        sleep(bounds.interval).await;
    }
}
