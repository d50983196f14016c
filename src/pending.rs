//! Read-only scan for recreates that stopped part-way.
//!
//! A recreate tags the project volume with `berth:pending-attach` before it
//! stops the old instance and clears the tag once the volume is attached to
//! the replacement. A volume still carrying the tag belongs to a run that
//! failed or was interrupted in between.

use std::io::Write;

use thiserror::Error;

use crate::cloud::{CloudError, DescribeVolumes, VolumeFilter, COMPONENT_PROJECT_VOLUME};

/// Errors raised while scanning for pending volumes.
#[derive(Debug, Error)]
pub enum PendingError {
    /// Raised when the volume listing fails.
    #[error("failed to list project volumes: {0}")]
    Cloud(#[from] CloudError),
}

/// A project volume left behind by an incomplete recreate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingVolume {
    /// VM the volume belongs to.
    pub vm_name: String,
    /// Provider volume identifier.
    pub volume_id: String,
    /// Zone the volume lives in.
    pub availability_zone: String,
    /// Instance the volume is attached to, if any.
    pub attached_instance: Option<String>,
}

/// Lists the owner's volumes that still carry the pending-attach marker.
#[derive(Clone, Debug)]
pub struct PendingScanner<A> {
    api: A,
    owner: String,
}

impl<A: DescribeVolumes + Sync> PendingScanner<A> {
    /// Creates a scanner for `owner`'s volumes.
    #[must_use]
    pub fn new(api: A, owner: impl Into<String>) -> Self {
        Self {
            api,
            owner: owner.into(),
        }
    }

    /// Returns the pending volumes ordered by VM name.
    ///
    /// # Errors
    ///
    /// Returns [`PendingError::Cloud`] when the volumes cannot be listed.
    pub async fn scan(&self) -> Result<Vec<PendingVolume>, PendingError> {
        let filter = VolumeFilter {
            owner: Some(self.owner.clone()),
            component: Some(COMPONENT_PROJECT_VOLUME.to_owned()),
            pending_attach_only: true,
            ..VolumeFilter::default()
        };
        let mut pending = self
            .api
            .describe_volumes(&filter)
            .await?
            .into_iter()
            .filter(|volume| volume.pending_attach)
            .map(|volume| PendingVolume {
                vm_name: volume.vm_name,
                volume_id: volume.volume_id,
                availability_zone: volume.availability_zone,
                attached_instance: volume.attached_instance,
            })
            .collect::<Vec<_>>();
        pending.sort_by(|left, right| {
            left.vm_name
                .cmp(&right.vm_name)
                .then_with(|| left.volume_id.cmp(&right.volume_id))
        });
        tracing::debug!(owner = %self.owner, count = pending.len(), "pending scan finished");
        Ok(pending)
    }
}

/// Writes one line per pending volume, or nothing when there are none.
pub fn render_report(pending: &[PendingVolume], out: &mut impl Write) {
    if pending.is_empty() {
        return;
    }
    writeln!(out, "incomplete recreates:").ok();
    for volume in pending {
        let attachment = volume
            .attached_instance
            .as_deref()
            .map_or_else(|| String::from("detached"), |id| format!("attached to {id}"));
        writeln!(
            out,
            "  VM \"{}\": volume {} in {} ({attachment})",
            volume.vm_name, volume.volume_id, volume.availability_zone
        )
        .ok();
    }
    writeln!(
        out,
        "rerun `berth recreate --name <VM>` to finish, or attach the volume by hand"
    )
    .ok();
}
