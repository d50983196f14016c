//! Resource types exchanged with the cloud control plane.

use std::fmt;
use std::str::FromStr;

/// Tag carrying the owner of a resource.
pub const TAG_OWNER: &str = "berth:owner";
/// Tag carrying the owner's principal ARN.
pub const TAG_OWNER_ARN: &str = "berth:owner-arn";
/// Tag carrying the VM name shared by an instance and its resources.
pub const TAG_NAME: &str = "berth:name";
/// Tag distinguishing resource roles (for example the project volume).
pub const TAG_COMPONENT: &str = "berth:component";
/// Component value identifying the persistent project volume.
pub const COMPONENT_PROJECT_VOLUME: &str = "project-volume";
/// Crash-recovery marker set while a volume is between instances.
pub const TAG_PENDING_ATTACH: &str = "berth:pending-attach";
/// Tag tracking bootstrap progress on an instance.
pub const TAG_BOOTSTRAP: &str = "berth:bootstrap";
/// Tag carrying the last reported health of an instance.
pub const TAG_HEALTH: &str = "berth:health";

/// A key/value resource tag.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

impl Tag {
    /// Builds a tag from any string-like key and value.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Lifecycle state reported for an instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VmState {
    /// Launch accepted, not yet running.
    Pending,
    /// Running and reachable.
    Running,
    /// Shutting down.
    Stopping,
    /// Stopped with storage retained.
    Stopped,
    /// Terminating; the instance will disappear.
    ShuttingDown,
    /// Terminated; only the record remains.
    Terminated,
}

impl VmState {
    /// Returns the provider's name for the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
        }
    }

    /// Returns `true` once the instance can never run again.
    #[must_use]
    pub const fn is_gone(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "shutting-down" => Ok(Self::ShuttingDown),
            "terminated" => Ok(Self::Terminated),
            other => Err(format!("unknown instance state '{other}'")),
        }
    }
}

/// Bootstrap progress as recorded in the [`TAG_BOOTSTRAP`] tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BootstrapState {
    /// Bootstrap has not finished.
    Pending,
    /// Bootstrap completed successfully.
    Complete,
    /// Bootstrap reported a failure.
    Failed,
}

impl BootstrapState {
    /// Returns the tag value for the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// Parses a tag value, returning `None` for unknown values.
    #[must_use]
    pub fn from_tag(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A development VM instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Vm {
    /// Provider instance identifier.
    pub id: String,
    /// VM name from [`TAG_NAME`].
    pub name: String,
    /// Owner from [`TAG_OWNER`].
    pub owner_tag: String,
    /// Owner principal ARN from [`TAG_OWNER_ARN`], when recorded.
    pub owner_arn: Option<String>,
    /// Lifecycle state.
    pub state: VmState,
    /// Availability zone hosting the instance.
    pub availability_zone: String,
    /// Public IPv4 address, when assigned.
    pub public_ip: Option<String>,
    /// Instance type (for example `t3.large`).
    pub instance_type: String,
    /// Bootstrap progress, when tagged.
    pub bootstrap: Option<BootstrapState>,
    /// Last recorded health, when tagged.
    pub health: Option<String>,
}

/// Attachment state of a volume.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VolumeState {
    /// Being created.
    Creating,
    /// Detached and ready to attach.
    Available,
    /// Attached to an instance.
    InUse,
    /// Being deleted.
    Deleting,
    /// Deleted.
    Deleted,
    /// Provider reported an error.
    Error,
}

impl VolumeState {
    /// Returns the provider's name for the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Available => "available",
            Self::InUse => "in-use",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "creating" => Ok(Self::Creating),
            "available" => Ok(Self::Available),
            "in-use" => Ok(Self::InUse),
            "deleting" => Ok(Self::Deleting),
            "deleted" => Ok(Self::Deleted),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown volume state '{other}'")),
        }
    }
}

/// The persistent project volume that survives instance replacement.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProjectVolume {
    /// Provider volume identifier.
    pub volume_id: String,
    /// VM name the volume belongs to.
    pub vm_name: String,
    /// Availability zone; replacement instances must launch here.
    pub availability_zone: String,
    /// Size in GiB.
    pub size_gb: u32,
    /// Current attachment state.
    pub state: VolumeState,
    /// Instance the volume is attached to, if any.
    pub attached_instance: Option<String>,
    /// Whether the [`TAG_PENDING_ATTACH`] marker is set.
    pub pending_attach: bool,
}

/// A long-lived public address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ElasticAddress {
    /// Allocation identifier.
    pub allocation_id: String,
    /// Public IPv4 address.
    pub public_ip: String,
    /// Association identifier while bound to a network interface.
    pub association_id: Option<String>,
    /// Instance currently bound, when reported.
    pub instance_id: Option<String>,
}

impl ElasticAddress {
    /// Returns the association identifier when it is non-empty.
    #[must_use]
    pub fn live_association(&self) -> Option<&str> {
        self.association_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// A subnet candidate for launching instances.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Subnet {
    /// Subnet identifier.
    pub subnet_id: String,
    /// Availability zone of the subnet.
    pub availability_zone: String,
    /// Whether this is the zone's default subnet.
    pub default_for_zone: bool,
}

/// A named security group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecurityGroup {
    /// Group identifier.
    pub group_id: String,
    /// Group name.
    pub name: String,
}

/// A bootable machine image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachineImage {
    /// Image identifier.
    pub image_id: String,
    /// Image name.
    pub name: String,
    /// ISO-8601 creation timestamp; sorts lexicographically.
    pub creation_date: String,
}

/// Filter selecting instances.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceFilter {
    /// Owner tag to match.
    pub owner: Option<String>,
    /// VM name tag to match.
    pub name: Option<String>,
    /// Exact instance identifier.
    pub instance_id: Option<String>,
}

impl InstanceFilter {
    /// Matches every instance of the owner's VM called `name`.
    #[must_use]
    pub fn by_name(owner: &str, name: &str) -> Self {
        Self {
            owner: Some(owner.to_owned()),
            name: Some(name.to_owned()),
            instance_id: None,
        }
    }

    /// Matches a single instance.
    #[must_use]
    pub fn by_id(instance_id: &str) -> Self {
        Self {
            instance_id: Some(instance_id.to_owned()),
            ..Self::default()
        }
    }
}

/// Filter selecting volumes.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VolumeFilter {
    /// Owner tag to match.
    pub owner: Option<String>,
    /// VM name tag to match.
    pub name: Option<String>,
    /// Component tag to match.
    pub component: Option<String>,
    /// Exact volume identifier.
    pub volume_id: Option<String>,
    /// Restrict to volumes carrying the pending-attach marker.
    pub pending_attach_only: bool,
}

impl VolumeFilter {
    /// Matches the project volume of the owner's VM called `name`.
    #[must_use]
    pub fn project_volume(owner: &str, name: &str) -> Self {
        Self {
            owner: Some(owner.to_owned()),
            name: Some(name.to_owned()),
            component: Some(COMPONENT_PROJECT_VOLUME.to_owned()),
            ..Self::default()
        }
    }

    /// Matches a single volume.
    #[must_use]
    pub fn by_id(volume_id: &str) -> Self {
        Self {
            volume_id: Some(volume_id.to_owned()),
            ..Self::default()
        }
    }
}

/// Filter selecting addresses by owner and VM name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddressFilter {
    /// Owner tag to match.
    pub owner: String,
    /// VM name tag to match.
    pub name: String,
}

/// Query resolving the current machine image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageQuery {
    /// Image owner account (for example an AWS account id or alias).
    pub owner: String,
    /// Name pattern; `*` wildcards are allowed.
    pub name_pattern: String,
    /// CPU architecture (for example `x86_64` or `arm64`).
    pub architecture: String,
}

/// Parameters for launching an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchRequest {
    /// Machine image to boot.
    pub image_id: String,
    /// Instance type.
    pub instance_type: String,
    /// Target availability zone.
    pub availability_zone: String,
    /// Subnet to place the instance in.
    pub subnet_id: String,
    /// Security groups to apply.
    pub security_group_ids: Vec<String>,
    /// Boot configuration payload.
    pub user_data: Vec<u8>,
    /// Tags applied at launch.
    pub tags: Vec<Tag>,
    /// Idempotency token for the launch call.
    pub client_token: String,
}

/// Parameters for pushing an ephemeral public key to an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyPushRequest {
    /// Target instance.
    pub instance_id: String,
    /// Availability zone of the instance.
    pub availability_zone: String,
    /// OS user the key is valid for.
    pub os_user: String,
    /// Public key line in OpenSSH format.
    pub public_key: String,
}
