//! Narrow capability interfaces over the cloud control plane.
//!
//! Each verb the recreate flow needs is its own trait so that callers depend
//! only on what they use and test doubles stay small. [`ResourceApi`] bundles
//! the full set for the orchestrator. [`AwsCli`] implements every verb by
//! driving the `aws` command line client.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

mod aws;
mod types;

pub use aws::{AwsCli, DEFAULT_AWS_BIN};
pub use types::{
    AddressFilter, BootstrapState, COMPONENT_PROJECT_VOLUME, ElasticAddress, ImageQuery,
    InstanceFilter, KeyPushRequest, LaunchRequest, MachineImage, ProjectVolume, SecurityGroup,
    Subnet, TAG_BOOTSTRAP, TAG_COMPONENT, TAG_HEALTH, TAG_NAME, TAG_OWNER, TAG_OWNER_ARN,
    TAG_PENDING_ATTACH, Tag, Vm, VmState, VolumeFilter, VolumeState,
};

/// Errors raised by cloud collaborators.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CloudError {
    /// Raised when the credential chain cannot authenticate.
    #[error(
        "cloud credentials are missing or expired; refresh them (for example `aws sso login`) and retry"
    )]
    Credentials,
    /// Raised when the addressed resource does not exist.
    #[error("{resource} not found")]
    NotFound {
        /// Description of the missing resource.
        resource: String,
    },
    /// Raised when the provider rejects a call.
    #[error("{operation} failed: {message}")]
    Api {
        /// Provider operation name.
        operation: String,
        /// Provider error message.
        message: String,
    },
    /// Raised when a provider response cannot be parsed.
    #[error("failed to parse {operation} response: {message}")]
    Parse {
        /// Provider operation name.
        operation: String,
        /// Parser error message.
        message: String,
    },
}

impl CloudError {
    /// Returns `true` for [`CloudError::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Future returned by cloud operations.
pub type CloudFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CloudError>> + Send + 'a>>;

/// Lists instances.
pub trait DescribeInstances {
    /// Returns every instance matching `filter`, terminated ones included.
    fn describe_instances<'a>(&'a self, filter: &'a InstanceFilter) -> CloudFuture<'a, Vec<Vm>>;
}

/// Stops an instance.
pub trait StopInstance {
    /// Requests a stop; does not wait for the stopped state.
    fn stop_instance<'a>(&'a self, instance_id: &'a str) -> CloudFuture<'a, ()>;
}

/// Terminates an instance.
pub trait TerminateInstance {
    /// Requests termination; does not wait for the terminated state.
    fn terminate_instance<'a>(&'a self, instance_id: &'a str) -> CloudFuture<'a, ()>;
}

/// Launches an instance.
pub trait RunInstance {
    /// Launches one instance and returns its initial description.
    fn run_instance<'a>(&'a self, request: &'a LaunchRequest) -> CloudFuture<'a, Vm>;
}

/// Attaches a volume.
pub trait AttachVolume {
    /// Attaches `volume_id` to `instance_id` at `device`.
    fn attach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
        device: &'a str,
    ) -> CloudFuture<'a, ()>;
}

/// Detaches a volume.
pub trait DetachVolume {
    /// Detaches `volume_id` from `instance_id`, forcing when requested.
    fn detach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
        force: bool,
    ) -> CloudFuture<'a, ()>;
}

/// Adds or overwrites tags.
pub trait TagResource {
    /// Applies `tags` to `resource_id`.
    fn tag_resource<'a>(&'a self, resource_id: &'a str, tags: &'a [Tag]) -> CloudFuture<'a, ()>;
}

/// Removes tags.
pub trait UntagResource {
    /// Deletes the tags named by `keys` from `resource_id`.
    fn untag_resource<'a>(
        &'a self,
        resource_id: &'a str,
        keys: &'a [&'a str],
    ) -> CloudFuture<'a, ()>;
}

/// Lists volumes.
pub trait DescribeVolumes {
    /// Returns every volume matching `filter`.
    fn describe_volumes<'a>(
        &'a self,
        filter: &'a VolumeFilter,
    ) -> CloudFuture<'a, Vec<ProjectVolume>>;
}

/// Lists addresses.
pub trait DescribeAddresses {
    /// Returns every address matching `filter`.
    fn describe_addresses<'a>(
        &'a self,
        filter: &'a AddressFilter,
    ) -> CloudFuture<'a, Vec<ElasticAddress>>;
}

/// Binds an address.
pub trait AssociateAddress {
    /// Binds `allocation_id` to `instance_id`, returning the association id.
    fn associate_address<'a>(
        &'a self,
        allocation_id: &'a str,
        instance_id: &'a str,
    ) -> CloudFuture<'a, String>;
}

/// Unbinds an address.
pub trait DisassociateAddress {
    /// Removes the association `association_id`.
    fn disassociate_address<'a>(&'a self, association_id: &'a str) -> CloudFuture<'a, ()>;
}

/// Lists subnets.
pub trait DescribeSubnets {
    /// Returns the subnets in `availability_zone`.
    fn describe_subnets<'a>(&'a self, availability_zone: &'a str)
    -> CloudFuture<'a, Vec<Subnet>>;
}

/// Lists security groups.
pub trait DescribeSecurityGroups {
    /// Returns the security groups whose names appear in `names`.
    fn describe_security_groups<'a>(
        &'a self,
        names: &'a [String],
    ) -> CloudFuture<'a, Vec<SecurityGroup>>;
}

/// Lists machine images.
pub trait DescribeImages {
    /// Returns the images matching `query`.
    fn describe_images<'a>(&'a self, query: &'a ImageQuery) -> CloudFuture<'a, Vec<MachineImage>>;
}

/// Pushes a short-lived public key to an instance.
pub trait KeyPush {
    /// Delivers the key; the provider honours it for a short window only.
    fn push_key<'a>(&'a self, request: &'a KeyPushRequest) -> CloudFuture<'a, ()>;
}

/// The full set of resource verbs used by the recreate flow.
pub trait ResourceApi:
    DescribeInstances
    + StopInstance
    + TerminateInstance
    + RunInstance
    + AttachVolume
    + DetachVolume
    + TagResource
    + UntagResource
    + DescribeVolumes
    + DescribeAddresses
    + AssociateAddress
    + DisassociateAddress
    + DescribeSubnets
    + DescribeSecurityGroups
    + DescribeImages
    + Send
    + Sync
{
}

impl<T> ResourceApi for T where
    T: DescribeInstances
        + StopInstance
        + TerminateInstance
        + RunInstance
        + AttachVolume
        + DetachVolume
        + TagResource
        + UntagResource
        + DescribeVolumes
        + DescribeAddresses
        + AssociateAddress
        + DisassociateAddress
        + DescribeSubnets
        + DescribeSecurityGroups
        + DescribeImages
        + Send
        + Sync
{
}

impl<T: DescribeInstances + ?Sized> DescribeInstances for &T {
    fn describe_instances<'a>(&'a self, filter: &'a InstanceFilter) -> CloudFuture<'a, Vec<Vm>> {
        (**self).describe_instances(filter)
    }
}

impl<T: DescribeVolumes + ?Sized> DescribeVolumes for &T {
    fn describe_volumes<'a>(
        &'a self,
        filter: &'a VolumeFilter,
    ) -> CloudFuture<'a, Vec<ProjectVolume>> {
        (**self).describe_volumes(filter)
    }
}

impl<T: KeyPush + ?Sized> KeyPush for &T {
    fn push_key<'a>(&'a self, request: &'a KeyPushRequest) -> CloudFuture<'a, ()> {
        (**self).push_key(request)
    }
}
