//! Resource verbs implemented by shelling out to the `aws` CLI.
//!
//! Every call runs `aws <service> <operation> --region <region> --output json`
//! through a [`CommandRunner`] and parses the JSON response. Filters and tag
//! lists are passed in their JSON form so values never need shell quoting.

use std::ffi::OsString;

use serde::de::DeserializeOwned;

use crate::cloud::types::{
    AddressFilter, ElasticAddress, ImageQuery, InstanceFilter, KeyPushRequest, LaunchRequest,
    MachineImage, ProjectVolume, SecurityGroup, Subnet, TAG_COMPONENT, TAG_NAME, TAG_OWNER,
    TAG_PENDING_ATTACH, Tag, Vm, VolumeFilter,
};
use crate::cloud::{
    AssociateAddress, AttachVolume, CloudError, CloudFuture, DescribeAddresses,
    DescribeImages, DescribeInstances, DescribeSecurityGroups, DescribeSubnets, DescribeVolumes,
    DetachVolume, DisassociateAddress, KeyPush, RunInstance, StopInstance, TagResource,
    TerminateInstance, UntagResource,
};
use crate::exec::{CommandOutput, CommandRunner, ProcessCommandRunner};

mod wire;

use wire::{
    AssociateAddressOutput, DescribeAddressesOutput, DescribeImagesOutput,
    DescribeInstancesOutput, DescribeSecurityGroupsOutput, DescribeSubnetsOutput,
    DescribeVolumesOutput, RunInstancesOutput, SendSshPublicKeyOutput, WireFilter, WireTag,
    WireTagSpecification,
};

/// Default AWS CLI binary name.
pub const DEFAULT_AWS_BIN: &str = "aws";

/// Fragments of CLI stderr that indicate a credential-chain failure.
const CREDENTIAL_MARKERS: &[&str] = &[
    "Unable to locate credentials",
    "ExpiredToken",
    "InvalidClientTokenId",
    "AuthFailure",
    "UnrecognizedClientException",
    "Token has expired",
    "SSO session",
];

/// Resource API client backed by the `aws` command line interface.
#[derive(Clone, Debug)]
pub struct AwsCli<R> {
    runner: R,
    aws_bin: String,
    region: String,
}

impl AwsCli<ProcessCommandRunner> {
    /// Creates a client wired to the real process runner.
    #[must_use]
    pub fn with_process_runner(aws_bin: impl Into<String>, region: impl Into<String>) -> Self {
        Self::new(ProcessCommandRunner, aws_bin, region)
    }
}

impl<R: CommandRunner> AwsCli<R> {
    /// Creates a client using the provided runner.
    #[must_use]
    pub fn new(runner: R, aws_bin: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            runner,
            aws_bin: aws_bin.into(),
            region: region.into(),
        }
    }

    fn invoke(
        &self,
        service: &str,
        operation: &str,
        args: Vec<OsString>,
    ) -> Result<CommandOutput, CloudError> {
        let mut full = vec![
            OsString::from(service),
            OsString::from(operation),
            OsString::from("--region"),
            OsString::from(&self.region),
            OsString::from("--output"),
            OsString::from("json"),
        ];
        full.extend(args);

        tracing::debug!(service, operation, "calling aws cli");
        let output = self
            .runner
            .run(&self.aws_bin, &full)
            .map_err(|err| CloudError::Api {
                operation: operation.to_owned(),
                message: err.to_string(),
            })?;

        if output.is_success() {
            return Ok(output);
        }
        Err(classify_failure(operation, &output))
    }

    fn call_json<T: DeserializeOwned>(
        &self,
        service: &str,
        operation: &str,
        args: Vec<OsString>,
    ) -> Result<T, CloudError> {
        let output = self.invoke(service, operation, args)?;
        serde_json::from_str(&output.stdout).map_err(|err| CloudError::Parse {
            operation: operation.to_owned(),
            message: err.to_string(),
        })
    }

    fn call_ec2_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        args: Vec<OsString>,
    ) -> Result<T, CloudError> {
        self.call_json("ec2", operation, args)
    }

    fn call_ec2(&self, operation: &str, args: Vec<OsString>) -> Result<(), CloudError> {
        self.invoke("ec2", operation, args).map(|_| ())
    }
}

/// Maps a failed CLI invocation onto [`CloudError`], hiding credential
/// internals behind a single instruction.
fn classify_failure(operation: &str, output: &CommandOutput) -> CloudError {
    let stderr = output.stderr.trim();
    if CREDENTIAL_MARKERS.iter().any(|marker| stderr.contains(marker)) {
        return CloudError::Credentials;
    }

    let message = stderr
        .lines()
        .find(|line| !line.trim().is_empty())
        .map_or_else(
            || format!("exited with status {}", output.status_text()),
            |line| line.trim().to_owned(),
        );

    if error_code(stderr).is_some_and(|code| code.ends_with(".NotFound")) {
        return CloudError::NotFound {
            resource: message
                .split_once("operation: ")
                .map_or_else(|| message.clone(), |(_, detail)| detail.to_owned()),
        };
    }

    CloudError::Api {
        operation: operation.to_owned(),
        message,
    }
}

/// Extracts `Code` from `An error occurred (Code) when calling ...`.
fn error_code(stderr: &str) -> Option<&str> {
    let (_, rest) = stderr.split_once("An error occurred (")?;
    let (code, _) = rest.split_once(')')?;
    Some(code)
}

fn json_arg<T: serde::Serialize>(operation: &str, value: &T) -> Result<OsString, CloudError> {
    serde_json::to_string(value)
        .map(OsString::from)
        .map_err(|err| CloudError::Parse {
            operation: operation.to_owned(),
            message: err.to_string(),
        })
}

fn filters_arg(operation: &str, filters: &[WireFilter]) -> Result<Vec<OsString>, CloudError> {
    if filters.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![
        OsString::from("--filters"),
        json_arg(operation, &filters)?,
    ])
}

fn tag_filter(key: &str, value: &str) -> WireFilter {
    WireFilter::new(format!("tag:{key}"), value)
}

fn instance_filters(filter: &InstanceFilter) -> Vec<WireFilter> {
    let mut filters = Vec::new();
    if let Some(owner) = &filter.owner {
        filters.push(tag_filter(TAG_OWNER, owner));
    }
    if let Some(name) = &filter.name {
        filters.push(tag_filter(TAG_NAME, name));
    }
    filters
}

fn volume_filters(filter: &VolumeFilter) -> Vec<WireFilter> {
    let mut filters = Vec::new();
    if let Some(owner) = &filter.owner {
        filters.push(tag_filter(TAG_OWNER, owner));
    }
    if let Some(name) = &filter.name {
        filters.push(tag_filter(TAG_NAME, name));
    }
    if let Some(component) = &filter.component {
        filters.push(tag_filter(TAG_COMPONENT, component));
    }
    if filter.pending_attach_only {
        filters.push(tag_filter(TAG_PENDING_ATTACH, "true"));
    }
    filters
}

fn wire_tags(tags: &[Tag]) -> Vec<WireTag> {
    tags.iter()
        .map(|tag| WireTag {
            key: tag.key.clone(),
            value: Some(tag.value.clone()),
        })
        .collect()
}

impl<R: CommandRunner + Send + Sync> DescribeInstances for AwsCli<R> {
    fn describe_instances<'a>(&'a self, filter: &'a InstanceFilter) -> CloudFuture<'a, Vec<Vm>> {
        Box::pin(async move {
            let operation = "describe-instances";
            let mut args = filters_arg(operation, &instance_filters(filter))?;
            if let Some(id) = &filter.instance_id {
                args.push(OsString::from("--instance-ids"));
                args.push(OsString::from(id));
            }
            let output: DescribeInstancesOutput = self.call_ec2_json(operation, args)?;
            output
                .reservations
                .into_iter()
                .flat_map(|reservation| reservation.instances)
                .map(|instance| {
                    instance.into_vm().map_err(|message| CloudError::Parse {
                        operation: operation.to_owned(),
                        message,
                    })
                })
                .collect()
        })
    }
}

impl<R: CommandRunner + Send + Sync> StopInstance for AwsCli<R> {
    fn stop_instance<'a>(&'a self, instance_id: &'a str) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            self.call_ec2(
                "stop-instances",
                vec![OsString::from("--instance-ids"), OsString::from(instance_id)],
            )
        })
    }
}

impl<R: CommandRunner + Send + Sync> TerminateInstance for AwsCli<R> {
    fn terminate_instance<'a>(&'a self, instance_id: &'a str) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            self.call_ec2(
                "terminate-instances",
                vec![OsString::from("--instance-ids"), OsString::from(instance_id)],
            )
        })
    }
}

impl<R: CommandRunner + Send + Sync> RunInstance for AwsCli<R> {
    fn run_instance<'a>(&'a self, request: &'a LaunchRequest) -> CloudFuture<'a, Vm> {
        Box::pin(async move {
            let operation = "run-instances";
            let specs = [
                WireTagSpecification {
                    resource_type: String::from("instance"),
                    tags: wire_tags(&request.tags),
                },
            ];
            let mut args = vec![
                OsString::from("--image-id"),
                OsString::from(&request.image_id),
                OsString::from("--instance-type"),
                OsString::from(&request.instance_type),
                OsString::from("--subnet-id"),
                OsString::from(&request.subnet_id),
                OsString::from("--count"),
                OsString::from("1"),
                OsString::from("--client-token"),
                OsString::from(&request.client_token),
                OsString::from("--user-data"),
                OsString::from(String::from_utf8_lossy(&request.user_data).into_owned()),
                OsString::from("--tag-specifications"),
                json_arg(operation, &specs)?,
                OsString::from("--security-group-ids"),
            ];
            args.extend(request.security_group_ids.iter().map(OsString::from));

            let output: RunInstancesOutput = self.call_ec2_json(operation, args)?;
            let instance = output
                .instances
                .into_iter()
                .next()
                .ok_or_else(|| CloudError::Parse {
                    operation: operation.to_owned(),
                    message: String::from("response contained no instances"),
                })?;
            instance.into_vm().map_err(|message| CloudError::Parse {
                operation: operation.to_owned(),
                message,
            })
        })
    }
}

impl<R: CommandRunner + Send + Sync> AttachVolume for AwsCli<R> {
    fn attach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
        device: &'a str,
    ) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            self.call_ec2(
                "attach-volume",
                vec![
                    OsString::from("--volume-id"),
                    OsString::from(volume_id),
                    OsString::from("--instance-id"),
                    OsString::from(instance_id),
                    OsString::from("--device"),
                    OsString::from(device),
                ],
            )
        })
    }
}

impl<R: CommandRunner + Send + Sync> DetachVolume for AwsCli<R> {
    fn detach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
        force: bool,
    ) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let mut args = vec![
                OsString::from("--volume-id"),
                OsString::from(volume_id),
                OsString::from("--instance-id"),
                OsString::from(instance_id),
            ];
            if force {
                args.push(OsString::from("--force"));
            }
            self.call_ec2("detach-volume", args)
        })
    }
}

impl<R: CommandRunner + Send + Sync> TagResource for AwsCli<R> {
    fn tag_resource<'a>(&'a self, resource_id: &'a str, tags: &'a [Tag]) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let operation = "create-tags";
            let args = vec![
                OsString::from("--resources"),
                OsString::from(resource_id),
                OsString::from("--tags"),
                json_arg(operation, &wire_tags(tags))?,
            ];
            self.call_ec2(operation, args)
        })
    }
}

impl<R: CommandRunner + Send + Sync> UntagResource for AwsCli<R> {
    fn untag_resource<'a>(
        &'a self,
        resource_id: &'a str,
        keys: &'a [&'a str],
    ) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let operation = "delete-tags";
            let tags = keys
                .iter()
                .map(|key| WireTag {
                    key: (*key).to_owned(),
                    value: None,
                })
                .collect::<Vec<_>>();
            let args = vec![
                OsString::from("--resources"),
                OsString::from(resource_id),
                OsString::from("--tags"),
                json_arg(operation, &tags)?,
            ];
            self.call_ec2(operation, args)
        })
    }
}

impl<R: CommandRunner + Send + Sync> DescribeVolumes for AwsCli<R> {
    fn describe_volumes<'a>(
        &'a self,
        filter: &'a VolumeFilter,
    ) -> CloudFuture<'a, Vec<ProjectVolume>> {
        Box::pin(async move {
            let operation = "describe-volumes";
            let mut args = filters_arg(operation, &volume_filters(filter))?;
            if let Some(id) = &filter.volume_id {
                args.push(OsString::from("--volume-ids"));
                args.push(OsString::from(id));
            }
            let output: DescribeVolumesOutput = self.call_ec2_json(operation, args)?;
            output
                .volumes
                .into_iter()
                .map(|volume| {
                    volume.into_volume().map_err(|message| CloudError::Parse {
                        operation: operation.to_owned(),
                        message,
                    })
                })
                .collect()
        })
    }
}

impl<R: CommandRunner + Send + Sync> DescribeAddresses for AwsCli<R> {
    fn describe_addresses<'a>(
        &'a self,
        filter: &'a AddressFilter,
    ) -> CloudFuture<'a, Vec<ElasticAddress>> {
        Box::pin(async move {
            let operation = "describe-addresses";
            let filters = [
                tag_filter(TAG_OWNER, &filter.owner),
                tag_filter(TAG_NAME, &filter.name),
            ];
            let args = filters_arg(operation, &filters)?;
            let output: DescribeAddressesOutput = self.call_ec2_json(operation, args)?;
            Ok(output
                .addresses
                .into_iter()
                .map(ElasticAddress::from)
                .collect())
        })
    }
}

impl<R: CommandRunner + Send + Sync> AssociateAddress for AwsCli<R> {
    fn associate_address<'a>(
        &'a self,
        allocation_id: &'a str,
        instance_id: &'a str,
    ) -> CloudFuture<'a, String> {
        Box::pin(async move {
            let output: AssociateAddressOutput = self.call_ec2_json(
                "associate-address",
                vec![
                    OsString::from("--allocation-id"),
                    OsString::from(allocation_id),
                    OsString::from("--instance-id"),
                    OsString::from(instance_id),
                ],
            )?;
            Ok(output.association_id)
        })
    }
}

impl<R: CommandRunner + Send + Sync> DisassociateAddress for AwsCli<R> {
    fn disassociate_address<'a>(&'a self, association_id: &'a str) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            self.call_ec2(
                "disassociate-address",
                vec![
                    OsString::from("--association-id"),
                    OsString::from(association_id),
                ],
            )
        })
    }
}

impl<R: CommandRunner + Send + Sync> DescribeSubnets for AwsCli<R> {
    fn describe_subnets<'a>(
        &'a self,
        availability_zone: &'a str,
    ) -> CloudFuture<'a, Vec<Subnet>> {
        Box::pin(async move {
            let operation = "describe-subnets";
            let filters = [WireFilter::new("availability-zone", availability_zone)];
            let args = filters_arg(operation, &filters)?;
            let output: DescribeSubnetsOutput = self.call_ec2_json(operation, args)?;
            Ok(output.subnets.into_iter().map(Subnet::from).collect())
        })
    }
}

impl<R: CommandRunner + Send + Sync> DescribeSecurityGroups for AwsCli<R> {
    fn describe_security_groups<'a>(
        &'a self,
        names: &'a [String],
    ) -> CloudFuture<'a, Vec<SecurityGroup>> {
        Box::pin(async move {
            let operation = "describe-security-groups";
            let filters = [WireFilter {
                name: String::from("group-name"),
                values: names.to_vec(),
            }];
            let args = filters_arg(operation, &filters)?;
            let output: DescribeSecurityGroupsOutput = self.call_ec2_json(operation, args)?;
            Ok(output
                .security_groups
                .into_iter()
                .map(SecurityGroup::from)
                .collect())
        })
    }
}

impl<R: CommandRunner + Send + Sync> DescribeImages for AwsCli<R> {
    fn describe_images<'a>(&'a self, query: &'a ImageQuery) -> CloudFuture<'a, Vec<MachineImage>> {
        Box::pin(async move {
            let operation = "describe-images";
            let filters = [
                WireFilter::new("name", &query.name_pattern),
                WireFilter::new("architecture", &query.architecture),
                WireFilter::new("state", "available"),
            ];
            let mut args = vec![OsString::from("--owners"), OsString::from(&query.owner)];
            args.extend(filters_arg(operation, &filters)?);
            let output: DescribeImagesOutput = self.call_ec2_json(operation, args)?;
            Ok(output.images.into_iter().map(MachineImage::from).collect())
        })
    }
}

impl<R: CommandRunner + Send + Sync> KeyPush for AwsCli<R> {
    fn push_key<'a>(&'a self, request: &'a KeyPushRequest) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let operation = "send-ssh-public-key";
            let output: SendSshPublicKeyOutput = self.call_json(
                "ec2-instance-connect",
                operation,
                vec![
                    OsString::from("--instance-id"),
                    OsString::from(&request.instance_id),
                    OsString::from("--instance-os-user"),
                    OsString::from(&request.os_user),
                    OsString::from("--availability-zone"),
                    OsString::from(&request.availability_zone),
                    OsString::from("--ssh-public-key"),
                    OsString::from(&request.public_key),
                ],
            )?;
            if output.success {
                Ok(())
            } else {
                Err(CloudError::Api {
                    operation: operation.to_owned(),
                    message: String::from("the provider did not accept the key"),
                })
            }
        })
    }
}

#[cfg(test)]
mod tests;
