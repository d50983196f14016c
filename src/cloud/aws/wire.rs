//! JSON shapes emitted by `aws ... --output json`.

use serde::{Deserialize, Serialize};

use crate::cloud::types::{
    BootstrapState, ElasticAddress, MachineImage, ProjectVolume, SecurityGroup, Subnet,
    TAG_BOOTSTRAP, TAG_HEALTH, TAG_NAME, TAG_OWNER, TAG_OWNER_ARN, TAG_PENDING_ATTACH, Vm,
};

#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct WireTag {
    pub(super) key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) value: Option<String>,
}

fn tag_value<'t>(tags: &'t [WireTag], key: &str) -> Option<&'t str> {
    tags.iter()
        .find(|tag| tag.key == key)
        .and_then(|tag| tag.value.as_deref())
}

#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct WireFilter {
    pub(super) name: String,
    pub(super) values: Vec<String>,
}

impl WireFilter {
    pub(super) fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: vec![value.into()],
        }
    }
}

#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct WireTagSpecification {
    pub(super) resource_type: String,
    pub(super) tags: Vec<WireTag>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct DescribeInstancesOutput {
    #[serde(default)]
    pub(super) reservations: Vec<Reservation>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct Reservation {
    #[serde(default)]
    pub(super) instances: Vec<WireInstance>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct RunInstancesOutput {
    #[serde(default)]
    pub(super) instances: Vec<WireInstance>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct WireInstance {
    pub(super) instance_id: String,
    pub(super) instance_type: String,
    pub(super) state: WireInstanceState,
    pub(super) placement: WirePlacement,
    #[serde(default)]
    pub(super) public_ip_address: Option<String>,
    #[serde(default)]
    pub(super) tags: Vec<WireTag>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct WireInstanceState {
    pub(super) name: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct WirePlacement {
    pub(super) availability_zone: String,
}

impl WireInstance {
    pub(super) fn into_vm(self) -> Result<Vm, String> {
        let state = self.state.name.parse()?;
        Ok(Vm {
            name: tag_value(&self.tags, TAG_NAME).unwrap_or_default().to_owned(),
            owner_tag: tag_value(&self.tags, TAG_OWNER).unwrap_or_default().to_owned(),
            owner_arn: tag_value(&self.tags, TAG_OWNER_ARN).map(str::to_owned),
            bootstrap: tag_value(&self.tags, TAG_BOOTSTRAP).and_then(BootstrapState::from_tag),
            health: tag_value(&self.tags, TAG_HEALTH).map(str::to_owned),
            id: self.instance_id,
            state,
            availability_zone: self.placement.availability_zone,
            public_ip: self.public_ip_address,
            instance_type: self.instance_type,
        })
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct DescribeVolumesOutput {
    #[serde(default)]
    pub(super) volumes: Vec<WireVolume>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct WireVolume {
    pub(super) volume_id: String,
    pub(super) availability_zone: String,
    pub(super) size: u32,
    pub(super) state: String,
    #[serde(default)]
    pub(super) attachments: Vec<WireAttachment>,
    #[serde(default)]
    pub(super) tags: Vec<WireTag>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct WireAttachment {
    pub(super) instance_id: String,
}

impl WireVolume {
    pub(super) fn into_volume(self) -> Result<ProjectVolume, String> {
        let state = self.state.parse()?;
        Ok(ProjectVolume {
            vm_name: tag_value(&self.tags, TAG_NAME).unwrap_or_default().to_owned(),
            pending_attach: tag_value(&self.tags, TAG_PENDING_ATTACH) == Some("true"),
            attached_instance: self
                .attachments
                .into_iter()
                .next()
                .map(|attachment| attachment.instance_id),
            volume_id: self.volume_id,
            availability_zone: self.availability_zone,
            size_gb: self.size,
            state,
        })
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct DescribeAddressesOutput {
    #[serde(default)]
    pub(super) addresses: Vec<WireAddress>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct WireAddress {
    pub(super) allocation_id: String,
    pub(super) public_ip: String,
    #[serde(default)]
    pub(super) association_id: Option<String>,
    #[serde(default)]
    pub(super) instance_id: Option<String>,
}

impl From<WireAddress> for ElasticAddress {
    fn from(value: WireAddress) -> Self {
        Self {
            allocation_id: value.allocation_id,
            public_ip: value.public_ip,
            association_id: value.association_id,
            instance_id: value.instance_id,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct AssociateAddressOutput {
    pub(super) association_id: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct DescribeSubnetsOutput {
    #[serde(default)]
    pub(super) subnets: Vec<WireSubnet>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct WireSubnet {
    pub(super) subnet_id: String,
    pub(super) availability_zone: String,
    #[serde(default)]
    pub(super) default_for_az: bool,
}

impl From<WireSubnet> for Subnet {
    fn from(value: WireSubnet) -> Self {
        Self {
            subnet_id: value.subnet_id,
            availability_zone: value.availability_zone,
            default_for_zone: value.default_for_az,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct DescribeSecurityGroupsOutput {
    #[serde(default)]
    pub(super) security_groups: Vec<WireSecurityGroup>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct WireSecurityGroup {
    pub(super) group_id: String,
    pub(super) group_name: String,
}

impl From<WireSecurityGroup> for SecurityGroup {
    fn from(value: WireSecurityGroup) -> Self {
        Self {
            group_id: value.group_id,
            name: value.group_name,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct DescribeImagesOutput {
    #[serde(default)]
    pub(super) images: Vec<WireImage>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct WireImage {
    pub(super) image_id: String,
    #[serde(default)]
    pub(super) name: String,
    #[serde(default)]
    pub(super) creation_date: String,
}

impl From<WireImage> for MachineImage {
    fn from(value: WireImage) -> Self {
        Self {
            image_id: value.image_id,
            name: value.name,
            creation_date: value.creation_date,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(super) struct SendSshPublicKeyOutput {
    pub(super) success: bool,
}
