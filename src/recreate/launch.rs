//! Launch planning for the replacement instance.

use crate::cloud::{
    BootstrapState, CloudError, MachineImage, SecurityGroup, Subnet, TAG_BOOTSTRAP, TAG_NAME,
    TAG_OWNER, TAG_OWNER_ARN, Tag,
};

/// Validates an instance type before anything is destroyed.
///
/// Returns a human-readable reason on rejection.
pub type InstanceTypePolicy = fn(&str) -> Result<(), String>;

/// Accepts `<family>.<size>` with lowercase alphanumeric parts.
///
/// # Errors
///
/// Returns a reason when `instance_type` does not have that shape.
pub fn default_instance_type_policy(instance_type: &str) -> Result<(), String> {
    let Some((family, size)) = instance_type.split_once('.') else {
        return Err(format!(
            "instance type '{instance_type}' must look like <family>.<size>"
        ));
    };
    let well_formed = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit())
    };
    let starts_with_letter = family.chars().next().is_some_and(|ch| ch.is_ascii_lowercase());
    if well_formed(family) && well_formed(size) && starts_with_letter {
        Ok(())
    } else {
        Err(format!(
            "instance type '{instance_type}' must look like <family>.<size>"
        ))
    }
}

/// Returns the image architecture for an instance type.
///
/// Families with a `g` after the generation digit (`t4g`, `m7gd`) are
/// Graviton and need `arm64` images.
#[must_use]
pub fn architecture_for(instance_type: &str) -> &'static str {
    let family = instance_type.split('.').next().unwrap_or_default();
    let suffix = family
        .find(|ch: char| ch.is_ascii_digit())
        .and_then(|index| family.get(index..))
        .map(|rest| rest.trim_start_matches(|ch: char| ch.is_ascii_digit()))
        .unwrap_or_default();
    if suffix.contains('g') {
        "arm64"
    } else {
        "x86_64"
    }
}

/// Picks the most recently created image.
pub(crate) fn newest_image(images: Vec<MachineImage>) -> Option<MachineImage> {
    images
        .into_iter()
        .max_by(|left, right| left.creation_date.cmp(&right.creation_date))
}

/// Maps group names to ids, requiring every name to resolve.
pub(crate) fn security_group_ids(
    names: &[String],
    groups: &[SecurityGroup],
) -> Result<Vec<String>, CloudError> {
    names
        .iter()
        .map(|name| {
            groups
                .iter()
                .find(|group| &group.name == name)
                .map(|group| group.group_id.clone())
                .ok_or_else(|| CloudError::NotFound {
                    resource: format!("security group '{name}'"),
                })
        })
        .collect()
}

/// Returns the default subnet of `zone`.
pub(crate) fn default_subnet(subnets: Vec<Subnet>, zone: &str) -> Result<Subnet, CloudError> {
    subnets
        .into_iter()
        .find(|subnet| subnet.default_for_zone && subnet.availability_zone == zone)
        .ok_or_else(|| CloudError::NotFound {
            resource: format!("default subnet in {zone}"),
        })
}

/// Tags applied to the replacement at launch.
pub(crate) fn launch_tags(owner: &str, owner_arn: Option<&str>, vm_name: &str) -> Vec<Tag> {
    let mut tags = vec![
        Tag::new(TAG_OWNER, owner),
        Tag::new(TAG_NAME, vm_name),
        Tag::new(TAG_BOOTSTRAP, BootstrapState::Pending.as_str()),
    ];
    if let Some(arn) = owner_arn {
        tags.push(Tag::new(TAG_OWNER_ARN, arn));
    }
    tags
}
