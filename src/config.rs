//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::bootstrap::resolve_extra_script;
use crate::exec::expand_tilde;
use crate::recreate::{InstanceTypePolicy, RecreateSettings, WaitBounds};
use crate::trust::{FileHostKeyStore, HostKeyStoreError};

/// Settings for berth loaded from defaults, `berth.toml` files and `BERTH_*`
/// environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BERTH",
    discovery(
        app_name = "berth",
        env_var = "BERTH_CONFIG_PATH",
        config_file_name = "berth.toml",
        dotfile_name = ".berth.toml",
        project_file_name = "berth.toml"
    )
)]
pub struct BerthConfig {
    /// Owner tag placed on, and used to find, every resource. Required.
    pub owner: String,
    /// Principal ARN recorded on new instances for audit.
    pub owner_arn: Option<String>,
    /// VM name used when a command does not name one.
    #[ortho_config(default = "default".to_owned())]
    pub vm_name: String,
    /// Cloud region.
    #[ortho_config(default = "us-east-1".to_owned())]
    pub region: String,
    /// Login user on the VM.
    #[ortho_config(default = "ubuntu".to_owned())]
    pub ssh_user: String,
    /// SSH port on the VM.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Instance type for replacements. The old instance's type is reused
    /// when unset.
    pub instance_type: Option<String>,
    /// Security group shared by every owner. Blank disables it.
    #[ortho_config(default = "berth-shared".to_owned())]
    pub shared_security_group: String,
    /// Name pattern of the machine images to boot.
    #[ortho_config(default = "berth-dev-*".to_owned())]
    pub image_name_pattern: String,
    /// Account that publishes the machine images.
    #[ortho_config(default = "self".to_owned())]
    pub image_owner: String,
    /// Device path the project volume attaches at.
    #[ortho_config(default = "/dev/sdf".to_owned())]
    pub device_path: String,
    /// Minutes without sessions before the VM stops itself.
    #[ortho_config(default = 30)]
    pub idle_timeout_minutes: u32,
    /// URL the boot agent is downloaded from.
    #[ortho_config(default = String::new())]
    pub delivery_url: String,
    /// Expected digest of the boot agent.
    #[ortho_config(default = String::new())]
    pub image_digest: String,
    /// Operator script appended to the boot payload. Supports `~`.
    pub extra_script_file: Option<String>,
    /// Host key store override; defaults to `~/.config/berth/host_keys.toml`.
    pub host_keys_file: Option<String>,
    /// Path to the `aws` executable.
    #[ortho_config(default = "aws".to_owned())]
    pub aws_bin: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `ssh-keyscan` executable.
    #[ortho_config(default = "ssh-keyscan".to_owned())]
    pub keyscan_bin: String,
    /// Upper bound on each instance or volume wait.
    #[ortho_config(default = 300)]
    pub wait_timeout_secs: u64,
    /// Delay between polls.
    #[ortho_config(default = 5)]
    pub poll_interval_secs: u64,
    /// Upper bound on the bootstrap wait.
    #[ortho_config(default = 900)]
    pub bootstrap_timeout_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl BerthConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to berth.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero: check {} or {} in berth.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("berth")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is blank
    /// and [`ConfigError::Invalid`] when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.owner,
            &FieldMetadata::new("resource owner", "BERTH_OWNER", "owner"),
        )?;
        Self::require_field(
            &self.vm_name,
            &FieldMetadata::new("default VM name", "BERTH_VM_NAME", "vm_name"),
        )?;
        Self::require_field(
            &self.region,
            &FieldMetadata::new("cloud region", "BERTH_REGION", "region"),
        )?;
        Self::require_field(
            &self.ssh_user,
            &FieldMetadata::new("SSH login user", "BERTH_SSH_USER", "ssh_user"),
        )?;
        Self::require_field(
            &self.image_name_pattern,
            &FieldMetadata::new(
                "machine image name pattern",
                "BERTH_IMAGE_NAME_PATTERN",
                "image_name_pattern",
            ),
        )?;
        Self::require_field(
            &self.image_owner,
            &FieldMetadata::new("machine image owner", "BERTH_IMAGE_OWNER", "image_owner"),
        )?;
        Self::require_field(
            &self.device_path,
            &FieldMetadata::new("volume device path", "BERTH_DEVICE_PATH", "device_path"),
        )?;
        if self.ssh_port == 0 {
            return Err(ConfigError::Invalid(String::from(
                "ssh_port must be greater than zero: check BERTH_SSH_PORT or ssh_port in berth.toml",
            )));
        }
        Self::require_positive(
            self.wait_timeout_secs,
            &FieldMetadata::new("wait timeout", "BERTH_WAIT_TIMEOUT_SECS", "wait_timeout_secs"),
        )?;
        Self::require_positive(
            self.poll_interval_secs,
            &FieldMetadata::new(
                "poll interval",
                "BERTH_POLL_INTERVAL_SECS",
                "poll_interval_secs",
            ),
        )?;
        Self::require_positive(
            self.bootstrap_timeout_secs,
            &FieldMetadata::new(
                "bootstrap timeout",
                "BERTH_BOOTSTRAP_TIMEOUT_SECS",
                "bootstrap_timeout_secs",
            ),
        )?;
        Ok(())
    }

    /// Returns the wait bounds for instance and volume waits.
    #[must_use]
    pub const fn wait_bounds(&self) -> WaitBounds {
        WaitBounds {
            timeout: Duration::from_secs(self.wait_timeout_secs),
            interval: Duration::from_secs(self.poll_interval_secs),
        }
    }

    /// Returns the upper bound on the bootstrap wait.
    #[must_use]
    pub const fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }

    /// Opens the host key store at the configured or default location.
    ///
    /// # Errors
    ///
    /// Returns [`HostKeyStoreError::Location`] when no default location can
    /// be determined.
    pub fn host_key_store(&self) -> Result<FileHostKeyStore, HostKeyStoreError> {
        match self
            .host_keys_file
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            Some(path) => Ok(FileHostKeyStore::new(expand_tilde(path))),
            None => FileHostKeyStore::at_default_location(),
        }
    }

    /// Builds orchestrator settings, reading the operator script if one is
    /// configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails or the operator script
    /// cannot be read.
    pub fn recreate_settings(
        &self,
        instance_type_policy: InstanceTypePolicy,
    ) -> Result<RecreateSettings, ConfigError> {
        self.validate()?;
        let extra_script_base64 = resolve_extra_script(self.extra_script_file.as_deref())
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        let shared = self.shared_security_group.trim();
        Ok(RecreateSettings {
            owner: self.owner.trim().to_owned(),
            owner_arn: self
                .owner_arn
                .as_deref()
                .map(str::trim)
                .filter(|arn| !arn.is_empty())
                .map(ToOwned::to_owned),
            ssh_user: self.ssh_user.clone(),
            ssh_port: self.ssh_port,
            device_path: self.device_path.clone(),
            shared_security_group: (!shared.is_empty()).then(|| shared.to_owned()),
            image_owner: self.image_owner.clone(),
            image_name_pattern: self.image_name_pattern.clone(),
            instance_type: self
                .instance_type
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToOwned::to_owned),
            instance_type_policy,
            delivery_url: self.delivery_url.clone(),
            image_digest: self.image_digest.clone(),
            idle_timeout_minutes: self.idle_timeout_minutes,
            extra_script_base64,
            wait: self.wait_bounds(),
        })
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configured value is unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
