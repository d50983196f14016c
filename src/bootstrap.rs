//! Boot configuration for replacement instances and bootstrap polling.
//!
//! The boot payload is a shell script that fetches the bootstrap agent,
//! verifies its digest and runs it with the VM's parameters in the
//! environment. The agent reports progress through the instance's
//! `berth:bootstrap` tag, which [`TagBootstrapPoller`] watches.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use shell_escape::unix::escape;
use thiserror::Error;
use tokio::time::sleep;

use crate::cloud::{BootstrapState, CloudError, DescribeInstances, InstanceFilter};
use crate::exec::expand_tilde;

/// Hard ceiling on the rendered boot payload.
pub const MAX_BOOT_PAYLOAD_BYTES: usize = 16 * 1024;

const AGENT_PATH: &str = "/usr/local/bin/berth-bootstrap";

/// Errors raised while preparing boot configuration or polling bootstrap.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Raised when the extra script file cannot be read.
    #[error("failed to read extra bootstrap script `{path}`: {message}")]
    ExtraScript {
        /// Expanded path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the extra script file is empty.
    #[error("extra bootstrap script `{path}` is empty")]
    ExtraScriptEmpty {
        /// Expanded path of the empty file.
        path: String,
    },
    /// Raised when the instance reports a failed bootstrap.
    #[error("bootstrap failed on {instance_id}: {detail}")]
    Failed {
        /// Instance that failed to bootstrap.
        instance_id: String,
        /// Health detail recorded by the agent.
        detail: String,
    },
    /// Raised when the instance disappears while polling.
    #[error("instance {instance_id} disappeared before bootstrap completed")]
    InstanceGone {
        /// Instance that vanished.
        instance_id: String,
    },
    /// Raised when bootstrap does not finish in time.
    #[error("bootstrap on {instance_id} did not complete within {seconds} seconds")]
    Timeout {
        /// Instance being polled.
        instance_id: String,
        /// Timeout that elapsed.
        seconds: u64,
    },
    /// Raised when polling the instance fails.
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// Parameters embedded in the boot payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootConfig {
    /// Expected SHA-256 digest of the bootstrap agent.
    pub image_digest: String,
    /// URL the bootstrap agent is downloaded from.
    pub delivery_url: String,
    /// Identifier of the persistent project volume.
    pub storage_id: String,
    /// Device path the volume is attached at.
    pub device_path: String,
    /// VM name.
    pub vm_name: String,
    /// Minutes of inactivity before the VM stops itself.
    pub idle_timeout_minutes: u32,
    /// Base64-encoded operator script run after bootstrap, if any.
    pub extra_script_base64: Option<String>,
}

/// Turns a [`BootConfig`] into a user-data payload.
pub trait BootConfigRenderer {
    /// Renders the payload. Size limits are enforced by the caller.
    fn render(&self, config: &BootConfig) -> Vec<u8>;
}

impl<T: BootConfigRenderer + ?Sized> BootConfigRenderer for &T {
    fn render(&self, config: &BootConfig) -> Vec<u8> {
        (**self).render(config)
    }
}

/// Renders the boot payload as a bash script.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScriptRenderer;

impl BootConfigRenderer for ScriptRenderer {
    fn render(&self, config: &BootConfig) -> Vec<u8> {
        let vars = [
            ("BERTH_VM_NAME", config.vm_name.clone()),
            ("BERTH_IMAGE_DIGEST", config.image_digest.clone()),
            ("BERTH_DELIVERY_URL", config.delivery_url.clone()),
            ("BERTH_STORAGE_ID", config.storage_id.clone()),
            ("BERTH_DEVICE_PATH", config.device_path.clone()),
            (
                "BERTH_IDLE_TIMEOUT_MINUTES",
                config.idle_timeout_minutes.to_string(),
            ),
            (
                "BERTH_EXTRA_SCRIPT_B64",
                config.extra_script_base64.clone().unwrap_or_default(),
            ),
        ];

        let mut script = String::from("#!/bin/bash\nset -euo pipefail\n\n");
        for (name, value) in vars {
            script.push_str("export ");
            script.push_str(name);
            script.push('=');
            script.push_str(&escape(value.into()));
            script.push('\n');
        }
        script.push_str(&format!(
            concat!(
                "\ncurl -fsSL --retry 5 \"$BERTH_DELIVERY_URL\" -o {agent}\n",
                "if [ -n \"$BERTH_IMAGE_DIGEST\" ]; then\n",
                "  echo \"${{BERTH_IMAGE_DIGEST#sha256:}}  {agent}\" | sha256sum -c -\n",
                "fi\n",
                "chmod 0755 {agent}\n",
                "exec {agent}\n",
            ),
            agent = AGENT_PATH
        ));
        script.into_bytes()
    }
}

/// Reads an operator script and base64-encodes it for the boot payload.
///
/// # Errors
///
/// Returns [`BootstrapError::ExtraScript`] when the file cannot be read and
/// [`BootstrapError::ExtraScriptEmpty`] when it is blank.
pub fn resolve_extra_script(path: Option<&str>) -> Result<Option<String>, BootstrapError> {
    let Some(raw) = path.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };

    let expanded = expand_tilde(raw);
    let content = read_to_string_ambient(&expanded).map_err(|message| {
        BootstrapError::ExtraScript {
            path: expanded.clone(),
            message,
        }
    })?;
    if content.trim().is_empty() {
        return Err(BootstrapError::ExtraScriptEmpty { path: expanded });
    }
    Ok(Some(STANDARD.encode(content.as_bytes())))
}

fn read_to_string_ambient(path: &str) -> Result<String, String> {
    let file = Utf8Path::new(path);
    let (dir_path, file_path) = if file.is_absolute() {
        let parent = file
            .parent()
            .ok_or_else(|| format!("path has no parent directory: {file}"))?;
        let name = file
            .file_name()
            .ok_or_else(|| format!("path has no file name: {file}"))?;
        (parent, Utf8Path::new(name))
    } else {
        (Utf8Path::new("."), file)
    };

    let dir =
        Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(file_path).map_err(|err| err.to_string())
}

/// Future returned by bootstrap pollers.
pub type BootstrapFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(), BootstrapError>> + Send + 'a>>;

/// Waits for a freshly launched instance to finish bootstrapping.
pub trait BootstrapPoller {
    /// Resolves once bootstrap completes, fails or times out.
    fn poll<'a>(&'a self, owner: &'a str, vm_name: &'a str, instance_id: &'a str)
    -> BootstrapFuture<'a>;
}

impl<T: BootstrapPoller + ?Sized> BootstrapPoller for &T {
    fn poll<'a>(
        &'a self,
        owner: &'a str,
        vm_name: &'a str,
        instance_id: &'a str,
    ) -> BootstrapFuture<'a> {
        (**self).poll(owner, vm_name, instance_id)
    }
}

/// [`BootstrapPoller`] that watches the instance's bootstrap tag.
#[derive(Clone, Debug)]
pub struct TagBootstrapPoller<A> {
    api: A,
    timeout: Duration,
    interval: Duration,
}

impl<A: DescribeInstances> TagBootstrapPoller<A> {
    /// Creates a poller with the given bounds.
    #[must_use]
    pub const fn new(api: A, timeout: Duration, interval: Duration) -> Self {
        Self {
            api,
            timeout,
            interval,
        }
    }
}

impl<A: DescribeInstances + Sync> BootstrapPoller for TagBootstrapPoller<A> {
    fn poll<'a>(
        &'a self,
        owner: &'a str,
        vm_name: &'a str,
        instance_id: &'a str,
    ) -> BootstrapFuture<'a> {
        Box::pin(async move {
            let filter = InstanceFilter {
                owner: Some(owner.to_owned()),
                name: Some(vm_name.to_owned()),
                instance_id: Some(instance_id.to_owned()),
            };
            let deadline = Instant::now() + self.timeout;

            loop {
                let vms = self.api.describe_instances(&filter).await?;
                let Some(vm) = vms.into_iter().find(|vm| vm.id == instance_id) else {
                    return Err(BootstrapError::InstanceGone {
                        instance_id: instance_id.to_owned(),
                    });
                };
                if vm.state.is_gone() {
                    return Err(BootstrapError::InstanceGone {
                        instance_id: instance_id.to_owned(),
                    });
                }
                match vm.bootstrap {
                    Some(BootstrapState::Complete) => return Ok(()),
                    Some(BootstrapState::Failed) => {
                        return Err(BootstrapError::Failed {
                            instance_id: instance_id.to_owned(),
                            detail: vm
                                .health
                                .unwrap_or_else(|| String::from("no health detail recorded")),
                        });
                    }
                    Some(BootstrapState::Pending) | None => {}
                }

                if Instant::now() >= deadline {
                    return Err(BootstrapError::Timeout {
                        instance_id: instance_id.to_owned(),
                        seconds: self.timeout.as_secs(),
                    });
                }
                sleep(self.interval).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeCloud;
    use rstest::{fixture, rstest};

    #[fixture]
    fn config() -> BootConfig {
        BootConfig {
            image_digest: String::from("sha256:abc123"),
            delivery_url: String::from("https://example.invalid/agent"),
            storage_id: String::from("vol-1"),
            device_path: String::from("/dev/sdf"),
            vm_name: String::from("default"),
            idle_timeout_minutes: 45,
            extra_script_base64: None,
        }
    }

    #[rstest]
    fn script_embeds_parameters(config: BootConfig) {
        let rendered = String::from_utf8(ScriptRenderer.render(&config)).expect("utf8");
        assert!(rendered.starts_with("#!/bin/bash\n"));
        assert!(rendered.contains("export BERTH_STORAGE_ID=vol-1\n"), "{rendered}");
        assert!(rendered.contains("export BERTH_IDLE_TIMEOUT_MINUTES=45\n"));
        assert!(
            rendered.contains("export BERTH_DELIVERY_URL='https://example.invalid/agent'\n"),
            "{rendered}"
        );
        assert!(rendered.len() < MAX_BOOT_PAYLOAD_BYTES);
    }

    #[rstest]
    fn script_quotes_hostile_values(mut config: BootConfig) {
        config.vm_name = String::from("dev; reboot");
        let rendered = String::from_utf8(ScriptRenderer.render(&config)).expect("utf8");
        assert!(rendered.contains("export BERTH_VM_NAME='dev; reboot'\n"), "{rendered}");
    }

    #[test]
    fn extra_script_is_base64_encoded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("extra.sh");
        std::fs::write(&path, "echo hi\n").expect("write");
        let encoded = resolve_extra_script(path.to_str())
            .expect("resolve")
            .expect("some script");
        assert_eq!(encoded, STANDARD.encode("echo hi\n"));
    }

    #[test]
    fn missing_extra_script_is_an_error() {
        let err = resolve_extra_script(Some("/nonexistent/berth/extra.sh"))
            .expect_err("missing file should fail");
        assert!(matches!(err, BootstrapError::ExtraScript { .. }), "{err:?}");
    }

    #[test]
    fn absent_extra_script_is_none() {
        assert!(resolve_extra_script(None).expect("resolve").is_none());
        assert!(resolve_extra_script(Some("  ")).expect("resolve").is_none());
    }

    #[tokio::test]
    async fn poller_returns_when_tag_completes() {
        let cloud = FakeCloud::seeded("alice", "default");
        let poller =
            TagBootstrapPoller::new(&cloud, Duration::from_secs(1), Duration::from_millis(1));
        poller
            .poll("alice", "default", "i-old")
            .await
            .expect("seeded instance is bootstrapped");
    }

    #[tokio::test]
    async fn poller_times_out_while_pending() {
        let cloud = FakeCloud::seeded("alice", "default");
        cloud.set_bootstrap("i-old", BootstrapState::Pending);
        let poller =
            TagBootstrapPoller::new(&cloud, Duration::from_millis(5), Duration::from_millis(1));

        let err = poller
            .poll("alice", "default", "i-old")
            .await
            .expect_err("pending should time out");
        assert!(matches!(err, BootstrapError::Timeout { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn poller_reports_failure_with_health() {
        let cloud = FakeCloud::seeded("alice", "default");
        cloud.set_bootstrap("i-old", BootstrapState::Failed);
        cloud.set_health("i-old", "docker pull failed");
        let poller =
            TagBootstrapPoller::new(&cloud, Duration::from_secs(1), Duration::from_millis(1));

        let err = poller
            .poll("alice", "default", "i-old")
            .await
            .expect_err("failed bootstrap should error");
        assert!(err.to_string().contains("docker pull failed"), "{err}");
    }
}
