//! Orchestrates in-place recreation of a development VM.
//!
//! The workflow replaces the instance behind a VM name while keeping its
//! project volume and elastic address:
//!
//! 1. discover the VM by owner and name;
//! 2. require it to be running;
//! 3. look for active sessions (advisory unless sessions are found);
//! 4. ask the operator to type the VM name;
//! 5. locate the project volume, whose zone pins the replacement;
//! 6. tag the volume as pending attach;
//! 7. stop the instance, force-detach the volume and terminate;
//! 8. launch a replacement and wait for it and the volume;
//! 9. attach the volume, clear the marker, move the address, forget the old
//!    host key and wait for bootstrap.
//!
//! Steps 6 to 9 are not reversible. A failure there leaves the
//! pending-attach tag on the volume so a later run can find it.

use std::fmt::Display;
use std::future::Future;
use std::io::{BufRead, Write};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bootstrap::{BootConfig, BootConfigRenderer, BootstrapPoller, MAX_BOOT_PAYLOAD_BYTES};
use crate::cloud::{
    AddressFilter, CloudError, ImageQuery, InstanceFilter, LaunchRequest, ProjectVolume,
    ResourceApi, TAG_PENDING_ATTACH, Tag, Vm, VmState, VolumeFilter, VolumeState,
};
use crate::remote::{RemoteRunner, RemoteTarget};
use crate::sessions::SessionDetector;
use crate::trust::{HostKeyScanner, HostKeyStore, TrustedRunner};

mod confirm;
mod error;
mod launch;
mod reattach;
mod wait;


pub use error::{ErrorKind, RecreateError, RecreateStep, StepSource};
pub use launch::{InstanceTypePolicy, architecture_for, default_instance_type_policy};
pub use wait::{WaitBounds, WaitError};

/// Default bound on each wait.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);
/// Default delay between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const TOTAL_STEPS: u8 = 9;

/// Operator-supplied parameters of a recreate run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecreateRequest {
    /// Name of the VM to recreate.
    pub vm_name: String,
    /// Proceed even when sessions are active.
    pub force: bool,
    /// Skip the typed confirmation.
    pub assume_yes: bool,
}

/// Configuration consumed by the orchestrator.
#[derive(Clone, Debug)]
pub struct RecreateSettings {
    /// Owner tag of the caller's resources.
    pub owner: String,
    /// Owner principal ARN recorded on the replacement, when known.
    pub owner_arn: Option<String>,
    /// Login user on the VM.
    pub ssh_user: String,
    /// SSH port on the VM.
    pub ssh_port: u16,
    /// Device path the project volume attaches at.
    pub device_path: String,
    /// Optional security group shared by every owner.
    pub shared_security_group: Option<String>,
    /// Account owning the machine images.
    pub image_owner: String,
    /// Image name pattern.
    pub image_name_pattern: String,
    /// Instance type override; the old instance's type is reused otherwise.
    pub instance_type: Option<String>,
    /// Gate applied to the resolved instance type.
    pub instance_type_policy: InstanceTypePolicy,
    /// URL the boot agent is downloaded from.
    pub delivery_url: String,
    /// Expected digest of the boot agent.
    pub image_digest: String,
    /// Idle shutdown timeout in minutes.
    pub idle_timeout_minutes: u32,
    /// Base64-encoded operator boot script.
    pub extra_script_base64: Option<String>,
    /// Bounds for the instance and volume waiters.
    pub wait: WaitBounds,
}

/// Summary of a completed recreate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecreateOutcome {
    /// VM name.
    pub vm_name: String,
    /// Terminated instance.
    pub old_instance_id: String,
    /// Replacement instance.
    pub new_instance_id: String,
    /// Project volume that moved across.
    pub volume_id: String,
    /// Address now bound to the replacement.
    pub public_ip: String,
    /// Non-fatal problems met along the way.
    pub warnings: Vec<String>,
}

/// Collaborators used by the orchestrator.
#[derive(Clone, Debug)]
pub struct RecreateDeps<A, R, S, H, B, P> {
    /// Cloud resource verbs.
    pub api: A,
    /// Remote command runner used for session checks.
    pub remote: R,
    /// Host key scanner.
    pub scanner: S,
    /// Pinned host key store.
    pub host_keys: H,
    /// Boot configuration renderer.
    pub renderer: B,
    /// Bootstrap completion poller.
    pub poller: P,
}

/// Executes the recreate workflow.
#[derive(Debug)]
pub struct RecreateOrchestrator<A, R, S, H, B, P> {
    deps: RecreateDeps<A, R, S, H, B, P>,
    settings: RecreateSettings,
    cancel: CancellationToken,
}

impl<A, R, S, H, B, P> RecreateOrchestrator<A, R, S, H, B, P>
where
    A: ResourceApi,
    R: RemoteRunner + Sync,
    S: HostKeyScanner + Sync,
    H: HostKeyStore + Sync,
    B: BootConfigRenderer,
    P: BootstrapPoller + Sync,
{
    /// Creates an orchestrator that is never cancelled.
    #[must_use]
    pub fn new(deps: RecreateDeps<A, R, S, H, B, P>, settings: RecreateSettings) -> Self {
        Self {
            deps,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Stops the workflow at the next suspension point once `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs the workflow, reading the confirmation from `input` and writing
    /// progress to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`RecreateError`]; [`RecreateError::kind`] classifies it and
    /// [`RecreateError::failed_step`] names the step for step failures.
    pub async fn execute<I, W>(
        &self,
        request: &RecreateRequest,
        input: &mut I,
        out: &mut W,
    ) -> Result<RecreateOutcome, RecreateError>
    where
        I: BufRead,
        W: Write,
    {
        let name = request.vm_name.as_str();
        let trusted = TrustedRunner::new(
            &self.deps.remote,
            &self.deps.scanner,
            &self.deps.host_keys,
        );
        let mut warnings = Vec::new();

        let vm = self.discover(name).await?;
        progress(
            out,
            1,
            format_args!(
                "found VM \"{name}\" on {} in {}",
                vm.id, vm.availability_zone
            ),
        );

        self.checkpoint(RecreateStep::CheckState)?;
        if vm.state != VmState::Running {
            return Err(RecreateError::StateConflict {
                vm_name: name.to_owned(),
                state: vm.state,
            });
        }
        progress(out, 2, "VM is running");

        self.detect_sessions(&trusted, &vm, request, out, &mut warnings)
            .await?;

        self.checkpoint(RecreateStep::Confirm)?;
        if request.assume_yes {
            progress(out, 4, "confirmation skipped (--yes)");
        } else {
            confirm::confirm_by_name(name, input, out)?;
            progress(out, 4, "confirmed");
        }

        let volume = self.project_volume(name, &vm).await?;
        progress(
            out,
            5,
            format_args!(
                "project volume {} in {}",
                volume.volume_id, volume.availability_zone
            ),
        );

        self.checkpoint(RecreateStep::ValidateConfiguration)?;
        let instance_type = self
            .settings
            .instance_type
            .clone()
            .unwrap_or_else(|| vm.instance_type.clone());
        (self.settings.instance_type_policy)(&instance_type)
            .map_err(|message| RecreateError::Configuration { message })?;
        let user_data = self.render_boot_config(name, &volume)?;

        self.run_step(
            RecreateStep::MarkPendingAttach,
            self.deps.api.tag_resource(
                &volume.volume_id,
                &[Tag::new(TAG_PENDING_ATTACH, "true")],
            ),
        )
        .await?;
        progress(out, 6, "volume marked pending-attach");

        self.retire_instance(&vm, &volume, out).await?;

        let launched = self
            .launch_replacement(&vm, &volume, instance_type, user_data, out)
            .await?;

        let public_ip = self
            .reattach(&trusted, name, &volume, &launched, out, &mut warnings)
            .await?;

        writeln!(
            out,
            "VM \"{name}\" recreated: instance {} replaces {} at {public_ip}",
            launched.id, vm.id
        )
        .ok();
        tracing::info!(vm = name, old = %vm.id, new = %launched.id, "recreate complete");

        Ok(RecreateOutcome {
            vm_name: name.to_owned(),
            old_instance_id: vm.id,
            new_instance_id: launched.id,
            volume_id: volume.volume_id,
            public_ip,
            warnings,
        })
    }

    async fn discover(&self, name: &str) -> Result<Vm, RecreateError> {
        let filter = InstanceFilter::by_name(&self.settings.owner, name);
        let vms = self
            .run_step(
                RecreateStep::Discover,
                self.deps.api.describe_instances(&filter),
            )
            .await?;

        let mut live = vms
            .into_iter()
            .filter(|vm| !vm.state.is_gone())
            .collect::<Vec<_>>();
        live.sort_by_key(|vm| vm.state != VmState::Running);
        live.into_iter()
            .next()
            .ok_or_else(|| RecreateError::VmNotFound {
                vm_name: name.to_owned(),
                owner: self.settings.owner.clone(),
            })
    }

    async fn detect_sessions<T, W>(
        &self,
        runner: &T,
        vm: &Vm,
        request: &RecreateRequest,
        out: &mut W,
        warnings: &mut Vec<String>,
    ) -> Result<(), RecreateError>
    where
        T: RemoteRunner + Sync,
        W: Write,
    {
        let step = RecreateStep::DetectSessions;
        self.checkpoint(step)?;
        let Some(host) = vm.public_ip.clone() else {
            warn(
                out,
                warnings,
                format!("{} has no public address; session check skipped", vm.id),
            );
            return Ok(());
        };
        let target = RemoteTarget {
            vm_name: request.vm_name.clone(),
            instance_id: vm.id.clone(),
            zone: vm.availability_zone.clone(),
            host,
            port: self.settings.ssh_port,
            user: self.settings.ssh_user.clone(),
            host_key: None,
        };

        let detector = SessionDetector::new(runner);
        let detected = self
            .guarded(step, async {
                Ok::<_, RecreateError>(detector.detect(&target).await)
            })
            .await?;
        let report = match detected {
            Ok(report) => report,
            Err(err) => {
                warn(
                    out,
                    warnings,
                    format!("session check failed, continuing: {err}"),
                );
                return Ok(());
            }
        };
        let busy = report.is_busy();
        for note in report.warnings {
            warn(out, warnings, note);
        }

        if !busy {
            progress(out, 3, "no active sessions");
            return Ok(());
        }
        if !request.force {
            return Err(RecreateError::SessionsActive {
                vm_name: request.vm_name.clone(),
                summary: report.summary,
            });
        }
        warn(
            out,
            warnings,
            format!("proceeding despite active sessions (--force):\n{}", report.summary),
        );
        Ok(())
    }

    async fn project_volume(&self, name: &str, vm: &Vm) -> Result<ProjectVolume, RecreateError> {
        let filter = VolumeFilter::project_volume(&self.settings.owner, name);
        let volumes = self
            .run_step(
                RecreateStep::QueryVolume,
                self.deps.api.describe_volumes(&filter),
            )
            .await?;
        let volume = volumes
            .into_iter()
            .find(|volume| {
                !matches!(volume.state, VolumeState::Deleting | VolumeState::Deleted)
            })
            .ok_or_else(|| RecreateError::VolumeNotFound {
                vm_name: name.to_owned(),
            })?;

        match volume.attached_instance.as_deref() {
            Some(attached) if attached != vm.id => Err(RecreateError::VolumeConflict {
                volume_id: volume.volume_id.clone(),
                attached_to: attached.to_owned(),
                instance_id: vm.id.clone(),
            }),
            _ => Ok(volume),
        }
    }

    fn render_boot_config(
        &self,
        name: &str,
        volume: &ProjectVolume,
    ) -> Result<Vec<u8>, RecreateError> {
        let config = BootConfig {
            image_digest: self.settings.image_digest.clone(),
            delivery_url: self.settings.delivery_url.clone(),
            storage_id: volume.volume_id.clone(),
            device_path: self.settings.device_path.clone(),
            vm_name: name.to_owned(),
            idle_timeout_minutes: self.settings.idle_timeout_minutes,
            extra_script_base64: self.settings.extra_script_base64.clone(),
        };
        let payload = self.deps.renderer.render(&config);
        if payload.len() > MAX_BOOT_PAYLOAD_BYTES {
            return Err(RecreateError::Configuration {
                message: format!(
                    "boot configuration is {} bytes; the limit is {MAX_BOOT_PAYLOAD_BYTES} bytes (shorten the extra boot script)",
                    payload.len()
                ),
            });
        }
        Ok(payload)
    }

    async fn retire_instance<W: Write>(
        &self,
        vm: &Vm,
        volume: &ProjectVolume,
        out: &mut W,
    ) -> Result<(), RecreateError> {
        let api = &self.deps.api;
        self.run_step(RecreateStep::StopInstance, api.stop_instance(&vm.id))
            .await?;
        progress(out, 7, format_args!("stop requested for {}", vm.id));

        if volume.attached_instance.is_some() {
            self.run_step(
                RecreateStep::DetachVolume,
                api.detach_volume(&volume.volume_id, &vm.id, true),
            )
            .await?;
            progress(
                out,
                7,
                format_args!("force-detached {}", volume.volume_id),
            );
        }

        self.run_step(
            RecreateStep::TerminateInstance,
            api.terminate_instance(&vm.id),
        )
        .await?;
        progress(out, 7, format_args!("terminate requested for {}", vm.id));
        tracing::info!(instance = %vm.id, "old instance retired");
        Ok(())
    }

    async fn launch_replacement<W: Write>(
        &self,
        vm: &Vm,
        volume: &ProjectVolume,
        instance_type: String,
        user_data: Vec<u8>,
        out: &mut W,
    ) -> Result<Vm, RecreateError> {
        let api = &self.deps.api;
        let zone = volume.availability_zone.as_str();

        let query = ImageQuery {
            owner: self.settings.image_owner.clone(),
            name_pattern: self.settings.image_name_pattern.clone(),
            architecture: architecture_for(&instance_type).to_owned(),
        };
        let images = self
            .run_step(RecreateStep::ResolveImage, api.describe_images(&query))
            .await?;
        let image = launch::newest_image(images).ok_or_else(|| {
            RecreateError::step(
                RecreateStep::ResolveImage,
                CloudError::NotFound {
                    resource: format!(
                        "{} image matching '{}'",
                        query.architecture, query.name_pattern
                    ),
                },
            )
        })?;

        let mut group_names = vec![format!("berth-{}", self.settings.owner)];
        group_names.extend(self.settings.shared_security_group.iter().cloned());
        let groups = self
            .run_step(
                RecreateStep::ResolveSecurityGroups,
                api.describe_security_groups(&group_names),
            )
            .await?;
        let security_group_ids = launch::security_group_ids(&group_names, &groups)
            .map_err(|err| RecreateError::step(RecreateStep::ResolveSecurityGroups, err))?;

        let subnets = self
            .run_step(RecreateStep::ResolveSubnet, api.describe_subnets(zone))
            .await?;
        let subnet = launch::default_subnet(subnets, zone)
            .map_err(|err| RecreateError::step(RecreateStep::ResolveSubnet, err))?;

        let owner_arn = self
            .settings
            .owner_arn
            .as_deref()
            .or(vm.owner_arn.as_deref());
        let request = LaunchRequest {
            image_id: image.image_id,
            instance_type,
            availability_zone: zone.to_owned(),
            subnet_id: subnet.subnet_id,
            security_group_ids,
            user_data,
            tags: launch::launch_tags(&self.settings.owner, owner_arn, &vm.name),
            client_token: uuid::Uuid::new_v4().to_string(),
        };
        let launched = self
            .run_step(RecreateStep::LaunchInstance, api.run_instance(&request))
            .await?;
        progress(
            out,
            8,
            format_args!(
                "launched {} ({}) from {}",
                launched.id, request.instance_type, request.image_id
            ),
        );

        let running = self
            .run_step(
                RecreateStep::WaitInstanceRunning,
                wait::wait_for_instance_running(api, &launched.id, self.settings.wait),
            )
            .await?;
        progress(out, 8, format_args!("{} is running", running.id));

        self.run_step(
            RecreateStep::WaitVolumeAvailable,
            wait::wait_for_volume_available(api, &volume.volume_id, self.settings.wait),
        )
        .await?;
        progress(out, 8, format_args!("{} is available", volume.volume_id));
        Ok(running)
    }

    async fn reattach<W>(
        &self,
        trusted: &TrustedRunner<'_, R, S, H>,
        name: &str,
        volume: &ProjectVolume,
        launched: &Vm,
        out: &mut W,
        warnings: &mut Vec<String>,
    ) -> Result<String, RecreateError>
    where
        W: Write,
    {
        let api = &self.deps.api;
        self.run_step(
            RecreateStep::AttachVolume,
            api.attach_volume(
                &volume.volume_id,
                &launched.id,
                &self.settings.device_path,
            ),
        )
        .await?;
        progress(
            out,
            9,
            format_args!(
                "attached {} to {} at {}",
                volume.volume_id, launched.id, self.settings.device_path
            ),
        );

        self.checkpoint(RecreateStep::ClearPendingAttach)?;
        if let Err(err) = api
            .untag_resource(&volume.volume_id, &[TAG_PENDING_ATTACH])
            .await
        {
            warn(
                out,
                warnings,
                format!(
                    "could not clear {TAG_PENDING_ATTACH} on {}: {err}",
                    volume.volume_id
                ),
            );
        }

        let filter = AddressFilter {
            owner: self.settings.owner.clone(),
            name: name.to_owned(),
        };
        let step = RecreateStep::ReassociateAddress;
        let addresses = self
            .run_step(step, api.describe_addresses(&filter))
            .await?;
        let Some(address) = addresses.into_iter().next() else {
            return Err(RecreateError::AddressNotFound {
                vm_name: name.to_owned(),
                instance_id: launched.id.clone(),
            });
        };
        self.run_step(
            step,
            reattach::reassociate_address(api, &address, &launched.id),
        )
        .await?;
        progress(
            out,
            9,
            format_args!("{} now points at {}", address.public_ip, launched.id),
        );

        self.checkpoint(RecreateStep::ForgetHostKey)?;
        self.deps
            .host_keys
            .forget(name)
            .map_err(|err| RecreateError::step(RecreateStep::ForgetHostKey, err))?;
        trusted.reset();
        progress(out, 9, "forgot the old host key");

        self.run_step(
            RecreateStep::PollBootstrap,
            self.deps
                .poller
                .poll(&self.settings.owner, name, &launched.id),
        )
        .await?;
        progress(out, 9, "bootstrap complete");

        Ok(address.public_ip)
    }

    fn checkpoint(&self, step: RecreateStep) -> Result<(), RecreateError> {
        if self.cancel.is_cancelled() {
            return Err(RecreateError::Cancelled { step });
        }
        Ok(())
    }

    /// Races `work` against cancellation, starting only if not yet cancelled.
    async fn guarded<T, F>(&self, step: RecreateStep, work: F) -> Result<T, RecreateError>
    where
        F: Future<Output = Result<T, RecreateError>>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(RecreateError::Cancelled { step }),
            result = work => result,
        }
    }

    async fn run_step<T, E, F>(&self, step: RecreateStep, work: F) -> Result<T, RecreateError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<StepSource>,
    {
        self.guarded(step, async move {
            work.await.map_err(|err| RecreateError::step(step, err))
        })
        .await
    }
}

fn progress(out: &mut impl Write, step: u8, message: impl Display) {
    writeln!(out, "[{step}/{TOTAL_STEPS}] {message}").ok();
}

fn warn(out: &mut impl Write, warnings: &mut Vec<String>, message: String) {
    tracing::warn!("{message}");
    writeln!(out, "warning: {message}").ok();
    warnings.push(message);
}
