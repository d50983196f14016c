//! Test support utilities shared across unit and integration tests.
//!
//! Every double here is cheap to clone and shares its state between clones,
//! so a test can hand one copy to the code under test and inspect another.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::future::ready;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};

use tokio::sync::{Mutex, MutexGuard};

use crate::cloud::{
    AddressFilter, AssociateAddress, AttachVolume, BootstrapState, CloudError, CloudFuture,
    DescribeAddresses, DescribeImages, DescribeInstances, DescribeSecurityGroups,
    DescribeSubnets, DescribeVolumes, DetachVolume, DisassociateAddress, ElasticAddress,
    ImageQuery, InstanceFilter, KeyPush, KeyPushRequest, LaunchRequest, MachineImage,
    ProjectVolume, RunInstance, SecurityGroup, StopInstance, Subnet, TAG_NAME, TAG_OWNER,
    TAG_OWNER_ARN, TAG_PENDING_ATTACH, Tag, TagResource, TerminateInstance, UntagResource, Vm,
    VmState, VolumeFilter, VolumeState,
};
use crate::command::RemoteCommand;
use crate::exec::{CommandOutput, CommandRunner, ExecError};
use crate::remote::{RemoteError, RemoteFuture, RemoteRunner, RemoteTarget};
use crate::trust::{HostKeyScanner, HostKeyStore, HostKeyStoreError, ScanError, ScannedHostKey};

fn lock<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<StdMutex<VecDeque<CommandOutput>>>,
    invocations: Arc<StdMutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status with no output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ExecError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| ExecError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// In-memory [`HostKeyStore`].
#[derive(Clone, Debug, Default)]
pub struct MemoryHostKeyStore {
    entries: Arc<StdMutex<BTreeMap<String, String>>>,
    failure: Arc<StdMutex<Option<HostKeyStoreError>>>,
}

impl MemoryHostKeyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins `fingerprint` for `vm_name`.
    #[must_use]
    pub fn with_entry(self, vm_name: &str, fingerprint: &str) -> Self {
        lock(&self.entries).insert(vm_name.to_owned(), fingerprint.to_owned());
        self
    }

    /// Makes every later call fail with `error`.
    pub fn fail_with(&self, error: HostKeyStoreError) {
        *lock(&self.failure) = Some(error);
    }

    /// Returns a snapshot of the pinned fingerprints.
    #[must_use]
    pub fn entries(&self) -> BTreeMap<String, String> {
        lock(&self.entries).clone()
    }

    fn check(&self) -> Result<(), HostKeyStoreError> {
        lock(&self.failure).clone().map_or(Ok(()), Err)
    }
}

impl HostKeyStore for MemoryHostKeyStore {
    fn fingerprint(&self, vm_name: &str) -> Result<Option<String>, HostKeyStoreError> {
        self.check()?;
        Ok(lock(&self.entries).get(vm_name).cloned())
    }

    fn record(&self, vm_name: &str, fingerprint: &str) -> Result<(), HostKeyStoreError> {
        self.check()?;
        lock(&self.entries).insert(vm_name.to_owned(), fingerprint.to_owned());
        Ok(())
    }

    fn forget(&self, vm_name: &str) -> Result<bool, HostKeyStoreError> {
        self.check()?;
        Ok(lock(&self.entries).remove(vm_name).is_some())
    }
}

/// [`HostKeyScanner`] returning a fixed fingerprint or failure.
#[derive(Clone, Debug)]
pub struct FakeScanner {
    answer: Arc<StdMutex<Result<String, String>>>,
    scans: Arc<StdMutex<usize>>,
}

impl FakeScanner {
    /// Creates a scanner that reports `fingerprint` for every host.
    #[must_use]
    pub fn new(fingerprint: &str) -> Self {
        Self {
            answer: Arc::new(StdMutex::new(Ok(fingerprint.to_owned()))),
            scans: Arc::new(StdMutex::new(0)),
        }
    }

    /// Creates a scanner whose scans fail with `message`.
    #[must_use]
    pub fn failing(message: &str) -> Self {
        Self {
            answer: Arc::new(StdMutex::new(Err(message.to_owned()))),
            scans: Arc::new(StdMutex::new(0)),
        }
    }

    /// Changes the fingerprint reported from now on.
    pub fn set_fingerprint(&self, fingerprint: &str) {
        *lock(&self.answer) = Ok(fingerprint.to_owned());
    }

    /// Returns how many scans were performed.
    #[must_use]
    pub fn scan_count(&self) -> usize {
        *lock(&self.scans)
    }
}

impl HostKeyScanner for FakeScanner {
    fn scan(&self, _host: &str, _port: u16) -> Result<ScannedHostKey, ScanError> {
        *lock(&self.scans) += 1;
        match &*lock(&self.answer) {
            Ok(fingerprint) => Ok(ScannedHostKey {
                fingerprint: fingerprint.clone(),
                public_key: String::from("ssh-ed25519 AAAAfake"),
            }),
            Err(message) => Err(ScanError::new(message.clone())),
        }
    }
}

/// Canned answer for [`ScriptedRemote`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RemoteReply {
    /// Succeed with the given stdout.
    Stdout(String),
    /// Fail at the transport layer.
    Transport(String),
    /// Exit with a non-zero status.
    Failed {
        /// Exit status.
        code: i32,
        /// Captured stderr.
        stderr: String,
    },
}

impl RemoteReply {
    /// Builds a successful reply.
    #[must_use]
    pub fn stdout(text: &str) -> Self {
        Self::Stdout(text.to_owned())
    }

    /// Builds a transport failure.
    #[must_use]
    pub fn transport(message: &str) -> Self {
        Self::Transport(message.to_owned())
    }

    /// Builds a command failure.
    #[must_use]
    pub fn failed(code: i32, stderr: &str) -> Self {
        Self::Failed {
            code,
            stderr: stderr.to_owned(),
        }
    }

    fn to_result(&self, host: &str) -> Result<String, RemoteError> {
        match self {
            Self::Stdout(text) => Ok(text.clone()),
            Self::Transport(message) => Err(RemoteError::Transport {
                host: host.to_owned(),
                message: message.clone(),
            }),
            Self::Failed { code, stderr } => Err(RemoteError::CommandFailed {
                code: *code,
                stderr: stderr.clone(),
            }),
        }
    }
}

/// [`RemoteRunner`] answering by substring match on the script.
///
/// Scripts with no matching rule succeed with empty stdout.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRemote {
    rules: Arc<StdMutex<Vec<(String, RemoteReply)>>>,
    calls: Arc<StdMutex<Vec<String>>>,
    host_keys: Arc<StdMutex<Vec<Option<String>>>>,
}

impl ScriptedRemote {
    /// Creates a runner with no rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers every script containing `pattern` with `reply`.
    ///
    /// Earlier rules win.
    pub fn reply_to(&self, pattern: &str, reply: RemoteReply) {
        lock(&self.rules).push((pattern.to_owned(), reply));
    }

    /// Returns the scripts run so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Returns how many scripts were run.
    #[must_use]
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Returns the host key each call's target was pinned to.
    #[must_use]
    pub fn host_keys(&self) -> Vec<Option<String>> {
        lock(&self.host_keys).clone()
    }
}

impl RemoteRunner for ScriptedRemote {
    fn run<'a>(
        &'a self,
        target: &'a RemoteTarget,
        command: &'a RemoteCommand,
    ) -> RemoteFuture<'a, String> {
        let script = command.script();
        lock(&self.calls).push(script.to_owned());
        lock(&self.host_keys).push(target.host_key.clone());
        let outcome = lock(&self.rules)
            .iter()
            .find(|(pattern, _)| script.contains(pattern.as_str()))
            .map_or_else(|| Ok(String::new()), |(_, reply)| reply.to_result(&target.host));
        Box::pin(ready(outcome))
    }
}

#[derive(Debug)]
struct OwnedVolume {
    owner: String,
    volume: ProjectVolume,
}

#[derive(Debug)]
struct OwnedAddress {
    owner: String,
    name: String,
    address: ElasticAddress,
}

#[derive(Debug)]
struct CloudState {
    instances: Vec<Vm>,
    volumes: Vec<OwnedVolume>,
    addresses: Vec<OwnedAddress>,
    subnets: Vec<Subnet>,
    groups: Vec<SecurityGroup>,
    images: Vec<(String, MachineImage)>,
    pushed_keys: Vec<KeyPushRequest>,
    key_push_rejection: Option<String>,
    failures: BTreeMap<String, CloudError>,
    calls: Vec<String>,
    launches: Vec<LaunchRequest>,
    launch_state: VmState,
    launch_bootstrap: BootstrapState,
    next_association: usize,
}

impl Default for CloudState {
    fn default() -> Self {
        Self {
            instances: Vec::new(),
            volumes: Vec::new(),
            addresses: Vec::new(),
            subnets: Vec::new(),
            groups: Vec::new(),
            images: Vec::new(),
            pushed_keys: Vec::new(),
            key_push_rejection: None,
            failures: BTreeMap::new(),
            calls: Vec::new(),
            launches: Vec::new(),
            launch_state: VmState::Running,
            launch_bootstrap: BootstrapState::Complete,
            next_association: 2,
        }
    }
}

impl CloudState {
    fn enter(&mut self, verb: &str, detail: &str) -> Result<(), CloudError> {
        self.calls.push(if detail.is_empty() {
            verb.to_owned()
        } else {
            format!("{verb} {detail}")
        });
        self.failures.get(verb).cloned().map_or(Ok(()), Err)
    }

    fn instance_mut(&mut self, instance_id: &str) -> Result<&mut Vm, CloudError> {
        self.instances
            .iter_mut()
            .find(|vm| vm.id == instance_id)
            .ok_or_else(|| CloudError::NotFound {
                resource: format!("instance {instance_id}"),
            })
    }

    fn volume_mut(&mut self, volume_id: &str) -> Result<&mut ProjectVolume, CloudError> {
        self.volumes
            .iter_mut()
            .map(|owned| &mut owned.volume)
            .find(|volume| volume.volume_id == volume_id)
            .ok_or_else(|| CloudError::NotFound {
                resource: format!("volume {volume_id}"),
            })
    }
}

/// In-memory cloud implementing every resource verb.
///
/// Calls are recorded as `"<aws operation> <main argument>"` strings and any
/// operation can be made to fail with [`FakeCloud::fail_on`]. Launched
/// instances are named `i-new`, `i-new-2` and so on.
#[derive(Clone, Debug, Default)]
pub struct FakeCloud {
    state: Arc<StdMutex<CloudState>>,
}

impl FakeCloud {
    /// Creates an empty cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cloud holding one healthy running VM.
    ///
    /// The VM runs as `i-old` in `us-east-1a` behind `203.0.113.10`
    /// (allocation `eipalloc-1`, association `eipassoc-1`). Its project
    /// volume `vol-1` lives in `us-east-1b`, which has default subnet
    /// `subnet-b`. Security groups `berth-<owner>` and `berth-shared` exist,
    /// as do x86 images `ami-old` and `ami-new` and arm image `ami-arm`.
    #[must_use]
    pub fn seeded(owner: &str, name: &str) -> Self {
        let cloud = Self::new();
        {
            let mut state = lock(&cloud.state);
            state.instances.push(Vm {
                id: String::from("i-old"),
                name: name.to_owned(),
                owner_tag: owner.to_owned(),
                owner_arn: Some(format!("arn:aws:iam::123456789012:user/{owner}")),
                state: VmState::Running,
                availability_zone: String::from("us-east-1a"),
                public_ip: Some(String::from("203.0.113.10")),
                instance_type: String::from("t3.large"),
                bootstrap: Some(BootstrapState::Complete),
                health: Some(String::from("ok")),
            });
            state.volumes.push(OwnedVolume {
                owner: owner.to_owned(),
                volume: ProjectVolume {
                    volume_id: String::from("vol-1"),
                    vm_name: name.to_owned(),
                    availability_zone: String::from("us-east-1b"),
                    size_gb: 100,
                    state: VolumeState::InUse,
                    attached_instance: Some(String::from("i-old")),
                    pending_attach: false,
                },
            });
            state.addresses.push(OwnedAddress {
                owner: owner.to_owned(),
                name: name.to_owned(),
                address: ElasticAddress {
                    allocation_id: String::from("eipalloc-1"),
                    public_ip: String::from("203.0.113.10"),
                    association_id: Some(String::from("eipassoc-1")),
                    instance_id: Some(String::from("i-old")),
                },
            });
            state.subnets.extend([
                Subnet {
                    subnet_id: String::from("subnet-a"),
                    availability_zone: String::from("us-east-1a"),
                    default_for_zone: true,
                },
                Subnet {
                    subnet_id: String::from("subnet-b"),
                    availability_zone: String::from("us-east-1b"),
                    default_for_zone: true,
                },
            ]);
            state.groups.extend([
                SecurityGroup {
                    group_id: String::from("sg-owner"),
                    name: format!("berth-{owner}"),
                },
                SecurityGroup {
                    group_id: String::from("sg-shared"),
                    name: String::from("berth-shared"),
                },
            ]);
            let image = |id: &str, date: &str| MachineImage {
                image_id: id.to_owned(),
                name: format!("berth-dev-{id}"),
                creation_date: date.to_owned(),
            };
            state.images.extend([
                (
                    String::from("x86_64"),
                    image("ami-old", "2026-01-01T00:00:00.000Z"),
                ),
                (
                    String::from("x86_64"),
                    image("ami-new", "2026-09-01T00:00:00.000Z"),
                ),
                (
                    String::from("arm64"),
                    image("ami-arm", "2026-08-01T00:00:00.000Z"),
                ),
            ]);
        }
        cloud
    }

    /// Makes every call to the AWS operation `verb` fail with `error`.
    pub fn fail_on(&self, verb: &str, error: CloudError) {
        lock(&self.state).failures.insert(verb.to_owned(), error);
    }

    /// Makes key pushes fail with a provider error carrying `message`.
    pub fn reject_key_push(&self, message: &str) {
        lock(&self.state).key_push_rejection = Some(message.to_owned());
    }

    /// Sets the bootstrap tag of `instance_id`.
    pub fn set_bootstrap(&self, instance_id: &str, bootstrap: BootstrapState) {
        if let Some(vm) = lock(&self.state)
            .instances
            .iter_mut()
            .find(|vm| vm.id == instance_id)
        {
            vm.bootstrap = Some(bootstrap);
        }
    }

    /// Sets the health tag of `instance_id`.
    pub fn set_health(&self, instance_id: &str, health: &str) {
        if let Some(vm) = lock(&self.state)
            .instances
            .iter_mut()
            .find(|vm| vm.id == instance_id)
        {
            vm.health = Some(health.to_owned());
        }
    }

    /// Sets the lifecycle state of `instance_id`.
    pub fn set_state(&self, instance_id: &str, state: VmState) {
        if let Some(vm) = lock(&self.state)
            .instances
            .iter_mut()
            .find(|vm| vm.id == instance_id)
        {
            vm.state = state;
        }
    }

    /// Controls the state and bootstrap tag given to launched instances.
    pub fn launch_as(&self, state: VmState, bootstrap: BootstrapState) {
        let mut guard = lock(&self.state);
        guard.launch_state = state;
        guard.launch_bootstrap = bootstrap;
    }

    /// Removes every elastic address.
    pub fn remove_addresses(&self) {
        lock(&self.state).addresses.clear();
    }

    /// Overwrites the association of `allocation_id`, leaving it unbound
    /// when `association_id` is `None`.
    pub fn set_association(&self, allocation_id: &str, association_id: Option<&str>) {
        if let Some(owned) = lock(&self.state)
            .addresses
            .iter_mut()
            .find(|owned| owned.address.allocation_id == allocation_id)
        {
            owned.address.association_id = association_id.map(ToOwned::to_owned);
            if association_id.is_none() {
                owned.address.instance_id = None;
            }
        }
    }

    /// Removes every project volume.
    pub fn remove_volumes(&self) {
        lock(&self.state).volumes.clear();
    }

    /// Sets the pending-attach marker on `volume_id` directly.
    pub fn mark_pending(&self, volume_id: &str) {
        if let Ok(volume) = lock(&self.state).volume_mut(volume_id) {
            volume.pending_attach = true;
        }
    }

    /// Adds a project volume owned by `owner`.
    pub fn add_volume(&self, owner: &str, volume: ProjectVolume) {
        lock(&self.state).volumes.push(OwnedVolume {
            owner: owner.to_owned(),
            volume,
        });
    }

    /// Returns the recorded operation log.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Returns the recorded calls whose operation is `verb`.
    #[must_use]
    pub fn calls_to(&self, verb: &str) -> Vec<String> {
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| call.split(' ').next() == Some(verb))
            .cloned()
            .collect()
    }

    /// Returns every key pushed so far.
    #[must_use]
    pub fn pushed_keys(&self) -> Vec<KeyPushRequest> {
        lock(&self.state).pushed_keys.clone()
    }

    /// Returns the current description of `instance_id`.
    #[must_use]
    pub fn instance(&self, instance_id: &str) -> Option<Vm> {
        lock(&self.state)
            .instances
            .iter()
            .find(|vm| vm.id == instance_id)
            .cloned()
    }

    /// Returns the current description of `volume_id`.
    #[must_use]
    pub fn volume(&self, volume_id: &str) -> Option<ProjectVolume> {
        lock(&self.state)
            .volumes
            .iter()
            .map(|owned| &owned.volume)
            .find(|volume| volume.volume_id == volume_id)
            .cloned()
    }

    /// Returns the address with `allocation_id`.
    #[must_use]
    pub fn address(&self, allocation_id: &str) -> Option<ElasticAddress> {
        lock(&self.state)
            .addresses
            .iter()
            .map(|owned| &owned.address)
            .find(|address| address.allocation_id == allocation_id)
            .cloned()
    }

    /// Returns the most recent launch request.
    #[must_use]
    pub fn last_launch(&self) -> Option<LaunchRequest> {
        lock(&self.state).launches.last().cloned()
    }

    fn with_state<T>(
        &self,
        verb: &str,
        detail: &str,
        action: impl FnOnce(&mut CloudState) -> Result<T, CloudError>,
    ) -> Result<T, CloudError> {
        let mut state = lock(&self.state);
        state.enter(verb, detail)?;
        action(&mut state)
    }
}

fn tag_value<'t>(tags: &'t [Tag], key: &str) -> Option<&'t str> {
    tags.iter()
        .find(|tag| tag.key == key)
        .map(|tag| tag.value.as_str())
}

impl DescribeInstances for FakeCloud {
    fn describe_instances<'a>(&'a self, filter: &'a InstanceFilter) -> CloudFuture<'a, Vec<Vm>> {
        Box::pin(async move {
            self.with_state("describe-instances", "", |state| {
                Ok(state
                    .instances
                    .iter()
                    .filter(|vm| filter.owner.as_ref().is_none_or(|owner| &vm.owner_tag == owner))
                    .filter(|vm| filter.name.as_ref().is_none_or(|name| &vm.name == name))
                    .filter(|vm| filter.instance_id.as_ref().is_none_or(|id| &vm.id == id))
                    .cloned()
                    .collect())
            })
        })
    }
}

impl StopInstance for FakeCloud {
    fn stop_instance<'a>(&'a self, instance_id: &'a str) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            self.with_state("stop-instances", instance_id, |state| {
                state.instance_mut(instance_id)?.state = VmState::Stopped;
                Ok(())
            })
        })
    }
}

impl TerminateInstance for FakeCloud {
    fn terminate_instance<'a>(&'a self, instance_id: &'a str) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            self.with_state("terminate-instances", instance_id, |state| {
                state.instance_mut(instance_id)?.state = VmState::Terminated;
                Ok(())
            })
        })
    }
}

impl RunInstance for FakeCloud {
    fn run_instance<'a>(&'a self, request: &'a LaunchRequest) -> CloudFuture<'a, Vm> {
        Box::pin(async move {
            self.with_state("run-instances", &request.image_id, |state| {
                state.launches.push(request.clone());
                let id = match state.launches.len() {
                    1 => String::from("i-new"),
                    count => format!("i-new-{count}"),
                };
                let vm = Vm {
                    id,
                    name: tag_value(&request.tags, TAG_NAME)
                        .unwrap_or_default()
                        .to_owned(),
                    owner_tag: tag_value(&request.tags, TAG_OWNER)
                        .unwrap_or_default()
                        .to_owned(),
                    owner_arn: tag_value(&request.tags, TAG_OWNER_ARN).map(str::to_owned),
                    state: state.launch_state,
                    availability_zone: request.availability_zone.clone(),
                    public_ip: None,
                    instance_type: request.instance_type.clone(),
                    bootstrap: Some(state.launch_bootstrap),
                    health: None,
                };
                state.instances.push(vm.clone());
                Ok(Vm {
                    state: VmState::Pending,
                    ..vm
                })
            })
        })
    }
}

impl AttachVolume for FakeCloud {
    fn attach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
        _device: &'a str,
    ) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            self.with_state("attach-volume", volume_id, |state| {
                state.instance_mut(instance_id)?;
                let volume = state.volume_mut(volume_id)?;
                if volume.state != VolumeState::Available {
                    return Err(CloudError::Api {
                        operation: String::from("attach-volume"),
                        message: format!("volume {volume_id} is {}", volume.state),
                    });
                }
                volume.state = VolumeState::InUse;
                volume.attached_instance = Some(instance_id.to_owned());
                Ok(())
            })
        })
    }
}

impl DetachVolume for FakeCloud {
    fn detach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        _instance_id: &'a str,
        _force: bool,
    ) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            self.with_state("detach-volume", volume_id, |state| {
                let volume = state.volume_mut(volume_id)?;
                volume.state = VolumeState::Available;
                volume.attached_instance = None;
                Ok(())
            })
        })
    }
}

impl TagResource for FakeCloud {
    fn tag_resource<'a>(&'a self, resource_id: &'a str, tags: &'a [Tag]) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            self.with_state("create-tags", resource_id, |state| {
                if tags.iter().any(|tag| tag.key == TAG_PENDING_ATTACH) {
                    state.volume_mut(resource_id)?.pending_attach = true;
                }
                Ok(())
            })
        })
    }
}

impl UntagResource for FakeCloud {
    fn untag_resource<'a>(
        &'a self,
        resource_id: &'a str,
        keys: &'a [&'a str],
    ) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            self.with_state("delete-tags", resource_id, |state| {
                if keys.contains(&TAG_PENDING_ATTACH) {
                    state.volume_mut(resource_id)?.pending_attach = false;
                }
                Ok(())
            })
        })
    }
}

impl DescribeVolumes for FakeCloud {
    fn describe_volumes<'a>(
        &'a self,
        filter: &'a VolumeFilter,
    ) -> CloudFuture<'a, Vec<ProjectVolume>> {
        Box::pin(async move {
            self.with_state("describe-volumes", "", |state| {
                Ok(state
                    .volumes
                    .iter()
                    .filter(|owned| filter.owner.as_ref().is_none_or(|owner| &owned.owner == owner))
                    .map(|owned| &owned.volume)
                    .filter(|volume| filter.name.as_ref().is_none_or(|name| &volume.vm_name == name))
                    .filter(|volume| {
                        filter
                            .volume_id
                            .as_ref()
                            .is_none_or(|id| &volume.volume_id == id)
                    })
                    .filter(|volume| !filter.pending_attach_only || volume.pending_attach)
                    .cloned()
                    .collect())
            })
        })
    }
}

impl DescribeAddresses for FakeCloud {
    fn describe_addresses<'a>(
        &'a self,
        filter: &'a AddressFilter,
    ) -> CloudFuture<'a, Vec<ElasticAddress>> {
        Box::pin(async move {
            self.with_state("describe-addresses", "", |state| {
                Ok(state
                    .addresses
                    .iter()
                    .filter(|owned| owned.owner == filter.owner && owned.name == filter.name)
                    .map(|owned| owned.address.clone())
                    .collect())
            })
        })
    }
}

impl AssociateAddress for FakeCloud {
    fn associate_address<'a>(
        &'a self,
        allocation_id: &'a str,
        instance_id: &'a str,
    ) -> CloudFuture<'a, String> {
        Box::pin(async move {
            self.with_state("associate-address", allocation_id, |state| {
                let association_id = format!("eipassoc-{}", state.next_association);
                state.next_association += 1;
                let owned = state
                    .addresses
                    .iter_mut()
                    .find(|owned| owned.address.allocation_id == allocation_id)
                    .ok_or_else(|| CloudError::NotFound {
                        resource: format!("address {allocation_id}"),
                    })?;
                owned.address.association_id = Some(association_id.clone());
                owned.address.instance_id = Some(instance_id.to_owned());
                let public_ip = owned.address.public_ip.clone();
                state.instance_mut(instance_id)?.public_ip = Some(public_ip);
                Ok(association_id)
            })
        })
    }
}

impl DisassociateAddress for FakeCloud {
    fn disassociate_address<'a>(&'a self, association_id: &'a str) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            self.with_state("disassociate-address", association_id, |state| {
                let owned = state
                    .addresses
                    .iter_mut()
                    .find(|owned| owned.address.association_id.as_deref() == Some(association_id))
                    .ok_or_else(|| CloudError::NotFound {
                        resource: format!("association {association_id}"),
                    })?;
                owned.address.association_id = None;
                owned.address.instance_id = None;
                Ok(())
            })
        })
    }
}

impl DescribeSubnets for FakeCloud {
    fn describe_subnets<'a>(
        &'a self,
        availability_zone: &'a str,
    ) -> CloudFuture<'a, Vec<Subnet>> {
        Box::pin(async move {
            self.with_state("describe-subnets", availability_zone, |state| {
                Ok(state
                    .subnets
                    .iter()
                    .filter(|subnet| subnet.availability_zone == availability_zone)
                    .cloned()
                    .collect())
            })
        })
    }
}

impl DescribeSecurityGroups for FakeCloud {
    fn describe_security_groups<'a>(
        &'a self,
        names: &'a [String],
    ) -> CloudFuture<'a, Vec<SecurityGroup>> {
        Box::pin(async move {
            self.with_state("describe-security-groups", "", |state| {
                Ok(state
                    .groups
                    .iter()
                    .filter(|group| names.contains(&group.name))
                    .cloned()
                    .collect())
            })
        })
    }
}

impl DescribeImages for FakeCloud {
    fn describe_images<'a>(&'a self, query: &'a ImageQuery) -> CloudFuture<'a, Vec<MachineImage>> {
        Box::pin(async move {
            self.with_state("describe-images", &query.architecture, |state| {
                Ok(state
                    .images
                    .iter()
                    .filter(|(architecture, _)| architecture == &query.architecture)
                    .map(|(_, image)| image.clone())
                    .collect())
            })
        })
    }
}

impl KeyPush for FakeCloud {
    fn push_key<'a>(&'a self, request: &'a KeyPushRequest) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            self.with_state("send-ssh-public-key", &request.instance_id, |state| {
                if let Some(message) = &state.key_push_rejection {
                    return Err(CloudError::Api {
                        operation: String::from("send-ssh-public-key"),
                        message: message.clone(),
                    });
                }
                state.pushed_keys.push(request.clone());
                Ok(())
            })
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
