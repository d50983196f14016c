//! Shared fixtures for recreate BDD scenarios.

use std::time::Duration;

use berth::recreate::{
    ErrorKind, RecreateRequest, RecreateSettings, RecreateStep, WaitBounds,
    default_instance_type_policy,
};
use berth::test_support::{FakeCloud, FakeScanner, MemoryHostKeyStore, ScriptedRemote};
use rstest::fixture;

/// Cloud operations that change resource state.
pub const MUTATING_VERBS: [&str; 9] = [
    "create-tags",
    "stop-instances",
    "detach-volume",
    "terminate-instances",
    "run-instances",
    "attach-volume",
    "delete-tags",
    "disassociate-address",
    "associate-address",
];

pub const SEEDED_FINGERPRINT: &str = "SHA256:seeded";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecreateFailure {
    pub kind: ErrorKind,
    pub step: Option<RecreateStep>,
    pub message: String,
}

#[derive(Clone, Debug)]
pub enum RecreateResult {
    Success { warnings: Vec<String> },
    Failure(RecreateFailure),
}

#[derive(Clone, Debug)]
pub struct RecreateContext {
    pub owner: String,
    pub cloud: FakeCloud,
    pub remote: ScriptedRemote,
    pub scanner: FakeScanner,
    pub host_keys: MemoryHostKeyStore,
    pub request: RecreateRequest,
    pub typed: String,
    pub outcome: Option<RecreateResult>,
}

impl RecreateContext {
    pub fn mutations(&self) -> Vec<String> {
        self.cloud
            .calls()
            .into_iter()
            .filter(|call| {
                MUTATING_VERBS
                    .iter()
                    .any(|verb| call.split(' ').next() == Some(*verb))
            })
            .collect()
    }
}

#[fixture]
pub fn recreate_context() -> RecreateContext {
    RecreateContext {
        owner: String::new(),
        cloud: FakeCloud::new(),
        remote: ScriptedRemote::new(),
        scanner: FakeScanner::new(SEEDED_FINGERPRINT),
        host_keys: MemoryHostKeyStore::new(),
        request: RecreateRequest {
            vm_name: String::new(),
            force: false,
            assume_yes: false,
        },
        typed: String::new(),
        outcome: None,
    }
}

pub fn settings(owner: &str) -> RecreateSettings {
    RecreateSettings {
        owner: owner.to_owned(),
        owner_arn: None,
        ssh_user: String::from("ubuntu"),
        ssh_port: 22,
        device_path: String::from("/dev/sdf"),
        shared_security_group: Some(String::from("berth-shared")),
        image_owner: String::from("self"),
        image_name_pattern: String::from("berth-dev-*"),
        instance_type: None,
        instance_type_policy: default_instance_type_policy,
        delivery_url: String::from("https://example.invalid/agent"),
        image_digest: String::from("sha256:feed"),
        idle_timeout_minutes: 30,
        extra_script_base64: None,
        wait: WaitBounds {
            timeout: Duration::from_millis(200),
            interval: Duration::from_millis(1),
        },
    }
}

pub fn parse_kind(kind: &str) -> Option<ErrorKind> {
    match kind {
        "not-found" => Some(ErrorKind::NotFound),
        "state-conflict" => Some(ErrorKind::StateConflict),
        "unconfirmed" => Some(ErrorKind::Unconfirmed),
        "sessions-active" => Some(ErrorKind::SessionsActive),
        "transport" => Some(ErrorKind::Transport),
        "trust-violation" => Some(ErrorKind::TrustViolation),
        "step-failure" => Some(ErrorKind::StepFailure),
        "configuration" => Some(ErrorKind::Configuration),
        "cancelled" => Some(ErrorKind::Cancelled),
        _ => None,
    }
}
