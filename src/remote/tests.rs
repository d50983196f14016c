//! Unit tests for the credentialed SSH runner.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::*;
use crate::command::read_if_present;
use crate::test_support::{FakeCloud, ScriptedRunner};
use camino::Utf8Path;
use rstest::{fixture, rstest};

#[fixture]
fn target() -> RemoteTarget {
    RemoteTarget {
        vm_name: String::from("default"),
        instance_id: String::from("i-0abc"),
        zone: String::from("us-east-1a"),
        host: String::from("203.0.113.10"),
        port: 2222,
        user: String::from("ubuntu"),
        host_key: None,
    }
}

fn keepalive_read() -> RemoteCommand {
    read_if_present(Utf8Path::new("/var/lib/berth/keepalive"))
}

/// Transport that records the identity path it was handed.
#[derive(Default)]
struct RecordingTransport {
    identities: Mutex<Vec<PathBuf>>,
}

impl RecordingTransport {
    fn calls(&self) -> Vec<PathBuf> {
        self.identities
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl SshTransport for RecordingTransport {
    fn exec(
        &self,
        _target: &RemoteTarget,
        identity: &Path,
        _command: &RemoteCommand,
    ) -> Result<String, RemoteError> {
        assert!(identity.exists(), "identity must exist during the call");
        self.identities
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(identity.to_path_buf());
        Ok(String::from("ok\n"))
    }
}

#[rstest]
fn ssh_args_pass_the_script_as_one_element(target: RemoteTarget) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "hello\n", "");
    let transport = ProcessSshTransport::new(runner.clone(), "ssh");

    let command = keepalive_read();
    let stdout = transport
        .exec(&target, Path::new("/tmp/key"), &command)
        .expect("exec should succeed");
    assert_eq!(stdout, "hello\n");

    let invocation = runner.invocations().remove(0);
    assert_eq!(invocation.program, "ssh");
    let last = invocation.args.last().expect("script argument");
    assert_eq!(last, command.script());
    let rendered = invocation.command_string();
    assert!(rendered.contains("-i /tmp/key -p 2222"), "{rendered}");
    assert!(rendered.contains("BatchMode=yes"), "{rendered}");
    assert!(rendered.contains("ubuntu@203.0.113.10 --"), "{rendered}");
}

#[rstest]
#[case::client_failure(Some(255))]
#[case::killed(None)]
fn client_failures_are_transport_errors(target: RemoteTarget, #[case] code: Option<i32>) {
    let runner = ScriptedRunner::new();
    runner.push_output(code, "", "ssh: connect to host 203.0.113.10 port 2222: Connection refused");
    let transport = ProcessSshTransport::new(runner, "ssh");

    let err = transport
        .exec(&target, Path::new("/tmp/key"), &keepalive_read())
        .expect_err("exec should fail");
    assert!(err.is_transport(), "{err:?}");
    assert!(err.to_string().contains("Connection refused"));
}

#[rstest]
fn remote_failures_carry_stderr(target: RemoteTarget) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(1), "", "grep: permission denied\n");
    let transport = ProcessSshTransport::new(runner, "ssh");

    let err = transport
        .exec(&target, Path::new("/tmp/key"), &keepalive_read())
        .expect_err("exec should fail");
    match err {
        RemoteError::CommandFailed { code, stderr } => {
            assert_eq!(code, 1);
            assert_eq!(stderr, "grep: permission denied");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

const HOST_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIPZyE2X3JyDzHolhUaF3Isz+4U8KLXQ/tGj15uTeBM67";

/// Runner that captures the `known_hosts` file ssh is pointed at while the
/// call is in flight.
#[derive(Clone, Default)]
struct KnownHostsCapture {
    seen: Arc<Mutex<Vec<(PathBuf, String)>>>,
}

impl KnownHostsCapture {
    fn seen(&self) -> Vec<(PathBuf, String)> {
        self.seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl CommandRunner for KnownHostsCapture {
    fn run(
        &self,
        _program: &str,
        args: &[OsString],
    ) -> Result<crate::exec::CommandOutput, crate::exec::ExecError> {
        let path = args
            .iter()
            .filter_map(|arg| arg.to_str())
            .find_map(|arg| arg.strip_prefix("UserKnownHostsFile="))
            .map(PathBuf::from)
            .expect("known_hosts option");
        let contents = std::fs::read_to_string(&path).unwrap_or_default();
        self.seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((path, contents));
        Ok(crate::exec::CommandOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

#[rstest]
fn pinned_targets_are_checked_strictly(target: RemoteTarget) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "", "");
    let transport = ProcessSshTransport::new(runner.clone(), "ssh");

    transport
        .exec(&target.pinned_to(HOST_KEY), Path::new("/tmp/key"), &keepalive_read())
        .expect("exec should succeed");

    let rendered = runner.invocations().remove(0).command_string();
    assert!(rendered.contains("StrictHostKeyChecking=yes"), "{rendered}");
    assert!(rendered.contains("UserKnownHostsFile="), "{rendered}");
    assert!(!rendered.contains("StrictHostKeyChecking=no"), "{rendered}");
    assert!(!rendered.contains("/dev/null"), "{rendered}");
}

#[rstest]
fn unpinned_targets_skip_client_checking(target: RemoteTarget) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "", "");
    let transport = ProcessSshTransport::new(runner.clone(), "ssh");

    transport
        .exec(&target, Path::new("/tmp/key"), &keepalive_read())
        .expect("exec should succeed");

    let rendered = runner.invocations().remove(0).command_string();
    assert!(rendered.contains("StrictHostKeyChecking=no"), "{rendered}");
    assert!(rendered.contains("UserKnownHostsFile=/dev/null"), "{rendered}");
}

#[rstest]
fn pinned_known_hosts_file_holds_only_the_verified_key(target: RemoteTarget) {
    let capture = KnownHostsCapture::default();
    let transport = ProcessSshTransport::new(capture.clone(), "ssh");

    transport
        .exec(&target.pinned_to(HOST_KEY), Path::new("/tmp/key"), &keepalive_read())
        .expect("exec should succeed");

    let seen = capture.seen();
    let (path, contents) = seen.first().expect("one call");
    assert_eq!(contents, &format!("[203.0.113.10]:2222 {HOST_KEY}\n"));
    assert!(!path.exists(), "known_hosts file must be removed after the call");
}

#[rstest]
#[case::default_port(22, "203.0.113.10 ssh-ed25519 AAAA\n")]
#[case::custom_port(2222, "[203.0.113.10]:2222 ssh-ed25519 AAAA\n")]
fn known_hosts_line_follows_openssh_host_patterns(
    target: RemoteTarget,
    #[case] port: u16,
    #[case] expected: &str,
) {
    let pinned = RemoteTarget { port, ..target }.pinned_to("ssh-ed25519 AAAA");
    assert_eq!(pinned.known_hosts_line().as_deref(), Some(expected));
}

#[rstest]
fn unpinned_targets_have_no_known_hosts_line(target: RemoteTarget) {
    assert_eq!(target.known_hosts_line(), None);
}

#[rstest]
#[tokio::test]
async fn credentialed_runner_pushes_then_runs_and_cleans_up(target: RemoteTarget) {
    let cloud = FakeCloud::new();
    let transport = RecordingTransport::default();
    let runner = CredentialedRunner::new(&cloud, &transport);

    let stdout = runner
        .run(&target, &keepalive_read())
        .await
        .expect("run should succeed");

    assert_eq!(stdout, "ok\n");
    assert_eq!(cloud.pushed_keys().len(), 1);
    let identities = transport.calls();
    assert_eq!(identities.len(), 1);
    let identity = identities.first().expect("one call");
    assert!(!identity.exists(), "private key must be removed after the run");
}

#[rstest]
#[tokio::test]
async fn rejected_key_push_skips_the_transport(target: RemoteTarget) {
    let cloud = FakeCloud::new();
    cloud.reject_key_push("instance is not running");
    let transport = RecordingTransport::default();
    let runner = CredentialedRunner::new(&cloud, &transport);

    let err = runner
        .run(&target, &keepalive_read())
        .await
        .expect_err("run should fail");

    assert!(
        matches!(
            err,
            RemoteError::Credential(CredentialError::KeyPushRejected { .. })
        ),
        "{err:?}"
    );
    assert!(transport.calls().is_empty());
}
