//! Unit tests for the `aws` CLI adapter.

use super::*;
use crate::cloud::{BootstrapState, VmState, VolumeState};
use crate::test_support::ScriptedRunner;
use rstest::{fixture, rstest};

const INSTANCES_JSON: &str = r#"{
  "Reservations": [{
    "Instances": [{
      "InstanceId": "i-0abc",
      "InstanceType": "t3.large",
      "State": {"Code": 16, "Name": "running"},
      "Placement": {"AvailabilityZone": "us-east-1a"},
      "PublicIpAddress": "203.0.113.10",
      "Tags": [
        {"Key": "berth:owner", "Value": "alice"},
        {"Key": "berth:name", "Value": "default"},
        {"Key": "berth:bootstrap", "Value": "complete"}
      ]
    }]
  }]
}"#;

#[fixture]
fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
}

fn cli(runner: &ScriptedRunner) -> AwsCli<ScriptedRunner> {
    AwsCli::new(runner.clone(), "aws", "us-east-1")
}

#[rstest]
#[tokio::test]
async fn describe_instances_parses_tags_and_state(runner: ScriptedRunner) {
    runner.push_output(Some(0), INSTANCES_JSON, "");
    let vms = cli(&runner)
        .describe_instances(&InstanceFilter::by_name("alice", "default"))
        .await
        .expect("describe should succeed");

    assert_eq!(vms.len(), 1);
    let vm = vms.first().expect("one vm");
    assert_eq!(vm.id, "i-0abc");
    assert_eq!(vm.state, VmState::Running);
    assert_eq!(vm.owner_tag, "alice");
    assert_eq!(vm.bootstrap, Some(BootstrapState::Complete));
    assert_eq!(vm.public_ip.as_deref(), Some("203.0.113.10"));

    let invocation = runner.invocations().remove(0);
    let rendered = invocation.command_string();
    assert!(rendered.starts_with("aws ec2 describe-instances --region us-east-1 --output json"));
    assert!(rendered.contains(r#""Name":"tag:berth:owner","Values":["alice"]"#), "{rendered}");
}

#[rstest]
#[tokio::test]
async fn describe_volumes_reads_pending_marker(runner: ScriptedRunner) {
    runner.push_output(
        Some(0),
        r#"{"Volumes":[{"VolumeId":"vol-1","AvailabilityZone":"us-east-1b","Size":100,
            "State":"available","Attachments":[],
            "Tags":[{"Key":"berth:name","Value":"default"},
                    {"Key":"berth:pending-attach","Value":"true"}]}]}"#,
        "",
    );
    let volumes = cli(&runner)
        .describe_volumes(&VolumeFilter::project_volume("alice", "default"))
        .await
        .expect("describe should succeed");

    let volume = volumes.first().expect("one volume");
    assert_eq!(volume.state, VolumeState::Available);
    assert!(volume.pending_attach);
    assert_eq!(volume.attached_instance, None);
    assert_eq!(volume.size_gb, 100);
}

#[rstest]
#[case::missing("Unable to locate credentials. You can configure credentials by running \"aws configure\".")]
#[case::expired("An error occurred (ExpiredToken) when calling the DescribeInstances operation: The security token included in the request is expired")]
#[case::sso("Error when retrieving token from sso: Token has expired and refresh failed")]
#[tokio::test]
async fn credential_failures_collapse_to_one_error(runner: ScriptedRunner, #[case] stderr: &str) {
    runner.push_output(Some(255), "", stderr);
    let err = cli(&runner)
        .stop_instance("i-0abc")
        .await
        .expect_err("call should fail");
    assert_eq!(err, CloudError::Credentials);
    assert!(!err.to_string().contains("ExpiredToken"));
}

#[rstest]
#[tokio::test]
async fn not_found_codes_map_to_not_found(runner: ScriptedRunner) {
    runner.push_output(
        Some(254),
        "",
        "\nAn error occurred (InvalidAssociationID.NotFound) when calling the DisassociateAddress operation: The association ID 'eipassoc-1' does not exist\n",
    );
    let err = cli(&runner)
        .disassociate_address("eipassoc-1")
        .await
        .expect_err("call should fail");
    assert!(err.is_not_found(), "{err:?}");
}

#[rstest]
#[tokio::test]
async fn other_failures_keep_provider_message(runner: ScriptedRunner) {
    runner.push_output(
        Some(254),
        "",
        "An error occurred (IncorrectState) when calling the AttachVolume operation: vol-1 is not available",
    );
    let err = cli(&runner)
        .attach_volume("vol-1", "i-0abc", "/dev/sdf")
        .await
        .expect_err("call should fail");
    match err {
        CloudError::Api { operation, message } => {
            assert_eq!(operation, "attach-volume");
            assert!(message.contains("vol-1 is not available"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[rstest]
#[tokio::test]
async fn run_instance_passes_tags_and_client_token(runner: ScriptedRunner) {
    runner.push_output(
        Some(0),
        r#"{"Instances":[{"InstanceId":"i-new","InstanceType":"t3.large",
            "State":{"Name":"pending"},"Placement":{"AvailabilityZone":"us-east-1b"}}]}"#,
        "",
    );
    let request = LaunchRequest {
        image_id: String::from("ami-1"),
        instance_type: String::from("t3.large"),
        availability_zone: String::from("us-east-1b"),
        subnet_id: String::from("subnet-1"),
        security_group_ids: vec![String::from("sg-a"), String::from("sg-b")],
        user_data: b"#!/bin/bash\necho hi\n".to_vec(),
        tags: vec![Tag::new(TAG_OWNER, "alice")],
        client_token: String::from("token-1"),
    };
    let vm = cli(&runner)
        .run_instance(&request)
        .await
        .expect("launch should succeed");
    assert_eq!(vm.id, "i-new");
    assert_eq!(vm.state, VmState::Pending);

    let args = runner.invocations().remove(0).command_string();
    assert!(args.contains("--client-token token-1"), "{args}");
    assert!(args.contains("--security-group-ids sg-a sg-b"), "{args}");
    assert!(args.contains(r#""ResourceType":"instance""#), "{args}");
}

#[rstest]
#[tokio::test]
async fn push_key_uses_instance_connect(runner: ScriptedRunner) {
    runner.push_output(Some(0), r#"{"RequestId":"r-1","Success":true}"#, "");
    let request = KeyPushRequest {
        instance_id: String::from("i-0abc"),
        availability_zone: String::from("us-east-1a"),
        os_user: String::from("ubuntu"),
        public_key: String::from("ssh-ed25519 AAAA berth"),
    };
    cli(&runner)
        .push_key(&request)
        .await
        .expect("push should succeed");

    let rendered = runner.invocations().remove(0).command_string();
    assert!(rendered.starts_with("aws ec2-instance-connect send-ssh-public-key"));
    assert!(rendered.contains("--instance-os-user ubuntu"));
}

#[rstest]
#[tokio::test]
async fn push_key_reports_unsuccessful_response(runner: ScriptedRunner) {
    runner.push_output(Some(0), r#"{"Success":false}"#, "");
    let request = KeyPushRequest {
        instance_id: String::from("i-0abc"),
        availability_zone: String::from("us-east-1a"),
        os_user: String::from("ubuntu"),
        public_key: String::from("ssh-ed25519 AAAA berth"),
    };
    let err = cli(&runner)
        .push_key(&request)
        .await
        .expect_err("push should fail");
    assert!(matches!(err, CloudError::Api { .. }), "{err:?}");
}

#[rstest]
#[tokio::test]
async fn malformed_json_is_a_parse_error(runner: ScriptedRunner) {
    runner.push_output(Some(0), "not json", "");
    let err = cli(&runner)
        .describe_subnets("us-east-1a")
        .await
        .expect_err("parse should fail");
    assert!(matches!(err, CloudError::Parse { .. }), "{err:?}");
}

#[test]
fn error_code_extracts_provider_code() {
    assert_eq!(
        error_code("An error occurred (InvalidVolume.NotFound) when calling"),
        Some("InvalidVolume.NotFound")
    );
    assert_eq!(error_code("boom"), None);
}
