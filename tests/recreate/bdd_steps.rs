//! BDD step definitions for recreate behaviour.

use std::time::Duration;

use berth::bootstrap::{ScriptRenderer, TagBootstrapPoller};
use berth::cloud::CloudError;
use berth::recreate::{RecreateDeps, RecreateOrchestrator};
use berth::test_support::{FakeCloud, MemoryHostKeyStore, RemoteReply};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{
    RecreateContext, RecreateFailure, RecreateResult, SEEDED_FINGERPRINT, parse_kind, settings,
};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a running VM \"{name}\" owned by \"{owner}\"")]
fn running_vm(mut recreate_context: RecreateContext, name: String, owner: String) -> RecreateContext {
    let vm_name = name.trim().to_owned();
    let vm_owner = owner.trim().to_owned();
    recreate_context.cloud = FakeCloud::seeded(&vm_owner, &vm_name);
    recreate_context.host_keys = MemoryHostKeyStore::new().with_entry(&vm_name, SEEDED_FINGERPRINT);
    recreate_context.request.vm_name = vm_name;
    recreate_context.owner = vm_owner;
    recreate_context
}

#[given("an active tmux session on the VM")]
fn active_tmux_session(recreate_context: RecreateContext) -> RecreateContext {
    recreate_context
        .remote
        .reply_to("tmux", RemoteReply::stdout("/dev/pts/0 main\n"));
    recreate_context
}

#[given("force is enabled")]
fn force_enabled(mut recreate_context: RecreateContext) -> RecreateContext {
    recreate_context.request.force = true;
    recreate_context
}

#[given("the operator types \"{typed}\"")]
fn operator_types(mut recreate_context: RecreateContext, typed: String) -> RecreateContext {
    recreate_context.typed = format!("{typed}\n");
    recreate_context
}

#[given("the cloud rejects \"{verb}\" calls")]
fn cloud_rejects(recreate_context: RecreateContext, verb: String) -> RecreateContext {
    recreate_context.cloud.fail_on(
        &verb,
        CloudError::Api {
            operation: verb.clone(),
            message: String::from("simulated outage"),
        },
    );
    recreate_context
}

#[when("I recreate the VM")]
fn recreate_vm(recreate_context: RecreateContext) -> Result<RecreateContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let orchestrator = RecreateOrchestrator::new(
        RecreateDeps {
            api: recreate_context.cloud.clone(),
            remote: recreate_context.remote.clone(),
            scanner: recreate_context.scanner.clone(),
            host_keys: recreate_context.host_keys.clone(),
            renderer: ScriptRenderer,
            poller: TagBootstrapPoller::new(
                recreate_context.cloud.clone(),
                Duration::from_millis(200),
                Duration::from_millis(1),
            ),
        },
        settings(&recreate_context.owner),
    );

    let mut input = recreate_context.typed.as_bytes();
    let mut out = Vec::new();
    let result = runtime.block_on(orchestrator.execute(
        &recreate_context.request,
        &mut input,
        &mut out,
    ));
    let outcome = match result {
        Ok(done) => RecreateResult::Success {
            warnings: done.warnings,
        },
        Err(err) => RecreateResult::Failure(RecreateFailure {
            kind: err.kind(),
            step: err.failed_step(),
            message: err.to_string(),
        }),
    };

    Ok(RecreateContext {
        outcome: Some(outcome),
        ..recreate_context
    })
}

#[then("the recreate succeeds")]
fn recreate_succeeds(recreate_context: &RecreateContext) -> Result<(), StepError> {
    match &recreate_context.outcome {
        Some(RecreateResult::Success { .. }) => Ok(()),
        Some(RecreateResult::Failure(failure)) => Err(StepError::Assertion(format!(
            "expected success, got failure: {}",
            failure.message
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("the recreate fails with kind \"{kind}\"")]
fn recreate_fails_with(recreate_context: &RecreateContext, kind: String) -> Result<(), StepError> {
    let expected = parse_kind(kind.trim())
        .ok_or_else(|| StepError::Assertion(format!("unknown error kind: {kind}")))?;
    let Some(RecreateResult::Failure(failure)) = &recreate_context.outcome else {
        return Err(StepError::Assertion(String::from("expected failure outcome")));
    };
    if failure.kind == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {expected:?}, got {:?}: {}",
            failure.kind, failure.message
        )))
    }
}

#[then("the failed step is \"{step}\"")]
fn failed_step_is(recreate_context: &RecreateContext, step: String) -> Result<(), StepError> {
    let Some(RecreateResult::Failure(failure)) = &recreate_context.outcome else {
        return Err(StepError::Assertion(String::from("expected failure outcome")));
    };
    match failure.step {
        Some(actual) if actual.as_str() == step.trim() => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected failed step {step}, got {other:?}"
        ))),
    }
}

#[then("the project volume is attached to \"{instance}\"")]
fn volume_attached_to(recreate_context: &RecreateContext, instance: String) -> Result<(), StepError> {
    let volume = recreate_context
        .cloud
        .volume("vol-1")
        .ok_or_else(|| StepError::Assertion(String::from("project volume vanished")))?;
    if volume.attached_instance.as_deref() == Some(instance.trim()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected attachment to {instance}, got {:?}",
            volume.attached_instance
        )))
    }
}

#[then("the address is associated with \"{instance}\"")]
fn address_associated_with(
    recreate_context: &RecreateContext,
    instance: String,
) -> Result<(), StepError> {
    let address = recreate_context
        .cloud
        .address("eipalloc-1")
        .ok_or_else(|| StepError::Assertion(String::from("address vanished")))?;
    if address.instance_id.as_deref() == Some(instance.trim()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected association with {instance}, got {:?}",
            address.instance_id
        )))
    }
}

#[then("no host key is pinned for \"{name}\"")]
fn no_host_key_pinned(recreate_context: &RecreateContext, name: String) -> Result<(), StepError> {
    if recreate_context.host_keys.entries().contains_key(name.trim()) {
        Err(StepError::Assertion(format!("host key for {name} is still pinned")))
    } else {
        Ok(())
    }
}

#[then("a host key is still pinned for \"{name}\"")]
fn host_key_still_pinned(recreate_context: &RecreateContext, name: String) -> Result<(), StepError> {
    match recreate_context.host_keys.entries().get(name.trim()) {
        Some(fingerprint) if fingerprint == SEEDED_FINGERPRINT => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected the seeded pin for {name}, got {other:?}"
        ))),
    }
}

#[then("no cloud resources were modified")]
fn no_mutations(recreate_context: &RecreateContext) -> Result<(), StepError> {
    let mutations = recreate_context.mutations();
    if mutations.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no mutating calls, got {mutations:?}"
        )))
    }
}

#[then("the project volume is marked pending-attach")]
fn volume_marked(recreate_context: &RecreateContext) -> Result<(), StepError> {
    if pending_attach(recreate_context) {
        Ok(())
    } else {
        Err(StepError::Assertion(String::from(
            "volume should keep the pending-attach marker",
        )))
    }
}

#[then("the project volume is not marked pending-attach")]
fn volume_not_marked(recreate_context: &RecreateContext) -> Result<(), StepError> {
    if pending_attach(recreate_context) {
        Err(StepError::Assertion(String::from(
            "pending-attach marker should be cleared",
        )))
    } else {
        Ok(())
    }
}

#[then("a warning mentions \"{text}\"")]
fn warning_mentions(recreate_context: &RecreateContext, text: String) -> Result<(), StepError> {
    let Some(RecreateResult::Success { warnings }) = &recreate_context.outcome else {
        return Err(StepError::Assertion(String::from("expected success outcome")));
    };
    if warnings.iter().any(|warning| warning.contains(text.trim())) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "no warning mentions {text}: {warnings:?}"
        )))
    }
}

fn pending_attach(recreate_context: &RecreateContext) -> bool {
    recreate_context
        .cloud
        .volume("vol-1")
        .is_some_and(|volume| volume.pending_attach)
}
