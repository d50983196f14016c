//! BDD scenarios for the recreate workflow.

use rstest_bdd_macros::scenario;

use super::test_helpers::{RecreateContext, recreate_context};

#[scenario(
    path = "tests/features/recreate.feature",
    name = "Replace an idle VM and carry over its volume and address"
)]
fn scenario_replace_idle_vm(recreate_context: RecreateContext) {
    drop(recreate_context);
}

#[scenario(
    path = "tests/features/recreate.feature",
    name = "Refuse to recreate while a session is active"
)]
fn scenario_refuse_active_sessions(recreate_context: RecreateContext) {
    drop(recreate_context);
}

#[scenario(
    path = "tests/features/recreate.feature",
    name = "Force a recreate through active sessions"
)]
fn scenario_force_through_sessions(recreate_context: RecreateContext) {
    drop(recreate_context);
}

#[scenario(
    path = "tests/features/recreate.feature",
    name = "Abort when the confirmation does not match"
)]
fn scenario_mismatched_confirmation(recreate_context: RecreateContext) {
    drop(recreate_context);
}

#[scenario(
    path = "tests/features/recreate.feature",
    name = "Leave a marker when the replacement cannot launch"
)]
fn scenario_launch_failure_marks_volume(recreate_context: RecreateContext) {
    drop(recreate_context);
}
