//! BDD scenarios for the lifecycle workflow.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LifecycleContext, lifecycle_context};

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Create a numbered batch of instances"
)]
fn scenario_batch_create(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "A failed member does not stop the batch"
)]
fn scenario_batch_create_partial_failure(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Remove every member of a batch by its base name"
)]
fn scenario_batch_remove(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Removing an instance the provider already deleted"
)]
fn scenario_remove_already_deleted(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Listing marks vanished instances as deleted"
)]
fn scenario_list_marks_deleted(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}
