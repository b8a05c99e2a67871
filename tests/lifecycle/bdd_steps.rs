//! BDD step definitions for the lifecycle workflow.

use nimus::test_support::FixedConfirm;
use nimus::{CreateRequest, LifecycleError, ProviderError};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{
    DRIVER, LifecycleContext, LifecycleOutcome, LifecycleTestError, PROJECT, parse_names,
};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Setup(#[from] LifecycleTestError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn runtime() -> Result<Runtime, StepError> {
    Runtime::new().map_err(|err| StepError::Assertion(format!("tokio runtime: {err}")))
}

fn batch_outcome<T>(result: Result<nimus::BatchReport<T>, LifecycleError>) -> LifecycleOutcome {
    match result {
        Ok(report) => LifecycleOutcome::Batch {
            failed: report.failed(),
            total: report.total(),
        },
        Err(err) => LifecycleOutcome::Failed(err.to_string()),
    }
}

#[given("a project with a registered driver")]
fn project_with_driver(lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context
}

#[given("the project tracks instances \"{names}\"")]
fn project_tracks(
    lifecycle_context: LifecycleContext,
    names: String,
) -> Result<LifecycleContext, StepError> {
    lifecycle_context.track(&parse_names(&names))?;
    Ok(lifecycle_context)
}

#[given("the provider has forgotten \"{name}\"")]
fn provider_forgot(lifecycle_context: LifecycleContext, name: String) -> LifecycleContext {
    lifecycle_context.provider.forget(&name);
    lifecycle_context
}

#[given("the provider rejects creating \"{name}\"")]
fn provider_rejects(lifecycle_context: LifecycleContext, name: String) -> LifecycleContext {
    lifecycle_context.provider.fail_create(
        &name,
        ProviderError::Api {
            code: 403,
            message: String::from("quota exceeded"),
        },
    );
    lifecycle_context
}

#[when("I create {count} instances named \"{name}\"")]
fn create_instances(
    lifecycle_context: LifecycleContext,
    count: usize,
    name: String,
) -> Result<LifecycleContext, StepError> {
    let orchestrator = lifecycle_context.orchestrator()?;
    let request = CreateRequest::new(PROJECT, DRIVER, name).with_count(count);
    let result = runtime()?.block_on(async { orchestrator.create(&request).await });

    Ok(LifecycleContext {
        outcome: Some(batch_outcome(result)),
        ..lifecycle_context
    })
}

#[when("I remove \"{name}\" without confirmation")]
fn remove_instances(
    lifecycle_context: LifecycleContext,
    name: String,
) -> Result<LifecycleContext, StepError> {
    let orchestrator = lifecycle_context.orchestrator()?;
    let confirm = FixedConfirm::decline();
    let result = runtime()?
        .block_on(async { orchestrator.remove(PROJECT, &name, &confirm, true).await });
    if !confirm.prompts().is_empty() {
        return Err(StepError::Assertion(String::from(
            "skipped confirmation should not prompt",
        )));
    }

    Ok(LifecycleContext {
        outcome: Some(batch_outcome(result)),
        ..lifecycle_context
    })
}

#[when("I list instances")]
fn list_instances(lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    let orchestrator = lifecycle_context.orchestrator()?;
    let rows = runtime()?.block_on(async { orchestrator.list().await });

    Ok(LifecycleContext {
        outcome: Some(LifecycleOutcome::Listed(rows)),
        ..lifecycle_context
    })
}

#[then("the project tracks \"{names}\"")]
fn project_tracks_exactly(
    lifecycle_context: &LifecycleContext,
    names: String,
) -> Result<(), StepError> {
    let mut expected = parse_names(&names);
    expected.sort();
    let persisted = lifecycle_context.persisted_names()?;
    if persisted == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected tracked instances {expected:?}, got {persisted:?}"
        )))
    }
}

#[then("the project tracks no instances")]
fn project_tracks_nothing(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let persisted = lifecycle_context.persisted_names()?;
    if persisted.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no tracked instances, got {persisted:?}"
        )))
    }
}

#[then("{count} instances were bootstrapped")]
fn instances_bootstrapped(
    lifecycle_context: &LifecycleContext,
    count: usize,
) -> Result<(), StepError> {
    let mut hosts = lifecycle_context.transport.uploaded_hosts();
    hosts.sort();
    hosts.dedup();
    if hosts.len() == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} bootstrapped hosts, got {hosts:?}"
        )))
    }
}

#[then("{failed} of {total} operations failed")]
fn operations_failed(
    lifecycle_context: &LifecycleContext,
    failed: usize,
    total: usize,
) -> Result<(), StepError> {
    match &lifecycle_context.outcome {
        Some(LifecycleOutcome::Batch {
            failed: actual_failed,
            total: actual_total,
        }) if *actual_failed == failed && *actual_total == total => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected {failed} of {total} failures, got {other:?}"
        ))),
    }
}

#[then("instance \"{name}\" is reported as \"{status}\"")]
fn instance_reported(
    lifecycle_context: &LifecycleContext,
    name: String,
    status: String,
) -> Result<(), StepError> {
    let Some(LifecycleOutcome::Listed(rows)) = &lifecycle_context.outcome else {
        return Err(StepError::Assertion(String::from(
            "expected a listing outcome",
        )));
    };
    let row = rows
        .iter()
        .find(|row| row.instance == name)
        .ok_or_else(|| StepError::Assertion(format!("{name} missing from listing")))?;
    if row.status == status {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {name} to be {status}, got {}",
            row.status
        )))
    }
}
