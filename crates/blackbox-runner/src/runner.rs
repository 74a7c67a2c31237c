//! Drives test groups against a harness context.
//!
//! A failing case fails only itself; a failing group setup fails only its
//! group. The run always continues with the next case or group.

use std::time::Instant;

use anyhow::Context as _;
use blackbox_sim::container::{
    create_containers, destroy_containers, setup_containers, teardown_containers,
};
use blackbox_sim::{BlackBoxState, HarnessContext};

use crate::case::{TestCase, TestGroup};
use crate::report::{CaseReport, GroupReport, RunReport};

/// Keeps only the groups named in `only` (all groups when empty).
/// Unknown names are an error.
pub fn select_groups(groups: Vec<TestGroup>, only: &[String]) -> anyhow::Result<Vec<TestGroup>> {
    if only.is_empty() {
        return Ok(groups);
    }
    if let Some(unknown) = only.iter().find(|n| !groups.iter().any(|g| &g.name == *n)) {
        let known: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
        anyhow::bail!("unknown test group {unknown:?}; available: {}", known.join(", "));
    }
    Ok(groups
        .into_iter()
        .filter(|g| only.contains(&g.name))
        .collect())
}

pub fn run_all(ctx: &mut HarnessContext, groups: &[TestGroup]) -> RunReport {
    RunReport {
        groups: groups.iter().map(|g| run_group(ctx, g)).collect(),
    }
}

pub fn run_group(ctx: &mut HarnessContext, group: &TestGroup) -> GroupReport {
    tracing::info!(group = %group.name, nodes = ?group.nodes, "running group");
    let mut report = GroupReport {
        name: group.name.clone(),
        setup_error: None,
        teardown_error: None,
        cases: Vec::with_capacity(group.cases.len()),
    };

    match create_containers(ctx, &group.nodes) {
        Ok(_) => {
            for case in &group.cases {
                report.cases.push(run_case(ctx, group, case.as_ref()));
            }
        }
        Err(e) => {
            tracing::error!(group = %group.name, error = %e, "provisioning failed");
            report.setup_error = Some(format!("provisioning containers: {e}"));
        }
    }

    if let Err(e) = destroy_containers(ctx, &group.nodes) {
        tracing::warn!(group = %group.name, error = %e, "container cleanup failed");
        report.teardown_error = Some(e.to_string());
    }
    report
}

fn run_case(ctx: &mut HarnessContext, group: &TestGroup, case: &dyn TestCase) -> CaseReport {
    let started = Instant::now();
    let mut state = BlackBoxState::new(case.name(), group.nodes.iter().cloned());
    tracing::info!(group = %group.name, case = case.name(), "running case");

    let outcome = setup_containers(ctx, &state)
        .context("binding node containers")
        .and_then(|()| case.run(ctx, &mut state));

    let teardown = teardown_containers(ctx, &state).context("releasing node containers");
    let outcome = outcome.and_then(|()| teardown);

    state.test_result = outcome.is_ok();
    let error = outcome.err().map(|e| format!("{e:#}"));
    match &error {
        None => tracing::info!(case = case.name(), "case passed"),
        Some(e) => tracing::error!(case = case.name(), error = %e, "case failed"),
    }
    CaseReport {
        name: case.name().to_string(),
        passed: state.test_result,
        error,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}
