//! Runs groups and the built-in scenarios against the in-memory LXC host.

use std::sync::{Arc, Weak};

use anyhow::ensure;
use blackbox_runner::{run_all, run_group, scenarios, select_groups, TestGroup};
use blackbox_sim::testing::{fake_harness, FakeLxcHost};
use blackbox_sim::{CommandOutput, HarnessContext};
use tempfile::TempDir;

fn harness() -> (Arc<FakeLxcHost>, HarnessContext, TempDir) {
    let host = Arc::new(FakeLxcHost::new());
    let dir = tempfile::tempdir().unwrap();
    let ctx = fake_harness(&host, dir.path());
    (host, ctx, dir)
}

fn builtin(name: &str) -> TestGroup {
    select_groups(scenarios::builtin_groups(), &[name.to_string()])
        .unwrap()
        .pop()
        .unwrap()
}

/// Answers the commands the scenarios run inside containers.
///
/// Containers share a bridge, so `ping` only fails when bridged traffic is
/// filtered and a FORWARD rule drops the target. The invite tool prints a URL.
fn script_node_commands(host: &Arc<FakeLxcHost>) {
    let weak: Weak<FakeLxcHost> = Arc::downgrade(host);
    host.on_attach(move |_container, argv| {
        let Some(program) = argv.first() else {
            return CommandOutput::ok("");
        };
        if program == "ping" {
            let target = format!("{}/32", argv.last().map(String::as_str).unwrap_or(""));
            let blocked = weak
                .upgrade()
                .map(|h| {
                    h.sysctl("net.bridge.bridge-nf-call-iptables").as_deref() == Some("1")
                        && h.rules("FORWARD").iter().any(|r| r.contains(&target))
                })
                .unwrap_or(false);
            return if blocked {
                CommandOutput::failed(1, "1 packets transmitted, 0 received")
            } else {
                CommandOutput::ok("1 packets transmitted, 1 received")
            };
        }
        if program.ends_with("gen_invite") {
            return CommandOutput::ok("10.0.3.10:655/invite-token\n");
        }
        CommandOutput::ok("")
    });
    host.set_daemon_output("node_sim: meshlink started\n");
}

#[test]
fn failing_case_fails_only_its_group() {
    let (host, mut ctx, _dir) = harness();
    let good = TestGroup::new("good", ["alpha"]).case("passes", |ctx, _state| {
        ensure!(ctx.get_container_ip("alpha").is_some(), "alpha has no address");
        Ok(())
    });
    let bad = TestGroup::new("bad", ["beta"])
        .case("fails", |_ctx, _state| anyhow::bail!("node never converged"))
        .case("still_runs", |_ctx, state| {
            ensure!(state.has_node("beta"));
            Ok(())
        });

    let report = run_all(&mut ctx, &[good, bad]);

    assert_eq!(report.failed_groups(), 1);
    assert_eq!(report.exit_code(), 1);
    assert!(report.groups[0].passed());
    let bad = &report.groups[1];
    assert_eq!(bad.cases.len(), 2);
    assert!(!bad.cases[0].passed);
    assert!(bad.cases[0].error.as_deref().unwrap().contains("never converged"));
    assert!(bad.cases[1].passed);
    assert!(host.container_names().is_empty(), "left behind: {:?}", host.container_names());
}

#[test]
fn provisioning_failure_skips_cases_and_run_continues() {
    let (host, mut ctx, _dir) = harness();
    host.fail_on("-n run_broken");
    let broken = TestGroup::new("broken", ["broken"]).case("never_runs", |_ctx, _state| {
        anyhow::bail!("case ran without containers")
    });
    let fine = TestGroup::new("fine", ["fine"]).case("runs", |_ctx, _state| Ok(()));

    let report = run_all(&mut ctx, &[broken, fine]);

    assert!(report.groups[0].setup_error.is_some());
    assert!(report.groups[0].cases.is_empty());
    assert!(report.groups[1].passed());
    assert_eq!(report.failed_groups(), 1);
}

#[test]
fn case_sees_containers_named_after_it() {
    let (host, mut ctx, _dir) = harness();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let record = seen.clone();
    let probe_host = Arc::downgrade(&host);
    let group = TestGroup::new("naming", ["foo", "bar"]).case("check_names", move |_ctx, state| {
        let host = probe_host.upgrade().unwrap();
        record.lock().unwrap().extend(host.container_names());
        ensure!(host.is_running(&state.container_name("foo")));
        Ok(())
    });

    let report = run_group(&mut ctx, &group);

    assert!(report.passed(), "{report:?}");
    assert_eq!(*seen.lock().unwrap(), ["check_names_bar", "check_names_foo"]);
    assert!(ctx.get_container_ip("foo").is_none(), "cache not cleared after case");
}

#[test]
fn unknown_group_is_rejected() {
    let err = select_groups(scenarios::builtin_groups(), &["nope".to_string()])
        .err()
        .unwrap();
    assert!(err.to_string().contains("nope"));
    assert!(err.to_string().contains("provisioning"));
}

#[test]
fn provisioning_scenario_passes() {
    let (_host, mut ctx, _dir) = harness();
    let report = run_group(&mut ctx, &builtin("provisioning"));
    assert!(report.passed(), "{report:?}");
}

#[test]
fn node_startup_scenario_waits_for_ready_line() {
    let (host, mut ctx, _dir) = harness();
    script_node_commands(&host);
    let report = run_group(&mut ctx, &builtin("node_startup"));
    assert!(report.passed(), "{report:?}");
    assert_eq!(host.running_daemons(), 0);
}

#[test]
fn node_startup_scenario_fails_without_ready_line() {
    let (host, mut ctx, _dir) = harness();
    host.set_daemon_output("node_sim: still thinking\n");
    let report = run_group(&mut ctx, &builtin("node_startup"));
    assert!(!report.passed());
    let error = report.cases[0].error.as_deref().unwrap();
    assert!(error.contains("starting node simulator for nut"), "{error}");
}

#[test]
fn invitation_scenario_passes_invite_to_peer() {
    let (host, mut ctx, _dir) = harness();
    script_node_commands(&host);
    let report = run_group(&mut ctx, &builtin("invitation"));
    assert!(report.passed(), "{report:?}");
    let peer_start = host
        .history()
        .into_iter()
        .filter(|c| c.to_string().contains("node_sim peer"))
        .last()
        .unwrap();
    assert!(peer_start.to_string().ends_with("10.0.3.10:655/invite-token"));
}

#[test]
fn partition_scenario_restores_forward_chain() {
    let (host, mut ctx, _dir) = harness();
    script_node_commands(&host);
    host.add_rule("FORWARD", "-i lxcbr0 -j ACCEPT");
    let report = run_group(&mut ctx, &builtin("partition"));
    assert!(report.passed(), "{report:?}");
    assert_eq!(host.rules("FORWARD"), ["-i lxcbr0 -j ACCEPT"]);
}

#[test]
fn partition_scenario_fails_when_bridge_filtering_is_unavailable() {
    let (host, mut ctx, _dir) = harness();
    script_node_commands(&host);
    host.fail_on("sysctl -w net.bridge.bridge-nf-call-iptables=1");
    let report = run_group(&mut ctx, &builtin("partition"));
    assert!(!report.passed());
    assert!(host.rules("FORWARD").is_empty());
}

#[test]
fn nat_scenario_moves_peer_behind_gateway_and_back() {
    let (host, mut ctx, _dir) = harness();
    script_node_commands(&host);
    host.set_subnet("natbr0", [172, 16, 0]);
    let report = run_group(&mut ctx, &builtin("nat"));
    assert!(report.passed(), "{report:?}");
    assert!(host.link("natbr0").is_none());
    assert!(host.container_names().is_empty());
    assert!(host.count_commands("MASQUERADE") >= 1);
}

#[test]
fn report_serializes_for_ci() {
    let (_host, mut ctx, _dir) = harness();
    let group = TestGroup::new("json", ["solo"]).case("ok", |_ctx, _state| Ok(()));
    let report = run_all(&mut ctx, &[group]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.json");
    report.write_json(&path).unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(json["groups"][0]["cases"][0]["name"], "ok");
    assert_eq!(json["groups"][0]["cases"][0]["passed"], true);
}
