//! Node simulator helpers shared by the built-in scenarios.

use std::net::Ipv4Addr;

use anyhow::Context as _;
use blackbox_sim::exec::{
    daemonize_in_container, probe_in_container, run_in_container, DaemonHandle, DaemonSpec,
    Readiness,
};
use blackbox_sim::{BlackBoxState, HarnessContext};

/// Starts the node simulator for `node` and waits for its ready line.
/// With `invite`, the node joins the mesh through that invitation.
pub fn start_node(
    ctx: &HarnessContext,
    state: &BlackBoxState,
    node: &str,
    invite: Option<&str>,
) -> anyhow::Result<DaemonHandle> {
    let sim = &ctx.config().node_sim;
    let mut args = vec![node.to_string(), sim.confbase(node)];
    args.extend(invite.map(str::to_string));
    let spec = DaemonSpec::new(sim.binary_path(), Readiness::LogLine(sim.ready_line.clone())).args(args);
    daemonize_in_container(ctx, &state.container_name(node), spec)
        .with_context(|| format!("starting node simulator for {node}"))
}

/// Asks `inviter` to mint an invitation for `invitee`.
pub fn generate_invite(
    ctx: &HarnessContext,
    state: &BlackBoxState,
    inviter: &str,
    invitee: &str,
) -> anyhow::Result<String> {
    let sim = &ctx.config().node_sim;
    let line = run_in_container(
        ctx,
        &state.container_name(inviter),
        &sim.invite_binary_path(),
        [inviter.to_string(), sim.confbase(inviter), invitee.to_string()],
    )
    .with_context(|| format!("generating invitation from {inviter} for {invitee}"))?;
    line.filter(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_string())
        .with_context(|| format!("{inviter} printed no invitation for {invitee}"))
}

/// Whether `from` can reach `to_ip` with a single ping.
pub fn can_ping(
    ctx: &HarnessContext,
    state: &BlackBoxState,
    from: &str,
    to_ip: Ipv4Addr,
) -> anyhow::Result<bool> {
    let target = to_ip.to_string();
    Ok(probe_in_container(
        ctx,
        &state.container_name(from),
        "ping",
        ["-c", "1", "-W", "1", target.as_str()],
    )?)
}
