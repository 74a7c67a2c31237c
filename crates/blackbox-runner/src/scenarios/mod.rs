//! Built-in black-box scenarios.
//!
//! Each group provisions its nodes once; each case gets freshly bound and
//! started containers named after the case.

pub mod node;

use anyhow::{ensure, Context as _};
use blackbox_sim::container::{container_wait_ip, find_container, Container};
use blackbox_sim::firewall::{snapshot_rules, Isolation};
use blackbox_sim::nat::{NatConfig, NatLayer};
use blackbox_sim::{BlackBoxState, HarnessContext};

use crate::case::TestGroup;
use node::{can_ping, generate_invite, start_node};

pub fn builtin_groups() -> Vec<TestGroup> {
    vec![
        provisioning(),
        node_startup(),
        invitation(),
        partition(),
        nat_traversal(),
    ]
}

fn bound_container(ctx: &HarnessContext, state: &BlackBoxState, node: &str) -> anyhow::Result<Container> {
    let name = state.container_name(node);
    find_container(ctx, &name)?.with_context(|| format!("container {name} does not exist"))
}

fn provisioning() -> TestGroup {
    TestGroup::new("provisioning", ["foo", "bar"]).case(
        "containers_get_addresses",
        |ctx, state| {
            let mut seen = Vec::new();
            for node in &state.node_names {
                let container = bound_container(ctx, state, node)?;
                ensure!(container.is_running(ctx)?, "{} is not running", container.name());
                let ip = ctx
                    .get_container_ip(node)
                    .with_context(|| format!("no cached address for {node}"))?;
                ensure!(!seen.contains(&ip), "{node} shares address {ip}");
                seen.push(ip);
            }
            Ok(())
        },
    )
}

fn node_startup() -> TestGroup {
    TestGroup::new("node_startup", ["nut"]).case("node_sim_reports_ready", |ctx, state| {
        let mut daemon = start_node(ctx, state, "nut", None)?;
        ensure!(daemon.is_running(), "node simulator exited after becoming ready");
        daemon.stop()?;
        Ok(())
    })
}

fn invitation() -> TestGroup {
    TestGroup::new("invitation", ["relay", "peer"]).case("invite_and_join", |ctx, state| {
        let mut relay = start_node(ctx, state, "relay", None)?;
        let invite = generate_invite(ctx, state, "relay", "peer")?;
        tracing::info!(%invite, "relay issued invitation");
        let mut peer = start_node(ctx, state, "peer", Some(&invite))?;
        ensure!(relay.is_running(), "relay exited while peer joined");
        ensure!(peer.is_running(), "peer exited after joining");
        peer.stop()?;
        relay.stop()?;
        Ok(())
    })
}

fn partition() -> TestGroup {
    TestGroup::new("partition", ["relay", "peer"]).case("isolate_and_heal", |ctx, state| {
        let peer_ip = ctx
            .get_container_ip("peer")
            .context("peer has no address")?;
        ensure!(can_ping(ctx, state, "relay", peer_ip)?, "peer unreachable before isolation");

        let before = snapshot_rules(ctx, "FORWARD")?;
        let mut isolation = Isolation::new(ctx, "peer")?;
        ensure!(!can_ping(ctx, state, "relay", peer_ip)?, "peer still reachable while isolated");
        isolation.heal()?;

        let after = snapshot_rules(ctx, "FORWARD")?;
        ensure!(before == after, "FORWARD chain not restored: {before:?} != {after:?}");
        ensure!(can_ping(ctx, state, "relay", peer_ip)?, "peer unreachable after healing");
        Ok(())
    })
}

fn nat_traversal() -> TestGroup {
    TestGroup::new("nat", ["relay", "peer"]).case("peer_behind_nat", |ctx, state| {
        let config = NatConfig::from_defaults(&ctx.config().nat)?;
        let nat = NatLayer::create(ctx, config)?;
        let peer = bound_container(ctx, state, "peer")?;

        peer.stop(ctx)?;
        nat.relink_container(ctx, &peer)?;
        peer.start(ctx)?;
        let outcome = join_through_nat(ctx, state, &nat);

        // Put the peer back on the host bridge before the gateway goes away.
        let restore = peer
            .stop(ctx)
            .and_then(|()| peer.set_network_link(ctx, &ctx.config().paths.lxc_bridge));
        let destroy = nat.destroy();
        outcome?;
        restore.context("moving peer back to the host bridge")?;
        destroy.context("destroying NAT layer")?;
        Ok(())
    })
}

fn join_through_nat(
    ctx: &mut HarnessContext,
    state: &BlackBoxState,
    nat: &NatLayer,
) -> anyhow::Result<()> {
    let peer_ip = container_wait_ip(ctx, state, "peer")?;
    ensure!(
        nat.config().in_dhcp_range(peer_ip),
        "peer address {peer_ip} is outside the NAT DHCP range {}",
        nat.config().dhcp_range
    );
    let mut relay = start_node(ctx, state, "relay", None)?;
    let invite = generate_invite(ctx, state, "relay", "peer")?;
    let mut peer = start_node(ctx, state, "peer", Some(&invite))?;
    ensure!(peer.is_running(), "peer behind NAT exited after joining");
    ensure!(relay.is_running(), "relay exited while NATed peer joined");
    peer.stop()?;
    relay.stop()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_group_names_are_unique() {
        let groups = builtin_groups();
        let mut names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), groups.len());
    }

    #[test]
    fn every_group_has_nodes_and_cases() {
        for group in builtin_groups() {
            assert!(!group.nodes.is_empty(), "{} has no nodes", group.name);
            assert!(!group.cases.is_empty(), "{} has no cases", group.name);
            for node in &group.nodes {
                blackbox_sim::container::validate_node_name(node).unwrap();
            }
        }
    }
}
