//! iptables fault injection.
//!
//! Host-side rules isolate a node container from everything routed through
//! the host; container-side rules shape a single node's own traffic.
//! All injected rules are removable and a heal restores the previous rule
//! set exactly.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use crate::command::{CommandRunner, CommandSpec};
use crate::context::HarnessContext;
use crate::error::{HarnessError, Result};
use crate::exec::run_in_container;

const FORWARD: &str = "FORWARD";

fn forward_rules(op: &str, ip: Ipv4Addr) -> [CommandSpec; 2] {
    let ip = ip.to_string();
    [
        CommandSpec::privileged("iptables").args([op, FORWARD, "-s", ip.as_str(), "-j", "DROP"]),
        CommandSpec::privileged("iptables").args([op, FORWARD, "-d", ip.as_str(), "-j", "DROP"]),
    ]
}

/// Makes bridged frames pass through the host's iptables chains.
const BRIDGE_NF_CALL: &str = "net.bridge.bridge-nf-call-iptables";

fn node_ip(ctx: &HarnessContext, node: &str) -> Result<Ipv4Addr> {
    ctx.get_container_ip(node)
        .ok_or_else(|| HarnessError::UnknownNode(node.to_string()))
}

/// Routes traffic between containers on the same bridge through FORWARD.
///
/// The setting is host-wide and stays enabled after the harness exits.
pub fn enable_bridge_filtering(ctx: &HarnessContext) -> Result<()> {
    let runner = ctx.runner();
    runner.run_checked(&CommandSpec::privileged("modprobe").arg("br_netfilter"))?;
    runner.run_checked(
        &CommandSpec::privileged("sysctl").args(["-w".to_string(), format!("{BRIDGE_NF_CALL}=1")]),
    )?;
    Ok(())
}

/// Inserts both DROP rules, or none of them.
fn insert_rules(runner: &dyn CommandRunner, ip: Ipv4Addr) -> Result<()> {
    let [first, second] = forward_rules("-I", ip);
    let [undo_first, _] = forward_rules("-D", ip);
    runner.run_checked(&first)?;
    if let Err(e) = runner.run_checked(&second) {
        if let Err(undo) = runner.run_checked(&undo_first) {
            tracing::warn!(%ip, error = %undo, "failed to roll back partial block");
        }
        return Err(e);
    }
    Ok(())
}

/// Runs every delete. Returns the ones that failed and the first error.
fn delete_rules(
    runner: &dyn CommandRunner,
    rules: Vec<CommandSpec>,
) -> (Vec<CommandSpec>, Option<HarnessError>) {
    let mut failed = Vec::new();
    let mut first_error = None;
    for rule in rules {
        if let Err(e) = runner.run_checked(&rule) {
            tracing::warn!(%rule, error = %e, "failed to delete rule");
            first_error.get_or_insert(e);
            failed.push(rule);
        }
    }
    (failed, first_error)
}

/// Drops all forwarded traffic to and from the node's container.
pub fn block_node_ip(ctx: &HarnessContext, node: &str) -> Result<()> {
    let ip = node_ip(ctx, node)?;
    tracing::info!(node, %ip, "blocking node");
    enable_bridge_filtering(ctx)?;
    insert_rules(ctx.runner(), ip)
}

/// Removes the rules installed by [`block_node_ip`].
pub fn unblock_node_ip(ctx: &HarnessContext, node: &str) -> Result<()> {
    let ip = node_ip(ctx, node)?;
    tracing::info!(node, %ip, "unblocking node");
    match delete_rules(ctx.runner(), forward_rules("-D", ip).into()) {
        (_, Some(e)) => Err(e),
        (_, None) => Ok(()),
    }
}

/// Rules of one host chain as printed by `iptables -S`.
pub fn snapshot_rules(ctx: &HarnessContext, chain: &str) -> Result<Vec<String>> {
    let out = ctx
        .runner()
        .run_checked(&CommandSpec::privileged("iptables").args(["-S", chain]))?;
    Ok(out
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// A node cut off from the network until healed or dropped.
///
/// Stays active while any of its rules is still installed.
pub struct Isolation {
    node: String,
    ip: Ipv4Addr,
    runner: Arc<dyn CommandRunner>,
    pending: Vec<CommandSpec>,
}

impl fmt::Debug for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Isolation")
            .field("node", &self.node)
            .field("ip", &self.ip)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Isolation {
    pub fn new(ctx: &HarnessContext, node: &str) -> Result<Self> {
        let ip = node_ip(ctx, node)?;
        block_node_ip(ctx, node)?;
        Ok(Self {
            node: node.to_string(),
            ip,
            runner: ctx.runner_handle(),
            pending: forward_rules("-D", ip).into(),
        })
    }

    pub fn is_active(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Idempotent. A failed heal keeps the undeleted rules for a retry.
    pub fn heal(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        tracing::info!(node = %self.node, ip = %self.ip, "healing isolation");
        let (left, error) = delete_rules(&*self.runner, std::mem::take(&mut self.pending));
        self.pending = left;
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Isolation {
    fn drop(&mut self) {
        if let Err(e) = self.heal() {
            tracing::warn!(node = %self.node, error = %e, "failed to heal isolation during drop");
        }
    }
}

// ── Container-side rules ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Accept,
    Drop,
}

/// A rule applied inside a node container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub direction: Direction,
    pub protocol: Protocol,
    pub peer: IpAddr,
    pub port: Option<u16>,
    pub action: Action,
}

impl FirewallRule {
    fn program(&self) -> &'static str {
        match self.peer {
            IpAddr::V4(_) => "iptables",
            IpAddr::V6(_) => "ip6tables",
        }
    }

    /// Arguments after the program name for `op` (`-A` or `-D`).
    fn args(&self, op: &str) -> Result<Vec<String>> {
        let (chain, peer_flag) = match self.direction {
            Direction::Incoming => ("INPUT", "-s"),
            Direction::Outgoing => ("OUTPUT", "-d"),
        };
        let mut args = vec![op.to_string(), chain.to_string()];
        match self.protocol {
            Protocol::Tcp => args.extend(["-p".into(), "tcp".into()]),
            Protocol::Udp => args.extend(["-p".into(), "udp".into()]),
            Protocol::All => {
                if self.port.is_some() {
                    return Err(HarnessError::Config(
                        "a port filter needs tcp or udp".into(),
                    ));
                }
            }
        }
        args.extend([peer_flag.to_string(), self.peer.to_string()]);
        if let Some(port) = self.port {
            args.extend(["--dport".to_string(), port.to_string()]);
        }
        let target = match self.action {
            Action::Accept => "ACCEPT",
            Action::Drop => "DROP",
        };
        args.extend(["-j".to_string(), target.to_string()]);
        Ok(args)
    }
}

pub fn install_firewall_rule(ctx: &HarnessContext, container: &str, rule: &FirewallRule) -> Result<()> {
    tracing::info!(container, ?rule, "installing firewall rule");
    run_in_container(ctx, container, rule.program(), rule.args("-A")?)?;
    Ok(())
}

pub fn remove_firewall_rule(ctx: &HarnessContext, container: &str, rule: &FirewallRule) -> Result<()> {
    tracing::info!(container, ?rule, "removing firewall rule");
    run_in_container(ctx, container, rule.program(), rule.args("-D")?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::BlackBoxState;
    use crate::testing::{fake_context, FakeLxcHost};
    use std::net::Ipv6Addr;

    fn resolved_ctx(host: &Arc<FakeLxcHost>) -> (HarnessContext, tempfile::TempDir) {
        host.add_container("tc_peer", true);
        let (mut ctx, dir) = fake_context(host.clone());
        let state = BlackBoxState::new("tc", ["peer"]);
        crate::container::container_wait_ip(&mut ctx, &state, "peer").unwrap();
        (ctx, dir)
    }

    #[test]
    fn block_then_unblock_restores_rules() {
        let host = Arc::new(FakeLxcHost::new());
        host.add_rule("FORWARD", "-i lxcbr0 -j ACCEPT");
        let (ctx, _dir) = resolved_ctx(&host);
        let ip = ctx.get_container_ip("peer").unwrap().to_string();

        let before = snapshot_rules(&ctx, "FORWARD").unwrap();
        block_node_ip(&ctx, "peer").unwrap();
        let during = snapshot_rules(&ctx, "FORWARD").unwrap();
        assert_eq!(during.len(), before.len() + 2);
        assert!(during.contains(&format!("-A FORWARD -s {ip}/32 -j DROP")));
        assert!(during.contains(&format!("-A FORWARD -d {ip}/32 -j DROP")));

        unblock_node_ip(&ctx, "peer").unwrap();
        assert_eq!(snapshot_rules(&ctx, "FORWARD").unwrap(), before);
    }

    #[test]
    fn unblock_without_block_fails() {
        let host = Arc::new(FakeLxcHost::new());
        let (ctx, _dir) = resolved_ctx(&host);
        assert!(unblock_node_ip(&ctx, "peer").is_err());
    }

    #[test]
    fn unknown_node_cannot_be_blocked() {
        let host = Arc::new(FakeLxcHost::new());
        let (ctx, _dir) = fake_context(host);
        assert!(matches!(
            block_node_ip(&ctx, "ghost").unwrap_err(),
            HarnessError::UnknownNode(_)
        ));
    }

    #[test]
    fn block_enables_bridge_filtering_first() {
        let host = Arc::new(FakeLxcHost::new());
        let (ctx, _dir) = resolved_ctx(&host);
        block_node_ip(&ctx, "peer").unwrap();
        assert_eq!(host.sysctl(BRIDGE_NF_CALL).as_deref(), Some("1"));

        let history: Vec<String> = host.history().iter().map(ToString::to_string).collect();
        let pos = |needle: &str| history.iter().position(|c| c.contains(needle)).unwrap();
        assert!(pos("modprobe br_netfilter") < pos("sysctl -w"));
        assert!(pos("sysctl -w") < pos("-I FORWARD"));
    }

    #[test]
    fn block_without_bridge_filtering_installs_nothing() {
        let host = Arc::new(FakeLxcHost::new());
        host.fail_on("modprobe br_netfilter");
        let (ctx, _dir) = resolved_ctx(&host);
        assert!(block_node_ip(&ctx, "peer").is_err());
        assert!(host.rules("FORWARD").is_empty());
    }

    #[test]
    fn failed_second_insert_rolls_back_the_first() {
        let host = Arc::new(FakeLxcHost::new());
        host.add_rule("FORWARD", "-i lxcbr0 -j ACCEPT");
        let (ctx, _dir) = resolved_ctx(&host);
        host.fail_on("-I FORWARD -d");

        assert!(block_node_ip(&ctx, "peer").is_err());
        assert_eq!(host.rules("FORWARD"), ["-i lxcbr0 -j ACCEPT"]);
        assert!(Isolation::new(&ctx, "peer").is_err());
        assert_eq!(host.rules("FORWARD"), ["-i lxcbr0 -j ACCEPT"]);
    }

    #[test]
    fn unblock_attempts_both_rules() {
        let host = Arc::new(FakeLxcHost::new());
        let (ctx, _dir) = resolved_ctx(&host);
        block_node_ip(&ctx, "peer").unwrap();
        host.fail_on("-D FORWARD -s");

        assert!(unblock_node_ip(&ctx, "peer").is_err());
        let ip = ctx.get_container_ip("peer").unwrap();
        assert_eq!(host.rules("FORWARD"), [format!("-s {ip}/32 -j DROP")]);
    }

    #[test]
    fn failed_heal_stays_active_and_retries_the_rest() {
        let host = Arc::new(FakeLxcHost::new());
        let (ctx, _dir) = resolved_ctx(&host);
        let before = snapshot_rules(&ctx, "FORWARD").unwrap();
        let mut iso = Isolation::new(&ctx, "peer").unwrap();

        host.fail_on("-D FORWARD -d");
        assert!(iso.heal().is_err());
        assert!(iso.is_active());

        host.clear_failures();
        iso.heal().unwrap();
        assert!(!iso.is_active());
        assert_eq!(snapshot_rules(&ctx, "FORWARD").unwrap(), before);
        assert_eq!(host.count_commands("-D FORWARD -s"), 1);
        assert_eq!(host.count_commands("-D FORWARD -d"), 2);
    }

    #[test]
    fn isolation_heals_on_drop() {
        let host = Arc::new(FakeLxcHost::new());
        let (ctx, _dir) = resolved_ctx(&host);
        let before = snapshot_rules(&ctx, "FORWARD").unwrap();
        {
            let mut iso = Isolation::new(&ctx, "peer").unwrap();
            assert!(iso.is_active());
            assert_ne!(snapshot_rules(&ctx, "FORWARD").unwrap(), before);
            iso.heal().unwrap();
            iso.heal().unwrap();
            assert!(!iso.is_active());
        }
        assert_eq!(snapshot_rules(&ctx, "FORWARD").unwrap(), before);

        let iso = Isolation::new(&ctx, "peer").unwrap();
        drop(iso);
        assert_eq!(snapshot_rules(&ctx, "FORWARD").unwrap(), before);
    }

    #[test]
    fn container_rule_arguments() {
        let rule = FirewallRule {
            direction: Direction::Incoming,
            protocol: Protocol::Udp,
            peer: IpAddr::V4(Ipv4Addr::new(10, 0, 3, 5)),
            port: Some(10000),
            action: Action::Drop,
        };
        assert_eq!(rule.program(), "iptables");
        assert_eq!(
            rule.args("-A").unwrap(),
            ["-A", "INPUT", "-p", "udp", "-s", "10.0.3.5", "--dport", "10000", "-j", "DROP"]
        );

        let v6 = FirewallRule {
            direction: Direction::Outgoing,
            protocol: Protocol::All,
            peer: IpAddr::V6(Ipv6Addr::LOCALHOST),
            port: None,
            action: Action::Accept,
        };
        assert_eq!(v6.program(), "ip6tables");
        assert_eq!(v6.args("-D").unwrap(), ["-D", "OUTPUT", "-d", "::1", "-j", "ACCEPT"]);

        let bad = FirewallRule { port: Some(1), ..v6 };
        assert!(bad.args("-A").is_err());
    }

    #[test]
    fn container_rules_run_through_attach() {
        let host = Arc::new(FakeLxcHost::new());
        host.add_container("tc_nut", true);
        let (ctx, _dir) = fake_context(host.clone());
        let rule = FirewallRule {
            direction: Direction::Outgoing,
            protocol: Protocol::Tcp,
            peer: IpAddr::V4(Ipv4Addr::new(10, 0, 3, 9)),
            port: Some(443),
            action: Action::Drop,
        };
        install_firewall_rule(&ctx, "tc_nut", &rule).unwrap();
        remove_firewall_rule(&ctx, "tc_nut", &rule).unwrap();
        assert_eq!(host.count_commands("-n tc_nut -- iptables -A OUTPUT -p tcp -d 10.0.3.9"), 1);
        assert_eq!(host.count_commands("-n tc_nut -- iptables -D OUTPUT"), 1);
    }
}
