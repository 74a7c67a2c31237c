//! LXC container lifecycle and address acquisition.
//!
//! Containers are located by naming convention: `run_<node>` for a
//! provisioned container not bound to any test, `<test_case>_<node>` while a
//! test case owns it. Lookups scan the full `lxc-ls` listing and return the
//! first exact match.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

use crate::command::CommandSpec;
use crate::context::HarnessContext;
use crate::error::{HarnessError, Result};
use crate::poll::{poll_until, PollSettings};
use crate::state::BlackBoxState;

const PROVISIONED_PREFIX: &str = "run";

/// Placeholder `lxc-ls` prints while a container has no address yet.
const NO_ADDRESS: &str = "-";

/// `run_<node>`
pub fn provisioned_name(node: &str) -> String {
    format!("{PROVISIONED_PREFIX}_{node}")
}

/// `<test_case>_<node>`
pub fn test_container_name(test_case: &str, node: &str) -> String {
    format!("{test_case}_{node}")
}

/// Node and test case names end up in container names and file paths.
pub fn validate_node_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(HarnessError::InvalidName(name.to_string()))
    }
}

/// Lifecycle state as reported by `lxc-info -s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Aborting,
    Freezing,
    Frozen,
    Thawed,
}

impl FromStr for ContainerState {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STOPPED" => Ok(Self::Stopped),
            "STARTING" => Ok(Self::Starting),
            "RUNNING" => Ok(Self::Running),
            "STOPPING" => Ok(Self::Stopping),
            "ABORTING" => Ok(Self::Aborting),
            "FREEZING" => Ok(Self::Freezing),
            "FROZEN" => Ok(Self::Frozen),
            "THAWED" => Ok(Self::Thawed),
            other => Err(HarnessError::Parse(format!("unknown container state {other:?}"))),
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Aborting => "ABORTING",
            Self::Freezing => "FREEZING",
            Self::Frozen => "FROZEN",
            Self::Thawed => "THAWED",
        };
        f.write_str(s)
    }
}

/// A container known to exist in the configured LXC store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    name: String,
}

impl Container {
    pub(crate) fn existing(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn tool(&self, ctx: &HarnessContext, tool: &str) -> CommandSpec {
        ctx.lxc(tool).args(["-n", self.name.as_str()])
    }

    pub fn state(&self, ctx: &HarnessContext) -> Result<ContainerState> {
        let out = ctx.runner().run_checked(&self.tool(ctx, "lxc-info").arg("-s"))?;
        parse_info_state(&out.stdout)
    }

    pub fn is_running(&self, ctx: &HarnessContext) -> Result<bool> {
        Ok(self.state(ctx)? == ContainerState::Running)
    }

    pub fn start(&self, ctx: &HarnessContext) -> Result<()> {
        tracing::info!(container = %self.name, "starting container");
        ctx.runner().run_checked(&self.tool(ctx, "lxc-start").arg("-d"))?;
        Ok(())
    }

    /// Stops the container; already stopped is not an error.
    pub fn stop(&self, ctx: &HarnessContext) -> Result<()> {
        if self.state(ctx)? == ContainerState::Stopped {
            return Ok(());
        }
        tracing::info!(container = %self.name, "stopping container");
        ctx.runner().run_checked(&self.tool(ctx, "lxc-stop"))?;
        Ok(())
    }

    /// Destroys the container together with its snapshots.
    pub fn destroy(self, ctx: &HarnessContext) -> Result<()> {
        tracing::info!(container = %self.name, "destroying container");
        ctx.runner()
            .run_checked(&self.tool(ctx, "lxc-destroy").args(["-f", "-s"]))?;
        Ok(())
    }

    /// Renames a stopped container.
    pub fn rename(&mut self, ctx: &HarnessContext, new_name: &str) -> Result<()> {
        validate_node_name(new_name)?;
        tracing::debug!(from = %self.name, to = new_name, "renaming container");
        ctx.runner()
            .run_checked(&self.tool(ctx, "lxc-copy").args(["-R", "-N", new_name]))?;
        self.name = new_name.to_string();
        Ok(())
    }

    /// Names of this container's snapshots, as listed by `lxc-snapshot -L`.
    pub fn snapshots(&self, ctx: &HarnessContext) -> Result<Vec<String>> {
        let out = ctx.runner().run_checked(&self.tool(ctx, "lxc-snapshot").arg("-L"))?;
        Ok(parse_snapshot_listing(&out.stdout))
    }

    /// Takes a snapshot and returns the name LXC gave it.
    pub fn snapshot(&self, ctx: &HarnessContext) -> Result<String> {
        let before = self.snapshots(ctx)?;
        tracing::debug!(container = %self.name, "snapshotting container");
        ctx.runner().run_checked(&self.tool(ctx, "lxc-snapshot"))?;
        self.snapshots(ctx)?
            .into_iter()
            .find(|s| !before.contains(s))
            .ok_or_else(|| {
                HarnessError::Parse(format!("no new snapshot listed for {}", self.name))
            })
    }

    /// LXC refuses to rename a container that still has snapshots.
    pub fn delete_snapshot(&self, ctx: &HarnessContext, snapshot: &str) -> Result<()> {
        tracing::debug!(container = %self.name, snapshot, "deleting snapshot");
        ctx.runner()
            .run_checked(&self.tool(ctx, "lxc-snapshot").args(["-d", snapshot]))?;
        Ok(())
    }

    /// Restores `snapshot` of this container into a new container.
    pub fn restore_snapshot(
        &self,
        ctx: &HarnessContext,
        snapshot: &str,
        new_name: &str,
    ) -> Result<Container> {
        validate_node_name(new_name)?;
        tracing::debug!(container = %self.name, snapshot, new_name, "restoring snapshot");
        ctx.runner().run_checked(
            &self
                .tool(ctx, "lxc-snapshot")
                .args(["-r", snapshot, "-N", new_name]),
        )?;
        Ok(Container::existing(new_name))
    }

    /// Points the first network interface at `bridge`. Takes effect on the
    /// next start.
    pub fn set_network_link(&self, ctx: &HarnessContext, bridge: &str) -> Result<()> {
        self.edit_config(ctx, &[(LINK_KEYS, bridge)])?;
        tracing::info!(container = %self.name, bridge, "relinked container network");
        Ok(())
    }

    /// Attaches the first interface to `bridge` under the name `ifname`.
    pub fn configure_uplink(&self, ctx: &HarnessContext, bridge: &str, ifname: &str) -> Result<()> {
        self.edit_config(ctx, &[(LINK_KEYS, bridge), (NAME_KEYS, ifname)])?;
        tracing::debug!(container = %self.name, bridge, ifname, "configured uplink");
        Ok(())
    }

    fn edit_config(&self, ctx: &HarnessContext, edits: &[(ConfigKeys, &str)]) -> Result<()> {
        let path = ctx.container_config_path(&self.name);
        let mut config = std::fs::read_to_string(&path)?;
        for (keys, value) in edits {
            config = set_config_value(&config, *keys, value);
        }
        std::fs::write(&path, config)?;
        Ok(())
    }
}

/// Current and legacy spelling of one `lxc.net.0` key.
type ConfigKeys = (&'static str, &'static str);

const LINK_KEYS: ConfigKeys = ("lxc.net.0.link", "lxc.network.link");
const NAME_KEYS: ConfigKeys = ("lxc.net.0.name", "lxc.network.name");

fn parse_info_state(stdout: &str) -> Result<ContainerState> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("State:"))
        .ok_or_else(|| HarnessError::Parse(format!("no State line in lxc-info output: {stdout:?}")))?
        .parse()
}

/// Rewrites a first-interface key, appending it if absent.
fn set_config_value(config: &str, (key, legacy): ConfigKeys, value: &str) -> String {
    let mut replaced = false;
    let mut out = String::with_capacity(config.len() + 32);
    for line in config.lines() {
        let found = line.split('=').next().unwrap_or("").trim();
        if found == key || found == legacy {
            if !replaced {
                out.push_str(&format!("{found} = {value}\n"));
                replaced = true;
            }
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    if !replaced {
        out.push_str(&format!("{key} = {value}\n"));
    }
    out
}

/// First column of `lxc-snapshot -L`; empty for "No snapshots".
fn parse_snapshot_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("No snapshots"))
        .filter_map(|l| l.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

// ── Lookup ──────────────────────────────────────────────────────────

/// Every container in the configured store.
pub fn list_all_containers(ctx: &HarnessContext) -> Result<Vec<String>> {
    let out = ctx.runner().run_checked(&ctx.lxc("lxc-ls").arg("-1"))?;
    Ok(out
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Exact-name lookup. `Ok(None)` when absent, `Err` when LXC itself fails.
pub fn find_container(ctx: &HarnessContext, name: &str) -> Result<Option<Container>> {
    Ok(list_all_containers(ctx)?
        .into_iter()
        .find(|c| c == name)
        .map(Container::existing))
}

fn require_container(ctx: &HarnessContext, name: &str) -> Result<Container> {
    find_container(ctx, name)?.ok_or_else(|| HarnessError::ContainerNotFound(name.to_string()))
}

// ── Provisioning ────────────────────────────────────────────────────

/// Creates one `run_<node>` container per node.
///
/// The first container is built from the download template, attached to
/// the host bridge and given the MeshLink tree; the rest are restored from
/// a snapshot of it, which is deleted afterwards so the base can still be
/// renamed. Stale
/// containers with the same names are destroyed first.
pub fn create_containers<S: AsRef<str>>(
    ctx: &HarnessContext,
    node_names: &[S],
) -> Result<Vec<Container>> {
    let nodes: Vec<&str> = node_names.iter().map(AsRef::as_ref).collect();
    let Some((first, rest)) = nodes.split_first() else {
        return Ok(Vec::new());
    };
    for node in &nodes {
        validate_node_name(node)?;
    }

    let existing = list_all_containers(ctx)?;
    for node in &nodes {
        let name = provisioned_name(node);
        if existing.iter().any(|c| *c == name) {
            tracing::warn!(container = %name, "removing stale container");
            let stale = Container::existing(name);
            let _ = stale.stop(ctx);
            stale.destroy(ctx)?;
        }
    }

    let cfg = ctx.config();
    let first_name = provisioned_name(first);
    tracing::info!(container = %first_name, arch = %cfg.paths.arch, "creating base container");
    ctx.runner().run_checked(
        &ctx.lxc("lxc-create")
            .args(["-n", first_name.as_str(), "-t", cfg.lxc.template.as_str()])
            .args([
                "--",
                "-d",
                cfg.lxc.distro.as_str(),
                "-r",
                cfg.lxc.release.as_str(),
                "-a",
                cfg.paths.arch.as_str(),
            ]),
    )?;
    let base = Container::existing(first_name);
    base.configure_uplink(ctx, &cfg.paths.lxc_bridge, &cfg.paths.eth_if_name)?;
    install_in_container(
        ctx,
        &base,
        &cfg.paths.meshlink_root,
        &cfg.node_sim.install_dir,
    )?;

    let mut containers = Vec::with_capacity(nodes.len());
    if !rest.is_empty() {
        let snapshot = base.snapshot(ctx)?;
        for node in rest {
            containers.push(base.restore_snapshot(ctx, &snapshot, &provisioned_name(node))?);
        }
        base.delete_snapshot(ctx, &snapshot)?;
    }
    containers.insert(0, base);
    Ok(containers)
}

/// Copies a host directory tree into the container's root filesystem.
pub fn install_in_container(
    ctx: &HarnessContext,
    container: &Container,
    src: &Path,
    dest: &str,
) -> Result<()> {
    let target = ctx.rootfs(container.name()).join(dest.trim_start_matches('/'));
    let target = target.display().to_string();
    tracing::info!(container = %container.name(), src = %src.display(), dest, "installing tree");
    ctx.runner()
        .run_checked(&CommandSpec::privileged("mkdir").args(["-p", target.as_str()]))?;
    ctx.runner().run_checked(
        &CommandSpec::privileged("cp").args(["-a", &format!("{}/.", src.display()), &target]),
    )?;
    Ok(())
}

/// Binds the provisioned containers to a test case: rename to
/// `<test_case>_<node>`, start, and resolve each address.
pub fn setup_containers(ctx: &mut HarnessContext, state: &BlackBoxState) -> Result<()> {
    validate_node_name(&state.test_case_name)?;
    for node in &state.node_names {
        let mut container = require_container(ctx, &provisioned_name(node))?;
        container.rename(ctx, &state.container_name(node))?;
        container.start(ctx)?;
        let ip = container_wait_ip(ctx, state, node)?;
        tracing::info!(test_case = %state.test_case_name, node = %node, %ip, "node container up");
    }
    Ok(())
}

/// Stops a test case's containers and returns them to the `run_<node>`
/// pool. Every node is attempted; the first error is reported.
pub fn teardown_containers(ctx: &mut HarnessContext, state: &BlackBoxState) -> Result<()> {
    let mut first_err = None;
    for node in &state.node_names {
        ctx.forget_ip(node);
        let result = (|| {
            let Some(mut container) = find_container(ctx, &state.container_name(node))? else {
                return Ok(());
            };
            container.stop(ctx)?;
            container.rename(ctx, &provisioned_name(node))
        })();
        if let Err(e) = result {
            tracing::warn!(node = %node, error = %e, "container teardown failed");
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

/// Destroys every container belonging to the given nodes, provisioned or
/// bound to a test case.
pub fn destroy_containers<S: AsRef<str>>(ctx: &mut HarnessContext, node_names: &[S]) -> Result<()> {
    ctx.clear_ips();
    let nat_container = ctx.config().nat.container.clone();
    for name in list_all_containers(ctx)? {
        let owned = name != nat_container
            && node_names.iter().any(|node| {
                let node = node.as_ref();
                name == provisioned_name(node) || name.ends_with(&format!("_{node}"))
            });
        if !owned {
            continue;
        }
        let container = Container::existing(name);
        if let Err(e) = container.stop(ctx) {
            tracing::warn!(container = %container.name(), error = %e, "stop before destroy failed");
        }
        container.destroy(ctx)?;
    }
    Ok(())
}

// ── Addresses ───────────────────────────────────────────────────────

/// One row of `lxc-ls -f -F NAME,IPV4`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRow {
    pub name: String,
    pub ipv4: Option<Ipv4Addr>,
}

/// Parses the fancy listing; the IPv4 column may hold several
/// comma-separated addresses, of which the first is used.
pub fn parse_ip_listing(stdout: &str) -> Result<Vec<ListingRow>> {
    let mut rows = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        let Some((name, rest)) = line
            .split_once(char::is_whitespace)
            .or(Some((line, "")))
            .filter(|(n, _)| !n.is_empty())
        else {
            continue;
        };
        if name == "NAME" {
            continue;
        }
        let field = rest.trim().split(',').next().unwrap_or("").trim();
        let ipv4 = if field.is_empty() || field == NO_ADDRESS {
            None
        } else {
            Some(
                field
                    .parse::<Ipv4Addr>()
                    .map_err(|e| HarnessError::Parse(format!("bad IPv4 {field:?} for {name}: {e}")))?,
            )
        };
        rows.push(ListingRow {
            name: name.to_string(),
            ipv4,
        });
    }
    Ok(rows)
}

/// Current address of a container, `None` while it has none.
pub fn query_ip(ctx: &HarnessContext, container: &str) -> Result<Option<Ipv4Addr>> {
    let out = ctx.runner().run_checked(
        &ctx.lxc("lxc-ls")
            .args(["-f", "-F", "NAME,IPV4", "--filter"])
            .arg(format!("^{}$", container.replace('.', "\\."))),
    )?;
    parse_ip_listing(&out.stdout)?
        .into_iter()
        .find(|row| row.name == container)
        .map(|row| row.ipv4)
        .ok_or_else(|| HarnessError::ContainerNotFound(container.to_string()))
}

/// Polls until the container reports an address or the IP deadline passes.
pub fn wait_for_ip(ctx: &HarnessContext, container: &str) -> Result<Ipv4Addr> {
    let t = &ctx.config().timeouts;
    let settings = PollSettings::new(t.poll_interval, t.ip_wait);
    poll_until(&format!("IPv4 address of {container}"), settings, || {
        query_ip(ctx, container)
    })
}

/// Resolves and caches the address of `node`'s test container.
pub fn container_wait_ip(
    ctx: &mut HarnessContext,
    state: &BlackBoxState,
    node: &str,
) -> Result<Ipv4Addr> {
    if !state.has_node(node) {
        return Err(HarnessError::UnknownNode(node.to_string()));
    }
    let ip = wait_for_ip(ctx, &state.container_name(node))?;
    ctx.cache_ip(node, ip);
    Ok(ip)
}
