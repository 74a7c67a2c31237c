use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{HarnessError, Result};

/// Paths and host wiring supplied on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    /// Root of the MeshLink source/build tree on the host.
    pub meshlink_root: PathBuf,
    /// LXC container store (`lxc-* -P`).
    pub lxc_path: PathBuf,
    /// Host bridge the node containers attach to.
    pub lxc_bridge: String,
    /// Name of each container's first interface (`lxc.net.0.name`); the
    /// NAT gateway masquerades out of it.
    pub eth_if_name: String,
    /// Container architecture passed to the download template.
    pub arch: String,
}

/// LXC provisioning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LxcConfig {
    pub template: String,
    pub distro: String,
    pub release: String,
    pub attach_program: String,
    pub use_sudo: bool,
}

impl Default for LxcConfig {
    fn default() -> Self {
        Self {
            template: "download".into(),
            distro: "ubuntu".into(),
            release: "jammy".into(),
            attach_program: "lxc-attach".into(),
            use_sudo: false,
        }
    }
}

/// Deadlines for every blocking wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub ip_wait: Duration,
    pub poll_interval: Duration,
    pub ready_wait: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ip_wait: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            ready_wait: Duration::from_secs(30),
        }
    }
}

/// Node simulator programs, relative to `install_dir` inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSimConfig {
    pub install_dir: String,
    pub binary: String,
    pub invite_binary: String,
    pub confbase_dir: String,
    /// Log line printed by the node simulator once the mesh is started.
    pub ready_line: String,
}

impl Default for NodeSimConfig {
    fn default() -> Self {
        Self {
            install_dir: "/meshlink".into(),
            binary: "test/blackbox/util/node_sim".into(),
            invite_binary: "test/blackbox/util/gen_invite".into(),
            confbase_dir: "/testconf".into(),
            ready_line: "meshlink started".into(),
        }
    }
}

impl NodeSimConfig {
    pub fn binary_path(&self) -> String {
        join_container_path(&self.install_dir, &self.binary)
    }

    pub fn invite_binary_path(&self) -> String {
        join_container_path(&self.install_dir, &self.invite_binary)
    }

    pub fn confbase(&self, node: &str) -> String {
        join_container_path(&self.confbase_dir, node)
    }
}

fn join_container_path(base: &str, rel: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), rel.trim_start_matches('/'))
}

/// Defaults for the simulated NAT gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatDefaults {
    pub container: String,
    pub bridge: String,
    pub interface: String,
    pub listen_addr: String,
    pub dhcp_range: String,
}

impl Default for NatDefaults {
    fn default() -> Self {
        Self {
            container: "nat_gateway".into(),
            bridge: "natbr0".into(),
            interface: "eth1".into(),
            listen_addr: "172.16.0.1".into(),
            dhcp_range: "172.16.0.2,172.16.0.254,12h".into(),
        }
    }
}

/// Complete harness configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub paths: HostPaths,
    pub lxc: LxcConfig,
    pub timeouts: Timeouts,
    pub node_sim: NodeSimConfig,
    pub nat: NatDefaults,
    /// Host directory for daemon logs.
    pub log_dir: PathBuf,
}

// ── TOML input ──────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigInput {
    #[serde(default)]
    lxc: LxcInput,
    #[serde(default)]
    timeouts: TimeoutsInput,
    #[serde(default)]
    node_sim: NodeSimInput,
    #[serde(default)]
    nat: NatInput,
    log_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LxcInput {
    template: Option<String>,
    distro: Option<String>,
    release: Option<String>,
    attach_program: Option<String>,
    use_sudo: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TimeoutsInput {
    ip_wait_secs: Option<u64>,
    poll_interval_ms: Option<u64>,
    ready_wait_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeSimInput {
    install_dir: Option<String>,
    binary: Option<String>,
    invite_binary: Option<String>,
    confbase_dir: Option<String>,
    ready_line: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct NatInput {
    container: Option<String>,
    bridge: Option<String>,
    interface: Option<String>,
    listen_addr: Option<String>,
    dhcp_range: Option<String>,
}

impl HarnessConfig {
    /// Defaults for everything not given on the command line.
    pub fn new(paths: HostPaths) -> Self {
        Self {
            paths,
            lxc: LxcConfig::default(),
            timeouts: Timeouts::default(),
            node_sim: NodeSimConfig::default(),
            nat: NatDefaults::default(),
            log_dir: std::env::temp_dir().join("meshbox-logs"),
        }
    }

    /// Layers an optional TOML document over the defaults.
    pub fn from_toml_str(paths: HostPaths, input: &str) -> Result<Self> {
        let mut cfg = Self::new(paths);
        if input.trim().is_empty() {
            return Ok(cfg);
        }
        let parsed: ConfigInput = toml::from_str(input)
            .map_err(|e| HarnessError::Config(format!("invalid config TOML: {e}")))?;

        let lxc = parsed.lxc;
        overlay(&mut cfg.lxc.template, lxc.template);
        overlay(&mut cfg.lxc.distro, lxc.distro);
        overlay(&mut cfg.lxc.release, lxc.release);
        overlay(&mut cfg.lxc.attach_program, lxc.attach_program);
        overlay(&mut cfg.lxc.use_sudo, lxc.use_sudo);

        let t = parsed.timeouts;
        overlay(&mut cfg.timeouts.ip_wait, t.ip_wait_secs.map(Duration::from_secs));
        overlay(
            &mut cfg.timeouts.poll_interval,
            t.poll_interval_ms.map(Duration::from_millis),
        );
        overlay(
            &mut cfg.timeouts.ready_wait,
            t.ready_wait_secs.map(Duration::from_secs),
        );

        let ns = parsed.node_sim;
        overlay(&mut cfg.node_sim.install_dir, ns.install_dir);
        overlay(&mut cfg.node_sim.binary, ns.binary);
        overlay(&mut cfg.node_sim.invite_binary, ns.invite_binary);
        overlay(&mut cfg.node_sim.confbase_dir, ns.confbase_dir);
        overlay(&mut cfg.node_sim.ready_line, ns.ready_line);

        let nat = parsed.nat;
        overlay(&mut cfg.nat.container, nat.container);
        overlay(&mut cfg.nat.bridge, nat.bridge);
        overlay(&mut cfg.nat.interface, nat.interface);
        overlay(&mut cfg.nat.listen_addr, nat.listen_addr);
        overlay(&mut cfg.nat.dhcp_range, nat.dhcp_range);

        overlay(&mut cfg.log_dir, parsed.log_dir);

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeouts.poll_interval.is_zero() {
            return Err(HarnessError::Config("poll interval must be non-zero".into()));
        }
        if self.timeouts.poll_interval > self.timeouts.ip_wait {
            return Err(HarnessError::Config(
                "poll interval exceeds the IP wait deadline".into(),
            ));
        }
        Ok(())
    }
}

fn overlay<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}
