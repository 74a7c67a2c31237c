//! A simulated NAT gateway: a private bridge served by a router container
//! running dnsmasq and masquerading onto the LXC uplink bridge.
//!
//! Setup is a linear sequence of steps. If one fails, the completed steps
//! are undone in reverse so no half-built bridge or container is left on
//! the host.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::command::{CommandRunner, CommandSpec};
use crate::config::NatDefaults;
use crate::container::{validate_node_name, wait_for_ip, Container};
use crate::context::HarnessContext;
use crate::error::{HarnessError, Result};
use crate::exec::run_in_container;
use crate::topology::{create_bridge, interface_up, validate_interface_name};

/// Where the dnsmasq config lands inside the gateway container.
const DNSMASQ_CONF: &str = "etc/meshbox-dnsmasq.conf";

/// Describes one NAT gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatConfig {
    pub container: String,
    pub bridge: String,
    /// Gateway-side interface on the private bridge.
    pub interface: String,
    pub listen_addr: Ipv4Addr,
    /// dnsmasq `dhcp-range`: `start,end[,lease]`.
    pub dhcp_range: String,
}

impl NatConfig {
    pub fn from_defaults(defaults: &NatDefaults) -> Result<Self> {
        let listen_addr = defaults
            .listen_addr
            .parse()
            .map_err(|e| HarnessError::Config(format!("bad NAT listen address: {e}")))?;
        let cfg = Self {
            container: defaults.container.clone(),
            bridge: defaults.bridge.clone(),
            interface: defaults.interface.clone(),
            listen_addr,
            dhcp_range: defaults.dhcp_range.clone(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// First and last address handed out by DHCP.
    pub fn dhcp_bounds(&self) -> Result<(Ipv4Addr, Ipv4Addr)> {
        let mut parts = self.dhcp_range.split(',').map(str::trim);
        let mut next_addr = |label: &str| -> Result<Ipv4Addr> {
            parts
                .next()
                .ok_or_else(|| HarnessError::Config(format!("dhcp range lacks {label}")))?
                .parse()
                .map_err(|e| HarnessError::Config(format!("bad dhcp range {label}: {e}")))
        };
        let start = next_addr("start")?;
        let end = next_addr("end")?;
        Ok((start, end))
    }

    pub fn in_dhcp_range(&self, ip: Ipv4Addr) -> bool {
        match self.dhcp_bounds() {
            Ok((start, end)) => (start..=end).contains(&ip),
            Err(_) => false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_node_name(&self.container)?;
        validate_interface_name(&self.bridge)?;
        validate_interface_name(&self.interface)?;
        let (start, end) = self.dhcp_bounds()?;
        if start > end {
            return Err(HarnessError::Config(format!(
                "dhcp range start {start} is after end {end}"
            )));
        }
        let net = |ip: Ipv4Addr| u32::from(ip) >> 8;
        if net(start) != net(self.listen_addr) || net(end) != net(self.listen_addr) {
            return Err(HarnessError::Config(format!(
                "dhcp range {} is outside {}/24",
                self.dhcp_range, self.listen_addr
            )));
        }
        if self.in_dhcp_range(self.listen_addr) {
            return Err(HarnessError::Config(format!(
                "listen address {} is inside the dhcp range",
                self.listen_addr
            )));
        }
        Ok(())
    }

    fn dnsmasq_conf(&self) -> String {
        format!(
            "interface={}\nbind-interfaces\nlisten-address={}\ndhcp-range={}\n",
            self.interface, self.listen_addr, self.dhcp_range
        )
    }

    /// Second interface of the gateway, on the private bridge.
    fn private_interface_conf(&self) -> String {
        format!(
            "lxc.net.1.type = veth\n\
             lxc.net.1.link = {}\n\
             lxc.net.1.name = {}\n\
             lxc.net.1.flags = up\n\
             lxc.net.1.ipv4.address = {}/24\n",
            self.bridge, self.interface, self.listen_addr
        )
    }
}

/// A running NAT gateway. Torn down by [`NatLayer::destroy`] or on drop.
pub struct NatLayer {
    config: NatConfig,
    upstream_ip: Ipv4Addr,
    teardown: Teardown,
}

struct Teardown {
    runner: Arc<dyn CommandRunner>,
    lxc_path: PathBuf,
    container: Option<String>,
    bridge: Option<String>,
}

impl Teardown {
    fn lxc(&self, tool: &str, container: &str) -> CommandSpec {
        CommandSpec::privileged(tool).args([
            "-P".to_string(),
            self.lxc_path.display().to_string(),
            "-n".to_string(),
            container.to_string(),
        ])
    }

    /// Undoes whatever was set up, newest first.
    fn run(&mut self) -> Result<()> {
        let mut first_err = None;
        if let Some(container) = self.container.take() {
            let _ = self.runner.run(&self.lxc("lxc-stop", &container).arg("-k"));
            if let Err(e) = self
                .runner
                .run_checked(&self.lxc("lxc-destroy", &container).args(["-f", "-s"]))
            {
                tracing::warn!(container = %container, error = %e, "NAT container removal failed");
                first_err.get_or_insert(e);
            }
        }
        if let Some(bridge) = self.bridge.take() {
            let del = CommandSpec::privileged("ip").args(["link", "del", bridge.as_str()]);
            if let Err(e) = self.runner.run_checked(&del) {
                tracing::warn!(bridge = %bridge, error = %e, "NAT bridge removal failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

fn step<T>(name: &'static str, result: Result<T>) -> Result<T> {
    result.map_err(|e| HarnessError::NatSetup {
        step: name,
        source: Box::new(e),
    })
}

impl NatLayer {
    /// `create_bridge → bring_if_up → create_container_on_bridge →
    /// config_dnsmasq → config_nat`, rolling back on failure.
    pub fn create(ctx: &HarnessContext, config: NatConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            container = %config.container,
            bridge = %config.bridge,
            range = %config.dhcp_range,
            "creating NAT layer"
        );

        let mut teardown = Teardown {
            runner: ctx.runner_handle(),
            lxc_path: ctx.config().paths.lxc_path.clone(),
            container: None,
            bridge: None,
        };

        match Self::build(ctx, &config, &mut teardown) {
            Ok(upstream_ip) => {
                tracing::info!(container = %config.container, %upstream_ip, "NAT layer ready");
                Ok(Self {
                    config,
                    upstream_ip,
                    teardown,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "NAT layer setup failed, rolling back");
                if let Err(rollback) = teardown.run() {
                    tracing::warn!(error = %rollback, "NAT rollback incomplete");
                }
                Err(e)
            }
        }
    }

    fn build(ctx: &HarnessContext, config: &NatConfig, teardown: &mut Teardown) -> Result<Ipv4Addr> {
        step("create_bridge", create_bridge(ctx, &config.bridge))?;
        teardown.bridge = Some(config.bridge.clone());

        step("bring_if_up", interface_up(ctx, &config.bridge))?;

        let upstream_ip = step(
            "create_container_on_bridge",
            Self::create_gateway_container(ctx, config, teardown),
        )?;

        step("config_dnsmasq", Self::config_dnsmasq(ctx, config))?;
        step("config_nat", Self::config_nat(ctx, config))?;
        Ok(upstream_ip)
    }

    fn create_gateway_container(
        ctx: &HarnessContext,
        config: &NatConfig,
        teardown: &mut Teardown,
    ) -> Result<Ipv4Addr> {
        let lxc = &ctx.config().lxc;
        ctx.runner().run_checked(
            &ctx.lxc("lxc-create")
                .args(["-n", config.container.as_str(), "-t", lxc.template.as_str()])
                .args([
                    "--",
                    "-d",
                    lxc.distro.as_str(),
                    "-r",
                    lxc.release.as_str(),
                    "-a",
                    ctx.config().paths.arch.as_str(),
                ]),
        )?;
        teardown.container = Some(config.container.clone());

        let paths = &ctx.config().paths;
        Container::existing(config.container.as_str()).configure_uplink(
            ctx,
            &paths.lxc_bridge,
            &paths.eth_if_name,
        )?;
        let conf_path = ctx.container_config_path(&config.container);
        let mut conf = std::fs::read_to_string(&conf_path).unwrap_or_default();
        conf.push_str(&config.private_interface_conf());
        std::fs::write(&conf_path, conf)?;

        ctx.runner().run_checked(
            &ctx.lxc("lxc-start")
                .args(["-n", config.container.as_str(), "-d"]),
        )?;
        wait_for_ip(ctx, &config.container)
    }

    fn config_dnsmasq(ctx: &HarnessContext, config: &NatConfig) -> Result<()> {
        run_in_container(ctx, &config.container, "apt-get", ["install", "-y", "dnsmasq"])?;
        let conf_path = ctx.rootfs(&config.container).join(DNSMASQ_CONF);
        if let Some(parent) = conf_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&conf_path, config.dnsmasq_conf())?;
        run_in_container(
            ctx,
            &config.container,
            "dnsmasq",
            [format!("--conf-file=/{DNSMASQ_CONF}")],
        )?;
        Ok(())
    }

    fn config_nat(ctx: &HarnessContext, config: &NatConfig) -> Result<()> {
        run_in_container(ctx, &config.container, "sysctl", ["-w", "net.ipv4.ip_forward=1"])?;
        run_in_container(
            ctx,
            &config.container,
            "iptables",
            [
                "-t",
                "nat",
                "-A",
                "POSTROUTING",
                "-o",
                ctx.config().paths.eth_if_name.as_str(),
                "-j",
                "MASQUERADE",
            ],
        )?;
        Ok(())
    }

    pub fn config(&self) -> &NatConfig {
        &self.config
    }

    /// Gateway address on the uplink side.
    pub fn upstream_ip(&self) -> Ipv4Addr {
        self.upstream_ip
    }

    /// Moves a stopped node container behind this gateway.
    pub fn relink_container(&self, ctx: &HarnessContext, container: &Container) -> Result<()> {
        container.set_network_link(ctx, &self.config.bridge)
    }

    /// Reverse teardown: gateway container, then bridge.
    pub fn destroy(mut self) -> Result<()> {
        tracing::info!(container = %self.config.container, "destroying NAT layer");
        self.teardown.run()
    }
}

impl Drop for NatLayer {
    fn drop(&mut self) {
        if let Err(e) = self.teardown.run() {
            tracing::warn!(error = %e, "NAT layer cleanup during drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_context, FakeLxcHost};

    fn config() -> NatConfig {
        NatConfig::from_defaults(&NatDefaults::default()).unwrap()
    }

    #[test]
    fn dhcp_range_validation() {
        let cfg = config();
        assert_eq!(
            cfg.dhcp_bounds().unwrap(),
            (Ipv4Addr::new(172, 16, 0, 2), Ipv4Addr::new(172, 16, 0, 254))
        );
        assert!(cfg.in_dhcp_range(Ipv4Addr::new(172, 16, 0, 40)));
        assert!(!cfg.in_dhcp_range(Ipv4Addr::new(10, 0, 3, 40)));

        let outside = NatConfig {
            dhcp_range: "10.1.0.2,10.1.0.9".into(),
            ..config()
        };
        assert!(outside.validate().is_err());

        let reversed = NatConfig {
            dhcp_range: "172.16.0.9,172.16.0.2".into(),
            ..config()
        };
        assert!(reversed.validate().is_err());

        let overlapping = NatConfig {
            listen_addr: Ipv4Addr::new(172, 16, 0, 5),
            ..config()
        };
        assert!(overlapping.validate().is_err());

        let bad_bridge = NatConfig {
            bridge: "a-very-long-bridge-name".into(),
            ..config()
        };
        assert!(bad_bridge.validate().is_err());
    }

    #[test]
    fn create_and_destroy() {
        let host = Arc::new(FakeLxcHost::new());
        let (ctx, _dir) = fake_context(host.clone());

        let nat = NatLayer::create(&ctx, config()).unwrap();
        assert!(host.link("natbr0").unwrap().up);
        assert!(host.is_running("nat_gateway"));
        assert_eq!(nat.upstream_ip().octets()[..3], [10, 0, 3]);

        let dnsmasq = std::fs::read_to_string(ctx.rootfs("nat_gateway").join(DNSMASQ_CONF)).unwrap();
        assert!(dnsmasq.contains("dhcp-range=172.16.0.2,172.16.0.254,12h\n"));
        assert!(dnsmasq.contains("interface=eth1\n"));
        let lxc_conf = std::fs::read_to_string(ctx.container_config_path("nat_gateway")).unwrap();
        assert!(lxc_conf.contains("lxc.net.1.link = natbr0\n"));
        assert_eq!(host.count_commands("-- iptables -t nat -A POSTROUTING"), 1);

        nat.destroy().unwrap();
        assert!(host.link("natbr0").is_none());
        assert!(host.container_names().is_empty());
    }

    #[test]
    fn gateway_uplink_follows_host_paths() {
        let host = Arc::new(FakeLxcHost::new());
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = crate::testing::fake_config(dir.path());
        cfg.paths.lxc_bridge = "meshbr0".into();
        cfg.paths.eth_if_name = "uplink0".into();
        host.attach_store(dir.path());
        let ctx = HarnessContext::with_runner(cfg, host.clone());

        let nat = NatLayer::create(&ctx, config()).unwrap();
        assert_eq!(host.container_link("nat_gateway").as_deref(), Some("meshbr0"));
        let lxc_conf = std::fs::read_to_string(ctx.container_config_path("nat_gateway")).unwrap();
        assert!(lxc_conf.contains("lxc.net.0.name = uplink0\n"), "{lxc_conf}");
        assert_eq!(host.count_commands("POSTROUTING -o uplink0 -j MASQUERADE"), 1);
        assert_eq!(host.count_commands("-o eth0"), 0);
        nat.destroy().unwrap();
    }

    #[test]
    fn failed_step_rolls_back() {
        let host = Arc::new(FakeLxcHost::new());
        host.fail_on("dnsmasq --conf-file");
        let (ctx, _dir) = fake_context(host.clone());

        let err = NatLayer::create(&ctx, config()).err().expect("setup must fail");
        assert!(
            matches!(err, HarnessError::NatSetup { step: "config_dnsmasq", .. }),
            "{err}"
        );
        assert!(host.link("natbr0").is_none());
        assert!(host.container_names().is_empty());
    }

    #[test]
    fn failure_before_container_only_removes_bridge() {
        let host = Arc::new(FakeLxcHost::new());
        host.fail_on("lxc-create");
        let (ctx, _dir) = fake_context(host.clone());

        let err = NatLayer::create(&ctx, config()).err().unwrap();
        assert!(matches!(
            err,
            HarnessError::NatSetup { step: "create_container_on_bridge", .. }
        ));
        assert!(host.link("natbr0").is_none());
        assert_eq!(host.count_commands("lxc-destroy"), 0);
    }

    #[test]
    fn dropping_the_layer_cleans_up() {
        let host = Arc::new(FakeLxcHost::new());
        let (ctx, _dir) = fake_context(host.clone());
        drop(NatLayer::create(&ctx, config()).unwrap());
        assert!(host.link("natbr0").is_none());
        assert!(host.container_names().is_empty());
    }

    #[test]
    fn relink_points_node_at_private_bridge() {
        let host = Arc::new(FakeLxcHost::new());
        host.add_container("tc_peer", false);
        let (ctx, _dir) = fake_context(host.clone());
        let nat = NatLayer::create(&ctx, config()).unwrap();

        let peer = crate::container::find_container(&ctx, "tc_peer").unwrap().unwrap();
        nat.relink_container(&ctx, &peer).unwrap();
        assert_eq!(host.container_link("tc_peer").as_deref(), Some("natbr0"));
        nat.destroy().unwrap();
    }
}
