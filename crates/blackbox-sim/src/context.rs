use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::command::{CommandRunner, CommandSpec, SystemRunner};
use crate::config::HarnessConfig;

/// Everything an orchestration call needs: configuration, the command
/// runner and the per-node address cache.
///
/// Passed explicitly into every operation; the harness keeps no global
/// state.
pub struct HarnessContext {
    config: HarnessConfig,
    runner: Arc<dyn CommandRunner>,
    ips: BTreeMap<String, Ipv4Addr>,
}

impl HarnessContext {
    /// Context backed by real subprocesses on this host.
    pub fn new(config: HarnessConfig) -> Self {
        let runner = Arc::new(SystemRunner::new(config.lxc.use_sudo));
        Self::with_runner(config, runner)
    }

    pub fn with_runner(config: HarnessConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            ips: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    /// Shared handle for guards that clean up after themselves on drop.
    pub fn runner_handle(&self) -> Arc<dyn CommandRunner> {
        Arc::clone(&self.runner)
    }

    /// An LXC tool invocation scoped to the configured container store.
    pub fn lxc(&self, tool: &str) -> CommandSpec {
        CommandSpec::privileged(tool).args([
            "-P".to_string(),
            self.config.paths.lxc_path.display().to_string(),
        ])
    }

    /// Host path of a container's root filesystem.
    pub fn rootfs(&self, container: &str) -> PathBuf {
        self.config.paths.lxc_path.join(container).join("rootfs")
    }

    /// Host path of a container's LXC config file.
    pub fn container_config_path(&self, container: &str) -> PathBuf {
        self.config.paths.lxc_path.join(container).join("config")
    }

    pub(crate) fn cache_ip(&mut self, node: &str, ip: Ipv4Addr) {
        self.ips.insert(node.to_string(), ip);
    }

    pub(crate) fn forget_ip(&mut self, node: &str) {
        self.ips.remove(node);
    }

    pub(crate) fn clear_ips(&mut self) {
        self.ips.clear();
    }

    /// Address of a node resolved earlier by
    /// [`container_wait_ip`](crate::container::container_wait_ip).
    pub fn get_container_ip(&self, node: &str) -> Option<Ipv4Addr> {
        self.ips.get(node).copied()
    }
}
