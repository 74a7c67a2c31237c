//! In-memory stand-ins for LXC, `ip` and `iptables`, so orchestration logic
//! can be tested without root or a container runtime.

mod fake_lxc;

pub use fake_lxc::{FakeLink, FakeLxcHost, LinkKind};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{HarnessConfig, HostPaths, Timeouts};
use crate::context::HarnessContext;

/// Configuration with millisecond deadlines rooted at `lxc_path`.
pub fn fake_config(lxc_path: &Path) -> HarnessConfig {
    let mut cfg = HarnessConfig::new(HostPaths {
        meshlink_root: "/src/meshlink".into(),
        lxc_path: lxc_path.to_path_buf(),
        lxc_bridge: "lxcbr0".into(),
        eth_if_name: "eth0".into(),
        arch: "amd64".into(),
    });
    cfg.timeouts = Timeouts {
        ip_wait: Duration::from_millis(300),
        poll_interval: Duration::from_millis(1),
        ready_wait: Duration::from_millis(300),
    };
    cfg.log_dir = lxc_path.join("logs");
    cfg
}

/// A context whose commands all go to `host`, with its container store at
/// `lxc_path`.
pub fn fake_harness(host: &Arc<FakeLxcHost>, lxc_path: &Path) -> HarnessContext {
    host.attach_store(lxc_path);
    HarnessContext::with_runner(fake_config(lxc_path), host.clone())
}

#[cfg(test)]
pub(crate) fn fake_context(host: Arc<FakeLxcHost>) -> (HarnessContext, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = fake_harness(&host, dir.path());
    (ctx, dir)
}
