use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

static NAME_SEQ: AtomicU32 = AtomicU32::new(0);

/// Whether this host can run the privileged end-to-end tests: root, and
/// the LXC tools plus `iptables` on `PATH`.
pub fn check_privileges() -> bool {
    let is_root = Command::new("id")
        .arg("-u")
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim() == "0")
        .unwrap_or(false);
    is_root
        && ["lxc-ls", "iptables", "ip"]
            .iter()
            .all(|tool| Command::new(tool).arg("--version").output().is_ok())
}

/// Name for a throwaway bridge, veth or test case: prefix, pid and a
/// per-process sequence number, cut to the 15-byte interface limit.
pub fn unique_name(prefix: &str) -> String {
    let seq = NAME_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = format!("{prefix}{:x}{seq}", std::process::id() & 0xffff);
    name.truncate(crate::topology::MAX_IFNAME_LEN);
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_names_fit_interface_limit() {
        let a = unique_name("br");
        let b = unique_name("br");
        assert_ne!(a, b);
        assert!(a.starts_with("br"));
        assert!(crate::topology::validate_interface_name(&a).is_ok());
        assert_eq!(unique_name("bbtest_long_bridge_").len(), 15);
    }
}
