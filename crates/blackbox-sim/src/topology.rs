//! Host network primitives: bridges, veth pairs and link state.

use crate::command::CommandSpec;
use crate::context::HarnessContext;
use crate::error::{HarnessError, Result};

/// Linux interface name limit (IFNAMSIZ - 1).
pub const MAX_IFNAME_LEN: usize = 15;

/// Rejects names the kernel would refuse for a network interface.
pub fn validate_interface_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_IFNAME_LEN
        && name != "."
        && name != ".."
        && !name
            .chars()
            .any(|c| c == '/' || c == ':' || c.is_whitespace() || c.is_control());
    if valid {
        Ok(())
    } else {
        Err(HarnessError::InvalidName(name.to_string()))
    }
}

fn ip_link(args: &[&str]) -> CommandSpec {
    CommandSpec::privileged("ip").arg("link").args(args.iter().copied())
}

pub fn create_bridge(ctx: &HarnessContext, name: &str) -> Result<()> {
    validate_interface_name(name)?;
    tracing::info!(bridge = name, "creating bridge");
    ctx.runner()
        .run_checked(&ip_link(&["add", name, "type", "bridge"]))?;
    Ok(())
}

pub fn delete_bridge(ctx: &HarnessContext, name: &str) -> Result<()> {
    tracing::info!(bridge = name, "deleting bridge");
    // a bridge must be down before removal on older kernels
    let _ = ctx.runner().run(&ip_link(&["set", name, "down"]));
    delete_link(ctx, name)
}

/// Creates a veth pair on the host. Any leftover link named `local` is
/// removed first.
pub fn create_veth_pair(ctx: &HarnessContext, local: &str, peer: &str) -> Result<()> {
    validate_interface_name(local)?;
    validate_interface_name(peer)?;
    let _ = ctx.runner().run(&ip_link(&["del", local]));

    tracing::info!(local, peer, "creating veth pair");
    ctx.runner().run_checked(&ip_link(&[
        "add", local, "type", "veth", "peer", "name", peer,
    ]))?;
    Ok(())
}

pub fn delete_link(ctx: &HarnessContext, name: &str) -> Result<()> {
    ctx.runner().run_checked(&ip_link(&["del", name]))?;
    Ok(())
}

pub fn interface_up(ctx: &HarnessContext, name: &str) -> Result<()> {
    ctx.runner().run_checked(&ip_link(&["set", name, "up"]))?;
    Ok(())
}

pub fn interface_down(ctx: &HarnessContext, name: &str) -> Result<()> {
    ctx.runner().run_checked(&ip_link(&["set", name, "down"]))?;
    Ok(())
}

/// Enslaves `iface` to `bridge`.
pub fn attach_to_bridge(ctx: &HarnessContext, iface: &str, bridge: &str) -> Result<()> {
    ctx.runner()
        .run_checked(&ip_link(&["set", iface, "master", bridge]))?;
    Ok(())
}
