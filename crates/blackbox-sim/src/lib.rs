//! Container topology toolkit for MeshLink black-box testing.
//!
//! Provisions LXC node containers, wires bridges, veth pairs and a
//! simulated NAT gateway, injects iptables faults and runs node simulator
//! daemons inside containers. Every operation takes an explicit
//! [`HarnessContext`] and reports failures as [`HarnessError`].

pub mod command;
pub mod config;
pub mod container;
pub mod context;
pub mod error;
pub mod exec;
pub mod firewall;
pub mod nat;
pub mod poll;
pub mod state;
pub mod topology;

pub mod test_util;
pub mod testing;

pub use command::{CommandOutput, CommandRunner, CommandSpec, ProcessHandle, SystemRunner};
pub use config::{HarnessConfig, HostPaths};
pub use context::HarnessContext;
pub use error::{HarnessError, Result};
pub use state::BlackBoxState;
