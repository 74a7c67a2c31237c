//! `run_blackbox_tests`: provisions LXC node containers and runs the
//! MeshLink black-box scenarios against them.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use blackbox_runner::{run_all, scenarios, select_groups};
use blackbox_sim::{HarnessConfig, HarnessContext, HostPaths};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// MeshLink black-box test runner.
#[derive(Parser, Debug)]
#[command(name = "run_blackbox_tests", about = "MeshLink black-box tests on LXC")]
struct Cli {
    /// MeshLink source tree copied into every node container.
    meshlink_root: PathBuf,

    /// LXC container store.
    lxc_path: PathBuf,

    /// Host bridge the node containers attach to.
    lxc_bridge: String,

    /// Host uplink interface.
    eth_if_name: String,

    /// Container architecture, e.g. amd64.
    choose_arch: String,

    /// TOML file overriding LXC, timeout, node simulator and NAT settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run only this group. Repeatable.
    #[arg(long = "group", value_name = "NAME")]
    groups: Vec<String>,

    /// Write a JSON report here.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Print the available groups and cases, then exit.
    #[arg(long, default_value_t = false)]
    list: bool,
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let groups = select_groups(scenarios::builtin_groups(), &cli.groups)?;

    if cli.list {
        for group in &groups {
            println!("{} [{}]", group.name, group.nodes.join(", "));
            for case in group.case_names() {
                println!("  {case}");
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let paths = HostPaths {
        meshlink_root: cli.meshlink_root,
        lxc_path: cli.lxc_path,
        lxc_bridge: cli.lxc_bridge,
        eth_if_name: cli.eth_if_name,
        arch: cli.choose_arch,
    };
    let toml = match &cli.config {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => String::new(),
    };
    let config = HarnessConfig::from_toml_str(paths, &toml)?;
    config.validate()?;

    tracing::info!(
        lxc_path = %config.paths.lxc_path.display(),
        bridge = %config.paths.lxc_bridge,
        arch = %config.paths.arch,
        groups = groups.len(),
        "run_blackbox_tests starting"
    );

    let mut ctx = HarnessContext::new(config);
    let report = run_all(&mut ctx, &groups);
    report.log_summary();

    if let Some(path) = &cli.report {
        report
            .write_json(path)
            .with_context(|| format!("writing report {}", path.display()))?;
    }
    Ok(ExitCode::from(report.exit_code()))
}
