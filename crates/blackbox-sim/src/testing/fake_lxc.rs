use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::command::{CommandOutput, CommandRunner, CommandSpec, ProcessHandle};
use crate::error::{HarnessError, Result};
use crate::exec::READY_FILE_ENV;

const DEFAULT_LINK: &str = "lxcbr0";
const DEFAULT_SUBNET: [u8; 3] = [10, 0, 3];

type AttachHandler = Arc<dyn Fn(&str, &[String]) -> CommandOutput + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Bridge,
    Veth { peer: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeLink {
    pub kind: LinkKind,
    pub up: bool,
    pub master: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct FakeContainer {
    running: bool,
    ip: Option<Ipv4Addr>,
    polls_left: u32,
    snapshots: BTreeSet<String>,
    files: BTreeSet<String>,
}

#[derive(Default)]
struct Inner {
    store: Option<PathBuf>,
    containers: BTreeMap<String, FakeContainer>,
    links: BTreeMap<String, FakeLink>,
    chains: BTreeMap<String, Vec<String>>,
    modules: BTreeSet<String>,
    sysctls: BTreeMap<String, String>,
    history: Vec<CommandSpec>,
    spawned: Vec<CommandSpec>,
    failures: Vec<String>,
    attach_handler: Option<AttachHandler>,
    ip_delay_polls: u32,
    next_host: u32,
    subnets: BTreeMap<String, [u8; 3]>,
    daemon_output: String,
    daemon_exit: Option<i32>,
    daemon_touches_marker: bool,
    daemons: Vec<Arc<AtomicBool>>,
}

/// A scriptable host that models LXC containers, links and iptables
/// chains in memory.
///
/// Containers get addresses after a configurable number of `lxc-ls -f`
/// polls. Container config files are written under the attached store so
/// code that edits them works unchanged.
#[derive(Default)]
pub struct FakeLxcHost {
    inner: Mutex<Inner>,
}

fn opt<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn has(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// iptables prints bare IPv4 sources and destinations with a /32 suffix.
fn normalize_rule(tokens: &[String]) -> String {
    let mut out = Vec::with_capacity(tokens.len());
    let mut prev_is_addr_flag = false;
    for tok in tokens {
        if prev_is_addr_flag && !tok.contains('/') && tok.parse::<Ipv4Addr>().is_ok() {
            out.push(format!("{tok}/32"));
        } else {
            out.push(tok.clone());
        }
        prev_is_addr_flag = tok == "-s" || tok == "-d";
    }
    out.join(" ")
}

fn no_device(name: &str) -> CommandOutput {
    CommandOutput::failed(1, format!("Cannot find device \"{name}\""))
}

fn missing(name: &str) -> CommandOutput {
    CommandOutput::failed(1, format!("{name} doesn't exist"))
}

impl FakeLxcHost {
    pub fn new() -> Self {
        let host = Self::default();
        host.lock().next_host = 10;
        host
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── scripting ───────────────────────────────────────────────────

    /// Uses `path` as the container store and writes config files for the
    /// containers known so far.
    pub fn attach_store(&self, path: &Path) {
        let mut inner = self.lock();
        inner.store = Some(path.to_path_buf());
        let names: Vec<String> = inner.containers.keys().cloned().collect();
        for name in names {
            inner.write_config(&name, None);
        }
    }

    pub fn add_container(&self, name: &str, running: bool) {
        let mut inner = self.lock();
        inner.containers.insert(
            name.to_string(),
            FakeContainer {
                running,
                ..FakeContainer::default()
            },
        );
        inner.write_config(name, None);
    }

    /// Pre-populates a host iptables chain; `spec` excludes `-A <chain>`.
    pub fn add_rule(&self, chain: &str, spec: &str) {
        self.lock()
            .chains
            .entry(chain.to_string())
            .or_default()
            .push(spec.to_string());
    }

    /// Any command whose rendering contains `pattern` fails from now on.
    pub fn fail_on(&self, pattern: &str) {
        self.lock().failures.push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Handles commands run through `lxc-attach` (container name, argv).
    pub fn on_attach<F>(&self, handler: F)
    where
        F: Fn(&str, &[String]) -> CommandOutput + Send + Sync + 'static,
    {
        self.lock().attach_handler = Some(Arc::new(handler));
    }

    /// Number of `lxc-ls -f` polls a started container answers with `-`.
    pub fn set_ip_delay_polls(&self, polls: u32) {
        self.lock().ip_delay_polls = polls;
    }

    /// Addresses for containers linked to `bridge` come from `prefix.x`.
    pub fn set_subnet(&self, bridge: &str, prefix: [u8; 3]) {
        self.lock().subnets.insert(bridge.to_string(), prefix);
    }

    /// Text every spawned daemon writes to its log.
    pub fn set_daemon_output(&self, output: &str) {
        self.lock().daemon_output = output.to_string();
    }

    /// Spawned daemons exit immediately with this code.
    pub fn set_daemon_exit_code(&self, code: Option<i32>) {
        self.lock().daemon_exit = code;
    }

    /// Spawned daemons create their `$MESHBOX_READY_FILE`.
    pub fn set_daemon_touches_marker(&self, touch: bool) {
        self.lock().daemon_touches_marker = touch;
    }

    // ── inspection ──────────────────────────────────────────────────

    pub fn container_names(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.lock()
            .containers
            .get(name)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    pub fn link(&self, name: &str) -> Option<FakeLink> {
        self.lock().links.get(name).cloned()
    }

    /// `lxc.net.0.link` from the container's config file.
    pub fn container_link(&self, name: &str) -> Option<String> {
        self.lock().container_link(name)
    }

    /// Host chain rules in `iptables -S` order, without `-A <chain>`.
    pub fn rules(&self, chain: &str) -> Vec<String> {
        self.lock().chains.get(chain).cloned().unwrap_or_default()
    }

    /// Value written with `sysctl -w`, if any.
    pub fn sysctl(&self, key: &str) -> Option<String> {
        self.lock().sysctls.get(key).cloned()
    }

    pub fn history(&self) -> Vec<CommandSpec> {
        self.lock().history.clone()
    }

    pub fn count_commands(&self, pattern: &str) -> usize {
        self.lock()
            .history
            .iter()
            .filter(|c| c.to_string().contains(pattern))
            .count()
    }

    pub fn last_spawned(&self) -> Option<CommandSpec> {
        self.lock().spawned.last().cloned()
    }

    pub fn running_daemons(&self) -> usize {
        self.lock()
            .daemons
            .iter()
            .filter(|d| d.load(Ordering::SeqCst))
            .count()
    }
}

impl Inner {
    fn container_dir(&self, name: &str) -> Option<PathBuf> {
        self.store.as_ref().map(|s| s.join(name))
    }

    fn write_config(&self, name: &str, copy_from: Option<&str>) {
        let Some(dir) = self.container_dir(name) else {
            return;
        };
        let _ = std::fs::create_dir_all(dir.join("rootfs"));
        let config = dir.join("config");
        if config.exists() {
            return;
        }
        let content = copy_from
            .and_then(|src| self.container_dir(src))
            .and_then(|src| std::fs::read_to_string(src.join("config")).ok())
            .unwrap_or_else(|| {
                format!(
                    "lxc.uts.name = {name}\nlxc.net.0.type = veth\nlxc.net.0.link = {DEFAULT_LINK}\nlxc.net.0.flags = up\n"
                )
            });
        let _ = std::fs::write(config, content);
    }

    fn container_link(&self, name: &str) -> Option<String> {
        let config = std::fs::read_to_string(self.container_dir(name)?.join("config")).ok()?;
        config.lines().find_map(|line| {
            let (key, value) = line.split_once('=')?;
            (key.trim() == "lxc.net.0.link").then(|| value.trim().to_string())
        })
    }

    fn assign_ip(&mut self, name: &str) -> Ipv4Addr {
        let link = self
            .container_link(name)
            .unwrap_or_else(|| DEFAULT_LINK.to_string());
        let [a, b, c] = self.subnets.get(&link).copied().unwrap_or(DEFAULT_SUBNET);
        let host = 10 + (self.next_host - 10) % 240;
        self.next_host += 1;
        Ipv4Addr::new(a, b, c, host as u8)
    }

    fn lxc(&mut self, program: &str, args: &[String]) -> CommandOutput {
        let name = opt(args, "-n").unwrap_or_default().to_string();
        match program {
            "lxc-create" => {
                if self.containers.contains_key(&name) {
                    return CommandOutput::failed(1, format!("container {name} already exists"));
                }
                self.containers.insert(name.clone(), FakeContainer::default());
                self.write_config(&name, None);
                CommandOutput::ok("")
            }
            "lxc-snapshot" => {
                let Some(source) = self.containers.get_mut(&name) else {
                    return missing(&name);
                };
                if has(args, "-L") {
                    if source.snapshots.is_empty() {
                        return CommandOutput::ok("No snapshots\n");
                    }
                    let dir = self.store.clone().unwrap_or_default().join(&name).join("snaps");
                    let listing: String = source
                        .snapshots
                        .iter()
                        .map(|s| format!("{s} ({}) 2024:01:01 00:00:00\n", dir.display()))
                        .collect();
                    return CommandOutput::ok(listing);
                }
                if let Some(snap) = opt(args, "-d") {
                    return if source.snapshots.remove(snap) {
                        CommandOutput::ok("")
                    } else {
                        CommandOutput::failed(1, format!("snapshot {snap} not found"))
                    };
                }
                let Some(snap) = opt(args, "-r") else {
                    let free = (0..)
                        .map(|i| format!("snap{i}"))
                        .find(|s| !source.snapshots.contains(s))
                        .unwrap_or_default();
                    source.snapshots.insert(free);
                    return CommandOutput::ok("");
                };
                if !source.snapshots.contains(snap) {
                    return CommandOutput::failed(1, format!("snapshot {snap} not found"));
                }
                let new_name = opt(args, "-N").unwrap_or(&name).to_string();
                if self.containers.contains_key(&new_name) {
                    return CommandOutput::failed(1, format!("container {new_name} already exists"));
                }
                self.containers.insert(new_name.clone(), FakeContainer::default());
                self.write_config(&new_name, Some(&name));
                CommandOutput::ok("")
            }
            "lxc-copy" if has(args, "-R") => {
                let Some(new_name) = opt(args, "-N").map(str::to_string) else {
                    return CommandOutput::failed(1, "missing -N");
                };
                match self.containers.get(&name) {
                    None => return missing(&name),
                    Some(c) if c.running => {
                        return CommandOutput::failed(1, format!("{name} is running"))
                    }
                    Some(c) if !c.snapshots.is_empty() => {
                        return CommandOutput::failed(
                            1,
                            "Renaming a container with snapshots is not supported",
                        )
                    }
                    _ => {}
                }
                if self.containers.contains_key(&new_name) {
                    return CommandOutput::failed(1, format!("container {new_name} already exists"));
                }
                if let Some(c) = self.containers.remove(&name) {
                    self.containers.insert(new_name.clone(), c);
                }
                if let (Some(from), Some(to)) =
                    (self.container_dir(&name), self.container_dir(&new_name))
                {
                    let _ = std::fs::rename(from, to);
                }
                CommandOutput::ok("")
            }
            "lxc-start" => {
                let delay = self.ip_delay_polls;
                match self.containers.get_mut(&name) {
                    None => missing(&name),
                    Some(c) if c.running => CommandOutput::failed(1, format!("{name} is already running")),
                    Some(c) => {
                        c.running = true;
                        c.ip = None;
                        c.polls_left = delay;
                        CommandOutput::ok("")
                    }
                }
            }
            "lxc-stop" => match self.containers.get_mut(&name) {
                None => missing(&name),
                Some(c) if !c.running => CommandOutput::failed(2, format!("{name} is not running")),
                Some(c) => {
                    c.running = false;
                    c.ip = None;
                    CommandOutput::ok("")
                }
            },
            "lxc-destroy" => match self.containers.get(&name) {
                None => missing(&name),
                Some(c) if c.running && !has(args, "-f") => {
                    CommandOutput::failed(1, format!("{name} is running"))
                }
                Some(_) => {
                    self.containers.remove(&name);
                    if let Some(dir) = self.container_dir(&name) {
                        let _ = std::fs::remove_dir_all(dir);
                    }
                    CommandOutput::ok("")
                }
            },
            "lxc-info" => match self.containers.get(&name) {
                None => missing(&name),
                Some(c) => {
                    let state = if c.running { "RUNNING" } else { "STOPPED" };
                    CommandOutput::ok(format!("State:          {state}\n"))
                }
            },
            "lxc-ls" if has(args, "-f") => {
                let filter = opt(args, "--filter").map(|f| {
                    f.trim_start_matches('^')
                        .trim_end_matches('$')
                        .replace("\\.", ".")
                });
                let names: Vec<String> = self
                    .containers
                    .keys()
                    .filter(|n| filter.as_deref().map_or(true, |f| n.as_str() == f))
                    .cloned()
                    .collect();
                let mut out = String::from("NAME IPV4\n");
                for n in names {
                    let needs_ip = {
                        let c = &self.containers[&n];
                        c.running && c.ip.is_none()
                    };
                    if needs_ip {
                        let due = self.containers[&n].polls_left == 0;
                        if due {
                            let ip = self.assign_ip(&n);
                            if let Some(c) = self.containers.get_mut(&n) {
                                c.ip = Some(ip);
                            }
                        } else if let Some(c) = self.containers.get_mut(&n) {
                            // u32::MAX means the address never arrives
                            if c.polls_left != u32::MAX {
                                c.polls_left -= 1;
                            }
                        }
                    }
                    let ip = self.containers[&n]
                        .ip
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "-".into());
                    out.push_str(&format!("{n} {ip}\n"));
                }
                CommandOutput::ok(out)
            }
            "lxc-ls" => {
                let mut out = String::new();
                for n in self.containers.keys() {
                    out.push_str(n);
                    out.push('\n');
                }
                CommandOutput::ok(out)
            }
            _ => CommandOutput::ok(""),
        }
    }

    fn ip_link(&mut self, args: &[String]) -> CommandOutput {
        let Some(name) = args.get(2).cloned() else {
            return CommandOutput::failed(1, "usage");
        };
        match args.get(1).map(String::as_str) {
            Some("add") => {
                if self.links.contains_key(&name) {
                    return CommandOutput::failed(2, "RTNETLINK answers: File exists");
                }
                match opt(args, "type") {
                    Some("bridge") => {
                        self.links.insert(
                            name,
                            FakeLink {
                                kind: LinkKind::Bridge,
                                up: false,
                                master: None,
                            },
                        );
                    }
                    Some("veth") => {
                        let Some(peer) = opt(args, "name").map(str::to_string) else {
                            return CommandOutput::failed(1, "veth needs a peer name");
                        };
                        self.links.insert(
                            peer.clone(),
                            FakeLink {
                                kind: LinkKind::Veth { peer: name.clone() },
                                up: false,
                                master: None,
                            },
                        );
                        self.links.insert(
                            name,
                            FakeLink {
                                kind: LinkKind::Veth { peer },
                                up: false,
                                master: None,
                            },
                        );
                    }
                    _ => return CommandOutput::failed(1, "unsupported link type"),
                }
                CommandOutput::ok("")
            }
            Some("del") => match self.links.remove(&name) {
                None => no_device(&name),
                Some(link) => {
                    if let LinkKind::Veth { peer } = link.kind {
                        self.links.remove(&peer);
                    }
                    CommandOutput::ok("")
                }
            },
            Some("set") => {
                let master = opt(args, "master").map(str::to_string);
                if let Some(bridge) = &master {
                    if !self.links.contains_key(bridge) {
                        return CommandOutput::failed(1, format!("Cannot find device \"{bridge}\""));
                    }
                }
                let Some(link) = self.links.get_mut(&name) else {
                    return no_device(&name);
                };
                if has(args, "up") {
                    link.up = true;
                }
                if has(args, "down") {
                    link.up = false;
                }
                if master.is_some() {
                    link.master = master;
                }
                CommandOutput::ok("")
            }
            _ => CommandOutput::ok(""),
        }
    }

    fn iptables(&mut self, args: &[String]) -> CommandOutput {
        let (table, rest) = match args {
            [t, table, rest @ ..] if t == "-t" => (table.as_str(), rest),
            rest => ("filter", rest),
        };
        let key = |chain: &str| {
            if table == "filter" {
                chain.to_string()
            } else {
                format!("{table}:{chain}")
            }
        };
        match rest {
            [op, chain, spec @ ..] if op == "-I" || op == "-A" => {
                let rule = normalize_rule(spec);
                let rules = self.chains.entry(key(chain)).or_default();
                if op == "-I" {
                    rules.insert(0, rule);
                } else {
                    rules.push(rule);
                }
                CommandOutput::ok("")
            }
            [op, chain, spec @ ..] if op == "-D" => {
                let rule = normalize_rule(spec);
                let rules = self.chains.entry(key(chain)).or_default();
                match rules.iter().position(|r| *r == rule) {
                    Some(i) => {
                        rules.remove(i);
                        CommandOutput::ok("")
                    }
                    None => CommandOutput::failed(
                        1,
                        "iptables: Bad rule (does a matching rule exist in that chain?).",
                    ),
                }
            }
            [op, chain] if op == "-S" => {
                let mut out = format!("-P {chain} ACCEPT\n");
                for rule in self.chains.get(&key(chain)).into_iter().flatten() {
                    out.push_str(&format!("-A {chain} {rule}\n"));
                }
                CommandOutput::ok(out)
            }
            _ => CommandOutput::ok(""),
        }
    }

    fn modprobe(&mut self, args: &[String]) -> CommandOutput {
        self.modules.extend(args.iter().filter(|a| !a.starts_with('-')).cloned());
        CommandOutput::ok("")
    }

    /// `net.bridge.*` keys exist only once `br_netfilter` is loaded.
    fn sysctl(&mut self, args: &[String]) -> CommandOutput {
        let Some(setting) = opt(args, "-w") else {
            return CommandOutput::failed(1, "only sysctl -w is modelled");
        };
        let Some((key, value)) = setting.split_once('=') else {
            return CommandOutput::failed(1, format!("sysctl: malformed setting \"{setting}\""));
        };
        if key.starts_with("net.bridge.") && !self.modules.contains("br_netfilter") {
            let path = key.replace('.', "/");
            return CommandOutput::failed(
                255,
                format!("sysctl: cannot stat /proc/sys/{path}: No such file or directory"),
            );
        }
        self.sysctls.insert(key.to_string(), value.to_string());
        CommandOutput::ok(format!("{key} = {value}\n"))
    }
}

impl CommandRunner for FakeLxcHost {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let rendered = spec.to_string();
        let mut inner = self.lock();
        inner.history.push(spec.clone());
        if inner.failures.iter().any(|p| rendered.contains(p.as_str())) {
            return Ok(CommandOutput::failed(1, "injected failure"));
        }

        let args = spec.args.as_slice();
        let output = match spec.program.as_str() {
            "lxc-attach" => {
                let name = opt(args, "-n").unwrap_or_default().to_string();
                let argv: Vec<String> = args
                    .iter()
                    .position(|a| a == "--")
                    .map(|i| args[i + 1..].to_vec())
                    .unwrap_or_default();
                let container = match inner.containers.get(&name) {
                    None => return Ok(missing(&name)),
                    Some(c) if !c.running => {
                        return Ok(CommandOutput::failed(1, format!("{name} is not running")))
                    }
                    Some(c) => c,
                };
                if let [test, flag, path] = argv.as_slice() {
                    if test == "test" && flag == "-e" {
                        return Ok(if container.files.contains(path) {
                            CommandOutput::ok("")
                        } else {
                            CommandOutput::failed(1, "")
                        });
                    }
                }
                let handler = inner.attach_handler.clone();
                drop(inner);
                match handler {
                    Some(handler) => handler(&name, &argv),
                    None => CommandOutput::ok(""),
                }
            }
            "ip" if args.first().map(String::as_str) == Some("link") => inner.ip_link(args),
            "iptables" => inner.iptables(args),
            "modprobe" => inner.modprobe(args),
            "sysctl" => inner.sysctl(args),
            program if program.starts_with("lxc-") => inner.lxc(program, args),
            _ => CommandOutput::ok(""),
        };
        Ok(output)
    }

    fn spawn(&self, spec: &CommandSpec, log_path: &Path) -> Result<Box<dyn ProcessHandle>> {
        let rendered = spec.to_string();
        let mut inner = self.lock();
        inner.history.push(spec.clone());
        inner.spawned.push(spec.clone());
        if inner.failures.iter().any(|p| rendered.contains(p.as_str())) {
            return Err(HarnessError::Io(std::io::Error::other("injected spawn failure")));
        }

        std::fs::write(log_path, &inner.daemon_output)?;

        if inner.daemon_touches_marker {
            let container = opt(&spec.args, "-n").unwrap_or_default().to_string();
            let marker = spec
                .args
                .iter()
                .find_map(|a| a.strip_prefix(&format!("{READY_FILE_ENV}=")).map(str::to_string));
            if let (Some(marker), Some(c)) = (marker, inner.containers.get_mut(&container)) {
                c.files.insert(marker);
            }
        }

        let running = Arc::new(AtomicBool::new(inner.daemon_exit.is_none()));
        inner.daemons.push(running.clone());
        static PIDS: AtomicU32 = AtomicU32::new(40_000);
        Ok(Box::new(FakeProcess {
            id: PIDS.fetch_add(1, Ordering::Relaxed),
            running,
            exit: inner.daemon_exit,
        }))
    }
}

struct FakeProcess {
    id: u32,
    running: Arc<AtomicBool>,
    exit: Option<i32>,
}

impl ProcessHandle for FakeProcess {
    fn id(&self) -> u32 {
        self.id
    }

    fn is_running(&mut self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn exit_code(&mut self) -> Option<i32> {
        if self.is_running() {
            None
        } else {
            self.exit
        }
    }

    fn kill(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(program: &str, args: &[&str]) -> CommandSpec {
        CommandSpec::new(program).args(args.iter().copied())
    }

    #[test]
    fn bridge_sysctls_need_the_module() {
        let host = FakeLxcHost::new();
        let set = spec("sysctl", &["-w", "net.bridge.bridge-nf-call-iptables=1"]);
        assert!(!host.run(&set).unwrap().success());
        assert_eq!(host.sysctl("net.bridge.bridge-nf-call-iptables"), None);

        host.run(&spec("modprobe", &["br_netfilter"])).unwrap();
        assert!(host.run(&set).unwrap().success());
        assert_eq!(host.sysctl("net.bridge.bridge-nf-call-iptables").as_deref(), Some("1"));
    }

    #[test]
    fn iptables_chain_model() {
        let host = FakeLxcHost::new();
        host.run(&spec("iptables", &["-A", "FORWARD", "-j", "ACCEPT"])).unwrap();
        host.run(&spec("iptables", &["-I", "FORWARD", "-s", "10.0.3.4", "-j", "DROP"]))
            .unwrap();
        assert_eq!(host.rules("FORWARD"), ["-s 10.0.3.4/32 -j DROP", "-j ACCEPT"]);

        let out = host.run(&spec("iptables", &["-S", "FORWARD"])).unwrap();
        assert_eq!(
            out.stdout,
            "-P FORWARD ACCEPT\n-A FORWARD -s 10.0.3.4/32 -j DROP\n-A FORWARD -j ACCEPT\n"
        );

        let missing = host
            .run(&spec("iptables", &["-D", "FORWARD", "-d", "1.2.3.4", "-j", "DROP"]))
            .unwrap();
        assert!(!missing.success());
    }

    #[test]
    fn ip_delay_counts_polls() {
        let host = FakeLxcHost::new();
        host.set_ip_delay_polls(1);
        host.add_container("c1", false);
        host.run(&spec("lxc-start", &["-n", "c1", "-d"])).unwrap();
        let ls = spec("lxc-ls", &["-f", "-F", "NAME,IPV4"]);
        assert_eq!(host.run(&ls).unwrap().stdout, "NAME IPV4\nc1 -\n");
        assert_eq!(host.run(&ls).unwrap().stdout, "NAME IPV4\nc1 10.0.3.10\n");
    }

    #[test]
    fn injected_failures_match_rendering() {
        let host = FakeLxcHost::new();
        host.fail_on("lxc-start -n c1");
        host.add_container("c1", false);
        assert!(!host.run(&spec("lxc-start", &["-n", "c1"])).unwrap().success());
        host.clear_failures();
        assert!(host.run(&spec("lxc-start", &["-n", "c1"])).unwrap().success());
        assert_eq!(host.count_commands("lxc-start"), 2);
    }
}
