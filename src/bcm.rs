//! Bright Cluster Manager layout and Slurm role discovery.
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::command::Shell;
use crate::*;

pub const CMD_CONF: &str = "/cm/local/apps/cmd/etc/cmd.conf";
pub const CMSH_LOCATIONS: &[&str] = &["/cm/local/apps/cmd/bin/cmsh", "/usr/bin/cmsh"];
pub const SHARED_SLURM: &str = "/cm/shared/apps/slurm";
pub const LOCAL_SLURM: &str = "/cm/local/apps/slurm";

/// Every BCM role that puts a Slurm daemon or client on a node.
pub const SLURM_ROLES: &[&str] = &["slurmserver", "slurmaccounting", "slurmclient", "slurmsubmit"];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BcmEnvironment {
    /// Major BCM version, e.g. 10 or 11.
    pub version: Option<u32>,
    pub slurm_base_path: Option<PathBuf>,
    pub cmsh_path: Option<PathBuf>,
    /// Nodes carrying the `slurmserver` role (run slurmctld).
    pub controller_nodes: Vec<String>,
    /// Nodes carrying the `slurmaccounting` role (run slurmdbd).
    pub accounting_nodes: Vec<String>,
}

pub fn parse_bcm_version(cmd_conf: &str) -> Option<u32> {
    lazy_static::lazy_static! {
        static ref VERSION: Regex = Regex::new(r"VERSION\s+(\d+)\.").unwrap();
    }
    VERSION
        .captures(cmd_conf)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// BCM 10 keeps Slurm on the shared filesystem, 11 and later install it per node.
pub fn slurm_base_for_version(version: u32) -> Option<&'static str> {
    match version {
        10 => Some(SHARED_SLURM),
        v if v >= 11 => Some(LOCAL_SLURM),
        _ => None,
    }
}

fn push_unique(nodes: &mut Vec<String>, node: &str) {
    if !nodes.iter().any(|n| n == node) {
        nodes.push(node.to_string());
    }
}

/// Roles found in `cmsh -c "device; show -l"`.  Returns (controllers, accounting).
///
/// A line starting with a non-blank word names the device that the following
/// indented lines belong to.
pub fn parse_device_roles(output: &str) -> (Vec<String>, Vec<String>) {
    let mut controllers = vec![];
    let mut accounting = vec![];
    let mut current: Option<&str> = None;
    for line in output.lines() {
        if !line.starts_with(char::is_whitespace) {
            if let Some(word) = line.split_whitespace().next() {
                if line.len() > word.len() {
                    current = Some(word);
                }
            }
        }
        if let Some(node) = current {
            let lower = line.to_lowercase();
            if lower.contains("slurmserver") {
                push_unique(&mut controllers, node);
            }
            if lower.contains("slurmaccounting") {
                push_unique(&mut accounting, node);
            }
        }
    }
    (controllers, accounting)
}

/// Node names from `cmsh -c "device; list -l <role>"` rows such as
/// `PhysicalNode  node001  FA:16:3E:...  default  10.141.0.1 ...`.
pub fn parse_physical_nodes(output: &str) -> Vec<String> {
    let mut nodes = vec![];
    for line in non_empty_lines(output) {
        if !line.contains("PhysicalNode") {
            continue;
        }
        if let Some(name) = line.split_whitespace().nth(1) {
            push_unique(&mut nodes, name);
        }
    }
    nodes
}

/// Last resort: anything in `configurationoverlay; show` that looks like a controller name.
pub fn parse_overlay_controllers(output: &str) -> Vec<String> {
    lazy_static::lazy_static! {
        static ref CONTROLLER: Regex =
            Regex::new(r"(?i)\b([\w-]+(?:ctl|controller|slurm)[\w-]*)\b").unwrap();
    }
    let mut nodes = vec![];
    for c in CONTROLLER.captures_iter(output) {
        push_unique(&mut nodes, &c[1]);
    }
    nodes
}

/// The configured cmsh, or the first one installed in a standard location.
pub fn find_cmsh(config: &Config) -> Option<PathBuf> {
    config.cmsh.clone().or_else(|| {
        CMSH_LOCATIONS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    })
}

/// Hostnames holding any of [`SLURM_ROLES`], sorted and without duplicates.
///
/// `foreach -l <role> (get hostname)` prints one full hostname per line, unlike
/// `list -l` which truncates long names.
pub fn discover_role_nodes<S: Shell + ?Sized>(shell: &S, cmsh: &str) -> Vec<String> {
    let mut nodes = BTreeSet::new();
    for role in SLURM_ROLES {
        let cmd = format!("device; foreach -l {} (get hostname)", role);
        let out = shell.run(cmsh, &["-c", &cmd]);
        if !out.success() {
            log::warn!("failed to list devices for role {}: {}", role, out.error_text());
            continue;
        }
        let found: Vec<_> = non_empty_lines(&out.stdout).collect();
        if !found.is_empty() {
            log::debug!("{} node(s) with role {}: {}", found.len(), role, found.join(", "));
        }
        nodes.extend(found.into_iter().map(String::from));
    }
    nodes.into_iter().collect()
}

impl BcmEnvironment {
    /// Inspect the local filesystem and cmsh.  Never fails; anything not found stays empty.
    pub fn detect<S: Shell + ?Sized>(shell: &S, config: &Config) -> Self {
        let mut env = BcmEnvironment::default();

        if let Ok(text) = std::fs::read_to_string(CMD_CONF) {
            env.version = parse_bcm_version(&text);
        }
        env.slurm_base_path = env
            .version
            .and_then(slurm_base_for_version)
            .map(PathBuf::from);

        if env.slurm_base_path.is_none() {
            if Path::new(SHARED_SLURM).join("current").exists() {
                env.slurm_base_path = Some(SHARED_SLURM.into());
                env.version = Some(10);
            } else if Path::new(LOCAL_SLURM).join("current").exists() {
                env.slurm_base_path = Some(LOCAL_SLURM.into());
                env.version = Some(11);
            }
        }

        env.cmsh_path = find_cmsh(config);
        log::debug!(
            "BCM version {:?}, slurm base {:?}, cmsh {:?}",
            env.version,
            env.slurm_base_path,
            env.cmsh_path
        );

        if let Some(cmsh) = env.cmsh_path.clone() {
            env.discover_slurm_nodes(shell, &cmsh.to_string_lossy());
        }
        env
    }

    pub fn discover_slurm_nodes<S: Shell + ?Sized>(&mut self, shell: &S, cmsh: &str) {
        let out = shell.run(cmsh, &["-c", "device; show -l"]);
        if out.success() {
            let (controllers, accounting) = parse_device_roles(&out.stdout);
            for n in &controllers {
                push_unique(&mut self.controller_nodes, n);
            }
            for n in &accounting {
                push_unique(&mut self.accounting_nodes, n);
            }
        }

        let out = shell.run(cmsh, &["-c", "device; list -l slurmserver"]);
        if out.success() {
            for n in parse_physical_nodes(&out.stdout) {
                push_unique(&mut self.controller_nodes, &n);
            }
        }

        let out = shell.run(cmsh, &["-c", "device; list -l slurmaccounting"]);
        if out.success() {
            for n in parse_physical_nodes(&out.stdout) {
                push_unique(&mut self.accounting_nodes, &n);
            }
        }

        if self.controller_nodes.is_empty() {
            let out = shell.run(cmsh, &["-c", "configurationoverlay; show"]);
            if out.success() {
                self.controller_nodes = parse_overlay_controllers(&out.stdout);
            }
        }
        log::debug!(
            "controllers: {:?}, accounting: {:?}",
            self.controller_nodes,
            self.accounting_nodes
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::ScriptedShell;

    #[test]
    fn bcm_version() {
        assert_eq!(parse_bcm_version("# cmd\nVERSION 10.24.03\n"), Some(10));
        assert_eq!(parse_bcm_version("VERSION   11.0-1"), Some(11));
        assert_eq!(parse_bcm_version("VERSION unknown"), None);
        assert_eq!(slurm_base_for_version(10), Some(SHARED_SLURM));
        assert_eq!(slurm_base_for_version(12), Some(LOCAL_SLURM));
        assert_eq!(slurm_base_for_version(9), None);
    }

    #[test]
    fn device_roles() {
        let out = "\
head01     HeadNode   boot,slurmserver
  roles    slurmaccounting
node001    PhysicalNode  slurmclient
  roles    slurmclient
ctl02 Roles: SlurmServer
";
        let (ctl, acct) = parse_device_roles(out);
        assert_eq!(ctl, ["head01", "ctl02"]);
        assert_eq!(acct, ["head01"]);
    }

    #[test]
    fn physical_node_rows() {
        let out = "\
Type          Hostname   MAC                Category  IP
------------- ---------- ------------------ --------- -----------
PhysicalNode  ctl01      FA:16:3E:00:00:01  default   10.141.0.1
PhysicalNode  ctl02      FA:16:3E:00:00:02  default   10.141.0.2
PhysicalNode  ctl01      FA:16:3E:00:00:01  default   10.141.0.1
";
        assert_eq!(parse_physical_nodes(out), ["ctl01", "ctl02"]);
    }

    #[test]
    fn overlay_fallback() {
        let out = "Nodes        slurmctl-01,slurmctl-02\nCategories   default\n";
        assert_eq!(parse_overlay_controllers(out), ["slurmctl-01", "slurmctl-02"]);
    }

    #[test]
    fn role_nodes_are_merged_and_sorted() {
        let shell = ScriptedShell::new()
            .ok("cmsh -c device; foreach -l slurmserver (get hostname)", "head01\n")
            .ok(
                "cmsh -c device; foreach -l slurmaccounting (get hostname)",
                "head01\n\n",
            )
            .ok(
                "cmsh -c device; foreach -l slurmclient (get hostname)",
                "node002\nnode001\n",
            )
            .fail("cmsh -c device; foreach -l slurmsubmit (get hostname)", 1, "no such role");
        assert_eq!(discover_role_nodes(&shell, "cmsh"), ["head01", "node001", "node002"]);
        assert_eq!(shell.calls.borrow().len(), SLURM_ROLES.len());
        assert!(shell.limits.borrow().iter().all(|l| l.as_secs() == 20));

        assert!(discover_role_nodes(&ScriptedShell::new(), "cmsh").is_empty());
    }

    #[test]
    fn configured_cmsh_wins() {
        let config = Config {
            cmsh: Some("/opt/cm/bin/cmsh".into()),
            ..Config::default()
        };
        assert_eq!(find_cmsh(&config), Some(PathBuf::from("/opt/cm/bin/cmsh")));
    }

    #[test]
    fn discovery_merges_sources() {
        let shell = ScriptedShell::new()
            .ok("cmsh -c device; show -l", "head01  HeadNode slurmserver\n")
            .ok(
                "cmsh -c device; list -l slurmserver",
                "PhysicalNode  head01  x  y\nPhysicalNode  head02  x  y\n",
            )
            .ok(
                "cmsh -c device; list -l slurmaccounting",
                "PhysicalNode  db01  x  y\n",
            );
        let mut env = BcmEnvironment::default();
        env.discover_slurm_nodes(&shell, "cmsh");
        assert_eq!(env.controller_nodes, ["head01", "head02"]);
        assert_eq!(env.accounting_nodes, ["db01"]);
        assert!(!shell
            .calls
            .borrow()
            .iter()
            .any(|c| c.contains("configurationoverlay")));
    }

    #[test]
    fn discovery_falls_back_to_overlays() {
        let shell = ScriptedShell::new()
            .ok("cmsh -c device; show -l", "")
            .ok("cmsh -c configurationoverlay; show", "Nodes  my-slurmctl\n");
        let mut env = BcmEnvironment::default();
        env.discover_slurm_nodes(&shell, "cmsh");
        assert_eq!(env.controller_nodes, ["my-slurmctl"]);
        assert!(env.accounting_nodes.is_empty());
    }
}
