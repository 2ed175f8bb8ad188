//! Live cluster checks.  Each one records its outcomes into a [`HealthReport`];
//! a command that cannot be run becomes an outcome rather than an error.
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use regex::Regex;

use crate::bcm::BcmEnvironment;
use crate::command::Shell;
use crate::report::{CheckStatus, HealthReport};
use crate::*;

use CheckStatus::*;

/// Node states that need no attention.
pub static HEALTHY_NODE_STATES: phf::Set<&'static str> = phf::phf_set! {
    "idle",
    "allocated",
    "mixed",
    "completing",
};

/// Problem nodes below this fraction of the cluster only warrant a warning.
pub const PROBLEM_NODE_WARN_FRACTION: f64 = 0.1;

pub const JOB_TEST_SCRIPT: &str = "/cm/shared/slurm_healthcheck_test.sh";
const LOG_LINES: &str = "100";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeStatus {
    pub name: String,
    pub state: String,
    pub reason: String,
}

/// `sinfo -N -h -o %N|%T|%E`, one entry per node.  sinfo repeats a node for every
/// partition it is in; the last row for a node wins.
pub fn parse_node_status(output: &str) -> Vec<NodeStatus> {
    let mut nodes: IndexMap<String, NodeStatus> = IndexMap::new();
    for line in non_empty_lines(output) {
        let mut f = line.split('|');
        if let (Some(name), Some(state)) = (f.next(), f.next()) {
            nodes.insert(
                name.to_string(),
                NodeStatus {
                    name: name.to_string(),
                    state: state.to_string(),
                    reason: f.next().unwrap_or_default().to_string(),
                },
            );
        }
    }
    nodes.into_values().collect()
}

pub fn is_problem_state(state: &str) -> bool {
    !HEALTHY_NODE_STATES.contains(state.to_lowercase().as_str())
}

/// Lines of a daemon log that mention an error.
pub fn error_lines(log: &str) -> Vec<&str> {
    lazy_static::lazy_static! {
        static ref ERROR: Regex = Regex::new(r"(?i)error|fatal|critical").unwrap();
    }
    log.lines()
        .filter(|l| ERROR.is_match(l))
        .map(str::trim)
        .collect()
}

/// Where the pyxis SPANK plugin may be installed, most specific first.
pub fn pyxis_candidates(slurm_base: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = vec![];
    if let Some(base) = slurm_base {
        for lib in ["lib64", "lib"] {
            paths.push(base.join("current").join(lib).join("slurm/spank_pyxis.so"));
        }
    }
    for p in [
        "/cm/shared/apps/slurm/current/lib64/slurm/spank_pyxis.so",
        "/cm/shared/apps/slurm/current/lib/slurm/spank_pyxis.so",
        "/cm/local/apps/slurm/current/lib64/slurm/spank_pyxis.so",
        "/cm/local/apps/slurm/current/lib/slurm/spank_pyxis.so",
        "/usr/lib64/slurm/spank_pyxis.so",
        "/usr/lib/slurm/spank_pyxis.so",
    ] {
        let p = PathBuf::from(p);
        if !paths.contains(&p) {
            paths.push(p);
        }
    }
    paths
}

/// A daemon whose journal or log file is scanned.
#[derive(Clone, Copy, Debug)]
struct Daemon {
    unit: &'static str,
    label: &'static str,
    log_file: &'static str,
}

const SLURMCTLD: Daemon = Daemon {
    unit: "slurmctld",
    label: "Controller",
    log_file: "/var/log/slurm/slurmctld.log",
};

const SLURMDBD: Daemon = Daemon {
    unit: "slurmdbd",
    label: "Database",
    log_file: "/var/log/slurm/slurmdbd.log",
};

pub struct HealthChecks<'a, S: Shell + ?Sized> {
    shell: &'a S,
    env: &'a BcmEnvironment,
    verbose: bool,
    job_script: PathBuf,
}

impl<'a, S: Shell + ?Sized> HealthChecks<'a, S> {
    pub fn new(shell: &'a S, env: &'a BcmEnvironment, verbose: bool) -> Self {
        HealthChecks {
            shell,
            env,
            verbose,
            job_script: PathBuf::from(JOB_TEST_SCRIPT),
        }
    }

    /// The test job script must live on a filesystem every compute node mounts.
    pub fn with_job_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.job_script = path.into();
        self
    }

    pub fn run_all(&self, report: &mut HealthReport) {
        self.slurm_version(report);
        self.services(report);
        self.nodes(report);
        self.slurmdbd_connection(report);
        self.job_history(report);
        self.partitions(report);
        self.munge(report);
        self.logs(report);
        self.pyxis(report);
        self.job_submission(report);
    }

    pub fn slurm_version(&self, report: &mut HealthReport) -> Option<String> {
        let out = self.shell.run("sinfo", &["--version"]);
        if out.success() {
            let version = out.stdout.trim().to_string();
            report.record(
                "System",
                "Slurm Version Check",
                Pass,
                format!("Slurm is installed: {}", version),
                details! { "version" => version },
            );
            Some(version)
        } else {
            let err = out.error_text();
            report.record(
                "System",
                "Slurm Version Check",
                Fail,
                format!("Unable to determine Slurm version: {}", err),
                details! { "error" => err },
            );
            None
        }
    }

    fn service_on(&self, report: &mut HealthReport, node: &str, daemon: &str, label: &str) {
        let unit = format!("{}.service", daemon);
        let name = format!("Slurm {} on {}", label, node);
        let out = self.shell.run_ssh(node, &["systemctl", "is-active", unit.as_str()]);
        let state = out.stdout.trim();
        if state == "active" {
            let since = self.shell.run_ssh(
                node,
                &["systemctl", "show", unit.as_str(), "--property=ActiveEnterTimestamp"],
            );
            report.record(
                "Services",
                name,
                Pass,
                format!("{} is active on {}", daemon, node),
                details! {
                    "node" => node,
                    "status" => "active",
                    "details" => since.stdout.trim(),
                },
            );
        } else {
            let state = if state.is_empty() {
                out.error_text()
            } else {
                state.to_string()
            };
            report.record(
                "Services",
                name,
                Fail,
                format!("{} is not active on {}: {}", daemon, node, state),
                details! { "node" => node, "status" => state },
            );
        }
    }

    pub fn services(&self, report: &mut HealthReport) {
        if self.env.controller_nodes.is_empty() {
            report.record(
                "Services",
                "Slurm Controller Discovery",
                Warn,
                "Could not discover controller nodes via cmsh",
                details!(),
            );
        }
        for node in &self.env.controller_nodes {
            self.service_on(report, node, SLURMCTLD.unit, SLURMCTLD.label);
        }

        if self.env.accounting_nodes.is_empty() {
            report.record(
                "Services",
                "Slurm Database Discovery",
                Warn,
                "Could not discover accounting nodes via cmsh",
                details!(),
            );
        }
        for node in &self.env.accounting_nodes {
            self.service_on(report, node, SLURMDBD.unit, SLURMDBD.label);
        }
    }

    pub fn nodes(&self, report: &mut HealthReport) -> Vec<NodeStatus> {
        let out = self.shell.run("sinfo", &["-N", "-h", "-o", "%N|%T|%E"]);
        if !out.success() {
            let err = out.error_text();
            report.record(
                "Nodes",
                "Node Status Check",
                Fail,
                format!("Unable to query node status: {}", err),
                details! { "error" => err },
            );
            return vec![];
        }

        let nodes = parse_node_status(&out.stdout);
        let mut state_counts: IndexMap<&str, u64> = IndexMap::new();
        for n in &nodes {
            *state_counts.entry(n.state.as_str()).or_insert(0) += 1;
        }
        let problems: Vec<&NodeStatus> = nodes.iter().filter(|n| is_problem_state(&n.state)).collect();
        let total = nodes.len();

        let (status, message) = if problems.is_empty() {
            (Pass, format!("All {} nodes are healthy", total))
        } else {
            let status = if (problems.len() as f64) < total as f64 * PROBLEM_NODE_WARN_FRACTION {
                Warn
            } else {
                Fail
            };
            let mut message = format!("{} of {} nodes have issues", problems.len(), total);
            if self.verbose || status == Fail {
                for n in problems.iter().take(5) {
                    message += &format!("\n    {}: {} ({})", n.name, n.state, n.reason);
                }
            }
            (status, message)
        };

        report.record(
            "Nodes",
            "Node Health Check",
            status,
            message,
            details! {
                "total_nodes" => total,
                "state_counts" => state_counts,
                "problem_count" => problems.len(),
            },
        );
        nodes
    }

    pub fn slurmdbd_connection(&self, report: &mut HealthReport) {
        let out = self.shell.run("sacctmgr", &["show", "cluster", "-n"]);
        let clusters: Vec<&str> = non_empty_lines(&out.stdout)
            .filter_map(|l| l.split_whitespace().next())
            .collect();
        if out.success() && !clusters.is_empty() {
            report.record(
                "Accounting",
                "Database Connection",
                Pass,
                format!(
                    "slurmdbd is accessible, found {} cluster(s)",
                    clusters.len()
                ),
                details! { "clusters" => clusters },
            );
        } else {
            let err = if out.success() {
                "no clusters registered".to_string()
            } else {
                out.error_text()
            };
            report.record(
                "Accounting",
                "Database Connection",
                Fail,
                format!("Unable to connect to slurmdbd: {}", err),
                details! { "error" => err },
            );
        }
    }

    pub fn job_history(&self, report: &mut HealthReport) {
        let out = self.shell.run(
            "sacct",
            &[
                "-S",
                "now-7days",
                "-n",
                "--format=JobID",
                "--state=COMPLETED,FAILED,CANCELLED",
            ],
        );
        if out.success() {
            let count = non_empty_lines(&out.stdout).count();
            report.record(
                "Accounting",
                "Job History Access",
                Pass,
                format!("Job history accessible ({} jobs in last 7 days)", count),
                details! { "recent_job_count" => count },
            );
        } else {
            let err = out.error_text();
            let status = if out.stderr.contains("No jobs") { Warn } else { Fail };
            report.record(
                "Accounting",
                "Job History Access",
                status,
                format!("Issue accessing job history: {}", err),
                details! { "error" => err },
            );
        }
    }

    pub fn partitions(&self, report: &mut HealthReport) -> Vec<String> {
        let out = self.shell.run("sinfo", &["-h", "-o", "%R|%a|%l|%D|%T"]);
        if !out.success() {
            let err = out.error_text();
            report.record(
                "Configuration",
                "Partition Check",
                Fail,
                format!("Unable to query partitions: {}", err),
                details! { "error" => err },
            );
            return vec![];
        }
        let mut names: IndexSet<String> = IndexSet::new();
        for line in non_empty_lines(&out.stdout) {
            let fields: Vec<&str> = line.split('|').collect();
            if fields.len() >= 4 {
                names.insert(fields[0].to_string());
            }
        }
        let names: Vec<String> = names.into_iter().collect();
        if names.is_empty() {
            report.record(
                "Configuration",
                "Partition Check",
                Warn,
                "No partitions found",
                details!(),
            );
        } else {
            report.record(
                "Configuration",
                "Partition Check",
                Pass,
                format!("Found {} partition(s)", names.len()),
                details! { "partitions" => names },
            );
        }
        names
    }

    pub fn munge(&self, report: &mut HealthReport) {
        let out = self.shell.run("systemctl", &["is-active", "munge.service"]);
        let state = out.stdout.trim();
        if state != "active" {
            let state = if state.is_empty() {
                out.error_text()
            } else {
                state.to_string()
            };
            report.record(
                "Authentication",
                "Munge Service",
                Fail,
                format!("Munge is not active: {}", state),
                details! { "status" => state },
            );
            return;
        }

        let encoded = self.shell.run("munge", &["-n"]);
        let (status, message) = if !encoded.success() || encoded.stdout.trim().is_empty() {
            (Warn, "Munge service active but encode test failed")
        } else if self
            .shell
            .run_with_input("unmunge", &[], &encoded.stdout)
            .success()
        {
            (Pass, "Munge authentication working")
        } else {
            (Warn, "Munge encode works but decode failed")
        };
        report.record("Authentication", "Munge Service", status, message, details!());
    }

    fn daemon_log(&self, report: &mut HealthReport, node: &str, daemon: Daemon) {
        let name = format!("{} Log on {}", daemon.label, node);
        let mut out = self.shell.run_ssh(
            node,
            &["journalctl", "-u", daemon.unit, "-n", LOG_LINES, "--no-pager"],
        );
        if !out.success() {
            out = self
                .shell
                .run_ssh(node, &["tail", "-n", LOG_LINES, daemon.log_file]);
            if !out.success() {
                report.record(
                    "Logs",
                    name,
                    Skip,
                    format!(
                        "Unable to read logs (tried journalctl and {})",
                        daemon.log_file
                    ),
                    details!(),
                );
                return;
            }
        }

        let errors = error_lines(&out.stdout);
        let (status, message) = if errors.is_empty() {
            (Pass, "No recent errors found".to_string())
        } else {
            let mut message = format!(
                "Found {} error/warning line(s) in last {} lines",
                errors.len(),
                LOG_LINES
            );
            if self.verbose {
                for l in errors.iter().take(3) {
                    message += "\n    ";
                    message += l;
                }
            }
            (Warn, message)
        };
        report.record(
            "Logs",
            name,
            status,
            message,
            details! { "error_count" => errors.len(), "node" => node },
        );
    }

    /// Only the first controller and accounting node are inspected.
    pub fn logs(&self, report: &mut HealthReport) {
        if let Some(node) = self.env.controller_nodes.first() {
            self.daemon_log(report, node, SLURMCTLD);
        }
        if let Some(node) = self.env.accounting_nodes.first() {
            self.daemon_log(report, node, SLURMDBD);
        }
    }

    pub fn pyxis(&self, report: &mut HealthReport) {
        let candidates = pyxis_candidates(self.env.slurm_base_path.as_deref());
        let plugin = match candidates.iter().find(|p| p.exists()) {
            Some(p) => p.display().to_string(),
            None => {
                let checked: Vec<String> = candidates
                    .iter()
                    .take(3)
                    .map(|p| p.display().to_string())
                    .collect();
                report.record(
                    "Pyxis",
                    "Pyxis Installation",
                    Skip,
                    "Pyxis plugin not found (may not be installed)",
                    details! { "checked_paths" => checked },
                );
                return;
            }
        };

        let which = self.shell.run("which", &["enroot"]);
        if !which.success() {
            report.record(
                "Pyxis",
                "Enroot Installation",
                Warn,
                "Pyxis plugin found but enroot not in PATH",
                details! { "plugin_path" => plugin },
            );
            return;
        }
        let enroot = which.stdout.trim().to_string();
        let version = self.shell.run("enroot", &["version"]);
        let version = if version.success() {
            version.stdout.trim().to_string()
        } else {
            "unknown".to_string()
        };
        report.record(
            "Pyxis",
            "Enroot Installation",
            Pass,
            format!("Enroot found at {}", enroot),
            details! { "path" => enroot, "version" => version },
        );
        report.record(
            "Pyxis",
            "Pyxis Plugin",
            Pass,
            format!("Pyxis plugin found at {}", plugin),
            details! { "plugin_path" => plugin },
        );
    }

    fn write_job_script(&self) -> std::io::Result<()> {
        std::fs::write(
            &self.job_script,
            "#!/bin/bash\necho \"Healthcheck test job\"\nhostname\ndate\n",
        )?;
        std::fs::set_permissions(&self.job_script, std::fs::Permissions::from_mode(0o755))
    }

    pub fn job_submission(&self, report: &mut HealthReport) {
        if let Err(e) = self.write_job_script() {
            report.record(
                "Job Submission",
                "Basic Job Test",
                Skip,
                format!("Unable to create test script: {}", e),
                details!(),
            );
            return;
        }

        let script = self.job_script.to_string_lossy();
        let started = Instant::now();
        let out = self.shell.run(
            "srun",
            &["--overlap", "-t", "00:01:00", "-D", "/tmp", &*script],
        );
        let elapsed = started.elapsed().as_secs_f64();

        if let Err(e) = std::fs::remove_file(&self.job_script) {
            log::warn!("failed to remove {:?}: {}", self.job_script, e);
        }

        if out.success() {
            report.record(
                "Job Submission",
                "Basic Job Test",
                Pass,
                format!("Job submission successful (elapsed: {:.2}s)", elapsed),
                details! { "elapsed_seconds" => elapsed, "output" => out.stdout.trim() },
            );
        } else {
            let err = out.error_text();
            report.record(
                "Job Submission",
                "Basic Job Test",
                Fail,
                format!("Job submission failed: {}", err),
                details! { "error" => err, "elapsed_seconds" => elapsed },
            );
        }
    }
}
