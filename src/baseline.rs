//! Point-in-time snapshot of cluster measurements, taken before an upgrade and
//! compared against afterwards.
use std::fmt::{self, Display};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::command::Shell;
use crate::*;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Baseline {
    pub timestamp: String,
    pub hostname: String,
    pub user: String,
    pub slurm_version: Option<String>,
    pub accounting: AccountingSnapshot,
    pub configuration: ConfigurationSnapshot,
    pub system_state: SystemState,
}

/// `sacctmgr` records are kept as the raw `-P` lines; only their number matters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingSnapshot {
    pub users: Vec<String>,
    pub accounts: Vec<String>,
    pub qos: Vec<String>,
    pub associations: Vec<String>,
    pub tres: Vec<String>,
    pub clusters: Vec<String>,
    pub job_count_30days: u64,
    pub user_job_counts: IndexMap<String, u64>,
    pub account_job_counts: IndexMap<String, u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigurationSnapshot {
    pub partitions: IndexMap<String, PartitionInfo>,
    pub nodes: IndexMap<String, NodeInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionInfo {
    pub available: String,
    pub timelimit: String,
    pub nodes: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeInfo {
    pub state: String,
    pub gres: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemState {
    pub total_nodes: u64,
    pub node_state_counts: IndexMap<String, u64>,
}

/// Kinds of record held in the accounting database.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccountingEntity {
    Users,
    Accounts,
    Qos,
    Associations,
    Tres,
    Clusters,
}

impl AccountingEntity {
    pub const ALL: [AccountingEntity; 6] = [
        AccountingEntity::Users,
        AccountingEntity::Accounts,
        AccountingEntity::Qos,
        AccountingEntity::Associations,
        AccountingEntity::Tres,
        AccountingEntity::Clusters,
    ];

    /// Associations are captured but not compared; their count legitimately
    /// changes when users move between accounts.
    pub const COMPARED: [AccountingEntity; 5] = [
        AccountingEntity::Users,
        AccountingEntity::Accounts,
        AccountingEntity::Qos,
        AccountingEntity::Tres,
        AccountingEntity::Clusters,
    ];

    pub const fn key(self) -> &'static str {
        use AccountingEntity::*;
        match self {
            Users => "users",
            Accounts => "accounts",
            Qos => "qos",
            Associations => "associations",
            Tres => "tres",
            Clusters => "clusters",
        }
    }

    pub const fn title(self) -> &'static str {
        use AccountingEntity::*;
        match self {
            Users => "Users",
            Accounts => "Accounts",
            Qos => "Qos",
            Associations => "Associations",
            Tres => "Tres",
            Clusters => "Clusters",
        }
    }

    /// Object name understood by `sacctmgr show`.
    pub const fn sacctmgr_object(self) -> &'static str {
        use AccountingEntity::*;
        match self {
            Users => "user",
            Accounts => "account",
            Qos => "qos",
            Associations => "associations",
            Tres => "tres",
            Clusters => "cluster",
        }
    }

    pub fn query<S: Shell + ?Sized>(self, shell: &S) -> StdResult<Vec<String>, String> {
        let out = shell.run("sacctmgr", &["show", self.sacctmgr_object(), "-P", "-n"]);
        if out.success() {
            Ok(non_empty_lines(&out.stdout).map(String::from).collect())
        } else {
            Err(out.error_text())
        }
    }
}

impl Display for AccountingEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl AccountingSnapshot {
    pub fn entity(&self, e: AccountingEntity) -> &[String] {
        use AccountingEntity::*;
        match e {
            Users => &self.users,
            Accounts => &self.accounts,
            Qos => &self.qos,
            Associations => &self.associations,
            Tres => &self.tres,
            Clusters => &self.clusters,
        }
    }

    pub fn entity_mut(&mut self, e: AccountingEntity) -> &mut Vec<String> {
        use AccountingEntity::*;
        match e {
            Users => &mut self.users,
            Accounts => &mut self.accounts,
            Qos => &mut self.qos,
            Associations => &mut self.associations,
            Tres => &mut self.tres,
            Clusters => &mut self.clusters,
        }
    }
}

/// Job totals from `sacct --format=JobID,User,Account` output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub total: u64,
    pub per_user: IndexMap<String, u64>,
    pub per_account: IndexMap<String, u64>,
}

pub fn parse_job_lines(output: &str) -> JobCounts {
    let mut counts = JobCounts::default();
    for line in non_empty_lines(output) {
        counts.total += 1;
        let mut fields = line.split_whitespace().skip(1);
        if let (Some(user), Some(account)) = (fields.next(), fields.next()) {
            *counts.per_user.entry(user.to_string()).or_insert(0) += 1;
            *counts.per_account.entry(account.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

/// `sinfo -h -o %R|%a|%l|%D`.  A partition listed twice keeps its last row.
pub fn parse_partitions(output: &str) -> IndexMap<String, PartitionInfo> {
    let mut partitions = IndexMap::new();
    for line in non_empty_lines(output) {
        let fields: Vec<&str> = line.split('|').collect();
        if let [name, available, timelimit, nodes, ..] = fields[..] {
            partitions.insert(
                name.to_string(),
                PartitionInfo {
                    available: available.to_string(),
                    timelimit: timelimit.to_string(),
                    nodes: nodes.to_string(),
                },
            );
        }
    }
    partitions
}

/// `sinfo -N -h -o %N|%T|%G`
pub fn parse_nodes(output: &str) -> IndexMap<String, NodeInfo> {
    let mut nodes = IndexMap::new();
    for line in non_empty_lines(output) {
        let mut fields = line.split('|');
        if let (Some(name), Some(state)) = (fields.next(), fields.next()) {
            nodes.insert(
                name.to_string(),
                NodeInfo {
                    state: state.to_string(),
                    gres: fields.next().unwrap_or_default().to_string(),
                },
            );
        }
    }
    nodes
}

pub fn count_states(output: &str) -> IndexMap<String, u64> {
    let mut counts = IndexMap::new();
    for state in non_empty_lines(output) {
        *counts.entry(state.to_string()).or_insert(0) += 1;
    }
    counts
}

/// One line of progress emitted while capturing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureStep {
    Captured(String),
    Failed(String),
}

impl Baseline {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        read_json(path).context("failed to load baseline")
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        write_json(self, path).context("failed to save baseline")
    }

    /// Measure everything a later comparison needs.  Commands that fail leave
    /// their part of the snapshot empty.
    pub fn capture<S: Shell + ?Sized>(shell: &S, mut progress: impl FnMut(CaptureStep)) -> Self {
        let mut b = Baseline {
            timestamp: iso_timestamp(),
            hostname: hostname(),
            user: current_user(),
            ..Default::default()
        };

        let out = shell.run("sinfo", &["--version"]);
        if out.success() {
            let v = out.stdout.trim().to_string();
            progress(CaptureStep::Captured(format!("Slurm version: {}", v)));
            b.slurm_version = Some(v);
        } else {
            progress(CaptureStep::Failed(format!(
                "Slurm version: {}",
                out.error_text()
            )));
        }

        for e in AccountingEntity::ALL {
            match e.query(shell) {
                Ok(lines) => {
                    progress(CaptureStep::Captured(format!("{} {}", lines.len(), e)));
                    *b.accounting.entity_mut(e) = lines;
                }
                Err(err) => progress(CaptureStep::Failed(format!("{}: {}", e, err))),
            }
        }

        let out = shell.run(
            "sacct",
            &["-S", "now-30days", "-n", "--format=JobID,User,Account"],
        );
        if out.success() {
            let jobs = parse_job_lines(&out.stdout);
            progress(CaptureStep::Captured(format!(
                "job history: {} jobs in last 30 days",
                jobs.total
            )));
            b.accounting.job_count_30days = jobs.total;
            b.accounting.user_job_counts = jobs.per_user;
            b.accounting.account_job_counts = jobs.per_account;
        } else {
            progress(CaptureStep::Failed(format!("job history: {}", out.error_text())));
        }

        let out = shell.run("sinfo", &["-h", "-o", "%R|%a|%l|%D"]);
        if out.success() {
            b.configuration.partitions = parse_partitions(&out.stdout);
            progress(CaptureStep::Captured(format!(
                "{} partition(s)",
                b.configuration.partitions.len()
            )));
        } else {
            progress(CaptureStep::Failed(format!("partitions: {}", out.error_text())));
        }

        let out = shell.run("sinfo", &["-N", "-h", "-o", "%N|%T|%G"]);
        if out.success() {
            b.configuration.nodes = parse_nodes(&out.stdout);
            b.system_state.total_nodes = b.configuration.nodes.len() as u64;
            progress(CaptureStep::Captured(format!(
                "{} node(s)",
                b.system_state.total_nodes
            )));
        } else {
            progress(CaptureStep::Failed(format!("nodes: {}", out.error_text())));
        }

        let out = shell.run("sinfo", &["-h", "-o", "%T"]);
        if out.success() {
            b.system_state.node_state_counts = count_states(&out.stdout);
            progress(CaptureStep::Captured("node state distribution".to_string()));
        } else {
            progress(CaptureStep::Failed(format!(
                "node state distribution: {}",
                out.error_text()
            )));
        }

        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::ScriptedShell;

    fn sample() -> Baseline {
        let mut b = Baseline {
            timestamp: "2026-10-01T09:30:00.000000".into(),
            hostname: "head01".into(),
            user: "root".into(),
            slurm_version: Some("slurm 23.02.7".into()),
            ..Default::default()
        };
        b.accounting.users = vec!["alice|acct1|".into(), "bob|acct2|".into()];
        b.accounting.qos = vec!["normal|0|".into()];
        b.accounting.job_count_30days = 1200;
        b.accounting.user_job_counts.insert("alice".into(), 700);
        b.accounting.user_job_counts.insert("bob".into(), 500);
        b.accounting.account_job_counts.insert("acct1".into(), 1200);
        b.configuration.partitions.insert(
            "defq".into(),
            PartitionInfo {
                available: "up".into(),
                timelimit: "infinite".into(),
                nodes: "4".into(),
            },
        );
        b.configuration.nodes.insert(
            "node001".into(),
            NodeInfo {
                state: "idle".into(),
                gres: "gpu:a100:8".into(),
            },
        );
        b.system_state.total_nodes = 1;
        b.system_state.node_state_counts.insert("idle".into(), 1);
        b
    }

    #[test]
    fn json_round_trip() {
        let b = sample();
        let text = serde_json::to_string_pretty(&b).unwrap();
        assert_eq!(serde_json::from_str::<Baseline>(&text).unwrap(), b);

        let empty = Baseline::default();
        let text = serde_json::to_string(&empty).unwrap();
        assert_eq!(serde_json::from_str::<Baseline>(&text).unwrap(), empty);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("baseline.json");
        let b = sample();
        b.save(&p).unwrap();
        assert_eq!(Baseline::load(&p).unwrap(), b);
    }

    #[test]
    fn document_layout() {
        let v = serde_json::to_value(sample()).unwrap();
        assert_eq!(v["slurm_version"], "slurm 23.02.7");
        assert_eq!(v["accounting"]["users"][1], "bob|acct2|");
        assert_eq!(v["accounting"]["job_count_30days"], 1200);
        assert_eq!(v["accounting"]["user_job_counts"]["alice"], 700);
        assert_eq!(v["configuration"]["partitions"]["defq"]["timelimit"], "infinite");
        assert_eq!(v["configuration"]["nodes"]["node001"]["gres"], "gpu:a100:8");
        assert_eq!(v["system_state"]["total_nodes"], 1);
        assert_eq!(v["system_state"]["node_state_counts"]["idle"], 1);
    }

    #[test]
    fn partial_documents_load() {
        let text = r#"{
            "timestamp": "2025-01-01T00:00:00",
            "slurm_version": null,
            "accounting": {"users": ["a|", "b|"]},
            "configuration": {}
        }"#;
        let b: Baseline = serde_json::from_str(text).unwrap();
        assert_eq!(b.slurm_version, None);
        assert_eq!(b.accounting.users.len(), 2);
        assert_eq!(b.accounting.job_count_30days, 0);
        assert!(b.configuration.partitions.is_empty());
        assert_eq!(b.system_state.total_nodes, 0);
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(serde_json::from_str::<Baseline>(r#"{"accounting": {"users": 3}}"#).is_err());
        assert!(serde_json::from_str::<Baseline>("[").is_err());
    }

    #[test]
    fn job_lines() {
        let out = "\
            1001         alice      physics
            1001.batch   alice      physics
            1002         bob        chem
            1003
            ";
        let c = parse_job_lines(out);
        assert_eq!(c.total, 4);
        assert_eq!(c.per_user["alice"], 2);
        assert_eq!(c.per_user["bob"], 1);
        assert_eq!(c.per_account["physics"], 2);
        assert_eq!(c.per_account.len(), 2);
    }

    #[test]
    fn partitions_and_nodes() {
        let p = parse_partitions("defq|up|infinite|4\ngpu|up|7-00:00:00|2|extra\nbroken|up\ngpu|down|1:00:00|2\n");
        assert_eq!(p.keys().collect::<Vec<_>>(), ["defq", "gpu"]);
        assert_eq!(p["gpu"].available, "down");

        let n = parse_nodes("node001|idle|gpu:8\nnode002|down*\n\nbad\n");
        assert_eq!(n.len(), 2);
        assert_eq!(n["node002"].state, "down*");
        assert_eq!(n["node002"].gres, "");

        let s = count_states("idle\nmixed\nidle\n");
        assert_eq!(s["idle"], 2);
        assert_eq!(s["mixed"], 1);
    }

    #[test]
    fn capture_from_commands() {
        let shell = ScriptedShell::new()
            .ok("sinfo --version", "slurm 23.02.7\n")
            .ok("sacctmgr show user -P -n", "alice|acct1|None|\nbob|acct2|None|\n")
            .ok("sacctmgr show account -P -n", "acct1|desc|org|\n")
            .ok("sacctmgr show qos -P -n", "normal|0|\n")
            .ok("sacctmgr show associations -P -n", "c|acct1|alice|\n")
            .fail("sacctmgr show tres -P -n", 1, "sacctmgr: error: connection refused")
            .ok("sacctmgr show cluster -P -n", "slurm|10.0.0.1|6817|\n")
            .ok(
                "sacct -S now-30days -n --format=JobID,User,Account",
                "1 alice acct1\n2 bob acct2\n3 alice acct1\n",
            )
            .ok("sinfo -h -o %R|%a|%l|%D", "defq|up|infinite|2\n")
            .ok("sinfo -N -h -o %N|%T|%G", "node001|idle|(null)\nnode002|mixed|gpu:1\n")
            .ok("sinfo -h -o %T", "idle\nmixed\n");

        let mut steps = vec![];
        let b = Baseline::capture(&shell, |s| steps.push(s));

        assert_eq!(b.slurm_version.as_deref(), Some("slurm 23.02.7"));
        assert_eq!(b.accounting.users.len(), 2);
        assert!(b.accounting.tres.is_empty());
        assert_eq!(b.accounting.clusters.len(), 1);
        assert_eq!(b.accounting.job_count_30days, 3);
        assert_eq!(b.accounting.user_job_counts["alice"], 2);
        assert_eq!(b.configuration.partitions.len(), 1);
        assert_eq!(b.system_state.total_nodes, 2);
        assert_eq!(b.system_state.node_state_counts["mixed"], 1);

        let failed: Vec<_> = steps
            .iter()
            .filter_map(|s| match s {
                CaptureStep::Failed(m) => Some(m.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(failed, ["tres: sacctmgr: error: connection refused"]);
    }
}
