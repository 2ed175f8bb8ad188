//! Decision rules for comparing a [`Baseline`] with the live cluster.
//!
//! Every dimension yields exactly one outcome (the accounting dimension yields one
//! per entity kind).  A measurement that could not be taken is a FAIL: without data
//! there is no way to tell "could not ask" apart from "data was lost".
use std::collections::BTreeSet;

use crate::baseline::{parse_nodes, AccountingEntity, Baseline};
use crate::command::Shell;
use crate::report::{CheckOutcome, CheckStatus};
use crate::*;

pub const CATEGORY: &str = "Baseline Comparison";

/// Fraction of the baseline 30-day job count that must still be visible.  Jobs
/// age out of the rolling window between capture and comparison.
pub const JOB_COUNT_RETENTION: f64 = 0.9;

/// A live value, or the error text explaining why it could not be read.
pub type Measurement<T> = StdResult<T, String>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CurrentState {
    pub version: Measurement<String>,
    pub entity_counts: IndexMap<AccountingEntity, Measurement<u64>>,
    pub job_count_30days: Measurement<u64>,
    pub partitions: Measurement<BTreeSet<String>>,
    pub node_count: Measurement<u64>,
}

fn measure<T>(out: crate::command::CommandOutput, f: impl FnOnce(&str) -> T) -> Measurement<T> {
    if out.success() {
        Ok(f(&out.stdout))
    } else {
        Err(out.error_text())
    }
}

impl CurrentState {
    pub fn measure<S: Shell + ?Sized>(shell: &S) -> Self {
        let version = measure(shell.run("sinfo", &["--version"]), |s| s.trim().to_string());

        let entity_counts = AccountingEntity::COMPARED
            .iter()
            .map(|&e| (e, e.query(shell).map(|lines| lines.len() as u64)))
            .collect();

        let job_count_30days = measure(
            shell.run("sacct", &["-S", "now-30days", "-n", "--format=JobID"]),
            |s| non_empty_lines(s).count() as u64,
        );

        let partitions = measure(shell.run("sinfo", &["-h", "-o", "%R"]), |s| {
            non_empty_lines(s).map(String::from).collect()
        });

        // sinfo -N prints a node once per partition it belongs to
        let node_count = measure(shell.run("sinfo", &["-N", "-h", "-o", "%N|%T|%G"]), |s| {
            parse_nodes(s).len() as u64
        });

        CurrentState {
            version,
            entity_counts,
            job_count_30days,
            partitions,
            node_count,
        }
    }
}

fn outcome(name: &str, status: CheckStatus, message: String, details: Details) -> CheckOutcome {
    CheckOutcome::new(CATEGORY, name, status, message).with_details(details)
}

fn unable(name: &str, what: &str, err: &str) -> CheckOutcome {
    outcome(
        name,
        CheckStatus::Fail,
        format!("Unable to query current {}: {}", what, err),
        details! { "error" => err },
    )
}

/// An upgrade is expected, so an unchanged version is suspicious but not broken.
pub fn compare_version(baseline: Option<&str>, current: &Measurement<String>) -> CheckOutcome {
    const NAME: &str = "Version Check";
    let current = match current {
        Ok(v) => v,
        Err(e) => return unable(NAME, "Slurm version", e),
    };
    let baseline = baseline.unwrap_or("unknown");
    let details = details! { "baseline" => baseline, "current" => current };
    if baseline == current.as_str() {
        outcome(
            NAME,
            CheckStatus::Warn,
            format!("Version unchanged: {} (expected upgrade)", current),
            details,
        )
    } else {
        outcome(
            NAME,
            CheckStatus::Pass,
            format!("Version upgraded: {} → {}", baseline, current),
            details,
        )
    }
}

/// Accounting records must never disappear.
pub fn compare_entity_count(
    entity: AccountingEntity,
    baseline: u64,
    current: &Measurement<u64>,
) -> CheckOutcome {
    let name = format!("Accounting: {}", entity.title());
    let current = match current {
        Ok(c) => *c,
        Err(e) => return unable(&name, entity.key(), e),
    };
    let details = details! { "baseline_count" => baseline, "current_count" => current };
    if current < baseline {
        outcome(
            &name,
            CheckStatus::Fail,
            format!(
                "DATA LOSS: {} → {} ({} lost)",
                baseline,
                current,
                baseline - current
            ),
            details,
        )
    } else if current == baseline {
        outcome(
            &name,
            CheckStatus::Pass,
            format!("Count preserved: {} {}", current, entity),
            details,
        )
    } else {
        outcome(
            &name,
            CheckStatus::Pass,
            format!("Count increased: {} → {}", baseline, current),
            details,
        )
    }
}

pub fn job_count_regressed(baseline: u64, current: u64) -> bool {
    (current as f64) < (baseline as f64) * JOB_COUNT_RETENTION
}

pub fn compare_job_count(baseline: u64, current: &Measurement<u64>) -> CheckOutcome {
    const NAME: &str = "Job History Integrity";
    let current = match current {
        Ok(c) => *c,
        Err(e) => return unable(NAME, "job count", e),
    };
    let details = details! { "baseline" => baseline, "current" => current };
    if job_count_regressed(baseline, current) {
        outcome(
            NAME,
            CheckStatus::Fail,
            format!("Significant job count decrease: {} → {}", baseline, current),
            details,
        )
    } else {
        outcome(
            NAME,
            CheckStatus::Pass,
            format!(
                "Job history intact: {} jobs (baseline: {})",
                current, baseline
            ),
            details,
        )
    }
}

/// Every baseline partition must still exist.  New partitions are fine.
pub fn compare_partitions<'a>(
    baseline: impl IntoIterator<Item = &'a str>,
    current: &Measurement<BTreeSet<String>>,
) -> CheckOutcome {
    const NAME: &str = "Partition Configuration";
    let current = match current {
        Ok(c) => c,
        Err(e) => return unable(NAME, "partitions", e),
    };
    let baseline: BTreeSet<&str> = baseline.into_iter().collect();
    let missing: Vec<&str> = baseline
        .iter()
        .copied()
        .filter(|p| !current.contains(*p))
        .collect();
    let new: Vec<&str> = current
        .iter()
        .map(String::as_str)
        .filter(|p| !baseline.contains(p))
        .collect();

    if !missing.is_empty() {
        outcome(
            NAME,
            CheckStatus::Fail,
            format!("Missing partitions: {}", missing.join(", ")),
            details! { "missing" => missing, "new" => new },
        )
    } else if !new.is_empty() {
        outcome(
            NAME,
            CheckStatus::Pass,
            format!(
                "All partitions preserved, {} new partition(s) added: {}",
                new.len(),
                new.join(", ")
            ),
            details! { "new" => new },
        )
    } else {
        outcome(
            NAME,
            CheckStatus::Pass,
            format!("All {} partitions preserved", current.len()),
            details!(),
        )
    }
}

pub fn compare_node_count(baseline: u64, current: &Measurement<u64>) -> CheckOutcome {
    const NAME: &str = "Node Count";
    let current = match current {
        Ok(c) => *c,
        Err(e) => return unable(NAME, "node count", e),
    };
    let details = details! { "baseline" => baseline, "current" => current };
    if current < baseline {
        outcome(
            NAME,
            CheckStatus::Fail,
            format!("Node count decreased: {} → {}", baseline, current),
            details,
        )
    } else {
        outcome(
            NAME,
            CheckStatus::Pass,
            format!("Node count preserved: {} nodes", current),
            details,
        )
    }
}

/// All outcomes for `baseline` against `current`, in a fixed order.
pub fn compare(baseline: &Baseline, current: &CurrentState) -> Vec<CheckOutcome> {
    let mut outcomes = Vec::with_capacity(4 + AccountingEntity::COMPARED.len());
    outcomes.push(compare_version(
        baseline.slurm_version.as_deref(),
        &current.version,
    ));

    for e in AccountingEntity::COMPARED {
        let not_measured = Err("not measured".to_string());
        let c = current.entity_counts.get(&e).unwrap_or(&not_measured);
        outcomes.push(compare_entity_count(
            e,
            baseline.accounting.entity(e).len() as u64,
            c,
        ));
    }

    outcomes.push(compare_job_count(
        baseline.accounting.job_count_30days,
        &current.job_count_30days,
    ));
    outcomes.push(compare_partitions(
        baseline.configuration.partitions.keys().map(String::as_str),
        &current.partitions,
    ));
    outcomes.push(compare_node_count(
        baseline.system_state.total_nodes,
        &current.node_count,
    ));
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::{NodeInfo, PartitionInfo};
    use crate::command::testing::ScriptedShell;
    use CheckStatus::*;

    fn set(names: &[&str]) -> Measurement<BTreeSet<String>> {
        Ok(names.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn version_must_change() {
        let o = compare_version(Some("slurm 23.02.7"), &Ok("slurm 23.02.7".into()));
        assert_eq!(o.status, Warn);
        assert!(o.message.contains("expected upgrade"));

        let o = compare_version(Some("slurm 23.02.7"), &Ok("slurm 24.05.1".into()));
        assert_eq!(o.status, Pass);
        assert_eq!(o.message, "Version upgraded: slurm 23.02.7 → slurm 24.05.1");

        let o = compare_version(None, &Ok("slurm 24.05.1".into()));
        assert_eq!(o.status, Pass);
        assert_eq!(o.details["baseline"], "unknown");

        let o = compare_version(Some("x"), &Err("Command not found: sinfo".into()));
        assert_eq!(o.status, Fail);
        assert!(o.message.contains("Command not found: sinfo"));
    }

    #[test]
    fn entity_counts_never_decrease() {
        for baseline in 0..6u64 {
            for current in 0..6u64 {
                let o = compare_entity_count(AccountingEntity::Users, baseline, &Ok(current));
                assert_eq!(o.status == Fail, current < baseline, "{} {}", baseline, current);
                assert_eq!(o.category, CATEGORY);
                assert_eq!(o.name, "Accounting: Users");
            }
        }
        let o = compare_entity_count(AccountingEntity::Qos, 10, &Ok(7));
        assert_eq!(o.message, "DATA LOSS: 10 → 7 (3 lost)");
        let o = compare_entity_count(AccountingEntity::Qos, 7, &Ok(7));
        assert_eq!(o.message, "Count preserved: 7 qos");
        let o = compare_entity_count(AccountingEntity::Qos, 7, &Ok(9));
        assert_eq!(o.message, "Count increased: 7 → 9");

        let o = compare_entity_count(AccountingEntity::Tres, 3, &Err("timeout".into()));
        assert_eq!(o.status, Fail);
        assert_eq!(o.message, "Unable to query current tres: timeout");
    }

    #[test]
    fn job_count_tolerance() {
        assert_eq!(compare_job_count(100, &Ok(91)).status, Pass);
        assert_eq!(compare_job_count(100, &Ok(90)).status, Pass);
        assert_eq!(compare_job_count(100, &Ok(89)).status, Fail);
        assert_eq!(compare_job_count(100, &Ok(150)).status, Pass);
        assert_eq!(compare_job_count(0, &Ok(0)).status, Pass);
        assert_eq!(compare_job_count(10, &Err("sacct failed".into())).status, Fail);

        let o = compare_job_count(100, &Ok(91));
        assert_eq!(o.message, "Job history intact: 91 jobs (baseline: 100)");
    }

    #[test]
    fn partition_sets() {
        let o = compare_partitions(["a", "b"], &set(&["a"]));
        assert_eq!(o.status, Fail);
        assert!(o.message.contains('b'));
        assert_eq!(o.details["missing"], serde_json::json!(["b"]));

        let o = compare_partitions(["a", "b"], &set(&["a", "b", "c"]));
        assert_eq!(o.status, Pass);
        assert!(o.message.contains('c'));
        assert!(o.message.contains("new"));

        let o = compare_partitions(["a", "b"], &set(&["b", "a"]));
        assert_eq!(o.status, Pass);
        assert!(!o.message.contains("new"));
        assert_eq!(o.message, "All 2 partitions preserved");

        let o = compare_partitions(["gpu", "defq"], &set(&["defq", "debug"]));
        assert_eq!(o.status, Fail);
        assert_eq!(o.message, "Missing partitions: gpu");

        let o = compare_partitions(["a"], &Err("sinfo: error".into()));
        assert_eq!(o.status, Fail);
    }

    #[test]
    fn node_count() {
        assert_eq!(compare_node_count(10, &Ok(9)).status, Fail);
        assert_eq!(compare_node_count(10, &Ok(10)).status, Pass);
        assert_eq!(compare_node_count(10, &Ok(12)).status, Pass);
        assert_eq!(compare_node_count(10, &Err("down".into())).status, Fail);
    }

    fn baseline() -> Baseline {
        let mut b = Baseline::default();
        b.slurm_version = Some("slurm 23.02.7".into());
        b.accounting.users = vec!["a|".into(), "b|".into()];
        b.accounting.accounts = vec!["x|".into()];
        b.accounting.qos = vec!["normal|".into()];
        b.accounting.tres = vec!["cpu|".into(), "mem|".into()];
        b.accounting.clusters = vec!["slurm|".into()];
        b.accounting.job_count_30days = 100;
        for p in ["defq", "gpu"] {
            b.configuration
                .partitions
                .insert(p.into(), PartitionInfo::default());
        }
        b.system_state.total_nodes = 3;
        b
    }

    #[test]
    fn full_comparison_evaluates_every_dimension() {
        let shell = ScriptedShell::new()
            .ok("sinfo --version", "slurm 24.05.1\n")
            .ok("sacctmgr show user -P -n", "a|\n")
            .ok("sacctmgr show account -P -n", "x|\ny|\n")
            .ok("sacctmgr show qos -P -n", "normal|\n")
            .fail("sacctmgr show tres -P -n", 1, "connection refused")
            .ok("sacctmgr show cluster -P -n", "slurm|\n")
            .ok("sacct -S now-30days -n --format=JobID", &"1\n".repeat(95))
            .ok("sinfo -h -o %R", "defq\ngpu\ndebug\n")
            .ok(
                "sinfo -N -h -o %N|%T|%G",
                "node001|idle|gpu:4\nnode002|mixed|gpu:4\nnode003|idle|(null)\n",
            );

        let current = CurrentState::measure(&shell);
        assert_eq!(current.job_count_30days, Ok(95));
        let outcomes = compare(&baseline(), &current);

        let got: Vec<(&str, CheckStatus)> =
            outcomes.iter().map(|o| (o.name.as_str(), o.status)).collect();
        assert_eq!(
            got,
            [
                ("Version Check", Pass),
                ("Accounting: Users", Fail),
                ("Accounting: Accounts", Pass),
                ("Accounting: Qos", Pass),
                ("Accounting: Tres", Fail),
                ("Accounting: Clusters", Pass),
                ("Job History Integrity", Pass),
                ("Partition Configuration", Pass),
                ("Node Count", Pass),
            ]
        );
        assert!(outcomes.iter().all(|o| o.category == CATEGORY));
        assert_eq!(outcomes[4].message, "Unable to query current tres: connection refused");
    }

    #[test]
    fn missing_measurements_fail_rather_than_skip() {
        let outcomes = compare(&baseline(), &CurrentState::measure(&ScriptedShell::new()));
        assert_eq!(outcomes.len(), 9);
        assert!(outcomes.iter().all(|o| o.status == Fail));
        assert!(outcomes
            .iter()
            .all(|o| o.message.starts_with("Unable to query current")));
    }

    #[test]
    fn nodes_in_several_partitions_count_once() {
        let mut b = baseline();
        let capture = ScriptedShell::new().ok(
            "sinfo -N -h -o %N|%T|%G",
            "node001|idle|\nnode001|idle|\nnode002|idle|\nnode002|idle|\nnode003|idle|\nnode003|idle|\n",
        );
        b.system_state.total_nodes = Baseline::capture(&capture, |_| {}).system_state.total_nodes;
        assert_eq!(b.system_state.total_nodes, 3);

        let now = ScriptedShell::new().ok(
            "sinfo -N -h -o %N|%T|%G",
            "node001|idle|\nnode001|idle|\nnode002|down|\nnode002|down|\n",
        );
        let current = CurrentState::measure(&now);
        assert_eq!(current.node_count, Ok(2));
        let o = compare_node_count(b.system_state.total_nodes, &current.node_count);
        assert_eq!(o.status, Fail);
        assert_eq!(o.message, "Node count decreased: 3 → 2");
    }

    #[test]
    fn outcome_details_and_descriptive_fields_never_decide() {
        let current = CurrentState {
            version: Ok("slurm 24.05.1".into()),
            entity_counts: AccountingEntity::COMPARED.iter().map(|&e| (e, Ok(1))).collect(),
            job_count_30days: Ok(100),
            partitions: set(&["defq", "gpu"]),
            node_count: Ok(3),
        };
        let plain = baseline();
        let mut decorated = baseline();
        decorated.configuration.partitions["gpu"] = PartitionInfo {
            available: "down".into(),
            timelimit: "1:00:00".into(),
            nodes: "999".into(),
        };
        decorated.configuration.nodes.insert(
            "node001".into(),
            NodeInfo {
                state: "drained".into(),
                gres: "gpu:8".into(),
            },
        );
        decorated.accounting.user_job_counts.insert("alice".into(), 1_000_000);

        let strip = |v: Vec<CheckOutcome>| -> Vec<(String, CheckStatus, String)> {
            v.into_iter().map(|o| (o.name, o.status, o.message)).collect()
        };
        let a = compare(&plain, &current);
        let b = compare(&decorated, &current);
        assert_eq!(strip(a.clone()), strip(b));

        // a decision is a function of the measurements only; details just describe it
        let mut noisy = a.clone();
        for o in &mut noisy {
            o.details = details! { "noise" => [1, 2, 3], "status" => "FAIL" };
        }
        let mut r1 = crate::report::HealthReport::open("h", "v", "u");
        r1.extend(a);
        let mut r2 = crate::report::HealthReport::open("h", "v", "u");
        r2.extend(noisy);
        assert_eq!(r1.summary(), r2.summary());
        assert_eq!(r1.overall_status(), r2.overall_status());
    }
}
