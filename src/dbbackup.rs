//! Dumping the Slurm accounting database with `mysqldump`.
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::command::DisplayCmd;
use crate::*;

pub const SLURMDBD_CONF_PATHS: &[&str] = &[
    "/cm/shared/apps/slurm/var/etc/slurmdbd.conf",
    "/cm/shared/apps/slurm/current/etc/slurmdbd.conf",
    "/cm/local/apps/slurm/var/etc/slurmdbd.conf",
    "/cm/local/apps/slurm/current/etc/slurmdbd.conf",
    "/etc/slurm/slurmdbd.conf",
    "/usr/local/etc/slurmdbd.conf",
];

pub const DEFAULT_BACKUP_DIRS: &[&str] = &[
    "/var/spool/cmd/backup",
    "/backup/slurm",
    "/var/backup/slurm",
    "/tmp/slurm-backup",
];

/// Dumps smaller than this are almost certainly truncated.
pub const MIN_BACKUP_SIZE: u64 = 1024;

/// Number of lines from the start of a dump inspected by [`verify_backup`].
pub const VERIFY_HEAD_LINES: usize = 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbConfig {
    pub host: String,
    pub port: String,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            host: "localhost".to_string(),
            port: "3306".to_string(),
            user: "slurm".to_string(),
            password: None,
            database: "slurm_acct_db".to_string(),
        }
    }
}

/// Read the `Storage*` settings out of slurmdbd.conf.  Keys are case-insensitive.
pub fn parse_slurmdbd_conf(text: &str) -> DbConfig {
    let mut c = DbConfig::default();
    for line in non_empty_lines(text) {
        if line.starts_with('#') {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((k, v)) => (k.trim().to_lowercase(), v.trim().to_string()),
            None => continue,
        };
        match key.as_str() {
            "storagehost" => c.host = value,
            "storageport" => c.port = value,
            "storageuser" => c.user = value,
            "storagepass" => c.password = Some(value),
            "storageloc" => c.database = value,
            _ => {}
        }
    }
    c
}

pub fn find_slurmdbd_conf(config: &Config) -> Option<PathBuf> {
    if let Some(p) = &config.slurmdbd_conf {
        return Some(p.clone());
    }
    SLURMDBD_CONF_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

/// Database settings from the slurmdbd.conf that [`find_slurmdbd_conf`]
/// located. A backup without it would guess credentials, so a missing file is
/// an error.
pub fn load_db_config(found: Option<PathBuf>) -> Result<(PathBuf, DbConfig)> {
    let path = match found {
        Some(p) => p,
        None => bail!(
            "Could not find slurmdbd.conf (searched {})",
            SLURMDBD_CONF_PATHS.join(", ")
        ),
    };
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {:?}", path))?;
    let db = parse_slurmdbd_conf(&text);
    Ok((path, db))
}

fn is_writable_dir(p: &Path) -> bool {
    let c = match std::ffi::CString::new(p.as_os_str().to_string_lossy().as_bytes()) {
        Ok(c) => c,
        Err(_) => return false,
    };
    p.is_dir() && unsafe { libc::access(c.as_ptr(), libc::W_OK) == 0 }
}

/// `-o`, then the configured directory, then the first usable default, then /tmp.
pub fn choose_backup_dir(explicit: Option<&Path>, config: &Config) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    if let Some(p) = &config.backup_dir {
        if p.exists() {
            return p.clone();
        }
        log::warn!("configured backup_dir {:?} does not exist, ignoring", p);
    }
    DEFAULT_BACKUP_DIRS
        .iter()
        .map(Path::new)
        .find(|p| is_writable_dir(p))
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

pub fn backup_file_name(now: DateTime<Local>, compress: bool) -> String {
    let mut name = format!("slurm_acct_db_backup_{}.sql", now.format("%Y%m%d_%H%M%S"));
    if compress {
        name.push_str(".gz");
    }
    name
}

pub fn mysqldump_args(db: &DbConfig) -> Vec<String> {
    let mut args = vec![
        "--single-transaction".to_string(),
        "--quick".to_string(),
        "--lock-tables=false".to_string(),
        format!("--host={}", db.host),
        format!("--port={}", db.port),
        format!("--user={}", db.user),
    ];
    if let Some(p) = &db.password {
        args.push(format!("--password={}", p));
    }
    args.push(db.database.clone());
    args
}

fn stderr_text(bytes: &[u8]) -> String {
    let s = String::from_utf8_lossy(bytes).trim().to_string();
    if s.is_empty() {
        "Unknown error".to_string()
    } else {
        s
    }
}

/// Dump `db` into `dest`, through `gzip -c` when `compress` is set.  Returns the size
/// of the file written.
pub fn create_backup(db: &DbConfig, dest: &Path, compress: bool) -> Result<u64> {
    let out = File::create(dest).with_context(|| format!("failed to create {:?}", dest))?;
    let mut dump = Command::new("mysqldump");
    dump.args(mysqldump_args(db)).stderr(Stdio::piped());
    // the password would end up in the log otherwise
    log::debug!("running mysqldump for {}@{}:{}/{}", db.user, db.host, db.port, db.database);

    if compress {
        let (reader, writer) = os_pipe::pipe().context("failed to create pipe")?;
        dump.stdout(writer);
        let mut gzip = Command::new("gzip");
        gzip.arg("-c").stdin(reader).stdout(out).stderr(Stdio::piped());
        log::debug!("piping into `{}`", DisplayCmd(&gzip));

        let dump_child = dump.spawn().context("failed to run mysqldump")?;
        // both ends of the pipe must be closed in this process or gzip never sees EOF
        drop(dump);
        let gzip_child = gzip.spawn().context("failed to run gzip")?;
        drop(gzip);

        let dump_out = dump_child.wait_with_output()?;
        let gzip_out = gzip_child.wait_with_output()?;
        if !dump_out.status.success() {
            bail!("mysqldump failed: {}", stderr_text(&dump_out.stderr));
        }
        if !gzip_out.status.success() {
            bail!("gzip compression failed: {}", stderr_text(&gzip_out.stderr));
        }
    } else {
        dump.stdout(out);
        let dump_out = dump.output().context("failed to run mysqldump")?;
        if !dump_out.status.success() {
            bail!("mysqldump failed: {}", stderr_text(&dump_out.stderr));
        }
    }

    let size = std::fs::metadata(dest)
        .with_context(|| format!("backup file {:?} was not created", dest))?
        .len();
    Ok(size)
}

/// Markers looked for in the first lines of a dump.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DumpInspection {
    pub sql_dump: bool,
    pub slurm_database: bool,
    pub slurm_tables: bool,
}

impl DumpInspection {
    pub fn of(head: &str) -> Self {
        let lower = head.to_lowercase();
        DumpInspection {
            sql_dump: ["MySQL dump", "MariaDB dump", "CREATE TABLE"]
                .iter()
                .any(|m| head.contains(m)),
            slurm_database: lower.contains("slurm") && lower.contains("acct"),
            slurm_tables: ["acct_coord_table", "cluster_table", "job_table", "qos_table"]
                .iter()
                .any(|t| head.contains(t)),
        }
    }

    pub fn checks(&self) -> [(&'static str, bool); 3] {
        [
            ("SQL dump format", self.sql_dump),
            ("Slurm database", self.slurm_database),
            ("Slurm tables", self.slurm_tables),
        ]
    }

    pub fn all_passed(&self) -> bool {
        self.sql_dump && self.slurm_database && self.slurm_tables
    }
}

fn head_lines(r: impl BufRead, n: usize) -> Result<String> {
    let mut head = String::new();
    for line in r.lines().take(n) {
        head.push_str(&line?);
        head.push('\n');
    }
    Ok(head)
}

/// The first [`VERIFY_HEAD_LINES`] lines of a backup.  Compressed files are tested
/// with `gzip -t` first.
pub fn read_backup_head(path: &Path) -> Result<String> {
    if !path.exists() {
        bail!("backup file {:?} does not exist", path);
    }
    if path.extension().map_or(false, |e| e == "gz") {
        let test = Command::new("gzip")
            .arg("-t")
            .arg(path)
            .output()
            .context("failed to run gzip")?;
        if !test.status.success() {
            bail!("backup file is corrupted: {}", stderr_text(&test.stderr));
        }
        let mut child = Command::new("gzip")
            .arg("-dc")
            .arg(path)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to run gzip")?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("gzip stdout was not captured"))?;
        let head = head_lines(BufReader::new(stdout), VERIFY_HEAD_LINES);
        // the rest of the dump isn't needed
        let _ = child.kill();
        let _ = child.wait();
        head
    } else {
        let f = File::open(path).with_context(|| format!("could not read backup {:?}", path))?;
        head_lines(BufReader::new(f), VERIFY_HEAD_LINES)
    }
}

pub fn verify_backup(path: &Path) -> Result<DumpInspection> {
    read_backup_head(path).map(|head| DumpInspection::of(&head))
}

pub fn is_backup_file_name(name: &str) -> bool {
    static BACKUP: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^slurm_(acct_db_)?backup_.*\.sql(\.gz)?$").unwrap());
    BACKUP.is_match(name)
}

/// Delete backups in `dir` last modified more than `retention_days` before `now`.
pub fn cleanup_old_backups(dir: &Path, retention_days: u32, now: SystemTime) -> Result<Vec<PathBuf>> {
    let cutoff = now
        .checked_sub(Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60))
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = vec![];
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to list {:?}", dir))? {
        let entry = entry?;
        let name = entry.file_name();
        if !is_backup_file_name(&name.to_string_lossy()) {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() || meta.modified()? >= cutoff {
            continue;
        }
        let path = entry.path();
        match std::fs::remove_file(&path) {
            Ok(()) => {
                log::info!("removed old backup {:?}", path);
                removed.push(path);
            }
            Err(e) => log::warn!("could not remove {:?}: {}", path, e),
        }
    }
    removed.sort();
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    #[test]
    fn parse_conf() {
        let text = "\
# slurmdbd.conf
AuthType=auth/munge
DbdHost=head01
StorageType=accounting_storage/mysql
StorageHost = db01
storageport=3307
StorageUser=slurmdbd
StoragePass=s3cr=t
#StorageLoc=commented_out
";
        let c = parse_slurmdbd_conf(text);
        assert_eq!(
            c,
            DbConfig {
                host: "db01".into(),
                port: "3307".into(),
                user: "slurmdbd".into(),
                password: Some("s3cr=t".into()),
                database: "slurm_acct_db".into(),
            }
        );
        assert_eq!(parse_slurmdbd_conf(""), DbConfig::default());
    }

    #[test]
    fn settings_file_is_required() {
        let err = load_db_config(None).unwrap_err();
        assert!(format!("{:#}", err).starts_with("Could not find slurmdbd.conf"));

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("slurmdbd.conf");
        let err = load_db_config(Some(missing.clone())).unwrap_err();
        assert!(format!("{:#}", err).contains("failed to read"));

        std::fs::write(&missing, "StorageHost=db02\nStorageLoc=acct\n").unwrap();
        let (path, db) = load_db_config(Some(missing.clone())).unwrap();
        assert_eq!(path, missing);
        assert_eq!(db.host, "db02");
        assert_eq!(db.database, "acct");
        assert_eq!(db.user, "slurm");
    }

    #[test]
    fn dump_command_line() {
        let mut db = DbConfig::default();
        assert_eq!(
            mysqldump_args(&db),
            [
                "--single-transaction",
                "--quick",
                "--lock-tables=false",
                "--host=localhost",
                "--port=3306",
                "--user=slurm",
                "slurm_acct_db"
            ]
        );
        db.password = Some("pw".into());
        let args = mysqldump_args(&db);
        assert_eq!(args[6], "--password=pw");
        assert_eq!(args.last().unwrap(), "slurm_acct_db");
    }

    #[test]
    fn file_names() {
        let t = Local.with_ymd_and_hms(2026, 10, 19, 14, 5, 9).unwrap();
        assert_eq!(backup_file_name(t, true), "slurm_acct_db_backup_20261019_140509.sql.gz");
        assert_eq!(backup_file_name(t, false), "slurm_acct_db_backup_20261019_140509.sql");
        assert!(is_backup_file_name("slurm_acct_db_backup_20261019_140509.sql.gz"));
        assert!(is_backup_file_name("slurm_backup_old.sql"));
        assert!(!is_backup_file_name("slurm_acct_db_backup_x.sql.bak"));
        assert!(!is_backup_file_name("notes.txt"));
    }

    #[test]
    fn inspection() {
        let head = "-- MySQL dump 10.13  Distrib 8.0.36\n-- Host: localhost    Database: slurm_acct_db\nCREATE TABLE `acct_coord_table` (\n";
        let i = DumpInspection::of(head);
        assert!(i.all_passed());

        let i = DumpInspection::of("-- MariaDB dump 10.19\n-- Database: other\n");
        assert!(i.sql_dump);
        assert!(!i.slurm_database);
        assert!(!i.slurm_tables);
        assert!(!i.all_passed());
        assert_eq!(i.checks().iter().filter(|(_, ok)| *ok).count(), 1);
    }

    #[test]
    fn verify_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("slurm_acct_db_backup_1.sql");
        let mut f = File::create(&p).unwrap();
        writeln!(f, "-- MySQL dump 10.13").unwrap();
        writeln!(f, "-- Database: slurm_acct_db").unwrap();
        for k in 0..50 {
            writeln!(f, "INSERT INTO `job_table` VALUES ({});", k).unwrap();
        }
        drop(f);
        assert!(verify_backup(&p).unwrap().all_passed());
        assert_eq!(read_backup_head(&p).unwrap().lines().count(), VERIFY_HEAD_LINES);
        assert!(verify_backup(&dir.path().join("missing.sql")).is_err());
    }

    #[test]
    fn retention() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["slurm_acct_db_backup_1.sql.gz", "slurm_backup_2.sql", "keep.txt"] {
            File::create(dir.path().join(name)).unwrap();
        }
        let future = SystemTime::now() + Duration::from_secs(10 * 24 * 60 * 60);

        assert!(cleanup_old_backups(dir.path(), 30, future).unwrap().is_empty());

        let removed = cleanup_old_backups(dir.path(), 7, future).unwrap();
        assert_eq!(
            removed,
            [
                dir.path().join("slurm_acct_db_backup_1.sql.gz"),
                dir.path().join("slurm_backup_2.sql")
            ]
        );
        assert!(dir.path().join("keep.txt").exists());
    }

    #[test]
    fn backup_dir_choice() {
        let dir = tempfile::tempdir().unwrap();
        let c = Config {
            backup_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(choose_backup_dir(Some(Path::new("/x")), &c), Path::new("/x"));
        assert_eq!(choose_backup_dir(None, &c), dir.path());
    }
}
