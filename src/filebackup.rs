//! Backup and restore of the files a Slurm installation is made of, besides the
//! accounting database: systemd units on every Slurm node, prolog/epilog
//! scripts and the contents of the Slurm `etc` directory.
//!
//! Every copied file is listed in `manifest.json` at the backup root, which is
//! what [`restore`] works from.
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::command::Shell;
use crate::*;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Unit name patterns backed up from every node.  munge and the database
/// server are included since Slurm does not run without them.
pub const UNIT_PATTERNS: &[&str] = &["slurm*", "munge*", "mysql*", "mariadb*"];

pub const DEFAULT_SLURM_PREFIX: &str = "/cm/shared/apps/slurm";
pub const DEFAULT_SLURM_ETC: &str = "/cm/shared/apps/slurm/var/etc/slurm";

pub const PROLOG_EPILOG_DIRS: &[&str] = &[
    "/cm/local/apps/slurm/var/prologs",
    "/cm/local/apps/slurm/var/epilogs",
];

/// WLM settings that name a prolog or epilog script.
pub const SCRIPT_SETTINGS: &[&str] = &[
    "Prolog Slurmctld",
    "Epilog Slurmctld",
    "Prolog",
    "Epilog",
    "Task Prolog",
    "Task Epilog",
    "Srun Prolog",
    "Srun Epilog",
];

/// Shipped with BCM, never backed up.
static BCM_SCRIPTS: phf::Set<&'static str> = phf::phf_set! {
    "/cm/local/apps/cmd/scripts/prolog",
    "/cm/local/apps/cmd/scripts/epilog",
};

/// slurm.conf option and the Lua script it loads when set to a `lua` plugin.
const LUA_PLUGINS: &[(&str, &str)] = &[
    ("CliFilterPlugins", "cli_filter.lua"),
    ("JobSubmitPlugins", "job_submit.lua"),
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    #[default]
    File,
    Symlink,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Systemd,
    Scripts,
    PrologEpilog,
    Config,
}

impl Category {
    /// Top-level directory of the backup tree holding this category.
    pub fn dir(self) -> &'static str {
        match self {
            Category::Systemd => "systemd",
            Category::Scripts | Category::PrologEpilog => "scripts",
            Category::Config => "config",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Where the file lives on the cluster.
    pub path: PathBuf,
    #[serde(rename = "type", default)]
    pub kind: EntryKind,
    /// Absolute symlink target, only for symlinks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,
    /// Remote node the file was copied from.  Absent for files on this host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub category: Category,
    /// Relative to the backup root.
    #[serde(default)]
    pub backup_file: PathBuf,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub created: String,
    pub files: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Manifest {
            created: iso_timestamp(),
            files: vec![],
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.iter().any(|e| e.path == path)
    }

    pub fn save(&self, root: &Path) -> Result<PathBuf> {
        let p = root.join(MANIFEST_FILE);
        write_json(self, &p).context("failed to save manifest")?;
        Ok(p)
    }

    pub fn load(root: &Path) -> Result<Self> {
        read_json(root.join(MANIFEST_FILE)).context("failed to load manifest")
    }
}

/// `Key   value` rows of `cmsh -c "wlm; use slurm; show"`.  Keys may contain
/// single spaces, so a key ends at the first run of two or more.
pub fn parse_wlm_settings(output: &str) -> IndexMap<String, String> {
    lazy_static::lazy_static! {
        static ref SETTING: Regex = Regex::new(r"^(.+?)\s{2,}(.*)$").unwrap();
    }
    non_empty_lines(output)
        .filter_map(|line| SETTING.captures(line))
        .map(|c| (c[1].trim().to_string(), c[2].trim().to_string()))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlurmPaths {
    pub prefix: PathBuf,
    pub etc: PathBuf,
}

impl Default for SlurmPaths {
    fn default() -> Self {
        SlurmPaths {
            prefix: DEFAULT_SLURM_PREFIX.into(),
            etc: DEFAULT_SLURM_ETC.into(),
        }
    }
}

impl SlurmPaths {
    pub fn from_settings(settings: &IndexMap<String, String>) -> Self {
        let mut p = SlurmPaths::default();
        if let Some(v) = settings.get("Prefix").filter(|v| !v.is_empty()) {
            p.prefix = v.into();
        }
        if let Some(v) = settings.get("Etc").filter(|v| !v.is_empty()) {
            p.etc = v.into();
        }
        p
    }
}

/// Prolog/epilog scripts configured in WLM settings, minus the BCM defaults.
pub fn custom_scripts(settings: &IndexMap<String, String>) -> Vec<PathBuf> {
    SCRIPT_SETTINGS
        .iter()
        .filter_map(|key| settings.get(*key))
        .map(|v| v.trim())
        .filter(|v| !v.is_empty() && !BCM_SCRIPTS.contains(*v))
        .map(PathBuf::from)
        .collect()
}

/// Unit names from `systemctl list-unit-files --no-legend`.  Only services
/// are kept, in order of first appearance.
pub fn parse_unit_list(output: &str) -> Vec<String> {
    let mut units: IndexSet<String> = IndexSet::new();
    for line in non_empty_lines(output) {
        if let Some(unit) = line.split_whitespace().next() {
            if unit.ends_with(".service") {
                units.insert(unit.to_string());
            }
        }
    }
    units.into_iter().collect()
}

/// Unit file and drop-in paths from
/// `systemctl show UNIT -p FragmentPath -p DropInPaths`.
pub fn parse_unit_paths(output: &str) -> Vec<String> {
    let mut fragment = None;
    let mut dropins = vec![];
    for line in non_empty_lines(output) {
        let (key, value) = match line.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => continue,
        };
        match key {
            "FragmentPath" if !value.is_empty() => fragment = Some(value.to_string()),
            "DropInPaths" => dropins.extend(value.split_whitespace().map(String::from)),
            _ => {}
        }
    }
    fragment.into_iter().chain(dropins).collect()
}

pub fn list_node_units<S: Shell + ?Sized>(shell: &S, node: &str) -> Vec<String> {
    let mut units: IndexSet<String> = IndexSet::new();
    for pattern in UNIT_PATTERNS {
        let quoted = format!("'{}'", pattern);
        let out = shell.run_ssh(
            node,
            &["systemctl", "list-unit-files", &quoted, "--no-legend", "--no-pager"],
        );
        if !out.success() {
            log::debug!("[{}] unable to list {} unit files: {}", node, pattern, out.error_text());
            continue;
        }
        units.extend(parse_unit_list(&out.stdout));
    }
    units.into_iter().collect()
}

pub fn node_unit_paths<S: Shell + ?Sized>(shell: &S, node: &str, unit: &str) -> Vec<String> {
    let out = shell.run_ssh(
        node,
        &["systemctl", "show", unit, "-p", "FragmentPath", "-p", "DropInPaths", "--no-pager"],
    );
    if !out.success() {
        log::debug!("[{}] unable to query paths of {}: {}", node, unit, out.error_text());
        return vec![];
    }
    parse_unit_paths(&out.stdout)
}

/// Resolve `.` and `..` without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(c);
                }
            }
            c => out.push(c),
        }
    }
    out
}

/// Absolute target of the symlink at `link`.  Relative targets are taken
/// from the link's directory.
pub fn symlink_target(link: &Path) -> Result<PathBuf> {
    let target = std::fs::read_link(link).with_context(|| format!("failed to read link {:?}", link))?;
    if target.is_absolute() {
        return Ok(normalize_path(&target));
    }
    let dir = link.parent().unwrap_or_else(|| Path::new("/"));
    Ok(normalize_path(&dir.join(target)))
}

fn is_symlink(p: &Path) -> bool {
    p.symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// True for anything at `p`, including dangling symlinks.
fn occupied(p: &Path) -> bool {
    p.symlink_metadata().is_ok()
}

fn sorted_entries(dir: &Path) -> Vec<PathBuf> {
    let mut entries: Vec<_> = match std::fs::read_dir(dir) {
        Ok(rd) => rd.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(e) => {
            log::debug!("cannot list {:?}: {}", dir, e);
            return vec![];
        }
    };
    entries.sort();
    entries
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptLink {
    pub link: PathBuf,
    pub target: PathBuf,
}

/// Symlinks directly inside the prolog/epilog directories.
pub fn prolog_epilog_symlinks(dirs: &[PathBuf]) -> Vec<ScriptLink> {
    let mut links = vec![];
    for dir in dirs {
        for p in sorted_entries(dir) {
            if !is_symlink(&p) {
                continue;
            }
            match symlink_target(&p) {
                Ok(target) => links.push(ScriptLink { link: p, target }),
                Err(e) => log::warn!("{:#}", e),
            }
        }
    }
    links
}

/// Entries of the Slurm etc directory: files and symlinks, plus the files one
/// level down in subdirectories such as `plugstack.conf.d`.
pub fn config_files(etc: &Path) -> Vec<PathBuf> {
    let mut files = vec![];
    for p in sorted_entries(etc) {
        if is_symlink(&p) || p.is_file() {
            files.push(p);
        } else if p.is_dir() {
            files.extend(sorted_entries(&p).into_iter().filter(|s| s.is_file()));
        }
    }
    files
}

/// Lua scripts that slurm.conf loads through a `lua` plugin.
pub fn enabled_lua_plugins(slurm_conf: &str) -> Vec<&'static str> {
    LUA_PLUGINS
        .iter()
        .filter(|(option, _)| {
            non_empty_lines(slurm_conf)
                .filter(|l| !l.starts_with('#'))
                .any(|l| l.contains(option) && l.to_lowercase().contains("lua"))
        })
        .map(|&(_, file)| file)
        .collect()
}

pub fn lua_plugin_files(etc: &Path) -> Vec<PathBuf> {
    let conf = etc.join("slurm.conf");
    let text = match std::fs::read_to_string(&conf) {
        Ok(t) => t,
        Err(e) => {
            log::debug!("cannot read {:?}: {}", conf, e);
            return vec![];
        }
    };
    enabled_lua_plugins(&text)
        .into_iter()
        .map(|f| etc.join(f))
        .filter(|p| is_symlink(p) || p.is_file())
        .collect()
}

/// `path` below `base`, with the leading `/` dropped.
fn under(base: &Path, path: &Path) -> PathBuf {
    base.join(path.strip_prefix("/").unwrap_or(path))
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {:?}", parent))?;
    }
    std::fs::copy(from, to).with_context(|| format!("failed to copy {:?} to {:?}", from, to))?;
    Ok(())
}

/// Collects files into a backup tree and records them in the manifest.
pub struct FileBackup<'a, S: Shell + ?Sized> {
    shell: &'a S,
    root: PathBuf,
    unit_root: PathBuf,
    pub manifest: Manifest,
}

impl<'a, S: Shell + ?Sized> FileBackup<'a, S> {
    pub fn new(shell: &'a S, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).with_context(|| format!("failed to create {:?}", root))?;
        Ok(FileBackup {
            shell,
            unit_root: root.join(Category::Systemd.dir()),
            root,
            manifest: Manifest::new(),
        })
    }

    /// Lay units out as `<root>/<node>/...` instead of `<root>/systemd/<node>/...`.
    pub fn units_only(mut self) -> Self {
        self.unit_root = self.root.clone();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn relative(&self, p: &Path) -> PathBuf {
        p.strip_prefix(&self.root).unwrap_or(p).to_path_buf()
    }

    /// scp one unit file or drop-in directory off `node`.
    pub fn backup_remote_path(&mut self, node: &str, remote: &str) -> Result<()> {
        let dest = under(&self.unit_root.join(node), Path::new(remote));
        let dir = dest.parent().unwrap_or(self.unit_root.as_path()).to_path_buf();
        std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {:?}", dir))?;
        let source = format!("{}:{}", node, remote);
        let dir_arg = dir.to_string_lossy();
        let out = self.shell.run(
            "scp",
            &["-r", "-o", "StrictHostKeyChecking=no", &source, &dir_arg],
        );
        if !out.success() {
            bail!("failed to copy {} from {}: {}", remote, node, out.error_text());
        }
        log::debug!("[{}] copied {}", node, remote);
        let backup_file = self.relative(&dest);
        self.manifest.files.push(ManifestEntry {
            path: remote.into(),
            kind: EntryKind::File,
            target: None,
            node: Some(node.to_string()),
            category: Category::Systemd,
            backup_file,
        });
        Ok(())
    }

    /// Back up every Slurm related unit on `node`.  Returns the number of
    /// units found; copy failures are logged.
    pub fn backup_node_units(&mut self, node: &str) -> usize {
        let units = list_node_units(self.shell, node);
        for unit in &units {
            let paths = node_unit_paths(self.shell, node, unit);
            if paths.is_empty() {
                log::warn!("[{}] unit {} has no resolvable path, skipping", node, unit);
            }
            for p in paths {
                if let Err(e) = self.backup_remote_path(node, &p) {
                    log::warn!("{:#}", e);
                }
            }
        }
        units.len()
    }

    /// Copy a file on this host into `<root>/<category>/<path>`.  A symlink is
    /// stored as the content of its target.
    pub fn backup_local_file(&mut self, path: &Path, category: Category) -> Result<()> {
        if !occupied(path) {
            bail!("file not found: {}", path.display());
        }
        let dest = under(&self.root.join(category.dir()), path);
        let (kind, target) = if is_symlink(path) {
            let target = symlink_target(path)?;
            if !target.exists() {
                bail!("symlink target does not exist: {}", target.display());
            }
            copy_file(&target, &dest)?;
            (EntryKind::Symlink, Some(target))
        } else {
            copy_file(path, &dest)?;
            (EntryKind::File, None)
        };
        log::debug!("backed up {}", path.display());
        let backup_file = self.relative(&dest);
        self.manifest.files.push(ManifestEntry {
            path: path.to_path_buf(),
            kind,
            target,
            node: None,
            category,
            backup_file,
        });
        Ok(())
    }

    /// Store the target of a prolog/epilog symlink under `<root>/scripts/<target>`.
    pub fn backup_script_link(&mut self, link: &ScriptLink) -> Result<()> {
        if !link.target.exists() {
            bail!("symlink target does not exist: {}", link.target.display());
        }
        let dest = under(&self.root.join(Category::PrologEpilog.dir()), &link.target);
        copy_file(&link.target, &dest)?;
        let backup_file = self.relative(&dest);
        self.manifest.files.push(ManifestEntry {
            path: link.link.clone(),
            kind: EntryKind::Symlink,
            target: Some(link.target.clone()),
            node: None,
            category: Category::PrologEpilog,
            backup_file,
        });
        Ok(())
    }

    /// Custom scripts, prolog/epilog links, then the etc directory and its Lua
    /// plugins.  Returns the number of files that could not be backed up.
    pub fn backup_local_files(
        &mut self,
        settings: &IndexMap<String, String>,
        prolog_dirs: &[PathBuf],
    ) -> usize {
        let paths = SlurmPaths::from_settings(settings);
        let mut failed = 0;
        let mut report = |r: Result<()>| {
            if let Err(e) = r {
                log::warn!("{:#}", e);
                failed += 1;
            }
        };

        for script in custom_scripts(settings) {
            report(self.backup_local_file(&script, Category::Scripts));
        }
        for link in prolog_epilog_symlinks(prolog_dirs) {
            report(self.backup_script_link(&link));
        }
        for file in config_files(&paths.etc) {
            report(self.backup_local_file(&file, Category::Config));
        }
        for lua in lua_plugin_files(&paths.etc) {
            if !self.manifest.contains(&lua) {
                report(self.backup_local_file(&lua, Category::Config));
            }
        }
        failed
    }

    pub fn save_manifest(&self) -> Result<PathBuf> {
        self.manifest.save(&self.root)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Put one manifest entry back.  Returns `false` when there was nothing to do:
/// the file came from another node or already exists.
pub fn restore_entry(backup_root: &Path, entry: &ManifestEntry) -> Result<bool> {
    if entry.node.is_some() || occupied(&entry.path) {
        return Ok(false);
    }
    if entry.backup_file.as_os_str().is_empty() {
        bail!("no backup file recorded for {}", entry.path.display());
    }
    let backup = backup_root.join(&entry.backup_file);
    if !backup.exists() {
        bail!("backup file not found: {}", backup.display());
    }
    if let Some(parent) = entry.path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {:?}", parent))?;
    }
    match (entry.kind, &entry.target) {
        (EntryKind::Symlink, Some(target)) => {
            if !target.exists() {
                copy_file(&backup, target)?;
                log::info!("restored target file {}", target.display());
            }
            std::os::unix::fs::symlink(target, &entry.path)
                .with_context(|| format!("failed to create symlink {:?}", entry.path))?;
        }
        _ => copy_file(&backup, &entry.path)?,
    }
    Ok(true)
}

/// Restore every missing local file listed in the manifest under `backup_root`.
/// Existing files are never overwritten.
pub fn restore(backup_root: &Path) -> Result<RestoreSummary> {
    let manifest = Manifest::load(backup_root)?;
    let mut summary = RestoreSummary::default();
    for entry in &manifest.files {
        match restore_entry(backup_root, entry) {
            Ok(true) => {
                log::info!("restored {}", entry.path.display());
                summary.restored += 1;
            }
            Ok(false) => {
                log::debug!("skipping {}", entry.path.display());
                summary.skipped += 1;
            }
            Err(e) => {
                log::warn!("{:#}", e);
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}
