use std::path::{Path, PathBuf};

use clap::Parser;

use bcm_slurm_tools::bcm::{discover_role_nodes, find_cmsh};
use bcm_slurm_tools::command::{Shell, SystemShell};
use bcm_slurm_tools::filebackup::*;
use bcm_slurm_tools::render::Palette;
use bcm_slurm_tools::*;

/// Back up Slurm configuration files, prolog/epilog scripts and the systemd
/// units of every Slurm node, or restore missing files from such a backup.
#[derive(Parser, Debug, Clone)]
struct ClArgs {
    /// Backup directory (default: ./slurm-files-YYYYMMDD_HHMMSS).
    #[clap(short, long)]
    output_dir: Option<PathBuf>,
    /// Restore files missing on this host from a backup directory and exit.
    #[clap(long, value_name = "DIR")]
    restore: Option<PathBuf>,
    /// Only back up systemd units, laid out as <DIR>/<node>/<path>.
    #[clap(long)]
    units_only: bool,
    #[clap(short, long)]
    verbose: bool,
    #[clap(long)]
    no_color: bool,
    /// Configuration file (default: ~/.config/bcm-slurm-tools/config.toml).
    #[clap(long)]
    config: Option<PathBuf>,
}

fn default_output_dir(units_only: bool) -> PathBuf {
    let prefix = if units_only { "slurm-unitfiles" } else { "slurm-files" };
    format!("./{}-{}", prefix, chrono::Local::now().format("%Y%m%d_%H%M%S")).into()
}

fn restore_from(dir: &Path, palette: &Palette) -> Result<bool> {
    println!("{}Restoring files from {}{}", palette.bold, dir.display(), palette.reset);
    let s = restore(dir)?;
    println!();
    println!("{}Restore summary:{}", palette.bold, palette.reset);
    println!("  Restored: {}", s.restored);
    println!("  Skipped: {}", s.skipped);
    if s.failed > 0 {
        println!("  {}Failed: {}{}", palette.red, s.failed, palette.reset);
    }
    Ok(s.failed == 0)
}

fn backup(args: &ClArgs, config: &Config, palette: &Palette) -> Result<()> {
    let cmsh = find_cmsh(config)
        .ok_or_else(|| anyhow!("cmsh not found, is this a BCM head node?"))?;
    let cmsh = cmsh.to_string_lossy();
    let shell = SystemShell::new(config.ssh_connect_timeout);
    let root = args
        .output_dir
        .clone()
        .unwrap_or_else(|| default_output_dir(args.units_only));
    let mut backup = FileBackup::new(&shell, &root)?;
    if args.units_only {
        backup = backup.units_only();
    }
    println!("{}Backing up Slurm files to {}{}", palette.bold, root.display(), palette.reset);
    let steps = if args.units_only { 3 } else { 5 };
    let mut done = 0;
    let mut step = |what: &str| {
        done += 1;
        println!();
        println!("{}[{}/{}] {}{}", palette.cyan, done, steps, what, palette.reset);
    };

    let mut settings = IndexMap::new();
    if !args.units_only {
        step("Reading WLM settings");
        let out = shell.run(&cmsh, &["-c", "wlm; use slurm; show"]);
        if out.success() {
            settings = parse_wlm_settings(&out.stdout);
        } else {
            log::warn!("failed to read WLM settings: {}", out.error_text());
        }
        let paths = SlurmPaths::from_settings(&settings);
        log::debug!("slurm prefix {:?}, etc {:?}", paths.prefix, paths.etc);
    }

    step("Discovering Slurm nodes");
    let nodes = discover_role_nodes(&shell, &cmsh);
    if nodes.is_empty() {
        bail!("no nodes with Slurm roles found via cmsh");
    }
    println!("  {} node(s): {}", nodes.len(), nodes.join(", "));

    step("Backing up systemd unit files");
    for node in &nodes {
        let units = backup.backup_node_units(node);
        if units == 0 {
            println!("  {}[{}] no Slurm related units{}", palette.yellow, node, palette.reset);
        } else {
            println!("  [{}] {} unit(s)", node, units);
        }
    }

    if !args.units_only {
        step("Backing up prolog/epilog scripts and config files");
        let prolog_dirs: Vec<PathBuf> = PROLOG_EPILOG_DIRS.iter().map(PathBuf::from).collect();
        let failed = backup.backup_local_files(&settings, &prolog_dirs);
        if failed > 0 {
            println!("  {}{} file(s) could not be backed up{}", palette.yellow, failed, palette.reset);
        }
    }
    step("Writing manifest");
    let manifest = backup.save_manifest()?;

    println!();
    println!("{}{}Backup completed{}", palette.green, palette.bold, palette.reset);
    println!("  Files backed up: {}", backup.manifest.files.len());
    println!("  Backup directory: {}", backup.root().display());
    println!("  Manifest: {}", manifest.display());
    Ok(())
}

fn main() -> Result<()> {
    reset_sigpipe();
    let args = ClArgs::parse();
    init_logging(args.verbose);
    let palette = Palette::detect(!args.no_color);

    let ok = if let Some(dir) = &args.restore {
        restore_from(dir, &palette)?
    } else {
        if !running_as_root() {
            log::warn!("not running as root, some files may not be readable");
        }
        let config = Config::load(args.config.as_deref())?;
        backup(&args, &config, &palette)?;
        true
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
