use std::path::{Path, PathBuf};
use std::time::SystemTime;

use clap::Parser;
use format_num::format_num;

use bcm_slurm_tools::dbbackup::*;
use bcm_slurm_tools::*;

/// Back up the Slurm accounting database with mysqldump.
#[derive(Parser, Debug, Clone)]
struct ClArgs {
    /// Directory to write the backup to.
    #[clap(short, long)]
    output_dir: Option<PathBuf>,
    /// Write a plain .sql file instead of piping through gzip.
    #[clap(long)]
    no_compress: bool,
    /// Delete backups older than this many days from the backup directory.
    #[clap(long, value_name = "DAYS")]
    retention: Option<u32>,
    #[clap(short, long)]
    verbose: bool,
    /// Verify an existing backup and exit.
    #[clap(long, value_name = "FILE")]
    verify_only: Option<PathBuf>,
    /// Configuration file (default: ~/.config/bcm-slurm-tools/config.toml).
    #[clap(long)]
    config: Option<PathBuf>,
}

fn human_size(bytes: u64) -> String {
    format!("{} bytes", format_num!(",.0", bytes as f64))
}

/// Prints each check and returns whether all of them passed.
fn verify(path: &Path) -> bool {
    println!("Verifying {}", path.display());
    match verify_backup(path) {
        Ok(inspection) => {
            for (what, ok) in inspection.checks() {
                println!("  {} {}", if ok { "✓" } else { "✗" }, what);
            }
            inspection.all_passed()
        }
        Err(e) => {
            println!("  ✗ {:#}", e);
            false
        }
    }
}

fn backup(args: &ClArgs, config: &Config) -> Result<bool> {
    let (conf_path, db) = load_db_config(find_slurmdbd_conf(config))?;
    println!("Using database settings from {}", conf_path.display());
    println!("Database: {}@{}:{}/{}", db.user, db.host, db.port, db.database);

    let dir = choose_backup_dir(args.output_dir.as_deref(), config);
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {:?}", dir))?;
    let compress = !args.no_compress;
    let dest = dir.join(backup_file_name(chrono::Local::now(), compress));
    println!("Writing {}", dest.display());

    let size = create_backup(&db, &dest, compress)?;
    println!("Backup size: {}", human_size(size));
    if size < MIN_BACKUP_SIZE {
        eprintln!(
            "error: backup is only {} and is probably incomplete",
            human_size(size)
        );
        return Ok(false);
    }

    let verified = verify(&dest);

    if let Some(days) = args.retention {
        let removed = cleanup_old_backups(&dir, days, SystemTime::now())?;
        println!(
            "Removed {} backup(s) older than {} days from {}",
            removed.len(),
            days,
            dir.display()
        );
    }
    Ok(verified)
}

fn main() -> Result<()> {
    reset_sigpipe();
    let args = ClArgs::parse();
    init_logging(args.verbose);

    let ok = if let Some(path) = &args.verify_only {
        verify(path)
    } else {
        if !running_as_root() {
            log::warn!("not running as root, the backup directory or slurmdbd.conf may be unreadable");
        }
        let config = Config::load(args.config.as_deref())?;
        backup(&args, &config)?
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
