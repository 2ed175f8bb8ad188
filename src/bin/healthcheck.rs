use std::fs::File;
use std::io::{stdout, BufWriter, Write};
use std::path::PathBuf;

use clap::Parser;

use bcm_slurm_tools::baseline::Baseline;
use bcm_slurm_tools::bcm::BcmEnvironment;
use bcm_slurm_tools::checks::HealthChecks;
use bcm_slurm_tools::command::{Shell, SystemShell};
use bcm_slurm_tools::compare::{compare, CurrentState};
use bcm_slurm_tools::render::*;
use bcm_slurm_tools::report::{exit_code, HealthReport, OverallStatus};
use bcm_slurm_tools::*;

/// Check the health of a Slurm cluster managed by Bright Cluster Manager, or
/// capture and compare a pre-upgrade baseline.
#[derive(Parser, Debug, Clone)]
struct ClArgs {
    /// Show messages and details for every check.
    #[clap(short, long)]
    verbose: bool,
    /// Only print the summary.
    #[clap(short, long)]
    quiet: bool,
    /// Print the report as JSON instead of text.
    #[clap(long)]
    json: bool,
    #[clap(long)]
    no_color: bool,
    /// Write the report (or the captured baseline) to this file.
    #[clap(short, long)]
    output: Option<PathBuf>,
    /// Capture a baseline of the current cluster state and exit.
    #[clap(long)]
    pre_upgrade: bool,
    /// Run all checks and compare against --baseline.
    #[clap(long)]
    post_upgrade: bool,
    /// Baseline file written by --pre-upgrade.
    #[clap(short, long)]
    baseline: Option<PathBuf>,
    /// Only compare against --baseline, skip the regular checks.
    #[clap(long)]
    compare_only: bool,
    /// Configuration file (default: ~/.config/bcm-slurm-tools/config.toml).
    #[clap(long)]
    config: Option<PathBuf>,
}

fn capture_baseline(shell: &SystemShell, args: &ClArgs, palette: &Palette) -> Result<()> {
    println!("{}Capturing pre-upgrade baseline...{}", palette.bold, palette.reset);
    let baseline = Baseline::capture(shell, |step| {
        println!("  {}", format_capture_step(&step, palette))
    });
    let path = args.output.clone().unwrap_or_else(|| {
        format!(
            "slurm-baseline-{}.json",
            chrono::Local::now().format("%Y%m%d-%H%M%S")
        )
        .into()
    });
    baseline.save(&path)?;
    println!();
    println!(
        "{}Baseline saved to {}{}",
        palette.green,
        path.display(),
        palette.reset
    );
    println!("Run with --post-upgrade --baseline {} after the upgrade.", path.display());
    Ok(())
}

fn print_baseline_info(b: &Baseline, palette: &Palette) {
    println!("{}Comparing against baseline{}", palette.bold, palette.reset);
    println!("  Captured: {}", b.timestamp);
    println!("  Hostname: {}", b.hostname);
    println!(
        "  Slurm Version: {}",
        b.slurm_version.as_deref().unwrap_or("unknown")
    );
    println!();
}

fn write_output(report: &HealthReport, args: &ClArgs) -> Result<()> {
    match (&args.output, args.json) {
        (Some(path), json) => {
            let f = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
            let mut w = BufWriter::new(f);
            if json {
                write_json_report(report, &mut w)?;
                writeln!(w)?;
            } else {
                write_text_report(report, &mut w)?;
            }
            w.flush()?;
            if !args.quiet && !json {
                println!("Results written to {}", path.display());
            }
        }
        (None, true) => {
            let stdout = stdout();
            let mut w = stdout.lock();
            write_json_report(report, &mut w)?;
            writeln!(w)?;
        }
        (None, false) => {}
    }
    Ok(())
}

fn run(args: &ClArgs) -> Result<OverallStatus> {
    if (args.post_upgrade || args.compare_only) && args.baseline.is_none() {
        bail!("--post-upgrade and --compare-only require --baseline <FILE>");
    }

    let config = Config::load(args.config.as_deref())?;
    let shell = SystemShell::new(config.ssh_connect_timeout);
    let env = BcmEnvironment::detect(&shell, &config);
    let palette = Palette::detect(!args.no_color && !args.json);

    if args.pre_upgrade {
        capture_baseline(&shell, args, &palette)?;
        return Ok(OverallStatus::Healthy);
    }

    let version = shell.run("sinfo", &["--version"]);
    let version = if version.success() {
        version.stdout.trim().to_string()
    } else {
        "unknown".to_string()
    };
    let chatty = !args.quiet && !args.json;
    if chatty {
        print_header(&palette, &env, Some(version.as_str()));
    }

    let mut report = HealthReport::open(hostname(), version, current_user());
    if chatty {
        report = report.with_sink(Box::new(ConsoleSink::new(palette, args.verbose)));
    }

    if let Some(path) = args.baseline.as_ref().filter(|_| args.post_upgrade || args.compare_only) {
        let baseline = Baseline::load(path)?;
        if chatty {
            print_baseline_info(&baseline, &palette);
        }
        report.extend(compare(&baseline, &CurrentState::measure(&shell)));
    }

    if !args.compare_only {
        HealthChecks::new(&shell, &env, args.verbose).run_all(&mut report);
    }

    if !args.json {
        print_summary(&report, &palette);
    }
    write_output(&report, args)?;

    Ok(report.overall_status())
}

fn main() {
    reset_sigpipe();
    let args = ClArgs::parse();
    init_logging(args.verbose);

    let result = run(&args);
    if let Err(e) = &result {
        eprintln!("error: {:#}", e);
    }
    std::process::exit(exit_code(&result))
}
