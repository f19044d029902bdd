//! Bulk mount tool and interactive shell (§6): a thin consumer of
//! [`imagemounter::Parser`]. No orchestration logic lives here — this
//! binary only parses arguments, renders status, and drives the library's
//! public API in the order §6/§7 describe.

mod shell;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser as ClapParser, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Table};
use console::style;
use dialoguer::Confirm;
use owo_colors::OwoColorize;

use imagemounter::config::{Config, PatternMap};
use imagemounter::dependencies::SECTIONS;
use imagemounter::disk_backing::DiskMounterPref;
use imagemounter::error::Error;
use imagemounter::sweeper::Sweeper;
use imagemounter::volume_system::VolumeDetectorPref;
use imagemounter::Parser;

/// Mounts forensic disk images and their nested volumes as ordinary
/// directories.
#[derive(ClapParser, Debug)]
#[command(name = "imount", version, about, long_about = None)]
struct Cli {
    /// One or more image paths or directories to mount.
    paths: Vec<PathBuf>,

    /// Print dependency status sections and exit.
    #[arg(long)]
    check: bool,

    /// Enter the interactive shell after mounting.
    #[arg(short = 'i', long)]
    interactive: bool,

    /// Sweep leftover mountpoints/loopbacks/volume groups from prior runs
    /// instead of mounting anything.
    #[arg(short = 'u', long)]
    unmount: bool,

    /// Pause on selected warnings (e.g. small-volume mount failures).
    #[arg(short = 'w', long)]
    wait: bool,

    /// Do not unmount on exit.
    #[arg(short = 'k', long)]
    keep: bool,

    /// Never prompt; implies `--keep` and disallows `--wait`.
    #[arg(long)]
    no_interaction: bool,

    /// Comma-separated indices/lastmountpoints/labels to restrict mounting to.
    #[arg(short = 'o', long = "only-mount", value_name = "CSV")]
    only_mount: Option<String>,

    /// Comma-separated indices/lastmountpoints/labels to skip.
    #[arg(long, value_name = "CSV")]
    skip: Option<String>,

    /// Increase verbosity (0=error, 1=warn, 2=info, 3+=debug).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Force colored output.
    #[arg(short = 'c', long)]
    color: bool,

    /// Disable colored output.
    #[arg(long = "no-color")]
    no_color: bool,

    /// Reconstruct a unified filesystem tree after mounting.
    #[arg(short = 'r', long)]
    reconstruct: bool,

    /// Carve unallocated space with photorec.
    #[arg(long)]
    carve: bool,

    /// Mount Windows volume shadow copies as subvolumes.
    #[arg(long)]
    vshadow: bool,

    /// Base directory for volume mountpoints (defaults to system temp).
    /// The original tool spells this `-md`; clap derive shorts are a
    /// single character, so only the long form is offered here.
    #[arg(long = "mountdir", value_name = "DIR")]
    mountdir: Option<PathBuf>,

    /// Use human-readable mountpoint names instead of random ones.
    #[arg(short = 'p', long)]
    pretty: bool,

    /// Case label composed into pretty mountpoints and sweeper patterns.
    /// Spelled `-cn` in the original tool; long form only here.
    #[arg(long = "casename")]
    casename: Option<String>,

    /// Mount read-write via a cache file (implies `xmount`). Spelled `-rw`
    /// in the original tool; long form only here.
    #[arg(long = "read-write")]
    read_write: bool,

    /// Disk-mounter helper to use.
    #[arg(short = 'm', long = "disk-mounter", value_enum, default_value = "auto")]
    disk_mounter: DiskMounterArg,

    /// Volume-system detector to use.
    #[arg(short = 'd', long = "volume-detector", value_enum, default_value = "auto")]
    volume_detector: VolumeDetectorArg,

    /// Per-index volume-system type overrides, `K=V[,K=V...]`.
    #[arg(long)]
    vstypes: Option<String>,

    /// Per-index filesystem type overrides, `K=V[,K=V...]`.
    #[arg(long)]
    fstypes: Option<String>,

    /// Per-index key material, `K=V` (commas disallowed inside `V`).
    #[arg(long)]
    keys: Option<String>,

    /// Retry unmounts with the lazy form when the plain form fails.
    #[arg(long = "lazy-unmount")]
    lazy_unmount: bool,

    /// Force single-volume detection.
    #[arg(long, overrides_with = "no_single")]
    single: bool,

    /// Force multi-volume detection (never fall back to single).
    #[arg(long)]
    no_single: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DiskMounterArg {
    Xmount,
    Affuse,
    Ewfmount,
    VmwareMount,
    Avfs,
    Nbd,
    Auto,
    Dummy,
}

impl From<DiskMounterArg> for DiskMounterPref {
    fn from(a: DiskMounterArg) -> Self {
        match a {
            DiskMounterArg::Xmount => DiskMounterPref::Xmount,
            DiskMounterArg::Affuse => DiskMounterPref::Affuse,
            DiskMounterArg::Ewfmount => DiskMounterPref::Ewfmount,
            DiskMounterArg::VmwareMount => DiskMounterPref::VmwareMount,
            DiskMounterArg::Avfs => DiskMounterPref::Avfs,
            DiskMounterArg::Nbd => DiskMounterPref::Nbd,
            DiskMounterArg::Auto => DiskMounterPref::Auto,
            DiskMounterArg::Dummy => DiskMounterPref::Dummy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum VolumeDetectorArg {
    Pytsk3,
    Mmls,
    Parted,
    Auto,
}

impl From<VolumeDetectorArg> for VolumeDetectorPref {
    fn from(a: VolumeDetectorArg) -> Self {
        match a {
            VolumeDetectorArg::Pytsk3 => VolumeDetectorPref::LibTsk,
            VolumeDetectorArg::Mmls => VolumeDetectorPref::Mmls,
            VolumeDetectorArg::Parted => VolumeDetectorPref::Parted,
            VolumeDetectorArg::Auto => VolumeDetectorPref::Auto,
        }
    }
}

/// Parses `K=V[,K=V...]` into pairs for a [`PatternMap`]. Argument errors
/// here are the CLI's own (exit code 2), distinct from the library's
/// `Error::Argument`.
fn parse_pattern_csv(raw: &str) -> Result<Vec<(String, String)>, String> {
    raw.split(',')
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| format!("expected `K=V`, got `{pair}`"))
        })
        .collect()
}

fn use_color(cli: &Cli) -> bool {
    if cli.no_color {
        false
    } else if cli.color {
        true
    } else {
        supports_color::on(supports_color::Stream::Stdout).is_some()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    imagemounter::logging::init(cli.verbose);

    if cli.no_interaction && cli.wait {
        eprintln!("--no-interaction disallows --wait");
        return ExitCode::from(2);
    }

    if cli.check {
        print_dependency_report(use_color(&cli));
        return ExitCode::SUCCESS;
    }

    if cli.unmount {
        return run_sweep(&cli).await;
    }

    if cli.paths.is_empty() {
        eprintln!("no image paths given (pass --check or --unmount, or at least one path)");
        return ExitCode::from(2);
    }

    run_bulk_mount(cli).await
}

fn print_dependency_report(color: bool) {
    for section in SECTIONS {
        println!(
            "\n{}",
            if color {
                style(section.title).bold().to_string()
            } else {
                section.title.to_string()
            }
        );
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Name", "Kind", "Status"]);
        for dep in section.dependencies {
            let available = dep.is_available();
            let status = if available {
                if color {
                    "available".green().to_string()
                } else {
                    "available".to_string()
                }
            } else if color {
                "missing".red().to_string()
            } else {
                "missing".to_string()
            };
            table.add_row(vec![dep.name.to_string(), dep.kind.to_string(), status]);
        }
        println!("{table}");
    }
    println!(
        "\nmagic-byte evidence source backend: {}",
        imagemounter::dependencies::magic_backend()
    );
}

fn config_from_cli(cli: &Cli) -> Result<Config, String> {
    let vstypes = PatternMap::from_pairs(
        cli.vstypes
            .as_deref()
            .map(parse_pattern_csv)
            .transpose()?
            .unwrap_or_default(),
    );
    let fstypes = PatternMap::from_pairs(
        cli.fstypes
            .as_deref()
            .map(parse_pattern_csv)
            .transpose()?
            .unwrap_or_default(),
    );
    let keys = PatternMap::from_pairs(
        cli.keys
            .as_deref()
            .map(parse_pattern_csv)
            .transpose()?
            .unwrap_or_default(),
    );

    let single = if cli.single {
        Some(true)
    } else if cli.no_single {
        Some(false)
    } else {
        None
    };

    Ok(Config {
        casename: cli.casename.clone(),
        mountdir: cli.mountdir.clone(),
        pretty: cli.pretty,
        read_write: cli.read_write,
        disk_mounter: cli.disk_mounter.into(),
        volume_detector: cli.volume_detector.into(),
        vstypes,
        fstypes,
        keys,
        single,
        lazy_unmount: cli.lazy_unmount,
    })
}

async fn run_bulk_mount(cli: Cli) -> ExitCode {
    let color = use_color(&cli);
    let config = match config_from_cli(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("argument error: {e}");
            return ExitCode::from(2);
        }
    };

    let mut parser = Parser::new(config);
    for path in &cli.paths {
        if let Err(e) = parser.add_disk(path, None) {
            eprintln!("{}", style(format!("error: {e}")).red());
            return exit_for(&e);
        }
    }

    if let Err(e) = parser.init(true).await {
        eprintln!("{}", style(format!("mount failed: {e}")).red());
        return exit_for(&e);
    }

    print_volume_statuses(&parser, color, cli.wait && !cli.no_interaction);

    if cli.reconstruct {
        match parser.reconstruct().await {
            Ok(root) => println!(
                "{} reconstructed unified tree at {}",
                style("✓").green(),
                root.display()
            ),
            Err(e) => eprintln!("{} reconstruction failed: {e}", style("✗").red()),
        }
    }

    if cli.interactive {
        if let Err(e) = shell::run(&mut parser).await {
            eprintln!("shell error: {e}");
        }
    }

    let should_unmount = if cli.keep || cli.no_interaction {
        false
    } else {
        Confirm::new()
            .with_prompt("Unmount all volumes now?")
            .default(false)
            .interact()
            .unwrap_or(false)
    };

    if should_unmount {
        if let Err(e) = parser.clean(true, cli.lazy_unmount).await {
            eprintln!("{} cleanup failed: {e}", style("✗").red());
            return exit_for(&e);
        }
        println!("{} all volumes unmounted", style("✓").green());
    } else {
        println!(
            "{} volumes left mounted under {}",
            style("ℹ").cyan(),
            parser
                .config
                .mountdir_or_temp()
                .display()
        );
    }

    ExitCode::SUCCESS
}

fn print_volume_statuses(parser: &Parser, color: bool, pause_on_warning: bool) {
    for volume in parser.volumes() {
        let label = volume.info.label.clone().unwrap_or_else(|| volume.index.clone());
        if let Some(err) = &volume.exception {
            let small = volume.size <= 1_048_576;
            if small {
                let line = format!("⚠ {} ({}): small volume, mount failed: {err}", volume.index, label);
                println!("{}", if color { style(line).yellow().to_string() } else { line });
                if pause_on_warning {
                    let _ = Confirm::new()
                        .with_prompt("Continue?")
                        .default(true)
                        .interact();
                }
            } else {
                let line = format!("✗ {} ({}): mount failed: {err}", volume.index, label);
                println!("{}", if color { style(line).red().to_string() } else { line });
            }
        } else if volume.is_mounted {
            let where_ = volume
                .mountpoint
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(no directory, container volume)".to_string());
            let line = format!("✓ {} ({}): mounted at {}", volume.index, label, where_);
            println!("{}", if color { style(line).green().to_string() } else { line });
        } else {
            let line = format!("· {} ({}): skipped", volume.index, label);
            println!("{}", if color { style(line).dim().to_string() } else { line });
        }
    }
}

fn exit_for(e: &Error) -> ExitCode {
    match e {
        Error::CommandNotFound(_) | Error::ModuleNotFound(_) => ExitCode::from(1),
        Error::Argument(_) | Error::DiskIndex(_) => ExitCode::from(2),
        _ => ExitCode::from(1),
    }
}

async fn run_sweep(cli: &Cli) -> ExitCode {
    let sweeper = Sweeper::new(cli.casename.clone(), cli.pretty, cli.mountdir.clone(), false);
    let commands = match sweeper.preview_unmount().await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("sweeper scan failed: {e}");
            return ExitCode::from(1);
        }
    };

    if commands.is_empty() {
        println!("nothing to clean up");
        return ExitCode::SUCCESS;
    }

    println!("the following commands will be run:");
    for c in &commands {
        println!("  {c}");
    }

    let proceed = if cli.no_interaction {
        true
    } else {
        Confirm::new()
            .with_prompt("Execute this unmount sequence?")
            .default(false)
            .interact()
            .unwrap_or(false)
    };

    if !proceed {
        println!("aborted");
        return ExitCode::SUCCESS;
    }

    if let Err(e) = sweeper.unmount().await {
        eprintln!("sweep finished with errors: {e}");
        return ExitCode::from(1);
    }
    println!("{}", style("✓ swept leftover mount state").green());
    ExitCode::SUCCESS
}
