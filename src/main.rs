//! pfiles — list the files a Windows process has open, lsof-style.
//!
//! Prints one `PID<TAB>PATH` line per open file. Handles whose name query
//! hangs (pipes, some devices) are skipped after a short timeout instead of
//! stalling the whole listing.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use sysinfo::{ProcessesToUpdate, System};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use pfiles::config::PfilesConfig;

#[derive(Parser, Debug)]
#[command(name = "pfiles", version)]
#[command(about = "List the files a Windows process has open", long_about = None)]
struct Args {
    /// Process IDs to inspect
    #[arg(value_name = "PID")]
    pids: Vec<u32>,

    /// Also inspect every running process with this executable name
    #[arg(short, long, value_name = "NAME")]
    name: Vec<String>,

    /// Give up on a handle's name after this many milliseconds
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Print NT device paths instead of drive-letter paths
    #[arg(long)]
    raw: bool,

    /// Only print paths of existing regular files
    #[arg(long)]
    files_only: bool,

    /// Print per-process scan counters to stderr
    #[arg(long)]
    stats: bool,

    /// Write the effective settings to the config file and exit
    #[arg(long)]
    save_config: bool,

    /// More logging (-v debug, -vv trace); PFILES_LOG overrides
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = PfilesConfig::load();
    if let Some(ms) = args.timeout_ms {
        config.name_timeout_ms = ms.clamp(10, 5000);
    }
    if args.raw {
        config.dos_paths = false;
    }
    if args.files_only {
        config.regular_files_only = true;
    }

    if args.save_config {
        let path = config.save().context("failed to save config")?;
        println!("Saved {}", path.display());
        return Ok(());
    }

    let pids = target_pids(&args);
    if pids.is_empty() {
        bail!("no process to inspect: pass a PID or --name");
    }

    run(&config, &pids, args.stats)
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("PFILES_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// PIDs given on the command line, then processes matched by name, without duplicates
fn target_pids(args: &Args) -> Vec<u32> {
    let mut pids = args.pids.clone();

    if !args.name.is_empty() {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);

        for wanted in &args.name {
            let mut found: Vec<u32> = sys
                .processes()
                .values()
                .filter(|p| name_matches(&p.name().to_string_lossy(), wanted))
                .map(|p| p.pid().as_u32())
                .collect();
            if found.is_empty() {
                warn!(name = %wanted, "no running process matches");
            }
            found.sort_unstable();
            pids.extend(found);
        }
    }

    let mut seen = HashSet::new();
    pids.retain(|pid| seen.insert(*pid));
    pids
}

/// `notepad` matches `notepad.exe`; comparison ignores ASCII case
fn name_matches(process_name: &str, wanted: &str) -> bool {
    process_name.eq_ignore_ascii_case(wanted)
        || process_name
            .strip_suffix(".exe")
            .or_else(|| process_name.strip_suffix(".EXE"))
            .is_some_and(|stem| stem.eq_ignore_ascii_case(wanted))
}

#[cfg(windows)]
fn run(config: &PfilesConfig, pids: &[u32], stats: bool) -> Result<()> {
    use std::path::Path;

    use pfiles::system::winapi;
    use pfiles::{DeviceMap, ProcessHandle};

    winapi::configure(config.scan_options());
    let devices = if config.dos_paths { DeviceMap::from_system() } else { DeviceMap::new() };

    let mut failed = 0;
    for &pid in pids {
        let scan = ProcessHandle::open(pid)
            .and_then(|process| winapi::shared().scan(pid, process.raw()))
            .with_context(|| format!("process {pid}"));

        let scan = match scan {
            Ok(scan) => scan,
            Err(e) => {
                eprintln!("pfiles: {e:#}");
                failed += 1;
                continue;
            }
        };

        for path in &scan.paths {
            let path = devices.convert(path);
            if config.regular_files_only && !Path::new(&path).is_file() {
                continue;
            }
            println!("{pid}\t{path}");
        }

        if stats {
            let s = &scan.stats;
            eprintln!(
                "{pid}: {} names from {} handles ({} duplicated, {} unnamed, {} failed, {} timed out) of {} system-wide in {:?}",
                s.resolved, s.handles_owned, s.duplicated, s.unnamed, s.failed, s.timed_out, s.handles_total, scan.elapsed,
            );
        }
    }

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(not(windows))]
fn run(_config: &PfilesConfig, _pids: &[u32], _stats: bool) -> Result<()> {
    bail!("pfiles can only inspect processes on Windows")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_matches() {
        assert!(name_matches("notepad.exe", "notepad"));
        assert!(name_matches("Notepad.EXE", "notepad.exe"));
        assert!(!name_matches("notepad++.exe", "notepad"));
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["pfiles", "42", "7", "--raw", "-vv", "--name", "svchost"]).unwrap();
        assert_eq!(args.pids, vec![42, 7]);
        assert_eq!(args.name, vec!["svchost".to_string()]);
        assert!(args.raw);
        assert_eq!(args.verbose, 2);
    }
}
