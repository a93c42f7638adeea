//! win32emu host binary
//!
//! Thin wrapper over the library: parse arguments, install the logger, run
//! the executable, propagate the guest exit code to the host shell.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

/// Run an unmodified Windows PE32 (i386) executable under emulation
#[derive(Parser, Debug)]
#[command(name = "win32emu", version, about)]
struct Args {
    /// Path to the PE32 executable
    exe: PathBuf,

    /// Directory to search for DLL files (repeatable; imports are stubbed)
    #[arg(long = "dll-path")]
    dll_path: Vec<PathBuf>,

    /// Path to the registry backing store
    #[arg(long, default_value = "registry.json")]
    registry: PathBuf,

    /// Instructions per cooperative thread slice
    #[arg(long)]
    slice_budget: Option<u32>,

    /// Consecutive idle Sleep calls before halting
    #[arg(long)]
    idle_limit: Option<u32>,

    /// Guest address of the CRT __sbh_heap_init routine to intercept (hex)
    #[arg(long, value_parser = parse_guest_addr)]
    patch_sbh_init: Option<u32>,

    /// Guest address of the CRT __sbh_alloc_block routine to intercept (hex)
    #[arg(long, value_parser = parse_guest_addr)]
    patch_sbh_alloc: Option<u32>,

    /// Guest address of _CrtDbgReport to intercept (hex)
    #[arg(long, value_parser = parse_guest_addr)]
    patch_crtdbg_report: Option<u32>,
}

/// Accept `0x00401000` or bare hex
fn parse_guest_addr(s: &str) -> Result<u32, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|e| format!("bad guest address {s:?}: {e}"))
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = win32emu::EmuConfig {
        registry_path: Some(args.registry),
        patch_sbh_init: args.patch_sbh_init,
        patch_sbh_alloc: args.patch_sbh_alloc,
        patch_crtdbg_report: args.patch_crtdbg_report,
        ..Default::default()
    };
    if let Some(budget) = args.slice_budget {
        config.slice_budget = budget;
    }
    if let Some(limit) = args.idle_limit {
        config.idle_limit = limit;
    }

    match run(&args.exe, &args.dll_path, config) {
        Ok(code) => ExitCode::from((code & 0xFF) as u8),
        Err(err) => {
            log::error!("[EMU] {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(
    exe: &std::path::Path,
    dll_paths: &[PathBuf],
    config: win32emu::EmuConfig,
) -> anyhow::Result<i32> {
    win32emu::run(exe, dll_paths, config)
        .with_context(|| format!("running {}", exe.display()))
        .map_err(Into::into)
}
