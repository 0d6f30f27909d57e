use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use sigpatch::MemOpError;
use sigpatch::config::PatchFile;
use sigpatch::engine::{Backoff, EngineConfig, EngineState, PatchEngine};
use sigpatch::process::LinuxTarget;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Parser)]
#[clap(name = "sigpatch", version)]
/// Waits for a process and patches byte signatures inside one of its loaded modules
struct AppArgs {
    /// YAML file listing the patches to apply
    #[clap(short, long)]
    patches: PathBuf,

    /// Target process name (overrides the patch file)
    #[clap(long)]
    process: Option<String>,

    /// Substring of the module path to patch (overrides the patch file)
    #[clap(short, long)]
    module: Option<String>,

    /// Seconds to wait for the process, then again for the patch to land
    #[clap(short, long)]
    timeout: Option<u64>,

    /// Poll interval in milliseconds
    #[clap(short, long)]
    interval: Option<u64>,

    /// Delay policy between attach attempts
    #[clap(long, value_enum, default_value = "fixed")]
    backoff: BackoffKind,

    /// Enable verbose logging ($RUST_LOG="trace")
    #[clap(short, long)]
    verbose: bool,
}

fn build_config(args: &AppArgs, patch_file: &PatchFile) -> anyhow::Result<EngineConfig> {
    let process = args
        .process
        .clone()
        .or_else(|| patch_file.process.clone())
        .context("no target process given (use --process or `process:` in the patch file)")?;

    let module = args
        .module
        .clone()
        .or_else(|| patch_file.module.clone())
        .context("no target module given (use --module or `module:` in the patch file)")?;

    let budget = args
        .timeout
        .map(Duration::from_secs)
        .or_else(|| patch_file.timeout())
        .unwrap_or(EngineConfig::DEFAULT_BUDGET);

    let interval = args
        .interval
        .map(Duration::from_millis)
        .or_else(|| patch_file.interval())
        .unwrap_or(EngineConfig::DEFAULT_POLL_INTERVAL);

    let config = EngineConfig::new(process, module)
        .with_budget(budget)
        .with_poll_interval(interval);

    Ok(match args.backoff {
        BackoffKind::Fixed => config,
        BackoffKind::Exponential => config.with_backoff(Backoff::Exponential {
            initial: interval,
            max: interval * 10,
            factor: 2,
        }),
    })
}

fn real_main(args: &AppArgs) -> anyhow::Result<i32> {
    let patch_file = PatchFile::load(&args.patches)?;
    let specs = patch_file.specs()?;
    let config = build_config(args, &patch_file)?;

    log::info!(
        "Patching {} signature(s) in \"{}\" of \"{}\"",
        specs.len(),
        config.module_label,
        config.process_name
    );

    let engine = PatchEngine::new(LinuxTarget::new(), specs, config)
        .map_err(|err| anyhow::anyhow!(err.root_cause_string()))?;

    match engine.run() {
        Ok(report) if report.state == EngineState::Applied => {
            log::info!("Patched in {:.1}s", report.elapsed.as_secs_f32());
            Ok(0)
        }
        Ok(report) => {
            log::warn!(
                "No signature matched within {} attach attempt(s)",
                report.brackets
            );
            Ok(0)
        }
        Err(err @ MemOpError::DiscoveryTimeout { .. }) => {
            log::error!("{}", err.root_cause_string());
            Ok(1)
        }
        Err(err) => Err(anyhow::anyhow!(err.root_cause_string())),
    }
}

fn main() {
    let args = match AppArgs::try_parse() {
        Ok(args) => args,
        Err(error) => error.exit(),
    };

    env_logger::builder()
        .filter_level(if args.verbose {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Info
        })
        .parse_default_env()
        .init();

    let code = match real_main(&args) {
        Ok(code) => code,
        Err(error) => {
            log::error!("{:#}", error);
            1
        }
    };

    std::process::exit(code);
}
