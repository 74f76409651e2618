use perfeed_core::config::{PerfeedConfig, TargetSettings};
use perfeed_core::executor::{CommandExecutor, ExecutionStatus, Executor};
use perfeed_core::mode::CounterMode;
use perfeed_core::observer::{Observer, PerfObserver};
use perfeed_core::sys::is_perf_supported;

use anyhow::Context;
use clap::Parser;
use log::{LevelFilter, debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Runs a target once per input and reports a hardware-counter metric for each run.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Counter mode: i, b, e or their long names. Overrides the config file.
    #[clap(short, long)]
    mode: Option<CounterMode>,
    #[clap(long)]
    timeout_ms: Option<u64>,
    /// Print one JSON object per run instead of text.
    #[clap(long)]
    json: bool,
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Input files or directories. Without any, the target runs once on empty input.
    #[clap(short, long = "input")]
    inputs: Vec<PathBuf>,
    /// Target command line. Overrides `[target].command`.
    #[clap(last = true)]
    command: Vec<String>,
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    // RUST_LOG still wins when set.
    builder.parse_default_env();
    builder.init();
}

fn load_config(path: Option<&Path>) -> Result<PerfeedConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            PerfeedConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from("perfeed.toml");
            if default_config_path.exists() {
                info!("No config file specified, loading default: {default_config_path:?}");
                PerfeedConfig::load_from_file(&default_config_path)
            } else {
                debug!("No config file specified and 'perfeed.toml' not found, using defaults");
                Ok(PerfeedConfig::default())
            }
        }
    }
}

fn collect_inputs(paths: &[PathBuf]) -> Result<Vec<(String, Vec<u8>)>, anyhow::Error> {
    let mut inputs = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut entries = std::fs::read_dir(path)
                .with_context(|| format!("Failed to list input directory {path:?}"))?
                .collect::<Result<Vec<_>, _>>()?;
            entries.sort_by_key(|e| e.path());
            for entry in entries {
                let file_path = entry.path();
                if file_path.is_file() {
                    let data = std::fs::read(&file_path)
                        .with_context(|| format!("Failed to read input {file_path:?}"))?;
                    inputs.push((file_path.display().to_string(), data));
                }
            }
        } else {
            let data =
                std::fs::read(path).with_context(|| format!("Failed to read input {path:?}"))?;
            inputs.push((path.display().to_string(), data));
        }
    }
    if inputs.is_empty() {
        inputs.push(("<empty>".to_string(), Vec::new()));
    }
    Ok(inputs)
}

fn status_label(status: &ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Ok => "ok".to_string(),
        ExecutionStatus::Timeout => "timeout".to_string(),
        ExecutionStatus::Crash(reason) => format!("crash ({reason})"),
        ExecutionStatus::ObserverError(msg) => format!("observer error ({msg})"),
        ExecutionStatus::Other(msg) => format!("error ({msg})"),
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let mut config = load_config(cli.config_file.as_deref())?;

    if let Some(mode) = cli.mode {
        config.counter.mode = mode;
    }
    if !cli.command.is_empty() {
        config.target.get_or_insert_with(TargetSettings::default).command = cli.command.clone();
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        if let Some(target) = config.target.as_mut() {
            target.timeout_ms = timeout_ms;
        } else {
            warn!("--timeout-ms given without a target command. Override ignored.");
        }
    }
    debug!("Effective configuration: {config:#?}");

    let target = config
        .target
        .as_ref()
        .filter(|t| !t.command.is_empty())
        .ok_or_else(|| anyhow::anyhow!("No target command given in config or after `--`"))?;

    let mode = config.counter.mode;
    if mode.is_enabled() && !is_perf_supported() {
        anyhow::bail!(
            "Hardware performance counters are unavailable (check perf_event_paranoid or \
             virtualization); cannot use mode {mode}"
        );
    }
    if !mode.is_enabled() {
        warn!("Counter mode is disabled; runs will report no metric");
    }

    let settings = config.counter.settings()?;
    let mut executor = CommandExecutor::new(target.executor_config());
    let mut perf_observer = PerfObserver::new(mode, settings);
    let inputs = collect_inputs(&cli.inputs)?;

    info!(
        "Running {:?} on {} input(s) in {mode} mode",
        target.command,
        inputs.len()
    );
    let start_time = Instant::now();
    let mut measured = 0usize;
    let mut overflowed = 0usize;
    let mut failed = 0usize;

    for (name, data) in &inputs {
        let status = {
            let mut observers: Vec<&mut dyn Observer> = vec![&mut perf_observer];
            executor.execute_sync(data, &mut observers)
        };
        let reading = perf_observer.last_reading();

        match reading {
            Some(r) if r.metric.count().is_some() => measured += 1,
            Some(_) => overflowed += 1,
            None => failed += 1,
        }

        if cli.json {
            let line = serde_json::json!({
                "input": name,
                "status": status_label(&status),
                "reading": reading,
            });
            println!("{line}");
        } else {
            match reading {
                Some(r) if r.suspect => {
                    println!("{name}: {} {} (suspect) [{}]", r.metric, r.mode, status_label(&status))
                }
                Some(r) => println!("{name}: {} {} [{}]", r.metric, r.mode, status_label(&status)),
                None => println!("{name}: no reading [{}]", status_label(&status)),
            }
        }
    }

    let elapsed_total = start_time.elapsed();
    info!(
        "Finished {} run(s) in {elapsed_total:.2?}: {measured} measured, {overflowed} overflowed, \
         {failed} without a reading",
        inputs.len()
    );

    Ok(())
}
