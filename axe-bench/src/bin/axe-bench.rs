//! Benchmark an AxeOS device across core voltage and frequency settings.
//!
//! Starting from the given voltage and frequency, the device is stepped up
//! in frequency while it stays stable and given more voltage when it
//! doesn't. On exit, whether the search finished, was interrupted or hit a
//! safety limit, the device is left on the best settings found and the
//! results are written to `bitaxe_benchmark_results_<device>.json`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use tokio_util::sync::CancellationToken;

use axe_bench::config::{BackoffMode, BenchmarkConfig, SamplingConfig, SearchLimits};
use axe_bench::device::HttpDeviceClient;
use axe_bench::report::{ReportWriter, format_summary};
use axe_bench::search::{BenchmarkOutcome, SearchController};
use axe_bench::tracing::{init_journald_or_stdout, prelude::*};
use axe_bench::types::Configuration;

const DISCLAIMER: &str = "\
DISCLAIMER: This tool stresses the device by running it at voltages and
frequencies outside the factory settings. Hard limits on temperature,
power and input voltage are enforced, but overclocking can still damage
hardware or shorten its life. Make sure the device is properly cooled and
powered. Use at your own risk.
";

#[derive(Parser, Debug)]
#[command(name = "axe-bench", version)]
#[command(about = "Find the best stable core voltage and frequency for an AxeOS device")]
struct Args {
    /// IP address or hostname of the device
    device: Option<String>,

    /// Initial core voltage (mV)
    #[arg(short = 'v', long, default_value_t = 1150)]
    voltage: u32,

    /// Initial frequency (MHz)
    #[arg(short = 'f', long, default_value_t = 525)]
    frequency: u32,

    /// How long each setting is sampled (seconds)
    #[arg(long, default_value_t = 150, value_name = "SECS")]
    benchmark_time: u64,

    /// Delay between telemetry samples (seconds)
    #[arg(long, default_value_t = 15, value_name = "SECS")]
    sample_interval: u64,

    /// Also lower the frequency one step when a setting is unstable
    #[arg(long)]
    retreat_frequency: bool,

    /// Directory for the JSON results file
    #[arg(long, default_value = ".", value_name = "DIR")]
    output_dir: PathBuf,
}

impl Args {
    fn benchmark_config(&self) -> BenchmarkConfig {
        let backoff = if self.retreat_frequency {
            BackoffMode::RetreatFrequency
        } else {
            BackoffMode::HoldFrequency
        };

        BenchmarkConfig {
            initial: Some(Configuration::new(self.voltage, self.frequency)),
            search: SearchLimits {
                backoff,
                ..Default::default()
            },
            sampling: SamplingConfig {
                benchmark_time: Duration::from_secs(self.benchmark_time),
                sample_interval: Duration::from_secs(self.sample_interval),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let Some(device) = args.device.clone() else {
        let _ = Args::command().print_help();
        return ExitCode::FAILURE;
    };

    init_journald_or_stdout();

    match run(device, &args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(device: String, args: &Args) -> Result<ExitCode> {
    let config = args.benchmark_config();
    let initial = config.initial_configuration();
    let backoff = config.search.backoff;

    let client = HttpDeviceClient::new(&device)
        .with_context(|| format!("Failed to create client for {device}"))?;
    let base_url = client.base_url().to_string();
    let controller = SearchController::new(Arc::new(client), config)
        .context("Invalid benchmark parameters")?;

    println!("{DISCLAIMER}");
    info!(
        device = %base_url,
        %initial,
        benchmark_secs = args.benchmark_time,
        interval_secs = args.sample_interval,
        ?backoff,
        "Starting benchmark"
    );

    let cancellation = CancellationToken::new();
    tokio::spawn(cancel_on_interrupt(cancellation.clone()));

    let writer = ReportWriter::new(&args.output_dir, device);
    let outcome = controller
        .with_report(writer.clone())
        .run(cancellation)
        .await;

    match writer.save(&outcome.results).await {
        Ok(report) => {
            info!(path = %writer.path().display(), "Results saved");
            println!("\n{}", format_summary(&report));
        }
        Err(e) => error!(path = %writer.path().display(), "Failed to save results: {e}"),
    }
    print_outcome(&outcome);

    Ok(ExitCode::from(outcome.exit_code()))
}

async fn cancel_on_interrupt(cancellation: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Interrupted, restoring best settings before exit");
        cancellation.cancel();
    }
}

fn print_outcome(outcome: &BenchmarkOutcome) {
    println!("Stopped: {}", outcome.stop_reason);

    match (&outcome.final_configuration, &outcome.final_apply_error) {
        (Some(configuration), _) => println!("Device left at {configuration}"),
        (None, Some(e)) => println!("Could not restore settings: {e}"),
        (None, None) => {}
    }
}
