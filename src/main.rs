use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fxdeals_loadtest::client::{build_client, HttpIssuer};
use fxdeals_loadtest::config::{Config, LogFormat};
use fxdeals_loadtest::exit_codes::ExitCode;
use fxdeals_loadtest::metrics::MetricsAggregator;
use fxdeals_loadtest::multi_scenario::ScenarioOrchestrator;
use fxdeals_loadtest::report::{render_summary_table, write_reports};
use fxdeals_loadtest::suites::{Suite, SuiteBuilder};

/// Prints helpful configuration documentation.
fn print_config_help() {
    eprintln!("Usage: fxdeals-loadtest [SUITE]");
    eprintln!("  SUITE                   - smoke, healthcheck, load-batch, stress-get-all, mixed, seed");
    eprintln!("                            (default: $SUITE, then mixed)");
    eprintln!();
    eprintln!("Target:");
    eprintln!("  BASE_URL                - API base URL (default: http://localhost:8080)");
    eprintln!("  HEALTH_PATH             - Health endpoint path (default: /actuator/health/liveness)");
    eprintln!("  REQUEST_TIMEOUT         - Per-request timeout: 500ms, 30s (default: 30s)");
    eprintln!();
    eprintln!("Payloads:");
    eprintln!("  BATCH                   - Deals per batch import (default: 10, must be > 0)");
    eprintln!("  SEED_COUNT              - Deals imported by the seed suite (default: 50)");
    eprintln!("  MIN_AMOUNT / MAX_AMOUNT - Deal amount range (default: 10 - 100000)");
    eprintln!();
    eprintln!("load-batch suite:");
    eprintln!("  RATE, DURATION, VUS, MAX_VUS (default: 10/s, 2m, 10, 50)");
    eprintln!();
    eprintln!("mixed suite:");
    eprintln!("  SINGLES_START_RATE, SINGLES_STAGE1, SINGLES_STAGE2 (default: 2, 5, 10 per second)");
    eprintln!("  SINGLES_STAGE1_DURATION, SINGLES_STAGE2_DURATION, SINGLES_RAMP_DOWN_DURATION");
    eprintln!("  SINGLES_VUS, SINGLES_MAX_VUS (default: 10, 50)");
    eprintln!("  BATCH_RATE, BATCH_DURATION, BATCH_VUS, BATCH_MAX_VUS (default: 2/s, 1m, 10, 30)");
    eprintln!("  READS_STAGE1, READS_STAGE2 (default: 10, 20 VUs)");
    eprintln!("  READS_STAGE1_DURATION, READS_STAGE2_DURATION, READS_RAMP_DOWN_DURATION");
    eprintln!();
    eprintln!("Engine and output:");
    eprintln!("  TICK_INTERVAL           - Arrival scheduler tick (default: 50ms)");
    eprintln!("  GRACEFUL_STOP           - Grace for in-flight iterations (default: 30s)");
    eprintln!("  OUTPUT_DIR              - Report directory (default: results)");
    eprintln!("  LOG_FORMAT              - text or json (default: text)");
    eprintln!("  RUST_LOG                - Log filter (default: info)");
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    run().await.into()
}

async fn run() -> ExitCode {
    let arg = std::env::args().nth(1);
    if matches!(arg.as_deref(), Some("--help") | Some("-h")) {
        print_config_help();
        return ExitCode::Success;
    }

    // Load configuration from environment variables
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}\n", e);
            print_config_help();
            return ExitCode::InvalidConfig;
        }
    };
    init_tracing(config.log_format);

    let suite_name = arg.unwrap_or_else(|| config.suite.clone());
    let suite: Suite = match suite_name.parse() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Configuration error: {}\n", e);
            print_config_help();
            return ExitCode::InvalidConfig;
        }
    };

    let metrics = Arc::new(MetricsAggregator::new());
    let plan = match SuiteBuilder::new(&config, &metrics).build(suite) {
        Ok(plan) => plan,
        Err(e) => {
            error!(suite = %suite, error = %e, "Invalid test plan");
            return ExitCode::InvalidConfig;
        }
    };

    let client = match build_client(&config.to_client_config()) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to build HTTP client");
            return ExitCode::RuntimeError;
        }
    };
    config.print_summary(suite.as_str());

    let issuer = Arc::new(HttpIssuer::new(client, config.base_url.clone()));
    let orchestrator =
        ScenarioOrchestrator::new(metrics, issuer, config.to_orchestrator_config());

    let shutdown = orchestrator.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping scenarios");
            shutdown.trigger();
        }
    });

    let result = match orchestrator.run_all(&plan).await {
        Ok(result) => result,
        Err(e) if e.is_config_error() => {
            error!(error = %e, "Run refused");
            return ExitCode::InvalidConfig;
        }
        Err(e) => {
            error!(error = %e, "Run failed");
            return ExitCode::RuntimeError;
        }
    };

    println!("{}", render_summary_table(&result));

    if let Err(e) = write_reports(&config.output_dir, &result) {
        error!(error = %e, "Failed to write reports");
        return ExitCode::RuntimeError;
    }

    let code = ExitCode::from_thresholds(result.passed());
    info!(exit_code = code.as_u8(), "Exiting");
    code
}
