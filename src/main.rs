//! ethertok: tokenization over raw Ethernet frames
//!
//! One binary, three roles:
//! - `serve`: answer tokenization requests arriving on an interface
//! - `latency`: fixed-count request sweep, reporting min/avg/max/P90/P99
//! - `throughput`: fixed-duration request loop, reporting requests/s and tokens/s
//!
//! Frames carry a link header, an 8-byte port header and UTF-8 text; there is
//! no IP or UDP underneath. Configuration via CLI arguments or TOML file.

mod bench;
mod config;
mod link;
mod protocol;
mod server;
mod tokenizer;

use bench::generator::{run_sweep, SweepPlan};
use bench::payload::{max_payload_for_mtu, BatchMode, BatchPolicy};
use bench::report::{self, LATENCY_HEADER, THROUGHPUT_HEADER};
use bench::stats::StatsError;
use bench::throughput::{run_throughput, ThroughputPlan};
use config::{Config, LatencySettings, Mode, ThroughputSettings, TokenizerSettings};
use link::{Link, RawChannel, RawConnector};
use server::Dispatcher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokenizer::{ByteTokenizer, Tokenizer, VocabTokenizer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mtu = config.mtu();
    info!(
        interface = %config.link.interface,
        protocol_id = %format_args!("{:#06x}", config.link.protocol_id),
        mtu,
        client_port = config.client_port,
        service_port = config.service_port,
        "Starting ethertok"
    );

    match config.mode {
        Mode::Serve(ref tokenizer) => serve(&config, tokenizer, mtu),
        Mode::Latency(ref settings) => latency(&config, settings, mtu),
        Mode::Throughput(ref settings) => throughput(&config, settings, mtu),
    }
}

/// Run the dispatcher until Ctrl-C
fn serve(
    config: &Config,
    tokenizer: &TokenizerSettings,
    mtu: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let tokenizer: Arc<dyn Tokenizer> = match tokenizer {
        TokenizerSettings::Bytes => {
            info!("Using byte-level tokenizer");
            Arc::new(ByteTokenizer)
        }
        TokenizerSettings::Vocab { path, special } => {
            Arc::new(VocabTokenizer::load(path, *special)?)
        }
    };

    let mut channel = RawChannel::open(&config.link.interface, config.link.protocol_id)?;
    let mut dispatcher = Dispatcher::new(
        tokenizer,
        config.link.protocol_id,
        config.service_port,
        max_payload_for_mtu(mtu),
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let runtime = tokio::runtime::Runtime::new()?;
    let stats = runtime.block_on(async {
        let flag = Arc::clone(&shutdown);
        let mut worker =
            tokio::task::spawn_blocking(move || dispatcher.run(&mut channel, &flag));

        tokio::select! {
            result = &mut worker => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                shutdown.store(true, Ordering::Relaxed);
                worker.await
            }
        }
    })??;

    info!(
        replied = stats.replied,
        tokenizer_errors = stats.tokenizer_errors,
        truncated = stats.truncated,
        send_errors = stats.send_errors,
        "Server stopped"
    );
    Ok(())
}

/// Fixed-count latency sweep
fn latency(
    config: &Config,
    settings: &LatencySettings,
    mtu: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let addressing = config.addressing()?;
    let policy = BatchPolicy::new(settings.batch_mode, settings.max_batch);
    let plan = SweepPlan {
        requests: settings.requests,
        warmup: settings.warmup,
        policy,
        timeout: settings.timeout,
        concurrency: settings.concurrency,
        max_payload: max_payload_for_mtu(mtu),
    };
    let connector = Arc::new(RawConnector {
        interface: config.link.interface.clone(),
        protocol_id: config.link.protocol_id,
    });

    let runtime = tokio::runtime::Runtime::new()?;
    let stats = runtime.block_on(run_sweep(connector, addressing, plan))?;
    let timeouts = stats.timeouts();

    let result = match stats.finalize() {
        Ok(result) => result,
        Err(e @ StatsError::InsufficientData) => {
            warn!(requests = settings.requests, timeouts, "No replies received");
            return Err(e.into());
        }
    };

    let show_series = settings.batch_mode == BatchMode::Step;
    print!("{}", report::latency_summary(&settings.labels, &result, show_series));

    let row = report::latency_row(&settings.labels, policy.largest(), &result);
    report::append_row(&settings.summary_file, LATENCY_HEADER, &row)?;
    if let Some(ref path) = settings.cdf_file {
        report::write_cdf(path, &result)?;
    }
    Ok(())
}

/// Fixed-duration throughput loop on one channel
fn throughput(
    config: &Config,
    settings: &ThroughputSettings,
    mtu: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let addressing = config.addressing()?;
    let plan = ThroughputPlan {
        duration: settings.duration,
        batch: settings.batch,
        timeout: settings.timeout,
        max_payload: max_payload_for_mtu(mtu),
    };

    let mut channel = RawChannel::open(&config.link.interface, config.link.protocol_id)?;
    let result = run_throughput(&mut channel, &addressing, plan);
    channel.close();

    print!("{}", report::throughput_summary(&settings.labels, &plan, &result));
    let row = report::throughput_row(&settings.labels, &plan, &result);
    report::append_row(&settings.results_file, THROUGHPUT_HEADER, &row)?;
    Ok(())
}
