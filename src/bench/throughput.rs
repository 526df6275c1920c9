//! Duration mode: sustained request rate on one channel.
//!
//! Strictly sequential: send, wait for the reply (short deadline), repeat,
//! until the wall-clock budget is spent. The channel is reused across
//! iterations, so a reply that misses its deadline may be counted against the
//! next request. That is accepted here for the sake of rate.

use super::payload::{random_batch, THROUGHPUT_WORD_LEN};
use super::Addressing;
use crate::bench::generator::{attempt, AttemptOutcome};
use crate::link::{remaining_until, Link};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Parameters of a duration-mode run.
#[derive(Debug, Clone, Copy)]
pub struct ThroughputPlan {
    pub duration: Duration,
    /// Words per request
    pub batch: u32,
    /// Per-request reply deadline
    pub timeout: Duration,
    pub max_payload: usize,
}

/// Totals of a duration-mode run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputReport {
    pub requests_sent: u64,
    pub requests_succeeded: u64,
    pub tokens_sent: u64,
    pub elapsed: Duration,
}

impl ThroughputReport {
    /// Successful requests per second.
    pub fn requests_per_sec(&self) -> f64 {
        self.requests_succeeded as f64 / self.elapsed_secs()
    }

    /// Words sent per second.
    pub fn tokens_per_sec(&self) -> f64 {
        self.tokens_sent as f64 / self.elapsed_secs()
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed.as_secs_f64().max(f64::MIN_POSITIVE)
    }
}

/// Run the tight loop on `link` until `plan.duration` has elapsed.
pub fn run_throughput<L: Link + ?Sized>(
    link: &mut L,
    addressing: &Addressing,
    plan: ThroughputPlan,
) -> ThroughputReport {
    info!(
        duration_s = plan.duration.as_secs_f64(),
        batch = plan.batch,
        timeout_ms = plan.timeout.as_millis() as u64,
        "Starting throughput run"
    );

    let mut rng = rand::thread_rng();
    let mut report = ThroughputReport {
        requests_sent: 0,
        requests_succeeded: 0,
        tokens_sent: 0,
        elapsed: Duration::ZERO,
    };

    let start = Instant::now();
    let end = start + plan.duration;

    // Stop once too little of the window is left to wait on a reply.
    while let Some(left) = remaining_until(end) {
        // Never wait past the end of the window.
        let timeout = plan.timeout.min(left);

        let batch = random_batch(&mut rng, plan.batch, THROUGHPUT_WORD_LEN, plan.max_payload);
        match attempt(link, addressing, addressing.client_port, &batch.text, timeout) {
            Ok(outcome) => {
                report.requests_sent += 1;
                report.tokens_sent += u64::from(batch.words);
                if let AttemptOutcome::Reply { .. } = outcome {
                    report.requests_succeeded += 1;
                }
            }
            Err(e) => {
                warn!(error = %e, "Request failed");
                // Avoid spinning on a link that rejects every send.
                std::thread::sleep(Duration::from_millis(1).min(end.saturating_duration_since(Instant::now())));
            }
        }
    }

    report.elapsed = start.elapsed();
    debug!(?report, "Throughput run complete");
    report
}
