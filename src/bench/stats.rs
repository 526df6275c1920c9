//! Latency sample collection and run summaries.
//!
//! Percentiles use the nearest-rank rule over the sorted valid samples:
//! `P(p)` is the value at index `ceil(p / 100 * n) - 1`, clamped to the
//! sample range. No interpolation, so every reported percentile is a latency
//! that was actually observed, and results stay comparable between runs.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Statistics errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatsError {
    #[error("no data collected: every attempt timed out or none were made")]
    InsufficientData,
}

/// Round-trip latency of one attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Latency {
    Micros(f64),
    /// No reply before the deadline.
    Timeout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatencySample {
    pub value: Latency,
    /// Words in the request
    pub batch_size: u32,
    pub observed_at: DateTime<Utc>,
}

impl LatencySample {
    pub fn reply(rtt: Duration, batch_size: u32) -> Self {
        // A measured round trip is never reported as zero.
        let micros = (rtt.as_nanos() as f64 / 1_000.0).max(f64::MIN_POSITIVE);
        Self {
            value: Latency::Micros(micros),
            batch_size,
            observed_at: Utc::now(),
        }
    }

    pub fn timeout(batch_size: u32) -> Self {
        Self {
            value: Latency::Timeout,
            batch_size,
            observed_at: Utc::now(),
        }
    }

    pub fn micros(&self) -> Option<f64> {
        match self.value {
            Latency::Micros(us) => Some(us),
            Latency::Timeout => None,
        }
    }
}

/// Collects samples from any number of concurrent attempts.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    samples: Mutex<Vec<LatencySample>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sample: LatencySample) {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn timeouts(&self) -> usize {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.value == Latency::Timeout)
            .count()
    }

    /// Take every recorded sample and summarise them.
    ///
    /// Timeouts are kept in the sample sequence but excluded from the
    /// latency figures.
    pub fn finalize(&self) -> Result<RunResult, StatsError> {
        let samples = std::mem::take(
            &mut *self
                .samples
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        RunResult::from_samples(samples)
    }
}

/// Immutable summary of one benchmark run.
#[derive(Debug, Clone)]
pub struct RunResult {
    samples: Vec<LatencySample>,
    sorted: Vec<f64>,
    min: f64,
    mean: f64,
    max: f64,
    p90: f64,
    p99: f64,
}

impl RunResult {
    fn from_samples(samples: Vec<LatencySample>) -> Result<Self, StatsError> {
        let mut sorted: Vec<f64> = samples.iter().filter_map(LatencySample::micros).collect();
        if sorted.is_empty() {
            return Err(StatsError::InsufficientData);
        }
        sorted.sort_by(f64::total_cmp);

        let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
        Ok(Self {
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean,
            p90: nearest_rank(&sorted, 90.0),
            p99: nearest_rank(&sorted, 99.0),
            sorted,
            samples,
        })
    }

    pub fn samples(&self) -> &[LatencySample] {
        &self.samples
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn p90(&self) -> f64 {
        self.p90
    }

    pub fn p99(&self) -> f64 {
        self.p99
    }

    /// Samples with a measured latency.
    pub fn valid(&self) -> usize {
        self.sorted.len()
    }

    pub fn timeouts(&self) -> usize {
        self.samples.len() - self.sorted.len()
    }

    /// Wall-clock span from the first to the last recorded sample.
    pub fn window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let first = self.samples.iter().map(|s| s.observed_at).min()?;
        let last = self.samples.iter().map(|s| s.observed_at).max()?;
        Some((first, last))
    }

    /// `(latency_us, fraction of samples at or below it)`, one point per sample.
    pub fn cdf(&self) -> Vec<(f64, f64)> {
        let n = self.sorted.len() as f64;
        self.sorted
            .iter()
            .enumerate()
            .map(|(i, &us)| (us, (i + 1) as f64 / n))
            .collect()
    }

    /// Mean latency per request size, over valid samples.
    pub fn by_batch_size(&self) -> BTreeMap<u32, f64> {
        let mut acc: BTreeMap<u32, (f64, usize)> = BTreeMap::new();
        for sample in &self.samples {
            if let Some(us) = sample.micros() {
                let entry = acc.entry(sample.batch_size).or_default();
                entry.0 += us;
                entry.1 += 1;
            }
        }
        acc.into_iter()
            .map(|(batch, (sum, n))| (batch, sum / n as f64))
            .collect()
    }
}

fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    let rank = (p.clamp(0.0, 100.0) * n as f64 / 100.0).ceil() as usize;
    sorted[rank.saturating_sub(1).min(n - 1)]
}
