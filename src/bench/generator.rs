//! Sweep/count mode.
//!
//! Each attempt opens its own channel, sends one request, waits for the
//! matching reply or the deadline, records a sample and closes the channel.
//! Closing per attempt means a reply that arrives after its deadline is lost
//! instead of being credited to the next attempt.
//!
//! Parallel attempts each lease a distinct client port so their replies can
//! be told apart; at most `concurrency` attempts are in flight.

use super::payload::{random_batch, BatchPolicy, LATENCY_WORD_LEN};
use super::stats::{LatencySample, StatsAggregator};
use super::{Addressing, BenchError};
use crate::link::{recv_matching, Connector, Link, LinkError};
use crate::protocol;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Parameters of a sweep/count run.
#[derive(Debug, Clone, Copy)]
pub struct SweepPlan {
    /// Recorded attempts
    pub requests: usize,
    /// Attempts made first and not recorded
    pub warmup: usize,
    pub policy: BatchPolicy,
    pub timeout: Duration,
    pub concurrency: usize,
    pub max_payload: usize,
}

/// Result of one request/response cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Reply { rtt: Duration, payload: String },
    Timeout,
}

/// Send `text` from `client_port` and wait for the service's reply.
///
/// The clock starts just before the send and stops when the matching reply
/// is received. Unrelated frames seen while waiting are dropped.
pub fn attempt<L: Link + ?Sized>(
    link: &mut L,
    addressing: &Addressing,
    client_port: u16,
    text: &str,
    timeout: Duration,
) -> Result<AttemptOutcome, LinkError> {
    let request = protocol::encode(
        addressing.local_mac,
        addressing.remote_mac,
        addressing.protocol_id,
        client_port,
        addressing.service_port,
        text,
    );

    let start = Instant::now();
    link.send(&request)?;
    match recv_matching(link, timeout, |raw| addressing.is_reply(raw, client_port)) {
        Ok(raw) => {
            let rtt = start.elapsed();
            let payload = protocol::decode(&raw)
                .map(|frame| frame.payload)
                .unwrap_or_default();
            Ok(AttemptOutcome::Reply { rtt, payload })
        }
        Err(LinkError::Timeout(_)) => Ok(AttemptOutcome::Timeout),
        Err(e) => Err(e),
    }
}

/// One attempt on a fresh channel, folded into a sample.
///
/// Channel and send failures count as timeouts: no reply came back.
fn measure<C: Connector + ?Sized>(
    connector: &C,
    addressing: &Addressing,
    client_port: u16,
    policy: BatchPolicy,
    index: usize,
    timeout: Duration,
    max_payload: usize,
) -> LatencySample {
    let mut rng = rand::thread_rng();
    let words = policy.batch_size(index, &mut rng);
    let batch = random_batch(&mut rng, words, LATENCY_WORD_LEN, max_payload);

    let mut link = match connector.open() {
        Ok(link) => link,
        Err(e) => {
            warn!(attempt = index, error = %e, "Failed to open channel");
            return LatencySample::timeout(batch.words);
        }
    };

    let outcome = attempt(&mut link, addressing, client_port, &batch.text, timeout);
    link.close();

    match outcome {
        Ok(AttemptOutcome::Reply { rtt, payload }) => {
            debug!(
                attempt = index,
                words = batch.words,
                rtt_us = rtt.as_micros() as u64,
                tokens = %payload,
                "Reply received"
            );
            LatencySample::reply(rtt, batch.words)
        }
        Ok(AttemptOutcome::Timeout) => {
            debug!(attempt = index, words = batch.words, "No reply within timeout");
            LatencySample::timeout(batch.words)
        }
        Err(e) => {
            warn!(attempt = index, error = %e, "Attempt failed");
            LatencySample::timeout(batch.words)
        }
    }
}

/// Client ports handed out to in-flight attempts.
struct PortPool {
    free: Mutex<Vec<u16>>,
    permits: Arc<Semaphore>,
}

/// A client port held for the duration of one attempt.
struct PortLease {
    port: u16,
    pool: Arc<PortPool>,
    _permit: OwnedSemaphorePermit,
}

impl PortPool {
    fn new(first: u16, count: usize) -> Arc<Self> {
        let free: Vec<u16> = (0..count).map(|i| first.wrapping_add(i as u16)).collect();
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(free.len())),
            free: Mutex::new(free),
        })
    }

    async fn lease(self: &Arc<Self>) -> Result<PortLease, BenchError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| BenchError::Task(e.to_string()))?;
        let port = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or_else(|| BenchError::Task("client port pool exhausted".to_string()))?;
        Ok(PortLease {
            port,
            pool: Arc::clone(self),
            _permit: permit,
        })
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        // The permit is released after this runs, so the port is back first.
        self.pool
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.port);
    }
}

/// Run a sweep/count benchmark and return the collected samples.
///
/// Fails only if the very first channel cannot be opened; everything after
/// that degrades into timeout samples.
pub async fn run_sweep<C>(
    connector: Arc<C>,
    addressing: Addressing,
    plan: SweepPlan,
) -> Result<StatsAggregator, BenchError>
where
    C: Connector + 'static,
{
    let mut probe = connector.open()?;
    probe.close();

    let concurrency = plan.concurrency.max(1);
    info!(
        requests = plan.requests,
        warmup = plan.warmup,
        concurrency,
        policy = ?plan.policy,
        timeout_ms = plan.timeout.as_millis() as u64,
        "Starting latency run"
    );

    for index in 0..plan.warmup {
        let connector = Arc::clone(&connector);
        let sample = tokio::task::spawn_blocking(move || {
            measure(
                &*connector,
                &addressing,
                addressing.client_port,
                plan.policy,
                index,
                plan.timeout,
                plan.max_payload,
            )
        })
        .await
        .map_err(|e| BenchError::Task(e.to_string()))?;
        debug!(attempt = index, value = ?sample.value, "Warm-up attempt discarded");
    }

    let stats = Arc::new(StatsAggregator::new());
    let ports = PortPool::new(addressing.client_port, concurrency);
    let mut tasks = JoinSet::new();

    for index in 0..plan.requests {
        let lease = ports.lease().await?;
        let connector = Arc::clone(&connector);
        let stats = Arc::clone(&stats);

        tasks.spawn_blocking(move || {
            let sample = measure(
                &*connector,
                &addressing,
                lease.port,
                plan.policy,
                index,
                plan.timeout,
                plan.max_payload,
            );
            drop(lease);
            stats.record(sample);
        });

        // Reap finished attempts so the set does not grow with the run.
        while let Some(done) = tasks.try_join_next() {
            done.map_err(|e| BenchError::Task(e.to_string()))?;
        }
    }

    while let Some(done) = tasks.join_next().await {
        done.map_err(|e| BenchError::Task(e.to_string()))?;
    }

    let stats = Arc::try_unwrap(stats)
        .map_err(|_| BenchError::Task("samples still shared after run".to_string()))?;
    info!(samples = stats.len(), "Latency run complete");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::wire::{Wire, WireConnector, WireEndpoint};
    use crate::protocol::{MacAddr, DEFAULT_PROTOCOL_ID};
    use crate::server::Dispatcher;
    use crate::tokenizer::{TokenizeError, Tokenizer};
    use std::sync::atomic::AtomicBool;

    struct IndexTokenizer;

    impl Tokenizer for IndexTokenizer {
        fn tokenize(&self, text: &str) -> Result<Vec<u32>, TokenizeError> {
            Ok((0..text.split_whitespace().count() as u32).collect())
        }
    }

    fn addressing() -> Addressing {
        Addressing {
            local_mac: MacAddr([0x02, 0, 0, 0, 0, 0x01]),
            remote_mac: MacAddr([0x02, 0, 0, 0, 0, 0x02]),
            protocol_id: DEFAULT_PROTOCOL_ID,
            client_port: 12345,
            service_port: 67,
        }
    }

    fn spawn_dispatcher(wire: &Arc<Wire>) -> (Arc<AtomicBool>, std::thread::JoinHandle<()>) {
        let mut end = wire.attach();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = std::thread::spawn(move || {
            let mut d = Dispatcher::new(Arc::new(IndexTokenizer), DEFAULT_PROTOCOL_ID, 67, 1478);
            let _ = d.run(&mut end, &flag);
        });
        (shutdown, handle)
    }

    fn plan(requests: usize, concurrency: usize, timeout: Duration) -> SweepPlan {
        SweepPlan {
            requests,
            warmup: 0,
            policy: BatchPolicy::Random { max: 20 },
            timeout,
            concurrency,
            max_payload: 1478,
        }
    }

    #[test]
    fn test_attempt_round_trip() {
        let wire = Wire::new();
        let (shutdown, handle) = spawn_dispatcher(&wire);
        let mut client: WireEndpoint = wire.attach();

        let outcome = attempt(&mut client, &addressing(), 12345, "ab cd ef", Duration::from_secs(2)).unwrap();
        match outcome {
            AttemptOutcome::Reply { rtt, payload } => {
                assert_eq!(payload, "0 1 2");
                let sample = LatencySample::reply(rtt, 3);
                assert!(sample.micros().unwrap() > 0.0);
            }
            AttemptOutcome::Timeout => panic!("expected a reply"),
        }

        shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn test_attempt_ignores_reply_for_other_port() {
        let wire = Wire::new();
        let (shutdown, handle) = spawn_dispatcher(&wire);
        let mut other = wire.attach();
        let mut client = wire.attach();

        // A reply addressed to port 40000 reaches this client too; it must not match.
        let outcome = attempt(&mut other, &addressing(), 40000, "ab", Duration::from_secs(2)).unwrap();
        assert!(matches!(outcome, AttemptOutcome::Reply { .. }));
        let stray = recv_matching(&mut client, Duration::from_millis(100), |raw| {
            addressing().is_reply(raw, 12345)
        });
        assert!(matches!(stray, Err(LinkError::Timeout(_))));

        shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn test_attempt_times_out_without_server() {
        let wire = Wire::new();
        let mut client = wire.attach();
        let _silent = wire.attach();
        let outcome = attempt(&mut client, &addressing(), 12345, "ab", Duration::from_millis(50)).unwrap();
        assert_eq!(outcome, AttemptOutcome::Timeout);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sweep_records_every_attempt() {
        let wire = Wire::new();
        let (shutdown, handle) = spawn_dispatcher(&wire);

        let connector = Arc::new(WireConnector(Arc::clone(&wire)));
        let stats = run_sweep(connector, addressing(), plan(40, 4, Duration::from_secs(2)))
            .await
            .unwrap();
        let result = stats.finalize().unwrap();
        assert_eq!(result.samples().len(), 40);
        assert_eq!(result.timeouts(), 0);
        assert!(result.min() > 0.0);
        assert!(result.samples().iter().all(|s| (1..=20).contains(&s.batch_size)));

        shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
        handle.join().unwrap();
        // Attempts closed their channels; the dispatcher's went with its thread.
        assert_eq!(wire.attached(), 0);
    }

    #[tokio::test]
    async fn test_sweep_silent_server_records_timeouts() {
        let wire = Wire::new();
        let _silent = wire.attach();
        let connector = Arc::new(WireConnector(Arc::clone(&wire)));

        let mut plan = plan(3, 1, Duration::from_millis(30));
        plan.warmup = 1;
        let stats = run_sweep(connector, addressing(), plan).await.unwrap();
        // The warm-up attempt is not recorded.
        assert_eq!(stats.len(), 3);
        assert_eq!(stats.timeouts(), 3);
        assert!(stats.finalize().is_err());
    }

    #[tokio::test]
    async fn test_sweep_single_timeout_then_continues() {
        let wire = Wire::new();
        let connector = Arc::new(WireConnector(Arc::clone(&wire)));

        let stats = run_sweep(connector, addressing(), plan(1, 1, Duration::from_millis(30)))
            .await
            .unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats.timeouts(), 1);
    }
}
