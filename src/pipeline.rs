//! Pipeline processor
//!
//! Pulls batches from the streaming source, matches each event against the
//! configured stream routes, serialises matched events once, and submits
//! them to Kafka. A single flush/commit worker thread owns the at-least-once
//! contract: standby status feedback for an LSN is only ever sent after a
//! successful producer flush that postdates every send at or below it.
//!
//! The receive thread publishes the batch watermark into `pending_lsn` with
//! release ordering; the worker acquires it after each successful flush. A
//! crash between flush and feedback replays at most one interval of events
//! (duplicates, never loss); a crash anywhere else loses nothing either.

use crate::config::{BatchTuning, StreamRoute};
use crate::driver::FeedbackSender;
use crate::errors::{ReplicationError, ReplicationResult};
use crate::event::ChangeEvent;
use crate::kafka::KafkaProducer;
use crate::lsn::Lsn;
use crate::source::StreamingSource;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Worker cadence: wake every second, observe `stop`, flush every
/// `flush_interval_secs` wakes.
const WORKER_TICK: Duration = Duration::from_secs(1);
const STOP_POLL: Duration = Duration::from_millis(100);

/// The pipeline processor
pub struct Processor {
    source: StreamingSource,
    streams: Vec<StreamRoute>,
    brokers: Vec<String>,
    tuning: BatchTuning,
    producer: Option<KafkaProducer>,
}

impl Processor {
    pub fn new(
        source: StreamingSource,
        streams: Vec<StreamRoute>,
        brokers: Vec<String>,
        tuning: BatchTuning,
    ) -> Self {
        Self {
            source,
            streams,
            brokers,
            tuning,
            producer: None,
        }
    }

    /// Build the Kafka producer and probe the cluster; fail fast if it is
    /// unreachable.
    pub fn initialize(&mut self) -> ReplicationResult<()> {
        let producer = KafkaProducer::new(&self.brokers)?;
        producer.test_connection()?;
        self.producer = Some(producer);
        Ok(())
    }

    /// Main loop. Returns once `stop` is observed true (or a fatal error
    /// occurred) and the flush worker has performed its final flush +
    /// feedback and joined.
    pub fn run(&mut self, stop: &AtomicBool) -> ReplicationResult<()> {
        let producer = self
            .producer
            .take()
            .ok_or_else(|| ReplicationError::config("processor used before initialize"))?;
        let feedback = self.source.feedback_sender()?;
        let pending_lsn = AtomicU64::new(0);
        let tuning = self.tuning;

        thread::scope(|scope| {
            let worker =
                scope.spawn(|| flush_worker(&producer, &feedback, &pending_lsn, stop, tuning));

            let loop_result = self.receive_loop(&producer, &pending_lsn, stop);

            // The worker exits on the same flag; a receive-loop failure must
            // still release it so the final flush + feedback happen before
            // the process dies.
            stop.store(true, Ordering::SeqCst);
            if worker.join().is_err() {
                error!("flush worker panicked");
            }
            loop_result
        })
    }

    fn receive_loop(
        &mut self,
        producer: &KafkaProducer,
        pending_lsn: &AtomicU64,
        stop: &AtomicBool,
    ) -> ReplicationResult<()> {
        info!(streams = self.streams.len(), "pipeline started");
        while !stop.load(Ordering::SeqCst) {
            let batch = self
                .source
                .receive_batch(self.tuning.batch_size, self.tuning.batch_wait_ms)?;

            if !batch.changes.is_empty() {
                debug!(
                    changes = batch.changes.len(),
                    last_lsn = %batch.last_lsn,
                    "received batch"
                );
            }

            for change in &batch.changes {
                dispatch(producer, &self.streams, change)?;
            }
            producer.poll();

            if batch.last_lsn.is_valid() {
                pending_lsn.store(batch.last_lsn.into(), Ordering::Release);
            }
            // `batch` drops here, along with every event it owns.
        }
        info!("pipeline stopped");
        Ok(())
    }
}

/// Serialise the event once and submit it to every matching route.
///
/// Unmatched events are dropped — their LSN was already accounted for by the
/// batch watermark. Individual enqueue failures are logged and skipped;
/// durability is settled by the flush worker withholding feedback.
fn dispatch(
    producer: &KafkaProducer,
    streams: &[StreamRoute],
    change: &ChangeEvent,
) -> ReplicationResult<()> {
    let matched: Vec<&StreamRoute> = streams
        .iter()
        .filter(|route| route.matches(change))
        .collect();
    if matched.is_empty() {
        return Ok(());
    }

    let payload = change.to_json()?;
    for route in matched {
        let key = partition_key(route, change);
        if let Err(err) = producer.send(&route.destination_topic, Some(&key), &payload) {
            warn!(
                topic = %route.destination_topic,
                op = change.op.as_str(),
                "failed to enqueue event: {err}"
            );
        }
    }
    Ok(())
}

/// Partition key: the configured routing field's scalar when present and
/// non-null, otherwise the table name. Same key, same partition — that is
/// what preserves per-row ordering downstream.
fn partition_key(route: &StreamRoute, change: &ChangeEvent) -> String {
    route
        .routing_key_field
        .as_deref()
        .and_then(|field| change.key_row().get(field))
        .and_then(|value| value.as_key())
        .unwrap_or_else(|| change.meta.resource.clone())
}

/// The flush/commit worker: a single dedicated thread, not a pool.
fn flush_worker(
    producer: &KafkaProducer,
    feedback: &FeedbackSender,
    pending_lsn: &AtomicU64,
    stop: &AtomicBool,
    tuning: BatchTuning,
) {
    let mut ticks: u64 = 0;
    let mut confirmed = Lsn::INVALID;
    let interval = tuning.flush_interval_secs.max(1);

    while !stop.load(Ordering::SeqCst) {
        sleep_tick(stop);
        ticks += 1;
        if ticks % interval != 0 {
            continue;
        }
        confirmed = flush_and_confirm(producer, feedback, pending_lsn, confirmed, tuning);
    }

    // Shutdown barrier: one final flush, one final feedback, then exit. The
    // join in `Processor::run` makes this precede process exit.
    flush_and_confirm(producer, feedback, pending_lsn, confirmed, tuning);
    info!("flush worker stopped");
}

/// Flush the producer; only on success read the pending watermark and
/// confirm it to the server. Returns the highest LSN confirmed so far.
fn flush_and_confirm(
    producer: &KafkaProducer,
    feedback: &FeedbackSender,
    pending_lsn: &AtomicU64,
    confirmed: Lsn,
    tuning: BatchTuning,
) -> Lsn {
    if let Err(err) = producer.flush(Duration::from_millis(tuning.flush_timeout_ms)) {
        // No feedback this cycle: the server keeps the slot position and the
        // queued events remain replayable.
        warn!(
            in_flight = producer.in_flight(),
            "kafka flush failed, withholding feedback: {err}"
        );
        return confirmed;
    }

    let lsn = Lsn(pending_lsn.load(Ordering::Acquire));
    if !lsn.is_valid() {
        return confirmed;
    }

    match feedback.send(lsn) {
        Ok(()) => {
            if lsn != confirmed {
                info!(%lsn, "confirmed replication progress");
            }
            lsn
        }
        Err(err) => {
            warn!(%lsn, "failed to send standby status update: {err}");
            confirmed
        }
    }
}

/// Sleep one worker tick, waking early when `stop` flips
fn sleep_tick(stop: &AtomicBool) {
    let mut slept = Duration::ZERO;
    while slept < WORKER_TICK {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        thread::sleep(STOP_POLL);
        slept += STOP_POLL;
    }
}
