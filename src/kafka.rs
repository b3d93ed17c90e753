//! Kafka producer adapter
//!
//! Thin wrapper over rdkafka's `BaseProducer`. Payload and key bytes are
//! copied by librdkafka at enqueue time, so callers may free them
//! immediately; topic handles are cached inside the client library and torn
//! down with the producer.
//!
//! The configuration is the contract the pipeline relies on: idempotent
//! production with full-ISR acks, bounded connect/request/delivery timeouts,
//! modest retries, and linger/batch sizes tuned for throughput.

use crate::errors::{ReplicationError, ReplicationResult};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{BaseProducer, BaseRecord, Producer};
use std::time::Duration;
use tracing::{info, warn};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const DROP_FLUSH_TIMEOUT: Duration = Duration::from_secs(3);

/// Producer handle with process-long lifetime
pub struct KafkaProducer {
    producer: BaseProducer,
}

impl KafkaProducer {
    pub fn new(brokers: &[String]) -> ReplicationResult<Self> {
        let producer: BaseProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("retries", "5")
            .set("retry.backoff.ms", "250")
            .set("socket.connection.setup.timeout.ms", "10000")
            .set("request.timeout.ms", "10000")
            .set("message.timeout.ms", "30000")
            .set("linger.ms", "50")
            .set("batch.size", "262144")
            .create()?;
        Ok(Self { producer })
    }

    /// Synchronous metadata probe with a bounded timeout; fails when no
    /// broker is visible. Run once at startup so an unreachable cluster is a
    /// configuration error, not silent lag.
    pub fn test_connection(&self) -> ReplicationResult<()> {
        let metadata = self
            .producer
            .client()
            .fetch_metadata(None, METADATA_TIMEOUT)?;
        if metadata.brokers().is_empty() {
            return Err(ReplicationError::connection(
                "no Kafka brokers visible in metadata",
            ));
        }
        info!(
            brokers = metadata.brokers().len(),
            "kafka metadata probe succeeded"
        );
        Ok(())
    }

    /// Enqueue one record. A missing key lets the partitioner spread the
    /// record across partitions.
    pub fn send(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> ReplicationResult<()> {
        let mut record: BaseRecord<'_, str, [u8]> = BaseRecord::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }
        self.producer.send(record).map_err(|(err, _)| err.into())
    }

    /// Drive delivery callbacks without waiting
    pub fn poll(&self) {
        self.producer.poll(Duration::ZERO);
    }

    /// Wait until every enqueued record is acknowledged or the timeout
    /// elapses
    pub fn flush(&self, timeout: Duration) -> ReplicationResult<()> {
        self.producer.flush(timeout)?;
        Ok(())
    }

    /// Number of records not yet acknowledged by the cluster
    pub fn in_flight(&self) -> i32 {
        self.producer.in_flight_count()
    }
}

impl Drop for KafkaProducer {
    fn drop(&mut self) {
        // Last chance for queued records; feedback already stopped, so
        // anything missed here is replayed after restart.
        if let Err(err) = self.producer.flush(DROP_FLUSH_TIMEOUT) {
            warn!("final producer flush failed: {err}");
        }
    }
}
