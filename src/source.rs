//! Streaming source
//!
//! Orchestrates the protocol driver, the pgoutput decoder, and the relation
//! registry into batch-pull semantics: `receive_batch` blocks on the socket
//! once, then drains everything the wake-up buffered, converting row changes
//! into [`ChangeEvent`]s as it goes. `Begin`/`Commit` and keepalives never
//! surface as events; they only advance the batch's `last_lsn` watermark.

use crate::driver::{FeedbackSender, ReplicationDriver, ReplicationMessage};
use crate::errors::{ReplicationError, ReplicationResult};
use crate::event::{ChangeEvent, DataSection, FieldValue, Metadata, Op, Row};
use crate::lsn::Lsn;
use crate::pgoutput::{self, PgOutputMessage, RelationInfo, TupleData, TupleValue};
use crate::registry::RelationRegistry;
use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::debug;

// Type OIDs promoted to native JSON scalars; everything else keeps its
// pgoutput text form.
const BOOL_OID: u32 = 16;
const INT8_OID: u32 = 20;
const INT2_OID: u32 = 21;
const INT4_OID: u32 = 23;

/// One pull's worth of change events
///
/// `last_lsn` is the highest `server_wal_end` observed while producing the
/// batch, including from frames that yielded no event.
#[derive(Debug)]
pub struct Batch {
    pub changes: Vec<ChangeEvent>,
    pub last_lsn: Lsn,
}

/// The replication-streaming source
///
/// Owns the driver, the registry, and the decoder scratch for its lifetime;
/// only the receive thread calls `receive_batch`. Dropping the source closes
/// the replication connection.
pub struct StreamingSource {
    slot_name: String,
    publication_name: String,
    driver: Option<ReplicationDriver>,
    registry: RelationRegistry,
    last_lsn: Lsn,
}

impl StreamingSource {
    pub fn new(slot_name: impl Into<String>, publication_name: impl Into<String>) -> Self {
        Self {
            slot_name: slot_name.into(),
            publication_name: publication_name.into(),
            driver: None,
            registry: RelationRegistry::new(),
            last_lsn: Lsn::INVALID,
        }
    }

    /// Connect, run the preflights, ensure publication and slot, and start
    /// replication. After success the stream is live and `last_lsn` is zero.
    pub fn connect(
        &mut self,
        conn_str: &str,
        tables: &[String],
        start_lsn: Lsn,
    ) -> ReplicationResult<()> {
        let driver = ReplicationDriver::connect(conn_str)?;
        driver.check_wal_level()?;
        driver.identify_system()?;
        driver.ensure_publication(&self.publication_name, tables)?;
        driver.ensure_slot(&self.slot_name)?;
        driver.start_replication(&self.slot_name, &self.publication_name, start_lsn)?;
        self.driver = Some(driver);
        self.registry = RelationRegistry::new();
        self.last_lsn = Lsn::INVALID;
        Ok(())
    }

    fn driver(&self) -> ReplicationResult<&ReplicationDriver> {
        self.driver
            .as_ref()
            .ok_or_else(|| ReplicationError::protocol("source is not connected"))
    }

    /// Highest `server_wal_end` confirmed into a returned batch so far
    #[allow(unused)]
    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }

    /// Pull up to `limit` change events, waiting at most `wait_ms` overall.
    ///
    /// One blocking wait per wake-up, then a non-blocking drain of whatever
    /// the socket buffered; that drain is what turns a single readiness
    /// event into a burst of work.
    pub fn receive_batch(&mut self, limit: usize, wait_ms: u64) -> ReplicationResult<Batch> {
        let mut changes = Vec::new();
        let mut last_confirmed = self.last_lsn;
        let deadline = Instant::now() + Duration::from_millis(wait_ms);

        'outer: while changes.len() < limit {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = deadline.duration_since(now).as_millis() as u64;

            match self.driver()?.receive_message(remaining)? {
                None => {
                    if !changes.is_empty() {
                        break;
                    }
                }
                Some(message) => {
                    self.process(message, &mut changes, &mut last_confirmed)?;
                    // Drain the buffer before blocking again.
                    while changes.len() < limit {
                        match self.driver()?.receive_message(0)? {
                            Some(message) => {
                                self.process(message, &mut changes, &mut last_confirmed)?
                            }
                            None => continue 'outer,
                        }
                    }
                }
            }
        }

        self.last_lsn = last_confirmed;
        Ok(Batch {
            changes,
            last_lsn: last_confirmed,
        })
    }

    fn process(
        &mut self,
        message: ReplicationMessage,
        changes: &mut Vec<ChangeEvent>,
        last_confirmed: &mut Lsn,
    ) -> ReplicationResult<()> {
        match message {
            ReplicationMessage::XLogData {
                server_wal_end,
                payload,
                ..
            } => {
                let decoded = pgoutput::decode(&payload)?;
                if let Some(event) = event_from_message(&mut self.registry, decoded)? {
                    changes.push(event);
                }
                if server_wal_end > *last_confirmed {
                    *last_confirmed = server_wal_end;
                }
            }
            ReplicationMessage::PrimaryKeepalive {
                server_wal_end,
                reply_requested,
                ..
            } => {
                // Never reply here; feedback is the flush worker's job so an
                // LSN is only ever confirmed after the sink flushed it.
                if reply_requested {
                    debug!(%server_wal_end, "keepalive requested a reply; deferred to flush worker");
                }
                if server_wal_end > *last_confirmed {
                    *last_confirmed = server_wal_end;
                }
            }
        }
        Ok(())
    }

    /// Forward to the driver as write = flush = apply = `lsn`
    ///
    /// The pipeline's flush worker reaches this path through a
    /// [`FeedbackSender`] clone instead, so the receive thread can keep
    /// exclusive ownership of the source.
    #[allow(unused)]
    pub fn send_feedback(&self, lsn: Lsn) -> ReplicationResult<()> {
        self.driver()?.send_status_update(lsn, false)
    }

    /// Feedback handle for the flush/commit worker
    pub fn feedback_sender(&self) -> ReplicationResult<FeedbackSender> {
        Ok(self.driver()?.feedback_sender())
    }
}

impl Drop for StreamingSource {
    fn drop(&mut self) {
        // Cancel replication before the connection itself goes away; the
        // driver's close is idempotent, so its own Drop becomes a no-op.
        if let Some(driver) = &self.driver {
            if let Err(err) = driver.close() {
                debug!("error closing replication connection: {err}");
            }
        }
    }
}

/// Convert one decoded message into at most one change event
///
/// `Relation` updates the registry; `Begin`/`Commit` are position-only. A
/// row change naming an unregistered relation is fatal — the server always
/// announces a relation before its first use.
fn event_from_message(
    registry: &mut RelationRegistry,
    message: PgOutputMessage,
) -> ReplicationResult<Option<ChangeEvent>> {
    match message {
        PgOutputMessage::Begin { .. } | PgOutputMessage::Commit { .. } => Ok(None),
        PgOutputMessage::Relation(info) => {
            debug!(
                relation_id = info.relation_id,
                relation = %format!("{}.{}", info.namespace, info.relation_name),
                columns = info.columns.len(),
                "registered relation schema"
            );
            registry.register(info);
            Ok(None)
        }
        PgOutputMessage::Insert { relation_id, new } => {
            let relation = lookup(registry, relation_id)?;
            let row = build_row(relation, &new)?;
            Ok(Some(ChangeEvent {
                op: Op::Insert,
                data: DataSection::Insert(row),
                meta: metadata(relation),
            }))
        }
        PgOutputMessage::Update {
            relation_id,
            old,
            new,
        } => {
            let relation = lookup(registry, relation_id)?;
            let new_row = build_row(relation, &new)?;
            // REPLICA IDENTITY DEFAULT ships no old image; consumers get an
            // empty object rather than a fabricated one.
            let old_row = match old {
                Some(tuple) => build_row(relation, &tuple)?,
                None => Row::default(),
            };
            Ok(Some(ChangeEvent {
                op: Op::Update,
                data: DataSection::Update {
                    new: new_row,
                    old: old_row,
                },
                meta: metadata(relation),
            }))
        }
        PgOutputMessage::Delete { relation_id, old } => {
            let relation = lookup(registry, relation_id)?;
            let row = build_row(relation, &old)?;
            Ok(Some(ChangeEvent {
                op: Op::Delete,
                data: DataSection::Delete(row),
                meta: metadata(relation),
            }))
        }
    }
}

fn lookup(registry: &RelationRegistry, relation_id: u32) -> ReplicationResult<&RelationInfo> {
    registry
        .get(relation_id)
        .ok_or(ReplicationError::RelationNotFound(relation_id))
}

fn metadata(relation: &RelationInfo) -> Metadata {
    Metadata {
        source: "postgres".to_string(),
        resource: relation.relation_name.clone(),
        schema: relation.namespace.clone(),
        timestamp: Utc::now().timestamp(),
        lsn: None,
    }
}

/// Zip registry columns with tuple slots into an owned row
fn build_row(relation: &RelationInfo, tuple: &TupleData) -> ReplicationResult<Row> {
    if tuple.values.len() != relation.columns.len() {
        return Err(ReplicationError::tuple(format!(
            "tuple carries {} values but relation '{}' has {} columns",
            tuple.values.len(),
            relation.relation_name,
            relation.columns.len()
        )));
    }

    let fields = relation
        .columns
        .iter()
        .zip(&tuple.values)
        .map(|(column, value)| {
            (
                column.name.clone(),
                field_value(column.data_type_oid, value),
            )
        })
        .collect();
    Ok(Row(fields))
}

fn field_value(type_oid: u32, value: &TupleValue) -> FieldValue {
    let bytes = match value {
        TupleValue::Null | TupleValue::UnchangedToast => return FieldValue::Null,
        TupleValue::Text(bytes) | TupleValue::Binary(bytes) => bytes,
    };
    let text = String::from_utf8_lossy(bytes);
    match type_oid {
        BOOL_OID => match text.as_ref() {
            "t" | "true" => FieldValue::Bool(true),
            "f" | "false" => FieldValue::Bool(false),
            _ => FieldValue::Text(text.into_owned()),
        },
        INT2_OID | INT4_OID | INT8_OID => match text.parse::<i64>() {
            Ok(number) => FieldValue::Int(number),
            Err(_) => FieldValue::Text(text.into_owned()),
        },
        _ => FieldValue::Text(text.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgoutput::ColumnSpec;

    fn users_relation() -> RelationInfo {
        RelationInfo {
            relation_id: 16385,
            namespace: "public".to_string(),
            relation_name: "users".to_string(),
            replica_identity: b'f',
            columns: vec![
                ColumnSpec {
                    flags: 1,
                    name: "id".to_string(),
                    data_type_oid: INT4_OID,
                    type_modifier: -1,
                },
                ColumnSpec {
                    flags: 0,
                    name: "name".to_string(),
                    data_type_oid: 25,
                    type_modifier: -1,
                },
                ColumnSpec {
                    flags: 0,
                    name: "active".to_string(),
                    data_type_oid: BOOL_OID,
                    type_modifier: -1,
                },
            ],
        }
    }

    fn seeded_registry() -> RelationRegistry {
        let mut registry = RelationRegistry::new();
        registry.register(users_relation());
        registry
    }

    fn text(value: &str) -> TupleValue {
        TupleValue::Text(value.as_bytes().to_vec())
    }

    #[test]
    fn begin_and_commit_yield_no_event() {
        let mut registry = seeded_registry();
        let begin = PgOutputMessage::Begin {
            final_lsn: Lsn(1),
            commit_time: 0,
            xid: 1,
        };
        let commit = PgOutputMessage::Commit {
            flags: 0,
            commit_lsn: Lsn(1),
            end_lsn: Lsn(2),
            commit_time: 0,
        };
        assert!(event_from_message(&mut registry, begin).unwrap().is_none());
        assert!(event_from_message(&mut registry, commit).unwrap().is_none());
    }

    #[test]
    fn relation_message_updates_the_registry() {
        let mut registry = RelationRegistry::new();
        let message = PgOutputMessage::Relation(users_relation());
        assert!(event_from_message(&mut registry, message).unwrap().is_none());
        assert!(registry.contains(16385));
    }

    #[test]
    fn insert_converts_with_typed_values() {
        let mut registry = seeded_registry();
        let message = PgOutputMessage::Insert {
            relation_id: 16385,
            new: TupleData {
                values: vec![text("1"), text("Alice"), text("t")],
            },
        };

        let event = event_from_message(&mut registry, message).unwrap().unwrap();
        assert_eq!(event.op, Op::Insert);
        assert_eq!(event.meta.resource, "users");
        assert_eq!(event.meta.schema, "public");
        assert_eq!(event.meta.lsn, None);

        let DataSection::Insert(row) = &event.data else {
            panic!("expected insert data");
        };
        assert_eq!(row.get("id"), Some(&FieldValue::Int(1)));
        assert_eq!(
            row.get("name"),
            Some(&FieldValue::Text("Alice".to_string()))
        );
        assert_eq!(row.get("active"), Some(&FieldValue::Bool(true)));
    }

    #[test]
    fn update_with_old_image_carries_both_rows() {
        let mut registry = seeded_registry();
        let message = PgOutputMessage::Update {
            relation_id: 16385,
            old: Some(TupleData {
                values: vec![text("1"), text("Alice"), text("t")],
            }),
            new: TupleData {
                values: vec![text("1"), text("Alice Updated"), text("t")],
            },
        };

        let event = event_from_message(&mut registry, message).unwrap().unwrap();
        let DataSection::Update { new, old } = &event.data else {
            panic!("expected update data");
        };
        assert_eq!(
            new.get("name"),
            Some(&FieldValue::Text("Alice Updated".to_string()))
        );
        assert_eq!(old.get("name"), Some(&FieldValue::Text("Alice".to_string())));
    }

    #[test]
    fn update_without_old_image_emits_empty_old_row() {
        let mut registry = seeded_registry();
        let message = PgOutputMessage::Update {
            relation_id: 16385,
            old: None,
            new: TupleData {
                values: vec![text("1"), text("Bob"), text("f")],
            },
        };

        let event = event_from_message(&mut registry, message).unwrap().unwrap();
        let DataSection::Update { old, .. } = &event.data else {
            panic!("expected update data");
        };
        assert!(old.is_empty());
    }

    #[test]
    fn delete_converts_the_old_row() {
        let mut registry = seeded_registry();
        let message = PgOutputMessage::Delete {
            relation_id: 16385,
            old: TupleData {
                values: vec![text("7"), TupleValue::Null, text("f")],
            },
        };

        let event = event_from_message(&mut registry, message).unwrap().unwrap();
        assert_eq!(event.op, Op::Delete);
        let DataSection::Delete(row) = &event.data else {
            panic!("expected delete data");
        };
        assert_eq!(row.get("id"), Some(&FieldValue::Int(7)));
        assert_eq!(row.get("name"), Some(&FieldValue::Null));
        assert_eq!(row.get("active"), Some(&FieldValue::Bool(false)));
    }

    #[test]
    fn unknown_relation_is_fatal() {
        let mut registry = RelationRegistry::new();
        let message = PgOutputMessage::Insert {
            relation_id: 99999,
            new: TupleData { values: vec![] },
        };
        let result = event_from_message(&mut registry, message);
        assert!(matches!(
            result,
            Err(ReplicationError::RelationNotFound(99999))
        ));
    }

    #[test]
    fn column_count_mismatch_is_fatal() {
        let mut registry = seeded_registry();
        let message = PgOutputMessage::Insert {
            relation_id: 16385,
            new: TupleData {
                values: vec![text("1")],
            },
        };
        let result = event_from_message(&mut registry, message);
        assert!(matches!(
            result,
            Err(ReplicationError::InvalidTupleData { .. })
        ));
    }

    #[test]
    fn watermark_advances_on_every_frame_kind() {
        let mut source = StreamingSource::new("slot", "pub");
        let mut changes = Vec::new();
        let mut watermark = Lsn::INVALID;

        // A keepalive advances the watermark, emits nothing, and is never
        // answered from the receive path (the source has no connection here,
        // so a reply attempt would fail the call).
        source
            .process(
                ReplicationMessage::PrimaryKeepalive {
                    server_wal_end: Lsn(10),
                    server_time: 0,
                    reply_requested: true,
                },
                &mut changes,
                &mut watermark,
            )
            .unwrap();
        assert_eq!(watermark, Lsn(10));
        assert!(changes.is_empty());

        // A Begin frame advances the watermark without emitting an event.
        let mut payload = vec![b'B'];
        payload.extend_from_slice(&5u64.to_be_bytes());
        payload.extend_from_slice(&0i64.to_be_bytes());
        payload.extend_from_slice(&1u32.to_be_bytes());
        source
            .process(
                ReplicationMessage::XLogData {
                    wal_start: Lsn(11),
                    server_wal_end: Lsn(20),
                    server_time: 0,
                    payload,
                },
                &mut changes,
                &mut watermark,
            )
            .unwrap();
        assert_eq!(watermark, Lsn(20));
        assert!(changes.is_empty());

        // An older frame never moves the watermark backwards.
        source
            .process(
                ReplicationMessage::PrimaryKeepalive {
                    server_wal_end: Lsn(15),
                    server_time: 0,
                    reply_requested: false,
                },
                &mut changes,
                &mut watermark,
            )
            .unwrap();
        assert_eq!(watermark, Lsn(20));
    }

    #[test]
    fn undecodable_payload_fails_the_batch() {
        let mut source = StreamingSource::new("slot", "pub");
        let mut changes = Vec::new();
        let mut watermark = Lsn::INVALID;

        // Origin messages are not supported and must not be skipped.
        let result = source.process(
            ReplicationMessage::XLogData {
                wal_start: Lsn(1),
                server_wal_end: Lsn(2),
                server_time: 0,
                payload: vec![b'O', 0, 0, 0, 0],
            },
            &mut changes,
            &mut watermark,
        );
        assert!(matches!(
            result,
            Err(ReplicationError::UnknownMessageType('O'))
        ));
    }

    #[test]
    fn toast_and_null_map_to_json_null() {
        assert_eq!(field_value(25, &TupleValue::Null), FieldValue::Null);
        assert_eq!(
            field_value(25, &TupleValue::UnchangedToast),
            FieldValue::Null
        );
    }

    #[test]
    fn unparseable_integer_degrades_to_text() {
        let value = TupleValue::Text(b"not-a-number".to_vec());
        assert_eq!(
            field_value(INT8_OID, &value),
            FieldValue::Text("not-a-number".to_string())
        );
    }

    #[test]
    fn non_promoted_types_keep_their_text_form() {
        // numeric(10,2) stays a string for exact fidelity
        let value = TupleValue::Text(b"123.45".to_vec());
        assert_eq!(
            field_value(1700, &value),
            FieldValue::Text("123.45".to_string())
        );
    }
}
