//! pgoutput logical decoding messages (protocol version 2)
//!
//! [`decode`] is a pure function over one `XLogData` payload. It yields a
//! [`PgOutputMessage`] owning every string and value it carries, so nothing
//! borrows from the receive buffer after it returns.
//!
//! The engine runs with `streaming 'off'`, so only the plain transactional
//! message types are accepted. Everything else — `Origin`, `Type`,
//! `Truncate`, the in-progress streaming family — is rejected as
//! [`ReplicationError::UnknownMessageType`]. Rejecting instead of skipping is
//! deliberate: a skipped message a DBA enabled server-side would be silent
//! data loss.

use crate::buffer::BufferReader;
use crate::errors::{ReplicationError, ReplicationResult};
use crate::lsn::Lsn;

/// PostgreSQL object id
pub type Oid = u32;

/// Schema metadata for one column of a replicated relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Bit 1 marks the column as part of the replica identity key
    pub flags: u8,
    pub name: String,
    pub data_type_oid: Oid,
    pub type_modifier: i32,
}

/// Schema metadata for a replicated relation, as announced by the server
///
/// Sent once per relation per session before its first row change, and
/// re-sent with the same id after `ALTER TABLE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationInfo {
    pub relation_id: Oid,
    pub namespace: String,
    pub relation_name: String,
    /// 'd' default, 'n' nothing, 'f' full, 'i' index
    pub replica_identity: u8,
    pub columns: Vec<ColumnSpec>,
}

/// One slot of a decoded tuple, in relation column order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleValue {
    Null,
    /// TOASTed value that did not change; the server omits the payload
    UnchangedToast,
    /// Text-format value bytes
    Text(Vec<u8>),
    /// Binary-format value bytes
    Binary(Vec<u8>),
}

/// A decoded row image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleData {
    pub values: Vec<TupleValue>,
}

/// A decoded pgoutput message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgOutputMessage {
    Begin {
        final_lsn: Lsn,
        commit_time: i64,
        xid: u32,
    },
    Commit {
        flags: u8,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_time: i64,
    },
    Relation(RelationInfo),
    Insert {
        relation_id: Oid,
        new: TupleData,
    },
    Update {
        relation_id: Oid,
        /// Old row image ('K' key or 'O' full); absent under
        /// REPLICA IDENTITY DEFAULT
        old: Option<TupleData>,
        new: TupleData,
    },
    Delete {
        relation_id: Oid,
        old: TupleData,
    },
}

/// Decode one `XLogData` payload into a message
pub fn decode(payload: &[u8]) -> ReplicationResult<PgOutputMessage> {
    let mut reader = BufferReader::new(payload);
    match reader.read_u8()? {
        b'B' => decode_begin(&mut reader),
        b'C' => decode_commit(&mut reader),
        b'R' => decode_relation(&mut reader),
        b'I' => decode_insert(&mut reader),
        b'U' => decode_update(&mut reader),
        b'D' => decode_delete(&mut reader),
        other => Err(ReplicationError::UnknownMessageType(other as char)),
    }
}

fn decode_begin(reader: &mut BufferReader) -> ReplicationResult<PgOutputMessage> {
    Ok(PgOutputMessage::Begin {
        final_lsn: Lsn(reader.read_u64()?),
        commit_time: reader.read_i64()?,
        xid: reader.read_u32()?,
    })
}

fn decode_commit(reader: &mut BufferReader) -> ReplicationResult<PgOutputMessage> {
    Ok(PgOutputMessage::Commit {
        flags: reader.read_u8()?,
        commit_lsn: Lsn(reader.read_u64()?),
        end_lsn: Lsn(reader.read_u64()?),
        commit_time: reader.read_i64()?,
    })
}

fn decode_relation(reader: &mut BufferReader) -> ReplicationResult<PgOutputMessage> {
    let relation_id = reader.read_u32()?;
    let namespace = reader.read_cstring()?;
    let relation_name = reader.read_cstring()?;
    let replica_identity = reader.read_u8()?;
    let column_count = reader.read_u16()?;

    let mut columns = Vec::with_capacity(column_count as usize);
    for _ in 0..column_count {
        columns.push(ColumnSpec {
            flags: reader.read_u8()?,
            name: reader.read_cstring()?,
            data_type_oid: reader.read_u32()?,
            type_modifier: reader.read_i32()?,
        });
    }

    Ok(PgOutputMessage::Relation(RelationInfo {
        relation_id,
        namespace,
        relation_name,
        replica_identity,
        columns,
    }))
}

fn decode_insert(reader: &mut BufferReader) -> ReplicationResult<PgOutputMessage> {
    let relation_id = reader.read_u32()?;
    expect_marker(reader, b'N', "insert")?;
    let new = decode_tuple(reader)?;
    Ok(PgOutputMessage::Insert { relation_id, new })
}

fn decode_update(reader: &mut BufferReader) -> ReplicationResult<PgOutputMessage> {
    let relation_id = reader.read_u32()?;
    let (old, new) = match reader.read_u8()? {
        tag @ (b'K' | b'O') => {
            let old = decode_tuple(reader)?;
            // The new image is mandatory after a keyed/full old image.
            expect_marker(reader, b'N', if tag == b'K' { "update(K)" } else { "update(O)" })?;
            (Some(old), decode_tuple(reader)?)
        }
        b'N' => (None, decode_tuple(reader)?),
        other => {
            return Err(ReplicationError::decode(format!(
                "invalid update tuple tag '{}'",
                other as char
            )));
        }
    };
    Ok(PgOutputMessage::Update {
        relation_id,
        old,
        new,
    })
}

fn decode_delete(reader: &mut BufferReader) -> ReplicationResult<PgOutputMessage> {
    let relation_id = reader.read_u32()?;
    match reader.read_u8()? {
        b'K' | b'O' => {}
        other => {
            return Err(ReplicationError::decode(format!(
                "invalid delete tuple tag '{}'",
                other as char
            )));
        }
    }
    let old = decode_tuple(reader)?;
    Ok(PgOutputMessage::Delete { relation_id, old })
}

fn expect_marker(reader: &mut BufferReader, marker: u8, context: &str) -> ReplicationResult<()> {
    let found = reader.read_u8()?;
    if found != marker {
        return Err(ReplicationError::decode(format!(
            "expected '{}' marker in {context} message, found '{}'",
            marker as char, found as char
        )));
    }
    Ok(())
}

/// Decode a tuple: `column_count:u16`, then one slot per column
fn decode_tuple(reader: &mut BufferReader) -> ReplicationResult<TupleData> {
    let column_count = reader.read_u16()?;
    let mut values = Vec::with_capacity(column_count as usize);
    for _ in 0..column_count {
        let value = match reader.read_u8()? {
            b'n' => TupleValue::Null,
            b'u' => TupleValue::UnchangedToast,
            kind @ (b't' | b'b') => {
                let length = reader.read_u32()? as usize;
                if !reader.has_bytes(length) {
                    return Err(ReplicationError::tuple(format!(
                        "value length {length} exceeds remaining buffer"
                    )));
                }
                let bytes = reader.read_bytes(length)?;
                if kind == b't' {
                    TupleValue::Text(bytes)
                } else {
                    TupleValue::Binary(bytes)
                }
            }
            other => {
                return Err(ReplicationError::tuple(format!(
                    "unknown column kind '{}'",
                    other as char
                )));
            }
        };
        values.push(value);
    }
    Ok(TupleData { values })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Fixture builders mirroring the wire layouts in the PostgreSQL docs.

    fn push_u16(buf: &mut Vec<u8>, v: u16) {
        buf.extend_from_slice(&v.to_be_bytes());
    }

    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_be_bytes());
    }

    fn push_u64(buf: &mut Vec<u8>, v: u64) {
        buf.extend_from_slice(&v.to_be_bytes());
    }

    fn push_i64(buf: &mut Vec<u8>, v: i64) {
        buf.extend_from_slice(&v.to_be_bytes());
    }

    fn push_cstring(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(s.as_bytes());
        buf.push(0);
    }

    fn push_text_value(buf: &mut Vec<u8>, s: &str) {
        buf.push(b't');
        push_u32(buf, s.len() as u32);
        buf.extend_from_slice(s.as_bytes());
    }

    fn relation_fixture() -> Vec<u8> {
        let mut buf = vec![b'R'];
        push_u32(&mut buf, 16385);
        push_cstring(&mut buf, "public");
        push_cstring(&mut buf, "users");
        buf.push(b'f');
        push_u16(&mut buf, 2);
        // id int8, key column
        buf.push(1);
        push_cstring(&mut buf, "id");
        push_u32(&mut buf, 20);
        push_u32(&mut buf, u32::MAX); // typmod -1
        // name text
        buf.push(0);
        push_cstring(&mut buf, "name");
        push_u32(&mut buf, 25);
        push_u32(&mut buf, u32::MAX);
        buf
    }

    #[test]
    fn decodes_begin() {
        let mut buf = vec![b'B'];
        push_u64(&mut buf, 0x16_B374_D848);
        push_i64(&mut buf, 712345678901234);
        push_u32(&mut buf, 4242);

        let msg = decode(&buf).unwrap();
        assert_eq!(
            msg,
            PgOutputMessage::Begin {
                final_lsn: Lsn(0x16_B374_D848),
                commit_time: 712345678901234,
                xid: 4242,
            }
        );
    }

    #[test]
    fn decodes_commit() {
        let mut buf = vec![b'C', 0];
        push_u64(&mut buf, 100);
        push_u64(&mut buf, 200);
        push_i64(&mut buf, 300);

        let msg = decode(&buf).unwrap();
        assert_eq!(
            msg,
            PgOutputMessage::Commit {
                flags: 0,
                commit_lsn: Lsn(100),
                end_lsn: Lsn(200),
                commit_time: 300,
            }
        );
    }

    #[test]
    fn decodes_relation() {
        let msg = decode(&relation_fixture()).unwrap();
        let PgOutputMessage::Relation(info) = msg else {
            panic!("expected relation message");
        };
        assert_eq!(info.relation_id, 16385);
        assert_eq!(info.namespace, "public");
        assert_eq!(info.relation_name, "users");
        assert_eq!(info.replica_identity, b'f');
        assert_eq!(info.columns.len(), 2);
        assert_eq!(info.columns[0].name, "id");
        assert_eq!(info.columns[0].flags, 1);
        assert_eq!(info.columns[0].data_type_oid, 20);
        assert_eq!(info.columns[0].type_modifier, -1);
        assert_eq!(info.columns[1].name, "name");
    }

    #[test]
    fn decodes_insert_with_null_and_toast() {
        let mut buf = vec![b'I'];
        push_u32(&mut buf, 16385);
        buf.push(b'N');
        push_u16(&mut buf, 3);
        push_text_value(&mut buf, "1");
        buf.push(b'n');
        buf.push(b'u');

        let msg = decode(&buf).unwrap();
        assert_eq!(
            msg,
            PgOutputMessage::Insert {
                relation_id: 16385,
                new: TupleData {
                    values: vec![
                        TupleValue::Text(b"1".to_vec()),
                        TupleValue::Null,
                        TupleValue::UnchangedToast,
                    ],
                },
            }
        );
    }

    #[test]
    fn decodes_update_with_old_image() {
        let mut buf = vec![b'U'];
        push_u32(&mut buf, 16385);
        buf.push(b'O');
        push_u16(&mut buf, 1);
        push_text_value(&mut buf, "Alice");
        buf.push(b'N');
        push_u16(&mut buf, 1);
        push_text_value(&mut buf, "Alice Updated");

        let msg = decode(&buf).unwrap();
        assert_eq!(
            msg,
            PgOutputMessage::Update {
                relation_id: 16385,
                old: Some(TupleData {
                    values: vec![TupleValue::Text(b"Alice".to_vec())],
                }),
                new: TupleData {
                    values: vec![TupleValue::Text(b"Alice Updated".to_vec())],
                },
            }
        );
    }

    #[test]
    fn decodes_update_without_old_image() {
        let mut buf = vec![b'U'];
        push_u32(&mut buf, 16385);
        buf.push(b'N');
        push_u16(&mut buf, 1);
        push_text_value(&mut buf, "Bob");

        let msg = decode(&buf).unwrap();
        let PgOutputMessage::Update { old, new, .. } = msg else {
            panic!("expected update message");
        };
        assert!(old.is_none());
        assert_eq!(new.values, vec![TupleValue::Text(b"Bob".to_vec())]);
    }

    #[test]
    fn update_old_image_requires_new_marker() {
        let mut buf = vec![b'U'];
        push_u32(&mut buf, 16385);
        buf.push(b'K');
        push_u16(&mut buf, 1);
        push_text_value(&mut buf, "1");
        // missing 'N' + new tuple
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn decodes_delete_with_key_image() {
        let mut buf = vec![b'D'];
        push_u32(&mut buf, 16385);
        buf.push(b'K');
        push_u16(&mut buf, 1);
        push_text_value(&mut buf, "7");

        let msg = decode(&buf).unwrap();
        assert_eq!(
            msg,
            PgOutputMessage::Delete {
                relation_id: 16385,
                old: TupleData {
                    values: vec![TupleValue::Text(b"7".to_vec())],
                },
            }
        );
    }

    #[test]
    fn delete_rejects_new_image_tag() {
        let mut buf = vec![b'D'];
        push_u32(&mut buf, 16385);
        buf.push(b'N');
        push_u16(&mut buf, 0);
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn zero_columns_is_legal() {
        let mut buf = vec![b'I'];
        push_u32(&mut buf, 1);
        buf.push(b'N');
        push_u16(&mut buf, 0);

        let msg = decode(&buf).unwrap();
        let PgOutputMessage::Insert { new, .. } = msg else {
            panic!("expected insert message");
        };
        assert!(new.values.is_empty());
    }

    #[test]
    fn binary_values_are_kept_as_bytes() {
        let mut buf = vec![b'I'];
        push_u32(&mut buf, 1);
        buf.push(b'N');
        push_u16(&mut buf, 1);
        buf.push(b'b');
        push_u32(&mut buf, 2);
        buf.extend_from_slice(&[0xDE, 0xAD]);

        let msg = decode(&buf).unwrap();
        let PgOutputMessage::Insert { new, .. } = msg else {
            panic!("expected insert message");
        };
        assert_eq!(new.values, vec![TupleValue::Binary(vec![0xDE, 0xAD])]);
    }

    #[test]
    fn unsupported_types_are_fatal() {
        // Origin, Type, Truncate, and the streaming family must not be
        // silently skipped.
        for tag in [b'O', b'Y', b'T', b'S', b'E', b'c', b'A', b'M'] {
            let result = decode(&[tag, 0, 0, 0, 0]);
            assert!(
                matches!(result, Err(ReplicationError::UnknownMessageType(_))),
                "tag '{}' should be rejected",
                tag as char
            );
        }
    }

    #[test]
    fn value_length_beyond_buffer_is_invalid_tuple_data() {
        let mut buf = vec![b'I'];
        push_u32(&mut buf, 1);
        buf.push(b'N');
        push_u16(&mut buf, 1);
        buf.push(b't');
        push_u32(&mut buf, 1000);
        buf.extend_from_slice(b"short");

        let result = decode(&buf);
        assert!(matches!(
            result,
            Err(ReplicationError::InvalidTupleData { .. })
        ));
    }

    #[test]
    fn truncated_relation_name_is_an_error() {
        let mut buf = vec![b'R'];
        push_u32(&mut buf, 1);
        buf.extend_from_slice(b"public"); // no terminator, nothing after
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn empty_payload_is_an_error() {
        assert!(decode(&[]).is_err());
    }
}
