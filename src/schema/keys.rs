//! Key codec: the single place that defines the byte layout of primary
//! record keys, index keys, and scan prefixes.
//!
//! A key is a concatenation of tag-prefixed segments:
//! `varint(tag) || kind_byte || encoded_value`. Primary record keys are
//! `varint(message_id) || 'P' || pk_segment`; index keys are
//! `varint(message_id) || 'I' || varint(ordinal) || field_segment ||
//! pk_segment`. The numeric namespace (message ids, field tags, kind
//! bytes) is frozen forever; any drift corrupts a live database.

use crate::error::ProtoKvError;
use crate::schema::wire::{self, WireValue};
use crate::schema::{Field, MessageDescriptor};
use prost::encoding::{decode_varint, encode_varint};
use std::collections::BTreeSet;

const PRIMARY_SPACE: u8 = b'P';
const INDEX_SPACE: u8 = b'I';

const KIND_INT32: u8 = 0x10;
const KIND_STRING: u8 = 0x11;
const KIND_MESSAGE: u8 = 0x12;

impl MessageDescriptor {
    /// The full primary record key for a message, requiring the primary-key
    /// field to be set.
    pub fn primary_record_key(&self, msg: &[u8]) -> Result<Vec<u8>, ProtoKvError> {
        let mut key = primary_prefix(self.id);
        key.extend_from_slice(&self.primary_key_segment(msg)?);
        Ok(key)
    }

    /// Every index key derived from the message's current value. A
    /// repeated-set field contributes one key per distinct element; an
    /// unset scalar contributes nothing.
    pub fn index_keys(&self, msg: &[u8]) -> Result<Vec<Vec<u8>>, ProtoKvError> {
        let pk_segment = self.primary_key_segment(msg)?;
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for (ordinal, field) in self.indices.iter().enumerate() {
            for value in wire::extract(field, msg)? {
                let mut key = index_prefix_base(self.id, ordinal);
                encode_segment(field, &value, &mut key)?;
                key.extend_from_slice(&pk_segment);
                if seen.insert(key.clone()) {
                    out.push(key);
                }
            }
        }
        Ok(out)
    }

    /// Scan prefixes for index `ordinal`, derived from whatever part of the
    /// index field the query message populates. A sub-message segment is
    /// truncated at its first unset component; an unset field yields no
    /// prefixes at all.
    pub fn index_prefixes(
        &self,
        ordinal: usize,
        msg: &[u8],
    ) -> Result<Vec<Vec<u8>>, ProtoKvError> {
        let field = self.indices.get(ordinal).ok_or_else(|| {
            ProtoKvError::Internal(format!("index ordinal {ordinal} out of range"))
        })?;
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for value in wire::extract(field, msg)? {
            let mut prefix = index_prefix_base(self.id, ordinal);
            encode_segment(field, &value, &mut prefix)?;
            if seen.insert(prefix.clone()) {
                out.push(prefix);
            }
        }
        Ok(out)
    }

    /// Prefix shared by every primary record of this message type.
    pub fn primary_prefix(&self) -> Vec<u8> {
        primary_prefix(self.id)
    }

    fn primary_key_segment(&self, msg: &[u8]) -> Result<Vec<u8>, ProtoKvError> {
        let value = wire::extract_single(&self.primary_key, msg)?.ok_or_else(|| {
            ProtoKvError::invalid_argument("message does not set its primary key field")
        })?;
        let mut segment = Vec::new();
        encode_segment(&self.primary_key, &value, &mut segment)?;
        Ok(segment)
    }
}

pub fn primary_prefix(message_id: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(6);
    encode_varint(u64::from(message_id), &mut out);
    out.push(PRIMARY_SPACE);
    out
}

pub(crate) fn index_prefix_base(message_id: u32, ordinal: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    encode_varint(u64::from(message_id), &mut out);
    out.push(INDEX_SPACE);
    encode_varint(ordinal as u64, &mut out);
    out
}

/// Recovers the primary-record prefix for the message type an index-scan
/// prefix belongs to, by reading the message id back out of the prefix.
pub fn primary_prefix_from_index_prefix(prefix: &[u8]) -> Result<Vec<u8>, ProtoKvError> {
    let mut buf = prefix;
    let id = decode_varint(&mut buf)
        .map_err(|e| ProtoKvError::Internal(format!("malformed index prefix: {e}")))?;
    match buf.first() {
        Some(&INDEX_SPACE) => Ok(primary_prefix(id as u32)),
        _ => Err(ProtoKvError::Internal(
            "malformed index prefix: missing index-space byte".into(),
        )),
    }
}

/// Smallest byte string strictly greater than every key with `prefix`;
/// `None` when the prefix is all 0xFF and the scan is unbounded above.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    for i in (0..next.len()).rev() {
        if next[i] != 0xFF {
            next[i] += 1;
            next.truncate(i + 1);
            return Some(next);
        }
    }
    None
}

fn encode_segment(
    field: &Field,
    value: &WireValue,
    out: &mut Vec<u8>,
) -> Result<(), ProtoKvError> {
    match (field, value) {
        (Field::Scalar { tag, .. }, WireValue::Str(s)) => {
            encode_varint(u64::from(*tag), out);
            out.push(KIND_STRING);
            encode_varint(s.len() as u64, out);
            out.extend_from_slice(s.as_bytes());
            Ok(())
        }
        (Field::Scalar { tag, .. }, WireValue::Int32(v)) => {
            encode_varint(u64::from(*tag), out);
            out.push(KIND_INT32);
            // Sign-bit flip keeps lexicographic order equal to numeric order.
            out.extend_from_slice(&((*v as u32) ^ 0x8000_0000).to_be_bytes());
            Ok(())
        }
        (Field::Message { tag, sub }, WireValue::Message(values)) => {
            encode_varint(u64::from(*tag), out);
            out.push(KIND_MESSAGE);
            for (sub_field, sub_value) in sub.iter().zip(values) {
                match sub_value {
                    Some(v) => encode_segment(sub_field, v, out)?,
                    None => break,
                }
            }
            Ok(())
        }
        (Field::RepeatedSet(inner), value) => encode_segment(inner, value, out),
        (field, value) => Err(ProtoKvError::Internal(format!(
            "field {} cannot encode extracted value {value:?}",
            field.tag()
        ))),
    }
}
