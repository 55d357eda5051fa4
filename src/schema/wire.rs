//! Field extraction from serialized protobuf messages.
//!
//! Walks the wire format directly with `prost::encoding` primitives,
//! picking out only the fields a descriptor names. Unknown fields are
//! skipped, so messages may carry arbitrary payload around their keyed
//! fields.

use crate::error::ProtoKvError;
use crate::schema::{Field, FieldKind};
use bytes::Buf;
use prost::encoding::{decode_key, decode_varint, skip_field, DecodeContext, WireType};

/// A field value recovered from message bytes, shaped by the descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WireValue {
    Str(String),
    Int32(i32),
    /// Sub-field values in descriptor order; `None` marks an unset sub-field.
    Message(Vec<Option<WireValue>>),
}

/// Extracts the occurrences of `field` from `msg`.
///
/// Scalar and message fields follow proto3 last-one-wins semantics and
/// yield zero or one value; repeated-set fields yield every element.
pub(crate) fn extract(field: &Field, msg: &[u8]) -> Result<Vec<WireValue>, ProtoKvError> {
    match field {
        Field::RepeatedSet(inner) => collect_all(inner, msg),
        _ => Ok(extract_single(field, msg)?.into_iter().collect()),
    }
}

/// Extracts `field` with singular semantics: the last occurrence, if any.
pub(crate) fn extract_single(
    field: &Field,
    msg: &[u8],
) -> Result<Option<WireValue>, ProtoKvError> {
    Ok(collect_all(field, msg)?.pop())
}

fn collect_all(field: &Field, msg: &[u8]) -> Result<Vec<WireValue>, ProtoKvError> {
    match field {
        Field::Scalar { kind, tag } => collect_scalars(msg, *tag, *kind),
        Field::Message { tag, sub } => {
            let mut out = Vec::new();
            for raw in collect_raw(msg, *tag)? {
                let bytes = raw.into_bytes()?;
                let mut values = Vec::with_capacity(sub.len());
                for sub_field in sub {
                    values.push(extract_single(sub_field, &bytes)?);
                }
                out.push(WireValue::Message(values));
            }
            Ok(out)
        }
        Field::RepeatedSet(_) => Err(ProtoKvError::Internal(
            "repeated-set fields do not nest".into(),
        )),
    }
}

fn collect_scalars(
    msg: &[u8],
    tag: u32,
    kind: FieldKind,
) -> Result<Vec<WireValue>, ProtoKvError> {
    let mut out = Vec::new();
    for raw in collect_raw(msg, tag)? {
        match (kind, raw) {
            (FieldKind::String, RawValue::Bytes(bytes)) => {
                let text = String::from_utf8(bytes)
                    .map_err(|e| ProtoKvError::Internal(format!("invalid utf-8 string: {e}")))?;
                out.push(WireValue::Str(text));
            }
            (FieldKind::Int32, RawValue::Varint(v)) => out.push(WireValue::Int32(v as i32)),
            (FieldKind::Int32, RawValue::Bytes(bytes)) => {
                // Packed repeated encoding: consecutive varints in one
                // length-delimited payload.
                let mut buf = bytes.as_slice();
                while buf.has_remaining() {
                    let v = decode_varint(&mut buf)
                        .map_err(|e| ProtoKvError::Internal(format!("packed int32: {e}")))?;
                    out.push(WireValue::Int32(v as i32));
                }
            }
            (FieldKind::String, RawValue::Varint(_)) => {
                return Err(ProtoKvError::Internal(format!(
                    "field {tag}: expected length-delimited string, found varint"
                )));
            }
        }
    }
    Ok(out)
}

enum RawValue {
    Varint(u64),
    Bytes(Vec<u8>),
}

impl RawValue {
    fn into_bytes(self) -> Result<Vec<u8>, ProtoKvError> {
        match self {
            RawValue::Bytes(bytes) => Ok(bytes),
            RawValue::Varint(_) => Err(ProtoKvError::Internal(
                "expected length-delimited field, found varint".into(),
            )),
        }
    }
}

fn collect_raw(msg: &[u8], want_tag: u32) -> Result<Vec<RawValue>, ProtoKvError> {
    let mut buf = msg;
    let mut out = Vec::new();
    while buf.has_remaining() {
        let (tag, wire_type) =
            decode_key(&mut buf).map_err(|e| ProtoKvError::Internal(format!("wire key: {e}")))?;
        if tag != want_tag {
            skip_field(wire_type, tag, &mut buf, DecodeContext::default())
                .map_err(|e| ProtoKvError::Internal(format!("skip field {tag}: {e}")))?;
            continue;
        }
        match wire_type {
            WireType::Varint => {
                let v = decode_varint(&mut buf)
                    .map_err(|e| ProtoKvError::Internal(format!("varint field {tag}: {e}")))?;
                out.push(RawValue::Varint(v));
            }
            WireType::LengthDelimited => {
                let len = decode_varint(&mut buf)
                    .map_err(|e| ProtoKvError::Internal(format!("field {tag} length: {e}")))?
                    as usize;
                if buf.remaining() < len {
                    return Err(ProtoKvError::Internal(format!(
                        "field {tag}: truncated payload"
                    )));
                }
                out.push(RawValue::Bytes(buf.copy_to_bytes(len).to_vec()));
            }
            other => {
                return Err(ProtoKvError::Internal(format!(
                    "field {tag}: unsupported wire type {other:?}"
                )));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{extract, extract_single, WireValue};
    use crate::schema::Field;
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    struct Inner {
        #[prost(string, tag = "1")]
        kind: String,
        #[prost(string, tag = "2")]
        value: String,
    }

    #[derive(Clone, PartialEq, Message)]
    struct Outer {
        #[prost(message, repeated, tag = "1")]
        items: Vec<Inner>,
        #[prost(string, tag = "2")]
        name: String,
        #[prost(int32, tag = "3")]
        count: i32,
        #[prost(string, repeated, tag = "4")]
        labels: Vec<String>,
    }

    fn sample() -> Vec<u8> {
        Outer {
            items: vec![
                Inner {
                    kind: "a".into(),
                    value: "1".into(),
                },
                Inner {
                    kind: "b".into(),
                    value: "2".into(),
                },
            ],
            name: "outer".into(),
            count: -7,
            labels: vec!["x".into(), "y".into()],
        }
        .encode_to_vec()
    }

    #[test]
    fn string_scalar_extraction() {
        let msg = sample();
        let got = extract_single(&Field::string(2), &msg).expect("extract");
        assert_eq!(got, Some(WireValue::Str("outer".into())));
    }

    #[test]
    fn unset_scalar_yields_nothing() {
        let msg = Outer::default().encode_to_vec();
        assert_eq!(extract_single(&Field::string(2), &msg).expect("extract"), None);
        assert!(extract(&Field::int32(3), &msg).expect("extract").is_empty());
    }

    #[test]
    fn negative_int32_roundtrips() {
        let msg = sample();
        let got = extract_single(&Field::int32(3), &msg).expect("extract");
        assert_eq!(got, Some(WireValue::Int32(-7)));
    }

    #[test]
    fn repeated_string_set_collects_all_elements() {
        let msg = sample();
        let got = extract(&Field::repeated_set(Field::string(4)), &msg).expect("extract");
        assert_eq!(
            got,
            vec![WireValue::Str("x".into()), WireValue::Str("y".into())]
        );
    }

    #[test]
    fn repeated_message_set_extracts_sub_fields_in_order() {
        let msg = sample();
        let field = Field::repeated_set(Field::message(
            1,
            vec![Field::string(1), Field::string(2)],
        ));
        let got = extract(&field, &msg).expect("extract");
        assert_eq!(
            got,
            vec![
                WireValue::Message(vec![
                    Some(WireValue::Str("a".into())),
                    Some(WireValue::Str("1".into())),
                ]),
                WireValue::Message(vec![
                    Some(WireValue::Str("b".into())),
                    Some(WireValue::Str("2".into())),
                ]),
            ]
        );
    }

    #[test]
    fn partially_set_sub_message_marks_missing_components() {
        let msg = Outer {
            items: vec![Inner {
                kind: "only-kind".into(),
                value: String::new(),
            }],
            ..Default::default()
        }
        .encode_to_vec();
        let field = Field::repeated_set(Field::message(
            1,
            vec![Field::string(1), Field::string(2)],
        ));
        let got = extract(&field, &msg).expect("extract");
        assert_eq!(
            got,
            vec![WireValue::Message(vec![
                Some(WireValue::Str("only-kind".into())),
                None,
            ])]
        );
    }

    #[test]
    fn unknown_fields_are_skipped() {
        // Outer parsed against a descriptor that only knows tag 3.
        let msg = sample();
        let got = extract_single(&Field::int32(3), &msg).expect("extract");
        assert_eq!(got, Some(WireValue::Int32(-7)));
    }
}
