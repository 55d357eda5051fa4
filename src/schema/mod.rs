pub mod keys;
pub(crate) mod wire;

/// Scalar kinds usable as primary keys and index components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Int32,
}

/// Declarative description of a keyed message field.
///
/// Keying is a pure function over these values and the serialized message
/// bytes; no reflection is involved. Tags are protobuf field numbers and are
/// baked into every stored key, so they can never change for a live
/// database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Scalar { kind: FieldKind, tag: u32 },
    Message { tag: u32, sub: Vec<Field> },
    RepeatedSet(Box<Field>),
}

impl Field {
    pub fn string(tag: u32) -> Self {
        Field::Scalar {
            kind: FieldKind::String,
            tag,
        }
    }

    pub fn int32(tag: u32) -> Self {
        Field::Scalar {
            kind: FieldKind::Int32,
            tag,
        }
    }

    pub fn message(tag: u32, sub: Vec<Field>) -> Self {
        assert!(!sub.is_empty(), "message field needs at least one sub-field");
        Field::Message { tag, sub }
    }

    pub fn repeated_set(of: Field) -> Self {
        assert!(
            !matches!(of, Field::RepeatedSet(_)),
            "repeated-set fields do not nest"
        );
        Field::RepeatedSet(Box::new(of))
    }

    pub fn tag(&self) -> u32 {
        match self {
            Field::Scalar { tag, .. } | Field::Message { tag, .. } => *tag,
            Field::RepeatedSet(inner) => inner.tag(),
        }
    }
}

/// Binds a message type to its keying schema.
///
/// The `id` namespaces every key this message produces within the shared
/// keyspace and is immutable for the life of a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDescriptor {
    pub id: u32,
    pub primary_key: Field,
    pub indices: Vec<Field>,
}

impl MessageDescriptor {
    pub fn new(id: u32, primary_key: Field, indices: Vec<Field>) -> Self {
        assert!(id > 0, "message id must be positive");
        assert!(
            matches!(primary_key, Field::Scalar { .. }),
            "primary key must be a scalar field"
        );
        Self {
            id,
            primary_key,
            indices,
        }
    }

    /// Ordinal of `field` within this descriptor's index list.
    pub fn ordinal_of(&self, field: &Field) -> Option<usize> {
        self.indices.iter().position(|f| f == field)
    }
}
