//! Descriptor-bound store: enforces the invariant that every live primary
//! record is accompanied by exactly the index entries derived from its
//! current value, no more and no fewer. Every write runs inside a single
//! primitive-KV transaction, so a failed write leaves no partial state.

use crate::context::OpContext;
use crate::error::ProtoKvError;
use crate::kv::{with_tx, Index, Kv, SetOp, Tx};
use crate::schema::{Field, MessageDescriptor};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Index rows carry this sentinel; the payload lives entirely in the key.
const INDEX_SENTINEL: [u8; 1] = [1];

/// Binds one message descriptor to one KV backend. Stateless and cheap to
/// clone; all values in and out are serialized protobuf bytes.
#[derive(Clone)]
pub struct Store {
    kv: Arc<dyn Kv>,
    replica: Option<Arc<dyn Kv>>,
    message: MessageDescriptor,
}

impl Store {
    pub fn new(kv: Arc<dyn Kv>, message: MessageDescriptor) -> Self {
        Self {
            kv,
            replica: None,
            message,
        }
    }

    /// Attaches a read-only replica handle used for tolerate-stale reads.
    pub fn with_replica(mut self, replica: Arc<dyn Kv>) -> Self {
        self.replica = Some(replica);
        self
    }

    /// Inserts a new record, failing with `AlreadyExists` on a primary-key
    /// collision.
    pub fn create(&self, ctx: &OpContext, value: &[u8]) -> Result<(), ProtoKvError> {
        let primary_key = self.message.primary_record_key(value)?;
        let index_keys = self.message.index_keys(value)?;
        with_tx(self.kv.as_ref(), ctx, |tx| {
            if tx.get(ctx, &primary_key)?.is_some() {
                return Err(ProtoKvError::AlreadyExists);
            }
            tx.put(ctx, &primary_key, value)?;
            for key in &index_keys {
                tx.put(ctx, key, &INDEX_SENTINEL)?;
            }
            Ok(())
        })
    }

    /// Fetches the record addressed by the query message's primary-key
    /// field. With `tolerate_stale` set and a replica attached, the read is
    /// served from the replica.
    pub fn read(
        &self,
        ctx: &OpContext,
        query: &[u8],
        tolerate_stale: bool,
    ) -> Result<Vec<u8>, ProtoKvError> {
        let primary_key = self.message.primary_record_key(query)?;
        let kv = match (&self.replica, tolerate_stale) {
            (Some(replica), true) => replica.as_ref(),
            _ => self.kv.as_ref(),
        };
        kv.get(ctx, &primary_key)?.ok_or(ProtoKvError::NotFound)
    }

    /// Replaces an existing record, reconciling index entries against the
    /// stored value: stale keys are deleted, new ones inserted, unchanged
    /// ones left alone.
    pub fn update(&self, ctx: &OpContext, value: &[u8]) -> Result<(), ProtoKvError> {
        let primary_key = self.message.primary_record_key(value)?;
        let new_keys = self.message.index_keys(value)?;
        with_tx(self.kv.as_ref(), ctx, |tx| {
            let old = tx
                .get(ctx, &primary_key)?
                .ok_or(ProtoKvError::NotFound)?;
            self.swap_index_keys(ctx, tx, &old, &new_keys)?;
            tx.put(ctx, &primary_key, value)
        })
    }

    /// Creates or replaces, whichever applies. Idempotent.
    pub fn upsert(&self, ctx: &OpContext, value: &[u8]) -> Result<(), ProtoKvError> {
        let primary_key = self.message.primary_record_key(value)?;
        let new_keys = self.message.index_keys(value)?;
        with_tx(self.kv.as_ref(), ctx, |tx| {
            match tx.get(ctx, &primary_key)? {
                Some(old) => self.swap_index_keys(ctx, tx, &old, &new_keys)?,
                None => {
                    for key in &new_keys {
                        tx.put(ctx, key, &INDEX_SENTINEL)?;
                    }
                }
            }
            tx.put(ctx, &primary_key, value)
        })
    }

    /// Removes a record and all of its index entries; `NotFound` when the
    /// primary record is absent. Index keys are derived from the stored
    /// value, so a caller-supplied partial message suffices.
    pub fn delete(&self, ctx: &OpContext, value: &[u8]) -> Result<(), ProtoKvError> {
        let primary_key = self.message.primary_record_key(value)?;
        with_tx(self.kv.as_ref(), ctx, |tx| {
            let old = tx
                .get(ctx, &primary_key)?
                .ok_or(ProtoKvError::NotFound)?;
            for key in self.message.index_keys(&old)? {
                tx.delete(ctx, &key)?;
            }
            tx.delete(ctx, &primary_key)?;
            Ok(())
        })
    }

    /// One page of this message type's records in primary-key order.
    pub fn page(
        &self,
        ctx: &OpContext,
        token: &[u8],
        limit: usize,
    ) -> Result<(Vec<Vec<u8>>, Vec<u8>), ProtoKvError> {
        self.kv
            .page(ctx, &self.message.primary_prefix(), token, limit)
    }

    /// One page of records matching the set-algebra combination of the
    /// given indexed fields, with prefixes derived from `query`.
    pub fn page_index(
        &self,
        ctx: &OpContext,
        query: &[u8],
        token: &[u8],
        limit: usize,
        fields: &[Field],
        set_ops: &[SetOp],
    ) -> Result<(Vec<Vec<u8>>, Vec<u8>), ProtoKvError> {
        if fields.is_empty() {
            return Err(ProtoKvError::invalid_argument(
                "page-index query needs at least one field",
            ));
        }
        if fields.len() != set_ops.len() {
            return Err(ProtoKvError::invalid_argument(
                "page-index query needs one set operation per field",
            ));
        }
        let mut indices = Vec::with_capacity(fields.len());
        for (field, set_op) in fields.iter().zip(set_ops) {
            let ordinal = self.message.ordinal_of(field).ok_or_else(|| {
                ProtoKvError::invalid_argument(format!(
                    "field {} is not indexed for this message",
                    field.tag()
                ))
            })?;
            let prefixes = self.message.index_prefixes(ordinal, query)?;
            if prefixes.is_empty() {
                return Err(ProtoKvError::invalid_argument(format!(
                    "query message does not populate indexed field {}",
                    field.tag()
                )));
            }
            indices.push(Index {
                prefixes,
                set_op: *set_op,
            });
        }
        self.kv.page_index(ctx, &indices, token, limit)
    }

    fn swap_index_keys(
        &self,
        ctx: &OpContext,
        tx: &dyn Tx,
        old_value: &[u8],
        new_keys: &[Vec<u8>],
    ) -> Result<(), ProtoKvError> {
        let old_keys: BTreeSet<Vec<u8>> =
            self.message.index_keys(old_value)?.into_iter().collect();
        let new_set: BTreeSet<&Vec<u8>> = new_keys.iter().collect();
        for stale in old_keys.iter().filter(|k| !new_set.contains(k)) {
            tx.delete(ctx, stale)?;
        }
        for fresh in new_keys.iter().filter(|k| !old_keys.contains(*k)) {
            tx.put(ctx, fresh, &INDEX_SENTINEL)?;
        }
        Ok(())
    }
}
