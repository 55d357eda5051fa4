//! Registration-entry operations: the heaviest user of the store's
//! index machinery (four indexed fields, two of them repeated sets).

use crate::context::OpContext;
use crate::datastore::api::{
    page_params, page_response, BySelectors, CreateRegistrationEntryRequest,
    CreateRegistrationEntryResponse, DeleteRegistrationEntryRequest,
    DeleteRegistrationEntryResponse, FetchRegistrationEntryRequest,
    FetchRegistrationEntryResponse, ListRegistrationEntriesRequest,
    ListRegistrationEntriesResponse, PruneRegistrationEntriesRequest,
    PruneRegistrationEntriesResponse, SelectorMatch, UpdateRegistrationEntryRequest,
    UpdateRegistrationEntryResponse,
};
use crate::datastore::ENTRY_MESSAGE_ID;
use crate::error::ProtoKvError;
use crate::proto::{RegistrationEntry, Selector};
use crate::schema::{Field, MessageDescriptor};
use crate::store::Store;
use crate::kv::SetOp;
use prost::Message;
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

// Field tags, frozen forever.
const SELECTORS_TAG: u32 = 1;
const PARENT_ID_TAG: u32 = 2;
const SPIFFE_ID_TAG: u32 = 3;
const TTL_TAG: u32 = 4;
const FEDERATES_WITH_TAG: u32 = 5;
const ENTRY_ID_TAG: u32 = 6;

const SELECTOR_TYPE_TAG: u32 = 1;
const SELECTOR_VALUE_TAG: u32 = 2;

pub(crate) fn selectors_field() -> Field {
    Field::repeated_set(Field::message(
        SELECTORS_TAG,
        vec![
            Field::string(SELECTOR_TYPE_TAG),
            Field::string(SELECTOR_VALUE_TAG),
        ],
    ))
}

pub(crate) fn parent_id_field() -> Field {
    Field::string(PARENT_ID_TAG)
}

pub(crate) fn spiffe_id_field() -> Field {
    Field::string(SPIFFE_ID_TAG)
}

pub(crate) fn ttl_field() -> Field {
    Field::int32(TTL_TAG)
}

pub(crate) fn federates_with_field() -> Field {
    Field::repeated_set(Field::string(FEDERATES_WITH_TAG))
}

pub(crate) fn message() -> MessageDescriptor {
    MessageDescriptor::new(
        ENTRY_MESSAGE_ID,
        Field::string(ENTRY_ID_TAG),
        vec![
            selectors_field(),
            parent_id_field(),
            spiffe_id_field(),
            ttl_field(),
            federates_with_field(),
        ],
    )
}

pub(crate) struct Handler {
    store: Store,
}

impl Handler {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    pub(crate) fn create(
        &self,
        ctx: &OpContext,
        req: &CreateRegistrationEntryRequest,
    ) -> Result<CreateRegistrationEntryResponse, ProtoKvError> {
        let entry = req
            .entry
            .as_ref()
            .ok_or_else(|| ProtoKvError::invalid_argument("entry must be non-nil"))?;
        if !entry.entry_id.is_empty() {
            return Err(ProtoKvError::invalid_argument(
                "entry id must be empty on create",
            ));
        }
        let mut entry = entry.clone();
        entry.entry_id = new_entry_id();
        self.store.create(ctx, &entry.encode_to_vec())?;
        Ok(CreateRegistrationEntryResponse { entry })
    }

    pub(crate) fn fetch(
        &self,
        ctx: &OpContext,
        req: &FetchRegistrationEntryRequest,
    ) -> Result<FetchRegistrationEntryResponse, ProtoKvError> {
        match self.read_by_id(ctx, &req.entry_id) {
            Ok(entry) => Ok(FetchRegistrationEntryResponse { entry: Some(entry) }),
            Err(err) if err.is_not_found() => Ok(FetchRegistrationEntryResponse::default()),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn list(
        &self,
        ctx: &OpContext,
        req: &ListRegistrationEntriesRequest,
    ) -> Result<ListRegistrationEntriesResponse, ProtoKvError> {
        let (initial_token, page_size) = page_params(req.pagination.as_ref())?;
        if let Some(by_selectors) = &req.by_selectors {
            if by_selectors.selectors.is_empty() {
                return Err(ProtoKvError::invalid_argument(
                    "cannot list by empty selector set",
                ));
            }
        }
        let selector_set: HashSet<&Selector> = req
            .by_selectors
            .iter()
            .flat_map(|by| by.selectors.iter())
            .collect();

        // Post-filtering can empty out or shrink a candidate page, so keep
        // consuming backend pages until the requested page is full or the
        // scan is exhausted. The continuation token always reflects the
        // last candidate consumed, never a filtered view.
        let mut entries = Vec::new();
        let mut token = initial_token;
        loop {
            let limit = if page_size == 0 {
                0
            } else {
                page_size - entries.len()
            };
            let (candidates, next_token) = self.list_once(ctx, req, &token, limit)?;
            entries.extend(
                candidates
                    .into_iter()
                    .filter(|entry| matches_selectors(entry, req.by_selectors.as_ref(), &selector_set)),
            );
            let exhausted = next_token.is_empty();
            let full = page_size != 0 && entries.len() >= page_size;
            if exhausted || full || page_size == 0 {
                return Ok(ListRegistrationEntriesResponse {
                    entries,
                    pagination: page_response(req.pagination.as_ref(), &next_token),
                });
            }
            token = next_token;
        }
    }

    pub(crate) fn update(
        &self,
        ctx: &OpContext,
        req: &UpdateRegistrationEntryRequest,
    ) -> Result<UpdateRegistrationEntryResponse, ProtoKvError> {
        let incoming = req
            .entry
            .as_ref()
            .ok_or_else(|| ProtoKvError::invalid_argument("entry must be non-nil"))?;
        let mut entry = self.read_by_id(ctx, &incoming.entry_id)?;
        entry.selectors = incoming.selectors.clone();
        entry.parent_id = incoming.parent_id.clone();
        entry.spiffe_id = incoming.spiffe_id.clone();
        entry.ttl = incoming.ttl;
        entry.federates_with = incoming.federates_with.clone();
        entry.admin = incoming.admin;
        entry.downstream = incoming.downstream;
        entry.entry_expiry = incoming.entry_expiry;
        entry.dns_names = incoming.dns_names.clone();
        self.store.update(ctx, &entry.encode_to_vec())?;
        Ok(UpdateRegistrationEntryResponse { entry })
    }

    pub(crate) fn delete(
        &self,
        ctx: &OpContext,
        req: &DeleteRegistrationEntryRequest,
    ) -> Result<DeleteRegistrationEntryResponse, ProtoKvError> {
        let entry = self.read_by_id(ctx, &req.entry_id)?;
        self.store.delete(ctx, &entry.encode_to_vec())?;
        Ok(DeleteRegistrationEntryResponse { entry })
    }

    pub(crate) fn prune(
        &self,
        ctx: &OpContext,
        req: &PruneRegistrationEntriesRequest,
    ) -> Result<PruneRegistrationEntriesResponse, ProtoKvError> {
        let (values, _) = self.store.page(ctx, &[], 0)?;
        let mut failures = 0usize;
        let mut pruned = 0usize;
        for value in values {
            let entry = RegistrationEntry::decode(value.as_slice())?;
            if entry.entry_expiry >= req.expires_before {
                continue;
            }
            match self.store.delete(ctx, &value) {
                Ok(()) => pruned += 1,
                Err(err) => {
                    warn!(entry_id = %entry.entry_id, error = %err, "failed to prune registration entry");
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            return Err(ProtoKvError::Internal(format!(
                "failed to delete {failures} registration entries"
            )));
        }
        if pruned > 0 {
            info!(count = pruned, "pruned expired registration entries");
        }
        Ok(PruneRegistrationEntriesResponse {})
    }

    fn read_by_id(&self, ctx: &OpContext, entry_id: &str) -> Result<RegistrationEntry, ProtoKvError> {
        let query = RegistrationEntry {
            entry_id: entry_id.into(),
            ..Default::default()
        };
        let value = self.store.read(ctx, &query.encode_to_vec(), false)?;
        Ok(RegistrationEntry::decode(value.as_slice())?)
    }

    /// One backend page of candidates for the request's filters.
    fn list_once(
        &self,
        ctx: &OpContext,
        req: &ListRegistrationEntriesRequest,
        token: &[u8],
        limit: usize,
    ) -> Result<(Vec<RegistrationEntry>, Vec<u8>), ProtoKvError> {
        let mut query = RegistrationEntry::default();
        let mut fields = Vec::new();
        let mut set_ops = Vec::new();

        if let Some(by_selectors) = &req.by_selectors {
            query.selectors = by_selectors.selectors.clone();
            fields.push(selectors_field());
            set_ops.push(match by_selectors.match_behavior {
                // Subset candidates: any entry holding at least one queried
                // selector. Exact candidates: entries holding all of them.
                SelectorMatch::Subset => SetOp::Union,
                SelectorMatch::Exact => SetOp::Intersect,
            });
        }
        if let Some(parent_id) = &req.by_parent_id {
            query.parent_id = parent_id.clone();
            fields.push(parent_id_field());
            set_ops.push(SetOp::default());
        }
        if let Some(spiffe_id) = &req.by_spiffe_id {
            query.spiffe_id = spiffe_id.clone();
            fields.push(spiffe_id_field());
            set_ops.push(SetOp::default());
        }

        let (values, next_token) = if fields.is_empty() {
            self.store.page(ctx, token, limit)?
        } else {
            self.store.page_index(
                ctx,
                &query.encode_to_vec(),
                token,
                limit,
                &fields,
                &set_ops,
            )?
        };

        let mut entries = Vec::with_capacity(values.len());
        for value in values {
            entries.push(RegistrationEntry::decode(value.as_slice())?);
        }
        Ok((entries, next_token))
    }
}

fn matches_selectors(
    entry: &RegistrationEntry,
    by_selectors: Option<&BySelectors>,
    selector_set: &HashSet<&Selector>,
) -> bool {
    let Some(by_selectors) = by_selectors else {
        return true;
    };
    match by_selectors.match_behavior {
        SelectorMatch::Subset => entry
            .selectors
            .iter()
            .all(|s| selector_set.contains(s)),
        // Candidates already hold every queried selector; equal cardinality
        // makes the sets equal.
        SelectorMatch::Exact => entry.selectors.len() == selector_set.len(),
    }
}

fn new_entry_id() -> String {
    Uuid::new_v4().to_string()
}

pub(crate) fn decode_entries(values: Vec<Vec<u8>>) -> Result<Vec<RegistrationEntry>, ProtoKvError> {
    values
        .into_iter()
        .map(|v| RegistrationEntry::decode(v.as_slice()).map_err(ProtoKvError::from))
        .collect()
}
