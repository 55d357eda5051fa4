//! Bundle operations, including the cross-entity delete modes over
//! registration entries that federate with the bundle's trust domain.

use crate::context::OpContext;
use crate::datastore::api::{
    page_params, page_response, AppendBundleRequest, AppendBundleResponse, CreateBundleRequest,
    CreateBundleResponse, DeleteBundleMode, DeleteBundleRequest, DeleteBundleResponse,
    FetchBundleRequest, FetchBundleResponse, ListBundlesRequest, ListBundlesResponse,
    PruneBundleRequest, PruneBundleResponse, SetBundleRequest, SetBundleResponse,
    UpdateBundleRequest, UpdateBundleResponse,
};
use crate::datastore::registration_entry::{self, decode_entries};
use crate::datastore::BUNDLE_MESSAGE_ID;
use crate::error::ProtoKvError;
use crate::kv::SetOp;
use crate::proto::{Bundle, RegistrationEntry};
use crate::schema::{Field, MessageDescriptor};
use crate::store::Store;
use prost::Message;
use std::collections::HashSet;
use tracing::info;

const TRUST_DOMAIN_ID_TAG: u32 = 1;

pub(crate) fn message() -> MessageDescriptor {
    MessageDescriptor::new(
        BUNDLE_MESSAGE_ID,
        Field::string(TRUST_DOMAIN_ID_TAG),
        Vec::new(),
    )
}

pub(crate) struct Handler {
    store: Store,
    entry_store: Store,
}

impl Handler {
    pub(crate) fn new(store: Store, entry_store: Store) -> Self {
        Self { store, entry_store }
    }

    pub(crate) fn create(
        &self,
        ctx: &OpContext,
        req: &CreateBundleRequest,
    ) -> Result<CreateBundleResponse, ProtoKvError> {
        let bundle = required_bundle(req.bundle.as_ref())?;
        self.store.create(ctx, &bundle.encode_to_vec())?;
        Ok(CreateBundleResponse {
            bundle: bundle.clone(),
        })
    }

    pub(crate) fn fetch(
        &self,
        ctx: &OpContext,
        req: &FetchBundleRequest,
    ) -> Result<FetchBundleResponse, ProtoKvError> {
        match self.read_bundle(ctx, &req.trust_domain_id) {
            Ok(bundle) => Ok(FetchBundleResponse {
                bundle: Some(bundle),
            }),
            Err(err) if err.is_not_found() => Ok(FetchBundleResponse::default()),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn list(
        &self,
        ctx: &OpContext,
        req: &ListBundlesRequest,
    ) -> Result<ListBundlesResponse, ProtoKvError> {
        let (token, limit) = page_params(req.pagination.as_ref())?;
        let (values, next_token) = self.store.page(ctx, &token, limit)?;
        let mut bundles = Vec::with_capacity(values.len());
        for value in values {
            bundles.push(Bundle::decode(value.as_slice())?);
        }
        Ok(ListBundlesResponse {
            bundles,
            pagination: page_response(req.pagination.as_ref(), &next_token),
        })
    }

    pub(crate) fn set(
        &self,
        ctx: &OpContext,
        req: &SetBundleRequest,
    ) -> Result<SetBundleResponse, ProtoKvError> {
        let bundle = required_bundle(req.bundle.as_ref())?;
        self.store.upsert(ctx, &bundle.encode_to_vec())?;
        Ok(SetBundleResponse {
            bundle: bundle.clone(),
        })
    }

    pub(crate) fn update(
        &self,
        ctx: &OpContext,
        req: &UpdateBundleRequest,
    ) -> Result<UpdateBundleResponse, ProtoKvError> {
        let bundle = required_bundle(req.bundle.as_ref())?;
        self.store.update(ctx, &bundle.encode_to_vec())?;
        Ok(UpdateBundleResponse {
            bundle: bundle.clone(),
        })
    }

    pub(crate) fn append(
        &self,
        ctx: &OpContext,
        req: &AppendBundleRequest,
    ) -> Result<AppendBundleResponse, ProtoKvError> {
        let incoming = required_bundle(req.bundle.as_ref())?;
        let current = match self.read_bundle(ctx, &incoming.trust_domain_id) {
            Ok(bundle) => bundle,
            Err(err) if err.is_not_found() => {
                self.store.create(ctx, &incoming.encode_to_vec())?;
                return Ok(AppendBundleResponse {
                    bundle: incoming.clone(),
                    bundle_changed: true,
                });
            }
            Err(err) => return Err(err),
        };

        let (merged, changed) = merge_bundles(&current, incoming);
        if changed {
            self.store.update(ctx, &merged.encode_to_vec())?;
        }
        Ok(AppendBundleResponse {
            bundle: merged,
            bundle_changed: changed,
        })
    }

    pub(crate) fn prune(
        &self,
        ctx: &OpContext,
        req: &PruneBundleRequest,
    ) -> Result<PruneBundleResponse, ProtoKvError> {
        let current = match self.read_bundle(ctx, &req.trust_domain_id) {
            Ok(bundle) => bundle,
            Err(err) if err.is_not_found() => {
                return Ok(PruneBundleResponse {
                    bundle_changed: false,
                })
            }
            Err(err) => return Err(err),
        };

        let (pruned, changed) = prune_bundle(&current, req.expires_before)?;
        if changed {
            self.store.update(ctx, &pruned.encode_to_vec())?;
            info!(
                trust_domain_id = %req.trust_domain_id,
                "pruned expired bundle elements"
            );
        }
        Ok(PruneBundleResponse {
            bundle_changed: changed,
        })
    }

    pub(crate) fn delete(
        &self,
        ctx: &OpContext,
        req: &DeleteBundleRequest,
    ) -> Result<DeleteBundleResponse, ProtoKvError> {
        // TODO: run the entry mutations and the bundle delete in one KV
        // transaction once Store exposes cross-descriptor transactions;
        // until then DELETE and DISSOCIATE race with concurrent entry
        // writes.
        let federated = self.fetch_federated_entries(ctx, &req.trust_domain_id)?;
        match req.mode {
            DeleteBundleMode::Restrict => {
                if !federated.is_empty() {
                    return Err(ProtoKvError::FailedPrecondition(format!(
                        "cannot delete bundle; federated with {} registration entries",
                        federated.len()
                    )));
                }
            }
            DeleteBundleMode::Delete => {
                for entry in &federated {
                    self.entry_store.delete(ctx, &entry.encode_to_vec())?;
                }
            }
            DeleteBundleMode::Dissociate => {
                for entry in federated {
                    self.dissociate_entry(ctx, &req.trust_domain_id, entry)?;
                }
            }
        }
        self.delete_bundle(ctx, &req.trust_domain_id)
    }

    fn delete_bundle(
        &self,
        ctx: &OpContext,
        trust_domain_id: &str,
    ) -> Result<DeleteBundleResponse, ProtoKvError> {
        let bundle = Bundle {
            trust_domain_id: trust_domain_id.into(),
            ..Default::default()
        };
        self.store.delete(ctx, &bundle.encode_to_vec())?;
        Ok(DeleteBundleResponse { bundle })
    }

    fn read_bundle(&self, ctx: &OpContext, trust_domain_id: &str) -> Result<Bundle, ProtoKvError> {
        let query = Bundle {
            trust_domain_id: trust_domain_id.into(),
            ..Default::default()
        };
        let value = self.store.read(ctx, &query.encode_to_vec(), false)?;
        Ok(Bundle::decode(value.as_slice())?)
    }

    fn fetch_federated_entries(
        &self,
        ctx: &OpContext,
        trust_domain_id: &str,
    ) -> Result<Vec<RegistrationEntry>, ProtoKvError> {
        let query = RegistrationEntry {
            federates_with: vec![trust_domain_id.into()],
            ..Default::default()
        };
        let (values, _) = self.entry_store.page_index(
            ctx,
            &query.encode_to_vec(),
            &[],
            0,
            &[registration_entry::federates_with_field()],
            &[SetOp::Union],
        )?;
        decode_entries(values)
    }

    fn dissociate_entry(
        &self,
        ctx: &OpContext,
        trust_domain_id: &str,
        mut entry: RegistrationEntry,
    ) -> Result<(), ProtoKvError> {
        let before = entry.federates_with.len();
        entry.federates_with.retain(|td| td != trust_domain_id);
        if entry.federates_with.len() == before {
            // The index query just matched this entry, so the trust domain
            // has to be present; anything else is index corruption.
            return Err(ProtoKvError::Internal(format!(
                "no federated trust domain for bundle in registration entry with entry ID {}",
                entry.entry_id
            )));
        }
        self.entry_store.update(ctx, &entry.encode_to_vec())
    }
}

fn required_bundle(bundle: Option<&Bundle>) -> Result<&Bundle, ProtoKvError> {
    bundle.ok_or_else(|| ProtoKvError::invalid_argument("bundle must be non-nil"))
}

/// Merges `incoming` into `current`, de-duplicating root CAs by DER bytes
/// and JWT keys by (kid, PKIX bytes). Reports whether anything was added.
fn merge_bundles(current: &Bundle, incoming: &Bundle) -> (Bundle, bool) {
    let mut merged = current.clone();
    let mut changed = false;

    let known_cas: HashSet<Vec<u8>> = current
        .root_cas
        .iter()
        .map(|ca| ca.der_bytes.clone())
        .collect();
    for ca in &incoming.root_cas {
        if !known_cas.contains(&ca.der_bytes) {
            merged.root_cas.push(ca.clone());
            changed = true;
        }
    }

    let known_keys: HashSet<(String, Vec<u8>)> = current
        .jwt_signing_keys
        .iter()
        .map(|key| (key.kid.clone(), key.pkix_bytes.clone()))
        .collect();
    for key in &incoming.jwt_signing_keys {
        if !known_keys.contains(&(key.kid.clone(), key.pkix_bytes.clone())) {
            merged.jwt_signing_keys.push(key.clone());
            changed = true;
        }
    }

    (merged, changed)
}

/// Drops bundle elements expiring strictly before the bound, refusing to
/// empty the root-CA set.
fn prune_bundle(current: &Bundle, expires_before: i64) -> Result<(Bundle, bool), ProtoKvError> {
    let mut pruned = current.clone();
    pruned.root_cas.retain(|ca| ca.not_after >= expires_before);
    pruned
        .jwt_signing_keys
        .retain(|key| key.not_after >= expires_before);

    let changed = pruned.root_cas.len() != current.root_cas.len()
        || pruned.jwt_signing_keys.len() != current.jwt_signing_keys.len();
    if !current.root_cas.is_empty() && pruned.root_cas.is_empty() {
        return Err(ProtoKvError::FailedPrecondition(
            "prune failed: would prune all certificates".into(),
        ));
    }
    Ok((pruned, changed))
}
