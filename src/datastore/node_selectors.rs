//! Node-selector operations.

use crate::context::OpContext;
use crate::datastore::api::{
    GetNodeSelectorsRequest, GetNodeSelectorsResponse, SetNodeSelectorsRequest,
    SetNodeSelectorsResponse,
};
use crate::datastore::NODE_SELECTORS_MESSAGE_ID;
use crate::error::ProtoKvError;
use crate::proto::NodeSelectors;
use crate::schema::{Field, MessageDescriptor};
use crate::store::Store;
use prost::Message;

const SPIFFE_ID_TAG: u32 = 1;

pub(crate) fn message() -> MessageDescriptor {
    MessageDescriptor::new(
        NODE_SELECTORS_MESSAGE_ID,
        Field::string(SPIFFE_ID_TAG),
        Vec::new(),
    )
}

pub(crate) struct Handler {
    store: Store,
}

impl Handler {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    pub(crate) fn get(
        &self,
        ctx: &OpContext,
        req: &GetNodeSelectorsRequest,
    ) -> Result<GetNodeSelectorsResponse, ProtoKvError> {
        let query = NodeSelectors {
            spiffe_id: req.spiffe_id.clone(),
            ..Default::default()
        };
        match self
            .store
            .read(ctx, &query.encode_to_vec(), req.tolerate_stale)
        {
            Ok(value) => Ok(GetNodeSelectorsResponse {
                selectors: NodeSelectors::decode(value.as_slice())?,
            }),
            // An unknown id reads as an empty selector list, matching the
            // SQL plugin.
            Err(err) if err.is_not_found() => Ok(GetNodeSelectorsResponse {
                selectors: NodeSelectors {
                    spiffe_id: req.spiffe_id.clone(),
                    selectors: Vec::new(),
                },
            }),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn set(
        &self,
        ctx: &OpContext,
        req: &SetNodeSelectorsRequest,
    ) -> Result<SetNodeSelectorsResponse, ProtoKvError> {
        let selectors = req
            .selectors
            .as_ref()
            .ok_or_else(|| ProtoKvError::invalid_argument("selectors must be non-nil"))?;
        self.store.upsert(ctx, &selectors.encode_to_vec())?;
        Ok(SetNodeSelectorsResponse {})
    }
}
