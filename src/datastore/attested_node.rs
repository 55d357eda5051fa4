//! Attested-node operations.

use crate::context::OpContext;
use crate::datastore::api::{
    page_params, page_response, CreateAttestedNodeRequest, CreateAttestedNodeResponse,
    DeleteAttestedNodeRequest, DeleteAttestedNodeResponse, FetchAttestedNodeRequest,
    FetchAttestedNodeResponse, ListAttestedNodesRequest, ListAttestedNodesResponse,
    UpdateAttestedNodeRequest, UpdateAttestedNodeResponse,
};
use crate::datastore::ATTESTED_NODE_MESSAGE_ID;
use crate::error::ProtoKvError;
use crate::proto::AttestedNode;
use crate::schema::{Field, MessageDescriptor};
use crate::store::Store;
use prost::Message;

const SPIFFE_ID_TAG: u32 = 1;

pub(crate) fn message() -> MessageDescriptor {
    MessageDescriptor::new(
        ATTESTED_NODE_MESSAGE_ID,
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

    pub(crate) fn create(
        &self,
        ctx: &OpContext,
        req: &CreateAttestedNodeRequest,
    ) -> Result<CreateAttestedNodeResponse, ProtoKvError> {
        let node = req
            .node
            .as_ref()
            .ok_or_else(|| ProtoKvError::invalid_argument("node must be non-nil"))?;
        self.store.create(ctx, &node.encode_to_vec())?;
        Ok(CreateAttestedNodeResponse { node: node.clone() })
    }

    pub(crate) fn fetch(
        &self,
        ctx: &OpContext,
        req: &FetchAttestedNodeRequest,
    ) -> Result<FetchAttestedNodeResponse, ProtoKvError> {
        match self.read_by_id(ctx, &req.spiffe_id) {
            Ok(node) => Ok(FetchAttestedNodeResponse { node: Some(node) }),
            // Absent nodes fetch as an empty response to stay compatible
            // with the SQL plugin's behavior.
            Err(err) if err.is_not_found() => Ok(FetchAttestedNodeResponse::default()),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn list(
        &self,
        ctx: &OpContext,
        req: &ListAttestedNodesRequest,
    ) -> Result<ListAttestedNodesResponse, ProtoKvError> {
        if req.by_expires_before.is_some() {
            return Err(ProtoKvError::Unimplemented("by-expires-before support"));
        }
        let (token, limit) = page_params(req.pagination.as_ref())?;
        let (values, next_token) = self.store.page(ctx, &token, limit)?;
        let mut nodes = Vec::with_capacity(values.len());
        for value in values {
            nodes.push(AttestedNode::decode(value.as_slice())?);
        }
        Ok(ListAttestedNodesResponse {
            nodes,
            pagination: page_response(req.pagination.as_ref(), &next_token),
        })
    }

    pub(crate) fn update(
        &self,
        ctx: &OpContext,
        req: &UpdateAttestedNodeRequest,
    ) -> Result<UpdateAttestedNodeResponse, ProtoKvError> {
        let mut node = self.read_by_id(ctx, &req.spiffe_id)?;
        node.cert_serial_number = req.cert_serial_number.clone();
        node.cert_not_after = req.cert_not_after;
        node.new_cert_serial_number = req.new_cert_serial_number.clone();
        node.new_cert_not_after = req.new_cert_not_after;
        self.store.update(ctx, &node.encode_to_vec())?;
        Ok(UpdateAttestedNodeResponse { node })
    }

    pub(crate) fn delete(
        &self,
        ctx: &OpContext,
        req: &DeleteAttestedNodeRequest,
    ) -> Result<DeleteAttestedNodeResponse, ProtoKvError> {
        let node = self.read_by_id(ctx, &req.spiffe_id)?;
        self.store.delete(ctx, &node.encode_to_vec())?;
        Ok(DeleteAttestedNodeResponse { node })
    }

    fn read_by_id(&self, ctx: &OpContext, spiffe_id: &str) -> Result<AttestedNode, ProtoKvError> {
        let query = AttestedNode {
            spiffe_id: spiffe_id.into(),
            ..Default::default()
        };
        let value = self.store.read(ctx, &query.encode_to_vec(), false)?;
        Ok(AttestedNode::decode(value.as_slice())?)
    }
}
