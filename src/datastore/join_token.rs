//! Join-token operations.

use crate::context::OpContext;
use crate::datastore::api::{
    CreateJoinTokenRequest, CreateJoinTokenResponse, DeleteJoinTokenRequest,
    DeleteJoinTokenResponse, FetchJoinTokenRequest, FetchJoinTokenResponse,
    PruneJoinTokensRequest, PruneJoinTokensResponse,
};
use crate::datastore::JOIN_TOKEN_MESSAGE_ID;
use crate::error::ProtoKvError;
use crate::proto::JoinToken;
use crate::schema::{Field, MessageDescriptor};
use crate::store::Store;
use prost::Message;
use tracing::{info, warn};

const TOKEN_TAG: u32 = 1;

pub(crate) fn message() -> MessageDescriptor {
    MessageDescriptor::new(JOIN_TOKEN_MESSAGE_ID, Field::string(TOKEN_TAG), Vec::new())
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
        req: &CreateJoinTokenRequest,
    ) -> Result<CreateJoinTokenResponse, ProtoKvError> {
        let join_token = req
            .join_token
            .as_ref()
            .filter(|jt| !jt.token.is_empty())
            .ok_or_else(|| ProtoKvError::invalid_argument("token is required"))?;
        if join_token.expiry <= 0 {
            return Err(ProtoKvError::invalid_argument("expiry is required"));
        }
        self.store.create(ctx, &join_token.encode_to_vec())?;
        Ok(CreateJoinTokenResponse {
            join_token: join_token.clone(),
        })
    }

    pub(crate) fn fetch(
        &self,
        ctx: &OpContext,
        req: &FetchJoinTokenRequest,
    ) -> Result<FetchJoinTokenResponse, ProtoKvError> {
        // Token fetches sit on the hot attestation path; a stale read from
        // a replica is acceptable here.
        match self.read_by_token(ctx, &req.token, true) {
            Ok(join_token) => Ok(FetchJoinTokenResponse {
                join_token: Some(join_token),
            }),
            Err(err) if err.is_not_found() => Ok(FetchJoinTokenResponse::default()),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn delete(
        &self,
        ctx: &OpContext,
        req: &DeleteJoinTokenRequest,
    ) -> Result<DeleteJoinTokenResponse, ProtoKvError> {
        let join_token = self.read_by_token(ctx, &req.token, false)?;
        self.store.delete(ctx, &join_token.encode_to_vec())?;
        Ok(DeleteJoinTokenResponse { join_token })
    }

    pub(crate) fn prune(
        &self,
        ctx: &OpContext,
        req: &PruneJoinTokensRequest,
    ) -> Result<PruneJoinTokensResponse, ProtoKvError> {
        let (values, _) = self.store.page(ctx, &[], 0)?;
        let mut failures = 0usize;
        let mut pruned = 0usize;
        for value in values {
            let join_token = JoinToken::decode(value.as_slice())?;
            if join_token.expiry >= req.expires_before {
                continue;
            }
            match self.store.delete(ctx, &value) {
                Ok(()) => pruned += 1,
                Err(err) => {
                    warn!(error = %err, "failed to prune join token");
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            return Err(ProtoKvError::Internal(format!(
                "failed to prune {failures} join tokens"
            )));
        }
        if pruned > 0 {
            info!(count = pruned, "pruned expired join tokens");
        }
        Ok(PruneJoinTokensResponse {})
    }

    fn read_by_token(
        &self,
        ctx: &OpContext,
        token: &str,
        tolerate_stale: bool,
    ) -> Result<JoinToken, ProtoKvError> {
        let query = JoinToken {
            token: token.into(),
            ..Default::default()
        };
        let value = self.store.read(ctx, &query.encode_to_vec(), tolerate_stale)?;
        Ok(JoinToken::decode(value.as_slice())?)
    }
}
