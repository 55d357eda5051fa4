//! The identity-registration datastore: one handler per persisted message
//! type, all sharing a single primitive-KV backend (and, optionally, a
//! read-only replica for tolerate-stale reads).

pub mod api;
mod attested_node;
mod bundle;
mod join_token;
mod node_selectors;
mod registration_entry;

use crate::config::{DatabaseType, DatastoreConfig};
use crate::context::OpContext;
use crate::error::ProtoKvError;
use crate::kv::mysql::MysqlKv;
use crate::kv::sqlite::SqliteKv;
use crate::kv::{Kv, PoolSettings};
use crate::schema::MessageDescriptor;
use crate::store::Store;
use self::api::*;
use std::sync::Arc;
use tracing::info;

// These constants CANNOT CHANGE in value. They namespace the keys of each
// message type within the shared keyspace.
pub(crate) const BUNDLE_MESSAGE_ID: u32 = 1;
pub(crate) const ATTESTED_NODE_MESSAGE_ID: u32 = 2;
pub(crate) const JOIN_TOKEN_MESSAGE_ID: u32 = 3;
pub(crate) const ENTRY_MESSAGE_ID: u32 = 4;
pub(crate) const NODE_SELECTORS_MESSAGE_ID: u32 = 5;

pub struct DataStore {
    bundles: bundle::Handler,
    attested_nodes: attested_node::Handler,
    join_tokens: join_token::Handler,
    node_selectors: node_selectors::Handler,
    entries: registration_entry::Handler,
}

impl DataStore {
    /// Validates the configuration, opens the backend (plus the read-only
    /// replica when configured), and wires up the per-entity handlers.
    pub fn open(config: &DatastoreConfig) -> Result<Self, ProtoKvError> {
        let database_type = config.validate()?;
        let settings = config.pool_settings()?;
        let kv = open_backend(database_type, &config.connection_string, &settings)?;
        let replica = match &config.ro_connection_string {
            Some(dsn) if !dsn.is_empty() => {
                Some(open_backend(database_type, dsn, &settings)?)
            }
            _ => None,
        };
        info!(
            database_type = config.database_type.as_str(),
            has_replica = replica.is_some(),
            "opened datastore"
        );
        Ok(Self::with_kv(kv, replica))
    }

    /// Builds the datastore over an already-opened backend; used directly
    /// by tests and by embedders that manage their own backends.
    pub fn with_kv(kv: Arc<dyn Kv>, replica: Option<Arc<dyn Kv>>) -> Self {
        let store = |message: MessageDescriptor| {
            let store = Store::new(Arc::clone(&kv), message);
            match &replica {
                Some(ro) => store.with_replica(Arc::clone(ro)),
                None => store,
            }
        };
        Self {
            bundles: bundle::Handler::new(
                store(bundle::message()),
                store(registration_entry::message()),
            ),
            attested_nodes: attested_node::Handler::new(store(attested_node::message())),
            join_tokens: join_token::Handler::new(store(join_token::message())),
            node_selectors: node_selectors::Handler::new(store(node_selectors::message())),
            entries: registration_entry::Handler::new(store(registration_entry::message())),
        }
    }

    pub fn create_bundle(
        &self,
        ctx: &OpContext,
        req: &CreateBundleRequest,
    ) -> Result<CreateBundleResponse, ProtoKvError> {
        self.bundles.create(ctx, req)
    }

    pub fn fetch_bundle(
        &self,
        ctx: &OpContext,
        req: &FetchBundleRequest,
    ) -> Result<FetchBundleResponse, ProtoKvError> {
        self.bundles.fetch(ctx, req)
    }

    pub fn list_bundles(
        &self,
        ctx: &OpContext,
        req: &ListBundlesRequest,
    ) -> Result<ListBundlesResponse, ProtoKvError> {
        self.bundles.list(ctx, req)
    }

    pub fn set_bundle(
        &self,
        ctx: &OpContext,
        req: &SetBundleRequest,
    ) -> Result<SetBundleResponse, ProtoKvError> {
        self.bundles.set(ctx, req)
    }

    pub fn update_bundle(
        &self,
        ctx: &OpContext,
        req: &UpdateBundleRequest,
    ) -> Result<UpdateBundleResponse, ProtoKvError> {
        self.bundles.update(ctx, req)
    }

    pub fn append_bundle(
        &self,
        ctx: &OpContext,
        req: &AppendBundleRequest,
    ) -> Result<AppendBundleResponse, ProtoKvError> {
        self.bundles.append(ctx, req)
    }

    pub fn prune_bundle(
        &self,
        ctx: &OpContext,
        req: &PruneBundleRequest,
    ) -> Result<PruneBundleResponse, ProtoKvError> {
        self.bundles.prune(ctx, req)
    }

    pub fn delete_bundle(
        &self,
        ctx: &OpContext,
        req: &DeleteBundleRequest,
    ) -> Result<DeleteBundleResponse, ProtoKvError> {
        self.bundles.delete(ctx, req)
    }

    pub fn create_attested_node(
        &self,
        ctx: &OpContext,
        req: &CreateAttestedNodeRequest,
    ) -> Result<CreateAttestedNodeResponse, ProtoKvError> {
        self.attested_nodes.create(ctx, req)
    }

    pub fn fetch_attested_node(
        &self,
        ctx: &OpContext,
        req: &FetchAttestedNodeRequest,
    ) -> Result<FetchAttestedNodeResponse, ProtoKvError> {
        self.attested_nodes.fetch(ctx, req)
    }

    pub fn list_attested_nodes(
        &self,
        ctx: &OpContext,
        req: &ListAttestedNodesRequest,
    ) -> Result<ListAttestedNodesResponse, ProtoKvError> {
        self.attested_nodes.list(ctx, req)
    }

    pub fn update_attested_node(
        &self,
        ctx: &OpContext,
        req: &UpdateAttestedNodeRequest,
    ) -> Result<UpdateAttestedNodeResponse, ProtoKvError> {
        self.attested_nodes.update(ctx, req)
    }

    pub fn delete_attested_node(
        &self,
        ctx: &OpContext,
        req: &DeleteAttestedNodeRequest,
    ) -> Result<DeleteAttestedNodeResponse, ProtoKvError> {
        self.attested_nodes.delete(ctx, req)
    }

    pub fn create_join_token(
        &self,
        ctx: &OpContext,
        req: &CreateJoinTokenRequest,
    ) -> Result<CreateJoinTokenResponse, ProtoKvError> {
        self.join_tokens.create(ctx, req)
    }

    pub fn fetch_join_token(
        &self,
        ctx: &OpContext,
        req: &FetchJoinTokenRequest,
    ) -> Result<FetchJoinTokenResponse, ProtoKvError> {
        self.join_tokens.fetch(ctx, req)
    }

    pub fn delete_join_token(
        &self,
        ctx: &OpContext,
        req: &DeleteJoinTokenRequest,
    ) -> Result<DeleteJoinTokenResponse, ProtoKvError> {
        self.join_tokens.delete(ctx, req)
    }

    pub fn prune_join_tokens(
        &self,
        ctx: &OpContext,
        req: &PruneJoinTokensRequest,
    ) -> Result<PruneJoinTokensResponse, ProtoKvError> {
        self.join_tokens.prune(ctx, req)
    }

    pub fn get_node_selectors(
        &self,
        ctx: &OpContext,
        req: &GetNodeSelectorsRequest,
    ) -> Result<GetNodeSelectorsResponse, ProtoKvError> {
        self.node_selectors.get(ctx, req)
    }

    pub fn set_node_selectors(
        &self,
        ctx: &OpContext,
        req: &SetNodeSelectorsRequest,
    ) -> Result<SetNodeSelectorsResponse, ProtoKvError> {
        self.node_selectors.set(ctx, req)
    }

    pub fn create_registration_entry(
        &self,
        ctx: &OpContext,
        req: &CreateRegistrationEntryRequest,
    ) -> Result<CreateRegistrationEntryResponse, ProtoKvError> {
        self.entries.create(ctx, req)
    }

    pub fn fetch_registration_entry(
        &self,
        ctx: &OpContext,
        req: &FetchRegistrationEntryRequest,
    ) -> Result<FetchRegistrationEntryResponse, ProtoKvError> {
        self.entries.fetch(ctx, req)
    }

    pub fn list_registration_entries(
        &self,
        ctx: &OpContext,
        req: &ListRegistrationEntriesRequest,
    ) -> Result<ListRegistrationEntriesResponse, ProtoKvError> {
        self.entries.list(ctx, req)
    }

    pub fn update_registration_entry(
        &self,
        ctx: &OpContext,
        req: &UpdateRegistrationEntryRequest,
    ) -> Result<UpdateRegistrationEntryResponse, ProtoKvError> {
        self.entries.update(ctx, req)
    }

    pub fn delete_registration_entry(
        &self,
        ctx: &OpContext,
        req: &DeleteRegistrationEntryRequest,
    ) -> Result<DeleteRegistrationEntryResponse, ProtoKvError> {
        self.entries.delete(ctx, req)
    }

    pub fn prune_registration_entries(
        &self,
        ctx: &OpContext,
        req: &PruneRegistrationEntriesRequest,
    ) -> Result<PruneRegistrationEntriesResponse, ProtoKvError> {
        self.entries.prune(ctx, req)
    }
}

fn open_backend(
    database_type: DatabaseType,
    connection_string: &str,
    settings: &PoolSettings,
) -> Result<Arc<dyn Kv>, ProtoKvError> {
    Ok(match database_type {
        DatabaseType::Sqlite3 => Arc::new(SqliteKv::open(connection_string, settings)?),
        DatabaseType::Mysql => Arc::new(MysqlKv::open(connection_string, settings)?),
    })
}
