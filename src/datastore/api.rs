//! Request/response types for the datastore surface, plus the pagination
//! token transport encoding shared by every handler.

use crate::error::ProtoKvError;
use crate::proto::{AttestedNode, Bundle, JoinToken, NodeSelectors, RegistrationEntry, Selector};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Page request/response cursor. An empty token means "from the beginning"
/// on requests and "exhausted" on responses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pagination {
    pub page_size: i32,
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateBundleRequest {
    pub bundle: Option<Bundle>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateBundleResponse {
    pub bundle: Bundle,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchBundleRequest {
    pub trust_domain_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchBundleResponse {
    pub bundle: Option<Bundle>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListBundlesRequest {
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListBundlesResponse {
    pub bundles: Vec<Bundle>,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetBundleRequest {
    pub bundle: Option<Bundle>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetBundleResponse {
    pub bundle: Bundle,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateBundleRequest {
    pub bundle: Option<Bundle>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateBundleResponse {
    pub bundle: Bundle,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppendBundleRequest {
    pub bundle: Option<Bundle>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppendBundleResponse {
    pub bundle: Bundle,
    pub bundle_changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneBundleRequest {
    pub trust_domain_id: String,
    /// Elements whose `not_after` is strictly below this bound are removed.
    pub expires_before: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneBundleResponse {
    pub bundle_changed: bool,
}

/// Policy applied to registration entries that federate with a bundle
/// being deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeleteBundleMode {
    /// Refuse the delete while federated entries exist.
    #[default]
    Restrict,
    /// Delete the federated entries along with the bundle.
    Delete,
    /// Strip the trust domain from each entry's federates-with set.
    Dissociate,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteBundleRequest {
    pub trust_domain_id: String,
    pub mode: DeleteBundleMode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteBundleResponse {
    pub bundle: Bundle,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateAttestedNodeRequest {
    pub node: Option<AttestedNode>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateAttestedNodeResponse {
    pub node: AttestedNode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchAttestedNodeRequest {
    pub spiffe_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchAttestedNodeResponse {
    pub node: Option<AttestedNode>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListAttestedNodesRequest {
    pub by_expires_before: Option<i64>,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListAttestedNodesResponse {
    pub nodes: Vec<AttestedNode>,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateAttestedNodeRequest {
    pub spiffe_id: String,
    pub cert_serial_number: String,
    pub cert_not_after: i64,
    pub new_cert_serial_number: String,
    pub new_cert_not_after: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateAttestedNodeResponse {
    pub node: AttestedNode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteAttestedNodeRequest {
    pub spiffe_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteAttestedNodeResponse {
    pub node: AttestedNode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateJoinTokenRequest {
    pub join_token: Option<JoinToken>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateJoinTokenResponse {
    pub join_token: JoinToken,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchJoinTokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchJoinTokenResponse {
    pub join_token: Option<JoinToken>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteJoinTokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteJoinTokenResponse {
    pub join_token: JoinToken,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneJoinTokensRequest {
    /// Tokens whose expiry is strictly below this bound are removed.
    pub expires_before: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneJoinTokensResponse {}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetNodeSelectorsRequest {
    pub spiffe_id: String,
    /// Serve the read from a configured read-only replica, accepting
    /// eventual consistency with prior writes.
    pub tolerate_stale: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetNodeSelectorsResponse {
    pub selectors: NodeSelectors,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetNodeSelectorsRequest {
    pub selectors: Option<NodeSelectors>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetNodeSelectorsResponse {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectorMatch {
    /// Entries whose selector set equals the queried set.
    #[default]
    Exact,
    /// Entries whose selector set is contained in the queried set.
    Subset,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BySelectors {
    pub selectors: Vec<Selector>,
    pub match_behavior: SelectorMatch,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateRegistrationEntryRequest {
    pub entry: Option<RegistrationEntry>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateRegistrationEntryResponse {
    pub entry: RegistrationEntry,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchRegistrationEntryRequest {
    pub entry_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchRegistrationEntryResponse {
    pub entry: Option<RegistrationEntry>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListRegistrationEntriesRequest {
    pub by_selectors: Option<BySelectors>,
    pub by_parent_id: Option<String>,
    pub by_spiffe_id: Option<String>,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListRegistrationEntriesResponse {
    pub entries: Vec<RegistrationEntry>,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateRegistrationEntryRequest {
    pub entry: Option<RegistrationEntry>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateRegistrationEntryResponse {
    pub entry: RegistrationEntry,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteRegistrationEntryRequest {
    pub entry_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteRegistrationEntryResponse {
    pub entry: RegistrationEntry,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneRegistrationEntriesRequest {
    /// Entries whose `entry_expiry` is strictly below this bound are removed.
    pub expires_before: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneRegistrationEntriesResponse {}

pub(crate) fn encode_pagination_token(raw: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(raw)
}

pub(crate) fn decode_pagination_token(token: &str) -> Result<Vec<u8>, ProtoKvError> {
    URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| ProtoKvError::invalid_argument(format!("invalid pagination token: {token}")))
}

/// Resolves a request's pagination into the raw `(token, limit)` pair the
/// store takes. No pagination means an unbounded scan.
pub(crate) fn page_params(
    pagination: Option<&Pagination>,
) -> Result<(Vec<u8>, usize), ProtoKvError> {
    match pagination {
        None => Ok((Vec::new(), 0)),
        Some(p) => {
            if p.page_size <= 0 {
                return Err(ProtoKvError::invalid_argument(format!(
                    "cannot paginate with pagesize = {}",
                    p.page_size
                )));
            }
            let token = if p.token.is_empty() {
                Vec::new()
            } else {
                decode_pagination_token(&p.token)?
            };
            Ok((token, p.page_size as usize))
        }
    }
}

/// Builds the response-side pagination, echoing the request's page size and
/// carrying the (possibly exhausted) continuation token.
pub(crate) fn page_response(
    requested: Option<&Pagination>,
    next_token: &[u8],
) -> Option<Pagination> {
    requested.map(|p| Pagination {
        page_size: p.page_size,
        token: encode_pagination_token(next_token),
    })
}
