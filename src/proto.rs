//! Wire messages for the five persisted entity types.
//!
//! Field tags participate in key encoding and are frozen forever; see the
//! descriptors in `datastore`. Structs are hand-written rather than
//! generated so the tags stay visible next to the code that keys on them.

use prost::Message;

/// A trust-anchor element: an X.509 root certificate plus its expiry,
/// carried explicitly so pruning never has to parse DER.
#[derive(Clone, PartialEq, Message)]
pub struct X509Certificate {
    #[prost(bytes = "vec", tag = "1")]
    pub der_bytes: Vec<u8>,
    #[prost(int64, tag = "2")]
    pub not_after: i64,
}

/// A JWT signing key published in a bundle.
#[derive(Clone, PartialEq, Message)]
pub struct JwtSigningKey {
    #[prost(bytes = "vec", tag = "1")]
    pub pkix_bytes: Vec<u8>,
    #[prost(string, tag = "2")]
    pub kid: String,
    #[prost(int64, tag = "3")]
    pub not_after: i64,
}

/// Trust anchors owned by one trust domain.
#[derive(Clone, PartialEq, Message)]
pub struct Bundle {
    #[prost(string, tag = "1")]
    pub trust_domain_id: String,
    #[prost(message, repeated, tag = "2")]
    pub root_cas: Vec<X509Certificate>,
    #[prost(message, repeated, tag = "3")]
    pub jwt_signing_keys: Vec<JwtSigningKey>,
    #[prost(int64, tag = "4")]
    pub refresh_hint: i64,
}

/// A node that has completed attestation.
#[derive(Clone, PartialEq, Message)]
pub struct AttestedNode {
    #[prost(string, tag = "1")]
    pub spiffe_id: String,
    #[prost(string, tag = "2")]
    pub attestation_data_type: String,
    #[prost(string, tag = "3")]
    pub cert_serial_number: String,
    #[prost(int64, tag = "4")]
    pub cert_not_after: i64,
    #[prost(string, tag = "5")]
    pub new_cert_serial_number: String,
    #[prost(int64, tag = "6")]
    pub new_cert_not_after: i64,
}

/// A single-use agent join token.
#[derive(Clone, PartialEq, Message)]
pub struct JoinToken {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(int64, tag = "2")]
    pub expiry: i64,
}

/// A typed key/value pair describing one observed node or workload
/// property.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Message)]
pub struct Selector {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

/// Selectors attached to an attested node.
#[derive(Clone, PartialEq, Message)]
pub struct NodeSelectors {
    #[prost(string, tag = "1")]
    pub spiffe_id: String,
    #[prost(message, repeated, tag = "2")]
    pub selectors: Vec<Selector>,
}

/// A workload registration: the identity to issue, who may request it, and
/// which trust domains it federates with.
#[derive(Clone, PartialEq, Message)]
pub struct RegistrationEntry {
    #[prost(message, repeated, tag = "1")]
    pub selectors: Vec<Selector>,
    #[prost(string, tag = "2")]
    pub parent_id: String,
    #[prost(string, tag = "3")]
    pub spiffe_id: String,
    #[prost(int32, tag = "4")]
    pub ttl: i32,
    #[prost(string, repeated, tag = "5")]
    pub federates_with: Vec<String>,
    #[prost(string, tag = "6")]
    pub entry_id: String,
    #[prost(bool, tag = "7")]
    pub admin: bool,
    #[prost(bool, tag = "8")]
    pub downstream: bool,
    #[prost(int64, tag = "9")]
    pub entry_expiry: i64,
    #[prost(string, repeated, tag = "10")]
    pub dns_names: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::{RegistrationEntry, Selector};
    use prost::Message;

    #[test]
    fn entry_roundtrips_through_the_wire() {
        let entry = RegistrationEntry {
            selectors: vec![Selector {
                r#type: "unix".into(),
                value: "uid:100".into(),
            }],
            parent_id: "spiffe://example.org/agent".into(),
            spiffe_id: "spiffe://example.org/workload".into(),
            ttl: 3600,
            federates_with: vec!["spiffe://other.org".into()],
            entry_id: "11111111-2222-4333-8444-555555555555".into(),
            admin: true,
            downstream: false,
            entry_expiry: 1_700_000_000,
            dns_names: vec!["svc.example.org".into()],
        };
        let decoded =
            RegistrationEntry::decode(entry.encode_to_vec().as_slice()).expect("decode");
        assert_eq!(decoded, entry);
    }
}
