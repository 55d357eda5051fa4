//! Store invariants exercised against the SQLite backend: every list on an
//! indexed field reflects exactly the live records, reads are
//! byte-faithful, and failed writes leave no partial state.

use prost::Message;
use protokv::kv::{PoolSettings, SetOp};
use protokv::kv::sqlite::SqliteKv;
use protokv::schema::{Field, MessageDescriptor};
use protokv::{OpContext, Store};
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

#[derive(Clone, PartialEq, Message)]
struct Workload {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(string, tag = "2")]
    owner: String,
    #[prost(string, repeated, tag = "3")]
    tags: Vec<String>,
    #[prost(int32, tag = "4")]
    weight: i32,
}

fn descriptor() -> MessageDescriptor {
    MessageDescriptor::new(
        21,
        Field::string(1),
        vec![
            Field::string(2),
            Field::repeated_set(Field::string(3)),
            Field::int32(4),
        ],
    )
}

fn workload(id: &str, owner: &str, tags: &[&str], weight: i32) -> Workload {
    Workload {
        id: id.into(),
        owner: owner.into(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        weight,
    }
}

fn open_store(dir: &TempDir) -> Store {
    let path = dir.path().join("store.sqlite3");
    let kv = SqliteKv::open(path.to_str().expect("utf-8 path"), &PoolSettings::default())
        .expect("open sqlite");
    Store::new(Arc::new(kv), descriptor())
}

fn ctx() -> OpContext {
    OpContext::background()
}

fn by_owner(store: &Store, owner: &str) -> BTreeSet<String> {
    let query = Workload {
        owner: owner.into(),
        ..Default::default()
    };
    let (values, _) = store
        .page_index(
            &ctx(),
            &query.encode_to_vec(),
            &[],
            0,
            &[Field::string(2)],
            &[SetOp::default()],
        )
        .expect("query by owner");
    values
        .iter()
        .map(|v| Workload::decode(v.as_slice()).expect("decode").id)
        .collect()
}

fn by_tag(store: &Store, tag: &str) -> BTreeSet<String> {
    let query = Workload {
        tags: vec![tag.into()],
        ..Default::default()
    };
    let (values, _) = store
        .page_index(
            &ctx(),
            &query.encode_to_vec(),
            &[],
            0,
            &[Field::repeated_set(Field::string(3))],
            &[SetOp::Union],
        )
        .expect("query by tag");
    values
        .iter()
        .map(|v| Workload::decode(v.as_slice()).expect("decode").id)
        .collect()
}

fn ids(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[test]
fn reads_are_byte_faithful() {
    let dir = tempdir().expect("temp");
    let store = open_store(&dir);
    let value = workload("w1", "alice", &["prod", "web"], 3).encode_to_vec();
    store.create(&ctx(), &value).expect("create");
    let query = workload("w1", "", &[], 0).encode_to_vec();
    assert_eq!(store.read(&ctx(), &query, false).expect("read"), value);
}

#[test]
fn index_listings_track_every_mutation() {
    let dir = tempdir().expect("temp");
    let store = open_store(&dir);
    let ctx = ctx();

    store
        .create(&ctx, &workload("w1", "alice", &["prod"], 1).encode_to_vec())
        .expect("create w1");
    store
        .create(&ctx, &workload("w2", "alice", &["dev"], 2).encode_to_vec())
        .expect("create w2");
    store
        .create(&ctx, &workload("w3", "bob", &["prod"], 3).encode_to_vec())
        .expect("create w3");

    assert_eq!(by_owner(&store, "alice"), ids(&["w1", "w2"]));
    assert_eq!(by_owner(&store, "bob"), ids(&["w3"]));
    assert_eq!(by_tag(&store, "prod"), ids(&["w1", "w3"]));

    // Update moves w2 between owners and retags it.
    store
        .update(&ctx, &workload("w2", "bob", &["prod"], 2).encode_to_vec())
        .expect("update w2");
    assert_eq!(by_owner(&store, "alice"), ids(&["w1"]));
    assert_eq!(by_owner(&store, "bob"), ids(&["w2", "w3"]));
    assert_eq!(by_tag(&store, "dev"), ids(&[]));
    assert_eq!(by_tag(&store, "prod"), ids(&["w1", "w2", "w3"]));

    // Upsert of a new record behaves as create.
    store
        .upsert(&ctx, &workload("w4", "alice", &["dev"], 4).encode_to_vec())
        .expect("upsert w4");
    assert_eq!(by_owner(&store, "alice"), ids(&["w1", "w4"]));

    // Delete drops the record from every index listing.
    store
        .delete(&ctx, &workload("w1", "", &[], 0).encode_to_vec())
        .expect("delete w1");
    assert_eq!(by_owner(&store, "alice"), ids(&["w4"]));
    assert_eq!(by_tag(&store, "prod"), ids(&["w2", "w3"]));
}

#[test]
fn repeated_upsert_is_idempotent() {
    let dir = tempdir().expect("temp");
    let store = open_store(&dir);
    let value = workload("w1", "alice", &["prod", "web"], 3).encode_to_vec();
    for _ in 0..3 {
        store.upsert(&ctx(), &value).expect("upsert");
    }
    assert_eq!(
        store
            .read(&ctx(), &workload("w1", "", &[], 0).encode_to_vec(), false)
            .expect("read"),
        value
    );
    assert_eq!(by_owner(&store, "alice"), ids(&["w1"]));
    assert_eq!(by_tag(&store, "prod"), ids(&["w1"]));
}

#[test]
fn failed_create_leaves_no_partial_state() {
    let dir = tempdir().expect("temp");
    let store = open_store(&dir);
    store
        .create(&ctx(), &workload("w1", "alice", &["prod"], 1).encode_to_vec())
        .expect("create");
    let err = store
        .create(&ctx(), &workload("w1", "mallory", &["evil"], 9).encode_to_vec())
        .expect_err("duplicate");
    assert_eq!(err.code_str(), "already_exists");
    // The losing write contributed nothing: no owner move, no new tag.
    assert_eq!(by_owner(&store, "mallory"), ids(&[]));
    assert_eq!(by_tag(&store, "evil"), ids(&[]));
    assert_eq!(by_owner(&store, "alice"), ids(&["w1"]));
}

#[test]
fn multi_field_queries_combine_in_caller_order() {
    let dir = tempdir().expect("temp");
    let store = open_store(&dir);
    let ctx = ctx();
    store
        .create(&ctx, &workload("w1", "alice", &["prod", "web"], 1).encode_to_vec())
        .expect("create");
    store
        .create(&ctx, &workload("w2", "alice", &["batch"], 2).encode_to_vec())
        .expect("create");
    store
        .create(&ctx, &workload("w3", "bob", &["web"], 3).encode_to_vec())
        .expect("create");

    // (tag ∈ {web, batch}) ∩ (owner = alice)
    let query = Workload {
        owner: "alice".into(),
        tags: vec!["web".into(), "batch".into()],
        ..Default::default()
    };
    let (values, _) = store
        .page_index(
            &ctx,
            &query.encode_to_vec(),
            &[],
            0,
            &[Field::repeated_set(Field::string(3)), Field::string(2)],
            &[SetOp::Union, SetOp::Intersect],
        )
        .expect("combined query");
    let got: BTreeSet<String> = values
        .iter()
        .map(|v| Workload::decode(v.as_slice()).expect("decode").id)
        .collect();
    assert_eq!(got, ids(&["w1", "w2"]));
}

#[test]
fn int32_index_supports_signed_values() {
    let dir = tempdir().expect("temp");
    let store = open_store(&dir);
    let ctx = ctx();
    store
        .create(&ctx, &workload("w1", "alice", &[], -5).encode_to_vec())
        .expect("create");
    store
        .create(&ctx, &workload("w2", "alice", &[], 7).encode_to_vec())
        .expect("create");

    let query = Workload {
        weight: -5,
        ..Default::default()
    };
    let (values, _) = store
        .page_index(
            &ctx,
            &query.encode_to_vec(),
            &[],
            0,
            &[Field::int32(4)],
            &[SetOp::default()],
        )
        .expect("query by weight");
    assert_eq!(values.len(), 1);
    assert_eq!(
        Workload::decode(values[0].as_slice()).expect("decode").id,
        "w1"
    );
}
