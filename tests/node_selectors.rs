use protokv::datastore::api::{GetNodeSelectorsRequest, SetNodeSelectorsRequest};
use protokv::proto::{NodeSelectors, Selector};
use protokv::{DataStore, DatastoreConfig, OpContext};
use tempfile::{tempdir, TempDir};

fn open_datastore(dir: &TempDir) -> DataStore {
    let config = DatastoreConfig {
        database_type: "sqlite3".into(),
        connection_string: dir
            .path()
            .join("datastore.sqlite3")
            .to_str()
            .expect("utf-8 path")
            .into(),
        ..Default::default()
    };
    DataStore::open(&config).expect("open datastore")
}

fn ctx() -> OpContext {
    OpContext::background()
}

fn selector(selector_type: &str, value: &str) -> Selector {
    Selector {
        r#type: selector_type.into(),
        value: value.into(),
    }
}

fn set(ds: &DataStore, spiffe_id: &str, selectors: Vec<Selector>) {
    ds.set_node_selectors(
        &ctx(),
        &SetNodeSelectorsRequest {
            selectors: Some(NodeSelectors {
                spiffe_id: spiffe_id.into(),
                selectors,
            }),
        },
    )
    .expect("set node selectors");
}

fn get(ds: &DataStore, spiffe_id: &str) -> NodeSelectors {
    ds.get_node_selectors(&ctx(), &GetNodeSelectorsRequest {
        spiffe_id: spiffe_id.into(),
        tolerate_stale: false,
    })
    .expect("get node selectors")
    .selectors
}

#[test]
fn set_and_get_are_per_spiffe_id() {
    let dir = tempdir().expect("temp");
    let ds = open_datastore(&dir);

    set(&ds, "foo", vec![selector("FOO1", "1")]);
    set(&ds, "bar", vec![selector("BAR", "FIGHT")]);

    assert_eq!(get(&ds, "foo").selectors, vec![selector("FOO1", "1")]);
    assert_eq!(get(&ds, "bar").selectors, vec![selector("BAR", "FIGHT")]);

    // Set is an upsert; re-setting replaces the list.
    set(&ds, "foo", vec![selector("FOO2", "1")]);
    assert_eq!(get(&ds, "foo").selectors, vec![selector("FOO2", "1")]);

    // Clearing by setting an empty list reads back as empty, not an error.
    set(&ds, "foo", Vec::new());
    assert!(get(&ds, "foo").selectors.is_empty());
    assert_eq!(get(&ds, "bar").selectors, vec![selector("BAR", "FIGHT")]);
}

#[test]
fn get_of_unknown_id_returns_empty_selector_list() {
    let dir = tempdir().expect("temp");
    let ds = open_datastore(&dir);
    let got = get(&ds, "never-set");
    assert_eq!(got.spiffe_id, "never-set");
    assert!(got.selectors.is_empty());
}

#[test]
fn set_requires_selectors_message() {
    let dir = tempdir().expect("temp");
    let ds = open_datastore(&dir);
    let err = ds
        .set_node_selectors(&ctx(), &SetNodeSelectorsRequest { selectors: None })
        .expect_err("nil selectors");
    assert_eq!(err.code_str(), "invalid_argument");
}
