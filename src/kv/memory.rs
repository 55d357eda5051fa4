//! In-memory backend: the reference implementation of the primitive-KV
//! contract, used as the oracle in backend-agnostic tests.

use crate::context::OpContext;
use crate::error::ProtoKvError;
use crate::kv::{algebra, Index, Kv, KvOps, Tx};
use crate::schema::keys::prefix_successor;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Clone, Default)]
pub struct MemoryKv {
    inner: Arc<RwLock<Map>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

fn scan_pairs(map: &Map, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let lower = Bound::Included(prefix.to_vec());
    let upper = match prefix_successor(prefix) {
        Some(end) => Bound::Excluded(end),
        None => Bound::Unbounded,
    };
    map.range((lower, upper))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn page_on(
    map: &Map,
    prefix: &[u8],
    token: &[u8],
    limit: usize,
) -> (Vec<Vec<u8>>, Vec<u8>) {
    algebra::page_slice(scan_pairs(map, prefix).into_iter(), token, limit)
}

fn page_index_on(
    map: &Map,
    indices: &[Index],
    token: &[u8],
    limit: usize,
) -> Result<(Vec<Vec<u8>>, Vec<u8>), ProtoKvError> {
    algebra::page_index_scan(
        |prefix| Ok(scan_pairs(map, prefix).into_iter().map(|(k, _)| k).collect()),
        |key| Ok(map.get(key).cloned()),
        indices,
        token,
        limit,
    )
}

impl KvOps for MemoryKv {
    fn get(&self, ctx: &OpContext, key: &[u8]) -> Result<Option<Vec<u8>>, ProtoKvError> {
        ctx.check()?;
        Ok(self.inner.read().get(key).cloned())
    }

    fn put(&self, ctx: &OpContext, key: &[u8], value: &[u8]) -> Result<(), ProtoKvError> {
        ctx.check()?;
        self.inner.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, ctx: &OpContext, key: &[u8]) -> Result<bool, ProtoKvError> {
        ctx.check()?;
        Ok(self.inner.write().remove(key).is_some())
    }

    fn page(
        &self,
        ctx: &OpContext,
        prefix: &[u8],
        token: &[u8],
        limit: usize,
    ) -> Result<(Vec<Vec<u8>>, Vec<u8>), ProtoKvError> {
        ctx.check()?;
        Ok(page_on(&self.inner.read(), prefix, token, limit))
    }

    fn page_index(
        &self,
        ctx: &OpContext,
        indices: &[Index],
        token: &[u8],
        limit: usize,
    ) -> Result<(Vec<Vec<u8>>, Vec<u8>), ProtoKvError> {
        ctx.check()?;
        page_index_on(&self.inner.read(), indices, token, limit)
    }
}

impl Kv for MemoryKv {
    fn begin<'a>(&'a self, ctx: &OpContext) -> Result<Box<dyn Tx + 'a>, ProtoKvError> {
        ctx.check()?;
        Ok(Box::new(MemoryTx {
            base: Arc::clone(&self.inner),
            // None marks a delete pending commit.
            overlay: Mutex::new(BTreeMap::new()),
        }))
    }
}

/// Buffered transaction: writes land in an overlay that reads merge over
/// the base map, then apply atomically under the write lock at commit.
struct MemoryTx {
    base: Arc<RwLock<Map>>,
    overlay: Mutex<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl MemoryTx {
    fn merged(&self, prefix: &[u8]) -> Map {
        let mut view: Map = scan_pairs(&self.base.read(), prefix).into_iter().collect();
        for (key, value) in self.overlay.lock().iter() {
            if !key.starts_with(prefix) {
                continue;
            }
            match value {
                Some(v) => {
                    view.insert(key.clone(), v.clone());
                }
                None => {
                    view.remove(key);
                }
            }
        }
        view
    }
}

impl KvOps for MemoryTx {
    fn get(&self, ctx: &OpContext, key: &[u8]) -> Result<Option<Vec<u8>>, ProtoKvError> {
        ctx.check()?;
        if let Some(pending) = self.overlay.lock().get(key) {
            return Ok(pending.clone());
        }
        Ok(self.base.read().get(key).cloned())
    }

    fn put(&self, ctx: &OpContext, key: &[u8], value: &[u8]) -> Result<(), ProtoKvError> {
        ctx.check()?;
        self.overlay
            .lock()
            .insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&self, ctx: &OpContext, key: &[u8]) -> Result<bool, ProtoKvError> {
        ctx.check()?;
        let existed = match self.overlay.lock().get(key) {
            Some(pending) => pending.is_some(),
            None => self.base.read().contains_key(key),
        };
        self.overlay.lock().insert(key.to_vec(), None);
        Ok(existed)
    }

    fn page(
        &self,
        ctx: &OpContext,
        prefix: &[u8],
        token: &[u8],
        limit: usize,
    ) -> Result<(Vec<Vec<u8>>, Vec<u8>), ProtoKvError> {
        ctx.check()?;
        Ok(page_on(&self.merged(prefix), prefix, token, limit))
    }

    fn page_index(
        &self,
        ctx: &OpContext,
        indices: &[Index],
        token: &[u8],
        limit: usize,
    ) -> Result<(Vec<Vec<u8>>, Vec<u8>), ProtoKvError> {
        ctx.check()?;
        page_index_on(&self.merged(&[]), indices, token, limit)
    }
}

impl Tx for MemoryTx {
    fn commit(self: Box<Self>) -> Result<(), ProtoKvError> {
        let mut base = self.base.write();
        for (key, value) in self.overlay.lock().iter() {
            match value {
                Some(v) => {
                    base.insert(key.clone(), v.clone());
                }
                None => {
                    base.remove(key);
                }
            }
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), ProtoKvError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryKv;
    use crate::context::OpContext;
    use crate::kv::{Kv, KvOps};

    fn ctx() -> OpContext {
        OpContext::background()
    }

    #[test]
    fn get_put_delete_roundtrip() {
        let kv = MemoryKv::new();
        assert_eq!(kv.get(&ctx(), b"k").expect("get"), None);
        kv.put(&ctx(), b"k", b"v1").expect("put");
        assert_eq!(kv.get(&ctx(), b"k").expect("get"), Some(b"v1".to_vec()));
        kv.put(&ctx(), b"k", b"v2").expect("overwrite");
        assert_eq!(kv.get(&ctx(), b"k").expect("get"), Some(b"v2".to_vec()));
        assert!(kv.delete(&ctx(), b"k").expect("delete"));
        assert!(!kv.delete(&ctx(), b"k").expect("second delete"));
    }

    #[test]
    fn page_scans_prefix_in_order() {
        let kv = MemoryKv::new();
        kv.put(&ctx(), b"a/3", b"3").expect("put");
        kv.put(&ctx(), b"a/1", b"1").expect("put");
        kv.put(&ctx(), b"a/2", b"2").expect("put");
        kv.put(&ctx(), b"b/1", b"x").expect("put");

        let (values, token) = kv.page(&ctx(), b"a/", &[], 0).expect("page");
        assert_eq!(values, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
        assert!(token.is_empty());

        let (values, token) = kv.page(&ctx(), b"a/", &[], 2).expect("page");
        assert_eq!(values.len(), 2);
        assert_eq!(token, b"a/2".to_vec());
        let (values, token) = kv.page(&ctx(), b"a/", &token, 2).expect("page");
        assert_eq!(values, vec![b"3".to_vec()]);
        assert!(token.is_empty());
    }

    #[test]
    fn exactly_full_final_page_takes_one_extra_round_trip() {
        let kv = MemoryKv::new();
        kv.put(&ctx(), b"p/1", b"1").expect("put");
        kv.put(&ctx(), b"p/2", b"2").expect("put");

        let (values, token) = kv.page(&ctx(), b"p/", &[], 2).expect("page");
        assert_eq!(values.len(), 2);
        assert!(!token.is_empty());
        let (values, token) = kv.page(&ctx(), b"p/", &token, 2).expect("page");
        assert!(values.is_empty());
        assert!(token.is_empty());
    }

    #[test]
    fn tx_reads_observe_own_writes_before_commit() {
        let kv = MemoryKv::new();
        kv.put(&ctx(), b"k1", b"old").expect("put");

        let tx = kv.begin(&ctx()).expect("begin");
        tx.put(&ctx(), b"k1", b"new").expect("tx put");
        tx.put(&ctx(), b"k2", b"fresh").expect("tx put");
        tx.delete(&ctx(), b"k1").expect("tx delete");

        assert_eq!(tx.get(&ctx(), b"k1").expect("tx get"), None);
        assert_eq!(tx.get(&ctx(), b"k2").expect("tx get"), Some(b"fresh".to_vec()));
        // Other handles still see the old state.
        assert_eq!(kv.get(&ctx(), b"k1").expect("get"), Some(b"old".to_vec()));
        assert_eq!(kv.get(&ctx(), b"k2").expect("get"), None);

        tx.commit().expect("commit");
        assert_eq!(kv.get(&ctx(), b"k1").expect("get"), None);
        assert_eq!(kv.get(&ctx(), b"k2").expect("get"), Some(b"fresh".to_vec()));
    }

    #[test]
    fn tx_page_merges_pending_writes() {
        let kv = MemoryKv::new();
        kv.put(&ctx(), b"p/1", b"1").expect("put");
        kv.put(&ctx(), b"p/2", b"2").expect("put");

        let tx = kv.begin(&ctx()).expect("begin");
        tx.delete(&ctx(), b"p/1").expect("tx delete");
        tx.put(&ctx(), b"p/3", b"3").expect("tx put");

        let (values, _) = tx.page(&ctx(), b"p/", &[], 0).expect("tx page");
        assert_eq!(values, vec![b"2".to_vec(), b"3".to_vec()]);
    }

    #[test]
    fn rollback_discards_everything() {
        let kv = MemoryKv::new();
        let tx = kv.begin(&ctx()).expect("begin");
        tx.put(&ctx(), b"k", b"v").expect("tx put");
        tx.rollback().expect("rollback");
        assert!(kv.is_empty());
    }
}
