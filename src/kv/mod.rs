//! Primitive key-value contract: a sorted byte-string map with prefix
//! scans, set-algebra index paging, and scoped transactions.

pub(crate) mod algebra;
pub mod memory;
pub mod mysql;
pub mod sqlite;

use crate::context::OpContext;
use crate::error::ProtoKvError;
use std::time::Duration;
use tracing::warn;

/// Connection-pool knobs shared by the SQL backends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_open_conns: Option<u32>,
    pub max_idle_conns: Option<u32>,
    pub conn_max_lifetime: Option<Duration>,
}

/// Algebra applied when combining per-index candidate sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetOp {
    #[default]
    Intersect,
    Union,
}

/// One index scan: per-prefix candidate sets of recovered primary keys,
/// folded together with `set_op` (union = any prefix matches, intersect =
/// every prefix matches), then combined into the running result with the
/// same `set_op`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub prefixes: Vec<Vec<u8>>,
    pub set_op: SetOp,
}

/// Operations shared by a backend and its transactions.
pub trait KvOps {
    fn get(&self, ctx: &OpContext, key: &[u8]) -> Result<Option<Vec<u8>>, ProtoKvError>;

    /// Overwrite-semantic insert.
    fn put(&self, ctx: &OpContext, key: &[u8], value: &[u8]) -> Result<(), ProtoKvError>;

    /// Returns whether the key existed.
    fn delete(&self, ctx: &OpContext, key: &[u8]) -> Result<bool, ProtoKvError>;

    /// Up to `limit` values (0 = unbounded) for keys beginning with
    /// `prefix`, ascending, strictly after `token` when non-empty. The
    /// returned token is empty once the scan is exhausted; a full page at a
    /// non-zero limit returns the last key as the resumption token.
    fn page(
        &self,
        ctx: &OpContext,
        prefix: &[u8],
        token: &[u8],
        limit: usize,
    ) -> Result<(Vec<Vec<u8>>, Vec<u8>), ProtoKvError>;

    /// Values of primary records selected by combining the given index
    /// scans left-to-right, ordered and paginated by primary-key bytes.
    fn page_index(
        &self,
        ctx: &OpContext,
        indices: &[Index],
        token: &[u8],
        limit: usize,
    ) -> Result<(Vec<Vec<u8>>, Vec<u8>), ProtoKvError>;
}

/// A backend handle, shareable across threads.
pub trait Kv: KvOps + Send + Sync {
    fn begin<'a>(&'a self, ctx: &OpContext) -> Result<Box<dyn Tx + 'a>, ProtoKvError>;
}

/// A transactional view over the same operations. Writes become visible to
/// reads within the transaction immediately and to other handles only at
/// commit.
pub trait Tx: KvOps {
    fn commit(self: Box<Self>) -> Result<(), ProtoKvError>;
    fn rollback(self: Box<Self>) -> Result<(), ProtoKvError>;
}

/// Runs `f` inside a transaction, committing on success and rolling back on
/// error or cancellation. No exit path leaves the transaction open;
/// backends additionally roll back on drop as a backstop.
pub fn with_tx<T, F>(kv: &dyn Kv, ctx: &OpContext, f: F) -> Result<T, ProtoKvError>
where
    F: FnOnce(&dyn Tx) -> Result<T, ProtoKvError>,
{
    ctx.check()?;
    let tx = kv.begin(ctx)?;
    match f(&*tx) {
        Ok(value) => match ctx.check() {
            Ok(()) => {
                tx.commit()?;
                Ok(value)
            }
            Err(cancelled) => {
                rollback_quietly(tx);
                Err(cancelled)
            }
        },
        Err(err) => {
            rollback_quietly(tx);
            Err(err)
        }
    }
}

fn rollback_quietly(tx: Box<dyn Tx + '_>) {
    if let Err(err) = tx.rollback() {
        warn!(error = %err, "transaction rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryKv;
    use super::{with_tx, KvOps, SetOp};
    use crate::context::OpContext;
    use crate::error::ProtoKvError;

    #[test]
    fn set_op_defaults_to_intersect() {
        assert_eq!(SetOp::default(), SetOp::Intersect);
    }

    #[test]
    fn with_tx_commits_on_success() {
        let kv = MemoryKv::new();
        let ctx = OpContext::background();
        with_tx(&kv, &ctx, |tx| {
            tx.put(&ctx, b"a", b"1")?;
            tx.put(&ctx, b"b", b"2")
        })
        .expect("tx");
        assert_eq!(kv.get(&ctx, b"a").expect("get"), Some(b"1".to_vec()));
        assert_eq!(kv.get(&ctx, b"b").expect("get"), Some(b"2".to_vec()));
    }

    #[test]
    fn with_tx_rolls_back_on_error() {
        let kv = MemoryKv::new();
        let ctx = OpContext::background();
        let err = with_tx(&kv, &ctx, |tx| {
            tx.put(&ctx, b"a", b"1")?;
            Err::<(), _>(ProtoKvError::Internal("boom".into()))
        })
        .expect_err("tx must fail");
        assert_eq!(err.code_str(), "internal");
        assert_eq!(kv.get(&ctx, b"a").expect("get"), None);
    }

    #[test]
    fn with_tx_rolls_back_when_cancelled_before_commit() {
        let kv = MemoryKv::new();
        let (ctx, handle) = OpContext::cancellable();
        let err = with_tx(&kv, &ctx, |tx| {
            tx.put(&ctx, b"a", b"1")?;
            handle.cancel();
            Ok(())
        })
        .expect_err("cancelled");
        assert!(matches!(err, ProtoKvError::Cancelled));
        assert_eq!(
            kv.get(&OpContext::background(), b"a").expect("get"),
            None
        );
    }

    #[test]
    fn cancelled_context_never_begins() {
        let kv = MemoryKv::new();
        let (ctx, handle) = OpContext::cancellable();
        handle.cancel();
        let err = with_tx(&kv, &ctx, |_tx| Ok(())).expect_err("cancelled");
        assert!(matches!(err, ProtoKvError::Cancelled));
    }
}
