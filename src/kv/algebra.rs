//! Candidate-set algebra shared by every backend's `PageIndex`.
//!
//! Backends supply two primitives: an ordered key scan per prefix and a
//! point lookup. Everything else (suffix recovery, per-index prefix
//! folding, left-to-right combination, resumable slicing over primary-key
//! order) lives here so the semantics cannot drift between backends.

use crate::error::ProtoKvError;
use crate::kv::{Index, SetOp};
use crate::schema::keys;
use std::collections::BTreeSet;
use tracing::warn;

/// Computes one page of primary-record values for the given index scans.
///
/// `scan_keys` must return every key beginning with the prefix, ascending;
/// `get` is a point lookup. Candidates whose primary record has vanished
/// (possible only through replica lag) are skipped with a warning.
pub(crate) fn page_index_scan<S, G>(
    scan_keys: S,
    get: G,
    indices: &[Index],
    token: &[u8],
    limit: usize,
) -> Result<(Vec<Vec<u8>>, Vec<u8>), ProtoKvError>
where
    S: Fn(&[u8]) -> Result<Vec<Vec<u8>>, ProtoKvError>,
    G: Fn(&[u8]) -> Result<Option<Vec<u8>>, ProtoKvError>,
{
    if indices.is_empty() {
        return Err(ProtoKvError::invalid_argument(
            "page-index query needs at least one index",
        ));
    }
    for index in indices {
        if index.prefixes.is_empty() {
            return Err(ProtoKvError::invalid_argument(
                "index query carries no prefixes",
            ));
        }
    }
    let primary_prefix = keys::primary_prefix_from_index_prefix(&indices[0].prefixes[0])?;

    // An index's own set operation applies twice: across its prefixes
    // (union = "any element matches", intersect = "every element matches")
    // and then when its candidate set joins the running result.
    let mut sets = Vec::with_capacity(indices.len());
    for index in indices {
        let mut per_prefix = Vec::with_capacity(index.prefixes.len());
        for prefix in &index.prefixes {
            let mut set = BTreeSet::new();
            for key in scan_keys(prefix)? {
                let mut pk = primary_prefix.clone();
                pk.extend_from_slice(&key[prefix.len()..]);
                set.insert(pk);
            }
            per_prefix.push((set, index.set_op));
        }
        sets.push((combine(per_prefix), index.set_op));
    }

    let candidates = combine(sets);
    let mut values = Vec::new();
    let mut next_token = Vec::new();
    for pk in candidates {
        if !token.is_empty() && pk.as_slice() <= token {
            continue;
        }
        match get(&pk)? {
            Some(value) => values.push(value),
            None => {
                warn!("index candidate has no primary record; skipping");
                continue;
            }
        }
        if limit != 0 && values.len() == limit {
            next_token = pk;
            break;
        }
    }
    Ok((values, next_token))
}

/// Folds per-index candidate sets left-to-right; the first set seeds the
/// result and each later set is applied with its own operation.
pub(crate) fn combine(sets: Vec<(BTreeSet<Vec<u8>>, SetOp)>) -> BTreeSet<Vec<u8>> {
    let mut iter = sets.into_iter();
    let Some((first, _)) = iter.next() else {
        return BTreeSet::new();
    };
    iter.fold(first, |acc, (set, op)| match op {
        SetOp::Union => acc.union(&set).cloned().collect(),
        SetOp::Intersect => acc.intersection(&set).cloned().collect(),
    })
}

/// Slices one page out of an ordered (key, value) scan, applying the
/// strictly-after-token rule and the full-page token convention.
pub(crate) fn page_slice(
    pairs: impl Iterator<Item = (Vec<u8>, Vec<u8>)>,
    token: &[u8],
    limit: usize,
) -> (Vec<Vec<u8>>, Vec<u8>) {
    let mut values = Vec::new();
    let mut next_token = Vec::new();
    for (key, value) in pairs {
        if !token.is_empty() && key.as_slice() <= token {
            continue;
        }
        values.push(value);
        if limit != 0 && values.len() == limit {
            next_token = key;
            break;
        }
    }
    (values, next_token)
}
