use std::collections::HashSet;

use serde::Serialize;
use tracing::debug;

use crate::existence::ExistenceSet;
use crate::record::{KeyProjection, Record};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeltaItem {
    pub key: String,
    pub record: Record,
}

/// Records not yet represented remotely, in input order, each with its key.
///
/// Records with a blank identity are dropped, as are repeats of a key already
/// emitted earlier in the same input.
pub fn compute_delta(
    records: impl IntoIterator<Item = Record>,
    projection: &KeyProjection,
    existing: &ExistenceSet,
) -> Vec<DeltaItem> {
    let mut emitted = HashSet::new();
    let mut delta = Vec::new();
    let (mut blank, mut known, mut repeated) = (0usize, 0usize, 0usize);

    for record in records {
        let Some(key) = projection.key_for(&record) else {
            blank += 1;
            continue;
        };
        if existing.contains(&key) {
            known += 1;
            continue;
        }
        if !emitted.insert(key.clone()) {
            repeated += 1;
            continue;
        }
        delta.push(DeltaItem { key, record });
    }

    debug!(
        pending = delta.len(),
        existing = known,
        blank,
        repeated,
        "computed {} delta",
        projection.kind().plural()
    );
    delta
}
