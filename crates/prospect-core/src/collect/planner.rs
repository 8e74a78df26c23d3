//! Batch planning: platform grouping and chunking.

use std::collections::HashMap;

use crate::error::CollectError;

use super::types::{Batch, Platform, WorkItem};

/// Partition work items into platform-homogeneous batches.
///
/// Groups preserve first-seen platform ordering, each group is chunked into
/// contiguous slices of at most `batch_size` items, and `batch_index`
/// increases globally across all groups. No item is dropped here.
pub fn plan_batches(items: Vec<WorkItem>, batch_size: usize) -> Result<Vec<Batch>, CollectError> {
    if items.is_empty() {
        return Err(CollectError::NoBatches);
    }
    let batch_size = batch_size.max(1);

    let mut order: Vec<Platform> = Vec::new();
    let mut groups: HashMap<Platform, Vec<WorkItem>> = HashMap::new();
    for item in items {
        if !groups.contains_key(&item.platform) {
            order.push(item.platform);
        }
        groups.entry(item.platform).or_default().push(item);
    }

    let mut batches = Vec::new();
    let mut batch_index = 0;
    for platform in order {
        let group = groups.remove(&platform).unwrap_or_default();
        for chunk in group.chunks(batch_size) {
            batches.push(Batch {
                batch_index,
                platform,
                items: chunk.to_vec(),
            });
            batch_index += 1;
        }
    }
    Ok(batches)
}
