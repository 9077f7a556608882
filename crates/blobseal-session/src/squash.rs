//! Merging per-chunk patches into fewer remote operations

use blobseal_storage::{FilePatch, Patch};

fn adjacent(prev: &Patch, next: &Patch) -> bool {
    !prev.truncate && prev.end() == next.pos
}

/// A merged patch and the number of input patches folded into it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Squashed {
    pub patch: FilePatch,
    pub parts: usize,
}

/// Merge neighbouring patches whose data and checksum ranges both continue
/// one another, as long as the merged data stays within `max_operation_size`.
/// Input order is kept, so the `parts` counts partition the input.
///
/// A truncating patch ends a run: only the patch after which the file ends
/// may carry the flag.
pub fn squash(patches: Vec<FilePatch>, max_operation_size: u64) -> Vec<Squashed> {
    let mut merged: Vec<Squashed> = Vec::with_capacity(patches.len());
    for patch in patches {
        if let Some(Squashed { patch: last, parts }) = merged.last_mut() {
            let size = (last.data.data.len() + patch.data.data.len()) as u64;
            if size <= max_operation_size
                && adjacent(&last.data, &patch.data)
                && adjacent(&last.checksums, &patch.checksums)
            {
                last.data.data.extend_from_slice(&patch.data.data);
                last.data.truncate = patch.data.truncate;
                last.checksums.data.extend_from_slice(&patch.checksums.data);
                last.checksums.truncate = patch.checksums.truncate;
                *parts += 1;
                continue;
            }
        }
        merged.push(Squashed { patch, parts: 1 });
    }
    merged
}
