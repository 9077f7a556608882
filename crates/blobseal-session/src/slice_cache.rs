//! Chunk access at server-slice granularity
//!
//! The remote is read in slices of `aligned_slice_size` bytes, the configured
//! slice size rounded up to whole encrypted chunks, so a chunk never straddles
//! two slices. Only the most recently fetched slice is kept. Local writes
//! splice their new chunk bytes into it instead of forcing a refetch.

use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, warn};

use blobseal_chunks::ChunkLayout;
use blobseal_core::{BlobsealError, BlobsealResult, ChunkIndex, FileId, Version};
use blobseal_storage::RemoteBlobApi;

#[derive(Debug, Clone)]
struct CachedSlice {
    index: u64,
    /// Offset of `data[0]` in the encrypted file
    start: u64,
    data: Vec<u8>,
}

impl CachedSlice {
    fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }
}

pub struct RemoteSliceCache {
    remote: Arc<dyn RemoteBlobApi>,
    file_id: FileId,
    layout: ChunkLayout,
    aligned_slice_size: u64,
    version: Version,
    encrypted_size: u64,
    slice: Option<CachedSlice>,
}

impl RemoteSliceCache {
    pub fn new(
        remote: Arc<dyn RemoteBlobApi>,
        file_id: FileId,
        layout: ChunkLayout,
        server_slice_size: u64,
        version: Version,
        encrypted_size: u64,
    ) -> BlobsealResult<Self> {
        let chunk = layout.encrypted_chunk_size();
        if server_slice_size < chunk {
            return Err(BlobsealError::Config(format!(
                "server slice size {server_slice_size} is smaller than one encrypted chunk ({chunk})"
            )));
        }
        Ok(Self {
            remote,
            file_id,
            layout,
            aligned_slice_size: server_slice_size.div_ceil(chunk) * chunk,
            version,
            encrypted_size,
            slice: None,
        })
    }

    pub fn aligned_slice_size(&self) -> u64 {
        self.aligned_slice_size
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn encrypted_size(&self) -> u64 {
        self.encrypted_size
    }

    /// Index of the slice currently held, if any.
    pub fn cached_slice_index(&self) -> Option<u64> {
        self.slice.as_ref().map(|s| s.index)
    }

    fn slice_index(&self, offset: u64) -> u64 {
        offset / self.aligned_slice_size
    }

    /// Encrypted bytes of chunk `index`, or `None` past the end of the file.
    pub fn get_chunk(&mut self, index: ChunkIndex) -> BlobsealResult<Option<&[u8]>> {
        let offset = self.layout.encrypted_offset(index);
        if offset >= self.encrypted_size {
            return Ok(None);
        }
        let slice_index = self.slice_index(offset);
        if self.cached_slice_index() != Some(slice_index) {
            self.fetch(slice_index)?;
        }

        let Some(slice) = self.slice.as_ref() else {
            return Ok(None);
        };
        let from = (offset - slice.start) as usize;
        let to = (from as u64 + self.layout.encrypted_chunk_size()).min(slice.data.len() as u64);
        if from >= slice.data.len() {
            return Err(BlobsealError::FileCorrupted(format!(
                "chunk {index} lies outside the fetched slice"
            )));
        }
        Ok(Some(&slice.data[from..to as usize]))
    }

    fn fetch(&mut self, slice_index: u64) -> BlobsealResult<()> {
        self.slice = None;
        let start = slice_index * self.aligned_slice_size;
        let end = (start + self.aligned_slice_size).min(self.encrypted_size);
        let read = self
            .remote
            .read_range(&self.file_id, start..end, self.version)?;
        if read.version != self.version {
            warn!(
                file_id = %self.file_id,
                expected = self.version,
                actual = read.version,
                "remote file changed under the session"
            );
            return Err(BlobsealError::VersionConflict {
                file_id: self.file_id.clone(),
                expected: self.version,
                actual: read.version,
            });
        }
        if read.data.len() as u64 != end - start {
            return Err(BlobsealError::FileCorrupted(format!(
                "slice {slice_index}: expected {} bytes, remote returned {}",
                end - start,
                read.data.len()
            )));
        }
        debug!(file_id = %self.file_id, slice = slice_index, bytes = read.data.len(), "fetched slice");
        self.slice = Some(CachedSlice {
            index: slice_index,
            start,
            data: read.data,
        });
        Ok(())
    }

    /// Record a committed rewrite of chunk `index`.
    ///
    /// If the chunk belongs to the cached slice the new bytes are spliced in
    /// place; with `truncate`, everything after them is dropped. A version
    /// going backwards, or a chunk the slice cannot absorb, drops the cache.
    pub fn update(
        &mut self,
        new_version: Version,
        index: ChunkIndex,
        new_bytes: &[u8],
        new_encrypted_size: u64,
        truncate: bool,
    ) {
        if new_version < self.version {
            warn!(
                file_id = %self.file_id,
                cached = self.version,
                update = new_version,
                "stale slice update, dropping cache"
            );
            self.slice = None;
            return;
        }
        self.version = new_version;
        self.encrypted_size = new_encrypted_size;

        let offset = self.layout.encrypted_offset(index);
        let slice_index = self.slice_index(offset);
        let chunk_size = self.layout.encrypted_chunk_size();
        let Some(slice) = self.slice.as_mut() else {
            return;
        };

        if slice.index != slice_index {
            if truncate && slice.start > offset {
                self.slice = None;
            }
            return;
        }

        let rel = (offset - slice.start) as usize;
        if rel > slice.data.len() {
            self.slice = None;
            return;
        }
        let old_len = (slice.data.len() - rel).min(chunk_size as usize);
        let tail = if truncate {
            Vec::new()
        } else {
            slice.data[rel + old_len..].to_vec()
        };
        slice.data.truncate(rel);
        slice.data.extend_from_slice(new_bytes);
        slice.data.extend_from_slice(&tail);
        if slice.end() > new_encrypted_size {
            let keep = new_encrypted_size.saturating_sub(slice.start) as usize;
            slice.data.truncate(keep);
        }
    }

    /// Drop the cached slice if it overlaps the encrypted byte `range`.
    pub fn invalidate(&mut self, range: Range<u64>) {
        let overlaps = self
            .slice
            .as_ref()
            .is_some_and(|s| range.start < s.end().max(s.start + 1) && s.start < range.end);
        if overlaps {
            self.slice = None;
        }
    }

    pub fn invalidate_all(&mut self) {
        self.slice = None;
    }

    /// Adopt a new server state; the cached slice is discarded.
    pub fn sync(&mut self, version: Version, encrypted_size: u64) {
        self.version = version;
        self.encrypted_size = encrypted_size;
        self.slice = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobseal_storage::{FileMeta, MemoryRemote};

    /// 8-byte chunks encrypt to 64 bytes; a 100-byte slice rounds up to 128.
    fn setup(chunks: u64) -> (Arc<MemoryRemote>, FileId, RemoteSliceCache) {
        let remote = Arc::new(MemoryRemote::new());
        let data: Vec<u8> = (0..chunks * 64).map(|i| (i / 64) as u8).collect();
        let size = data.len() as u64;
        let id = remote.insert_file(
            FileMeta {
                plain_size: chunks * 8,
                encrypted_size: size,
                chunk_size: 8,
                top_hash: [0u8; 32],
                key_id: "k".into(),
            },
            data,
            vec![],
        );
        let cache = RemoteSliceCache::new(
            remote.clone(),
            id.clone(),
            ChunkLayout::new(8).unwrap(),
            100,
            1,
            size,
        )
        .unwrap();
        (remote, id, cache)
    }

    #[test]
    fn test_slice_size_rounded_to_chunks() {
        let (_, _, cache) = setup(1);
        assert_eq!(cache.aligned_slice_size(), 128);
    }

    #[test]
    fn test_slice_smaller_than_chunk_rejected() {
        let remote: Arc<dyn RemoteBlobApi> = Arc::new(MemoryRemote::new());
        let err = RemoteSliceCache::new(
            remote,
            FileId::from("x"),
            ChunkLayout::new(8).unwrap(),
            63,
            1,
            0,
        )
        .err()
        .unwrap();
        assert!(matches!(err, BlobsealError::Config(_)));
    }

    #[test]
    fn test_neighbouring_chunks_share_a_fetch() {
        let (remote, _, mut cache) = setup(5);

        assert_eq!(cache.get_chunk(0).unwrap().unwrap(), &[0u8; 64][..]);
        assert_eq!(cache.get_chunk(1).unwrap().unwrap(), &[1u8; 64][..]);
        assert_eq!(remote.stats().range_reads, 1);

        assert_eq!(cache.get_chunk(4).unwrap().unwrap(), &[4u8; 64][..]);
        assert_eq!(cache.cached_slice_index(), Some(2));
        assert_eq!(remote.stats().range_reads, 2);

        assert!(cache.get_chunk(5).unwrap().is_none());
    }

    #[test]
    fn test_version_change_detected() {
        let (remote, id, mut cache) = setup(2);
        remote.bump_version(&id);
        let err = cache.get_chunk(0).unwrap_err();
        assert!(matches!(
            err,
            BlobsealError::VersionConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_update_splices_without_refetch() {
        let (remote, _, mut cache) = setup(2);
        cache.get_chunk(0).unwrap();

        cache.update(2, 1, &[9u8; 64], 128, false);
        assert_eq!(cache.get_chunk(1).unwrap().unwrap(), &[9u8; 64][..]);
        assert_eq!(cache.get_chunk(0).unwrap().unwrap(), &[0u8; 64][..]);
        assert_eq!(remote.stats().range_reads, 1);
        assert_eq!(cache.version(), 2);
    }

    #[test]
    fn test_update_appends_to_short_slice() {
        let (remote, _, mut cache) = setup(1);
        cache.get_chunk(0).unwrap();

        cache.update(2, 1, &[7u8; 48], 112, false);
        assert_eq!(cache.get_chunk(1).unwrap().unwrap(), &[7u8; 48][..]);
        assert_eq!(remote.stats().range_reads, 1);
    }

    #[test]
    fn test_update_with_truncate_drops_tail() {
        let (_, _, mut cache) = setup(2);
        cache.get_chunk(0).unwrap();

        cache.update(2, 0, &[5u8; 32], 32, true);
        assert_eq!(cache.get_chunk(0).unwrap().unwrap(), &[5u8; 32][..]);
        assert!(cache.get_chunk(1).unwrap().is_none());
    }

    #[test]
    fn test_truncation_before_slice_drops_it() {
        let (_, _, mut cache) = setup(5);
        cache.get_chunk(3).unwrap();
        assert_eq!(cache.cached_slice_index(), Some(1));

        cache.update(2, 1, &[1u8; 64], 128, true);
        assert_eq!(cache.cached_slice_index(), None);
    }

    #[test]
    fn test_backwards_update_drops_cache() {
        let (_, _, mut cache) = setup(2);
        cache.get_chunk(0).unwrap();
        cache.update(0, 0, &[1u8; 64], 128, false);
        assert_eq!(cache.cached_slice_index(), None);
        assert_eq!(cache.version(), 1);
    }

    #[test]
    fn test_invalidate_range() {
        let (_, _, mut cache) = setup(5);
        cache.get_chunk(0).unwrap();

        cache.invalidate(128..256);
        assert_eq!(cache.cached_slice_index(), Some(0));
        cache.invalidate(100..130);
        assert_eq!(cache.cached_slice_index(), None);

        cache.get_chunk(0).unwrap();
        cache.invalidate_all();
        assert_eq!(cache.cached_slice_index(), None);
    }

    #[test]
    fn test_sync_adopts_new_state() {
        let (remote, id, mut cache) = setup(2);
        cache.get_chunk(0).unwrap();
        let version = remote.bump_version(&id).unwrap();

        cache.sync(version, 128);
        assert_eq!(cache.cached_slice_index(), None);
        assert!(cache.get_chunk(1).unwrap().is_some());
    }
}
