//! Verified chunk access and byte-range reads

use std::sync::Arc;

use tracing::{debug, instrument};

use blobseal_chunks::ChunkLayout;
use blobseal_core::{BlobsealError, BlobsealResult, ChunkIndex, EngineConfig};
use blobseal_crypto::{split_hashes, ChunkCodec, ChunkHashList};
use blobseal_storage::RemoteBlobApi;

use crate::descriptor::{FileDescriptor, SyncParams};
use crate::slice_cache::RemoteSliceCache;

/// Anything that can hand out decrypted chunks of a file.
pub trait ChunkSource {
    fn chunk_size(&self) -> u64;

    fn plain_size(&self) -> u64;

    /// Plaintext of chunk `index`, which must exist.
    fn decrypted_chunk(&mut self, index: ChunkIndex) -> BlobsealResult<&[u8]>;
}

/// Read up to `len` bytes at `pos`, clamped to the file. Touches only the
/// chunks overlapping the range.
pub fn read_range<S: ChunkSource + ?Sized>(
    source: &mut S,
    pos: u64,
    len: u64,
) -> BlobsealResult<Vec<u8>> {
    let size = source.plain_size();
    if len == 0 || pos >= size {
        return Ok(Vec::new());
    }
    let end = pos.saturating_add(len).min(size);
    let chunk_size = source.chunk_size();

    let mut out = Vec::with_capacity((end - pos) as usize);
    for index in pos / chunk_size..=(end - 1) / chunk_size {
        let chunk_start = index * chunk_size;
        let chunk = source.decrypted_chunk(index)?;
        let to = (end - chunk_start).min(chunk.len() as u64) as usize;
        let from = (pos.saturating_sub(chunk_start) as usize).min(to);
        out.extend_from_slice(&chunk[from..to]);
    }
    Ok(out)
}

fn check_sizes(descriptor: &FileDescriptor, layout: &ChunkLayout) -> BlobsealResult<()> {
    let expected = layout.encrypted_file_size(descriptor.plain_size);
    if descriptor.encrypted_size != expected {
        return Err(BlobsealError::FileCorrupted(format!(
            "{}: {} plaintext bytes should encrypt to {expected}, remote reports {}",
            descriptor.file_id, descriptor.plain_size, descriptor.encrypted_size
        )));
    }
    Ok(())
}

fn check_hash_count(
    descriptor: &FileDescriptor,
    layout: &ChunkLayout,
    count: u64,
) -> BlobsealResult<()> {
    let chunks = layout.number_of_chunks(descriptor.plain_size);
    if count != chunks {
        return Err(BlobsealError::FileCorrupted(format!(
            "{}: {count} chunk hashes for {chunks} chunks",
            descriptor.file_id
        )));
    }
    Ok(())
}

/// Fetches, verifies and decrypts chunks of one file, caching the last one.
pub struct ChunkReader {
    remote: Arc<dyn RemoteBlobApi>,
    server_slice_size: u64,
    descriptor: FileDescriptor,
    layout: ChunkLayout,
    codec: ChunkCodec,
    hashes: ChunkHashList,
    slices: RemoteSliceCache,
    cached: Option<(ChunkIndex, Vec<u8>)>,
}

impl ChunkReader {
    /// Download the checksum blob and check it against the descriptor.
    #[instrument(skip_all, fields(file_id = %descriptor.file_id))]
    pub fn open(
        remote: Arc<dyn RemoteBlobApi>,
        descriptor: FileDescriptor,
        config: &EngineConfig,
    ) -> BlobsealResult<Self> {
        let layout = descriptor.layout()?;
        check_sizes(&descriptor, &layout)?;

        let checksums = remote.read_checksums(&descriptor.file_id)?;
        let hashes = ChunkHashList::from_bytes(descriptor.key.clone(), &checksums)?;
        check_hash_count(&descriptor, &layout, hashes.len())?;
        if hashes.top_hash() != descriptor.top_hash {
            return Err(BlobsealError::FileCorrupted(format!(
                "{}: top hash does not match the chunk hash list",
                descriptor.file_id
            )));
        }

        let slices = RemoteSliceCache::new(
            remote.clone(),
            descriptor.file_id.clone(),
            layout,
            config.server_slice_size,
            descriptor.version,
            descriptor.encrypted_size,
        )?;
        debug!(
            plain_size = descriptor.plain_size,
            chunks = hashes.len(),
            version = descriptor.version,
            "opened chunk reader"
        );
        Ok(Self {
            remote,
            server_slice_size: config.server_slice_size,
            codec: ChunkCodec::new(descriptor.key.clone()),
            descriptor,
            layout,
            hashes,
            slices,
            cached: None,
        })
    }

    pub fn descriptor(&self) -> &FileDescriptor {
        &self.descriptor
    }

    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    pub fn hashes(&self) -> &ChunkHashList {
        &self.hashes
    }

    pub fn number_of_chunks(&self) -> u64 {
        self.layout.number_of_chunks(self.descriptor.plain_size)
    }

    /// Verified plaintext of chunk `index`.
    pub fn get_decrypted_chunk(&mut self, index: ChunkIndex) -> BlobsealResult<&[u8]> {
        if !matches!(&self.cached, Some((i, _)) if *i == index) {
            let plaintext = self.decrypt_chunk(index)?;
            self.cached = Some((index, plaintext));
        }
        Ok(self
            .cached
            .as_ref()
            .map(|(_, plaintext)| plaintext.as_slice())
            .unwrap_or_default())
    }

    /// Like [`get_decrypted_chunk`](Self::get_decrypted_chunk), but a chunk
    /// past the end of the file is `None`.
    pub fn try_decrypted_chunk(&mut self, index: ChunkIndex) -> BlobsealResult<Option<&[u8]>> {
        if index >= self.number_of_chunks() {
            return Ok(None);
        }
        self.get_decrypted_chunk(index).map(Some)
    }

    fn decrypt_chunk(&mut self, index: ChunkIndex) -> BlobsealResult<Vec<u8>> {
        let hash = *self.hashes.get(index)?;
        let chunk = self.slices.get_chunk(index)?.ok_or_else(|| {
            BlobsealError::FileCorrupted(format!("chunk {index} missing from remote data"))
        })?;
        let plaintext = self.codec.decrypt(index, chunk, &hash)?;

        let expected = self.layout.plain_chunk_len(index, self.descriptor.plain_size);
        if plaintext.len() as u64 != expected {
            return Err(BlobsealError::FileCorrupted(format!(
                "chunk {index} decrypted to {} bytes, expected {expected}",
                plaintext.len()
            )));
        }
        Ok(plaintext)
    }

    /// Adopt the latest server state of the file.
    #[instrument(skip_all, fields(file_id = %params.descriptor.file_id, version = params.descriptor.version))]
    pub fn sync(&mut self, params: SyncParams) -> BlobsealResult<()> {
        let SyncParams {
            descriptor,
            checksums,
        } = params;
        let layout = descriptor.layout()?;
        check_sizes(&descriptor, &layout)?;
        let hashes = split_hashes(&checksums)?;
        check_hash_count(&descriptor, &layout, hashes.len() as u64)?;

        self.hashes
            .sync(descriptor.key.clone(), descriptor.top_hash, hashes)?;

        if layout == self.layout {
            self.slices
                .sync(descriptor.version, descriptor.encrypted_size);
        } else {
            self.slices = RemoteSliceCache::new(
                self.remote.clone(),
                descriptor.file_id.clone(),
                layout,
                self.server_slice_size,
                descriptor.version,
                descriptor.encrypted_size,
            )?;
            self.layout = layout;
        }
        self.codec = ChunkCodec::new(descriptor.key.clone());
        self.cached = None;
        self.descriptor = descriptor;
        debug!(plain_size = self.descriptor.plain_size, "reader synced");
        Ok(())
    }

    pub(crate) fn codec(&self) -> &ChunkCodec {
        &self.codec
    }

    pub(crate) fn hashes_mut(&mut self) -> &mut ChunkHashList {
        &mut self.hashes
    }

    pub(crate) fn slices_mut(&mut self) -> &mut RemoteSliceCache {
        &mut self.slices
    }

    pub(crate) fn descriptor_mut(&mut self) -> &mut FileDescriptor {
        &mut self.descriptor
    }

    pub(crate) fn drop_cached_chunk(&mut self) {
        self.cached = None;
    }
}

impl ChunkSource for ChunkReader {
    fn chunk_size(&self) -> u64 {
        self.layout.chunk_size()
    }

    fn plain_size(&self) -> u64 {
        self.descriptor.plain_size
    }

    fn decrypted_chunk(&mut self, index: ChunkIndex) -> BlobsealResult<&[u8]> {
        self.get_decrypted_chunk(index)
    }
}

/// Byte-range reads over a [`ChunkReader`].
pub struct RangeReader {
    reader: ChunkReader,
}

impl RangeReader {
    pub fn new(reader: ChunkReader) -> Self {
        Self { reader }
    }

    pub fn size(&self) -> u64 {
        self.reader.plain_size()
    }

    pub fn read(&mut self, pos: u64, len: u64) -> BlobsealResult<Vec<u8>> {
        read_range(&mut self.reader, pos, len)
    }

    pub fn reader(&self) -> &ChunkReader {
        &self.reader
    }

    pub fn sync(&mut self, params: SyncParams) -> BlobsealResult<()> {
        self.reader.sync(params)
    }
}
