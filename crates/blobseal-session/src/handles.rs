//! User-facing session handles and the registry that owns them
//!
//! Every open file is addressed by a numeric [`HandleId`]. The registry maps
//! ids to handles of one of three kinds and hands out access only through a
//! validated lookup that also checks the kind. Each handle sits behind its
//! own mutex, so the registry lock is never held while a handle works.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use blobseal_chunks::ChunkBuffer;
use blobseal_core::{BlobsealError, BlobsealResult, EngineConfig, FileId, HandleId};
use blobseal_crypto::EncryptionKey;
use blobseal_storage::{RemoteBlobApi, UploadApi};

use crate::descriptor::{FileDescriptor, SyncParams};
use crate::random_write::RandomWriteEngine;
use crate::reader::{ChunkReader, RangeReader};
use crate::upload::{UploadReceipt, UploadSession};

/// Identity of an open file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    pub id: HandleId,
    pub container: String,
    /// Unset for an upload that has not been committed yet
    pub file_id: Option<FileId>,
    pub size: u64,
}

/// Sequential reads from a cursor, plus positioned reads.
pub struct ReadHandle {
    file: FileHandle,
    reader: RangeReader,
    pos: u64,
}

impl ReadHandle {
    pub fn file(&self) -> &FileHandle {
        &self.file
    }

    pub fn size(&self) -> u64 {
        self.reader.size()
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn seek(&mut self, pos: u64) -> BlobsealResult<()> {
        let size = self.size();
        if pos >= size {
            return Err(BlobsealError::PosOutOfBounds { pos, size });
        }
        self.pos = pos;
        Ok(())
    }

    /// Read up to `len` bytes from the cursor and advance it.
    pub fn read(&mut self, len: u64) -> BlobsealResult<Vec<u8>> {
        let data = self.reader.read(self.pos, len)?;
        self.pos += data.len() as u64;
        Ok(data)
    }

    pub fn read_at(&mut self, pos: u64, len: u64) -> BlobsealResult<Vec<u8>> {
        self.reader.read(pos, len)
    }

    pub fn sync(&mut self, params: SyncParams) -> BlobsealResult<()> {
        self.reader.sync(params)?;
        self.file.size = self.reader.size();
        self.pos = self.pos.min(self.file.size);
        Ok(())
    }
}

/// Streaming upload of a new file of known size.
pub struct WriteHandle {
    file: FileHandle,
    buffer: ChunkBuffer,
    session: UploadSession,
}

impl WriteHandle {
    pub fn file(&self) -> &FileHandle {
        &self.file
    }

    /// Buffer `bytes`, pushing every completed chunk to the upload.
    pub fn write(&mut self, bytes: &[u8]) -> BlobsealResult<()> {
        self.buffer.write(bytes)?;
        for i in 0..self.buffer.number_of_full_chunks() {
            if let Some(chunk) = self.buffer.full_chunk(i) {
                self.session.send_chunk(chunk)?;
            }
        }
        self.buffer.free_full_chunks();
        Ok(())
    }

    pub fn is_ready_to_finalize(&self) -> bool {
        self.buffer.is_fully_filled()
    }

    pub fn finalize(&mut self) -> BlobsealResult<UploadReceipt> {
        if !self.buffer.is_fully_filled() {
            return Err(BlobsealError::DataSmallerThanDeclared {
                declared: self.file.size,
                written: self.buffer.total_written(),
            });
        }
        let last = self.buffer.read_chunk();
        let receipt = self.session.finalize(&last)?;
        self.file.file_id = Some(receipt.file_id.clone());
        Ok(receipt)
    }
}

/// Random-access reads and writes on an existing file.
pub struct RandomWriteHandle {
    file: FileHandle,
    engine: RandomWriteEngine,
}

impl RandomWriteHandle {
    pub fn file(&self) -> &FileHandle {
        &self.file
    }

    pub fn engine(&self) -> &RandomWriteEngine {
        &self.engine
    }

    pub fn size(&self) -> u64 {
        self.engine.descriptor().plain_size
    }

    pub fn write(&mut self, offset: u64, data: &[u8], truncate: bool) -> BlobsealResult<()> {
        let result = self.engine.write(offset, data, truncate);
        self.file.size = self.size();
        result
    }

    pub fn read(&mut self, offset: u64, len: u64) -> BlobsealResult<Vec<u8>> {
        self.engine.read(offset, len)
    }

    pub fn sync(&mut self, params: SyncParams) -> BlobsealResult<()> {
        self.engine.sync(params)?;
        self.file.size = self.size();
        Ok(())
    }
}

enum Handle {
    Read(ReadHandle),
    Write(WriteHandle),
    RandomWrite(RandomWriteHandle),
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    free_ids: BTreeSet<u64>,
    handles: HashMap<HandleId, Arc<Mutex<Handle>>>,
}

impl RegistryInner {
    fn allocate(&mut self) -> HandleId {
        match self.free_ids.pop_first() {
            Some(id) => HandleId(id),
            None => {
                self.next_id += 1;
                HandleId(self.next_id)
            }
        }
    }
}

/// Thread-safe map from handle ids to open handles of one container.
pub struct HandleRegistry {
    remote: Arc<dyn RemoteBlobApi>,
    uploads: Arc<dyn UploadApi>,
    config: EngineConfig,
    container: String,
    inner: Mutex<RegistryInner>,
}

impl HandleRegistry {
    pub fn new(
        remote: Arc<dyn RemoteBlobApi>,
        uploads: Arc<dyn UploadApi>,
        config: EngineConfig,
        container: impl Into<String>,
    ) -> BlobsealResult<Self> {
        config.validate()?;
        Ok(Self {
            remote,
            uploads,
            config,
            container: container.into(),
            inner: Mutex::new(RegistryInner::default()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(
        &self,
        make: impl FnOnce(FileHandle) -> Handle,
        file_id: Option<FileId>,
        size: u64,
    ) -> HandleId {
        let mut inner = self.lock();
        let id = inner.allocate();
        let file = FileHandle {
            id,
            container: self.container.clone(),
            file_id,
            size,
        };
        inner.handles.insert(id, Arc::new(Mutex::new(make(file))));
        debug!(handle = %id, open = inner.handles.len(), "handle opened");
        id
    }

    fn get(&self, id: HandleId) -> BlobsealResult<Arc<Mutex<Handle>>> {
        self.lock()
            .handles
            .get(&id)
            .cloned()
            .ok_or(BlobsealError::InvalidFileHandle(id))
    }

    /// Open `file_id` for reading.
    pub fn open_read(&self, file_id: &FileId, key: EncryptionKey) -> BlobsealResult<HandleId> {
        let descriptor = FileDescriptor::fetch(self.remote.as_ref(), file_id, key)?;
        let size = descriptor.plain_size;
        let reader = ChunkReader::open(self.remote.clone(), descriptor, &self.config)?;
        let reader = RangeReader::new(reader);
        Ok(self.insert(
            |file| Handle::Read(ReadHandle { file, reader, pos: 0 }),
            Some(file_id.clone()),
            size,
        ))
    }

    /// Start uploading a new file of exactly `size` bytes.
    pub fn create_write(
        &self,
        size: u64,
        key: EncryptionKey,
        key_id: impl Into<String>,
    ) -> BlobsealResult<HandleId> {
        let mut session =
            UploadSession::new(self.uploads.clone(), &self.config, key, key_id, size)?;
        session.create_request()?;
        let buffer = ChunkBuffer::with_declared_size(self.config.chunk_size as usize, size);
        Ok(self.insert(
            |file| {
                Handle::Write(WriteHandle {
                    file,
                    buffer,
                    session,
                })
            },
            None,
            size,
        ))
    }

    /// Open `file_id` for random-access writes.
    pub fn open_random_write(
        &self,
        file_id: &FileId,
        key: EncryptionKey,
    ) -> BlobsealResult<HandleId> {
        let descriptor = FileDescriptor::fetch(self.remote.as_ref(), file_id, key)?;
        let size = descriptor.plain_size;
        let engine = RandomWriteEngine::open(self.remote.clone(), descriptor, &self.config)?;
        Ok(self.insert(
            |file| Handle::RandomWrite(RandomWriteHandle { file, engine }),
            Some(file_id.clone()),
            size,
        ))
    }

    pub fn with_read<R>(
        &self,
        id: HandleId,
        f: impl FnOnce(&mut ReadHandle) -> BlobsealResult<R>,
    ) -> BlobsealResult<R> {
        let handle = self.get(id)?;
        let mut guard = handle.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *guard {
            Handle::Read(read) => f(read),
            _ => Err(BlobsealError::NotAReadHandle(id)),
        }
    }

    pub fn with_write<R>(
        &self,
        id: HandleId,
        f: impl FnOnce(&mut WriteHandle) -> BlobsealResult<R>,
    ) -> BlobsealResult<R> {
        let handle = self.get(id)?;
        let mut guard = handle.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *guard {
            Handle::Write(write) => f(write),
            _ => Err(BlobsealError::NotAWriteHandle(id)),
        }
    }

    pub fn with_random_write<R>(
        &self,
        id: HandleId,
        f: impl FnOnce(&mut RandomWriteHandle) -> BlobsealResult<R>,
    ) -> BlobsealResult<R> {
        let handle = self.get(id)?;
        let mut guard = handle.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *guard {
            Handle::RandomWrite(random) => f(random),
            _ => Err(BlobsealError::NotARandomWriteHandle(id)),
        }
    }

    /// Forget the handle and release its id for reuse.
    pub fn close(&self, id: HandleId) -> BlobsealResult<()> {
        let mut inner = self.lock();
        if inner.handles.remove(&id).is_none() {
            return Err(BlobsealError::InvalidFileHandle(id));
        }
        inner.free_ids.insert(id.0);
        debug!(handle = %id, open = inner.handles.len(), "handle closed");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.lock().handles.contains_key(&id)
    }
}
