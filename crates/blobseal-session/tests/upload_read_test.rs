//! Integration test: upload → ranged read against the in-memory remote
//!
//! Files go through the real upload protocol (batched chunk sends plus a
//! commit carrying the checksum blob) and are read back through the slice
//! cache, so chunk framing, hash verification and clamping are all exercised.

mod common;

use std::sync::Arc;

use blobseal_core::{FileId, HASH_SIZE};
use blobseal_session::{ChunkReader, FileDescriptor, RangeReader, SyncParams};
use blobseal_storage::{FilePatch, MemoryRemote, Patch, RemoteBlobApi, WriteRequest};

use common::{kib_config, open_engine, pattern, small_config, test_key, upload};

fn open_reader(remote: &Arc<MemoryRemote>, file_id: &FileId) -> RangeReader {
    let descriptor =
        FileDescriptor::fetch(remote.as_ref(), file_id, test_key()).expect("fetch descriptor");
    RangeReader::new(ChunkReader::open(remote.clone(), descriptor, &kib_config()).expect("open"))
}

/// Overwrite raw stored bytes, as a misbehaving server or bit rot would.
fn tamper(
    remote: &MemoryRemote,
    file_id: &FileId,
    data: Option<(u64, u8)>,
    sum: Option<(u64, u8)>,
) {
    let stat = remote.stat(file_id).unwrap();
    let stored = remote.file_data(file_id).unwrap();
    let sums = remote.file_checksums(file_id).unwrap();
    let patch = FilePatch {
        data: match data {
            Some((pos, mask)) => Patch {
                pos,
                data: vec![stored[pos as usize] ^ mask],
                truncate: false,
            },
            None => Patch {
                pos: 0,
                data: vec![],
                truncate: false,
            },
        },
        checksums: match sum {
            Some((pos, mask)) => Patch {
                pos,
                data: vec![sums[pos as usize] ^ mask],
                truncate: false,
            },
            None => Patch {
                pos: 0,
                data: vec![],
                truncate: false,
            },
        },
    };
    remote
        .write(
            file_id,
            WriteRequest {
                version: stat.version,
                patches: &[patch],
                meta: &stat.meta,
                force: false,
            },
        )
        .unwrap();
}

#[test]
fn roundtrip_2500_bytes_in_three_chunks() {
    common::init_tracing();
    let remote = Arc::new(MemoryRemote::new());
    let original = pattern(2500);
    let id = upload(&remote, &kib_config(), &test_key(), &original);

    let stat = remote.stat(&id).unwrap();
    assert_eq!(stat.version, 1);
    assert_eq!(stat.meta.plain_size, 2500);
    assert_eq!(stat.meta.encrypted_size, 2 * 1088 + 512);
    assert_eq!(remote.file_data(&id).unwrap().len(), 2688);
    assert_eq!(remote.file_checksums(&id).unwrap().len(), 3 * HASH_SIZE);

    let mut reader = open_reader(&remote, &id);
    assert_eq!(reader.size(), 2500);
    assert_eq!(reader.read(0, 2500).unwrap(), original);
    assert_eq!(reader.read(1000, 100).unwrap(), &original[1000..1100]);
    assert_eq!(reader.read(2400, 1000).unwrap(), &original[2400..]);
    assert!(reader.read(2500, 10).unwrap().is_empty());
    assert!(reader.read(9000, 10).unwrap().is_empty());
}

#[test]
fn whole_file_fits_in_one_slice() {
    let remote = Arc::new(MemoryRemote::new());
    let original = pattern(2500);
    let id = upload(&remote, &kib_config(), &test_key(), &original);
    remote.reset_stats();

    let mut reader = open_reader(&remote, &id);
    for pos in (0..2500).step_by(100) {
        let at = pos as usize;
        assert_eq!(reader.read(pos, 100).unwrap(), &original[at..at + 100]);
    }
    assert_eq!(remote.stats().range_reads, 1);
    assert_eq!(remote.stats().checksum_reads, 1);
}

#[test]
fn reads_across_slices_fetch_each_slice_once() {
    // 16-byte chunks, two chunks (160 encrypted bytes) per slice
    let remote = Arc::new(MemoryRemote::new());
    let original = pattern(100);
    let id = upload(&remote, &small_config(), &test_key(), &original);
    remote.reset_stats();

    let descriptor = FileDescriptor::fetch(remote.as_ref(), &id, test_key()).unwrap();
    let mut reader =
        RangeReader::new(ChunkReader::open(remote.clone(), descriptor, &small_config()).unwrap());
    assert_eq!(reader.read(0, 100).unwrap(), original);
    // chunks 0-1, 2-3, 4-5, then the short final chunk on its own
    assert_eq!(remote.stats().range_reads, 4);
}

#[test]
fn zero_byte_file_roundtrip() {
    let remote = Arc::new(MemoryRemote::new());
    let id = upload(&remote, &kib_config(), &test_key(), &[]);

    let stat = remote.stat(&id).unwrap();
    assert_eq!(stat.meta.plain_size, 0);
    assert_eq!(stat.meta.encrypted_size, 0);
    assert!(remote.file_data(&id).unwrap().is_empty());
    assert!(remote.file_checksums(&id).unwrap().is_empty());

    let mut reader = open_reader(&remote, &id);
    assert_eq!(reader.size(), 0);
    assert!(reader.read(0, 100).unwrap().is_empty());
    assert_eq!(remote.stats().range_reads, 0);
}

#[test]
fn exact_multiple_of_chunk_size() {
    let remote = Arc::new(MemoryRemote::new());
    let original = pattern(2048);
    let id = upload(&remote, &kib_config(), &test_key(), &original);

    assert_eq!(remote.stat(&id).unwrap().meta.encrypted_size, 2 * 1088);
    let mut reader = open_reader(&remote, &id);
    assert_eq!(reader.read(0, u64::MAX).unwrap(), original);
}

#[test]
fn flipped_ciphertext_byte_is_detected() {
    let remote = Arc::new(MemoryRemote::new());
    let original = pattern(2500);
    let id = upload(&remote, &kib_config(), &test_key(), &original);
    // inside chunk 1's ciphertext
    tamper(&remote, &id, Some((1088 + 200, 0x01)), None);

    let mut reader = open_reader(&remote, &id);
    assert_eq!(reader.read(0, 1024).unwrap(), &original[..1024]);
    let err = reader.read(1024, 10).unwrap_err();
    assert!(err.is_integrity_failure(), "unexpected error: {err}");
}

#[test]
fn flipped_chunk_header_is_detected() {
    let remote = Arc::new(MemoryRemote::new());
    let id = upload(&remote, &kib_config(), &test_key(), &pattern(500));
    // first byte of chunk 0's HMAC
    tamper(&remote, &id, Some((0, 0x80)), None);

    let mut reader = open_reader(&remote, &id);
    let err = reader.read(0, 10).unwrap_err();
    assert!(err.is_integrity_failure(), "unexpected error: {err}");
}

#[test]
fn tampered_checksum_blob_fails_open() {
    let remote = Arc::new(MemoryRemote::new());
    let id = upload(&remote, &kib_config(), &test_key(), &pattern(2500));
    tamper(&remote, &id, None, Some((HASH_SIZE as u64 + 3, 0x10)));

    let descriptor = FileDescriptor::fetch(remote.as_ref(), &id, test_key()).unwrap();
    let Err(err) = ChunkReader::open(remote.clone(), descriptor, &kib_config()) else {
        panic!("a modified checksum blob must not open");
    };
    assert!(err.is_integrity_failure(), "unexpected error: {err}");
}

#[test]
fn wrong_key_fails_open() {
    let remote = Arc::new(MemoryRemote::new());
    let id = upload(&remote, &kib_config(), &test_key(), &pattern(300));

    let other = blobseal_crypto::EncryptionKey::from_bytes([7u8; 32]);
    let descriptor = FileDescriptor::fetch(remote.as_ref(), &id, other).unwrap();
    let Err(err) = ChunkReader::open(remote.clone(), descriptor, &kib_config()) else {
        panic!("the top hash must not verify under another key");
    };
    assert!(err.is_integrity_failure());
}

#[test]
fn stale_reader_resyncs_after_foreign_write() {
    let remote = Arc::new(MemoryRemote::new());
    let original = pattern(2500);
    let id = upload(&remote, &kib_config(), &test_key(), &original);
    let mut reader = open_reader(&remote, &id);

    let mut writer = open_engine(&remote, &kib_config(), &test_key(), &id);
    writer.write(10, b"changed", false).unwrap();

    let err = reader.read(0, 100).unwrap_err();
    assert!(err.is_version_conflict(), "unexpected error: {err}");

    reader
        .sync(SyncParams::fetch(remote.as_ref(), &id, test_key()).unwrap())
        .unwrap();
    let mut expected = original.clone();
    expected[10..17].copy_from_slice(b"changed");
    assert_eq!(reader.read(0, u64::MAX).unwrap(), expected);
}
