//! Row-frame v1 encoding and the content-addressed blob store contract used
//! by the snapshot chunk cache (spec §4.5, §6). Row frames are accumulated
//! into a single append-only byte buffer per table before being handed to
//! gzip + sha256 once (spec §9: "Arena+index for snapshot bundling... avoid
//! per-row allocations in the hot path").

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Mutex;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;
use sha2::{Digest, Sha256};

use crate::errors::{SyncError, SyncResult};

/// Accumulates row frames for one table's snapshot page into a single
/// buffer: `[4-byte little-endian length][json bytes]` repeated per row.
#[derive(Debug, Default)]
pub struct RowFrameBuilder {
    buf: Vec<u8>,
    row_count: usize,
}

impl RowFrameBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_row(&mut self, row_json: &serde_json::Value) -> SyncResult<()> {
        let bytes = serde_json::to_vec(row_json)?;
        self.buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(&bytes);
        self.row_count += 1;
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    /// Finish the frame: sha256 of the pre-compression bytes, then gzip.
    pub fn finish(self) -> SyncResult<EncodedChunk> {
        let sha256 = hex_sha256(&self.buf);
        let compressed = gzip(&self.buf)?;
        Ok(EncodedChunk {
            sha256,
            byte_length: compressed.len() as i64,
            body: compressed,
        })
    }
}

/// Decode a row-frame-v1 body (post-gunzip) back into individual row JSON values.
pub fn decode_row_frame(body: &[u8]) -> SyncResult<Vec<serde_json::Value>> {
    let mut rows = Vec::new();
    let mut offset = 0usize;
    while offset < body.len() {
        if offset + 4 > body.len() {
            return Err(SyncError::BlobStore("truncated row-frame length prefix".into()));
        }
        let len = u32::from_le_bytes(body[offset..offset + 4].try_into().unwrap()) as usize;
        offset += 4;
        if offset + len > body.len() {
            return Err(SyncError::BlobStore("truncated row-frame body".into()));
        }
        let row: serde_json::Value = serde_json::from_slice(&body[offset..offset + len])?;
        rows.push(row);
        offset += len;
    }
    Ok(rows)
}

pub struct EncodedChunk {
    pub sha256: String,
    pub byte_length: i64,
    pub body: Vec<u8>,
}

pub fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn gzip(bytes: &[u8]) -> SyncResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

pub fn gunzip(bytes: &[u8]) -> SyncResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// `blobHash = "sha256:" + sha256("encoding:compression:sha256")` (spec §4.5).
pub fn blob_hash(encoding: &str, compression: &str, sha256: &str) -> String {
    let preimage = format!("{encoding}:{compression}:{sha256}");
    format!("sha256:{}", hex_sha256(preimage.as_bytes()))
}

/// Pluggable body store for snapshot chunk bytes, injected into `AppState`
/// the way the teacher injects `auth: AuthState` / `monitoring: Option<MonitoringLayer>`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, blob_hash: &str) -> SyncResult<bool>;
    async fn put(&self, blob_hash: &str, body: &[u8]) -> SyncResult<()>;
    async fn get(&self, blob_hash: &str) -> SyncResult<Option<Vec<u8>>>;
    async fn delete(&self, blob_hash: &str) -> SyncResult<()>;
}

/// Default in-process blob store, suitable for tests and single-node
/// deployments. Production deployments inject an object-store-backed
/// implementation of [`BlobStore`] instead.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn exists(&self, blob_hash: &str) -> SyncResult<bool> {
        Ok(self.blobs.lock().unwrap().contains_key(blob_hash))
    }

    async fn put(&self, blob_hash: &str, body: &[u8]) -> SyncResult<()> {
        self.blobs
            .lock()
            .unwrap()
            .insert(blob_hash.to_string(), body.to_vec());
        Ok(())
    }

    async fn get(&self, blob_hash: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.blobs.lock().unwrap().get(blob_hash).cloned())
    }

    async fn delete(&self, blob_hash: &str) -> SyncResult<()> {
        self.blobs.lock().unwrap().remove(blob_hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_frame_round_trips() {
        let mut builder = RowFrameBuilder::new();
        builder.push_row(&serde_json::json!({"id": 1, "title": "a"})).unwrap();
        builder.push_row(&serde_json::json!({"id": 2, "title": "b"})).unwrap();
        assert_eq!(builder.row_count(), 2);

        let encoded = builder.finish().unwrap();
        let decompressed = gunzip(&encoded.body).unwrap();
        let rows = decode_row_frame(&decompressed).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["title"], "a");
        assert_eq!(rows[1]["id"], 2);
    }

    #[test]
    fn sha256_is_over_precompression_bytes() {
        let mut builder = RowFrameBuilder::new();
        builder.push_row(&serde_json::json!({"id": 1})).unwrap();
        let raw = {
            let mut b = Vec::new();
            let bytes = serde_json::to_vec(&serde_json::json!({"id": 1})).unwrap();
            b.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            b.extend_from_slice(&bytes);
            b
        };
        let expected_sha = hex_sha256(&raw);
        let encoded = builder.finish().unwrap();
        assert_eq!(encoded.sha256, expected_sha);
    }

    #[test]
    fn blob_hash_is_deterministic() {
        let a = blob_hash("row_frame_v1", "gzip", "abc");
        let b = blob_hash("row_frame_v1", "gzip", "abc");
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
    }

    #[tokio::test]
    async fn in_memory_blob_store_put_get_delete() {
        let store = InMemoryBlobStore::new();
        assert!(!store.exists("h1").await.unwrap());
        store.put("h1", b"hello").await.unwrap();
        assert!(store.exists("h1").await.unwrap());
        assert_eq!(store.get("h1").await.unwrap(), Some(b"hello".to_vec()));
        store.delete("h1").await.unwrap();
        assert!(!store.exists("h1").await.unwrap());
    }
}
