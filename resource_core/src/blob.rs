//! Content-addressed blob storage.
//!
//! Blobs live under a slot per `(id, key, platform)`, one file per checksum:
//!
//! ```text
//! blobs/<uuid>/<key-hex16>.<platform-hex16>/<checksum-hex64>
//! ```
//!
//! Each file holds a 16-byte header followed by the payload:
//!
//! ```text
//! 0x00  4   "RBLB" magic
//! 0x04  1   version (u8) = 1
//! 0x05  1   algo: 1=blake3-256
//! 0x06  1   compression: 0=none, 1=zstd
//! 0x07  1   reserved (must be 0)
//! 0x08  8   payload_len (u64 LE) - stored size
//! 0x10  ... payload
//! ```

use crate::error::{Error, Result};
use crate::hash::{Algorithm, Hash, KeyHash};
use crate::platform::Platform;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Magic bytes at the start of every blob file.
pub const MAGIC: &[u8; 4] = b"RBLB";

/// Current blob format version.
pub const VERSION: u8 = 1;

/// Size of the blob header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Compression threshold: blobs >= 4KB are compressed.
const COMPRESSION_THRESHOLD: usize = 4096;

/// Compression types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    /// No compression.
    None = 0,
    /// Zstandard compression.
    Zstd = 1,
}

impl CompressionType {
    /// Parse from byte representation.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Zstd),
            _ => None,
        }
    }
}

/// A 16-byte blob header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHeader {
    pub algorithm: Algorithm,
    pub compression: CompressionType,
    /// Length of the stored payload (compressed size if compressed).
    pub payload_len: u64,
}

impl BlobHeader {
    /// Encode the header to bytes.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = VERSION;
        buf[5] = self.algorithm.id();
        buf[6] = self.compression as u8;
        buf[8..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    /// Decode a header from bytes.
    pub fn decode(buf: &[u8], path: &Path) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::corrupted_blob(
                path,
                format!("Header too short: {} bytes", buf.len()),
            ));
        }
        if &buf[0..4] != MAGIC {
            return Err(Error::corrupted_blob(path, "Invalid magic bytes"));
        }
        if buf[4] != VERSION {
            return Err(Error::corrupted_blob(
                path,
                format!("Unsupported version: {}", buf[4]),
            ));
        }
        let algorithm = Algorithm::from_id(buf[5])?;
        let compression = CompressionType::from_u8(buf[6]).ok_or_else(|| {
            Error::corrupted_blob(path, format!("Invalid compression type: {}", buf[6]))
        })?;
        if buf[7] != 0 {
            return Err(Error::corrupted_blob(path, "Reserved byte must be 0"));
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(&buf[8..16]);

        Ok(Self {
            algorithm,
            compression,
            payload_len: u64::from_le_bytes(len),
        })
    }
}

/// A blob as found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub key: KeyHash,
    pub platform: Platform,
    pub checksum: Hash,
    pub path: PathBuf,
}

/// Byte source over a verified blob.
#[derive(Debug)]
pub struct BlobReader {
    inner: Cursor<Vec<u8>>,
}

impl BlobReader {
    /// Size of the blob content in bytes.
    pub fn len(&self) -> u64 {
        self.inner.get_ref().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.inner.get_ref().is_empty()
    }

    /// Take the whole content.
    pub fn into_bytes(self) -> Vec<u8> {
        self.inner.into_inner()
    }
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Blob storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding all blobs of one resource.
    pub fn resource_dir(&self, id: Uuid) -> PathBuf {
        self.root.join(id.hyphenated().to_string())
    }

    /// Directory holding all revisions of one `(id, key, platform)` slot.
    pub fn slot_dir(&self, id: Uuid, key: KeyHash, platform: Platform) -> PathBuf {
        self.resource_dir(id)
            .join(format!("{}.{}", key.to_hex(), platform.to_hex()))
    }

    /// Path of one blob revision.
    pub fn blob_path(&self, id: Uuid, key: KeyHash, platform: Platform, checksum: &Hash) -> PathBuf {
        self.slot_dir(id, key, platform).join(checksum.to_hex())
    }

    /// Whether a revision is stored.
    pub fn contains(&self, id: Uuid, key: KeyHash, platform: Platform, checksum: &Hash) -> bool {
        self.blob_path(id, key, platform, checksum).is_file()
    }

    /// Store blob bytes under `checksum`.
    ///
    /// The checksum must be the hash of `bytes`. Writing a blob that is
    /// already stored is a no-op.
    pub fn write(
        &self,
        id: Uuid,
        key: KeyHash,
        platform: Platform,
        checksum: &Hash,
        bytes: &[u8],
    ) -> Result<()> {
        let computed = Hash::hash_bytes(bytes);
        if computed != *checksum {
            return Err(Error::checksum_mismatch(checksum.to_hex(), computed.to_hex()));
        }

        let path = self.blob_path(id, key, platform, checksum);
        if path.exists() {
            tracing::debug!(%id, %key, %platform, %checksum, "blob already stored");
            return Ok(());
        }

        let (payload, compression) = if bytes.len() >= COMPRESSION_THRESHOLD {
            (compress_zstd(bytes, &path)?, CompressionType::Zstd)
        } else {
            (bytes.to_vec(), CompressionType::None)
        };
        let header = BlobHeader {
            algorithm: Algorithm::Blake3,
            compression,
            payload_len: payload.len() as u64,
        };

        write_atomic(&path, &header, &payload)?;
        tracing::info!(
            %id,
            %key,
            %platform,
            %checksum,
            algorithm = header.algorithm.as_str(),
            size = bytes.len(),
            "stored blob"
        );
        Ok(())
    }

    /// Open a blob for reading, or None if it is not stored.
    ///
    /// Content is verified against `checksum` before it is returned.
    pub fn open(
        &self,
        id: Uuid,
        key: KeyHash,
        platform: Platform,
        checksum: &Hash,
    ) -> Result<Option<BlobReader>> {
        let path = self.blob_path(id, key, platform, checksum);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let header = BlobHeader::decode(&data, &path)?;
        let payload = &data[HEADER_SIZE..];
        if payload.len() as u64 != header.payload_len {
            return Err(Error::corrupted_blob(
                &path,
                format!(
                    "Payload length mismatch: expected {}, got {}",
                    header.payload_len,
                    payload.len()
                ),
            ));
        }

        let content = match header.compression {
            CompressionType::None => payload.to_vec(),
            CompressionType::Zstd => decompress_zstd(payload, &path)?,
        };

        let computed = Hash::hash_bytes(&content);
        if computed != *checksum {
            return Err(Error::corrupted_blob(
                &path,
                format!(
                    "Hash mismatch: expected {}, got {}",
                    checksum.to_hex(),
                    computed.to_hex()
                ),
            ));
        }

        Ok(Some(BlobReader {
            inner: Cursor::new(content),
        }))
    }

    /// Remove every revision stored in a slot.
    ///
    /// Returns the number of bytes freed.
    pub fn delete(&self, id: Uuid, key: KeyHash, platform: Platform) -> Result<u64> {
        let dir = self.slot_dir(id, key, platform);
        if !dir.exists() {
            return Ok(0);
        }
        let mut freed = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.path().is_file() {
                freed += entry.metadata()?.len();
            }
        }
        fs::remove_dir_all(&dir)?;
        let resource = self.resource_dir(id);
        if is_empty_dir(&resource) {
            let _ = fs::remove_dir(&resource);
        }
        tracing::info!(%id, %key, %platform, freed, "deleted blob slot");
        Ok(freed)
    }

    /// Remove one revision. Returns the number of bytes freed.
    ///
    /// Empty slot and resource directories are cleaned up.
    pub fn remove(&self, id: Uuid, key: KeyHash, platform: Platform, checksum: &Hash) -> Result<u64> {
        let path = self.blob_path(id, key, platform, checksum);
        let size = match fs::metadata(&path) {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        fs::remove_file(&path)?;

        let slot = self.slot_dir(id, key, platform);
        if is_empty_dir(&slot) {
            let _ = fs::remove_dir(&slot);
        }
        let resource = self.resource_dir(id);
        if is_empty_dir(&resource) {
            let _ = fs::remove_dir(&resource);
        }
        Ok(size)
    }

    /// List every blob stored for a resource.
    ///
    /// Files that do not follow the slot layout are skipped.
    pub fn list(&self, id: Uuid) -> Result<Vec<StoredBlob>> {
        let dir = self.resource_dir(id);
        let mut blobs = Vec::new();
        if !dir.exists() {
            return Ok(blobs);
        }

        for slot_entry in fs::read_dir(&dir)? {
            let slot_path = slot_entry?.path();
            if !slot_path.is_dir() {
                continue;
            }
            let Some((key, platform)) = slot_path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_slot_name)
            else {
                continue;
            };

            for blob_entry in fs::read_dir(&slot_path)? {
                let path = blob_entry?.path();
                if !path.is_file() {
                    continue;
                }
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if let Ok(checksum) = Hash::from_hex(name) {
                    blobs.push(StoredBlob {
                        key,
                        platform,
                        checksum,
                        path,
                    });
                }
            }
        }

        blobs.sort_by(|a, b| {
            (a.key, a.platform, a.checksum).cmp(&(b.key, b.platform, b.checksum))
        });
        Ok(blobs)
    }
}

fn parse_slot_name(name: &str) -> Option<(KeyHash, Platform)> {
    let (key, platform) = name.split_once('.')?;
    Some((
        KeyHash::from_hex(key).ok()?,
        Platform::from_hex(platform).ok()?,
    ))
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

/// Write a blob file atomically using tempfile.
fn write_atomic(path: &Path, header: &BlobHeader, payload: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::invalid_argument(format!("No parent for {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
    temp_file.write_all(&header.encode())?;
    temp_file.write_all(payload)?;
    temp_file.flush()?;
    temp_file.persist(path)?;
    Ok(())
}

/// Compress data using zstd.
fn compress_zstd(data: &[u8], path: &Path) -> Result<Vec<u8>> {
    zstd::encode_all(data, 3) // Level 3 = fast compression
        .map_err(|e| Error::corrupted_blob(path, format!("zstd compression failed: {}", e)))
}

/// Decompress data using zstd.
fn decompress_zstd(data: &[u8], path: &Path) -> Result<Vec<u8>> {
    zstd::decode_all(data)
        .map_err(|e| Error::corrupted_blob(path, format!("zstd decompression failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ID: Uuid = Uuid::from_u128(0xfeed);

    fn key() -> KeyHash {
        KeyHash::of("texture")
    }

    #[test]
    fn test_write_and_open() {
        let temp_dir = TempDir::new().unwrap();
        let blobs = BlobStore::new(temp_dir.path());

        let data = b"pixel data";
        let checksum = Hash::hash_bytes(data);
        blobs
            .write(ID, key(), Platform::GENERIC, &checksum, data)
            .unwrap();

        let mut reader = blobs
            .open(ID, key(), Platform::GENERIC, &checksum)
            .unwrap()
            .unwrap();
        assert_eq!(reader.len(), data.len() as u64);
        let mut content = Vec::new();
        reader.read_to_end(&mut content).unwrap();
        assert_eq!(content, data);
    }

    #[test]
    fn test_open_missing() {
        let temp_dir = TempDir::new().unwrap();
        let blobs = BlobStore::new(temp_dir.path());
        let checksum = Hash::hash_bytes(b"nothing");
        assert!(
            blobs
                .open(ID, key(), Platform::GENERIC, &checksum)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_write_rejects_checksum_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let blobs = BlobStore::new(temp_dir.path());
        let wrong = Hash::hash_bytes(b"other");

        let err = blobs
            .write(ID, key(), Platform::GENERIC, &wrong, b"data")
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert!(!blobs.blob_path(ID, key(), Platform::GENERIC, &wrong).exists());
    }

    #[test]
    fn test_write_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let blobs = BlobStore::new(temp_dir.path());
        let data = b"same bytes";
        let checksum = Hash::hash_bytes(data);

        blobs.write(ID, key(), Platform::GENERIC, &checksum, data).unwrap();
        let path = blobs.blob_path(ID, key(), Platform::GENERIC, &checksum);
        let first = fs::read(&path).unwrap();

        blobs.write(ID, key(), Platform::GENERIC, &checksum, data).unwrap();
        assert_eq!(fs::read(&path).unwrap(), first);
        assert_eq!(blobs.list(ID).unwrap().len(), 1);
    }

    #[test]
    fn test_large_blob_is_compressed() {
        let temp_dir = TempDir::new().unwrap();
        let blobs = BlobStore::new(temp_dir.path());
        let data = vec![0xAB; 64 * 1024];
        let checksum = Hash::hash_bytes(&data);

        blobs.write(ID, key(), Platform::GENERIC, &checksum, &data).unwrap();
        let path = blobs.blob_path(ID, key(), Platform::GENERIC, &checksum);
        let stored = fs::read(&path).unwrap();
        let header = BlobHeader::decode(&stored, &path).unwrap();
        assert_eq!(header.compression, CompressionType::Zstd);
        assert!(stored.len() < data.len());

        let reader = blobs
            .open(ID, key(), Platform::GENERIC, &checksum)
            .unwrap()
            .unwrap();
        assert_eq!(reader.into_bytes(), data);
    }

    #[test]
    fn test_corruption_detection() {
        let temp_dir = TempDir::new().unwrap();
        let blobs = BlobStore::new(temp_dir.path());
        let data = b"test";
        let checksum = Hash::hash_bytes(data);
        blobs.write(ID, key(), Platform::GENERIC, &checksum, data).unwrap();

        let path = blobs.blob_path(ID, key(), Platform::GENERIC, &checksum);
        let mut file_data = fs::read(&path).unwrap();
        file_data[HEADER_SIZE] ^= 0xFF;
        fs::write(&path, file_data).unwrap();

        let err = blobs
            .open(ID, key(), Platform::GENERIC, &checksum)
            .unwrap_err();
        assert!(matches!(err, Error::CorruptedBlob { .. }));
    }

    #[test]
    fn test_list_remove_delete() {
        let temp_dir = TempDir::new().unwrap();
        let blobs = BlobStore::new(temp_dir.path());
        let windows = Platform::from_u64(1);

        let a = Hash::hash_bytes(b"a");
        let b = Hash::hash_bytes(b"b");
        let c = Hash::hash_bytes(b"c");
        blobs.write(ID, key(), Platform::GENERIC, &a, b"a").unwrap();
        blobs.write(ID, key(), Platform::GENERIC, &b, b"b").unwrap();
        blobs.write(ID, key(), windows, &c, b"c").unwrap();
        // Stray file in the resource directory is ignored
        fs::write(blobs.resource_dir(ID).join("notes.txt"), b"x").unwrap();

        let listed = blobs.list(ID).unwrap();
        assert_eq!(listed.len(), 3);
        assert!(blobs.contains(ID, key(), windows, &c));
        assert!(!blobs.contains(ID, key(), windows, &a));
        assert!(listed.iter().any(|s| s.checksum == c && s.platform == windows));

        assert!(blobs.remove(ID, key(), Platform::GENERIC, &a).unwrap() > 0);
        assert_eq!(blobs.remove(ID, key(), Platform::GENERIC, &a).unwrap(), 0);
        assert_eq!(blobs.list(ID).unwrap().len(), 2);

        assert!(blobs.delete(ID, key(), windows).unwrap() > 0);
        assert!(!blobs.slot_dir(ID, key(), windows).exists());
        assert_eq!(blobs.list(ID).unwrap().len(), 1);
        assert_eq!(blobs.delete(ID, key(), windows).unwrap(), 0);

        // Deleting the last slot drops the resource directory
        fs::remove_file(blobs.resource_dir(ID).join("notes.txt")).unwrap();
        assert!(blobs.delete(ID, key(), Platform::GENERIC).unwrap() > 0);
        assert!(!blobs.resource_dir(ID).exists());
    }

    #[test]
    fn test_header_rejects_garbage() {
        let path = Path::new("blob");
        assert!(BlobHeader::decode(b"short", path).is_err());
        assert!(BlobHeader::decode(&[0u8; HEADER_SIZE], path).is_err());

        let header = BlobHeader {
            algorithm: Algorithm::Blake3,
            compression: CompressionType::None,
            payload_len: 5,
        };
        let mut encoded = header.encode();
        assert_eq!(BlobHeader::decode(&encoded, path).unwrap(), header);
        encoded[6] = 9;
        assert!(BlobHeader::decode(&encoded, path).is_err());
    }
}
