//! Store layout and source I/O.

use crate::blob::{BlobReader, BlobStore};
use crate::error::{Error, Result};
use crate::hash::KeyHash;
use crate::import::ImportMap;
use crate::platform::Platform;
use crate::source::{Encoding, MAGIC, ResourceSource, Statement};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A resource source directory.
///
/// Layout:
/// - `sources/{prefix}/{uuid}` for statement logs
/// - `blobs/{uuid}/...` for blob payloads
/// - `import.map` for path to id mappings
///
/// Directories are created on first write; a store over a missing directory
/// reads as empty.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    blobs: BlobStore,
    imports: ImportMap,
}

impl Store {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            blobs: BlobStore::new(root.join("blobs")),
            imports: ImportMap::new(root.join("import.map")),
            root,
        }
    }

    /// Get the root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the blob store.
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Get the import map.
    pub fn import_map(&self) -> &ImportMap {
        &self.imports
    }

    /// Get the path to a source log given its id.
    ///
    /// Returns: `sources/{first two hex chars}/{uuid}`
    pub fn source_path(&self, id: Uuid) -> PathBuf {
        let name = id.hyphenated().to_string();
        self.root.join("sources").join(&name[..2]).join(name)
    }

    /// Load the log for a resource. Missing logs are empty.
    pub fn read_source(&self, id: Uuid) -> Result<ResourceSource> {
        ResourceSource::read(id, &self.source_path(id))
    }

    /// Load the log for a resource, keeping what parsed before any error.
    pub fn read_source_lenient(&self, id: Uuid) -> Result<(ResourceSource, Option<Error>)> {
        ResourceSource::read_lenient(id, &self.source_path(id))
    }

    /// Encoding of the persisted log, or None if there is none.
    pub fn source_encoding(&self, id: Uuid) -> Result<Option<Encoding>> {
        let file = match fs::File::open(self.source_path(id)) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut prefix = Vec::with_capacity(MAGIC.len());
        file.take(MAGIC.len() as u64).read_to_end(&mut prefix)?;
        if prefix.is_empty() {
            return Ok(None);
        }
        Ok(Some(Encoding::detect(&prefix)))
    }

    /// Persist a log, atomically replacing any previous version.
    pub fn write_source(&self, source: &ResourceSource, encoding: Encoding) -> Result<()> {
        source.write(&self.source_path(source.id()), encoding)
    }

    /// Resolve a blob property and open its content.
    ///
    /// Returns None if the property does not resolve to a blob or the blob is
    /// not stored.
    pub fn open_blob(
        &self,
        source: &ResourceSource,
        key: KeyHash,
        platform: Platform,
    ) -> Result<Option<BlobReader>> {
        match source.resolve_statement(key, platform) {
            Some(Statement::SetBlob {
                platform: tier,
                checksum,
                ..
            }) => self.blobs.open(source.id(), key, *tier, checksum),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Hash;
    use tempfile::TempDir;

    const ID: Uuid = Uuid::from_u128(0xabcdef);

    #[test]
    fn test_source_path() {
        let store = Store::new("/store");
        let path = store.source_path(ID);
        let name = ID.hyphenated().to_string();
        assert!(path.ends_with(format!("sources/{}/{}", &name[..2], name)));
    }

    #[test]
    fn test_missing_store_reads_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::new(temp_dir.path().join("absent"));

        let source = store.read_source(ID).unwrap();
        assert!(source.is_empty());
        assert_eq!(store.source_encoding(ID).unwrap(), None);
    }

    #[test]
    fn test_write_detects_encoding() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::new(temp_dir.path());
        let mut source = ResourceSource::new(ID);
        source
            .set(1, KeyHash::of("size"), Platform::GENERIC, "100")
            .unwrap();

        store.write_source(&source, Encoding::Binary).unwrap();
        assert_eq!(store.source_encoding(ID).unwrap(), Some(Encoding::Binary));
        assert_eq!(store.read_source(ID).unwrap(), source);

        store.write_source(&source, Encoding::Text).unwrap();
        assert_eq!(store.source_encoding(ID).unwrap(), Some(Encoding::Text));
        assert_eq!(store.read_source(ID).unwrap(), source);
    }

    #[test]
    fn test_corrupt_source_fails_closed() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::new(temp_dir.path());
        let path = store.source_path(ID);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            format!(
                "resource {}\n1 0000000000000000 UNSET 0000000000000001\nbroken\n",
                ID
            ),
        )
        .unwrap();

        assert!(matches!(store.read_source(ID), Err(Error::Parse { .. })));
        let (partial, err) = store.read_source_lenient(ID).unwrap();
        assert_eq!(partial.len(), 1);
        assert!(err.is_some());
    }

    #[test]
    fn test_open_blob_follows_fallback() {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::new(temp_dir.path());
        let key = KeyHash::of("texture");
        let windows = Platform::from_u64(1);
        let data = b"generic pixels";
        let checksum = Hash::hash_bytes(data);

        store
            .blobs()
            .write(ID, key, Platform::GENERIC, &checksum, data)
            .unwrap();
        let mut source = ResourceSource::new(ID);
        source
            .set_blob(1, key, Platform::GENERIC, checksum, data.len() as u64)
            .unwrap();

        let reader = store.open_blob(&source, key, windows).unwrap().unwrap();
        assert_eq!(reader.into_bytes(), data);

        source.set(2, key, windows, "inline").unwrap();
        assert!(store.open_blob(&source, key, windows).unwrap().is_none());
        assert!(
            store
                .open_blob(&source, KeyHash::of("missing"), windows)
                .unwrap()
                .is_none()
        );
    }
}
